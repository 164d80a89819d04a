//! Versioned realm index.
//!
//! This module provides SQLite-based storage for:
//! - Index entries (instances, modules, stylesheets and errors) per realm generation
//! - The production version pointer of each realm
//! - Card type summaries recorded when a generation is committed
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! use realm_index_core::index::{GetEntryOptions, IndexDb, IndexWriter};
//!
//! let db = Arc::new(IndexDb::open(Path::new("index.db")).unwrap());
//! let writer = IndexWriter::new(Arc::clone(&db));
//!
//! let mut batch = writer.create_batch("http://localhost:4201/experiments/").unwrap();
//! batch.invalidate(&["http://localhost:4201/experiments/person.gts"]).unwrap();
//! batch.done().unwrap();
//!
//! let entry = db
//!     .get_instance("http://localhost:4201/experiments/Person/hassan", GetEntryOptions::default())
//!     .unwrap();
//! ```

pub mod db;
pub mod graph;
pub mod schema;
pub mod types;
pub mod writer;

pub use db::{IndexDb, IndexError};
pub use graph::DependencyGraph;
pub use schema::{SCHEMA_VERSION, SchemaError};
pub use types::{
    CardTypeSummary, EntryType, ErrorEntry, GetEntryOptions, IndexEntry, IndexedInstance,
    IndexedInstanceError, IndexedSource, InstanceEntry, InstanceOrError, ModifiedTime,
    ModifiedTimes, SerializedError, SourceEntry, SourceOrError,
};
pub use writer::{Batch, DEFAULT_CHUNK_SIZE, DoneResult, IndexWriter};
