//! Keeps a realm's index in step with its files.

pub mod collaborators;
pub mod fs_reader;
pub mod ignore_rules;
pub mod indexer;
pub mod types_cache;

pub use collaborators::{
    BuiltCard, CardDefinition, CardDocument, CardEvaluator, CardResource, EvaluatorError,
    FieldDefinition, FieldKind, FileRef, ModuleSummary, Reader, ReaderError, RenderError,
    RenderFormat, Renderer,
};
pub use fs_reader::FsReader;
pub use ignore_rules::IgnoreRules;
pub use indexer::{
    FromScratchResult, IncrementalResult, IndexOperation, IndexRunner, RunnerError, Stats,
};
pub use types_cache::{TypeChain, TypesCache};
