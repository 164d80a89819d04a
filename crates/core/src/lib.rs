#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]

//! Versioned index of realm content.
//!
//! - [`index`]: the index store and its batch writer
//! - [`query`]: filter, sort and paginate indexed instances
//! - [`runner`]: the orchestrator that keeps the index in step with a realm

pub mod code_ref;
pub mod config;
pub mod index;
pub mod paths;
pub mod query;
pub mod runner;

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
