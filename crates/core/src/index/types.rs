//! Index data types for realm entries.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of resource an index row describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    /// A card instance (`.json` document).
    Instance,
    /// An executable card-definition module.
    Module,
    /// A stylesheet.
    Css,
    /// A resource that failed to index.
    Error,
}

impl EntryType {
    /// Convert to database string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Instance => "instance",
            Self::Module => "module",
            Self::Css => "css",
            Self::Error => "error",
        }
    }
}

impl FromStr for EntryType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "instance" => Ok(Self::Instance),
            "module" => Ok(Self::Module),
            "css" => Ok(Self::Css),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown entry type '{other}'")),
        }
    }
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured error recorded in place of a resource that failed to index.
///
/// `deps` lists every dependency discovered before the failure so that a fix
/// to any of them re-triggers indexing of the failed resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedError {
    pub message: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub deps: Vec<String>,
    #[serde(default)]
    pub additional_errors: Vec<SerializedError>,
}

impl SerializedError {
    pub fn new(message: impl Into<String>, status: u16) -> Self {
        Self {
            message: message.into(),
            status,
            id: None,
            deps: Vec::new(),
            additional_errors: Vec::new(),
        }
    }

    /// Add dependencies, keeping the list free of duplicates.
    pub fn add_deps<I, S>(&mut self, deps: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for dep in deps {
            let dep = dep.into();
            if !self.deps.contains(&dep) {
                self.deps.push(dep);
            }
        }
    }
}

/// A successfully indexed card instance, as written by a batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstanceEntry {
    /// Serialized card resource (`data` of the card document).
    pub resource: Value,
    /// Original JSON text of the document.
    pub source: String,
    /// Flattened, queryable projection of field values.
    pub search_doc: Value,
    pub deps: BTreeSet<String>,
    /// Ancestor type keys, most-derived first.
    pub types: Vec<String>,
    /// Display names parallel to `types`.
    pub display_names: Vec<String>,
    pub isolated_html: Option<String>,
    pub atom_html: Option<String>,
    /// Embedded HTML keyed by the type key it was rendered as.
    pub embedded_html: Option<BTreeMap<String, String>>,
    /// Fitted HTML keyed by the type key it was rendered as.
    pub fitted_html: Option<BTreeMap<String, String>>,
    pub last_modified: i64,
    pub resource_created_at: i64,
}

/// Module or stylesheet source entry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceEntry {
    pub source: String,
    pub deps: BTreeSet<String>,
    pub last_modified: i64,
    pub resource_created_at: i64,
}

/// Best-effort partial result for a resource that failed to index.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorEntry {
    pub error: SerializedError,
    pub search_doc: Option<Value>,
    pub types: Option<Vec<String>>,
    pub display_names: Option<Vec<String>>,
    pub last_modified: Option<i64>,
    pub resource_created_at: Option<i64>,
}

impl ErrorEntry {
    pub fn new(error: SerializedError) -> Self {
        Self {
            error,
            search_doc: None,
            types: None,
            display_names: None,
            last_modified: None,
            resource_created_at: None,
        }
    }
}

/// Payload written by [`crate::index::Batch::update_entry`].
#[derive(Debug, Clone, PartialEq)]
pub enum IndexEntry {
    Instance(InstanceEntry),
    Module(SourceEntry),
    Css(SourceEntry),
    Error(ErrorEntry),
}

impl IndexEntry {
    pub fn entry_type(&self) -> EntryType {
        match self {
            Self::Instance(_) => EntryType::Instance,
            Self::Module(_) => EntryType::Module,
            Self::Css(_) => EntryType::Css,
            Self::Error(_) => EntryType::Error,
        }
    }
}

/// An instance read back from the index.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedInstance {
    pub canonical_url: String,
    pub realm_url: String,
    pub realm_version: i64,
    pub instance: Value,
    pub source: String,
    pub search_doc: Option<Value>,
    pub types: Vec<String>,
    pub display_names: Vec<String>,
    pub deps: Vec<String>,
    pub isolated_html: Option<String>,
    pub atom_html: Option<String>,
    pub embedded_html: Option<BTreeMap<String, String>>,
    pub fitted_html: Option<BTreeMap<String, String>>,
    pub last_modified: Option<i64>,
    pub resource_created_at: Option<i64>,
    pub indexed_at: Option<i64>,
}

/// An instance that failed to index, with whatever partial data survived.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedInstanceError {
    pub canonical_url: String,
    pub realm_url: String,
    pub realm_version: i64,
    pub error: SerializedError,
    pub instance: Option<Value>,
    pub source: Option<String>,
    pub search_doc: Option<Value>,
    pub types: Vec<String>,
    pub deps: Vec<String>,
    pub last_modified: Option<i64>,
    pub resource_created_at: Option<i64>,
    pub indexed_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InstanceOrError {
    Instance(IndexedInstance),
    Error(IndexedInstanceError),
}

/// A module or stylesheet read back from the index.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedSource {
    pub canonical_url: String,
    pub realm_version: i64,
    pub source: String,
    pub deps: Vec<String>,
    pub last_modified: Option<i64>,
    pub resource_created_at: Option<i64>,
    pub indexed_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SourceOrError {
    Source(IndexedSource),
    Error { canonical_url: String, error: SerializedError },
}

/// Modification time snapshot of a production entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModifiedTime {
    pub last_modified: Option<i64>,
    pub entry_type: EntryType,
}

pub type ModifiedTimes = BTreeMap<String, ModifiedTime>;

/// One group of the realm meta summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardTypeSummary {
    pub code_ref: String,
    pub display_name: Option<String>,
    pub total: i64,
}

/// Read options shared by the entry getters.
#[derive(Debug, Clone, Copy, Default)]
pub struct GetEntryOptions {
    /// Read the newest existing version, including uncommitted WIP rows.
    pub use_work_in_progress_index: bool,
}

impl GetEntryOptions {
    pub fn work_in_progress() -> Self {
        Self { use_work_in_progress_index: true }
    }
}
