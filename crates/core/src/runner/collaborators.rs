//! Contracts for the capabilities the index relies on but does not own.
//!
//! The reader, card evaluator and renderer are supplied by the host. They are
//! object-safe so a runner can hold them as `Arc<dyn Trait>`.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::code_ref::CodeRef;
use crate::index::SerializedError;

// ─────────────────────────────────────────────────────────────────────────────
// Reader
// ─────────────────────────────────────────────────────────────────────────────

/// Contents and timestamps of a realm file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRef {
    pub content: String,
    /// Unix seconds.
    pub last_modified: i64,
    /// Unix seconds.
    pub created: i64,
}

#[derive(Debug, Error)]
pub enum ReaderError {
    #[error("failed to read {url}: {source}")]
    Io {
        url: String,
        #[source]
        source: std::io::Error,
    },

    #[error("realm root does not exist: {0}")]
    MissingRoot(String),

    #[error("{0}")]
    Other(String),
}

/// Read access to the files of one realm, addressed by absolute url.
#[async_trait]
pub trait Reader: Send + Sync {
    /// Modification time (unix seconds) of every file in the realm.
    async fn mtimes(&self) -> Result<BTreeMap<String, i64>, ReaderError>;

    /// Read a file, `None` if it does not exist.
    async fn read_file(&self, url: &str) -> Result<Option<FileRef>, ReaderError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Card evaluator
// ─────────────────────────────────────────────────────────────────────────────

/// Failure reported by the card evaluator.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct EvaluatorError {
    pub message: String,
    pub status: u16,
    /// Modules involved in the failure; a fix to any of them is worth a retry.
    pub deps: Vec<String>,
}

impl EvaluatorError {
    pub fn new(message: impl Into<String>, status: u16) -> Self {
        Self { message: message.into(), status, deps: Vec::new() }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(message, 404)
    }

    pub fn with_deps<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.deps.extend(deps.into_iter().map(Into::into));
        self
    }
}

impl From<EvaluatorError> for SerializedError {
    fn from(err: EvaluatorError) -> Self {
        let mut serialized = SerializedError::new(err.message, err.status);
        serialized.add_deps(err.deps);
        serialized
    }
}

/// What importing a module told us about it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleSummary {
    /// Modules this module imported, directly or transitively.
    pub consumed_modules: Vec<String>,
    /// Host-provided modules are not indexed.
    pub is_shimmed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FieldKind {
    Contains,
    ContainsMany,
    LinksTo,
    LinksToMany,
}

impl FieldKind {
    pub fn is_plural(self) -> bool {
        matches!(self, Self::ContainsMany | Self::LinksToMany)
    }
}

/// A field declared directly on a card or field definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDefinition {
    pub kind: FieldKind,
    /// Type of the field's value.
    pub card: CodeRef,
}

impl FieldDefinition {
    pub fn new(kind: FieldKind, card: CodeRef) -> Self {
        Self { kind, card }
    }
}

/// A loaded card or field type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardDefinition {
    pub code_ref: CodeRef,
    pub display_name: String,
    /// Parent type; `None` for the root.
    pub super_ref: Option<CodeRef>,
    /// Own fields only; inherited ones live on the ancestors.
    pub fields: BTreeMap<String, FieldDefinition>,
}

/// Output of instantiating a card from its resource.
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltCard {
    /// Serialized resource as the card runtime sees it.
    pub serialized: Value,
    pub search_doc: Value,
    /// Modules and linked instances the card consumed while loading.
    pub deps: Vec<String>,
    /// Most specific type of the card.
    pub card_type: CodeRef,
}

#[async_trait]
pub trait CardEvaluator: Send + Sync {
    async fn import_module(&self, url: &str) -> Result<ModuleSummary, EvaluatorError>;

    /// Load a type definition, `None` when the module has no such export.
    async fn load_definition(
        &self,
        code_ref: &CodeRef,
    ) -> Result<Option<CardDefinition>, EvaluatorError>;

    async fn build_card(
        &self,
        resource: &CardResource,
        instance_url: &str,
    ) -> Result<BuiltCard, EvaluatorError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Renderer
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderFormat {
    Isolated,
    Atom,
    Embedded,
    Fitted,
}

impl fmt::Display for RenderFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Isolated => "isolated",
            Self::Atom => "atom",
            Self::Embedded => "embedded",
            Self::Fitted => "fitted",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenderError {
    #[error("render timeout: {format} render took longer than {}ms", .timeout.as_millis())]
    Timeout { format: RenderFormat, timeout: Duration },

    #[error("{0}")]
    Failed(String),
}

#[async_trait]
pub trait Renderer: Send + Sync {
    /// Render `card` in `format`, optionally as one of its ancestor types.
    async fn render(
        &self,
        card: &BuiltCard,
        format: RenderFormat,
        as_type: Option<&CodeRef>,
    ) -> Result<String, RenderError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Card documents
// ─────────────────────────────────────────────────────────────────────────────

/// JSON document stored in a realm's `.json` files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CardDocument {
    pub data: CardResource,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CardResource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub resource_type: String,
    #[serde(default)]
    pub attributes: Value,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub relationships: Value,
    pub meta: ResourceMeta,
}

impl CardResource {
    pub fn is_card(&self) -> bool {
        self.resource_type == "card"
    }

    /// Every type reference in the resource: its own adopts-from and any
    /// polymorphic field overrides, resolved against `relative_to`.
    pub fn adopts_from_refs(&self, relative_to: &str) -> Vec<CodeRef> {
        let mut refs = vec![self.meta.adopts_from.resolve(Some(relative_to))];
        for field in self.meta.fields.values() {
            field.collect_refs(relative_to, &mut refs);
        }
        refs
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceMeta {
    pub adopts_from: CodeRef,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, FieldMeta>,
}

/// Per-field metadata; plural fields carry one entry per element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldMeta {
    Many(Vec<FieldOverride>),
    Single(FieldOverride),
}

impl FieldMeta {
    fn collect_refs(&self, relative_to: &str, refs: &mut Vec<CodeRef>) {
        match self {
            Self::Single(o) => o.collect_refs(relative_to, refs),
            Self::Many(items) => {
                for o in items {
                    o.collect_refs(relative_to, refs);
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adopts_from: Option<CodeRef>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, FieldMeta>,
}

impl FieldOverride {
    fn collect_refs(&self, relative_to: &str, refs: &mut Vec<CodeRef>) {
        if let Some(adopts_from) = &self.adopts_from {
            let resolved = adopts_from.resolve(Some(relative_to));
            if !refs.contains(&resolved) {
                refs.push(resolved);
            }
        }
        for field in self.fields.values() {
            field.collect_refs(relative_to, refs);
        }
    }
}
