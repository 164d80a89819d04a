//! Resolution of dotted field paths against card definitions.
//!
//! Field paths are validated before any SQL is built: each segment must be a
//! field of the type reached so far (own or inherited). Plural segments
//! (`containsMany`/`linksToMany`) change how the path is matched in the search
//! doc, so each resolved segment remembers its arity.

use std::collections::HashMap;
use std::sync::Arc;

use super::engine::QueryError;
use super::filter::{Filter, Query};
use crate::code_ref::CodeRef;
use crate::runner::collaborators::{CardDefinition, CardEvaluator, FieldDefinition, FieldKind};

/// Pseudo-field injected into every search doc at index time.
pub const CARD_TYPE_FIELD: &str = "_cardType";

const STRING_FIELD_MODULE: &str = "https://cardstack.com/base/string";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathSegment {
    pub name: String,
    pub plural: bool,
}

/// A validated field path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    pub segments: Vec<PathSegment>,
}

impl ResolvedPath {
    pub fn traveled_thru_plural(&self) -> bool {
        self.segments.iter().any(|s| s.plural)
    }

    pub fn leaf_is_plural(&self) -> bool {
        self.segments.last().is_some_and(|s| s.plural)
    }

    /// JSON path for `json_extract`, ignoring arity: `$.address.city`.
    pub fn json_path(&self) -> String {
        let mut path = String::from("$");
        for segment in &self.segments {
            push_key(&mut path, &segment.name);
        }
        path
    }

    /// JSON path of the first plural segment, the root for `json_tree`.
    pub fn plural_root(&self) -> String {
        let mut path = String::from("$");
        for segment in &self.segments {
            push_key(&mut path, &segment.name);
            if segment.plural {
                break;
            }
        }
        path
    }

    /// `LIKE` pattern over `json_tree` full keys: plural segments match any
    /// index. With `container`, a plural leaf matches the array itself.
    pub fn full_key_pattern(&self, container: bool) -> String {
        let mut pattern = String::from("$");
        let last = self.segments.len().saturating_sub(1);
        for (i, segment) in self.segments.iter().enumerate() {
            let mut key = String::new();
            push_key(&mut key, &segment.name);
            pattern.push_str(&escape_like(&key));
            if segment.plural && !(container && i == last) {
                pattern.push_str("[%]");
            }
        }
        pattern
    }
}

/// Append `.key`, quoting keys that are not plain identifiers the way SQLite
/// renders them in `json_tree` full keys.
fn push_key(path: &mut String, key: &str) {
    let plain = key.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
        && key.chars().all(|c| c.is_ascii_alphanumeric());
    if plain {
        path.push('.');
        path.push_str(key);
    } else {
        path.push_str(".\"");
        path.push_str(&key.replace('"', "\\\""));
        path.push('"');
    }
}

/// Escape `LIKE` wildcards; patterns are used with `ESCAPE '\'`.
fn escape_like(s: &str) -> String {
    let mut escaped = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Every path used by a query, keyed by `(type internal key, path)`.
#[derive(Debug, Default, Clone)]
pub struct ResolvedFields {
    paths: HashMap<(String, String), ResolvedPath>,
}

impl ResolvedFields {
    pub fn get(&self, on: &CodeRef, path: &str) -> Option<&ResolvedPath> {
        self.paths.get(&(on.internal_key(), path.to_string()))
    }

    pub(crate) fn insert(&mut self, on: &CodeRef, path: &str, resolved: ResolvedPath) {
        self.paths.insert((on.internal_key(), path.to_string()), resolved);
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

/// Collect the `(on, path)` pairs a query needs, in encounter order.
pub fn field_refs(query: &Query, base: &CodeRef) -> Vec<(CodeRef, String)> {
    let mut refs = Vec::new();
    if let Some(filter) = &query.filter {
        collect_filter_refs(filter, base, &mut refs);
    }
    for sort in &query.sort {
        if let Some(on) = &sort.on {
            refs.push((on.clone(), sort.by.clone()));
        }
    }
    refs
}

fn collect_filter_refs(filter: &Filter, inherited: &CodeRef, refs: &mut Vec<(CodeRef, String)>) {
    let on = filter.on().unwrap_or(inherited);
    match filter {
        Filter::Everything | Filter::Type(_) => {}
        Filter::Eq { fields, .. } | Filter::Contains { fields, .. } => {
            refs.extend(fields.keys().map(|k| (on.clone(), k.clone())));
        }
        Filter::Range { fields, .. } => {
            refs.extend(fields.keys().map(|k| (on.clone(), k.clone())));
        }
        Filter::Not { filter, .. } => collect_filter_refs(filter, on, refs),
        Filter::Every { filters, .. } | Filter::Any { filters, .. } => {
            for f in filters {
                collect_filter_refs(f, on, refs);
            }
        }
    }
}

/// Loads definitions through the card evaluator, caching them for the
/// lifetime of one search.
pub struct FieldResolver<'a> {
    evaluator: &'a dyn CardEvaluator,
    definitions: HashMap<CodeRef, Arc<CardDefinition>>,
}

impl<'a> FieldResolver<'a> {
    pub fn new(evaluator: &'a dyn CardEvaluator) -> Self {
        Self { evaluator, definitions: HashMap::new() }
    }

    /// Resolve every pair, failing on the first unknown type or field.
    pub async fn resolve_all(
        &mut self,
        refs: &[(CodeRef, String)],
    ) -> Result<ResolvedFields, QueryError> {
        let mut resolved = ResolvedFields::default();
        for (on, path) in refs {
            let key = (on.internal_key(), path.clone());
            if resolved.paths.contains_key(&key) {
                continue;
            }
            let value = self.resolve(on, path).await?;
            resolved.paths.insert(key, value);
        }
        Ok(resolved)
    }

    pub async fn resolve(&mut self, on: &CodeRef, path: &str) -> Result<ResolvedPath, QueryError> {
        let mut current = on.clone();
        let mut segments = Vec::new();

        for name in path.split('.') {
            let field = if name == CARD_TYPE_FIELD {
                FieldDefinition::new(FieldKind::Contains, CodeRef::new(STRING_FIELD_MODULE, "default"))
            } else {
                self.find_field(&current, name).await?
            };
            segments.push(PathSegment { name: name.to_string(), plural: field.kind.is_plural() });
            current = field.card;
        }
        Ok(ResolvedPath { segments })
    }

    /// Load a definition or fail with an unknown-type error.
    pub async fn definition(&mut self, code_ref: &CodeRef) -> Result<Arc<CardDefinition>, QueryError> {
        if let Some(def) = self.definitions.get(code_ref) {
            return Ok(Arc::clone(def));
        }
        let loaded = match self.evaluator.load_definition(code_ref).await {
            Ok(def) => def,
            Err(e) if e.status == 404 => {
                tracing::debug!(module = %code_ref.module, name = %code_ref.name, error = %e, "definition not found");
                None
            }
            Err(e) => return Err(QueryError::Evaluator(e.message)),
        };
        let def = Arc::new(loaded.ok_or_else(|| QueryError::UnknownType {
            module: code_ref.module.clone(),
            name: code_ref.name.clone(),
        })?);
        self.definitions.insert(code_ref.clone(), Arc::clone(&def));
        Ok(def)
    }

    /// Own or inherited field `name` of `on`.
    async fn find_field(&mut self, on: &CodeRef, name: &str) -> Result<FieldDefinition, QueryError> {
        let mut def = self.definition(on).await?;
        let mut seen = vec![def.code_ref.clone()];
        loop {
            if let Some(field) = def.fields.get(name) {
                return Ok(field.clone());
            }
            match &def.super_ref {
                Some(parent) if !seen.contains(parent) => {
                    seen.push(parent.clone());
                    def = self.definition(parent).await?;
                }
                _ => {
                    return Err(QueryError::UnknownField {
                        field: name.to_string(),
                        on: on.clone(),
                    });
                }
            }
        }
    }
}
