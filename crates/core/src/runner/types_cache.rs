//! Memoized ancestor-type chains.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::OnceCell;

use super::collaborators::CardEvaluator;
use crate::code_ref::CodeRef;
use crate::index::SerializedError;

/// A type and its ancestors, most specific first, ending at the root type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeChain {
    pub code_refs: Vec<CodeRef>,
    pub display_names: Vec<String>,
}

impl TypeChain {
    /// Internal keys of the chain, as stored in `types`.
    pub fn keys(&self) -> Vec<String> {
        self.code_refs.iter().map(CodeRef::internal_key).collect()
    }
}

type ChainResult = Result<TypeChain, SerializedError>;

/// Type chains keyed by the code ref they were resolved for.
///
/// Concurrent lookups of the same type share one walk. Failures are cached
/// too; call [`TypesCache::clear`] after module code changes.
#[derive(Debug, Default)]
pub struct TypesCache {
    chains: Mutex<HashMap<String, Arc<OnceCell<ChainResult>>>>,
}

impl TypesCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_types(
        &self,
        evaluator: &dyn CardEvaluator,
        code_ref: &CodeRef,
    ) -> Result<TypeChain, SerializedError> {
        let cell = {
            let mut chains = self.chains.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(chains.entry(code_ref.internal_key()).or_default())
        };
        cell.get_or_init(|| walk(evaluator, code_ref)).await.clone()
    }

    pub fn clear(&self) {
        let mut chains = self.chains.lock().unwrap_or_else(PoisonError::into_inner);
        if !chains.is_empty() {
            tracing::debug!(entries = chains.len(), "clearing types cache");
        }
        chains.clear();
    }

    pub fn len(&self) -> usize {
        self.chains.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

async fn walk(evaluator: &dyn CardEvaluator, start: &CodeRef) -> ChainResult {
    let mut chain = TypeChain { code_refs: Vec::new(), display_names: Vec::new() };
    let mut current = start.clone();
    loop {
        let def = match evaluator.load_definition(&current).await {
            Ok(Some(def)) => def,
            Ok(None) => {
                let mut error = SerializedError::new(
                    format!("Unable to determine card types for {}", code_ref_json(start)),
                    500,
                );
                error.add_deps([current.module.clone()]);
                return Err(error);
            }
            Err(e) => {
                let mut error = SerializedError::from(e);
                error.add_deps([current.module.clone()]);
                return Err(error);
            }
        };
        chain.code_refs.push(def.code_ref.clone());
        chain.display_names.push(def.display_name.clone());
        match def.super_ref {
            Some(parent) if !chain.code_refs.contains(&parent) => current = parent,
            _ => return Ok(chain),
        }
    }
}

fn code_ref_json(code_ref: &CodeRef) -> String {
    serde_json::to_string(code_ref).unwrap_or_else(|_| code_ref.to_string())
}
