//! References to card type definitions.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::paths::{canonical_url, trim_executable_extension};

/// A `(module, name)` reference to an exported card or field definition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CodeRef {
    pub module: String,
    pub name: String,
}

impl CodeRef {
    pub fn new(module: impl Into<String>, name: impl Into<String>) -> Self {
        Self { module: module.into(), name: name.into() }
    }

    /// Resolve a possibly relative module specifier against `relative_to`.
    pub fn resolve(&self, relative_to: Option<&str>) -> Self {
        Self { module: canonical_url(&self.module, relative_to), name: self.name.clone() }
    }

    /// Canonical string form used for storage and comparison.
    pub fn internal_key(&self) -> String {
        internal_key_for(self, None)
    }

    /// Inverse of [`CodeRef::internal_key`]: the name follows the last `/`.
    pub fn from_internal_key(key: &str) -> Option<Self> {
        let idx = key.rfind('/')?;
        let (module, name) = (&key[..idx], &key[idx + 1..]);
        if module.is_empty() || name.is_empty() {
            return None;
        }
        Some(Self::new(module, name))
    }
}

impl fmt::Display for CodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name == "default" {
            write!(f, "import default from \"{}\"", self.module)
        } else {
            write!(f, "import {{ {} }} from \"{}\"", self.name, self.module)
        }
    }
}

/// `<module without executable extension>/<name>`, with the module resolved
/// against `relative_to` when it is relative.
pub fn internal_key_for(code_ref: &CodeRef, relative_to: Option<&str>) -> String {
    let module = canonical_url(&code_ref.module, relative_to);
    format!("{}/{}", trim_executable_extension(&module), code_ref.name)
}
