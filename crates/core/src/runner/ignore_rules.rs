//! Realm-relative ignore rules.
//!
//! Each directory of a realm may carry a `.gitignore`. A url is tested against
//! the rules of the closest directory that has any, with paths relative to
//! that directory. Rules do not cascade.

use std::collections::{BTreeMap, HashMap};

use ignore::gitignore::{Gitignore, GitignoreBuilder};

use crate::paths::RealmPaths;

pub const IGNORE_FILE: &str = ".gitignore";

/// Realm config file, never indexed.
const REALM_CONFIG: &str = ".realm.json";

#[derive(Debug)]
pub struct IgnoreRules {
    realm: RealmPaths,
    /// Directory url to compiled rules.
    rules: HashMap<String, Gitignore>,
    /// Directory url to raw `.gitignore` contents, handed back to callers.
    data: BTreeMap<String, String>,
}

impl IgnoreRules {
    pub fn new(realm: RealmPaths) -> Self {
        Self { realm, rules: HashMap::new(), data: BTreeMap::new() }
    }

    /// Rebuild rules from contents returned by an earlier run.
    pub fn from_data(realm: RealmPaths, data: BTreeMap<String, String>) -> Self {
        let mut rules = Self::new(realm);
        for (dir_url, contents) in data {
            rules.add(&dir_url, &contents);
        }
        rules
    }

    /// Whether rules for `dir_url` were already loaded.
    pub fn has(&self, dir_url: &str) -> bool {
        self.data.contains_key(dir_url)
    }

    /// Install the contents of the `.gitignore` in `dir_url`.
    pub fn add(&mut self, dir_url: &str, contents: &str) {
        let mut builder = GitignoreBuilder::new("");
        for line in contents.lines() {
            if let Err(e) = builder.add_line(None, line) {
                tracing::warn!(dir = dir_url, line, error = %e, "skipping invalid ignore pattern");
            }
        }
        match builder.build() {
            Ok(gitignore) => {
                self.rules.insert(dir_url.to_string(), gitignore);
                self.data.insert(dir_url.to_string(), contents.to_string());
            }
            Err(e) => tracing::warn!(dir = dir_url, error = %e, "failed to build ignore rules"),
        }
    }

    pub fn is_ignored(&self, url: &str) -> bool {
        let realm_url = self.realm.url();
        if url == realm_url {
            return false;
        }
        if url.strip_prefix(realm_url) == Some(REALM_CONFIG) {
            return true;
        }

        let Some((dir_url, gitignore)) = self
            .rules
            .iter()
            .filter(|(dir, _)| url.starts_with(dir.as_str()))
            .max_by_key(|(dir, _)| dir.len())
        else {
            return false;
        };
        let Some(relative) = url.strip_prefix(dir_url.as_str()) else {
            return false;
        };
        let is_dir = relative.ends_with('/');
        let relative = relative.trim_end_matches('/');
        if relative.is_empty() {
            return false;
        }
        gitignore.matched_path_or_any_parents(relative, is_dir).is_ignore()
    }

    pub fn data(&self) -> &BTreeMap<String, String> {
        &self.data
    }

    pub fn into_data(self) -> BTreeMap<String, String> {
        self.data
    }
}
