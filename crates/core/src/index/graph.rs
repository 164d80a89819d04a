//! Reverse dependency index used to compute invalidation closures.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use rusqlite::{Connection, params};

use super::db::{ALIVE, IndexError, generation_bound, json_column, latest_row_condition};
use crate::paths::file_alias;

/// Maps a resource (by its extension-trimmed alias) to the urls of the
/// entries that list it as a dependency.
#[derive(Debug, Default, Clone)]
pub struct DependencyGraph {
    dependents: HashMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    /// Build the graph from the newest committed rows of a realm, overlaid
    /// with the rows of generation `max_version`. Tombstones only count when written at `max_version`
    /// itself, so entries already invalidated by the current batch still
    /// propagate. Stylesheets never depend on anything and are skipped.
    pub fn load(conn: &Connection, realm_url: &str, max_version: i64) -> Result<Self, IndexError> {
        let sql = format!(
            "SELECT i.url, i.deps FROM index_entries i
             WHERE i.realm_url = ?1 AND i.type != 'css'
               AND ({ALIVE} OR i.realm_version = ?2) AND {}",
            latest_row_condition(&generation_bound("?2"))
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![realm_url, max_version], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut graph = Self::default();
        for (url, deps) in rows {
            let deps: Vec<String> = json_column(&deps)?.unwrap_or_default();
            graph.add_entry(&url, deps);
        }
        tracing::debug!(
            realm = realm_url,
            version = max_version,
            nodes = graph.dependents.len(),
            "loaded dependency graph"
        );
        Ok(graph)
    }

    /// Record that `url` depends on each of `deps`.
    pub fn add_entry<I, S>(&mut self, url: &str, deps: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for dep in deps {
            self.dependents
                .entry(file_alias(dep.as_ref()))
                .or_default()
                .insert(url.to_string());
        }
    }

    /// Entries that directly depend on `url`, matched by url or alias.
    pub fn direct_dependents(&self, url: &str) -> impl Iterator<Item = &str> {
        self.dependents.get(&file_alias(url)).into_iter().flatten().map(String::as_str)
    }

    /// Seeds followed by everything that transitively depends on them, in
    /// breadth-first discovery order. Cycles terminate via the visited set.
    pub fn closure<S: AsRef<str>>(&self, seeds: &[S]) -> Vec<String> {
        let mut visited: HashSet<String> = HashSet::new();
        let mut order = Vec::new();
        let mut queue: VecDeque<String> = VecDeque::new();

        for seed in seeds {
            let seed = seed.as_ref().to_string();
            if visited.insert(seed.clone()) {
                queue.push_back(seed);
            }
        }

        while let Some(url) = queue.pop_front() {
            for dependent in self.direct_dependents(&url) {
                if visited.insert(dependent.to_string()) {
                    queue.push_back(dependent.to_string());
                }
            }
            order.push(url);
        }
        order
    }
}
