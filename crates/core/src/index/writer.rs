//! Batch writer: one realm, one work-in-progress generation.
//!
//! A batch claims the version after both the production pointer and any
//! rows already written, so generations abandoned by failed batches are
//! skipped rather than reused. `invalidate` and `make_new_generation` check
//! for a competing writer at the claimed version. Committing a batch drops
//! the skipped generations below it.

use std::collections::HashSet;
use std::sync::Arc;

use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, TransactionBehavior, params, params_from_iter};
use serde::Serialize;

use super::db::{
    ALIVE, IndexDb, IndexError, current_version, generation_bound, get_modified_times,
    latest_row_condition, latest_version,
};
use super::graph::DependencyGraph;
use super::types::{CardTypeSummary, EntryType, IndexEntry, ModifiedTimes};
use crate::config::IndexingConfig;
use crate::paths::{RealmPaths, canonical_url, file_alias, has_executable_extension, is_css, is_json};

/// Bind parameters per bulk statement.
pub const DEFAULT_CHUNK_SIZE: usize = 500;

/// Columns copied when a row is carried forward as a tombstone.
const COPY_COLUMNS: &str = "url, file_alias, realm_url, realm_version, type, pristine_doc, \
     source, search_doc, deps, types, display_names, isolated_html, atom_html, embedded_html, \
     fitted_html, error_doc, last_modified, resource_created_at, indexed_at, is_deleted";

/// Result of committing a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DoneResult {
    /// Alive entries in the realm's new production version.
    pub total_index_entries: i64,
}

/// Factory for batches over a shared index database.
#[derive(Clone)]
pub struct IndexWriter {
    db: Arc<IndexDb>,
    chunk_size: usize,
}

impl IndexWriter {
    pub fn new(db: Arc<IndexDb>) -> Self {
        Self { db, chunk_size: DEFAULT_CHUNK_SIZE }
    }

    /// Writer using the configured invalidation chunk size.
    pub fn from_config(db: Arc<IndexDb>, config: &IndexingConfig) -> Self {
        Self::new(db).with_chunk_size(config.invalidation_chunk_size)
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn db(&self) -> &Arc<IndexDb> {
        &self.db
    }

    /// Open a batch for the realm on a version no other row uses yet.
    pub fn create_batch(&self, realm_url: &str) -> Result<Batch, IndexError> {
        let realm = RealmPaths::new(realm_url)
            .map_err(|e| IndexError::InvalidData(format!("invalid realm url {realm_url}: {e}")))?;
        let conn = self.db.connection()?;
        let current = current_version(&conn, realm.url())?.unwrap_or(0);
        let latest = latest_version(&conn, realm.url())?.unwrap_or(0);
        drop(conn);
        let realm_version = current.max(latest) + 1;
        if latest > current {
            tracing::debug!(
                realm = realm.url(),
                current,
                latest,
                "skipping uncommitted generations"
            );
        }

        tracing::debug!(realm = realm.url(), version = realm_version, "created batch");
        Ok(Batch {
            db: Arc::clone(&self.db),
            realm,
            realm_version,
            touched: HashSet::new(),
            invalidations: Vec::new(),
            invalidated: HashSet::new(),
            chunk_size: self.chunk_size,
        })
    }
}

/// An in-progress write of one realm generation.
///
/// Dropping a batch without calling [`Batch::done`] leaves its WIP rows in
/// place; production reads never see them.
pub struct Batch {
    db: Arc<IndexDb>,
    realm: RealmPaths,
    realm_version: i64,
    /// Urls with a row at `realm_version` written by this batch.
    touched: HashSet<String>,
    invalidations: Vec<String>,
    invalidated: HashSet<String>,
    chunk_size: usize,
}

impl Batch {
    pub fn realm_url(&self) -> &str {
        self.realm.url()
    }

    /// The WIP version this batch writes.
    pub fn realm_version(&self) -> i64 {
        self.realm_version
    }

    /// Every url invalidated by this batch so far, in invalidation order.
    pub fn invalidations(&self) -> &[String] {
        &self.invalidations
    }

    /// Production modification times of the batch's realm.
    pub fn get_modified_times(&self) -> Result<ModifiedTimes, IndexError> {
        let conn = self.db.connection()?;
        get_modified_times(&conn, self.realm.url())
    }

    /// Tombstone `urls` and everything that transitively depends on them.
    ///
    /// Returns the invalidated urls, seeds first. Urls outside the realm are
    /// dropped. Non-indexable urls without a row are returned but get none.
    pub fn invalidate<S: AsRef<str>>(&mut self, urls: &[S]) -> Result<Vec<String>, IndexError> {
        let seeds: Vec<String> = urls
            .iter()
            .map(|u| canonical_url(u.as_ref(), None))
            .filter(|u| {
                let keep = self.realm.in_realm(u);
                if !keep {
                    tracing::debug!(url = %u, realm = self.realm.url(), "skipping cross-realm invalidation");
                }
                keep
            })
            .collect();
        if seeds.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.db.connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        self.check_conflict(&tx)?;

        let graph = DependencyGraph::load(&tx, self.realm.url(), self.realm_version)?;
        let closure = graph.closure(&seeds);

        for chunk in closure.chunks(self.chunk_size) {
            self.tombstone_chunk(&tx, chunk)?;
        }
        self.touched = urls_at_version(&tx, self.realm.url(), self.realm_version)?;

        for url in &closure {
            if self.touched.contains(url) {
                continue;
            }
            let fresh = if is_json(url) {
                Some(EntryType::Instance)
            } else if has_executable_extension(url) {
                Some(EntryType::Module)
            } else {
                None
            };
            if let Some(entry_type) = fresh {
                insert_tombstone(&tx, self.realm.url(), self.realm_version, url, entry_type)?;
                self.touched.insert(url.clone());
            }
        }
        tx.commit()?;
        drop(conn);

        self.record_invalidations(&closure);
        tracing::debug!(
            realm = self.realm.url(),
            version = self.realm_version,
            seeds = seeds.len(),
            invalidated = closure.len(),
            "invalidated entries"
        );
        Ok(closure)
    }

    /// Tombstone every alive entry of the realm into this batch's version.
    pub fn make_new_generation(&mut self) -> Result<Vec<String>, IndexError> {
        let mut conn = self.db.connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        self.check_conflict(&tx)?;

        let sql = format!(
            "INSERT INTO index_entries ({COPY_COLUMNS})
             SELECT i.url, i.file_alias, i.realm_url, ?2, i.type, i.pristine_doc, i.source,
                    i.search_doc, i.deps, i.types, i.display_names, i.isolated_html,
                    i.atom_html, i.embedded_html, i.fitted_html, i.error_doc,
                    i.last_modified, i.resource_created_at, NULL, 1
             FROM index_entries i
             WHERE i.realm_url = ?1 AND i.realm_version < ?2 AND {ALIVE} AND {}",
            latest_row_condition(&generation_bound("?2"))
        );
        let count = tx.execute(&sql, params![self.realm.url(), self.realm_version])?;
        self.touched = urls_at_version(&tx, self.realm.url(), self.realm_version)?;
        tx.commit()?;
        drop(conn);

        let mut urls: Vec<String> = self.touched.iter().cloned().collect();
        urls.sort();
        self.record_invalidations(&urls);
        tracing::debug!(
            realm = self.realm.url(),
            version = self.realm_version,
            count,
            "started new generation"
        );
        Ok(urls)
    }

    /// Write a full entry at the WIP version, replacing any tombstone.
    pub fn update_entry(&mut self, url: &str, entry: &IndexEntry) -> Result<(), IndexError> {
        let url = canonical_url(url, None);
        if !self.realm.in_realm(&url) {
            tracing::debug!(%url, realm = self.realm.url(), "ignoring update outside realm");
            return Ok(());
        }

        let row = EntryRow::from_entry(entry)?;
        let conn = self.db.connection()?;
        self.check_superseded(&conn)?;
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO index_entries ({COPY_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                         ?16, ?17, ?18, ?19, 0)"
            ),
            params![
                url,
                file_alias(&url),
                self.realm.url(),
                self.realm_version,
                entry.entry_type().as_str(),
                row.pristine_doc,
                row.source,
                row.search_doc,
                row.deps,
                row.types,
                row.display_names,
                row.isolated_html,
                row.atom_html,
                row.embedded_html,
                row.fitted_html,
                row.error_doc,
                row.last_modified,
                row.resource_created_at,
                now_millis(),
            ],
        )?;
        self.touched.insert(url);
        Ok(())
    }

    /// Tombstone a single url without following its dependents.
    pub fn delete_entry(&mut self, url: &str) -> Result<(), IndexError> {
        let url = canonical_url(url, None);
        if !self.realm.in_realm(&url) {
            return Ok(());
        }

        let conn = self.db.connection()?;
        self.check_superseded(&conn)?;
        let updated = conn.execute(
            "UPDATE index_entries SET is_deleted = 1, indexed_at = NULL
             WHERE url = ?1 AND realm_url = ?2 AND realm_version = ?3",
            params![url, self.realm.url(), self.realm_version],
        )?;
        if updated == 0 {
            let copied = self.tombstone_chunk(&conn, std::slice::from_ref(&url))?;
            if copied == 0 {
                let entry_type = if is_css(&url) {
                    EntryType::Css
                } else if has_executable_extension(&url) {
                    EntryType::Module
                } else {
                    EntryType::Instance
                };
                insert_tombstone(&conn, self.realm.url(), self.realm_version, &url, entry_type)?;
            }
        }
        self.touched.insert(url);
        Ok(())
    }

    /// Promote the WIP version to production and record the realm meta summary.
    pub fn done(self) -> Result<DoneResult, IndexError> {
        let mut conn = self.db.connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let realm_url = self.realm.url();
        let current = self.check_superseded(&tx)?;

        let abandoned = tx.execute(
            "DELETE FROM index_entries
             WHERE realm_url = ?1 AND realm_version > ?2 AND realm_version < ?3",
            params![realm_url, current, self.realm_version],
        )?;
        tx.execute(
            "DELETE FROM realm_meta
             WHERE realm_url = ?1 AND realm_version > ?2 AND realm_version < ?3",
            params![realm_url, current, self.realm_version],
        )?;
        if abandoned > 0 {
            tracing::info!(
                realm = realm_url,
                version = self.realm_version,
                rows = abandoned,
                "dropped abandoned work in progress index rows"
            );
        }

        tx.execute(
            "INSERT INTO realm_versions (realm_url, current_version) VALUES (?1, ?2)
             ON CONFLICT(realm_url) DO UPDATE
             SET current_version = MAX(current_version, excluded.current_version)",
            params![realm_url, self.realm_version],
        )?;

        let summary = card_type_summary(&tx, realm_url, self.realm_version)?;
        tx.execute(
            "INSERT OR REPLACE INTO realm_meta (realm_url, realm_version, value, indexed_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![realm_url, self.realm_version, serde_json::to_string(&summary)?, now_millis()],
        )?;

        let total_index_entries: i64 = tx.query_row(
            &format!(
                "SELECT COUNT(*) FROM index_entries i
                 WHERE i.realm_url = ?1 AND {ALIVE} AND {}",
                latest_row_condition("AND i2.realm_version <= ?2")
            ),
            params![realm_url, self.realm_version],
            |row| row.get(0),
        )?;
        tx.commit()?;

        tracing::info!(
            realm = realm_url,
            version = self.realm_version,
            total_index_entries,
            card_types = summary.len(),
            "committed realm generation"
        );
        Ok(DoneResult { total_index_entries })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Internals
    // ─────────────────────────────────────────────────────────────────────────

    /// Fails once production has reached or passed this batch's version,
    /// otherwise returns the production version.
    fn check_superseded(&self, conn: &Connection) -> Result<i64, IndexError> {
        let current = current_version(conn, self.realm.url())?.unwrap_or(0);
        if current >= self.realm_version {
            return Err(IndexError::InvalidationConflict {
                realm_url: self.realm.url().to_string(),
                version: self.realm_version,
                detail: format!(": production version is already {current}"),
            });
        }
        Ok(current)
    }

    /// Compare-and-swap guard: the WIP version must still hold exactly the
    /// rows this batch wrote, and production must not have reached it.
    fn check_conflict(&self, conn: &Connection) -> Result<(), IndexError> {
        let realm_url = self.realm.url();
        self.check_superseded(conn)?;

        let rows: i64 = conn.query_row(
            "SELECT COUNT(*) FROM index_entries WHERE realm_url = ?1 AND realm_version = ?2",
            params![realm_url, self.realm_version],
            |row| row.get(0),
        )?;
        if rows != self.touched.len() as i64 {
            return Err(IndexError::InvalidationConflict {
                realm_url: realm_url.to_string(),
                version: self.realm_version,
                detail: format!(
                    ": found {rows} rows at this version but this batch wrote {}. \
                     Another batch is writing this realm; discard its work in progress and retry",
                    self.touched.len()
                ),
            });
        }
        Ok(())
    }

    /// Carry the latest row of each url forward as a tombstone unless the
    /// WIP version already has one. Returns the number of rows written.
    fn tombstone_chunk(&self, conn: &Connection, urls: &[String]) -> Result<usize, IndexError> {
        if urls.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "INSERT INTO index_entries ({COPY_COLUMNS})
             SELECT i.url, i.file_alias, i.realm_url, ?, i.type, i.pristine_doc, i.source,
                    i.search_doc, i.deps, i.types, i.display_names, i.isolated_html,
                    i.atom_html, i.embedded_html, i.fitted_html, i.error_doc,
                    i.last_modified, i.resource_created_at, NULL, 1
             FROM index_entries i
             WHERE i.realm_url = ? AND i.realm_version < ? AND i.url IN ({})
               AND {}",
            placeholders(urls.len()),
            latest_row_condition(&generation_bound("?"))
        );

        let mut values: Vec<SqlValue> = vec![
            SqlValue::Integer(self.realm_version),
            SqlValue::Text(self.realm.url().to_string()),
            SqlValue::Integer(self.realm_version),
        ];
        values.extend(urls.iter().map(|u| SqlValue::Text(u.clone())));
        values.push(SqlValue::Integer(self.realm_version));

        Ok(conn.execute(&sql, params_from_iter(values))?)
    }

    fn record_invalidations(&mut self, urls: &[String]) {
        for url in urls {
            if self.invalidated.insert(url.clone()) {
                self.invalidations.push(url.clone());
            }
        }
    }
}

/// Column values for one entry, JSON payloads pre-serialized.
#[derive(Default)]
struct EntryRow {
    pristine_doc: Option<String>,
    source: Option<String>,
    search_doc: Option<String>,
    deps: Option<String>,
    types: Option<String>,
    display_names: Option<String>,
    isolated_html: Option<String>,
    atom_html: Option<String>,
    embedded_html: Option<String>,
    fitted_html: Option<String>,
    error_doc: Option<String>,
    last_modified: Option<i64>,
    resource_created_at: Option<i64>,
}

impl EntryRow {
    fn from_entry(entry: &IndexEntry) -> Result<Self, IndexError> {
        Ok(match entry {
            IndexEntry::Instance(i) => Self {
                pristine_doc: Some(serde_json::to_string(&i.resource)?),
                source: Some(i.source.clone()),
                search_doc: Some(serde_json::to_string(&i.search_doc)?),
                deps: Some(serde_json::to_string(&i.deps)?),
                types: Some(serde_json::to_string(&i.types)?),
                display_names: Some(serde_json::to_string(&i.display_names)?),
                isolated_html: i.isolated_html.clone(),
                atom_html: i.atom_html.clone(),
                embedded_html: to_json_opt(&i.embedded_html)?,
                fitted_html: to_json_opt(&i.fitted_html)?,
                error_doc: None,
                last_modified: Some(i.last_modified),
                resource_created_at: Some(i.resource_created_at),
            },
            IndexEntry::Module(s) | IndexEntry::Css(s) => Self {
                source: Some(s.source.clone()),
                deps: Some(serde_json::to_string(&s.deps)?),
                last_modified: Some(s.last_modified),
                resource_created_at: Some(s.resource_created_at),
                ..Self::default()
            },
            IndexEntry::Error(e) => Self {
                search_doc: to_json_opt(&e.search_doc)?,
                deps: Some(serde_json::to_string(&e.error.deps)?),
                types: to_json_opt(&e.types)?,
                display_names: to_json_opt(&e.display_names)?,
                error_doc: Some(serde_json::to_string(&e.error)?),
                last_modified: e.last_modified,
                resource_created_at: e.resource_created_at,
                ..Self::default()
            },
        })
    }
}

fn to_json_opt<T: Serialize>(value: &Option<T>) -> Result<Option<String>, IndexError> {
    value.as_ref().map(serde_json::to_string).transpose().map_err(Into::into)
}

fn insert_tombstone(
    conn: &Connection,
    realm_url: &str,
    version: i64,
    url: &str,
    entry_type: EntryType,
) -> Result<(), IndexError> {
    conn.execute(
        "INSERT OR IGNORE INTO index_entries
            (url, file_alias, realm_url, realm_version, type, is_deleted)
         VALUES (?1, ?2, ?3, ?4, ?5, 1)",
        params![url, file_alias(url), realm_url, version, entry_type.as_str()],
    )?;
    Ok(())
}

fn urls_at_version(
    conn: &Connection,
    realm_url: &str,
    version: i64,
) -> Result<HashSet<String>, IndexError> {
    let mut stmt = conn
        .prepare("SELECT url FROM index_entries WHERE realm_url = ?1 AND realm_version = ?2")?;
    let urls = stmt
        .query_map(params![realm_url, version], |row| row.get(0))?
        .collect::<Result<HashSet<String>, _>>()?;
    Ok(urls)
}

/// Group alive instances by their most specific type.
fn card_type_summary(
    conn: &Connection,
    realm_url: &str,
    version: i64,
) -> Result<Vec<CardTypeSummary>, IndexError> {
    let sql = format!(
        "SELECT json_extract(i.types, '$[0]') AS code_ref,
                MAX(json_extract(i.display_names, '$[0]')),
                COUNT(*)
         FROM index_entries i
         WHERE i.realm_url = ?1 AND i.type = 'instance' AND {ALIVE}
           AND i.types IS NOT NULL AND json_array_length(i.types) > 0
           AND {}
         GROUP BY code_ref
         ORDER BY code_ref",
        latest_row_condition("AND i2.realm_version <= ?2")
    );
    let mut stmt = conn.prepare(&sql)?;
    let summary = stmt
        .query_map(params![realm_url, version], |row| {
            Ok(CardTypeSummary {
                code_ref: row.get(0)?,
                display_name: row.get(1)?,
                total: row.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(summary)
}

pub(crate) fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use serde_json::json;

    use super::*;
    use crate::index::types::{
        ErrorEntry, GetEntryOptions, InstanceEntry, InstanceOrError, SerializedError,
        SourceEntry, SourceOrError,
    };

    const REALM: &str = "http://test-realm/test/";

    fn url(local: &str) -> String {
        format!("{REALM}{local}")
    }

    fn writer() -> IndexWriter {
        IndexWriter::new(Arc::new(IndexDb::open_in_memory().unwrap()))
    }

    fn module(deps: &[&str]) -> IndexEntry {
        IndexEntry::Module(SourceEntry {
            source: "export class X {}".into(),
            deps: deps.iter().map(|d| d.to_string()).collect(),
            last_modified: 1,
            resource_created_at: 1,
        })
    }

    fn instance(name: &str, deps: &[&str], types: &[&str]) -> IndexEntry {
        IndexEntry::Instance(InstanceEntry {
            resource: json!({ "id": name, "attributes": { "name": name } }),
            source: format!(r#"{{"data":{{"attributes":{{"name":"{name}"}}}}}}"#),
            search_doc: json!({ "name": name }),
            deps: deps.iter().map(|d| d.to_string()).collect::<BTreeSet<_>>(),
            types: types.iter().map(|t| t.to_string()).collect(),
            display_names: types.iter().map(|t| t.rsplit('/').next().unwrap().to_string()).collect(),
            last_modified: 10,
            resource_created_at: 5,
            ..InstanceEntry::default()
        })
    }

    /// person.gts <- fancy-person.gts <- hassan.json, plus an unrelated mango.json
    fn seed(writer: &IndexWriter) {
        let mut batch = writer.create_batch(REALM).unwrap();
        batch.update_entry(&url("person.gts"), &module(&[])).unwrap();
        batch.update_entry(&url("fancy-person.gts"), &module(&[&url("person")])).unwrap();
        batch
            .update_entry(
                &url("hassan.json"),
                &instance("Hassan", &[&url("fancy-person")], &[&url("fancy-person/FancyPerson")]),
            )
            .unwrap();
        batch
            .update_entry(&url("mango.json"), &instance("Mango", &[&url("pet")], &[&url("pet/Pet")]))
            .unwrap();
        batch.done().unwrap();
    }

    #[test]
    fn test_invalidate_follows_transitive_dependents() {
        let writer = writer();
        seed(&writer);

        let mut batch = writer.create_batch(REALM).unwrap();
        assert_eq!(batch.realm_version(), 2);
        let invalidated = batch.invalidate(&[url("person.gts")]).unwrap();
        assert_eq!(
            invalidated,
            vec![url("person.gts"), url("fancy-person.gts"), url("hassan.json")]
        );
        assert_eq!(batch.invalidations(), invalidated.as_slice());

        // production still sees the committed rows
        let db = writer.db();
        assert!(db.get_instance(&url("hassan"), GetEntryOptions::default()).unwrap().is_some());
        assert!(
            db.get_instance(&url("hassan"), GetEntryOptions::work_in_progress())
                .unwrap()
                .is_none()
        );
        assert!(
            db.get_instance(&url("mango"), GetEntryOptions::work_in_progress())
                .unwrap()
                .is_some()
        );
    }

    #[test]
    fn test_invalidate_is_idempotent_within_batch() {
        let writer = writer();
        seed(&writer);

        let mut batch = writer.create_batch(REALM).unwrap();
        batch.invalidate(&[url("fancy-person.gts")]).unwrap();
        let again = batch.invalidate(&[url("fancy-person.gts")]).unwrap();
        assert_eq!(again, vec![url("fancy-person.gts"), url("hassan.json")]);
        assert_eq!(batch.invalidations().len(), 2);
    }

    #[test]
    fn test_invalidate_ignores_other_realms() {
        let writer = writer();
        seed(&writer);

        let mut batch = writer.create_batch(REALM).unwrap();
        let invalidated = batch.invalidate(&["http://other-realm/person.gts"]).unwrap();
        assert!(invalidated.is_empty());
    }

    #[test]
    fn test_missing_urls() {
        let writer = writer();
        let mut batch = writer.create_batch(REALM).unwrap();
        let invalidated = batch
            .invalidate(&[url("new.json"), url("logo.png"), url("new-module.gts")])
            .unwrap();
        assert_eq!(invalidated.len(), 3);

        let rows = urls_at_version(&writer.db().connection().unwrap(), REALM, 1).unwrap();
        assert!(rows.contains(&url("new.json")));
        assert!(rows.contains(&url("new-module.gts")));
        assert!(!rows.contains(&url("logo.png")));
    }

    #[test]
    fn test_concurrent_batches_conflict() {
        let writer = writer();
        seed(&writer);

        let mut first = writer.create_batch(REALM).unwrap();
        let mut second = writer.create_batch(REALM).unwrap();
        first.invalidate(&[url("mango.json")]).unwrap();

        let err = second.invalidate(&[url("person.gts")]).unwrap_err();
        assert!(err.is_conflict());
        assert!(err.to_string().contains("Invalidation conflict error in realm"));

        let err = second.make_new_generation().unwrap_err();
        assert!(err.is_conflict());

        // the first batch keeps working after the other one failed
        first.invalidate(&[url("person.gts")]).unwrap();
        first.done().unwrap();
    }

    #[test]
    fn test_stale_batch_conflicts_after_commit() {
        let writer = writer();
        seed(&writer);

        let first = writer.create_batch(REALM).unwrap();
        let mut second = writer.create_batch(REALM).unwrap();
        first.done().unwrap();
        assert!(second.invalidate(&[url("mango.json")]).unwrap_err().is_conflict());
    }

    #[test]
    fn test_done_promotes_and_summarizes() {
        let writer = writer();
        seed(&writer);

        let mut batch = writer.create_batch(REALM).unwrap();
        batch.invalidate(&[url("mango.json")]).unwrap();
        batch
            .update_entry(&url("mango.json"), &instance("Mango II", &[], &[&url("pet/Pet")]))
            .unwrap();

        let wip = writer.db().get_instance(&url("mango"), GetEntryOptions::work_in_progress());
        match wip.unwrap() {
            Some(InstanceOrError::Instance(i)) => {
                assert_eq!(i.search_doc, Some(json!({ "name": "Mango II" })));
                assert!(i.indexed_at.is_some());
            }
            other => panic!("unexpected {other:?}"),
        }

        let result = batch.done().unwrap();
        assert_eq!(result.total_index_entries, 4);
        assert_eq!(writer.db().current_version(REALM).unwrap(), Some(2));

        match writer.db().get_instance(&url("mango"), GetEntryOptions::default()).unwrap() {
            Some(InstanceOrError::Instance(i)) => {
                assert_eq!(i.search_doc, Some(json!({ "name": "Mango II" })));
            }
            other => panic!("unexpected {other:?}"),
        }

        let summary = writer.db().fetch_card_type_summary(REALM).unwrap();
        assert_eq!(summary.len(), 2);
        assert_eq!(summary[0].code_ref, url("fancy-person/FancyPerson"));
        assert_eq!(summary[0].total, 1);
        assert_eq!(summary[1].display_name.as_deref(), Some("Pet"));
    }

    #[test]
    fn test_make_new_generation_tombstones_everything() {
        let writer = writer();
        seed(&writer);

        let mut batch = writer.create_batch(REALM).unwrap();
        let urls = batch.make_new_generation().unwrap();
        assert_eq!(urls.len(), 4);
        batch.update_entry(&url("person.gts"), &module(&[])).unwrap();
        let result = batch.done().unwrap();
        assert_eq!(result.total_index_entries, 1);
        assert!(writer.db().fetch_card_type_summary(REALM).unwrap().is_empty());
    }

    #[test]
    fn test_error_entry_keeps_deps_for_invalidation() {
        let writer = writer();
        let mut batch = writer.create_batch(REALM).unwrap();
        let mut error = SerializedError::new("missing module", 404);
        error.add_deps([url("broken-type")]);
        batch.update_entry(&url("card.json"), &IndexEntry::Error(ErrorEntry::new(error))).unwrap();
        batch.done().unwrap();

        let mut batch = writer.create_batch(REALM).unwrap();
        let invalidated = batch.invalidate(&[url("broken-type.gts")]).unwrap();
        assert!(invalidated.contains(&url("card.json")));
    }

    #[test]
    fn test_delete_entry_and_out_of_realm_update() {
        let writer = writer();
        seed(&writer);

        let mut batch = writer.create_batch(REALM).unwrap();
        batch.update_entry("http://other-realm/x.gts", &module(&[])).unwrap();
        batch.delete_entry(&url("person.gts")).unwrap();
        batch.done().unwrap();

        assert!(writer.db().get_module(&url("person"), GetEntryOptions::default()).unwrap().is_none());
        assert!(matches!(
            writer.db().get_module(&url("fancy-person"), GetEntryOptions::default()).unwrap(),
            Some(SourceOrError::Source(_))
        ));
        assert!(
            writer.db().get_module("http://other-realm/x.gts", GetEntryOptions::work_in_progress())
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_large_fan_out_is_chunked() {
        let writer = writer().with_chunk_size(100);
        let mut batch = writer.create_batch(REALM).unwrap();
        batch.update_entry(&url("base.gts"), &module(&[])).unwrap();
        for i in 0..1200 {
            batch
                .update_entry(&url(&format!("card-{i}.json")), &instance("x", &[&url("base")], &[]))
                .unwrap();
        }
        batch.done().unwrap();

        let mut batch = writer.create_batch(REALM).unwrap();
        let invalidated = batch.invalidate(&[url("base.gts")]).unwrap();
        assert_eq!(invalidated.len(), 1201);
        let rows = urls_at_version(&writer.db().connection().unwrap(), REALM, 2).unwrap();
        assert_eq!(rows.len(), 1201);
    }
}
