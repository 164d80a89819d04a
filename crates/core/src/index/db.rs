//! Database connection and the read side of the index store.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{Connection, OptionalExtension, params};
use serde::de::DeserializeOwned;
use thiserror::Error;

use super::schema::{SchemaError, init_schema};
use super::types::{
    CardTypeSummary, EntryType, GetEntryOptions, IndexedInstance, IndexedInstanceError,
    IndexedSource, InstanceOrError, ModifiedTime, ModifiedTimes, SerializedError,
    SourceOrError,
};
use crate::paths::{file_alias, has_executable_extension, is_css, is_json};

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("JSON column error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Invalidation conflict error in realm {realm_url} version {version}{detail}")]
    InvalidationConflict { realm_url: String, version: i64, detail: String },

    #[error("Index connection lock poisoned")]
    Poisoned,
}

impl IndexError {
    /// Conflicts are resolved by retrying with a fresh batch.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::InvalidationConflict { .. })
    }
}

/// Columns selected for a full index row, aliased against `i`.
pub(crate) const ENTRY_COLUMNS: &str = "i.url, i.file_alias, i.realm_url, i.realm_version, \
     i.type, i.pristine_doc, i.source, i.search_doc, i.deps, i.types, i.display_names, \
     i.isolated_html, i.atom_html, i.embedded_html, i.fitted_html, i.error_doc, \
     i.last_modified, i.resource_created_at, i.indexed_at, i.is_deleted";

/// Restricts `i` to the newest row per url at or below a bound.
///
/// The bound is spliced in by the caller: a pinned version, the realm's
/// production pointer, or one of the generation bounds below.
pub(crate) fn latest_row_condition(bound: &str) -> String {
    format!(
        "i.realm_version = (SELECT MAX(i2.realm_version) FROM index_entries i2 \
         WHERE i2.url = i.url AND i2.realm_url = i.realm_url {bound})"
    )
}

pub(crate) const PRODUCTION_BOUND: &str = "AND i2.realm_version <= COALESCE(\
     (SELECT r.current_version FROM realm_versions r WHERE r.realm_url = i2.realm_url), 0)";

/// Committed rows plus the newest generation. Generations between the two
/// belong to batches that never finished and stay invisible.
pub(crate) const WORK_IN_PROGRESS_BOUND: &str = "AND (i2.realm_version <= COALESCE(\
     (SELECT r.current_version FROM realm_versions r WHERE r.realm_url = i2.realm_url), 0) \
     OR i2.realm_version = (SELECT MAX(i3.realm_version) FROM index_entries i3 \
     WHERE i3.realm_url = i2.realm_url))";

/// Committed rows plus the generation bound to `version`.
pub(crate) fn generation_bound(version: &str) -> String {
    format!(
        "AND (i2.realm_version <= COALESCE(\
         (SELECT r.current_version FROM realm_versions r WHERE r.realm_url = i2.realm_url), 0) \
         OR i2.realm_version = {version})"
    )
}

pub(crate) const ALIVE: &str = "(i.is_deleted = 0 OR i.is_deleted IS NULL)";

fn bound_for(opts: GetEntryOptions) -> &'static str {
    if opts.use_work_in_progress_index { WORK_IN_PROGRESS_BOUND } else { PRODUCTION_BOUND }
}

/// Raw index row; JSON columns are decoded lazily.
#[derive(Debug, Clone)]
pub(crate) struct IndexRow {
    pub url: String,
    pub file_alias: String,
    pub realm_url: String,
    pub realm_version: i64,
    pub entry_type: String,
    pub pristine_doc: Option<String>,
    pub source: Option<String>,
    pub search_doc: Option<String>,
    pub deps: Option<String>,
    pub types: Option<String>,
    pub display_names: Option<String>,
    pub isolated_html: Option<String>,
    pub atom_html: Option<String>,
    pub embedded_html: Option<String>,
    pub fitted_html: Option<String>,
    pub error_doc: Option<String>,
    pub last_modified: Option<i64>,
    pub resource_created_at: Option<i64>,
    pub indexed_at: Option<i64>,
    pub is_deleted: Option<bool>,
}

impl IndexRow {
    pub(crate) fn from_row(row: &rusqlite::Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            url: row.get(0)?,
            file_alias: row.get(1)?,
            realm_url: row.get(2)?,
            realm_version: row.get(3)?,
            entry_type: row.get(4)?,
            pristine_doc: row.get(5)?,
            source: row.get(6)?,
            search_doc: row.get(7)?,
            deps: row.get(8)?,
            types: row.get(9)?,
            display_names: row.get(10)?,
            isolated_html: row.get(11)?,
            atom_html: row.get(12)?,
            embedded_html: row.get(13)?,
            fitted_html: row.get(14)?,
            error_doc: row.get(15)?,
            last_modified: row.get(16)?,
            resource_created_at: row.get(17)?,
            indexed_at: row.get(18)?,
            is_deleted: row.get(19)?,
        })
    }

    pub(crate) fn is_deleted(&self) -> bool {
        self.is_deleted.unwrap_or(false)
    }

    pub(crate) fn entry_type(&self) -> Result<EntryType, IndexError> {
        self.entry_type.parse().map_err(IndexError::InvalidData)
    }

    fn error(&self) -> Result<SerializedError, IndexError> {
        json_column::<SerializedError>(&self.error_doc)?.ok_or_else(|| {
            IndexError::InvalidData(format!(
                "index entry for {} has type error but no error_doc",
                self.url
            ))
        })
    }

    fn into_instance(self) -> Result<InstanceOrError, IndexError> {
        if self.entry_type()? == EntryType::Error {
            return Ok(InstanceOrError::Error(IndexedInstanceError {
                error: self.error()?,
                instance: json_column(&self.pristine_doc)?,
                search_doc: json_column(&self.search_doc)?,
                types: json_column(&self.types)?.unwrap_or_default(),
                deps: json_column(&self.deps)?.unwrap_or_default(),
                canonical_url: self.url,
                realm_url: self.realm_url,
                realm_version: self.realm_version,
                source: self.source,
                last_modified: self.last_modified,
                resource_created_at: self.resource_created_at,
                indexed_at: self.indexed_at,
            }));
        }
        let instance = json_column(&self.pristine_doc)?.ok_or_else(|| {
            IndexError::InvalidData(format!(
                "index entry for {} has neither an error_doc nor a pristine_doc",
                self.url
            ))
        })?;
        Ok(InstanceOrError::Instance(IndexedInstance {
            instance,
            search_doc: json_column(&self.search_doc)?,
            types: json_column(&self.types)?.unwrap_or_default(),
            display_names: json_column(&self.display_names)?.unwrap_or_default(),
            deps: json_column(&self.deps)?.unwrap_or_default(),
            embedded_html: json_column(&self.embedded_html)?,
            fitted_html: json_column(&self.fitted_html)?,
            source: self.source.unwrap_or_default(),
            canonical_url: self.url,
            realm_url: self.realm_url,
            realm_version: self.realm_version,
            isolated_html: self.isolated_html,
            atom_html: self.atom_html,
            last_modified: self.last_modified,
            resource_created_at: self.resource_created_at,
            indexed_at: self.indexed_at,
        }))
    }

    fn into_source(self) -> Result<SourceOrError, IndexError> {
        if self.entry_type()? == EntryType::Error {
            return Ok(SourceOrError::Error { error: self.error()?, canonical_url: self.url });
        }
        let source = self.source.clone().ok_or_else(|| {
            IndexError::InvalidData(format!(
                "index entry for {} has neither an error_doc nor source",
                self.url
            ))
        })?;
        Ok(SourceOrError::Source(IndexedSource {
            deps: json_column(&self.deps)?.unwrap_or_default(),
            canonical_url: self.url,
            realm_version: self.realm_version,
            source,
            last_modified: self.last_modified,
            resource_created_at: self.resource_created_at,
            indexed_at: self.indexed_at,
        }))
    }
}

pub(crate) fn json_column<T: DeserializeOwned>(
    raw: &Option<String>,
) -> Result<Option<T>, IndexError> {
    match raw.as_deref() {
        None | Some("null") => Ok(None),
        Some(text) => Ok(Some(serde_json::from_str(text)?)),
    }
}

/// Realm index database handle.
///
/// The connection sits behind a mutex so a single handle can be shared
/// (`Arc<IndexDb>`) by batches, query engines and index runners.
pub struct IndexDb {
    conn: Mutex<Connection>,
}

impl IndexDb {
    /// Open or create an index database at the given path.
    pub fn open(path: &Path) -> Result<Self, IndexError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )?;
        init_schema(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Create an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self, IndexError> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Lock the underlying connection (for transactions).
    pub fn connection(&self) -> Result<MutexGuard<'_, Connection>, IndexError> {
        self.conn.lock().map_err(|_| IndexError::Poisoned)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Versions
    // ─────────────────────────────────────────────────────────────────────────

    /// Production version of a realm, `None` if nothing was ever committed.
    pub fn current_version(&self, realm_url: &str) -> Result<Option<i64>, IndexError> {
        let conn = self.connection()?;
        current_version(&conn, realm_url)
    }

    /// Highest version with any row for the realm, committed or not.
    pub fn latest_version(&self, realm_url: &str) -> Result<Option<i64>, IndexError> {
        let conn = self.connection()?;
        latest_version(&conn, realm_url)
    }

    /// All realms with a production pointer.
    pub fn list_realms(&self) -> Result<Vec<(String, i64)>, IndexError> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            "SELECT realm_url, current_version FROM realm_versions ORDER BY realm_url",
        )?;
        let realms = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(realms)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Entries
    // ─────────────────────────────────────────────────────────────────────────

    /// Modification times of the realm's production entries.
    pub fn get_modified_times(&self, realm_url: &str) -> Result<ModifiedTimes, IndexError> {
        let conn = self.connection()?;
        get_modified_times(&conn, realm_url)
    }

    /// Look up an instance by url, with or without its `.json` suffix.
    pub fn get_instance(
        &self,
        url: &str,
        opts: GetEntryOptions,
    ) -> Result<Option<InstanceOrError>, IndexError> {
        self.get_row(url, EntryType::Instance, opts)?.map(IndexRow::into_instance).transpose()
    }

    /// Look up a module by url, with or without its executable extension.
    pub fn get_module(
        &self,
        url: &str,
        opts: GetEntryOptions,
    ) -> Result<Option<SourceOrError>, IndexError> {
        self.get_row(url, EntryType::Module, opts)?.map(IndexRow::into_source).transpose()
    }

    /// Look up a stylesheet by url.
    pub fn get_css(
        &self,
        url: &str,
        opts: GetEntryOptions,
    ) -> Result<Option<SourceOrError>, IndexError> {
        self.get_row(url, EntryType::Css, opts)?.map(IndexRow::into_source).transpose()
    }

    fn get_row(
        &self,
        url: &str,
        kind: EntryType,
        opts: GetEntryOptions,
    ) -> Result<Option<IndexRow>, IndexError> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM index_entries i
             WHERE (i.url = ?1 OR i.file_alias = ?2)
               AND i.type IN (?3, 'error')
               AND {}
             ORDER BY i.realm_version DESC, i.url",
            latest_row_condition(bound_for(opts))
        );

        let conn = self.connection()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![url, file_alias(url), kind.as_str()], IndexRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        // error rows are shared by every kind, so pick the one whose url matches
        let found = rows.into_iter().find(|row| {
            row.entry_type != EntryType::Error.as_str() || url_matches_kind(&row.url, kind)
        });
        Ok(found.filter(|row| !row.is_deleted()))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Statistics and maintenance
    // ─────────────────────────────────────────────────────────────────────────

    /// Card type summary recorded for the realm's production version.
    pub fn fetch_card_type_summary(
        &self,
        realm_url: &str,
    ) -> Result<Vec<CardTypeSummary>, IndexError> {
        let conn = self.connection()?;
        let value: Option<String> = conn
            .query_row(
                "SELECT m.value FROM realm_meta m
                 JOIN realm_versions r ON r.realm_url = m.realm_url
                 WHERE m.realm_url = ?1 AND m.realm_version = r.current_version",
                [realm_url],
                |row| row.get(0),
            )
            .optional()?;
        Ok(json_column(&value)?.unwrap_or_default())
    }

    /// Count of alive production entries by type.
    pub fn count_by_type(&self, realm_url: &str) -> Result<Vec<(EntryType, i64)>, IndexError> {
        let sql = format!(
            "SELECT i.type, COUNT(*) FROM index_entries i
             WHERE i.realm_url = ?1 AND {ALIVE} AND {}
             GROUP BY i.type ORDER BY i.type",
            latest_row_condition(PRODUCTION_BOUND)
        );
        let conn = self.connection()?;
        let mut stmt = conn.prepare(&sql)?;
        let counts = stmt
            .query_map([realm_url], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        counts
            .into_iter()
            .map(|(t, n)| Ok((t.parse().map_err(IndexError::InvalidData)?, n)))
            .collect()
    }

    /// Delete uncommitted generations left behind by batches that never
    /// finished. Returns the number of index rows removed.
    pub fn discard_work_in_progress(&self, realm_url: &str) -> Result<usize, IndexError> {
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        let current = current_version(&tx, realm_url)?.unwrap_or(0);
        let rows = tx.execute(
            "DELETE FROM index_entries WHERE realm_url = ?1 AND realm_version > ?2",
            params![realm_url, current],
        )?;
        tx.execute(
            "DELETE FROM realm_meta WHERE realm_url = ?1 AND realm_version > ?2",
            params![realm_url, current],
        )?;
        tx.commit()?;
        tracing::info!(realm = realm_url, rows, "discarded work in progress index rows");
        Ok(rows)
    }
}

fn url_matches_kind(url: &str, kind: EntryType) -> bool {
    match kind {
        EntryType::Instance => is_json(url),
        EntryType::Module => has_executable_extension(url),
        EntryType::Css => is_css(url),
        EntryType::Error => true,
    }
}

pub(crate) fn current_version(
    conn: &Connection,
    realm_url: &str,
) -> Result<Option<i64>, IndexError> {
    conn.query_row(
        "SELECT current_version FROM realm_versions WHERE realm_url = ?1",
        [realm_url],
        |row| row.get(0),
    )
    .optional()
    .map_err(Into::into)
}

pub(crate) fn latest_version(
    conn: &Connection,
    realm_url: &str,
) -> Result<Option<i64>, IndexError> {
    let version: Option<i64> = conn.query_row(
        "SELECT MAX(realm_version) FROM index_entries WHERE realm_url = ?1",
        [realm_url],
        |row| row.get(0),
    )?;
    Ok(version)
}

pub(crate) fn get_modified_times(
    conn: &Connection,
    realm_url: &str,
) -> Result<ModifiedTimes, IndexError> {
    let sql = format!(
        "SELECT i.url, i.type, i.last_modified FROM index_entries i
         WHERE i.realm_url = ?1 AND {ALIVE} AND {}",
        latest_row_condition(PRODUCTION_BOUND)
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([realm_url], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<i64>>(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut mtimes = ModifiedTimes::new();
    for (url, entry_type, last_modified) in rows {
        let entry_type = entry_type.parse().map_err(IndexError::InvalidData)?;
        mtimes.insert(url, ModifiedTime { last_modified, entry_type });
    }
    Ok(mtimes)
}
