//! SQLite schema definition and migrations.

use rusqlite::Connection;
use thiserror::Error;

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 1;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Schema version {found} is newer than supported {supported}")]
    VersionTooNew { found: i32, supported: i32 },

    #[error("Migration failed: {0}")]
    MigrationFailed(String),
}

/// Initialize or migrate the database schema.
pub fn init_schema(conn: &Connection) -> Result<(), SchemaError> {
    let version = get_schema_version(conn)?;

    if version == 0 {
        create_schema_v1(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if version < SCHEMA_VERSION {
        migrate(conn, version)?;
    } else if version > SCHEMA_VERSION {
        return Err(SchemaError::VersionTooNew {
            found: version,
            supported: SCHEMA_VERSION,
        });
    }

    Ok(())
}

fn get_schema_version(conn: &Connection) -> Result<i32, SchemaError> {
    let exists: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='schema_version'",
        [],
        |row| row.get(0),
    )?;

    if !exists {
        return Ok(0);
    }

    let version: i32 =
        conn.query_row("SELECT version FROM schema_version", [], |row| row.get(0))?;

    Ok(version)
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<(), SchemaError> {
    conn.execute(
        "INSERT OR REPLACE INTO schema_version (id, version) VALUES (1, ?1)",
        [version],
    )?;
    Ok(())
}

fn create_schema_v1(conn: &Connection) -> Result<(), SchemaError> {
    conn.execute_batch(
        r#"
        -- Schema version tracking
        CREATE TABLE schema_version (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            version INTEGER NOT NULL
        );

        -- One row per (url, realm_version). JSON payloads are stored as TEXT.
        CREATE TABLE index_entries (
            url TEXT NOT NULL,
            file_alias TEXT NOT NULL,
            realm_url TEXT NOT NULL,
            realm_version INTEGER NOT NULL,
            type TEXT NOT NULL,
            pristine_doc TEXT,
            source TEXT,
            search_doc TEXT,
            deps TEXT,
            types TEXT,
            display_names TEXT,
            isolated_html TEXT,
            atom_html TEXT,
            embedded_html TEXT,
            fitted_html TEXT,
            error_doc TEXT,
            last_modified INTEGER,
            resource_created_at INTEGER,
            indexed_at INTEGER,
            is_deleted INTEGER,
            PRIMARY KEY (url, realm_url, realm_version)
        );

        CREATE INDEX idx_entries_realm_version ON index_entries(realm_url, realm_version);
        CREATE INDEX idx_entries_file_alias ON index_entries(file_alias);
        CREATE INDEX idx_entries_type ON index_entries(type);

        -- Production generation pointer per realm
        CREATE TABLE realm_versions (
            realm_url TEXT PRIMARY KEY,
            current_version INTEGER NOT NULL
        );

        -- Card type summary per realm generation
        CREATE TABLE realm_meta (
            realm_url TEXT NOT NULL,
            realm_version INTEGER NOT NULL,
            value TEXT NOT NULL,
            indexed_at INTEGER,
            PRIMARY KEY (realm_url, realm_version)
        );
        "#,
    )?;

    Ok(())
}

fn migrate(_conn: &Connection, from_version: i32) -> Result<(), SchemaError> {
    // Only v1 exists so far.
    Err(SchemaError::MigrationFailed(format!(
        "No migration path from version {} to {}",
        from_version, SCHEMA_VERSION
    )))
}
