pub mod discard_wip;
pub mod doctor;
pub mod get;
pub mod mtimes;
pub mod output;
pub mod status;
pub mod types;

use std::path::{Path, PathBuf};

use realm_index_core::config::{ConfigLoader, LoggingConfig, default_config_path};
use realm_index_core::index::IndexDb;
use realm_index_core::paths::RealmPaths;

use crate::OutputFormat;

/// Settings shared by the database commands.
pub struct Context {
    pub database: PathBuf,
    pub logging: LoggingConfig,
}

/// Work out which database to open and install logging.
///
/// `--db` makes the config file optional; an explicit `--config` must load.
pub fn resolve(config: Option<&Path>, db: Option<&Path>) -> Context {
    let ctx = match (config, db) {
        (None, Some(db)) => {
            let logging = if default_config_path().exists() {
                ConfigLoader::load(None).map(|rc| rc.logging).unwrap_or_default()
            } else {
                LoggingConfig::default()
            };
            Context { database: db.to_path_buf(), logging }
        }
        (config, db) => {
            let rc = match ConfigLoader::load(config) {
                Ok(rc) => rc,
                Err(e) => {
                    eprintln!("Error loading config: {}", e);
                    std::process::exit(1);
                }
            };
            Context {
                database: db.map_or(rc.database, Path::to_path_buf),
                logging: rc.logging,
            }
        }
    };
    crate::logging::init(&ctx.logging);
    tracing::debug!(database = %ctx.database.display(), "resolved index database");
    ctx
}

/// Open an existing index database, exiting when there is none.
pub fn open_db(ctx: &Context) -> IndexDb {
    if !ctx.database.exists() {
        eprintln!("Error opening index: no database at {}", ctx.database.display());
        std::process::exit(1);
    }
    match IndexDb::open(&ctx.database) {
        Ok(db) => db,
        Err(e) => {
            eprintln!("Error opening index: {}", e);
            std::process::exit(1);
        }
    }
}

/// Realm url with its trailing slash, as stored in the index.
pub fn realm_url(realm: &str) -> String {
    match RealmPaths::new(realm) {
        Ok(paths) => paths.url().to_string(),
        Err(e) => {
            eprintln!("Invalid realm url '{}': {}", realm, e);
            std::process::exit(2);
        }
    }
}

pub fn resolve_format(output: OutputFormat, json: bool) -> OutputFormat {
    if json { OutputFormat::Json } else { output }
}
