use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::code_ref::CodeRef;
use crate::index::DEFAULT_CHUNK_SIZE;
use crate::paths::RealmPaths;

#[derive(Debug, Deserialize)]
pub struct ConfigFile {
    pub version: u32,
    pub database: String,
    #[serde(default)]
    pub indexing: IndexingConfig,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub realms: Vec<RealmConfig>,
}

/// A realm served from a directory on disk.
#[derive(Debug, Deserialize, Clone)]
pub struct RealmConfig {
    pub url: String,
    pub root: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexingConfig {
    /// Budget for a single card render, in milliseconds.
    #[serde(default = "default_render_timeout_ms")]
    pub render_timeout_ms: u64,
    /// Bind parameters per bulk invalidation statement.
    #[serde(default = "default_chunk_size")]
    pub invalidation_chunk_size: usize,
}

impl IndexingConfig {
    pub fn render_timeout(&self) -> Duration {
        Duration::from_millis(self.render_timeout_ms)
    }
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            render_timeout_ms: default_render_timeout_ms(),
            invalidation_chunk_size: default_chunk_size(),
        }
    }
}

fn default_render_timeout_ms() -> u64 {
    30_000
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueryConfig {
    #[serde(default = "default_base_card_module")]
    pub base_card_module: String,
    #[serde(default = "default_base_card_name")]
    pub base_card_name: String,
}

impl QueryConfig {
    /// Root card type, used when a filter or sort has no `on`.
    pub fn base_card(&self) -> CodeRef {
        CodeRef::new(&self.base_card_module, &self.base_card_name)
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            base_card_module: default_base_card_module(),
            base_card_name: default_base_card_name(),
        }
    }
}

fn default_base_card_module() -> String {
    "https://cardstack.com/base/card-api".to_string()
}

fn default_base_card_name() -> String {
    "CardDef".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub file_level: Option<String>,
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level(), file_level: None, file: None }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone)]
pub struct ResolvedRealm {
    pub url: String,
    pub root: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub database: PathBuf,
    pub indexing: IndexingConfig,
    pub query: QueryConfig,
    pub logging: LoggingConfig,
    pub realms: Vec<ResolvedRealm>,
}

impl ResolvedConfig {
    /// Configured realm for `url`, with or without its trailing slash.
    pub fn realm(&self, url: &str) -> Option<&ResolvedRealm> {
        let url = RealmPaths::new(url).ok()?;
        self.realms.iter().find(|realm| realm.url == url.url())
    }
}
