pub mod loader;
pub mod types;

pub use loader::{ConfigError, ConfigLoader, default_config_path};
pub use types::{
    ConfigFile, IndexingConfig, LoggingConfig, QueryConfig, RealmConfig, ResolvedConfig,
    ResolvedRealm,
};
