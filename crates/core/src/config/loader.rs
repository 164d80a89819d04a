use crate::config::types::{ConfigFile, LoggingConfig, ResolvedConfig, ResolvedRealm};
use shellexpand::full;
use std::path::{Path, PathBuf};
use std::{env, fs};

use dirs::home_dir;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found at {0}")]
    NotFound(String),

    #[error("failed to read config file {0}: {1}")]
    ReadError(String, #[source] std::io::Error),

    #[error("failed to parse TOML in {0}: {1}")]
    ParseError(String, #[source] toml::de::Error),

    #[error("version {0} is unsupported (expected 1)")]
    BadVersion(u32),

    #[error("realm url '{0}' is not a valid url")]
    BadRealmUrl(String),

    #[error("home directory not available to expand '~'")]
    NoHome,
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn load(config_path: Option<&Path>) -> Result<ResolvedConfig, ConfigError> {
        let path = match config_path {
            Some(p) => p.to_path_buf(),
            None => default_config_path(),
        };

        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }

        let s = fs::read_to_string(&path)
            .map_err(|e| ConfigError::ReadError(path.display().to_string(), e))?;

        let cf: ConfigFile = toml::from_str(&s)
            .map_err(|e| ConfigError::ParseError(path.display().to_string(), e))?;

        Self::resolve(cf)
    }

    fn resolve(cf: ConfigFile) -> Result<ResolvedConfig, ConfigError> {
        if cf.version != 1 {
            return Err(ConfigError::BadVersion(cf.version));
        }

        let database = expand_path(&cf.database)?;

        let realms = cf
            .realms
            .iter()
            .map(|realm| {
                let url = crate::paths::RealmPaths::new(&realm.url)
                    .map_err(|_| ConfigError::BadRealmUrl(realm.url.clone()))?;
                Ok(ResolvedRealm { url: url.url().to_string(), root: expand_path(&realm.root)? })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        // Resolve log file path if present
        let logging = match cf.logging.file {
            Some(ref file) => LoggingConfig {
                file: Some(expand_path(&file.to_string_lossy())?),
                ..cf.logging.clone()
            },
            None => cf.logging.clone(),
        };

        Ok(ResolvedConfig {
            database,
            indexing: cf.indexing,
            query: cf.query,
            logging,
            realms,
        })
    }
}

pub fn default_config_path() -> PathBuf {
    if let Ok(xdg) = env::var("XDG_CONFIG_HOME") {
        return Path::new(&xdg).join("realm-index").join("config.toml");
    }
    let home = home_dir().unwrap_or_else(|| PathBuf::from("~"));
    home.join(".config").join("realm-index").join("config.toml")
}

fn expand_path(input: &str) -> Result<PathBuf, ConfigError> {
    let expanded = full(input).map_err(|_| ConfigError::NoHome)?;
    Ok(PathBuf::from(expanded.to_string()))
}
