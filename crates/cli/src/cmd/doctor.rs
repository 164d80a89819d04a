use realm_index_core::config::{ConfigLoader, default_config_path};
use std::path::Path;

pub fn run(config: Option<&Path>) {
    match ConfigLoader::load(config) {
        Ok(rc) => {
            println!("OK   realm-index doctor");
            println!(
                "path: {}",
                config.map_or_else(
                    || default_config_path().display().to_string(),
                    |p| p.display().to_string()
                )
            );
            let exists = if rc.database.exists() { "" } else { " (missing)" };
            println!("database: {}{}", rc.database.display(), exists);
            println!("indexing.render_timeout_ms: {}", rc.indexing.render_timeout_ms);
            println!(
                "indexing.invalidation_chunk_size: {}",
                rc.indexing.invalidation_chunk_size
            );
            println!("query.base_card: {}", rc.query.base_card().internal_key());
            println!("logging.level: {}", rc.logging.level);
            if let Some(file) = &rc.logging.file {
                println!("logging.file: {}", file.display());
            }
            for realm in &rc.realms {
                println!("realm: {} -> {}", realm.url, realm.root.display());
            }
        }
        Err(e) => {
            println!("FAIL realm-index doctor");
            println!("{e}");
            if config.is_none() {
                println!("looked for: {}", default_config_path().display());
            }
            std::process::exit(1);
        }
    }
}
