/*
    factory.rs - Engine selection at startup
*/

use super::engine::{Store, StoreEngine};
use super::errors::StoreResult;
use super::file_store::{FileStore, STORE_FILE_NAME};
use super::sql_store::{SqlOptions, SqlStore, SQLITE_FILE_NAME};
use crate::config::StoreConfig;
use crate::metrics::StoreMetrics;
use std::env;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Environment variable consulted when no engine is configured
pub const STORE_ENGINE_ENV: &str = "MESHPLANE_STORE_ENGINE";

/// Engine already present in `data_dir`, if any. SQLite wins when both exist.
pub fn detect_engine(data_dir: &Path) -> Option<StoreEngine> {
    if data_dir.join(SQLITE_FILE_NAME).exists() {
        Some(StoreEngine::Sqlite)
    } else if data_dir.join(STORE_FILE_NAME).exists() {
        Some(StoreEngine::JsonFile)
    } else {
        None
    }
}

/// Pick the engine: configuration, then environment, then what is on disk,
/// then the default.
pub fn resolve_engine(config: &StoreConfig) -> StoreEngine {
    if let Some(engine) = config.engine {
        return engine;
    }

    if let Ok(value) = env::var(STORE_ENGINE_ENV) {
        match value.parse() {
            Ok(engine) => return engine,
            Err(e) => warn!("ignoring {}: {}", STORE_ENGINE_ENV, e),
        }
    }

    if let Some(engine) = detect_engine(&config.data_dir) {
        return engine;
    }

    StoreEngine::default()
}

/// Open the store described by `config`
pub fn open_store(config: &StoreConfig, metrics: Option<Arc<dyn StoreMetrics>>) -> StoreResult<Box<dyn Store>> {
    let engine = resolve_engine(config);
    info!("using {} store engine in {}", engine, config.data_dir.display());

    match engine {
        StoreEngine::JsonFile => Ok(Box::new(FileStore::new(&config.data_dir, metrics)?)),
        StoreEngine::Sqlite => {
            let mut options = SqlOptions {
                busy_timeout: config.busy_timeout,
                ..Default::default()
            };
            if let Some(max_open_conns) = config.max_open_conns {
                options.max_open_conns = max_open_conns;
            }
            Ok(Box::new(SqlStore::with_options(&config.data_dir, options, metrics)?))
        }
    }
}

/// Open the JSON file store in `data_dir` and, for the SQLite engine,
/// load its contents into a database next to it.
pub fn open_store_from_json(
    data_dir: impl AsRef<Path>,
    engine: StoreEngine,
    metrics: Option<Arc<dyn StoreMetrics>>,
) -> StoreResult<Box<dyn Store>> {
    let data_dir = data_dir.as_ref();
    let file_store = FileStore::new(data_dir, metrics.clone())?;

    match engine {
        StoreEngine::JsonFile => Ok(Box::new(file_store)),
        StoreEngine::Sqlite => Ok(Box::new(SqlStore::from_file_store(&file_store, data_dir, metrics)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::fixtures::TestAccountBuilder;
    use tempfile::tempdir;

    fn config_for(dir: &Path, engine: Option<StoreEngine>) -> StoreConfig {
        StoreConfig {
            engine,
            data_dir: dir.to_path_buf(),
            ..Default::default()
        }
    }

    #[test]
    fn test_explicit_engine_wins() {
        let dir = tempdir().unwrap();
        FileStore::new(dir.path(), None).unwrap();

        let config = config_for(dir.path(), Some(StoreEngine::Sqlite));
        assert_eq!(resolve_engine(&config), StoreEngine::Sqlite);
    }

    #[test]
    fn test_detects_engine_from_data_dir() {
        let dir = tempdir().unwrap();
        assert_eq!(detect_engine(dir.path()), None);

        SqlStore::new(dir.path(), None).unwrap();
        assert_eq!(detect_engine(dir.path()), Some(StoreEngine::Sqlite));
    }

    #[test]
    fn test_open_store_uses_configured_engine() {
        let dir = tempdir().unwrap();
        let store = open_store(&config_for(dir.path(), Some(StoreEngine::Sqlite)), None).unwrap();
        assert_eq!(store.store_engine(), StoreEngine::Sqlite);
        assert!(dir.path().join(SQLITE_FILE_NAME).exists());
    }

    #[test]
    fn test_open_store_from_json_imports() {
        let dir = tempdir().unwrap();
        {
            let file_store = FileStore::new(dir.path(), None).unwrap();
            file_store.save_account(&TestAccountBuilder::new("acc1").build()).unwrap();
            file_store.save_installation_id("install-1").unwrap();
        }

        let store = open_store_from_json(dir.path(), StoreEngine::Sqlite, None).unwrap();
        assert_eq!(store.store_engine(), StoreEngine::Sqlite);
        assert_eq!(store.get_account("acc1").unwrap().id, "acc1");
        assert_eq!(store.get_installation_id().unwrap(), "install-1");
    }
}
