//! Offline store maintenance commands

use anyhow::{bail, Context, Result};
use meshplane_core::core_store::store::{detect_engine, resolve_engine};
use meshplane_core::{FileStore, SqlStore, Store, StoreConfig, StoreEngine};
use serde::Serialize;
use tracing::info;

/// Summary printed by `inspect`
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct StoreSummary {
    pub engine: StoreEngine,
    pub installation_id: String,
    pub accounts: usize,
    pub peers: usize,
    pub users: usize,
}

fn open(config: &StoreConfig) -> Result<Box<dyn Store>> {
    meshplane_core::open_store(config, None)
        .with_context(|| format!("failed to open store in {}", config.data_dir.display()))
}

pub fn inspect(config: &StoreConfig) -> Result<StoreSummary> {
    let store = open(config)?;
    let accounts = store.get_all_accounts()?;

    Ok(StoreSummary {
        engine: store.store_engine(),
        installation_id: store.get_installation_id()?,
        accounts: accounts.len(),
        peers: accounts.iter().map(|a| a.peers.len()).sum(),
        users: accounts.iter().map(|a| a.users.len()).sum(),
    })
}

pub fn show_account(config: &StoreConfig, account_id: &str) -> Result<String> {
    let store = open(config)?;
    let account = store
        .get_account(account_id)
        .with_context(|| format!("account {} could not be loaded", account_id))?;
    Ok(serde_json::to_string_pretty(&account)?)
}

/// Copy the store in the data directory into the other engine, next to it.
/// Returns the number of accounts converted.
pub fn convert(config: &StoreConfig, to: StoreEngine) -> Result<usize> {
    let from = match config.engine {
        Some(engine) => engine,
        None => match detect_engine(&config.data_dir) {
            Some(engine) => engine,
            None => bail!("no store found in {}", config.data_dir.display()),
        },
    };
    if from == to {
        bail!("store in {} already uses the {} engine", config.data_dir.display(), to);
    }

    let converted = match to {
        StoreEngine::Sqlite => {
            let source = FileStore::new(&config.data_dir, None)?;
            let target = SqlStore::from_file_store(&source, &config.data_dir, None)?;
            target.close()?;
            target.get_all_accounts()?.len()
        }
        StoreEngine::JsonFile => {
            let source = SqlStore::new(&config.data_dir, None)?;
            let target = FileStore::from_sql_store(&source, &config.data_dir, None)?;
            target.close()?;
            target.get_all_accounts()?.len()
        }
    };

    info!("converted {} accounts from {} to {}", converted, from, to);
    Ok(converted)
}

/// Create an empty store, optionally stamping the installation ID
pub fn init(config: &StoreConfig, installation_id: Option<&str>) -> Result<StoreEngine> {
    let engine = resolve_engine(config);
    let store = open(&StoreConfig {
        engine: Some(engine),
        ..config.clone()
    })?;

    if let Some(id) = installation_id {
        store.save_installation_id(id)?;
    }
    store.close()?;
    Ok(engine)
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshplane_core::test_utils::fixtures::test_full_account;

    fn config_in(dir: &std::path::Path, engine: Option<StoreEngine>) -> StoreConfig {
        StoreConfig {
            engine,
            data_dir: dir.to_path_buf(),
            max_open_conns: Some(2),
            ..Default::default()
        }
    }

    #[test]
    fn test_init_then_inspect() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path(), Some(StoreEngine::Sqlite));

        assert_eq!(init(&config, Some("install-1")).unwrap(), StoreEngine::Sqlite);

        let summary = inspect(&config_in(dir.path(), None)).unwrap();
        assert_eq!(summary.engine, StoreEngine::Sqlite);
        assert_eq!(summary.installation_id, "install-1");
        assert_eq!(summary.accounts, 0);
    }

    #[test]
    fn test_convert_file_to_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileStore::new(dir.path(), None).unwrap();
            store.save_account(&test_full_account("acc1")).unwrap();
        }

        let config = config_in(dir.path(), None);
        assert_eq!(convert(&config, StoreEngine::Sqlite).unwrap(), 1);

        let summary = inspect(&config_in(dir.path(), Some(StoreEngine::Sqlite))).unwrap();
        assert_eq!(summary.accounts, 1);
        assert_eq!(summary.peers, 2);
        assert_eq!(summary.users, 2);
    }

    #[test]
    fn test_convert_to_same_engine_fails() {
        let dir = tempfile::tempdir().unwrap();
        FileStore::new(dir.path(), None).unwrap();

        assert!(convert(&config_in(dir.path(), None), StoreEngine::JsonFile).is_err());
    }

    #[test]
    fn test_show_missing_account_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path(), Some(StoreEngine::JsonFile));
        init(&config, None).unwrap();

        assert!(show_account(&config, "nope").is_err());
    }
}
