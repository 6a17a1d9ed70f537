/*
    convert.rs - Moving account state between engines

    Used for offline engine switches. The source is read through the
    store contract, so any engine can feed any other.
*/

use super::engine::Store;
use super::errors::StoreResult;
use super::file_store::FileStore;
use super::sql_store::SqlStore;
use crate::metrics::StoreMetrics;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Save every account of `from` into `to` and carry the installation ID over.
///
/// Returns the number of accounts copied.
pub fn copy_accounts(from: &dyn Store, to: &dyn Store) -> StoreResult<usize> {
    let accounts = from.get_all_accounts()?;
    for account in &accounts {
        to.save_account(account)?;
    }

    let installation_id = from.get_installation_id()?;
    if !installation_id.is_empty() {
        to.save_installation_id(&installation_id)?;
    }

    info!(
        "copied {} accounts from {} store to {} store",
        accounts.len(),
        from.store_engine(),
        to.store_engine()
    );
    Ok(accounts.len())
}

impl SqlStore {
    /// Create a SQLite store in `data_dir` holding everything in `file_store`
    pub fn from_file_store(
        file_store: &FileStore,
        data_dir: impl AsRef<Path>,
        metrics: Option<Arc<dyn StoreMetrics>>,
    ) -> StoreResult<Self> {
        let store = SqlStore::new(data_dir, metrics)?;
        copy_accounts(file_store, &store)?;
        Ok(store)
    }
}

impl FileStore {
    /// Create a file store in `data_dir` holding everything in `sql_store`.
    ///
    /// Any accounts already in the target file are replaced.
    pub fn from_sql_store(
        sql_store: &SqlStore,
        data_dir: impl AsRef<Path>,
        metrics: Option<Arc<dyn StoreMetrics>>,
    ) -> StoreResult<Self> {
        let store = FileStore::new(data_dir, metrics)?;
        store.import(sql_store.get_all_accounts()?, sql_store.get_installation_id()?)?;
        info!("imported sqlite store into {}", store.path().display());
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_store::model::UserRole;
    use crate::test_utils::fixtures::TestAccountBuilder;
    use tempfile::tempdir;

    #[test]
    fn test_file_to_sql_and_back() {
        let file_dir = tempdir().unwrap();
        let sql_dir = tempdir().unwrap();
        let back_dir = tempdir().unwrap();

        let file_store = FileStore::new(file_dir.path(), None).unwrap();
        let account = TestAccountBuilder::new("acc1")
            .with_peer("p1", "key1")
            .with_user("u1", UserRole::Owner)
            .with_setup_key("sk1", "SETUP-1")
            .build();
        file_store.save_account(&account).unwrap();
        file_store.save_installation_id("install-1").unwrap();

        let sql_store = SqlStore::from_file_store(&file_store, sql_dir.path(), None).unwrap();
        assert_eq!(sql_store.get_account("acc1").unwrap(), account);
        assert_eq!(sql_store.get_installation_id().unwrap(), "install-1");

        let back = FileStore::from_sql_store(&sql_store, back_dir.path(), None).unwrap();
        assert_eq!(back.get_account("acc1").unwrap(), account);
        assert_eq!(back.get_account_by_setup_key("setup-1").unwrap().id, "acc1");
        assert_eq!(back.get_installation_id().unwrap(), "install-1");
    }

    #[test]
    fn test_copy_counts_accounts() {
        let from_dir = tempdir().unwrap();
        let to_dir = tempdir().unwrap();
        let from = FileStore::new(from_dir.path(), None).unwrap();
        let to = FileStore::new(to_dir.path(), None).unwrap();

        for id in ["a", "b", "c"] {
            from.save_account(&TestAccountBuilder::new(id).build()).unwrap();
        }

        assert_eq!(copy_accounts(&from, &to).unwrap(), 3);
        assert_eq!(to.get_all_accounts().unwrap().len(), 3);
        assert_eq!(to.get_installation_id().unwrap(), "");
    }
}
