/*
    file_store.rs - JSON file backed store

    The whole account graph lives in memory behind one mutex and is
    written to `store.json` after every full mutation. Only accounts and
    the installation ID are written; the secondary indices are rebuilt
    by the migration pass every time the file is loaded.

    Peer status, peer location and user last-login updates change memory
    only. They become durable with the next full save and may be lost if
    the process dies before that.

    Writes go to a temp file that is synced and renamed over the old file.
*/

use super::engine::{Store, StoreEngine};
use super::errors::{handle_poison, StoreError, StoreResult};
use super::file_migration;
use super::locks::{LockGuard, LockRegistry};
use crate::core_store::model::{Account, Peer, PeerStatus, Timestamp, User};
use crate::metrics::{StoreMetrics, Timer};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// File name of the store inside the data directory
pub const STORE_FILE_NAME: &str = "store.json";

/// On-disk layout
#[derive(Debug, Default, Deserialize)]
struct StoreFile {
    #[serde(default)]
    accounts: HashMap<String, Account>,
    #[serde(default)]
    installation_id: String,
}

#[derive(Serialize)]
struct StoreFileRef<'a> {
    accounts: &'a HashMap<String, Account>,
    installation_id: &'a str,
}

/// Secondary indices kept by the file engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Index {
    SetupKey,
    PeerKey,
    PeerId,
    UserId,
    PrivateDomain,
}

impl Index {
    fn label(&self) -> &'static str {
        match self {
            Index::SetupKey => "setup key",
            Index::PeerKey => "peer key",
            Index::PeerId => "peer ID",
            Index::UserId => "user",
            Index::PrivateDomain => "private domain",
        }
    }

    /// Index keys are stored in this form and lookups normalize the same way
    pub(crate) fn normalize(&self, key: &str) -> String {
        match self {
            Index::SetupKey => key.to_uppercase(),
            Index::PrivateDomain => key.to_lowercase(),
            _ => key.to_string(),
        }
    }

    /// Whether `account` still holds the entity behind `key`
    fn still_owned(&self, account: &Account, key: &str) -> bool {
        match self {
            Index::SetupKey => account.find_setup_key(key).is_some(),
            Index::PeerKey => account.find_peer_by_key(key).is_some(),
            Index::PeerId => account.peers.contains_key(key),
            Index::UserId => account.users.contains_key(key),
            Index::PrivateDomain => {
                account.owns_private_domain() && account.domain.eq_ignore_ascii_case(key)
            }
        }
    }
}

/// Everything the engine mutex protects
#[derive(Debug, Default)]
pub(crate) struct FileState {
    pub(crate) accounts: HashMap<String, Account>,
    pub(crate) setup_key_to_account: HashMap<String, String>,
    pub(crate) peer_key_to_account: HashMap<String, String>,
    pub(crate) peer_id_to_account: HashMap<String, String>,
    pub(crate) user_id_to_account: HashMap<String, String>,
    pub(crate) private_domain_to_account: HashMap<String, String>,
    pub(crate) hashed_pat_to_token_id: HashMap<String, String>,
    pub(crate) token_id_to_user_id: HashMap<String, String>,
    pub(crate) installation_id: String,
}

impl FileState {
    pub(crate) fn index(&self, index: Index) -> &HashMap<String, String> {
        match index {
            Index::SetupKey => &self.setup_key_to_account,
            Index::PeerKey => &self.peer_key_to_account,
            Index::PeerId => &self.peer_id_to_account,
            Index::UserId => &self.user_id_to_account,
            Index::PrivateDomain => &self.private_domain_to_account,
        }
    }

    pub(crate) fn index_mut(&mut self, index: Index) -> &mut HashMap<String, String> {
        match index {
            Index::SetupKey => &mut self.setup_key_to_account,
            Index::PeerKey => &mut self.peer_key_to_account,
            Index::PeerId => &mut self.peer_id_to_account,
            Index::UserId => &mut self.user_id_to_account,
            Index::PrivateDomain => &mut self.private_domain_to_account,
        }
    }

    pub(crate) fn clear_indices(&mut self) {
        self.setup_key_to_account.clear();
        self.peer_key_to_account.clear();
        self.peer_id_to_account.clear();
        self.user_id_to_account.clear();
        self.private_domain_to_account.clear();
        self.hashed_pat_to_token_id.clear();
        self.token_id_to_user_id.clear();
    }

    /// Add every index entry derived from `account`
    pub(crate) fn index_account(&mut self, account: &Account) {
        let id = &account.id;
        for key in account.setup_keys.values().map(|k| &k.key) {
            self.setup_key_to_account
                .insert(Index::SetupKey.normalize(key), id.clone());
        }
        for peer in account.peers.values() {
            if !peer.key.is_empty() {
                self.peer_key_to_account.insert(peer.key.clone(), id.clone());
            }
            if !peer.id.is_empty() {
                self.peer_id_to_account.insert(peer.id.clone(), id.clone());
            }
        }
        for user in account.users.values() {
            self.user_id_to_account.insert(user.id.clone(), id.clone());
            for pat in user.pats.values() {
                self.token_id_to_user_id.insert(pat.id.clone(), user.id.clone());
                self.hashed_pat_to_token_id
                    .insert(pat.hashed_token.clone(), pat.id.clone());
            }
        }
        if account.owns_private_domain() {
            self.private_domain_to_account
                .insert(Index::PrivateDomain.normalize(&account.domain), id.clone());
        }
    }

    /// Remove index entries derived from `account` that still point at it
    fn unindex_account(&mut self, account: &Account) {
        let id = account.id.as_str();
        let drop_if_owned = |map: &mut HashMap<String, String>, key: &str, owner: &str| {
            if map.get(key).map(String::as_str) == Some(owner) {
                map.remove(key);
            }
        };

        for key in account.setup_keys.values().map(|k| &k.key) {
            drop_if_owned(&mut self.setup_key_to_account, &Index::SetupKey.normalize(key), id);
        }
        for peer in account.peers.values() {
            drop_if_owned(&mut self.peer_key_to_account, &peer.key, id);
            drop_if_owned(&mut self.peer_id_to_account, &peer.id, id);
        }
        for user in account.users.values() {
            drop_if_owned(&mut self.user_id_to_account, &user.id, id);
            for pat in user.pats.values() {
                drop_if_owned(&mut self.token_id_to_user_id, &pat.id, &user.id);
                drop_if_owned(&mut self.hashed_pat_to_token_id, &pat.hashed_token, &pat.id);
            }
        }
        if !account.domain.is_empty() {
            drop_if_owned(
                &mut self.private_domain_to_account,
                &Index::PrivateDomain.normalize(&account.domain),
                id,
            );
        }
    }

    /// Resolve an index entry to its account ID, deleting it when stale
    fn resolve(&mut self, index: Index, key: &str) -> StoreResult<String> {
        let normalized = index.normalize(key);
        let account_id = self
            .index(index)
            .get(&normalized)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("{} {} not found", index.label(), key)))?;

        let owned = self
            .accounts
            .get(&account_id)
            .map_or(false, |account| index.still_owned(account, key));

        if !owned {
            self.index_mut(index).remove(&normalized);
            warn!(
                "removed stale {} index entry {} pointing at account {}",
                index.label(),
                key,
                account_id
            );
            return Err(StoreError::NotFound(format!("{} {} not found", index.label(), key)));
        }

        Ok(account_id)
    }

    fn cloned_account(&self, account_id: &str) -> StoreResult<Account> {
        self.accounts
            .get(account_id)
            .cloned()
            .ok_or_else(|| StoreError::account_not_found(account_id))
    }
}

/// Store that keeps every account in memory and writes them to one JSON file
pub struct FileStore {
    path: PathBuf,
    state: Mutex<FileState>,
    locks: LockRegistry,
    metrics: Option<Arc<dyn StoreMetrics>>,
}

impl FileStore {
    /// Open the store in `data_dir`, creating an empty one when no file exists.
    ///
    /// An existing file is migrated and written back before this returns.
    pub fn new(data_dir: impl AsRef<Path>, metrics: Option<Arc<dyn StoreMetrics>>) -> StoreResult<Self> {
        let data_dir = data_dir.as_ref();
        fs::create_dir_all(data_dir)?;
        let path = data_dir.join(STORE_FILE_NAME);

        let state = if path.exists() {
            let data = fs::read(&path)?;
            let file: StoreFile = serde_json::from_slice(&data)?;
            let mut state = FileState {
                accounts: file.accounts,
                installation_id: file.installation_id,
                ..Default::default()
            };
            let report = file_migration::migrate(&mut state);
            info!(
                "loaded {} accounts from {}, migration: {}",
                state.accounts.len(),
                path.display(),
                report
            );
            state
        } else {
            info!("creating new store file at {}", path.display());
            FileState::default()
        };

        let store = Self {
            path,
            state: Mutex::new(state),
            locks: LockRegistry::new(false, metrics.clone()),
            metrics,
        };

        {
            let state = store.lock_state()?;
            store.persist(&state)?;
        }

        Ok(store)
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the contents of this store with everything in `accounts`
    /// and `installation_id`, then write the file once.
    pub(crate) fn import(&self, accounts: Vec<Account>, installation_id: String) -> StoreResult<()> {
        let mut state = self.lock_state()?;
        state.accounts.clear();
        state.clear_indices();
        state.installation_id = installation_id;
        for account in accounts {
            state.index_account(&account);
            state.accounts.insert(account.id.clone(), account);
        }
        self.persist(&state)
    }

    fn lock_state(&self) -> StoreResult<MutexGuard<'_, FileState>> {
        self.state.lock().map_err(handle_poison)
    }

    fn persist(&self, state: &FileState) -> StoreResult<()> {
        let timer = Timer::start();

        let data = serde_json::to_vec(&StoreFileRef {
            accounts: &state.accounts,
            installation_id: &state.installation_id,
        })?;

        let temp_path = self.path.with_extension("json.tmp");
        let mut file = File::create(&temp_path)?;
        file.write_all(&data)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&temp_path, &self.path)?;

        let took = timer.elapsed();
        if let Some(metrics) = &self.metrics {
            metrics.count_persistence_duration(took);
        }
        debug!("took {:?} to persist the file store", took);
        Ok(())
    }
}

impl Store for FileStore {
    fn acquire_global_lock(&self) -> LockGuard {
        self.locks.acquire_global()
    }

    fn acquire_account_write_lock(&self, account_id: &str) -> LockGuard {
        self.locks.acquire_account_write(account_id)
    }

    fn acquire_account_read_lock(&self, account_id: &str) -> LockGuard {
        self.locks.acquire_account_read(account_id)
    }

    fn save_account(&self, account: &Account) -> StoreResult<()> {
        if account.id.is_empty() {
            return Err(StoreError::InvalidArgument("account id should not be empty".to_string()));
        }

        let mut state = self.lock_state()?;
        let mut account = account.clone();
        account.normalize_ids();

        if let Some(previous) = state.accounts.remove(&account.id) {
            state.unindex_account(&previous);
        }
        state.index_account(&account);
        state.accounts.insert(account.id.clone(), account);

        self.persist(&state)
    }

    fn delete_account(&self, account: &Account) -> StoreResult<()> {
        if account.id.is_empty() {
            return Err(StoreError::InvalidArgument("account id should not be empty".to_string()));
        }

        let mut state = self.lock_state()?;
        if let Some(stored) = state.accounts.remove(&account.id) {
            state.unindex_account(&stored);
        }
        state.unindex_account(account);

        let id = account.id.as_str();
        for index in [
            Index::SetupKey,
            Index::PeerKey,
            Index::PeerId,
            Index::UserId,
            Index::PrivateDomain,
        ] {
            state.index_mut(index).retain(|_, owner| owner.as_str() != id);
        }

        self.persist(&state)
    }

    fn get_account(&self, account_id: &str) -> StoreResult<Account> {
        self.lock_state()?.cloned_account(account_id)
    }

    fn get_all_accounts(&self) -> StoreResult<Vec<Account>> {
        let mut accounts: Vec<Account> = self.lock_state()?.accounts.values().cloned().collect();
        accounts.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(accounts)
    }

    fn get_account_by_user(&self, user_id: &str) -> StoreResult<Account> {
        let mut state = self.lock_state()?;
        let account_id = state.resolve(Index::UserId, user_id)?;
        state.cloned_account(&account_id)
    }

    fn get_account_by_peer_id(&self, peer_id: &str) -> StoreResult<Account> {
        let mut state = self.lock_state()?;
        let account_id = state.resolve(Index::PeerId, peer_id)?;
        state.cloned_account(&account_id)
    }

    fn get_account_by_peer_pub_key(&self, peer_key: &str) -> StoreResult<Account> {
        let mut state = self.lock_state()?;
        let account_id = state.resolve(Index::PeerKey, peer_key)?;
        state.cloned_account(&account_id)
    }

    fn get_account_id_by_peer_pub_key(&self, peer_key: &str) -> StoreResult<String> {
        self.lock_state()?.resolve(Index::PeerKey, peer_key)
    }

    fn get_account_by_setup_key(&self, setup_key: &str) -> StoreResult<Account> {
        let mut state = self.lock_state()?;
        let account_id = state.resolve(Index::SetupKey, setup_key)?;
        state.cloned_account(&account_id)
    }

    fn get_account_by_private_domain(&self, domain: &str) -> StoreResult<Account> {
        let mut state = self.lock_state()?;
        let account_id = state.resolve(Index::PrivateDomain, domain)?;
        state.cloned_account(&account_id)
    }

    fn get_token_id_by_hashed_token(&self, hashed_token: &str) -> StoreResult<String> {
        let mut state = self.lock_state()?;
        let not_found = || StoreError::NotFound(format!("hashed token {} not found", hashed_token));

        let token_id = state
            .hashed_pat_to_token_id
            .get(hashed_token)
            .cloned()
            .ok_or_else(not_found)?;

        let live = state.accounts.values().any(|account| {
            account
                .find_user_by_token_id(&token_id)
                .and_then(|user| user.pats.get(&token_id))
                .map_or(false, |pat| pat.hashed_token == hashed_token)
        });

        if !live {
            state.hashed_pat_to_token_id.remove(hashed_token);
            warn!("removed stale hashed token index entry for token {}", token_id);
            return Err(not_found());
        }

        Ok(token_id)
    }

    fn get_user_by_token_id(&self, token_id: &str) -> StoreResult<User> {
        let mut state = self.lock_state()?;
        let not_found = || StoreError::NotFound(format!("token {} not found", token_id));

        let user_id = state
            .token_id_to_user_id
            .get(token_id)
            .cloned()
            .ok_or_else(not_found)?;

        let user = state
            .user_id_to_account
            .get(&user_id)
            .and_then(|account_id| state.accounts.get(account_id))
            .and_then(|account| account.users.get(&user_id))
            .filter(|user| user.pats.contains_key(token_id))
            .cloned();

        match user {
            Some(user) => Ok(user),
            None => {
                state.token_id_to_user_id.remove(token_id);
                warn!("removed stale token index entry {} pointing at user {}", token_id, user_id);
                Err(not_found())
            }
        }
    }

    fn save_peer_status(&self, account_id: &str, peer_id: &str, status: PeerStatus) -> StoreResult<()> {
        let mut state = self.lock_state()?;
        let account = state
            .accounts
            .get_mut(account_id)
            .ok_or_else(|| StoreError::account_not_found(account_id))?;
        let peer = account
            .peers
            .get_mut(peer_id)
            .ok_or_else(|| StoreError::NotFound(format!("peer {} not found", peer_id)))?;

        peer.status = status;
        Ok(())
    }

    fn save_peer_location(&self, account_id: &str, peer: &Peer) -> StoreResult<()> {
        let mut state = self.lock_state()?;
        let account = state
            .accounts
            .get_mut(account_id)
            .ok_or_else(|| StoreError::account_not_found(account_id))?;
        let stored = account
            .peers
            .get_mut(&peer.id)
            .ok_or_else(|| StoreError::NotFound(format!("peer {} not found", peer.id)))?;

        stored.location = peer.location.clone();
        Ok(())
    }

    fn save_user_last_login(&self, account_id: &str, user_id: &str, last_login: Timestamp) -> StoreResult<()> {
        let mut state = self.lock_state()?;
        let account = state
            .accounts
            .get_mut(account_id)
            .ok_or_else(|| StoreError::account_not_found(account_id))?;
        let user = account
            .users
            .get_mut(user_id)
            .ok_or_else(|| StoreError::NotFound(format!("user {} not found", user_id)))?;

        user.last_login = last_login;
        Ok(())
    }

    fn save_installation_id(&self, installation_id: &str) -> StoreResult<()> {
        let mut state = self.lock_state()?;
        state.installation_id = installation_id.to_string();
        self.persist(&state)
    }

    fn get_installation_id(&self) -> StoreResult<String> {
        Ok(self.lock_state()?.installation_id.clone())
    }

    fn delete_hashed_pat2token_id_index(&self, hashed_token: &str) -> StoreResult<()> {
        self.lock_state()?.hashed_pat_to_token_id.remove(hashed_token);
        Ok(())
    }

    fn delete_token_id2user_id_index(&self, token_id: &str) -> StoreResult<()> {
        self.lock_state()?.token_id_to_user_id.remove(token_id);
        Ok(())
    }

    fn close(&self) -> StoreResult<()> {
        let state = self.lock_state()?;
        self.persist(&state)?;
        info!("closed file store {}", self.path.display());
        Ok(())
    }

    fn store_engine(&self) -> StoreEngine {
        StoreEngine::JsonFile
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_store::model::{PersonalAccessToken, UserRole};
    use crate::metrics::MetricsCollector;
    use crate::test_utils::fixtures::TestAccountBuilder;
    use tempfile::tempdir;

    #[test]
    fn test_new_store_creates_file() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path(), None).unwrap();

        assert!(store.path().exists());
        assert!(store.get_all_accounts().unwrap().is_empty());
        assert_eq!(store.get_installation_id().unwrap(), "");
    }

    #[test]
    fn test_file_contains_only_accounts_and_installation_id() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path(), None).unwrap();
        store.save_account(&TestAccountBuilder::new("acc1").with_peer("p1", "key1").build()).unwrap();
        store.save_installation_id("install-1").unwrap();

        let raw: serde_json::Value = serde_json::from_slice(&fs::read(store.path()).unwrap()).unwrap();
        let mut keys: Vec<_> = raw.as_object().unwrap().keys().cloned().collect();
        keys.sort();
        assert_eq!(keys, vec!["accounts".to_string(), "installation_id".to_string()]);
    }

    #[test]
    fn test_partial_updates_are_not_flushed() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path(), None).unwrap();
        store.save_account(&TestAccountBuilder::new("acc1").with_peer("p1", "key1").build()).unwrap();

        let status = PeerStatus {
            connected: true,
            last_seen: Timestamp::from_millis(99),
            login_expired: false,
        };
        store.save_peer_status("acc1", "p1", status.clone()).unwrap();
        assert_eq!(store.get_account("acc1").unwrap().peers["p1"].status, status);

        let on_disk: serde_json::Value = serde_json::from_slice(&fs::read(store.path()).unwrap()).unwrap();
        assert_eq!(on_disk["accounts"]["acc1"]["peers"]["p1"]["status"]["connected"], false);
    }

    #[test]
    fn test_stale_token_entries_self_heal() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path(), None).unwrap();
        let mut account = TestAccountBuilder::new("acc1").with_user("u1", UserRole::Admin).build();
        account.users.get_mut("u1").unwrap().pats.insert(
            "t1".to_string(),
            PersonalAccessToken {
                id: "t1".to_string(),
                user_id: "u1".to_string(),
                hashed_token: "h1".to_string(),
                ..Default::default()
            },
        );
        store.save_account(&account).unwrap();

        // Revoke the token in memory without going through save_account
        {
            let mut state = store.lock_state().unwrap();
            state.accounts.get_mut("acc1").unwrap().users.get_mut("u1").unwrap().pats.clear();
        }

        assert!(store.get_token_id_by_hashed_token("h1").unwrap_err().is_not_found());
        assert!(!store.lock_state().unwrap().hashed_pat_to_token_id.contains_key("h1"));

        assert!(store.get_user_by_token_id("t1").unwrap_err().is_not_found());
        assert!(!store.lock_state().unwrap().token_id_to_user_id.contains_key("t1"));
    }

    #[test]
    fn test_resave_drops_removed_entities_from_indices() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path(), None).unwrap();
        let mut account = TestAccountBuilder::new("acc1")
            .with_peer("p1", "key1")
            .with_setup_key("sk1", "ABC")
            .build();
        store.save_account(&account).unwrap();

        account.peers.clear();
        account.setup_keys.clear();
        store.save_account(&account).unwrap();

        let state = store.lock_state().unwrap();
        assert!(state.peer_id_to_account.is_empty());
        assert!(state.peer_key_to_account.is_empty());
        assert!(state.setup_key_to_account.is_empty());
    }

    #[test]
    fn test_moved_peer_keeps_new_owner() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path(), None).unwrap();
        let mut a = TestAccountBuilder::new("accA").with_peer("p1", "key1").build();
        store.save_account(&a).unwrap();

        let b = TestAccountBuilder::new("accB").with_peer("p1", "key1").build();
        store.save_account(&b).unwrap();

        a.peers.clear();
        store.save_account(&a).unwrap();

        assert_eq!(store.get_account_by_peer_id("p1").unwrap().id, "accB");
    }

    #[test]
    fn test_persistence_reported_to_metrics() {
        let dir = tempdir().unwrap();
        let collector = Arc::new(MetricsCollector::new());
        let store = FileStore::new(dir.path(), Some(collector.clone())).unwrap();
        store.save_account(&TestAccountBuilder::new("acc1").build()).unwrap();

        // One write on open, one on save
        assert_eq!(collector.snapshot().persistence_count, 2);
    }

    #[test]
    fn test_close_flushes_partial_updates() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path(), None).unwrap();
        store.save_account(&TestAccountBuilder::new("acc1").with_user("u1", UserRole::User).build()).unwrap();
        store.save_user_last_login("acc1", "u1", Timestamp::from_millis(1234)).unwrap();
        store.close().unwrap();

        let reopened = FileStore::new(dir.path(), None).unwrap();
        assert_eq!(
            reopened.get_account("acc1").unwrap().users["u1"].last_login,
            Timestamp::from_millis(1234)
        );
    }

    #[test]
    fn test_stale_peer_id_entry_self_heals() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path(), None).unwrap();
        store.save_account(&TestAccountBuilder::new("acc1").with_peer("p1", "key1").build()).unwrap();

        // Drop the peer behind the index's back
        store.lock_state().unwrap().accounts.get_mut("acc1").unwrap().peers.clear();

        assert!(store.get_account_by_peer_id("p1").unwrap_err().is_not_found());
        assert!(!store.lock_state().unwrap().peer_id_to_account.contains_key("p1"));

        // Second lookup misses the index outright
        assert!(store.get_account_by_peer_id("p1").unwrap_err().is_not_found());
    }
}
