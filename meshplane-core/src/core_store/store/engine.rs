/*
    engine.rs - The store contract shared by both engines

    Request handlers and session management only see `dyn Store`.
    Which engine is behind it is chosen once at startup and is only
    observable through `store_engine()`.
*/

use super::errors::{StoreError, StoreResult};
use super::locks::LockGuard;
use crate::core_store::model::{Account, Peer, PeerStatus, Timestamp, User};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Backing engine kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StoreEngine {
    /// Whole store held in memory and written to one JSON file
    #[serde(rename = "jsonfile")]
    JsonFile,

    /// Normalized SQLite database
    #[serde(rename = "sqlite")]
    Sqlite,
}

impl StoreEngine {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreEngine::JsonFile => "jsonfile",
            StoreEngine::Sqlite => "sqlite",
        }
    }
}

impl Default for StoreEngine {
    fn default() -> Self {
        StoreEngine::JsonFile
    }
}

impl fmt::Display for StoreEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StoreEngine {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "jsonfile" | "json" => Ok(StoreEngine::JsonFile),
            "sqlite" => Ok(StoreEngine::Sqlite),
            other => Err(StoreError::InvalidArgument(format!(
                "unknown store engine '{}'",
                other
            ))),
        }
    }
}

/// Persistence contract for account state.
///
/// Every returned aggregate is an independent copy; mutating it never
/// affects the store. Absence is always reported as `NotFound`.
pub trait Store: Send + Sync {
    /// Take the global advisory lock
    fn acquire_global_lock(&self) -> LockGuard;

    /// Take the advisory lock of one account exclusively
    fn acquire_account_write_lock(&self, account_id: &str) -> LockGuard;

    /// Take the advisory lock of one account for reading.
    /// Exclusive on engines without concurrent readers.
    fn acquire_account_read_lock(&self, account_id: &str) -> LockGuard;

    /// Replace the whole aggregate and every index entry derived from it
    fn save_account(&self, account: &Account) -> StoreResult<()>;

    /// Remove the aggregate and every index entry that points at it
    fn delete_account(&self, account: &Account) -> StoreResult<()>;

    fn get_account(&self, account_id: &str) -> StoreResult<Account>;

    fn get_all_accounts(&self) -> StoreResult<Vec<Account>>;

    fn get_account_by_user(&self, user_id: &str) -> StoreResult<Account>;

    fn get_account_by_peer_id(&self, peer_id: &str) -> StoreResult<Account>;

    fn get_account_by_peer_pub_key(&self, peer_key: &str) -> StoreResult<Account>;

    /// Resolve the owning account ID without loading the aggregate
    fn get_account_id_by_peer_pub_key(&self, peer_key: &str) -> StoreResult<String>;

    /// Case-insensitive on the setup key
    fn get_account_by_setup_key(&self, setup_key: &str) -> StoreResult<Account>;

    /// Only primary accounts of a private domain are reachable. Case-insensitive.
    fn get_account_by_private_domain(&self, domain: &str) -> StoreResult<Account>;

    fn get_token_id_by_hashed_token(&self, hashed_token: &str) -> StoreResult<String>;

    fn get_user_by_token_id(&self, token_id: &str) -> StoreResult<User>;

    fn save_peer_status(&self, account_id: &str, peer_id: &str, status: PeerStatus) -> StoreResult<()>;

    /// Update only the location of `peer`, matched by its ID
    fn save_peer_location(&self, account_id: &str, peer: &Peer) -> StoreResult<()>;

    fn save_user_last_login(&self, account_id: &str, user_id: &str, last_login: Timestamp) -> StoreResult<()>;

    fn save_installation_id(&self, installation_id: &str) -> StoreResult<()>;

    /// Empty string when no installation ID has been saved
    fn get_installation_id(&self) -> StoreResult<String>;

    fn delete_hashed_pat2token_id_index(&self, hashed_token: &str) -> StoreResult<()>;

    fn delete_token_id2user_id_index(&self, token_id: &str) -> StoreResult<()>;

    /// Flush and release resources. The store must not be used afterwards.
    fn close(&self) -> StoreResult<()>;

    fn store_engine(&self) -> StoreEngine;
}
