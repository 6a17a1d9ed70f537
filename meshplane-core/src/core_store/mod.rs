/*
    core_store - Persistent account state for the management service

    Holds the account aggregate model and the storage engines behind the
    `Store` contract:
    - Data model (accounts, peers, users, groups, policies, routes)
    - JSON file engine with in-memory indices
    - SQLite engine with versioned and automatic schema migrations
    - Per-account advisory locking
*/

pub mod model;
pub mod store;

#[cfg(test)]
mod tests;

// Re-export commonly used types
pub use model::{Account, Peer, Timestamp, User};
pub use store::{open_store, FileStore, SqlStore, Store, StoreEngine, StoreError, StoreResult};
