/*
    Store subsystem - Persistence of account state

    Two engines implement the same `Store` contract: a JSON file store
    with in-memory indices and a normalized SQLite store.
*/

pub mod convert;
pub mod engine;
pub mod errors;
pub mod factory;
mod file_migration;
pub mod file_store;
pub mod locks;
pub mod sql_migrations;
mod sql_schema;
pub mod sql_store;

pub use convert::copy_accounts;
pub use engine::{Store, StoreEngine};
pub use errors::*;
pub use factory::{detect_engine, open_store, open_store_from_json, resolve_engine, STORE_ENGINE_ENV};
pub use file_migration::MigrationReport;
pub use file_store::{FileStore, STORE_FILE_NAME};
pub use locks::{LockGuard, LockRegistry, LockScope};
pub use sql_store::{SqlOptions, SqlStore, SQLITE_FILE_NAME};
