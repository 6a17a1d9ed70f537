//! Account state persistence for the meshplane management service.
//!
//! The [`Store`] trait is the only surface request handlers see. It is
//! implemented by a JSON file engine ([`FileStore`]) and a SQLite engine
//! ([`SqlStore`]); [`open_store`] picks one from configuration.

pub mod config;
pub mod core_store;
pub mod logging;
pub mod metrics;
pub mod test_utils;

pub use config::{Config, StoreConfig};
pub use core_store::model;
pub use core_store::store::{
    copy_accounts, open_store, open_store_from_json, FileStore, LockGuard, SqlStore, Store,
    StoreEngine, StoreError, StoreResult,
};
pub use logging::{init_logging, LogLevel};
pub use crate::metrics::{MetricsCollector, MetricsRecorder, StoreMetrics};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_exports() {
        let _ = LogLevel::Info;
        assert_eq!(StoreEngine::default(), StoreEngine::JsonFile);
    }
}
