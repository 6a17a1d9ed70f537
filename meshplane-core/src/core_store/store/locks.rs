/*
    locks.rs - Advisory lock registry

    Callers bracket multi-step business transactions with these locks.
    Store operations never take them implicitly, and they are unrelated
    to the mutex each engine uses to protect its own state.

    - One global mutex
    - One reader/writer lock per account ID, created on first use and
      kept for the life of the process (deleting an account does not
      remove its entry)

    Engines that cannot serve concurrent readers set `shared_reads` to
    false, which turns read acquisition into exclusive acquisition.
*/

use crate::metrics::{StoreMetrics, Timer};
use dashmap::DashMap;
use parking_lot::lock_api::{ArcMutexGuard, ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, RawMutex, RawRwLock, RwLock};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// What a guard is holding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockScope {
    Global,
    AccountRead(String),
    AccountWrite(String),
}

impl fmt::Display for LockScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockScope::Global => write!(f, "global"),
            LockScope::AccountRead(id) => write!(f, "account {} (read)", id),
            LockScope::AccountWrite(id) => write!(f, "account {} (write)", id),
        }
    }
}

/// Guards are only held so dropping them releases the lock
enum Held {
    Global { _guard: ArcMutexGuard<RawMutex, ()> },
    Shared { _guard: ArcRwLockReadGuard<RawRwLock, ()> },
    Exclusive { _guard: ArcRwLockWriteGuard<RawRwLock, ()> },
}

/// An acquired advisory lock.
///
/// Released by calling [`LockGuard::release`] or by dropping the guard,
/// so every exit path of the caller releases it.
pub struct LockGuard {
    held: Option<Held>,
    scope: LockScope,
    acquired_at: Instant,
}

impl LockGuard {
    fn new(held: Held, scope: LockScope) -> Self {
        Self {
            held: Some(held),
            scope,
            acquired_at: Instant::now(),
        }
    }

    pub fn scope(&self) -> &LockScope {
        &self.scope
    }

    /// Whether the guard excludes every other holder of the same lock
    pub fn is_exclusive(&self) -> bool {
        !matches!(self.held, Some(Held::Shared { .. }))
    }

    pub fn release(self) {}
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.held.take().is_some() {
            debug!(
                "released {} lock, held for {:?}",
                self.scope,
                self.acquired_at.elapsed()
            );
        }
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("scope", &self.scope)
            .field("exclusive", &self.is_exclusive())
            .finish()
    }
}

/// Registry of the global lock and the lazily created per-account locks
pub struct LockRegistry {
    global: Arc<Mutex<()>>,
    accounts: DashMap<String, Arc<RwLock<()>>>,
    shared_reads: bool,
    metrics: Option<Arc<dyn StoreMetrics>>,
}

impl LockRegistry {
    pub fn new(shared_reads: bool, metrics: Option<Arc<dyn StoreMetrics>>) -> Self {
        Self {
            global: Arc::new(Mutex::new(())),
            accounts: DashMap::new(),
            shared_reads,
            metrics,
        }
    }

    pub fn acquire_global(&self) -> LockGuard {
        let timer = Timer::start();
        let guard = self.global.lock_arc();
        let waited = timer.elapsed();

        debug!("acquired global lock in {:?}", waited);
        if let Some(metrics) = &self.metrics {
            metrics.count_global_lock_acquisition_duration(waited);
        }

        LockGuard::new(Held::Global { _guard: guard }, LockScope::Global)
    }

    pub fn acquire_account_write(&self, account_id: &str) -> LockGuard {
        let lock = self.account_lock(account_id);
        let timer = Timer::start();
        let guard = lock.write_arc();
        self.report_account_wait(account_id, timer);

        LockGuard::new(
            Held::Exclusive { _guard: guard },
            LockScope::AccountWrite(account_id.to_string()),
        )
    }

    pub fn acquire_account_read(&self, account_id: &str) -> LockGuard {
        let lock = self.account_lock(account_id);
        let timer = Timer::start();
        let held = if self.shared_reads {
            Held::Shared { _guard: lock.read_arc() }
        } else {
            Held::Exclusive { _guard: lock.write_arc() }
        };
        self.report_account_wait(account_id, timer);

        LockGuard::new(held, LockScope::AccountRead(account_id.to_string()))
    }

    /// Number of account IDs that have ever been locked
    pub fn tracked_accounts(&self) -> usize {
        self.accounts.len()
    }

    pub fn shared_reads(&self) -> bool {
        self.shared_reads
    }

    fn account_lock(&self, account_id: &str) -> Arc<RwLock<()>> {
        // The map shard must be released before blocking on the account lock
        self.accounts
            .entry(account_id.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    fn report_account_wait(&self, account_id: &str, timer: Timer) {
        let waited = timer.elapsed();
        debug!("acquired lock for account {} in {:?}", account_id, waited);
        if let Some(metrics) = &self.metrics {
            metrics.count_account_lock_acquisition_duration(waited);
        }
    }
}

impl fmt::Debug for LockRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockRegistry")
            .field("accounts", &self.accounts.len())
            .field("shared_reads", &self.shared_reads)
            .finish()
    }
}
