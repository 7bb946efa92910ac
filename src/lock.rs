//! Table-wide mutex over the allocation store.
//!
//! The lock is a single sentinel record created with an atomic
//! create-if-absent. Contenders back off exponentially; a sentinel whose
//! expiration has passed is reclaimed instead of waited on, so a crashed
//! holder cannot wedge every later caller.

use crate::error::AllocationError;
use crate::models::{LockRecord, LOCK_KEY};
use crate::store::{AllocationStore, StoreError};
use async_trait::async_trait;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(60);
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(5);
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 1.5;
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(60);
/// Floor for each backoff step, so a zero setting still reaches `max_wait`.
pub const MIN_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("failed to obtain lock after backing off {waited:?}")]
    Timeout { waited: Duration },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Timing of lock acquisition.
#[derive(Debug, Clone, PartialEq)]
pub struct LockSettings {
    /// Lifetime written into each sentinel.
    pub ttl: Duration,
    pub initial_backoff: Duration,
    pub backoff_multiplier: f64,
    /// Give up once the summed backoff exceeds this.
    pub max_wait: Duration,
}

impl Default for LockSettings {
    fn default() -> Self {
        LockSettings {
            ttl: DEFAULT_LOCK_TTL,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            max_wait: DEFAULT_MAX_WAIT,
        }
    }
}

/// Storage for the sentinel.
///
/// `create` and `reclaim` are conditional writes reporting
/// [`StoreError::ConditionalCheckFailed`] when the precondition fails.
#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Create the sentinel iff none exists.
    async fn create(&self, sentinel: &LockRecord) -> Result<(), StoreError>;

    async fn current(&self) -> Result<Option<LockRecord>, StoreError>;

    /// Replace `expired` with `sentinel` iff the stored sentinel is still `expired`.
    async fn reclaim(&self, expired: &LockRecord, sentinel: &LockRecord) -> Result<(), StoreError>;

    /// Delete the sentinel; absent is not an error.
    async fn remove(&self) -> Result<(), StoreError>;
}

/// Sentinel kept in an [`AllocationStore`] under [`LOCK_KEY`].
pub struct StoreLock {
    store: Arc<dyn AllocationStore>,
}

impl StoreLock {
    pub fn new(store: Arc<dyn AllocationStore>) -> Self {
        StoreLock { store }
    }
}

#[async_trait]
impl LockBackend for StoreLock {
    async fn create(&self, sentinel: &LockRecord) -> Result<(), StoreError> {
        self.store.put_lock_if_absent(sentinel).await
    }

    async fn current(&self) -> Result<Option<LockRecord>, StoreError> {
        self.store.get_lock().await
    }

    async fn reclaim(&self, expired: &LockRecord, sentinel: &LockRecord) -> Result<(), StoreError> {
        self.store.replace_lock(expired, sentinel).await
    }

    async fn remove(&self) -> Result<(), StoreError> {
        self.store.delete_if_exists(LOCK_KEY).await
    }
}

/// In-process sentinel, for tests and single-process use.
#[derive(Debug, Default)]
pub struct LocalLock {
    held: Mutex<Option<LockRecord>>,
}

impl LocalLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start out held by `sentinel`, e.g. to simulate a crashed holder.
    pub fn held_by(sentinel: LockRecord) -> Self {
        LocalLock {
            held: Mutex::new(Some(sentinel)),
        }
    }

    fn slot(&self) -> Result<std::sync::MutexGuard<'_, Option<LockRecord>>, StoreError> {
        self.held
            .lock()
            .map_err(|e| StoreError::Backend(format!("lock mutex poisoned: {e}")))
    }
}

#[async_trait]
impl LockBackend for LocalLock {
    async fn create(&self, sentinel: &LockRecord) -> Result<(), StoreError> {
        let mut slot = self.slot()?;
        if slot.is_some() {
            return Err(StoreError::ConditionalCheckFailed(LOCK_KEY.to_string()));
        }
        *slot = Some(sentinel.clone());
        Ok(())
    }

    async fn current(&self) -> Result<Option<LockRecord>, StoreError> {
        Ok(self.slot()?.clone())
    }

    async fn reclaim(&self, expired: &LockRecord, sentinel: &LockRecord) -> Result<(), StoreError> {
        let mut slot = self.slot()?;
        if slot.as_ref() != Some(expired) {
            return Err(StoreError::ConditionalCheckFailed(LOCK_KEY.to_string()));
        }
        *slot = Some(sentinel.clone());
        Ok(())
    }

    async fn remove(&self) -> Result<(), StoreError> {
        *self.slot()? = None;
        Ok(())
    }
}

/// Fleet-wide mutex; no fairness, no reentrancy.
#[derive(Clone)]
pub struct DistributedLock {
    backend: Arc<dyn LockBackend>,
    settings: LockSettings,
}

impl DistributedLock {
    pub fn new(backend: Arc<dyn LockBackend>, settings: LockSettings) -> Self {
        DistributedLock { backend, settings }
    }

    /// Lock kept as a sentinel record in `store`.
    pub fn on_store(store: Arc<dyn AllocationStore>, settings: LockSettings) -> Self {
        Self::new(Arc::new(StoreLock::new(store)), settings)
    }

    pub fn settings(&self) -> &LockSettings {
        &self.settings
    }

    /// Obtain the lock, waiting with exponential backoff while it is held.
    pub async fn acquire(&self) -> Result<(), LockError> {
        log::info!("Attempting to obtain CIDR table lock");
        let ttl_secs = self.settings.ttl.as_secs() as i64;
        let mut backoff = self.settings.initial_backoff.max(MIN_BACKOFF);
        let mut waited = Duration::ZERO;

        loop {
            let sentinel = LockRecord::expiring_in(ttl_secs);
            match self.backend.create(&sentinel).await {
                Ok(()) => {
                    log::info!("Lock obtained. Expiry time {}", sentinel.lock_expiration);
                    return Ok(());
                }
                Err(e) if e.is_conditional_check_failed() => {}
                Err(e) => return Err(e.into()),
            }

            match self.backend.current().await? {
                // Released since our create; try again straight away
                None => continue,
                Some(held) if held.is_expired() => {
                    log::warn!(
                        "Lock expired at {}, reclaiming abandoned lock",
                        held.lock_expiration
                    );
                    match self.backend.reclaim(&held, &sentinel).await {
                        Ok(()) => {
                            log::info!("Lock reclaimed. Expiry time {}", sentinel.lock_expiration);
                            return Ok(());
                        }
                        // Another contender reclaimed it first
                        Err(e) if e.is_conditional_check_failed() => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                Some(held) => {
                    log::debug!("Lock held until {}", held.lock_expiration);
                }
            }

            if waited > self.settings.max_wait {
                log::error!("Failed to obtain lock after backing off {waited:?}");
                return Err(LockError::Timeout { waited });
            }
            log::info!("Failed to obtain lock. Retrying after {backoff:?}");
            tokio::time::sleep(backoff).await;
            waited += backoff;
            backoff = backoff
                .mul_f64(self.settings.backoff_multiplier)
                .max(MIN_BACKOFF);
        }
    }

    /// Delete the sentinel. Never fails; errors are logged.
    pub async fn release(&self) {
        log::info!("Attempting to clear CIDR table lock");
        match self.backend.remove().await {
            Ok(()) => log::info!("Successfully cleared CIDR table lock"),
            Err(e) => log::error!("Failed to clear CIDR table lock: {e}"),
        }
    }

    /// Run `work` while holding the lock.
    ///
    /// The lock is released however `work` ends, panics included; a panic
    /// surfaces as [`AllocationError::Unexpected`].
    pub async fn run_locked<T, F>(&self, work: F) -> Result<T, AllocationError>
    where
        F: Future<Output = Result<T, AllocationError>> + Send,
    {
        self.acquire().await?;
        let outcome = AssertUnwindSafe(work).catch_unwind().await;
        self.release().await;

        match outcome {
            Ok(result) => result,
            Err(panic) => {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "panic while holding CIDR table lock".to_string());
                log::error!("Error: {msg}");
                Err(AllocationError::Unexpected(msg))
            }
        }
    }
}
