use super::acquisition;
use super::options::MutexOptions;
use crate::cancel::{CancelCause, CancellationToken};
use crate::error::{LockError, Result};
use crate::store::{LockStore, RedisStore};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// Prefix mapping a lock name to its store key. The key doubles as the
/// release notification channel.
pub const KEY_PREFIX: &str = "distributed_lock:";

/// Value written by non-fencing locks.
pub const SENTINEL: &str = "1";

/// Payload published when a lock is released.
pub const UNLOCK_MESSAGE: &str = "unlock";

pub fn lock_key(name: &str) -> String {
    format!("{}{}", KEY_PREFIX, name)
}

/// Creates distributed mutexes that share one store.
#[derive(Clone)]
pub struct PsLock {
    store: Arc<dyn LockStore>,
}

impl PsLock {
    pub fn new<S>(store: S) -> Self
    where
        S: LockStore + 'static,
    {
        Self {
            store: Arc::new(store),
        }
    }

    pub fn from_shared(store: Arc<dyn LockStore>) -> Self {
        Self { store }
    }

    /// Connects to a Redis server and checks it is reachable.
    pub async fn connect(url: &str) -> Result<Self> {
        let store = RedisStore::connect(url)
            .await
            .map_err(|source| LockError::Connect {
                url: url.to_string(),
                source,
            })?;
        Ok(Self::new(store))
    }

    /// Returns a mutex for `name`, validating `options`.
    pub fn mutex(&self, name: &str, options: MutexOptions) -> Result<DistributedMutex> {
        if name.is_empty() {
            return Err(LockError::invalid_config("lock name must not be empty"));
        }
        options.validate()?;

        Ok(DistributedMutex {
            store: Arc::clone(&self.store),
            name: options.name.clone().unwrap_or_else(|| name.to_string()),
            key: lock_key(name),
            options,
        })
    }
}

impl fmt::Debug for PsLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PsLock").finish_non_exhaustive()
    }
}

/// How a lock was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquiredVia {
    /// The first claim succeeded; no waiting happened.
    FastPath,
    /// A background poll claimed the lock.
    Poll,
    /// A claim made right after a release notification succeeded.
    Notification,
}

/// A successful lock acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acquisition {
    key: String,
    value: String,
    via: AcquiredVia,
    degraded: bool,
    waited: Duration,
}

impl Acquisition {
    pub(crate) fn new(
        key: &str,
        value: &str,
        via: AcquiredVia,
        degraded: bool,
        waited: Duration,
    ) -> Self {
        Self {
            key: key.to_string(),
            value: value.to_string(),
            via,
            degraded,
            waited,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// The value written to the record: the sentinel, or a fencing token.
    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn via(&self) -> AcquiredVia {
        self.via
    }

    /// True when release notifications were unavailable and only polling was used.
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn waited(&self) -> Duration {
        self.waited
    }
}

/// A named lock over a shared store.
///
/// The handle keeps no ownership state: whether the lock is held lives in the
/// store, and one handle can go through any number of lock/unlock cycles.
pub struct DistributedMutex {
    store: Arc<dyn LockStore>,
    name: String,
    key: String,
    options: MutexOptions,
}

impl DistributedMutex {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn options(&self) -> &MutexOptions {
        &self.options
    }

    pub(crate) fn store(&self) -> &Arc<dyn LockStore> {
        &self.store
    }

    /// Acquires the lock, waiting up to the configured patience.
    ///
    /// Cancelling `cancel` aborts the wait with `LockError::Cancelled`; if it
    /// carries a deadline that passes first, the result is `LockError::Timeout`.
    pub async fn lock(&self, cancel: &CancellationToken) -> Result<Acquisition> {
        let started = Instant::now();
        let value = self.next_value();
        debug!("Acquiring lock: {} (name: {})", self.key, self.name);

        if self.claim(&value, cancel, started).await? {
            debug!("Lock acquired: {}", self.key);
            return Ok(Acquisition::new(
                &self.key,
                &value,
                AcquiredVia::FastPath,
                false,
                started.elapsed(),
            ));
        }

        debug!(
            "Lock {} is held elsewhere, waiting up to {:?}",
            self.key, self.options.patience
        );
        acquisition::wait_for_release(self, &value, cancel, started).await
    }

    /// Makes a single claim without waiting. Returns `None` if the lock is held.
    pub async fn try_lock(&self, cancel: &CancellationToken) -> Result<Option<Acquisition>> {
        let started = Instant::now();
        let value = self.next_value();

        if self.claim(&value, cancel, started).await? {
            debug!("Lock acquired: {}", self.key);
            Ok(Some(Acquisition::new(
                &self.key,
                &value,
                AcquiredVia::FastPath,
                false,
                started.elapsed(),
            )))
        } else {
            Ok(None)
        }
    }

    /// Deletes the lock record and notifies waiters.
    ///
    /// The delete is unconditional: any handle can release the record.
    /// If the notification fails after the delete succeeded, the lock is
    /// already free and `LockError::Publish` is returned.
    pub async fn unlock(&self, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(LockError::cancelled(&self.key));
        }

        let removed = self
            .store
            .delete(&self.key)
            .await
            .map_err(|source| LockError::Release {
                key: self.key.clone(),
                source,
            })?;
        if removed == 0 {
            debug!("Lock {} was not present (expired or released elsewhere)", self.key);
        }

        self.notify_waiters().await
    }

    /// Releases the record only if it still holds the value written by `acquisition`.
    ///
    /// Returns `LockError::NotHeld` when the record expired or belongs to
    /// another acquisition; nothing is published in that case.
    pub async fn unlock_owned(
        &self,
        acquisition: &Acquisition,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if acquisition.key() != self.key {
            return Err(LockError::NotHeld {
                key: self.key.clone(),
            });
        }
        self.unlock_token(acquisition.value(), cancel).await
    }

    /// Like `unlock_owned`, for a record value obtained elsewhere, e.g. a
    /// fencing token handed over by another process.
    pub async fn unlock_token(&self, value: &str, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(LockError::cancelled(&self.key));
        }

        let removed = self
            .store
            .compare_and_delete(&self.key, value)
            .await
            .map_err(|source| LockError::Release {
                key: self.key.clone(),
                source,
            })?;
        if removed == 0 {
            warn!(
                "Lock {} was not released: record expired or is owned by another holder",
                self.key
            );
            return Err(LockError::NotHeld {
                key: self.key.clone(),
            });
        }

        self.notify_waiters().await
    }

    async fn notify_waiters(&self) -> Result<()> {
        let receivers = self
            .store
            .publish(&self.key, UNLOCK_MESSAGE)
            .await
            .map_err(|source| LockError::Publish {
                key: self.key.clone(),
                source,
            })?;
        debug!("Lock released: {} ({} waiters notified)", self.key, receivers);
        Ok(())
    }

    /// One atomic claim attempt. Refuses to start once `cancel` has stopped,
    /// but a claim already sent is always allowed to complete.
    pub(crate) async fn claim(
        &self,
        value: &str,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<bool> {
        if cancel.is_cancelled() {
            return Err(self.stopped(cancel, started));
        }

        self.store
            .set_nx(&self.key, value, self.options.expiry)
            .await
            .map_err(|source| LockError::Acquire {
                key: self.key.clone(),
                source,
            })
    }

    /// The error to report once `token` has stopped a wait.
    pub(crate) fn stopped(&self, token: &CancellationToken, started: Instant) -> LockError {
        match token.cause() {
            Some(CancelCause::DeadlineExceeded) => LockError::timeout(&self.key, started.elapsed()),
            _ => LockError::cancelled(&self.key),
        }
    }

    fn next_value(&self) -> String {
        if self.options.fencing {
            Uuid::new_v4().to_string()
        } else {
            SENTINEL.to_string()
        }
    }
}

impl fmt::Debug for DistributedMutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributedMutex")
            .field("name", &self.name)
            .field("key", &self.key)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::store::{MemoryStore, MockLockStore};

    fn unavailable() -> StoreError {
        StoreError::Unavailable("connection reset".to_string())
    }

    #[test]
    fn test_lock_key_format() {
        assert_eq!(lock_key("orders"), "distributed_lock:orders");
    }

    #[test]
    fn test_mutex_name_defaults_to_lock_name() {
        let locks = PsLock::new(MemoryStore::new());
        let mutex = locks.mutex("orders", MutexOptions::default()).unwrap();
        assert_eq!(mutex.name(), "orders");
        assert_eq!(mutex.key(), "distributed_lock:orders");

        let named = locks
            .mutex("orders", MutexOptions::new().with_name("orders-worker-2"))
            .unwrap();
        assert_eq!(named.name(), "orders-worker-2");
        assert_eq!(named.key(), "distributed_lock:orders");
    }

    #[test]
    fn test_mutex_rejects_invalid_options() {
        let locks = PsLock::new(MemoryStore::new());
        assert!(matches!(
            locks.mutex("orders", MutexOptions::new().with_tries(0)),
            Err(LockError::InvalidConfig(_))
        ));
        assert!(locks.mutex("", MutexOptions::default()).is_err());
    }

    #[tokio::test]
    async fn test_fast_path_error_is_wrapped() {
        let mut store = MockLockStore::new();
        store
            .expect_set_nx()
            .returning(|_, _, _| Err(unavailable()));

        let mutex = PsLock::new(store)
            .mutex("orders", MutexOptions::default())
            .unwrap();
        let err = mutex.lock(&CancellationToken::new()).await.unwrap_err();

        assert!(matches!(
            err,
            LockError::Acquire { ref key, .. } if key == "distributed_lock:orders"
        ));
    }

    #[tokio::test]
    async fn test_unlock_delete_failure_skips_publish() {
        let mut store = MockLockStore::new();
        store.expect_delete().times(1).returning(|_| Err(unavailable()));
        store.expect_publish().never();

        let mutex = PsLock::new(store)
            .mutex("orders", MutexOptions::default())
            .unwrap();
        let err = mutex.unlock(&CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, LockError::Release { .. }));
    }

    #[tokio::test]
    async fn test_unlock_reports_publish_failure_after_delete() {
        let mut store = MockLockStore::new();
        store.expect_delete().times(1).returning(|_| Ok(1));
        store
            .expect_publish()
            .withf(|channel, payload| {
                channel.to_string() == "distributed_lock:orders" && payload.to_string() == "unlock"
            })
            .times(1)
            .returning(|_, _| Err(unavailable()));

        let mutex = PsLock::new(store)
            .mutex("orders", MutexOptions::default())
            .unwrap();
        let err = mutex.unlock(&CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, LockError::Publish { .. }));
    }

    #[tokio::test]
    async fn test_unlock_with_cancelled_token_does_nothing() {
        let mut store = MockLockStore::new();
        store.expect_delete().never();
        store.expect_publish().never();

        let mutex = PsLock::new(store)
            .mutex("orders", MutexOptions::default())
            .unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(matches!(
            mutex.unlock(&cancel).await,
            Err(LockError::Cancelled { .. })
        ));
    }

    #[tokio::test]
    async fn test_fencing_writes_unique_tokens() {
        let store = MemoryStore::new();
        let locks = PsLock::new(store.clone());
        let mutex = locks
            .mutex("orders", MutexOptions::new().with_fencing(true))
            .unwrap();
        let cancel = CancellationToken::new();

        let first = mutex.lock(&cancel).await.unwrap();
        assert_ne!(first.value(), SENTINEL);
        assert_eq!(store.get(mutex.key()).as_deref(), Some(first.value()));
        mutex.unlock_owned(&first, &cancel).await.unwrap();

        let second = mutex.lock(&cancel).await.unwrap();
        assert_ne!(first.value(), second.value());
    }
}
