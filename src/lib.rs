//! Distributed mutual exclusion over a shared key-value store.
//!
//! A lock is a record claimed with an atomic set-if-absent and a TTL. Waiters
//! listen for release notifications on a pub/sub channel named after the key
//! while polling in the background, so a release is picked up promptly and a
//! lost notification only costs one poll interval.

pub mod cancel;
pub mod error;
pub mod lock;
pub mod store;
pub mod utils;

pub use cancel::{CancelCause, CancellationToken};
pub use error::{LockError, Result, StoreError};
pub use lock::{
    AcquiredVia, Acquisition, Backoff, DistributedMutex, MutexOptions, PsLock,
    SubscribeFailurePolicy,
};
pub use store::{LockStore, MemoryStore, RedisStore, Subscription};
