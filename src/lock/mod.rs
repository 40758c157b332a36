mod acquisition;
mod backoff;
mod mutex;
mod options;

pub use backoff::{Backoff, DelayFn, MAX_RETRY_DELAY, MIN_RETRY_DELAY};
pub use mutex::{
    lock_key, AcquiredVia, Acquisition, DistributedMutex, PsLock, KEY_PREFIX, SENTINEL,
    UNLOCK_MESSAGE,
};
pub use options::{
    MutexOptions, SubscribeFailurePolicy, DEFAULT_EXPIRY, DEFAULT_PATIENCE, DEFAULT_TRIES,
};
