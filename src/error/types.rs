use std::time::Duration;
use thiserror::Error;

/// Failure of a single store command.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Redis(#[from] redis::RedisError),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("Failed to connect to lock store at {url}: {source}")]
    Connect { url: String, source: StoreError },

    #[error("Failed to acquire lock {key}: {source}")]
    Acquire { key: String, source: StoreError },

    #[error("Failed to release lock {key}: {source}")]
    Release { key: String, source: StoreError },

    #[error("Lock {key} was released but the unlock notification was not published: {source}")]
    Publish { key: String, source: StoreError },

    #[error("Failed to subscribe to release notifications for {key}: {source}")]
    Subscribe { key: String, source: StoreError },

    #[error("Failed to acquire lock {key}: timeout after {waited:?}")]
    Timeout { key: String, waited: Duration },

    #[error("Failed to acquire lock {key}: gave up after {tries} tries")]
    TriesExhausted { key: String, tries: u32 },

    #[error("Failed to acquire lock {key}: operation cancelled")]
    Cancelled { key: String },

    #[error("Lock {key} is not held by this acquisition")]
    NotHeld { key: String },

    #[error("Invalid lock configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid duration format '{input}': {message}")]
    InvalidDuration { input: String, message: String },

    #[error("{0}")]
    Other(String),
}

impl LockError {
    pub fn exit_code(&self) -> i32 {
        match self {
            LockError::Timeout { .. } | LockError::TriesExhausted { .. } => 2,
            LockError::Cancelled { .. } => 3,
            _ => 1,
        }
    }

    /// True when the lock could not be obtained within its patience or try budget.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            LockError::Timeout { .. } | LockError::TriesExhausted { .. }
        )
    }

    pub fn timeout(key: impl Into<String>, waited: Duration) -> Self {
        LockError::Timeout {
            key: key.into(),
            waited,
        }
    }

    pub fn cancelled(key: impl Into<String>) -> Self {
        LockError::Cancelled { key: key.into() }
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        LockError::InvalidConfig(message.into())
    }
}

pub type Result<T> = std::result::Result<T, LockError>;
