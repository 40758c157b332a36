use super::backoff::Backoff;
use crate::error::{LockError, Result};
use std::time::Duration;

pub const DEFAULT_EXPIRY: Duration = Duration::from_secs(8);
pub const DEFAULT_PATIENCE: Duration = Duration::from_secs(8);
pub const DEFAULT_TRIES: u32 = 32;

/// What a blocked acquisition does when it cannot subscribe to release
/// notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubscribeFailurePolicy {
    /// Keep waiting by polling alone; the acquisition is marked degraded.
    #[default]
    PollOnly,
    /// Fail the acquisition with `LockError::Subscribe`.
    Fail,
}

/// Settings for a distributed mutex. Validated once when the mutex is created.
#[derive(Debug, Clone)]
pub struct MutexOptions {
    /// Diagnostic name; defaults to the lock name.
    pub name: Option<String>,
    /// TTL of the lock record.
    pub expiry: Duration,
    /// Longest a blocked acquisition waits.
    pub patience: Duration,
    /// Attempt budget for one poll round; the round makes `tries - 1` polls.
    pub tries: u32,
    pub backoff: Backoff,
    /// Write a unique token per acquisition instead of the shared sentinel.
    pub fencing: bool,
    pub on_subscribe_failure: SubscribeFailurePolicy,
}

impl Default for MutexOptions {
    fn default() -> Self {
        Self {
            name: None,
            expiry: DEFAULT_EXPIRY,
            patience: DEFAULT_PATIENCE,
            tries: DEFAULT_TRIES,
            backoff: Backoff::default(),
            fencing: false,
            on_subscribe_failure: SubscribeFailurePolicy::default(),
        }
    }
}

impl MutexOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.expiry = expiry;
        self
    }

    pub fn with_patience(mut self, patience: Duration) -> Self {
        self.patience = patience;
        self
    }

    pub fn with_tries(mut self, tries: u32) -> Self {
        self.tries = tries;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.backoff = Backoff::fixed(delay);
        self
    }

    pub fn with_retry_delay_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(u32) -> Duration + Send + Sync + 'static,
    {
        self.backoff = Backoff::custom(f);
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_fencing(mut self, fencing: bool) -> Self {
        self.fencing = fencing;
        self
    }

    pub fn with_subscribe_failure_policy(mut self, policy: SubscribeFailurePolicy) -> Self {
        self.on_subscribe_failure = policy;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.expiry.is_zero() {
            return Err(LockError::invalid_config("expiry must be greater than zero"));
        }
        if self.patience.is_zero() {
            return Err(LockError::invalid_config("patience must be greater than zero"));
        }
        if self.tries == 0 {
            return Err(LockError::invalid_config("tries must be at least 1"));
        }
        if let Backoff::Random { min, max, .. } = &self.backoff {
            if min > max {
                return Err(LockError::invalid_config(format!(
                    "retry delay range is inverted: {:?} > {:?}",
                    min, max
                )));
            }
        }
        if matches!(&self.name, Some(name) if name.trim().is_empty()) {
            return Err(LockError::invalid_config("name must not be blank"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = MutexOptions::default();
        assert_eq!(options.expiry, Duration::from_secs(8));
        assert_eq!(options.patience, Duration::from_secs(8));
        assert_eq!(options.tries, 32);
        assert!(!options.fencing);
        assert_eq!(options.on_subscribe_failure, SubscribeFailurePolicy::PollOnly);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_builder_overrides() {
        let options = MutexOptions::new()
            .with_name("worker-1")
            .with_expiry(Duration::from_secs(3))
            .with_tries(5)
            .with_retry_delay(Duration::from_millis(100));

        assert_eq!(options.name.as_deref(), Some("worker-1"));
        assert_eq!(options.expiry, Duration::from_secs(3));
        assert_eq!(options.tries, 5);
        assert_eq!(options.backoff.delay(0), Duration::from_millis(100));
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let zero_expiry = MutexOptions::new().with_expiry(Duration::ZERO);
        assert!(matches!(
            zero_expiry.validate(),
            Err(LockError::InvalidConfig(_))
        ));

        let zero_patience = MutexOptions::new().with_patience(Duration::ZERO);
        assert!(zero_patience.validate().is_err());

        let zero_tries = MutexOptions::new().with_tries(0);
        assert!(zero_tries.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_range() {
        let options = MutexOptions::new().with_backoff(Backoff::random(
            Duration::from_millis(300),
            Duration::from_millis(100),
        ));
        assert!(options.validate().is_err());
    }
}
