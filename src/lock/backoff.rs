use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub const MIN_RETRY_DELAY: Duration = Duration::from_millis(50);
pub const MAX_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Custom delay function, called with the zero-based poll attempt.
pub type DelayFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// Decides how long to wait before each poll attempt.
#[derive(Clone)]
pub enum Backoff {
    /// Uniformly random in `[min, max)`, independent of the attempt.
    /// Spreads contenders out so they don't poll in lockstep.
    Random {
        min: Duration,
        max: Duration,
        rng: Option<Arc<Mutex<StdRng>>>,
    },
    Fixed(Duration),
    Custom(DelayFn),
}

impl Backoff {
    pub fn random(min: Duration, max: Duration) -> Self {
        Backoff::Random {
            min,
            max,
            rng: None,
        }
    }

    /// Random backoff drawn from a seeded generator, for reproducible runs.
    pub fn seeded(min: Duration, max: Duration, seed: u64) -> Self {
        Backoff::Random {
            min,
            max,
            rng: Some(Arc::new(Mutex::new(StdRng::seed_from_u64(seed)))),
        }
    }

    pub fn fixed(delay: Duration) -> Self {
        Backoff::Fixed(delay)
    }

    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(u32) -> Duration + Send + Sync + 'static,
    {
        Backoff::Custom(Arc::new(f))
    }

    /// Delay to wait before poll attempt `attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            Backoff::Random { min, max, rng } => {
                let (lo, hi) = (min.as_millis() as u64, max.as_millis() as u64);
                if hi <= lo {
                    return *min;
                }
                let millis = match rng {
                    Some(rng) => rng.lock().gen_range(lo..hi),
                    None => rand::thread_rng().gen_range(lo..hi),
                };
                Duration::from_millis(millis)
            }
            Backoff::Fixed(delay) => *delay,
            Backoff::Custom(f) => f(attempt),
        }
    }

    /// Longest delay this policy can produce, when it is known.
    pub fn max_delay(&self) -> Option<Duration> {
        match self {
            Backoff::Random { min, max, .. } => Some((*max).max(*min)),
            Backoff::Fixed(delay) => Some(*delay),
            Backoff::Custom(_) => None,
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::random(MIN_RETRY_DELAY, MAX_RETRY_DELAY)
    }
}

impl fmt::Debug for Backoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backoff::Random { min, max, rng } => f
                .debug_struct("Random")
                .field("min", min)
                .field("max", max)
                .field("seeded", &rng.is_some())
                .finish(),
            Backoff::Fixed(delay) => f.debug_tuple("Fixed").field(delay).finish(),
            Backoff::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}
