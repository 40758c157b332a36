//! The blocking half of `DistributedMutex::lock`, entered once the first
//! claim has failed.
//!
//! The wait listens for release notifications and polls the store from a
//! background task at the same time, racing both against one deadline-bound
//! scope derived from the caller's token. Each round owns exactly one poll
//! task; the task is stopped and joined before the round ends, whatever ends
//! it, so a claim it made is never lost and it never outlives the wait. If the
//! wait itself is dropped mid-round, a claim the task still lands is released.

use super::backoff::Backoff;
use super::mutex::{AcquiredVia, Acquisition, DistributedMutex, UNLOCK_MESSAGE};
use super::options::SubscribeFailurePolicy;
use crate::cancel::{CancellationToken, DropGuard};
use crate::error::{LockError, Result};
use crate::store::{LockStore, Subscription};
use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// How a poll task finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PollOutcome {
    /// A poll claimed the lock.
    Acquired,
    /// Every poll in the budget found the lock held.
    Exhausted,
    /// Told to stop before claiming.
    Cancelled,
}

/// What woke the waiting side of a round.
enum Wake {
    PollFinished(std::result::Result<PollOutcome, JoinError>),
    Released,
    ScopeEnded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handoff {
    Pending,
    Claimed,
    Abandoned,
}

/// Ownership of a poll task's claim, shared between the task and its wait.
#[derive(Clone)]
struct ClaimSlot {
    state: Arc<Mutex<Handoff>>,
    store: Arc<dyn LockStore>,
    key: String,
    value: String,
}

impl ClaimSlot {
    fn new(store: Arc<dyn LockStore>, key: &str, value: &str) -> Self {
        Self {
            state: Arc::new(Mutex::new(Handoff::Pending)),
            store,
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    /// Records a claim. False when the wait is already gone.
    fn claimed(&self) -> bool {
        let mut state = self.state.lock();
        if *state == Handoff::Abandoned {
            return false;
        }
        *state = Handoff::Claimed;
        true
    }

    /// Marks the wait gone. True when a claim was already recorded and is now orphaned.
    fn abandon(&self) -> bool {
        let mut state = self.state.lock();
        let orphaned = *state == Handoff::Claimed;
        *state = Handoff::Abandoned;
        orphaned
    }

    /// Undoes a claim nobody will hold, then wakes other waiters.
    async fn release_orphan(&self) {
        match self.store.compare_and_delete(&self.key, &self.value).await {
            Ok(0) => {}
            Ok(_) => {
                debug!("Released claim on {} left by a dropped wait", self.key);
                if let Err(e) = self.store.publish(&self.key, UNLOCK_MESSAGE).await {
                    warn!("Failed to notify waiters of {}: {}", self.key, e);
                }
            }
            Err(e) => warn!(
                "Failed to release orphaned claim on {}, it expires with its TTL: {}",
                self.key, e
            ),
        }
    }
}

/// Held by a wait while it may still collect its poll task's outcome.
/// Dropping it armed marks the wait abandoned.
struct AbandonGuard {
    slot: Option<ClaimSlot>,
}

impl AbandonGuard {
    fn new(slot: ClaimSlot) -> Self {
        Self { slot: Some(slot) }
    }

    fn disarm(mut self) {
        self.slot = None;
    }
}

impl Drop for AbandonGuard {
    fn drop(&mut self) {
        let Some(slot) = self.slot.take() else {
            return;
        };
        if !slot.abandon() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move { slot.release_orphan().await });
            }
            Err(_) => warn!(
                "No runtime to release orphaned claim on {}, it expires with its TTL",
                slot.key
            ),
        }
    }
}

/// Everything one poll task needs, owned so the task can be spawned.
struct PollRound {
    slot: ClaimSlot,
    expiry: Duration,
    tries: u32,
    backoff: Backoff,
}

pub(super) async fn wait_for_release(
    mutex: &DistributedMutex,
    value: &str,
    ambient: &CancellationToken,
    started: Instant,
) -> Result<Acquisition> {
    let key = mutex.key();
    let options = mutex.options();

    // Patience covers the subscribe handshake too.
    let scope = ambient.child_with_timeout(options.patience);

    let mut subscription = match scope.run_until_cancelled(mutex.store().subscribe(key)).await {
        None => return Err(mutex.stopped(&scope, started)),
        Some(Ok(subscription)) => Some(subscription),
        Some(Err(source)) => match options.on_subscribe_failure {
            SubscribeFailurePolicy::Fail => {
                return Err(LockError::Subscribe {
                    key: key.to_string(),
                    source,
                })
            }
            SubscribeFailurePolicy::PollOnly => {
                warn!(
                    "Cannot subscribe to release notifications for {}, waiting by polling only: {}",
                    key, source
                );
                None
            }
        },
    };
    let mut degraded = subscription.is_none();

    let acquired = |via: AcquiredVia, degraded: bool| {
        debug!("Lock acquired: {} (via {:?})", key, via);
        Acquisition::new(key, value, via, degraded, started.elapsed())
    };

    loop {
        let stand_down = scope.child();
        let slot = ClaimSlot::new(Arc::clone(mutex.store()), key, value);
        let mut poller = tokio::spawn(poll_for_claim(
            PollRound {
                slot: slot.clone(),
                expiry: options.expiry,
                tries: options.tries,
                backoff: options.backoff.clone(),
            },
            stand_down.clone(),
        ));
        let stop_poller = stand_down.drop_guard();
        let abandon = AbandonGuard::new(slot);

        let wake = loop {
            let woke = tokio::select! {
                biased;
                joined = &mut poller => Some(Wake::PollFinished(joined)),
                message = next_release(&mut subscription) => message.map(|_| Wake::Released),
                _ = scope.cancelled() => Some(Wake::ScopeEnded),
            };
            match woke {
                Some(wake) => break wake,
                None => {
                    warn!(
                        "Release notifications for {} stopped, waiting by polling only",
                        key
                    );
                    subscription = None;
                    degraded = true;
                }
            }
        };

        match wake {
            Wake::PollFinished(joined) => {
                abandon.disarm();
                match joined.map_err(poll_task_failed)? {
                    PollOutcome::Acquired => return Ok(acquired(AcquiredVia::Poll, degraded)),
                    PollOutcome::Exhausted => {
                        return Err(LockError::TriesExhausted {
                            key: key.to_string(),
                            tries: options.tries,
                        })
                    }
                    PollOutcome::Cancelled => return Err(mutex.stopped(&scope, started)),
                }
            }
            Wake::Released => {
                let outcome = stand_down_and_join(stop_poller, poller, abandon).await?;
                if outcome == PollOutcome::Acquired {
                    return Ok(acquired(AcquiredVia::Poll, degraded));
                }
                trace!("Release of {} observed, claiming", key);
                if mutex.claim(value, &scope, started).await? {
                    return Ok(acquired(AcquiredVia::Notification, degraded));
                }
                debug!("Lost the race for {}, waiting again", key);
            }
            Wake::ScopeEnded => {
                let outcome = stand_down_and_join(stop_poller, poller, abandon).await?;
                if outcome == PollOutcome::Acquired {
                    return Ok(acquired(AcquiredVia::Poll, degraded));
                }
                return Err(mutex.stopped(&scope, started));
            }
        }
    }
}

/// Next release message, or never if there is no subscription.
async fn next_release(subscription: &mut Option<Subscription>) -> Option<String> {
    match subscription {
        Some(subscription) => subscription.next().await,
        None => std::future::pending().await,
    }
}

async fn stand_down_and_join(
    stop: DropGuard,
    poller: JoinHandle<PollOutcome>,
    abandon: AbandonGuard,
) -> Result<PollOutcome> {
    drop(stop);
    let joined = poller.await;
    abandon.disarm();
    joined.map_err(poll_task_failed)
}

fn poll_task_failed(err: JoinError) -> LockError {
    LockError::Other(format!("Lock poll task failed: {}", err))
}

/// Polls for the lock `tries - 1` times, waiting `backoff(i)` before poll `i`.
///
/// A store error on one poll counts as "still held". Stopping is checked
/// between polls only; a claim already sent is allowed to finish, and is
/// released again if the wait was dropped meanwhile.
async fn poll_for_claim(round: PollRound, stop: CancellationToken) -> PollOutcome {
    let slot = &round.slot;
    for attempt in 0..round.tries.saturating_sub(1) {
        let delay = round.backoff.delay(attempt);
        tokio::select! {
            biased;
            _ = stop.cancelled() => return PollOutcome::Cancelled,
            _ = tokio::time::sleep(delay) => {}
        }
        if stop.is_cancelled() {
            return PollOutcome::Cancelled;
        }

        match slot.store.set_nx(&slot.key, &slot.value, round.expiry).await {
            Ok(true) if slot.claimed() => return PollOutcome::Acquired,
            Ok(true) => {
                slot.release_orphan().await;
                return PollOutcome::Cancelled;
            }
            Ok(false) => trace!("Poll {} for {}: still held", attempt + 1, slot.key),
            Err(e) => warn!(
                "Poll {} for {} failed, retrying next interval: {}",
                attempt + 1,
                slot.key,
                e
            ),
        }
    }

    PollOutcome::Exhausted
}
