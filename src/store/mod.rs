//! Store adapters: the atomic claim, delete and pub/sub commands the lock is built on.

mod memory;
mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

use crate::error::StoreError;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// The commands a lock needs from a shared key-value store.
///
/// Implementations must be safe to call concurrently from many tasks.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Sets `key` to `value` with a `ttl` only if `key` is absent.
    /// Returns whether the key was set.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool>;

    /// Deletes `key`, returning the number of keys removed.
    async fn delete(&self, key: &str) -> StoreResult<u64>;

    /// Deletes `key` only if it currently holds `value`, atomically.
    async fn compare_and_delete(&self, key: &str, value: &str) -> StoreResult<u64>;

    /// Publishes `payload` on `channel`, returning how many subscribers received it.
    /// Delivery is at most once; nothing is persisted.
    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<u64>;

    /// Subscribes to `channel`. Returns only after the subscription is confirmed,
    /// so every message published afterwards is observed.
    async fn subscribe(&self, channel: &str) -> StoreResult<Subscription>;

    async fn ping(&self) -> StoreResult<()>;
}

/// A confirmed subscription yielding message payloads.
///
/// Dropping it unsubscribes.
pub struct Subscription {
    channel: String,
    messages: BoxStream<'static, String>,
}

impl Subscription {
    pub fn new<S>(channel: impl Into<String>, messages: S) -> Self
    where
        S: Stream<Item = String> + Send + 'static,
    {
        Self {
            channel: channel.into(),
            messages: messages.boxed(),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

impl Stream for Subscription {
    type Item = String;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.messages.poll_next_unpin(cx)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}
