use super::{LockStore, StoreResult, Subscription};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;

const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug)]
struct Record {
    value: String,
    expires_at: Instant,
}

impl Record {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

#[derive(Debug, Default)]
struct Inner {
    records: Mutex<HashMap<String, Record>>,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

/// In-process store with TTL expiry and broadcast pub/sub.
///
/// Clones share the same records and channels, so several lock handles in one
/// process can contend through it exactly as they would through a server.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of `key`, ignoring expired records.
    pub fn get(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        self.inner
            .records
            .lock()
            .get(key)
            .filter(|record| record.is_live(now))
            .map(|record| record.value.clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Remaining TTL of `key`.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.inner
            .records
            .lock()
            .get(key)
            .filter(|record| record.is_live(now))
            .map(|record| record.expires_at.saturating_duration_since(now))
    }

    /// Number of live subscriptions on `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        let mut channels = self.inner.channels.lock();
        let count = channels
            .get(channel)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0);
        if count == 0 {
            channels.remove(channel);
        }
        count
    }
}

#[async_trait]
impl LockStore for MemoryStore {
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let now = Instant::now();
        let mut records = self.inner.records.lock();
        if records.get(key).is_some_and(|record| record.is_live(now)) {
            return Ok(false);
        }
        records.insert(
            key.to_string(),
            Record {
                value: value.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> StoreResult<u64> {
        let now = Instant::now();
        let removed = self.inner.records.lock().remove(key);
        Ok(removed.filter(|record| record.is_live(now)).map_or(0, |_| 1))
    }

    async fn compare_and_delete(&self, key: &str, value: &str) -> StoreResult<u64> {
        let now = Instant::now();
        let mut records = self.inner.records.lock();
        let matches = records
            .get(key)
            .is_some_and(|record| record.is_live(now) && record.value == value);
        if !matches {
            return Ok(0);
        }
        records.remove(key);
        Ok(1)
    }

    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<u64> {
        let mut channels = self.inner.channels.lock();
        let delivered = channels
            .get(channel)
            .and_then(|sender| sender.send(payload.to_string()).ok())
            .unwrap_or(0);
        // A failed send means every subscriber is gone.
        if delivered == 0 {
            channels.remove(channel);
        }
        Ok(delivered as u64)
    }

    async fn subscribe(&self, channel: &str) -> StoreResult<Subscription> {
        let receiver = self
            .inner
            .channels
            .lock()
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe();

        // Lagged receivers skip what they missed, like a slow pub/sub client.
        let messages =
            BroadcastStream::new(receiver).filter_map(|msg| futures::future::ready(msg.ok()));
        Ok(Subscription::new(channel, messages))
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_nx_only_when_absent() {
        let store = MemoryStore::new();
        assert!(store.set_nx("k", "a", Duration::from_secs(1)).await.unwrap());
        assert!(!store.set_nx("k", "b", Duration::from_secs(1)).await.unwrap());
        assert_eq!(store.get("k").as_deref(), Some("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_records_expire() {
        let store = MemoryStore::new();
        store.set_nx("k", "a", Duration::from_millis(100)).await.unwrap();

        tokio::time::advance(Duration::from_millis(101)).await;

        assert!(!store.contains("k"));
        assert_eq!(store.delete("k").await.unwrap(), 0);
        assert!(store.set_nx("k", "b", Duration::from_millis(100)).await.unwrap());
    }

    #[tokio::test]
    async fn test_compare_and_delete_checks_value() {
        let store = MemoryStore::new();
        store.set_nx("k", "mine", Duration::from_secs(1)).await.unwrap();

        assert_eq!(store.compare_and_delete("k", "theirs").await.unwrap(), 0);
        assert!(store.contains("k"));
        assert_eq!(store.compare_and_delete("k", "mine").await.unwrap(), 1);
        assert!(!store.contains("k"));
    }

    #[tokio::test]
    async fn test_publish_reaches_confirmed_subscribers() {
        let store = MemoryStore::new();
        assert_eq!(store.publish("c", "early").await.unwrap(), 0);

        let mut sub = store.subscribe("c").await.unwrap();
        assert_eq!(store.subscriber_count("c"), 1);
        assert_eq!(store.publish("c", "unlock").await.unwrap(), 1);
        assert_eq!(sub.next().await.as_deref(), Some("unlock"));

        drop(sub);
        assert_eq!(store.subscriber_count("c"), 0);
    }

    #[tokio::test]
    async fn test_channels_without_subscribers_are_dropped() {
        let store = MemoryStore::new();
        let first = store.subscribe("a").await.unwrap();
        let second = store.subscribe("b").await.unwrap();
        assert_eq!(store.inner.channels.lock().len(), 2);

        drop(first);
        assert_eq!(store.publish("a", "unlock").await.unwrap(), 0);
        assert!(!store.inner.channels.lock().contains_key("a"));

        drop(second);
        assert_eq!(store.subscriber_count("b"), 0);
        assert!(store.inner.channels.lock().is_empty());

        let mut again = store.subscribe("a").await.unwrap();
        assert_eq!(store.publish("a", "unlock").await.unwrap(), 1);
        assert_eq!(again.next().await.as_deref(), Some("unlock"));
    }
}
