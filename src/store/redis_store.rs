use super::{LockStore, StoreResult, Subscription};
use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::{Client, Script};
use std::time::Duration;
use tracing::{debug, info};

const COMPARE_AND_DELETE: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

/// Redis-backed store using one multiplexed connection for commands and a
/// dedicated connection per subscription.
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    conn: MultiplexedConnection,
}

impl RedisStore {
    /// Opens a client for `url` and verifies the server answers PING.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = Client::open(url)?;
        let store = Self::from_client(client).await?;
        store.ping().await?;
        info!("Connected to lock store at {}", url);
        Ok(store)
    }

    pub async fn from_client(client: Client) -> StoreResult<Self> {
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self { client, conn })
    }
}

#[async_trait]
impl LockStore for RedisStore {
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        // PX rejects 0; sub-millisecond TTLs round up.
        let ttl_ms = ttl.as_millis().max(1) as u64;

        // SET replies OK when the key was set and nil otherwise.
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;

        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        let removed: u64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(removed)
    }

    async fn compare_and_delete(&self, key: &str, value: &str) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        let removed: u64 = Script::new(COMPARE_AND_DELETE)
            .key(key)
            .arg(value)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed)
    }

    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        let receivers: u64 = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(receivers)
    }

    async fn subscribe(&self, channel: &str) -> StoreResult<Subscription> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        // Resolves once the server has confirmed the SUBSCRIBE.
        pubsub.subscribe(channel).await?;
        debug!("Subscribed to {}", channel);

        let messages = pubsub
            .into_on_message()
            .map(|msg| String::from_utf8_lossy(msg.get_payload_bytes()).into_owned());

        Ok(Subscription::new(channel, messages))
    }

    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}
