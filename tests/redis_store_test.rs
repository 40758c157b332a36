//! Tests against a live Redis server. Run with
//! `PSLOCK_REDIS_URL=redis://127.0.0.1:6379 cargo test -- --ignored`.

use futures::StreamExt;
use pslock::lock::{AcquiredVia, MutexOptions, PsLock};
use pslock::{CancellationToken, LockError, LockStore, RedisStore};
use std::time::Duration;
use uuid::Uuid;

fn redis_url() -> String {
    std::env::var("PSLOCK_REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

fn unique_key() -> String {
    format!("distributed_lock:test-{}", Uuid::new_v4())
}

#[tokio::test]
#[ignore = "requires a Redis server at PSLOCK_REDIS_URL"]
async fn test_set_nx_claims_once_with_ttl() {
    let store = RedisStore::connect(&redis_url()).await.unwrap();
    let key = unique_key();

    assert!(store.set_nx(&key, "a", Duration::from_secs(5)).await.unwrap());
    assert!(!store.set_nx(&key, "b", Duration::from_secs(5)).await.unwrap());

    assert_eq!(store.delete(&key).await.unwrap(), 1);
    assert_eq!(store.delete(&key).await.unwrap(), 0);
}

#[tokio::test]
#[ignore = "requires a Redis server at PSLOCK_REDIS_URL"]
async fn test_records_expire_server_side() {
    let store = RedisStore::connect(&redis_url()).await.unwrap();
    let key = unique_key();

    assert!(store.set_nx(&key, "a", Duration::from_millis(100)).await.unwrap());
    tokio::time::sleep(Duration::from_millis(250)).await;

    assert!(store.set_nx(&key, "b", Duration::from_secs(5)).await.unwrap());
    store.delete(&key).await.unwrap();
}

#[tokio::test]
#[ignore = "requires a Redis server at PSLOCK_REDIS_URL"]
async fn test_compare_and_delete_script_checks_value() {
    let store = RedisStore::connect(&redis_url()).await.unwrap();
    let key = unique_key();
    store.set_nx(&key, "mine", Duration::from_secs(5)).await.unwrap();

    assert_eq!(store.compare_and_delete(&key, "theirs").await.unwrap(), 0);
    assert_eq!(store.compare_and_delete(&key, "mine").await.unwrap(), 1);
    assert_eq!(store.compare_and_delete(&key, "mine").await.unwrap(), 0);
}

#[tokio::test]
#[ignore = "requires a Redis server at PSLOCK_REDIS_URL"]
async fn test_subscription_is_ready_when_returned() {
    let store = RedisStore::connect(&redis_url()).await.unwrap();
    let channel = unique_key();

    let mut subscription = store.subscribe(&channel).await.unwrap();
    // No sleep: a publish right after subscribe must already be delivered.
    assert_eq!(store.publish(&channel, "unlock").await.unwrap(), 1);

    let message = tokio::time::timeout(Duration::from_secs(2), subscription.next())
        .await
        .unwrap();
    assert_eq!(message.as_deref(), Some("unlock"));

    drop(subscription);
}

#[tokio::test]
#[ignore = "requires a Redis server at PSLOCK_REDIS_URL"]
async fn test_waiter_wakes_on_release_over_redis() {
    let locks = PsLock::connect(&redis_url()).await.unwrap();
    let name = format!("test-{}", Uuid::new_v4());
    let options = MutexOptions::new()
        .with_fencing(true)
        .with_retry_delay(Duration::from_secs(2));
    let holder = locks.mutex(&name, options.clone()).unwrap();
    let waiter = locks.mutex(&name, options).unwrap();
    let cancel = CancellationToken::new();

    let held = holder.lock(&cancel).await.unwrap();
    let waiting = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let acquisition = waiter.lock(&cancel).await?;
            waiter.unlock_owned(&acquisition, &cancel).await?;
            Ok::<_, LockError>(acquisition)
        })
    };

    tokio::time::sleep(Duration::from_millis(200)).await;
    holder.unlock_owned(&held, &cancel).await.unwrap();

    let acquisition = waiting.await.unwrap().unwrap();
    assert_eq!(acquisition.via(), AcquiredVia::Notification);
    assert!(acquisition.waited() < Duration::from_secs(1));
}
