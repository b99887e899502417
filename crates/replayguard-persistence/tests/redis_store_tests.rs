//! Redis store contract tests.
//!
//! These tests need a live Redis server (REPLAYGUARD_REDIS_URL or REDIS_URL,
//! default redis://localhost:6379) and are ignored by default.
//!
//! Run with: `cargo test -p replayguard-persistence --test redis_store_tests -- --ignored`

use replayguard_persistence::{RedisIdempotencyStore, RedisStoreConfig};
use replayguard_types::{IdempotencyStore, LockHandle, ResponseRecord};
use std::time::Duration;
use uuid::Uuid;

async fn store() -> RedisIdempotencyStore {
    RedisIdempotencyStore::connect(RedisStoreConfig::from_env())
        .await
        .expect("redis server available")
}

fn unique_key(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::new_v4())
}

fn record(body: &[u8], ttl: Duration) -> ResponseRecord {
    ResponseRecord::new(
        200,
        vec![("content-type".to_string(), vec!["application/json".to_string()])],
        body.to_vec(),
        ttl,
        Some("aGFzaA==".to_string()),
    )
}

#[tokio::test]
#[ignore]
async fn test_save_then_get_round_trip() {
    let store = store().await;
    let key = unique_key("roundtrip");
    let ttl = Duration::from_secs(60);

    let saved = record(b"{\"tx\":\"T1\"}", ttl);
    store.save(&key, &saved, ttl).await.unwrap();

    let fetched = store.get(&key).await.unwrap().unwrap();
    assert_eq!(fetched.status_code, 200);
    assert_eq!(fetched.body, saved.body);
    assert_eq!(fetched.payload_hash, saved.payload_hash);
    assert_eq!(
        fetched.header_values("Content-Type"),
        Some(&["application/json".to_string()][..])
    );
}

#[tokio::test]
#[ignore]
async fn test_upsert_preserves_created_at() {
    let store = store().await;
    let key = unique_key("upsert");
    let ttl = Duration::from_secs(60);

    store.save(&key, &record(b"one", ttl), ttl).await.unwrap();
    let first = store.get(&key).await.unwrap().unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    store.save(&key, &record(b"two", ttl), ttl).await.unwrap();
    let second = store.get(&key).await.unwrap().unwrap();

    assert_eq!(second.body, b"two");
    assert_eq!(second.created_at, first.created_at);
}

#[tokio::test]
#[ignore]
async fn test_expired_record_is_not_served() {
    let store = store().await;
    let key = unique_key("expiry");
    let ttl = Duration::from_millis(80);

    store.save(&key, &record(b"x", ttl), ttl).await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert!(store.get(&key).await.unwrap().is_none());
}

#[tokio::test]
#[ignore]
async fn test_lock_contention_without_budget() {
    let store = store().await;
    let key = unique_key("lock");
    let ttl = Duration::from_secs(30);

    let held = store
        .try_acquire_lock(&key, ttl, Duration::ZERO)
        .await
        .unwrap();
    assert!(held.is_some());

    let contender = store
        .try_acquire_lock(&key, ttl, Duration::ZERO)
        .await
        .unwrap();
    assert!(contender.is_none());

    store.release_lock(held.unwrap()).await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_lock_wait_budget_wins_after_release() {
    let store = std::sync::Arc::new(store().await);
    let key = unique_key("wait");
    let ttl = Duration::from_secs(30);

    let held = store
        .try_acquire_lock(&key, ttl, Duration::ZERO)
        .await
        .unwrap()
        .unwrap();

    let waiter = {
        let store = store.clone();
        let key = key.clone();
        tokio::spawn(async move {
            store
                .try_acquire_lock(&key, ttl, Duration::from_secs(2))
                .await
                .unwrap()
        })
    };

    tokio::time::sleep(Duration::from_millis(60)).await;
    store.release_lock(held).await.unwrap();

    assert!(waiter.await.unwrap().is_some());
}

#[tokio::test]
#[ignore]
async fn test_expired_lock_is_taken_over() {
    let store = store().await;
    let key = unique_key("takeover");

    let _crashed = store
        .try_acquire_lock(&key, Duration::from_millis(80), Duration::ZERO)
        .await
        .unwrap()
        .unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;

    let successor = store
        .try_acquire_lock(&key, Duration::from_secs(30), Duration::ZERO)
        .await
        .unwrap();
    assert!(successor.is_some());
}

#[tokio::test]
#[ignore]
async fn test_release_ignores_foreign_owner() {
    let store = store().await;
    let key = unique_key("foreign");
    let ttl = Duration::from_secs(30);

    let held = store
        .try_acquire_lock(&key, ttl, Duration::ZERO)
        .await
        .unwrap()
        .unwrap();

    // A handle with a different owner token must not free the lock
    let impostor = LockHandle::new(&key, ttl);
    store.release_lock(impostor).await.unwrap();

    let contender = store
        .try_acquire_lock(&key, ttl, Duration::ZERO)
        .await
        .unwrap();
    assert!(contender.is_none());

    store.release_lock(held).await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_keys_stored_verbatim() {
    let store = store().await;
    let ttl = Duration::from_secs(60);

    let hostile = format!("{}?b=c&'; DROP TABLE x; <script>\"", unique_key("hostile"));
    let long = format!("{}{}", unique_key("long"), "k".repeat(2048));

    for key in [hostile, long] {
        store.save(&key, &record(b"v", ttl), ttl).await.unwrap();
        assert!(store.get(&key).await.unwrap().is_some());
    }
}
