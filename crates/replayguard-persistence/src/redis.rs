//! Redis store backend.
//!
//! Records live at `{namespace}:cache:{key}` as JSON with a server-side
//! TTL; locks live at `{namespace}:lock:{key}` installed with `SET NX PX`
//! and released by a compare-and-delete Lua script that checks the owner
//! token. Takeover of a crashed holder's lock happens implicitly once the
//! TTL deletes the slot.

use crate::backoff::poll_backoff;
use crate::config::RedisStoreConfig;
use crate::sweeper::ExpirySweep;
use async_trait::async_trait;
use chrono::Utc;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, Script};
use replayguard_types::{IdempotencyStore, LockHandle, ResponseRecord, StoreError, StoreResult};
use std::time::{Duration, Instant};
use tracing::debug;

/// Compare-and-delete: drop the lock only while we still own it, so a
/// takeover after our TTL lapse is never clobbered.
const RELEASE_SCRIPT: &str = r#"
    if redis.call("get", KEYS[1]) == ARGV[1] then
        return redis.call("del", KEYS[1])
    else
        return 0
    end
"#;

fn record_key(namespace: &str, key: &str) -> String {
    format!("{}:cache:{}", namespace, key)
}

fn lock_key(namespace: &str, key: &str) -> String {
    format!("{}:lock:{}", namespace, key)
}

fn store_err(err: redis::RedisError) -> StoreError {
    StoreError::unavailable(err.to_string())
}

/// Redis realization of the idempotency store.
pub struct RedisIdempotencyStore {
    connection: MultiplexedConnection,
    namespace: String,
}

impl RedisIdempotencyStore {
    /// Connect to Redis with the given configuration.
    ///
    /// The connect attempt is bounded by `connection_timeout_ms`; an
    /// unreachable host fails instead of hanging.
    pub async fn connect(config: RedisStoreConfig) -> StoreResult<Self> {
        config.validate().map_err(StoreError::corrupted)?;

        let client = Client::open(config.url.as_str()).map_err(store_err)?;
        let connection = tokio::time::timeout(
            Duration::from_millis(config.connection_timeout_ms),
            client.get_multiplexed_tokio_connection(),
        )
        .await
        .map_err(|_| {
            StoreError::unavailable(format!(
                "Redis connect timed out after {}ms",
                config.connection_timeout_ms
            ))
        })?
        .map_err(store_err)?;

        debug!(url = %config.url, namespace = %config.namespace, "Connected Redis idempotency store");

        Ok(Self {
            connection,
            namespace: config.namespace,
        })
    }

    fn conn(&self) -> MultiplexedConnection {
        self.connection.clone()
    }

    async fn fetch_record(&self, cache_key: &str) -> StoreResult<Option<ResponseRecord>> {
        let mut conn = self.conn();
        let bytes: Option<Vec<u8>> = conn.get(cache_key).await.map_err(store_err)?;

        let Some(bytes) = bytes else {
            return Ok(None);
        };

        let record: ResponseRecord = serde_json::from_slice(&bytes)?;

        // The server TTL is authoritative; the field check guards entries
        // written by a clock-skewed process.
        if record.is_expired(Utc::now()) {
            let _: Result<u64, _> = conn.del(cache_key).await;
            debug!(key = %cache_key, "Purged expired record on read");
            return Ok(None);
        }

        Ok(Some(record))
    }
}

#[async_trait]
impl IdempotencyStore for RedisIdempotencyStore {
    async fn get(&self, key: &str) -> StoreResult<Option<ResponseRecord>> {
        self.fetch_record(&record_key(&self.namespace, key)).await
    }

    async fn save(&self, key: &str, record: &ResponseRecord, ttl: Duration) -> StoreResult<()> {
        let cache_key = record_key(&self.namespace, key);
        let now = Utc::now();

        let mut stored = record.clone();
        stored.expires_at =
            now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero());

        // Upserts keep the first-write instant
        if let Some(existing) = self.fetch_record(&cache_key).await? {
            stored.created_at = existing.created_at;
        }

        let bytes = serde_json::to_vec(&stored)?;
        let ttl_ms = ttl.as_millis().max(1) as u64;

        let mut conn = self.conn();
        redis::cmd("SET")
            .arg(&cache_key)
            .arg(bytes)
            .arg("PX")
            .arg(ttl_ms)
            .query_async::<()>(&mut conn)
            .await
            .map_err(store_err)?;

        debug!(key = %cache_key, ttl_ms = ttl_ms, body_bytes = stored.body.len(), "Record stored");
        Ok(())
    }

    async fn try_acquire_lock(
        &self,
        key: &str,
        lock_ttl: Duration,
        wait_budget: Duration,
    ) -> StoreResult<Option<LockHandle>> {
        let lock_key = lock_key(&self.namespace, key);
        let ttl_ms = lock_ttl.as_millis().max(1) as u64;
        let started = Instant::now();

        loop {
            let handle = LockHandle::new(key, lock_ttl);

            let mut conn = self.conn();
            let outcome: Option<String> = redis::cmd("SET")
                .arg(&lock_key)
                .arg(handle.owner.to_string())
                .arg("NX")
                .arg("PX")
                .arg(ttl_ms)
                .query_async(&mut conn)
                .await
                .map_err(store_err)?;

            if outcome.is_some() {
                debug!(key = %lock_key, owner = %handle.owner, "Lock acquired");
                return Ok(Some(handle));
            }

            if started.elapsed() >= wait_budget {
                debug!(key = %lock_key, waited_ms = started.elapsed().as_millis() as u64, "Lock contended");
                return Ok(None);
            }

            tokio::time::sleep(poll_backoff()).await;
        }
    }

    async fn release_lock(&self, handle: LockHandle) -> StoreResult<()> {
        let lock_key = lock_key(&self.namespace, &handle.key);

        let mut conn = self.conn();
        let deleted: i32 = Script::new(RELEASE_SCRIPT)
            .key(&lock_key)
            .arg(handle.owner.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;

        if deleted > 0 {
            debug!(key = %lock_key, owner = %handle.owner, "Lock released");
        } else {
            debug!(key = %lock_key, owner = %handle.owner, "Lock already expired or taken over");
        }

        Ok(())
    }
}

#[async_trait]
impl ExpirySweep for RedisIdempotencyStore {
    async fn sweep_expired(&self) -> StoreResult<u64> {
        // Redis evicts both collections via TTL; nothing to reclaim here.
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_key_format() {
        assert_eq!(record_key("replayguard", "abc"), "replayguard:cache:abc");
    }

    #[test]
    fn test_lock_key_format() {
        assert_eq!(lock_key("replayguard", "abc"), "replayguard:lock:abc");
    }

    #[test]
    fn test_keys_pass_through_verbatim() {
        let hostile = "a?b=c&'; DROP TABLE x; <script>\"";
        assert_eq!(
            record_key("ns", hostile),
            format!("ns:cache:{}", hostile)
        );
    }
}
