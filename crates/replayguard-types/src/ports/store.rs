//! Idempotency store port.
//!
//! Backend-agnostic contract between the coordinator and storage. A backend
//! supplies four operations: cache probe, cache upsert with TTL, lock
//! acquisition with a wait budget, and owner-checked lock release. All of
//! them must be safe under concurrent callers across processes.
//!
//! # Example
//!
//! ```rust,ignore
//! use replayguard_types::{IdempotencyStore, MemoryIdempotencyStore};
//! use std::time::Duration;
//!
//! async fn example(store: &dyn IdempotencyStore) -> replayguard_types::StoreResult<()> {
//!     let lock_ttl = Duration::from_secs(30);
//!
//!     match store.try_acquire_lock("order-abc", lock_ttl, Duration::ZERO).await? {
//!         Some(handle) => {
//!             // Winner: execute, save the record, then release
//!             store.release_lock(handle).await?;
//!         }
//!         None => {
//!             // Contended: replay the cache or reject
//!         }
//!     }
//!     Ok(())
//! }
//! ```

use crate::error::StoreResult;
use crate::record::ResponseRecord;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::time::Duration;
use uuid::Uuid;

/// Proof of a successful lock acquisition.
///
/// Carries the per-acquisition owner token; a release only deletes the lock
/// entry whose owner matches. Handles are opaque to the coordinator beyond
/// being threaded from acquire to release.
#[derive(Debug, Clone)]
pub struct LockHandle {
    /// Locked idempotency key
    pub key: String,
    /// Unique owner token for this acquisition
    pub owner: Uuid,
    /// Instant the backend will consider the lock abandoned
    pub expires_at: DateTime<Utc>,
}

impl LockHandle {
    /// Mint a handle with a fresh owner token expiring after `lock_ttl`.
    pub fn new(key: impl Into<String>, lock_ttl: Duration) -> Self {
        Self {
            key: key.into(),
            owner: Uuid::new_v4(),
            expires_at: Utc::now()
                + ChronoDuration::from_std(lock_ttl).unwrap_or(ChronoDuration::zero()),
        }
    }

    /// Check whether the backend may already have reclaimed the lock.
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// Backend contract for the idempotency protocol.
///
/// Implementations must be thread-safe and, for multi-process backends,
/// provide distributed-safe lock semantics: at most one live lock entry per
/// key, takeover of expired entries, owner-checked release.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Return the live record for `key`, or `None` when absent or expired.
    ///
    /// Expired entries may be purged lazily; the call is otherwise free of
    /// observable side effects.
    async fn get(&self, key: &str) -> StoreResult<Option<ResponseRecord>>;

    /// Upsert the record with `expires_at = now + ttl`.
    ///
    /// On update, `created_at` of the stored record is preserved; all other
    /// fields are overwritten. After a successful return, any process must
    /// observe the new record until expiry.
    async fn save(&self, key: &str, record: &ResponseRecord, ttl: Duration) -> StoreResult<()>;

    /// Try to install a lock for `key` with `expires_at = now + lock_ttl`.
    ///
    /// Returns `Some(handle)` when acquired (including takeover of an
    /// expired entry). When a live lock is held by someone else: with a zero
    /// `wait_budget` the call returns `None` immediately; otherwise it polls
    /// with a uniform random [15, 50] ms backoff until acquired or the
    /// budget is spent. At most one contender may acquire per lock epoch.
    async fn try_acquire_lock(
        &self,
        key: &str,
        lock_ttl: Duration,
        wait_budget: Duration,
    ) -> StoreResult<Option<LockHandle>>;

    /// Delete the lock entry iff its owner matches `handle`. Idempotent;
    /// releasing a lock that expired or was taken over is a no-op.
    async fn release_lock(&self, handle: LockHandle) -> StoreResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handles_get_distinct_owners() {
        let a = LockHandle::new("k", Duration::from_secs(30));
        let b = LockHandle::new("k", Duration::from_secs(30));

        assert_ne!(a.owner, b.owner);
        assert_eq!(a.key, "k");
        assert!(!a.is_expired());
    }

    #[test]
    fn test_zero_ttl_handle_is_expired() {
        let handle = LockHandle::new("k", Duration::ZERO);
        assert!(handle.is_expired());
    }
}
