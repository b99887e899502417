//! In-memory idempotency store for development, tests, and single-process
//! deployments.
//!
//! Records live in a concurrent map with lazy expiry-on-read. Locks are
//! per-key one-permit semaphores; the permit backing an acquisition is
//! parked under the handle's owner token so the shared release path works.
//! `lock_ttl` is ignored here: process liveness implies lock liveness.

use crate::error::StoreResult;
use crate::ports::store::{IdempotencyStore, LockHandle};
use crate::record::ResponseRecord;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;
use uuid::Uuid;

/// Thread-safe single-process store realization.
#[derive(Clone, Default)]
pub struct MemoryIdempotencyStore {
    /// Cached records; expired entries are purged on read
    records: Arc<DashMap<String, ResponseRecord>>,
    /// Per-key mutual exclusion primitives, one permit each
    locks: Arc<DashMap<String, Arc<Semaphore>>>,
    /// Permits held by live acquisitions, keyed by owner token
    permits: Arc<DashMap<Uuid, OwnedSemaphorePermit>>,
}

impl MemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (possibly expired, not yet purged) records.
    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    /// Number of per-key lock primitives currently allocated.
    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }

    /// Remove expired records and reap idle lock primitives.
    ///
    /// A primitive is reaped only when it is unheld, no waiter references
    /// it, and no live record remains for its key; churned keys otherwise
    /// grow the lock map without bound.
    pub fn sweep(&self) -> usize {
        let now = Utc::now();
        let before = self.records.len() + self.locks.len();

        self.records.retain(|_, record| !record.is_expired(now));
        self.locks.retain(|key, semaphore| {
            let held = semaphore.available_permits() == 0;
            let referenced = Arc::strong_count(semaphore) > 1;
            held || referenced || self.has_live_record(key, now)
        });

        let reaped = before - (self.records.len() + self.locks.len());
        if reaped > 0 {
            debug!(reaped = reaped, "Swept in-memory idempotency state");
        }
        reaped
    }

    fn has_live_record(&self, key: &str, now: chrono::DateTime<Utc>) -> bool {
        self.records
            .get(key)
            .map(|record| !record.is_expired(now))
            .unwrap_or(false)
    }

    /// Drop the lock primitive for one key if nothing can still need it.
    fn reap_lock_if_idle(&self, key: &str) {
        if self.has_live_record(key, Utc::now()) {
            return;
        }
        self.locks.remove_if(key, |_, semaphore| {
            Arc::strong_count(semaphore) == 1 && semaphore.available_permits() == 1
        });
    }
}

#[async_trait]
impl IdempotencyStore for MemoryIdempotencyStore {
    async fn get(&self, key: &str) -> StoreResult<Option<ResponseRecord>> {
        let now = Utc::now();

        if let Some(entry) = self.records.get(key) {
            if entry.is_expired(now) {
                drop(entry);
                self.records.remove(key);
                debug!(key = %key, "Purged expired record on read");
                return Ok(None);
            }
            return Ok(Some(entry.clone()));
        }

        Ok(None)
    }

    async fn save(&self, key: &str, record: &ResponseRecord, ttl: Duration) -> StoreResult<()> {
        let now = Utc::now();
        let mut stored = record.clone();
        stored.expires_at =
            now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero());

        if let Some(existing) = self.records.get(key) {
            if !existing.is_expired(now) {
                stored.created_at = existing.created_at;
            }
        }

        self.records.insert(key.to_string(), stored);
        Ok(())
    }

    async fn try_acquire_lock(
        &self,
        key: &str,
        lock_ttl: Duration,
        wait_budget: Duration,
    ) -> StoreResult<Option<LockHandle>> {
        let semaphore = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone();

        let permit = if wait_budget.is_zero() {
            semaphore.try_acquire_owned().ok()
        } else {
            match tokio::time::timeout(wait_budget, semaphore.acquire_owned()).await {
                Ok(acquired) => acquired.ok(),
                Err(_) => None,
            }
        };

        match permit {
            Some(permit) => {
                let handle = LockHandle::new(key, lock_ttl);
                self.permits.insert(handle.owner, permit);
                Ok(Some(handle))
            }
            None => {
                debug!(key = %key, "Lock contended");
                Ok(None)
            }
        }
    }

    async fn release_lock(&self, handle: LockHandle) -> StoreResult<()> {
        // Dropping the parked permit frees the semaphore; unknown owners
        // (double release, fail-open fallback handles) are a no-op.
        self.permits.remove(&handle.owner);
        self.reap_lock_if_idle(&handle.key);
        Ok(())
    }
}
