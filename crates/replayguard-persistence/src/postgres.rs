//! PostgreSQL store backend.
//!
//! Two tables back the store:
//!
//! ```sql
//! CREATE TABLE replayguard_records (
//!     key TEXT PRIMARY KEY,
//!     status_code INT NOT NULL,
//!     headers_json JSONB NOT NULL,
//!     body BYTEA NOT NULL,
//!     created_at TIMESTAMPTZ NOT NULL,
//!     expires_at TIMESTAMPTZ NOT NULL,
//!     payload_hash TEXT
//! );
//! CREATE TABLE replayguard_locks (
//!     key TEXT PRIMARY KEY,
//!     owner_id UUID NOT NULL,
//!     expires_at TIMESTAMPTZ NOT NULL
//! );
//! ```
//!
//! Lock contenders serialize through a SERIALIZABLE transaction; weaker
//! isolation would let two contenders both observe "no live lock" and both
//! install one. Unique-violation, serialization, and deadlock failures
//! count as contention losses and feed the poll backoff.

use crate::backoff::poll_backoff;
use crate::config::PostgresStoreConfig;
use crate::sweeper::ExpirySweep;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use replayguard_types::{IdempotencyStore, LockHandle, ResponseRecord, StoreError, StoreResult};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::{Duration, Instant};
use tracing::{debug, instrument};
use uuid::Uuid;

const SCHEMA_STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS replayguard_records (
        key TEXT PRIMARY KEY,
        status_code INT NOT NULL,
        headers_json JSONB NOT NULL,
        body BYTEA NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        expires_at TIMESTAMPTZ NOT NULL,
        payload_hash TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_replayguard_records_expires_at
        ON replayguard_records (expires_at)",
    "CREATE TABLE IF NOT EXISTS replayguard_locks (
        key TEXT PRIMARY KEY,
        owner_id UUID NOT NULL,
        expires_at TIMESTAMPTZ NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_replayguard_locks_expires_at
        ON replayguard_locks (expires_at)",
];

fn store_err(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreError::corrupted(err.to_string())
        }
        other => StoreError::unavailable(other.to_string()),
    }
}

/// Unique violation (23505), serialization failure (40001), deadlock (40P01):
/// another contender got there first.
fn is_contention(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => matches!(
            db.code().as_deref(),
            Some("23505") | Some("40001") | Some("40P01")
        ),
        _ => false,
    }
}

enum Attempt {
    Acquired(LockHandle),
    Contended,
    /// A live record appeared while racing for the lock; the caller should
    /// replay the cache instead of executing.
    CacheFilled,
}

/// PostgreSQL realization of the idempotency store.
pub struct PostgresIdempotencyStore {
    pool: PgPool,
}

impl PostgresIdempotencyStore {
    /// Wrap an existing connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect with the given configuration and bootstrap the schema.
    pub async fn connect(config: PostgresStoreConfig) -> StoreResult<Self> {
        config.validate().map_err(StoreError::corrupted)?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await
            .map_err(store_err)?;

        let store = Self::new(pool);
        store.ensure_schema().await?;

        debug!(max_connections = config.max_connections, "Connected Postgres idempotency store");
        Ok(store)
    }

    /// Create both tables and their expiry indexes if absent.
    pub async fn ensure_schema(&self) -> StoreResult<()> {
        for statement in SCHEMA_STATEMENTS {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(store_err)?;
        }
        Ok(())
    }

    async fn attempt_acquire(
        &self,
        key: &str,
        lock_ttl: Duration,
    ) -> Result<Attempt, sqlx::Error> {
        let now = Utc::now();
        let handle = LockHandle::new(key, lock_ttl);

        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;

        let existing: Option<(Uuid, DateTime<Utc>)> =
            sqlx::query_as("SELECT owner_id, expires_at FROM replayguard_locks WHERE key = $1")
                .bind(key)
                .fetch_optional(&mut *tx)
                .await?;

        match existing {
            Some((_, expires_at)) if expires_at >= now => {
                tx.rollback().await?;
                return Ok(Attempt::Contended);
            }
            Some(_) => {
                // Expired holder: take over with a fresh owner
                sqlx::query(
                    "UPDATE replayguard_locks SET owner_id = $2, expires_at = $3 WHERE key = $1",
                )
                .bind(key)
                .bind(handle.owner)
                .bind(handle.expires_at)
                .execute(&mut *tx)
                .await?;
            }
            None => {
                sqlx::query(
                    "INSERT INTO replayguard_locks (key, owner_id, expires_at) VALUES ($1, $2, $3)",
                )
                .bind(key)
                .bind(handle.owner)
                .bind(handle.expires_at)
                .execute(&mut *tx)
                .await?;
            }
        }

        // Another contender may have executed and saved while we raced for
        // the lock; hand the slot back so the caller replays the cache.
        let live: Option<(DateTime<Utc>,)> =
            sqlx::query_as("SELECT expires_at FROM replayguard_records WHERE key = $1")
                .bind(key)
                .fetch_optional(&mut *tx)
                .await?;

        if matches!(live, Some((expires_at,)) if expires_at >= now) {
            sqlx::query("DELETE FROM replayguard_locks WHERE key = $1 AND owner_id = $2")
                .bind(key)
                .bind(handle.owner)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            return Ok(Attempt::CacheFilled);
        }

        tx.commit().await?;
        Ok(Attempt::Acquired(handle))
    }
}

#[async_trait]
impl IdempotencyStore for PostgresIdempotencyStore {
    #[instrument(skip(self), fields(key = %key))]
    async fn get(&self, key: &str) -> StoreResult<Option<ResponseRecord>> {
        type Row = (
            i32,
            serde_json::Value,
            Vec<u8>,
            DateTime<Utc>,
            DateTime<Utc>,
            Option<String>,
        );

        let row: Option<Row> = sqlx::query_as(
            "SELECT status_code, headers_json, body, created_at, expires_at, payload_hash
             FROM replayguard_records WHERE key = $1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;

        let Some((status_code, headers_json, body, created_at, expires_at, payload_hash)) = row
        else {
            return Ok(None);
        };

        if expires_at < Utc::now() {
            // Lazy reclamation; the sweeper handles the rest
            let _ = sqlx::query("DELETE FROM replayguard_records WHERE key = $1 AND expires_at < now()")
                .bind(key)
                .execute(&self.pool)
                .await;
            debug!("Record expired");
            return Ok(None);
        }

        let headers: Vec<(String, Vec<String>)> = serde_json::from_value(headers_json)?;

        Ok(Some(ResponseRecord {
            status_code: status_code as u16,
            headers,
            body,
            created_at,
            expires_at,
            payload_hash,
        }))
    }

    #[instrument(skip(self, record), fields(key = %key, ttl_secs = ttl.as_secs()))]
    async fn save(&self, key: &str, record: &ResponseRecord, ttl: Duration) -> StoreResult<()> {
        let expires_at = Utc::now()
            + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero());
        let headers_json = serde_json::to_value(&record.headers)?;

        // The first-write instant survives upserts over a live row; an
        // expired row not yet swept counts as absent and is re-stamped,
        // matching the lazy-purge backends
        sqlx::query(
            "INSERT INTO replayguard_records
                (key, status_code, headers_json, body, created_at, expires_at, payload_hash)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (key) DO UPDATE SET
                status_code = EXCLUDED.status_code,
                headers_json = EXCLUDED.headers_json,
                body = EXCLUDED.body,
                created_at = CASE
                    WHEN replayguard_records.expires_at < now() THEN EXCLUDED.created_at
                    ELSE replayguard_records.created_at
                END,
                expires_at = EXCLUDED.expires_at,
                payload_hash = EXCLUDED.payload_hash",
        )
        .bind(key)
        .bind(record.status_code as i32)
        .bind(headers_json)
        .bind(&record.body)
        .bind(record.created_at)
        .bind(expires_at)
        .bind(&record.payload_hash)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        debug!(body_bytes = record.body.len(), "Record stored");
        Ok(())
    }

    #[instrument(skip(self), fields(key = %key, wait_budget_ms = wait_budget.as_millis() as u64))]
    async fn try_acquire_lock(
        &self,
        key: &str,
        lock_ttl: Duration,
        wait_budget: Duration,
    ) -> StoreResult<Option<LockHandle>> {
        let started = Instant::now();

        loop {
            match self.attempt_acquire(key, lock_ttl).await {
                Ok(Attempt::Acquired(handle)) => {
                    debug!(owner = %handle.owner, "Lock acquired");
                    return Ok(Some(handle));
                }
                Ok(Attempt::CacheFilled) => {
                    debug!("Live record appeared during acquisition");
                    return Ok(None);
                }
                Ok(Attempt::Contended) => {}
                Err(e) if is_contention(&e) => {
                    debug!(error = %e, "Acquisition lost to a concurrent contender");
                }
                Err(e) => return Err(store_err(e)),
            }

            if started.elapsed() >= wait_budget {
                debug!(waited_ms = started.elapsed().as_millis() as u64, "Lock contended");
                return Ok(None);
            }

            tokio::time::sleep(poll_backoff()).await;
        }
    }

    #[instrument(skip(self, handle), fields(key = %handle.key, owner = %handle.owner))]
    async fn release_lock(&self, handle: LockHandle) -> StoreResult<()> {
        let result =
            sqlx::query("DELETE FROM replayguard_locks WHERE key = $1 AND owner_id = $2")
                .bind(&handle.key)
                .bind(handle.owner)
                .execute(&self.pool)
                .await
                .map_err(store_err)?;

        if result.rows_affected() > 0 {
            debug!("Lock released");
        } else {
            debug!("Lock already expired or taken over");
        }

        Ok(())
    }
}

#[async_trait]
impl ExpirySweep for PostgresIdempotencyStore {
    async fn sweep_expired(&self) -> StoreResult<u64> {
        let records = sqlx::query("DELETE FROM replayguard_records WHERE expires_at < now()")
            .execute(&self.pool)
            .await
            .map_err(store_err)?;

        let locks = sqlx::query("DELETE FROM replayguard_locks WHERE expires_at < now()")
            .execute(&self.pool)
            .await
            .map_err(store_err)?;

        Ok(records.rows_affected() + locks.rows_affected())
    }
}
