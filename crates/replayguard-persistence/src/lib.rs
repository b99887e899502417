/*!
# Replayguard Persistence Layer

Multi-process store backends for the replayguard idempotency middleware:
a Redis realization built on atomic `SET NX PX` locks with Lua
compare-and-delete release, and a PostgreSQL realization (feature
`postgres`) that serializes lock contenders through serializable
transactions. A periodic expiry sweeper reclaims space in backends without
native TTL eviction.

## Example Usage

```rust,ignore
use replayguard_persistence::{RedisIdempotencyStore, RedisStoreConfig};
use replayguard_types::IdempotencyStore;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let store = RedisIdempotencyStore::connect(RedisStoreConfig::default()).await?;

    if let Some(handle) = store
        .try_acquire_lock("order-abc", Duration::from_secs(30), Duration::ZERO)
        .await?
    {
        // execute and save, then
        store.release_lock(handle).await?;
    }
    Ok(())
}
```
*/

mod backoff;

pub mod config;
pub mod redis;
pub mod sweeper;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use config::{RedisStoreConfig, SweeperConfig};
pub use redis::RedisIdempotencyStore;
pub use sweeper::{ExpirySweep, ExpirySweeper};

#[cfg(feature = "postgres")]
pub use config::PostgresStoreConfig;
#[cfg(feature = "postgres")]
pub use postgres::PostgresIdempotencyStore;
