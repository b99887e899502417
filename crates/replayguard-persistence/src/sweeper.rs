//! Background expiry sweeper.
//!
//! Backends without native TTL eviction accumulate expired rows; the
//! sweeper deletes them on a fixed interval. Protocol correctness never
//! depends on it running: expired entries are already invisible to `get`
//! and lock acquisition. A failed sweep is logged and retried on the next
//! tick.

use async_trait::async_trait;
use replayguard_types::StoreResult;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Space reclamation hook implemented by each backend.
#[async_trait]
pub trait ExpirySweep: Send + Sync {
    /// Delete expired records and locks; returns the number removed.
    async fn sweep_expired(&self) -> StoreResult<u64>;
}

/// Periodic sweep task with graceful shutdown.
pub struct ExpirySweeper {
    handle: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    shutdown: Arc<AtomicBool>,
}

impl ExpirySweeper {
    /// Spawn the sweep loop; the first sweep runs after one full interval.
    pub fn spawn(target: Arc<dyn ExpirySweep>, interval: Duration) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));

        let task_shutdown = shutdown.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if task_shutdown.load(Ordering::Relaxed) {
                    break;
                }

                match target.sweep_expired().await {
                    Ok(removed) => {
                        debug!(removed = removed, "Expiry sweep completed");
                    }
                    Err(e) => {
                        warn!(error = %e, category = e.category(), "Expiry sweep failed; retrying next tick");
                    }
                }
            }
        });

        Self {
            handle: tokio::sync::Mutex::new(Some(handle)),
            shutdown,
        }
    }

    /// Stop the loop, aborting the interval sleep.
    pub async fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);

        let mut guard = self.handle.lock().await;
        if let Some(handle) = guard.take() {
            handle.abort();
            let _ = handle.await;
        }
    }
}

impl Drop for ExpirySweeper {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use replayguard_types::StoreError;
    use std::sync::atomic::AtomicU64;

    struct CountingSweep {
        calls: AtomicU64,
        fail: bool,
    }

    #[async_trait]
    impl ExpirySweep for CountingSweep {
        async fn sweep_expired(&self) -> StoreResult<u64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(StoreError::unavailable("backend down"))
            } else {
                Ok(3)
            }
        }
    }

    #[tokio::test]
    async fn test_sweeper_ticks_and_shuts_down() {
        let target = Arc::new(CountingSweep {
            calls: AtomicU64::new(0),
            fail: false,
        });

        let sweeper = ExpirySweeper::spawn(target.clone(), Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(90)).await;
        sweeper.shutdown().await;

        let ticks = target.calls.load(Ordering::SeqCst);
        assert!(ticks >= 2, "expected at least two ticks, got {}", ticks);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(target.calls.load(Ordering::SeqCst), ticks);
    }

    #[tokio::test]
    async fn test_sweeper_survives_failures() {
        let target = Arc::new(CountingSweep {
            calls: AtomicU64::new(0),
            fail: true,
        });

        let sweeper = ExpirySweeper::spawn(target.clone(), Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(90)).await;
        sweeper.shutdown().await;

        assert!(target.calls.load(Ordering::SeqCst) >= 2);
    }
}
