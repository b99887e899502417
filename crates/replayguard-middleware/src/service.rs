//! Shared middleware state: the injected store, the process-wide options,
//! and the retry/failure-mode wrapper every store call goes through.

use crate::coordinator::idempotency_middleware;
use crate::errors::IdempotencyError;
use axum::routing::MethodRouter;
use axum::Extension;
use replayguard_types::{
    EndpointPolicy, FailureMode, IdempotencyOptions, IdempotencyStore, LockHandle, ResponseRecord,
    StoreError,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Store plus options, cloned into every request via middleware state.
#[derive(Clone)]
pub struct IdempotencyService {
    store: Arc<dyn IdempotencyStore>,
    options: Arc<IdempotencyOptions>,
}

impl IdempotencyService {
    pub fn new(store: Arc<dyn IdempotencyStore>, options: IdempotencyOptions) -> Self {
        Self {
            store,
            options: Arc::new(options),
        }
    }

    pub fn options(&self) -> &IdempotencyOptions {
        &self.options
    }

    /// Wrap one route in the coordinator with its endpoint policy.
    ///
    /// The policy extension is stacked outside the coordinator so the
    /// policy probe sees it on the way in.
    pub fn guard_route<S>(&self, policy: EndpointPolicy, route: MethodRouter<S>) -> MethodRouter<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        route
            .layer::<_, std::convert::Infallible>(axum::middleware::from_fn_with_state(
                self.clone(),
                idempotency_middleware,
            ))
            .layer(Extension(policy))
    }

    /// Run a store call under the retry policy. Transient failures are
    /// retried up to `storage_retry_count` times with a constant delay;
    /// cancellation always propagates untouched.
    async fn with_retry<T, C, Fut>(&self, operation: &str, mut call: C) -> Result<T, StoreError>
    where
        C: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(StoreError::Cancelled) => return Err(StoreError::Cancelled),
                Err(e) if e.is_retryable() && attempt < self.options.storage_retry_count => {
                    attempt += 1;
                    warn!(
                        operation = operation,
                        attempt = attempt,
                        error = %e,
                        "Store call failed; retrying"
                    );
                    tokio::time::sleep(self.options.storage_retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Cache probe with failure-mode fallback (`None` in fail-open).
    pub(crate) async fn cache_probe(
        &self,
        key: &str,
    ) -> Result<Option<ResponseRecord>, IdempotencyError> {
        match self.with_retry("get", || self.store.get(key)).await {
            Ok(record) => Ok(record),
            Err(StoreError::Cancelled) => Err(StoreError::Cancelled.into()),
            Err(e) => match self.options.failure_mode {
                FailureMode::FailSafe => Err(e.into()),
                FailureMode::FailOpen => {
                    warn!(key = %key, error = %e, "Cache probe failed; continuing without idempotency");
                    Ok(None)
                }
            },
        }
    }

    /// Lock acquisition with failure-mode fallback (a fabricated handle in
    /// fail-open: the request proceeds with no exclusion guarantee).
    pub(crate) async fn acquire_lock(
        &self,
        key: &str,
    ) -> Result<Option<LockGuard>, IdempotencyError> {
        let lock_ttl = self.options.lock_ttl;
        let wait_budget = self.options.wait_budget;

        let outcome = self
            .with_retry("try_acquire_lock", || {
                self.store.try_acquire_lock(key, lock_ttl, wait_budget)
            })
            .await;

        let handle = match outcome {
            Ok(handle) => handle,
            Err(StoreError::Cancelled) => return Err(StoreError::Cancelled.into()),
            Err(e) => match self.options.failure_mode {
                FailureMode::FailSafe => return Err(e.into()),
                FailureMode::FailOpen => {
                    warn!(key = %key, error = %e, "Lock acquisition failed; continuing without exclusion");
                    Some(LockHandle::new(key, lock_ttl))
                }
            },
        };

        Ok(handle.map(|handle| LockGuard::new(self.clone(), handle)))
    }

    /// Record write with failure-mode fallback (silently dropped in
    /// fail-open).
    pub(crate) async fn save_record(
        &self,
        key: &str,
        record: &ResponseRecord,
        ttl: Duration,
    ) -> Result<(), IdempotencyError> {
        match self
            .with_retry("save", || self.store.save(key, record, ttl))
            .await
        {
            Ok(()) => Ok(()),
            Err(StoreError::Cancelled) => Err(StoreError::Cancelled.into()),
            Err(e) => match self.options.failure_mode {
                FailureMode::FailSafe => Err(e.into()),
                FailureMode::FailOpen => {
                    warn!(key = %key, error = %e, "Record save failed; response will not be cached");
                    Ok(())
                }
            },
        }
    }

    async fn release_handle(&self, handle: LockHandle) {
        let result = self
            .with_retry("release_lock", || self.store.release_lock(handle.clone()))
            .await;

        // Release failures never block the response; the lock TTL is the
        // backstop for a slot we could not free.
        if let Err(e) = result {
            warn!(key = %handle.key, owner = %handle.owner, error = %e, "Lock release failed");
        } else {
            debug!(key = %handle.key, "Lock released");
        }
    }
}

/// Scoped lock acquisition.
///
/// The coordinator releases explicitly on every ordinary exit path; the
/// drop hook covers unwinds and request cancellation by spawning a
/// best-effort release, with the backend lock TTL as the final cleanup.
pub(crate) struct LockGuard {
    service: IdempotencyService,
    handle: Option<LockHandle>,
}

impl LockGuard {
    fn new(service: IdempotencyService, handle: LockHandle) -> Self {
        Self {
            service,
            handle: Some(handle),
        }
    }

    pub(crate) async fn release(mut self) {
        if let Some(handle) = self.handle.take() {
            self.service.release_handle(handle).await;
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let store = self.service.store.clone();
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move {
                    let _ = store.release_lock(handle).await;
                });
            }
        }
    }
}
