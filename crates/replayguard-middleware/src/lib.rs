//! # Replayguard Middleware
//!
//! axum middleware guaranteeing at-most-once execution of idempotent HTTP
//! operations. A client tags a request with an opaque `Idempotency-Key`
//! header; the coordinator combines response caching, per-key distributed
//! locking, and optional payload-hash binding so that concurrent or
//! sequential duplicates observe the outcome of a single execution.
//!
//! ## Example
//!
//! ```rust,ignore
//! use axum::{routing::post, Router};
//! use replayguard_middleware::IdempotencyService;
//! use replayguard_types::{EndpointPolicy, IdempotencyOptions, MemoryIdempotencyStore};
//! use std::sync::Arc;
//!
//! let service = IdempotencyService::new(
//!     Arc::new(MemoryIdempotencyStore::new()),
//!     IdempotencyOptions::default(),
//! );
//!
//! let app: Router = Router::new().route(
//!     "/pay",
//!     service.guard_route(EndpointPolicy::new().with_expiry_minutes(5), post(pay)),
//! );
//! # async fn pay() {}
//! ```

pub mod coordinator;
pub mod errors;
pub mod service;

pub use coordinator::idempotency_middleware;
pub use errors::IdempotencyError;
pub use service::IdempotencyService;

// Re-export the configuration surface alongside the middleware
pub use replayguard_types::{EndpointPolicy, FailureMode, IdempotencyOptions};
