use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use replayguard_types::StoreError;
use thiserror::Error;

/// Protocol outcomes that end a request without (or instead of) the
/// handler's response. Each maps to an HTTP status at the transport edge.
#[derive(Error, Debug)]
pub enum IdempotencyError {
    /// The configured key validator rejected the key (400 Bad Request)
    #[error("Invalid idempotency key")]
    InvalidKey,

    /// Key reuse with a mismatching payload hash (422 Unprocessable Entity)
    #[error("Idempotency key was reused with a different request payload")]
    PayloadMismatch,

    /// Lock contended with no wait budget (409 Conflict)
    #[error("A request with this idempotency key is already in flight")]
    ConcurrencyRejected,

    /// Request body exceeds the hashing limit (413 Payload Too Large)
    #[error("Request body of {size} bytes exceeds the {limit}-byte limit")]
    PayloadTooLarge { size: u64, limit: usize },

    /// Lock contended and the wait budget ran out (503 Service Unavailable)
    #[error("Timed out after {waited_ms}ms waiting for the idempotency lock on key '{key}'")]
    LockTimeout { key: String, waited_ms: u64 },

    /// Buffering the handler's response failed (500 Internal Server Error)
    #[error("Failed to capture response body: {0}")]
    ResponseCapture(String),

    /// Store failure in fail-safe mode (503 Service Unavailable)
    #[error("Idempotency store error: {0}")]
    Store(#[from] StoreError),
}

impl IdempotencyError {
    /// HTTP status this error surfaces as.
    pub fn status_code(&self) -> StatusCode {
        match self {
            IdempotencyError::InvalidKey => StatusCode::BAD_REQUEST,
            IdempotencyError::PayloadMismatch => StatusCode::UNPROCESSABLE_ENTITY,
            IdempotencyError::ConcurrencyRejected => StatusCode::CONFLICT,
            IdempotencyError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            IdempotencyError::LockTimeout { .. } => StatusCode::SERVICE_UNAVAILABLE,
            IdempotencyError::ResponseCapture(_) => StatusCode::INTERNAL_SERVER_ERROR,
            IdempotencyError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for IdempotencyError {
    fn into_response(self) -> Response {
        (self.status_code(), self.to_string()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(IdempotencyError::InvalidKey.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            IdempotencyError::PayloadMismatch.status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            IdempotencyError::ConcurrencyRejected.status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            IdempotencyError::PayloadTooLarge { size: 11, limit: 10 }.status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            IdempotencyError::Store(StoreError::unavailable("down")).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_mismatch_body_names_the_payload() {
        // Clients match on this phrase
        assert!(IdempotencyError::PayloadMismatch
            .to_string()
            .contains("different request payload"));
    }

    #[test]
    fn test_lock_timeout_carries_key_and_budget() {
        let err = IdempotencyError::LockTimeout {
            key: "abc".to_string(),
            waited_ms: 250,
        };
        let text = err.to_string();
        assert!(text.contains("abc"));
        assert!(text.contains("250"));
    }
}
