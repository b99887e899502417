use thiserror::Error;

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Backend-agnostic failure surface for store operations.
///
/// Every backend folds its native errors into one of these variants so the
/// coordinator can apply a uniform retry and failure-mode policy.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Transient backend errors (network, deadlock, serialization conflict)
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Malformed persisted state; retrying will not help
    #[error("Store state corrupted: {0}")]
    Corrupted(String),

    /// Record (de)serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The operation was cancelled by the caller
    #[error("Operation cancelled")]
    Cancelled,
}

impl StoreError {
    /// Create a new transient error
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    /// Create a new fatal state error
    pub fn corrupted(msg: impl Into<String>) -> Self {
        Self::Corrupted(msg.into())
    }

    /// Check if the error is worth retrying
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Unavailable(_) => true,
            StoreError::Corrupted(_) => false,
            StoreError::Serialization(_) => false,
            StoreError::Cancelled => false,
        }
    }

    /// Get error category for log fields
    pub fn category(&self) -> &'static str {
        match self {
            StoreError::Unavailable(_) => "unavailable",
            StoreError::Corrupted(_) => "corrupted",
            StoreError::Serialization(_) => "serialization",
            StoreError::Cancelled => "cancelled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryability_split() {
        assert!(StoreError::unavailable("connection reset").is_retryable());
        assert!(!StoreError::corrupted("bad row").is_retryable());
        assert!(!StoreError::Cancelled.is_retryable());
    }

    #[test]
    fn test_categories() {
        assert_eq!(StoreError::unavailable("x").category(), "unavailable");
        assert_eq!(StoreError::Cancelled.category(), "cancelled");
    }
}
