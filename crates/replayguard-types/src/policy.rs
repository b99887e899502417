//! Per-endpoint policy and process-wide options.
//!
//! An [`EndpointPolicy`] is attached to individual routes (via
//! `axum::Extension` in the middleware crate) and opts the route into
//! idempotency handling. [`IdempotencyOptions`] carries the process-wide
//! knobs: header name, TTLs, wait budget, excluded headers, key validation,
//! failure mode, and the storage retry policy.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// Predicate applied to incoming idempotency keys; `false` rejects with 400.
pub type KeyValidator = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Behavior when the store is unavailable after retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    /// Propagate the store error (surfaces as 5xx); the default
    FailSafe,
    /// Swallow the error and bypass idempotency; stays available
    FailOpen,
}

/// Per-endpoint idempotency policy.
///
/// Routes without this policy pass through the middleware untouched.
#[derive(Debug, Clone)]
pub struct EndpointPolicy {
    /// Record TTL override; `None` uses the process-wide default
    pub expiry: Option<Duration>,
    /// Bind the key to the request body hash (422 on reuse with a new body)
    pub validate_payload: bool,
}

impl EndpointPolicy {
    pub fn new() -> Self {
        Self {
            expiry: None,
            validate_payload: true,
        }
    }

    /// Set the record TTL in minutes; 0 falls back to the process default.
    pub fn with_expiry_minutes(mut self, minutes: u64) -> Self {
        self.expiry = if minutes == 0 {
            None
        } else {
            Some(Duration::from_secs(minutes * 60))
        };
        self
    }

    pub fn without_payload_validation(mut self) -> Self {
        self.validate_payload = false;
        self
    }
}

impl Default for EndpointPolicy {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide middleware options.
#[derive(Clone)]
pub struct IdempotencyOptions {
    /// HTTP header carrying the idempotency key
    pub header_name: String,
    /// Record TTL used when the endpoint policy has none
    pub default_expiry: Duration,
    /// Lock TTL passed to `try_acquire_lock`; bounds stuck-lock duration
    pub lock_ttl: Duration,
    /// How long a contender waits for the lock before giving up
    pub wait_budget: Duration,
    /// Upper bound on hashable request bodies and cacheable response bodies
    pub max_body_size: usize,
    /// Response headers never cached or replayed (lowercased)
    pub excluded_headers: HashSet<String>,
    /// Optional key predicate; rejection responds 400
    pub key_validator: Option<KeyValidator>,
    /// Store-unavailability policy
    pub failure_mode: FailureMode,
    /// Extra attempts per store call after the first
    pub storage_retry_count: u32,
    /// Constant delay between storage retries
    pub storage_retry_delay: Duration,
}

impl IdempotencyOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// The response headers excluded from caching by default.
    pub fn default_excluded_headers() -> HashSet<String> {
        [
            "transfer-encoding",
            "connection",
            "keep-alive",
            "upgrade",
            "date",
            "set-cookie",
            "authorization",
        ]
        .into_iter()
        .map(str::to_string)
        .collect()
    }

    /// Load options from environment variables, keeping defaults for
    /// anything unset or unparsable.
    pub fn from_env() -> Self {
        let mut options = Self::default();

        if let Ok(name) = std::env::var("REPLAYGUARD_HEADER_NAME") {
            if !name.trim().is_empty() {
                options.header_name = name;
            }
        }

        if let Ok(minutes) = std::env::var("REPLAYGUARD_DEFAULT_EXPIRY_MINUTES") {
            if let Ok(minutes) = minutes.parse::<u64>() {
                if minutes > 0 {
                    options.default_expiry = Duration::from_secs(minutes * 60);
                }
            }
        }

        if let Ok(ms) = std::env::var("REPLAYGUARD_LOCK_TTL_MS") {
            if let Ok(ms) = ms.parse() {
                options.lock_ttl = Duration::from_millis(ms);
            }
        }

        if let Ok(ms) = std::env::var("REPLAYGUARD_WAIT_BUDGET_MS") {
            if let Ok(ms) = ms.parse() {
                options.wait_budget = Duration::from_millis(ms);
            }
        }

        if let Ok(bytes) = std::env::var("REPLAYGUARD_MAX_BODY_SIZE") {
            if let Ok(bytes) = bytes.parse() {
                options.max_body_size = bytes;
            }
        }

        if let Ok(mode) = std::env::var("REPLAYGUARD_FAILURE_MODE") {
            options.failure_mode = match mode.to_lowercase().as_str() {
                "fail-open" | "failopen" => FailureMode::FailOpen,
                _ => FailureMode::FailSafe,
            };
        }

        if let Ok(count) = std::env::var("REPLAYGUARD_STORAGE_RETRY_COUNT") {
            if let Ok(count) = count.parse() {
                options.storage_retry_count = count;
            }
        }

        if let Ok(ms) = std::env::var("REPLAYGUARD_STORAGE_RETRY_DELAY_MS") {
            if let Ok(ms) = ms.parse() {
                options.storage_retry_delay = Duration::from_millis(ms);
            }
        }

        options
    }

    /// Validate option coherence.
    pub fn validate(&self) -> Result<(), String> {
        if self.header_name.trim().is_empty() {
            return Err("Header name cannot be empty".to_string());
        }

        if self.default_expiry.is_zero() {
            return Err("Default expiry must be greater than zero".to_string());
        }

        if self.lock_ttl.is_zero() {
            return Err("Lock TTL must be greater than zero".to_string());
        }

        if self.max_body_size == 0 {
            return Err("Maximum body size must be greater than zero".to_string());
        }

        Ok(())
    }

    /// Check whether a response header is excluded from caching.
    pub fn is_excluded_header(&self, name: &str) -> bool {
        self.excluded_headers.contains(&name.to_ascii_lowercase())
    }

    pub fn with_header_name(mut self, name: impl Into<String>) -> Self {
        self.header_name = name.into();
        self
    }

    pub fn with_wait_budget(mut self, budget: Duration) -> Self {
        self.wait_budget = budget;
        self
    }

    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    pub fn with_default_expiry(mut self, expiry: Duration) -> Self {
        self.default_expiry = expiry;
        self
    }

    pub fn with_max_body_size(mut self, bytes: usize) -> Self {
        self.max_body_size = bytes;
        self
    }

    pub fn with_failure_mode(mut self, mode: FailureMode) -> Self {
        self.failure_mode = mode;
        self
    }

    pub fn with_key_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.key_validator = Some(Arc::new(validator));
        self
    }

    pub fn with_storage_retries(mut self, count: u32, delay: Duration) -> Self {
        self.storage_retry_count = count;
        self.storage_retry_delay = delay;
        self
    }

    /// Add a response header to the excluded set.
    pub fn exclude_header(mut self, name: impl AsRef<str>) -> Self {
        self.excluded_headers
            .insert(name.as_ref().to_ascii_lowercase());
        self
    }
}

impl Default for IdempotencyOptions {
    fn default() -> Self {
        Self {
            header_name: "Idempotency-Key".to_string(),
            default_expiry: Duration::from_secs(60 * 60),
            lock_ttl: Duration::from_millis(30_000),
            wait_budget: Duration::ZERO,
            max_body_size: 10 * 1024 * 1024,
            excluded_headers: Self::default_excluded_headers(),
            key_validator: None,
            failure_mode: FailureMode::FailSafe,
            storage_retry_count: 0,
            storage_retry_delay: Duration::from_millis(200),
        }
    }
}
