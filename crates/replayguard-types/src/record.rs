//! Cached-response record model.
//!
//! A [`ResponseRecord`] is the immutable artifact of a previously completed
//! 2xx response: status, captured headers, body bytes, first-write time, and
//! the optional payload hash that binds the idempotency key to one request
//! body. Records round-trip through backends as JSON; the body crosses as
//! base64.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A cached response for one idempotency key.
///
/// Header names are stored lowercased; lookups are case-insensitive and the
/// value order within a name is preserved. `created_at` reflects first-write
/// time and survives upserts; `expires_at` is recomputed on every save.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseRecord {
    /// HTTP status code, always in [200, 299]
    pub status_code: u16,
    /// Captured headers: (lowercased name, ordered values)
    pub headers: Vec<(String, Vec<String>)>,
    /// Response body bytes
    #[serde(with = "base64_bytes")]
    pub body: Vec<u8>,
    /// First-write instant, preserved across upserts
    pub created_at: DateTime<Utc>,
    /// Expiry instant, `created_at + ttl` at first write
    pub expires_at: DateTime<Utc>,
    /// base64(SHA-256(request body)), or None when payload validation was off
    pub payload_hash: Option<String>,
}

impl ResponseRecord {
    /// Build a record stamped `now`, expiring after `ttl`.
    pub fn new(
        status_code: u16,
        headers: Vec<(String, Vec<String>)>,
        body: Vec<u8>,
        ttl: Duration,
        payload_hash: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            status_code,
            headers,
            body,
            created_at: now,
            expires_at: now + ChronoDuration::from_std(ttl).unwrap_or(ChronoDuration::zero()),
            payload_hash,
        }
    }

    /// Check whether the record is expired at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Remaining lifetime at `now`, or None when already expired.
    pub fn remaining_ttl(&self, now: DateTime<Utc>) -> Option<Duration> {
        if now >= self.expires_at {
            None
        } else {
            (self.expires_at - now).to_std().ok()
        }
    }

    /// Case-insensitive header lookup.
    pub fn header_values(&self, name: &str) -> Option<&[String]> {
        let lowered = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(n, _)| *n == lowered)
            .map(|(_, v)| v.as_slice())
    }
}

// Body bytes as base64 so record JSON stays printable in any backend.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        STANDARD.encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
