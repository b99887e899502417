//! The coordination protocol.
//!
//! Per request: policy probe, key probe and validation, optional body
//! hashing, cache probe, lock acquisition, double-checked cache probe,
//! handler execution with the response buffered, conditional record write,
//! replay, and lock release on every exit path.

use crate::errors::IdempotencyError;
use crate::service::{IdempotencyService, LockGuard};
use axum::{
    body::{Body, Bytes},
    extract::{Request, State},
    http::{header::CONTENT_LENGTH, HeaderMap, HeaderName, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use replayguard_types::{EndpointPolicy, IdempotencyOptions, ResponseRecord};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

/// Idempotency coordinator middleware.
///
/// Apply per route through [`IdempotencyService::guard_route`], or
/// app-wide via `middleware::from_fn_with_state` with the endpoint policy
/// installed as a request extension by an outer layer. Requests without a
/// policy or without a key pass through untouched.
pub async fn idempotency_middleware(
    State(service): State<IdempotencyService>,
    request: Request,
    next: Next,
) -> Response {
    // Policy probe: no policy means the route opted out
    let Some(policy) = request.extensions().get::<EndpointPolicy>().cloned() else {
        return next.run(request).await;
    };

    // Key probe: absent or whitespace-only keys bypass the protocol
    let header_name = service.options().header_name.clone();
    let key = request
        .headers()
        .get(header_name.as_str())
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .map(str::to_string);

    let Some(key) = key else {
        return next.run(request).await;
    };

    match run_protocol(&service, &policy, key, request, next).await {
        Ok(response) => response,
        Err(err) => {
            debug!(status = %err.status_code(), error = %err, "Request ended by idempotency protocol");
            err.into_response()
        }
    }
}

async fn run_protocol(
    service: &IdempotencyService,
    policy: &EndpointPolicy,
    key: String,
    request: Request,
    next: Next,
) -> Result<Response, IdempotencyError> {
    let options = service.options();

    if let Some(validator) = &options.key_validator {
        if !validator(&key) {
            return Err(IdempotencyError::InvalidKey);
        }
    }

    // Body hashing binds the key to one payload; the body is rebuilt for
    // the handler from the buffered bytes
    let (request, request_body_hash) = if policy.validate_payload {
        let (request, hash) = hash_request_body(request, options).await?;
        (request, Some(hash))
    } else {
        (request, None)
    };

    // First cache probe: a live record short-circuits before locking
    if let Some(record) = service.cache_probe(&key).await? {
        check_payload(policy, &record, request_body_hash.as_deref())?;
        debug!(key = %key, "Replaying cached response");
        return Ok(replay(&record));
    }

    let Some(guard) = service.acquire_lock(&key).await? else {
        return Err(if options.wait_budget.is_zero() {
            IdempotencyError::ConcurrencyRejected
        } else {
            IdempotencyError::LockTimeout {
                key,
                waited_ms: options.wait_budget.as_millis() as u64,
            }
        });
    };

    // Double-checked probe: a contender may have finished between the
    // first probe and our acquisition
    match service.cache_probe(&key).await {
        Ok(Some(record)) => {
            let outcome = check_payload(policy, &record, request_body_hash.as_deref());
            guard.release().await;
            return outcome.map(|()| {
                debug!(key = %key, "Replaying response cached by a concurrent contender");
                replay(&record)
            });
        }
        Ok(None) => {}
        Err(e) => {
            guard.release().await;
            return Err(e);
        }
    }

    let response = next.run(request).await;

    // Only a 2xx outcome becomes a record; anything else leaves the key
    // free for a retry
    if !response.status().is_success() {
        debug!(key = %key, status = %response.status(), "Handler outcome not cacheable");
        guard.release().await;
        return Ok(response);
    }

    let (parts, body) = response.into_parts();
    let bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            guard.release().await;
            return Err(IdempotencyError::ResponseCapture(e.to_string()));
        }
    };

    if bytes.len() > options.max_body_size {
        warn!(
            key = %key,
            size = bytes.len(),
            limit = options.max_body_size,
            "Response body exceeds cacheable size; skipping record"
        );
        guard.release().await;
        return Ok(rebuild(parts, bytes));
    }

    let ttl = policy.expiry.unwrap_or(options.default_expiry);
    let record = ResponseRecord::new(
        parts.status.as_u16(),
        capture_headers(&parts.headers, options),
        bytes.to_vec(),
        ttl,
        request_body_hash,
    );

    let saved = service.save_record(&key, &record, ttl).await;
    guard.release().await;
    saved?;

    debug!(key = %key, ttl_secs = ttl.as_secs(), "Response recorded");
    Ok(rebuild(parts, bytes))
}

/// Buffer, bound, and hash the request body, then reinstall it.
async fn hash_request_body(
    request: Request,
    options: &IdempotencyOptions,
) -> Result<(Request, String), IdempotencyError> {
    let limit = options.max_body_size;

    if let Some(declared) = content_length(request.headers()) {
        if declared > limit as u64 {
            return Err(IdempotencyError::PayloadTooLarge {
                size: declared,
                limit,
            });
        }
    }

    let (parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, limit)
        .await
        .map_err(|_| IdempotencyError::PayloadTooLarge {
            size: limit as u64 + 1,
            limit,
        })?;

    let hash = BASE64.encode(Sha256::digest(&bytes));

    Ok((Request::from_parts(parts, Body::from(bytes)), hash))
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
}

/// 422 when payload validation is on and the record is bound to a
/// different body hash.
fn check_payload(
    policy: &EndpointPolicy,
    record: &ResponseRecord,
    request_body_hash: Option<&str>,
) -> Result<(), IdempotencyError> {
    if policy.validate_payload && record.payload_hash.as_deref() != request_body_hash {
        return Err(IdempotencyError::PayloadMismatch);
    }
    Ok(())
}

/// Snapshot response headers minus the excluded set.
fn capture_headers(
    headers: &HeaderMap,
    options: &IdempotencyOptions,
) -> Vec<(String, Vec<String>)> {
    let mut captured = Vec::new();

    for name in headers.keys() {
        if options.is_excluded_header(name.as_str()) {
            continue;
        }

        let values: Vec<String> = headers
            .get_all(name)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .map(str::to_string)
            .collect();

        if !values.is_empty() {
            captured.push((name.as_str().to_string(), values));
        }
    }

    captured
}

/// Write a record to a fresh response: captured status, captured headers
/// (only where not already present), recorded body.
fn replay(record: &ResponseRecord) -> Response {
    let mut response = Response::new(Body::from(record.body.clone()));
    *response.status_mut() =
        StatusCode::from_u16(record.status_code).unwrap_or(StatusCode::OK);

    for (name, values) in &record.headers {
        let Ok(header_name) = HeaderName::from_bytes(name.as_bytes()) else {
            continue;
        };
        if response.headers().contains_key(&header_name) {
            continue;
        }
        for value in values {
            if let Ok(header_value) = HeaderValue::from_str(value) {
                response.headers_mut().append(header_name.clone(), header_value);
            }
        }
    }

    response
}

fn rebuild(parts: axum::http::response::Parts, bytes: Bytes) -> Response {
    Response::from_parts(parts, Body::from(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn record_with_headers(headers: Vec<(String, Vec<String>)>) -> ResponseRecord {
        ResponseRecord::new(201, headers, b"out".to_vec(), Duration::from_secs(60), None)
    }

    #[test]
    fn test_replay_preserves_status_headers_and_body() {
        let record = record_with_headers(vec![
            ("x-custom".to_string(), vec!["ok".to_string()]),
            ("x-multi".to_string(), vec!["a".to_string(), "b".to_string()]),
        ]);

        let response = replay(&record);

        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers().get("x-custom").unwrap(), "ok");
        let multi: Vec<_> = response.headers().get_all("x-multi").iter().collect();
        assert_eq!(multi.len(), 2);
    }

    #[test]
    fn test_capture_headers_drops_excluded_case_insensitively() {
        let options = IdempotencyOptions::default();
        let mut headers = HeaderMap::new();
        headers.insert("Set-Cookie", HeaderValue::from_static("s=1"));
        headers.insert("X-Custom", HeaderValue::from_static("ok"));
        headers.insert("Date", HeaderValue::from_static("now"));

        let captured = capture_headers(&headers, &options);

        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].0, "x-custom");
    }

    #[test]
    fn test_check_payload_mismatch() {
        let policy = EndpointPolicy::new();
        let mut record = record_with_headers(vec![]);
        record.payload_hash = Some("hash-a".to_string());

        assert!(check_payload(&policy, &record, Some("hash-a")).is_ok());
        assert!(check_payload(&policy, &record, Some("hash-b")).is_err());

        // Validation off ignores the hash entirely
        let relaxed = EndpointPolicy::new().without_payload_validation();
        assert!(check_payload(&relaxed, &record, None).is_ok());
    }

    #[test]
    fn test_empty_body_hash_is_sha256_of_zero_bytes() {
        let expected = BASE64.encode(Sha256::digest(b""));
        assert_eq!(expected, "47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU=");
    }
}
