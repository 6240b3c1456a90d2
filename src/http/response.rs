//! Rate limit headers and the 429 response.

use axum::http::header::{CONTENT_TYPE, RETRY_AFTER};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::ratelimit::{LimitDecision, LimiterPolicy};

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");
pub const X_RATELIMIT_ERROR: HeaderName = HeaderName::from_static("x-ratelimit-error");

/// Value of `X-RateLimit-Error` when the limiter fails open.
pub const FAIL_OPEN_MESSAGE: &str = "Rate limiting temporarily unavailable";

const SECURITY_HEADERS: [(&str, &str); 4] = [
    ("x-content-type-options", "nosniff"),
    ("x-frame-options", "DENY"),
    ("x-xss-protection", "1; mode=block"),
    ("referrer-policy", "strict-origin-when-cross-origin"),
];

/// JSON body of a rejected request.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectionBody<'a> {
    pub error: &'static str,
    pub message: &'a str,
    pub retry_after: u64,
    pub limit: u64,
    pub remaining: u64,
    pub reset_time: u64,
    #[serde(rename = "type")]
    pub kind: &'static str,
}

impl<'a> RejectionBody<'a> {
    pub fn new(decision: &LimitDecision, policy: &'a LimiterPolicy) -> Self {
        Self {
            error: "Rate limit exceeded",
            message: &policy.message,
            retry_after: decision.retry_after_seconds,
            limit: decision.limit,
            remaining: decision.remaining,
            reset_time: reset_epoch_seconds(decision),
            kind: "RATE_LIMIT_ERROR",
        }
    }
}

/// The window end in epoch seconds, rounded up.
pub fn reset_epoch_seconds(decision: &LimitDecision) -> u64 {
    decision.reset_at_millis.div_ceil(1000)
}

/// Attach `X-RateLimit-Limit`, `X-RateLimit-Remaining` and `X-RateLimit-Reset`.
pub fn apply_rate_limit_headers(headers: &mut HeaderMap, decision: &LimitDecision) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(reset_epoch_seconds(decision)));
}

/// Attach the security headers carried by every evaluated response. Values
/// already set by the inner handler are left alone.
pub fn apply_security_headers(headers: &mut HeaderMap) {
    for (name, value) in SECURITY_HEADERS {
        headers
            .entry(HeaderName::from_static(name))
            .or_insert(HeaderValue::from_static(value));
    }
}

/// Mark a response that passed through because the limiter failed.
pub fn apply_fail_open_header(headers: &mut HeaderMap) {
    headers.insert(X_RATELIMIT_ERROR, HeaderValue::from_static(FAIL_OPEN_MESSAGE));
}

/// Build the 429 response for a rejected request.
pub fn rejection(decision: &LimitDecision, policy: &LimiterPolicy) -> Response {
    let body = serde_json::to_vec(&RejectionBody::new(decision, policy)).unwrap_or_default();

    let mut response = (StatusCode::TOO_MANY_REQUESTS, body).into_response();
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(RETRY_AFTER, HeaderValue::from(decision.retry_after_seconds));
    apply_rate_limit_headers(headers, decision);
    apply_security_headers(headers);
    response
}
