//! Admission middleware.
//!
//! Every request ends in one of four outcomes: excluded (passed through
//! untouched), allowed (passed through with rate limit headers), rejected
//! (429), or failed open (passed through with a diagnostic header). Errors
//! and panics inside evaluation always fail open; the limiter must never be
//! the reason a request fails.

use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::USER_AGENT;
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use futures::FutureExt;
use std::net::{IpAddr, SocketAddr};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, warn};

use super::response;
use crate::config::TollgateConfig;
use crate::error::Result;
use crate::ratelimit::{
    bearer_token, IdentifierExtractor, Identity, LimitDecision, LimiterEngine, LimiterPolicy,
    PolicyRegistry, Resolution, RuleResolver, SystemClock,
};
use crate::store::CounterStore;

/// A decision together with what it was made for.
#[derive(Debug, Clone)]
pub struct Verdict {
    pub policy: Arc<LimiterPolicy>,
    pub identity: Identity,
    pub decision: LimitDecision,
}

/// Terminal state of one admission check.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// The path is not rate limited.
    Excluded,
    /// Within the limit.
    Allowed(Verdict),
    /// Over the limit.
    Rejected(Verdict),
    /// The check itself failed; the request proceeds unthrottled.
    FailOpen,
}

/// The admission layer: resolver, extractor and engine bundled for sharing
/// across request tasks.
#[derive(Clone)]
pub struct Admission {
    inner: Arc<AdmissionInner>,
}

struct AdmissionInner {
    resolver: RuleResolver,
    extractor: IdentifierExtractor,
    engine: LimiterEngine,
}

impl Admission {
    /// Assemble the admission layer from its parts.
    pub fn new(resolver: RuleResolver, extractor: IdentifierExtractor, engine: LimiterEngine) -> Self {
        Self {
            inner: Arc::new(AdmissionInner {
                resolver,
                extractor,
                engine,
            }),
        }
    }

    /// Build the admission layer from configuration and a counter store.
    pub fn from_config(config: &TollgateConfig, store: Arc<dyn CounterStore>) -> Result<Self> {
        let rl = &config.rate_limiting;
        let registry = PolicyRegistry::with_builtins(&rl.policies)?;
        let resolver = RuleResolver::new(rl, &registry)?;
        let extractor = IdentifierExtractor::from_config(rl)?;
        let engine = LimiterEngine::with_clock(
            store,
            Arc::new(SystemClock),
            config.server.store_timeout(),
        );
        Ok(Self::new(resolver, extractor, engine))
    }

    /// Decide on a request. Never fails: internal errors become `FailOpen`.
    pub async fn admit(&self, path: &str, headers: &HeaderMap, peer: Option<IpAddr>) -> Outcome {
        match AssertUnwindSafe(self.evaluate(path, headers, peer))
            .catch_unwind()
            .await
        {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(err)) => {
                warn!(path = %path, error = %err, "Rate limiting failed, allowing request");
                Outcome::FailOpen
            }
            Err(_) => {
                warn!(path = %path, "Rate limiting panicked, allowing request");
                Outcome::FailOpen
            }
        }
    }

    async fn evaluate(&self, path: &str, headers: &HeaderMap, peer: Option<IpAddr>) -> Result<Outcome> {
        let inner = &self.inner;

        let limit = match inner.resolver.resolve(path, bearer_token(headers).is_some()) {
            Resolution::Excluded => return Ok(Outcome::Excluded),
            Resolution::Limited(limit) => limit,
        };

        let extracted = inner.extractor.extract(limit.strategy, headers, peer);
        if extracted.is_fallback() {
            debug!(path = %path, policy = %limit.policy.name, "No user identity, limiting by IP");
        }
        let identity = extracted.into_identity();

        let decision = inner.engine.check(&limit.policy, &identity).await?;
        let verdict = Verdict {
            policy: limit.policy,
            identity,
            decision,
        };

        if decision.allowed {
            return Ok(Outcome::Allowed(verdict));
        }

        let user_agent = headers
            .get(USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        warn!(
            identifier = %verdict.identity,
            path = %path,
            policy = %verdict.policy.name,
            total_hits = decision.total_hits,
            limit = decision.limit,
            reset_time = response::reset_epoch_seconds(&decision),
            user_agent = %user_agent,
            client_ip = %inner.extractor.client_ip(headers, peer),
            "Rate limit exceeded"
        );
        Ok(Outcome::Rejected(verdict))
    }
}

impl std::fmt::Debug for Admission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Admission")
            .field("resolver", &self.inner.resolver)
            .field("engine", &self.inner.engine)
            .finish()
    }
}

/// Axum middleware applying admission control to every request.
pub async fn admission_middleware(
    State(admission): State<Admission>,
    req: Request,
    next: Next,
) -> Response {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());

    let outcome = admission.admit(req.uri().path(), req.headers(), peer).await;

    match outcome {
        Outcome::Excluded => next.run(req).await,
        Outcome::Allowed(verdict) => {
            let mut resp = next.run(req).await;
            let headers = resp.headers_mut();
            response::apply_rate_limit_headers(headers, &verdict.decision);
            response::apply_security_headers(headers);
            resp
        }
        Outcome::Rejected(verdict) => response::rejection(&verdict.decision, &verdict.policy),
        Outcome::FailOpen => {
            let mut resp = next.run(req).await;
            let headers = resp.headers_mut();
            response::apply_fail_open_header(headers);
            response::apply_security_headers(headers);
            resp
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TollgateError;
    use crate::ratelimit::{InlineConfig, ManualClock, RouteRule, DEFAULT_STORE_TIMEOUT};
    use crate::store::{CounterHit, MemoryStore};
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::{HeaderValue, StatusCode};
    use axum::routing::get;
    use axum::Router;
    use tower::ServiceExt;

    // Start of a 15 minute window.
    const T0: u64 = 1_700_000_100_000;

    struct DownStore;

    #[async_trait]
    impl CounterStore for DownStore {
        async fn increment_and_get(&self, _key: &str, _window_ms: u64) -> Result<CounterHit> {
            Err(TollgateError::StoreUnavailable("connection refused".to_string()))
        }
    }

    struct PanickingStore;

    #[async_trait]
    impl CounterStore for PanickingStore {
        async fn increment_and_get(&self, _key: &str, _window_ms: u64) -> Result<CounterHit> {
            panic!("store bug");
        }
    }

    fn admission_with(store: Arc<dyn CounterStore>, clock: Arc<ManualClock>) -> Admission {
        let config = TollgateConfig::default();
        let registry = PolicyRegistry::with_builtins(&[]).unwrap();
        let resolver = RuleResolver::new(&config.rate_limiting, &registry).unwrap();
        let extractor = IdentifierExtractor::from_config(&config.rate_limiting).unwrap();
        let engine = LimiterEngine::with_clock(store, clock, DEFAULT_STORE_TIMEOUT);
        Admission::new(resolver, extractor, engine)
    }

    fn memory_admission() -> Admission {
        let clock = Arc::new(ManualClock::new(T0));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        admission_with(store, clock)
    }

    fn app(admission: Admission) -> Router {
        Router::new()
            .route("/health", get(|| async { "ok" }))
            .fallback(|| async { "hello" })
            .layer(axum::middleware::from_fn_with_state(admission, admission_middleware))
    }

    fn request(path: &str, ip: &str) -> Request {
        Request::builder()
            .uri(path)
            .header("x-forwarded-for", ip)
            .header("user-agent", "test-agent")
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_signin_burst_end_to_end() {
        let app = app(memory_admission());

        for expected_remaining in (0..20u64).rev() {
            let response = app
                .clone()
                .oneshot(request("/api/auth/signin", "203.0.113.7"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            let headers = response.headers();
            assert_eq!(headers["x-ratelimit-limit"], "20");
            assert_eq!(headers["x-ratelimit-remaining"], expected_remaining.to_string().as_str());
            assert_eq!(headers["x-ratelimit-reset"], ((T0 + 900_000) / 1000).to_string().as_str());
            assert_eq!(headers["x-content-type-options"], "nosniff");
        }

        let response = app
            .clone()
            .oneshot(request("/api/auth/signin", "203.0.113.7"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()["retry-after"], "900");
        assert_eq!(response.headers()["x-frame-options"], "DENY");

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "Rate limit exceeded");
        assert_eq!(json["type"], "RATE_LIMIT_ERROR");
        assert_eq!(json["limit"], 20);
        assert_eq!(json["remaining"], 0);
        assert_eq!(json["retryAfter"], 900);

        // Another caller is unaffected
        let response = app
            .oneshot(request("/api/auth/signin", "198.51.100.1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_excluded_path_has_no_headers() {
        let response = app(memory_admission())
            .oneshot(request("/health", "203.0.113.7"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get("x-ratelimit-limit").is_none());
        assert!(response.headers().get("x-content-type-options").is_none());
    }

    #[tokio::test]
    async fn test_store_failure_fails_open() {
        let admission = admission_with(Arc::new(DownStore), Arc::new(ManualClock::new(T0)));
        let response = app(admission)
            .oneshot(request("/api/videos", "203.0.113.7"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(headers["x-ratelimit-error"], "Rate limiting temporarily unavailable");
        assert!(headers.get("x-ratelimit-limit").is_none());
        assert!(headers.get("x-ratelimit-remaining").is_none());
        assert!(headers.get("x-ratelimit-reset").is_none());
        assert!(headers.get("retry-after").is_none());
    }

    #[tokio::test]
    async fn test_panic_fails_open() {
        let admission = admission_with(Arc::new(PanickingStore), Arc::new(ManualClock::new(T0)));
        let outcome = admission
            .admit("/api/videos", &HeaderMap::new(), None)
            .await;
        assert!(matches!(outcome, Outcome::FailOpen));
    }

    #[tokio::test]
    async fn test_bearer_token_counts_per_user() {
        let admission = memory_admission();
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer token-a"));
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.7"));

        match admission.admit("/api/videos", &headers, None).await {
            Outcome::Allowed(verdict) => {
                assert_eq!(verdict.policy.name, "user");
                assert!(matches!(verdict.identity, Identity::User(_)));
                assert_eq!(verdict.decision.limit, 2000);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_rotating_tokens_do_not_escape_signin_limit() {
        let admission = memory_admission();

        for i in 0..21 {
            let mut headers = HeaderMap::new();
            let token = format!("Bearer guess-{i}");
            headers.insert("authorization", HeaderValue::from_str(&token).unwrap());
            headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.7"));

            match admission.admit("/api/auth/signin", &headers, None).await {
                Outcome::Allowed(verdict) if i < 20 => {
                    assert_eq!(verdict.policy.name, "auth");
                    assert_eq!(verdict.identity, Identity::Ip("203.0.113.7".to_string()));
                }
                Outcome::Rejected(verdict) if i == 20 => {
                    assert_eq!(verdict.policy.name, "auth");
                    assert_eq!(verdict.decision.total_hits, 21);
                }
                other => panic!("attempt {i}: unexpected outcome {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_handler_security_headers_are_kept() {
        let app = Router::new()
            .fallback(|| async { ([("x-frame-options", "SAMEORIGIN")], "framed") })
            .layer(axum::middleware::from_fn_with_state(
                memory_admission(),
                admission_middleware,
            ));

        let response = app
            .oneshot(request("/api/videos", "203.0.113.7"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(headers["x-frame-options"], "SAMEORIGIN");
        assert_eq!(headers["x-content-type-options"], "nosniff");
        assert_eq!(headers["x-ratelimit-limit"], "1000");
    }

    #[tokio::test]
    async fn test_webhook_with_token_limited_by_ip() {
        let admission = memory_admission();
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer token-a"));
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.7"));

        match admission.admit("/api/webhooks/bunny", &headers, None).await {
            Outcome::Allowed(verdict) => {
                assert_eq!(verdict.policy.name, "webhook");
                assert_eq!(verdict.identity, Identity::Ip("203.0.113.7".to_string()));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_custom_rule_end_to_end() {
        let mut config = TollgateConfig::default();
        let inline = InlineConfig {
            window_ms: Some(3_600_000),
            max_requests: Some(2),
            ..Default::default()
        };
        config
            .rate_limiting
            .rules
            .insert(0, RouteRule::custom("/api/embed", inline));
        let admission = Admission::from_config(&config, Arc::new(MemoryStore::new())).unwrap();
        let app = app(admission);

        for _ in 0..2 {
            let response = app.clone().oneshot(request("/api/embed/1", "192.0.2.1")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        let response = app.oneshot(request("/api/embed/1", "192.0.2.1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }
}
