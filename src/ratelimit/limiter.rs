//! Fixed-window limiter engine.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use super::clock::{Clock, SystemClock};
use super::identity::Identity;
use super::key::CounterKey;
use super::policy::LimiterPolicy;
use crate::error::{Result, TollgateError};
use crate::store::CounterStore;

/// Default bound on a single counter store round trip.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(250);

/// The outcome of one limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitDecision {
    /// Whether the request is within the limit
    pub allowed: bool,
    /// The policy's maximum requests per window
    pub limit: u64,
    /// Requests left in this window, never negative
    pub remaining: u64,
    /// Epoch milliseconds at which the window ends
    pub reset_at_millis: u64,
    /// Hits counted in this window, including this one
    pub total_hits: u64,
    /// Seconds the caller should wait, 0 when allowed
    pub retry_after_seconds: u64,
}

/// Runs the fixed-window algorithm against a counter store.
///
/// Counts live in buckets keyed by `floor(now / window)`. A caller can get up
/// to twice the nominal rate across a window edge.
pub struct LimiterEngine {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    store_timeout: Duration,
}

impl LimiterEngine {
    /// Create an engine using the system clock and the default timeout.
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock), DEFAULT_STORE_TIMEOUT)
    }

    /// Create an engine with an explicit clock and store timeout.
    pub fn with_clock(
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
        store_timeout: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            store_timeout,
        }
    }

    /// Count one request for `identity` under `policy` and decide on it.
    ///
    /// A store failure or a round trip longer than the store timeout yields
    /// `StoreUnavailable`. The increment may still land after a timeout.
    pub async fn check(&self, policy: &LimiterPolicy, identity: &Identity) -> Result<LimitDecision> {
        let now = self.clock.now_millis();
        let key = CounterKey::for_instant(&policy.name, identity.value(), policy.window_ms, now);
        let store_key = key.to_store_key();

        trace!(key = %store_key, "Checking rate limit");

        let hit = tokio::time::timeout(
            self.store_timeout,
            self.store.increment_and_get(&store_key, policy.window_ms),
        )
        .await
        .map_err(|_| {
            TollgateError::StoreUnavailable(format!(
                "store call exceeded {}ms",
                self.store_timeout.as_millis()
            ))
        })??;

        let allowed = hit.count <= policy.max_requests;
        let retry_after_seconds = if allowed {
            0
        } else {
            hit.ttl_remaining_ms.div_ceil(1000).max(1)
        };

        let decision = LimitDecision {
            allowed,
            limit: policy.max_requests,
            remaining: policy.max_requests.saturating_sub(hit.count),
            reset_at_millis: key.window_end_millis(policy.window_ms),
            total_hits: hit.count,
            retry_after_seconds,
        };

        if !allowed {
            debug!(
                key = %store_key,
                count = hit.count,
                limit = policy.max_requests,
                "Rate limit exceeded"
            );
        }

        Ok(decision)
    }
}

impl std::fmt::Debug for LimiterEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LimiterEngine")
            .field("store_timeout", &self.store_timeout)
            .finish()
    }
}
