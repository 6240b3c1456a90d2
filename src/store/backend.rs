//! Counter store trait for abstracting local and shared counter backends.

use async_trait::async_trait;

use crate::error::Result;

/// The result of one atomic increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterHit {
    /// Counter value after this increment
    pub count: u64,
    /// Time until the counter expires, in milliseconds
    pub ttl_remaining_ms: u64,
}

/// Trait for counter store implementations.
///
/// Implementations must perform the increment and the first-hit expiry as a
/// single atomic step: concurrent callers on one key observe the sequence
/// 1, 2, 3, ... with no gaps or repeats. A store that cannot be reached
/// returns `TollgateError::StoreUnavailable` rather than a guessed count.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment `key`, setting its expiry to `window_ms` if it is new.
    async fn increment_and_get(&self, key: &str, window_ms: u64) -> Result<CounterHit>;
}
