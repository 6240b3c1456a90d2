//! Counter key generation.

/// A key that addresses one fixed window for one caller under one policy.
///
/// Rendered as `{policy}:{identity}:{window}`, where `window` is the window
/// index `floor(now_ms / window_ms)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey {
    /// The policy name
    pub policy: String,
    /// The identity value (IP address or token digest)
    pub identity: String,
    /// The window index
    pub window: u64,
}

impl CounterKey {
    /// Create a new counter key.
    pub fn new(policy: &str, identity: &str, window: u64) -> Self {
        Self {
            policy: policy.to_string(),
            identity: identity.to_string(),
            window,
        }
    }

    /// Create the key for the window containing `now_ms`.
    pub fn for_instant(policy: &str, identity: &str, window_ms: u64, now_ms: u64) -> Self {
        Self::new(policy, identity, now_ms / window_ms)
    }

    /// Convert the key to its store representation.
    pub fn to_store_key(&self) -> String {
        format!("{}:{}:{}", self.policy, self.identity, self.window)
    }

    /// Epoch milliseconds at which this key's window ends.
    pub fn window_end_millis(&self, window_ms: u64) -> u64 {
        (self.window + 1) * window_ms
    }
}

impl std::fmt::Display for CounterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_store_key())
    }
}
