//! Limiting policies and the process-wide policy registry.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::error::{Result, TollgateError};

/// A named limiting policy: at most `max_requests` hits per `window_ms`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterPolicy {
    /// Unique policy name, also the first segment of counter keys
    pub name: String,
    /// Fixed window length in milliseconds
    pub window_ms: u64,
    /// Maximum hits allowed per window
    pub max_requests: u64,
    /// Human-readable message returned to rejected callers
    #[serde(default = "default_message")]
    pub message: String,
}

fn default_message() -> String {
    "Too many requests, please try again later.".to_string()
}

impl LimiterPolicy {
    /// Create a new policy.
    pub fn new(name: &str, window_ms: u64, max_requests: u64, message: &str) -> Self {
        Self {
            name: name.to_string(),
            window_ms,
            max_requests,
            message: message.to_string(),
        }
    }

    /// Check that the policy can drive a fixed window.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(TollgateError::Config("policy name must not be empty".to_string()));
        }
        if self.window_ms == 0 {
            return Err(TollgateError::Config(format!(
                "policy '{}' must have a window greater than zero",
                self.name
            )));
        }
        if self.max_requests == 0 {
            return Err(TollgateError::Config(format!(
                "policy '{}' must allow at least one request",
                self.name
            )));
        }
        Ok(())
    }
}

/// The policies every deployment starts with.
pub fn builtin_policies() -> Vec<LimiterPolicy> {
    vec![
        LimiterPolicy::new(
            "auth",
            15 * 60 * 1000,
            20,
            "Too many authentication attempts, please try again later.",
        ),
        LimiterPolicy::new(
            "upload",
            60 * 60 * 1000,
            50,
            "Upload limit reached, please try again later.",
        ),
        LimiterPolicy::new(
            "api",
            15 * 60 * 1000,
            1000,
            "Too many requests, please try again later.",
        ),
        LimiterPolicy::new(
            "analytics",
            60 * 1000,
            300,
            "Too many analytics requests, please slow down.",
        ),
        LimiterPolicy::new(
            "webhook",
            60 * 1000,
            100,
            "Too many webhook deliveries from this source.",
        ),
        LimiterPolicy::new(
            "user",
            15 * 60 * 1000,
            2000,
            "Too many requests for this account, please try again later.",
        ),
    ]
}

/// Read-only lookup of policies by name.
#[derive(Debug, Clone)]
pub struct PolicyRegistry {
    policies: HashMap<String, Arc<LimiterPolicy>>,
}

impl PolicyRegistry {
    /// Build a registry from an explicit list of policies.
    ///
    /// Names must be unique.
    pub fn new(policies: Vec<LimiterPolicy>) -> Result<Self> {
        let mut map = HashMap::with_capacity(policies.len());
        for policy in policies {
            policy.validate()?;
            let name = policy.name.clone();
            if map.insert(name.clone(), Arc::new(policy)).is_some() {
                return Err(TollgateError::Config(format!("duplicate policy '{}'", name)));
            }
        }
        Ok(Self { policies: map })
    }

    /// Build a registry from the built-ins, with `overrides` replacing
    /// built-ins of the same name and adding any new ones.
    pub fn with_builtins(overrides: &[LimiterPolicy]) -> Result<Self> {
        let mut registry = Self::new(builtin_policies())?;
        let mut seen = std::collections::HashSet::new();
        for policy in overrides {
            policy.validate()?;
            if !seen.insert(policy.name.as_str()) {
                return Err(TollgateError::Config(format!("duplicate policy '{}'", policy.name)));
            }
            debug!(
                policy = %policy.name,
                window_ms = policy.window_ms,
                max_requests = policy.max_requests,
                "Registering configured policy"
            );
            registry
                .policies
                .insert(policy.name.clone(), Arc::new(policy.clone()));
        }
        Ok(registry)
    }

    /// Look up a policy by name.
    pub fn get(&self, name: &str) -> Option<Arc<LimiterPolicy>> {
        self.policies.get(name).cloned()
    }

    /// Look up a policy that must exist.
    pub fn require(&self, name: &str) -> Result<Arc<LimiterPolicy>> {
        self.get(name)
            .ok_or_else(|| TollgateError::Config(format!("unknown policy '{}'", name)))
    }

    /// Number of registered policies.
    pub fn len(&self) -> usize {
        self.policies.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}
