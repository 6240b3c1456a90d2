//! Route rules and policy resolution.
//!
//! A request path is mapped to a policy in four ordered steps:
//!
//! 1. The first rule (in table order) whose prefix matches the path. Prefix
//!    length plays no part; earlier rules shadow later ones.
//! 2. A strict-path match replaces the result with the strict policy. This
//!    is final: strict paths are always limited by source IP.
//! 3. Otherwise a well-formed bearer token replaces the result with the user
//!    policy and user identity, unless the path is excluded from user
//!    limiting.
//! 4. With no rule match, the default policy applies.
//!
//! Excluded prefixes skip resolution entirely. Static-asset extensions only
//! exclude paths that no rule or strict prefix covers.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::identity::IdentityStrategy;
use super::policy::{LimiterPolicy, PolicyRegistry};
use crate::config::RateLimitingConfig;
use crate::error::{Result, TollgateError};

/// Policy name marking a rule whose limits come from its inline config.
pub const CUSTOM_POLICY: &str = "custom";

/// One entry of the ordered rule table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRule {
    /// Path prefix this rule applies to
    pub path_prefix: String,
    /// Registry policy name, or `custom`
    pub policy: String,
    /// Inline limits for `custom` rules
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline: Option<InlineConfig>,
}

impl RouteRule {
    /// Create a rule referring to a registry policy.
    pub fn new(path_prefix: &str, policy: &str) -> Self {
        Self {
            path_prefix: path_prefix.to_string(),
            policy: policy.to_string(),
            inline: None,
        }
    }

    /// Create a `custom` rule with inline limits.
    pub fn custom(path_prefix: &str, inline: InlineConfig) -> Self {
        Self {
            path_prefix: path_prefix.to_string(),
            policy: CUSTOM_POLICY.to_string(),
            inline: Some(inline),
        }
    }
}

/// Per-route limits. Unset fields are taken from the default policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineConfig {
    /// Counter namespace; derived from the path prefix when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_requests: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl InlineConfig {
    /// Build an ephemeral policy for `prefix` on top of `base`.
    pub fn to_policy(&self, prefix: &str, base: &LimiterPolicy) -> Result<LimiterPolicy> {
        let invalid = |reason: &str| TollgateError::InvalidInlineConfig {
            prefix: prefix.to_string(),
            reason: reason.to_string(),
        };

        if self.window_ms.is_none() && self.max_requests.is_none() {
            return Err(invalid("neither window_ms nor max_requests is set"));
        }
        if self.window_ms == Some(0) {
            return Err(invalid("window_ms must be greater than zero"));
        }
        if self.max_requests == Some(0) {
            return Err(invalid("max_requests must be greater than zero"));
        }

        let name = match &self.name {
            Some(name) if name.is_empty() || name.contains(':') => {
                return Err(invalid("name must be non-empty and must not contain ':'"));
            }
            Some(name) => name.clone(),
            None => format!("{}{}", CUSTOM_POLICY, prefix.replace(':', "_")),
        };

        Ok(LimiterPolicy {
            name,
            window_ms: self.window_ms.unwrap_or(base.window_ms),
            max_requests: self.max_requests.unwrap_or(base.max_requests),
            message: self.message.clone().unwrap_or_else(|| base.message.clone()),
        })
    }
}

/// Which resolution step produced the policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionSource {
    /// The rule at this index of the table
    Rule(usize),
    /// The strict-path override
    Strict,
    /// The authenticated-user override
    User,
    /// No rule matched
    Default,
}

/// A policy selected for a request.
#[derive(Debug, Clone)]
pub struct ResolvedLimit {
    pub policy: Arc<LimiterPolicy>,
    pub strategy: IdentityStrategy,
    pub source: ResolutionSource,
}

/// Result of resolving a path.
#[derive(Debug, Clone)]
pub enum Resolution {
    /// The path is never rate limited.
    Excluded,
    /// The path is limited by this policy.
    Limited(ResolvedLimit),
}

#[derive(Debug, Clone)]
struct CompiledRule {
    prefix: String,
    policy: Arc<LimiterPolicy>,
}

/// Maps request paths to policies. Built once at startup and read-only after.
#[derive(Debug, Clone)]
pub struct RuleResolver {
    rules: Vec<CompiledRule>,
    excluded_paths: Vec<String>,
    excluded_extensions: Vec<String>,
    strict_paths: Vec<String>,
    user_excluded_paths: Vec<String>,
    strict_policy: Arc<LimiterPolicy>,
    user_policy: Arc<LimiterPolicy>,
    default_policy: Arc<LimiterPolicy>,
}

impl RuleResolver {
    /// Compile the rule table against the policy registry.
    ///
    /// Unknown policy names are configuration errors. A `custom` rule with a
    /// malformed inline config falls back to the default policy.
    pub fn new(config: &RateLimitingConfig, registry: &PolicyRegistry) -> Result<Self> {
        let default_policy = registry.require(&config.default_policy)?;
        let strict_policy = registry.require(&config.strict_policy)?;
        let user_policy = registry.require(&config.user_policy)?;

        let mut rules = Vec::with_capacity(config.rules.len());
        for rule in &config.rules {
            let policy = Self::compile_rule(rule, registry, &default_policy)?;
            debug!(
                prefix = %rule.path_prefix,
                policy = %policy.name,
                "Compiled route rule"
            );
            rules.push(CompiledRule {
                prefix: rule.path_prefix.clone(),
                policy,
            });
        }

        info!(
            rules = rules.len(),
            strict_paths = config.strict_paths.len(),
            excluded_paths = config.excluded_paths.len(),
            "Rule table loaded"
        );

        Ok(Self {
            rules,
            excluded_paths: config.excluded_paths.clone(),
            excluded_extensions: config.excluded_extensions.clone(),
            strict_paths: config.strict_paths.clone(),
            user_excluded_paths: config.user_excluded_paths.clone(),
            strict_policy,
            user_policy,
            default_policy,
        })
    }

    fn compile_rule(
        rule: &RouteRule,
        registry: &PolicyRegistry,
        default_policy: &Arc<LimiterPolicy>,
    ) -> Result<Arc<LimiterPolicy>> {
        if rule.policy != CUSTOM_POLICY {
            if rule.inline.is_some() {
                warn!(
                    prefix = %rule.path_prefix,
                    policy = %rule.policy,
                    "Inline config only applies to custom rules; ignoring it"
                );
            }
            return registry.require(&rule.policy);
        }

        let built = match &rule.inline {
            Some(inline) => inline.to_policy(&rule.path_prefix, default_policy),
            None => Err(TollgateError::InvalidInlineConfig {
                prefix: rule.path_prefix.clone(),
                reason: "custom rule has no inline config".to_string(),
            }),
        };

        match built {
            Ok(policy) => Ok(Arc::new(policy)),
            Err(err) => {
                warn!(
                    prefix = %rule.path_prefix,
                    error = %err,
                    fallback = %default_policy.name,
                    "Invalid inline policy, using default"
                );
                Ok(default_policy.clone())
            }
        }
    }

    /// Whether the path bypasses rate limiting.
    pub fn is_excluded(&self, path: &str) -> bool {
        matches_prefix(&self.excluded_paths, path)
            || (self.is_static_asset(path)
                && self.first_rule(path).is_none()
                && !self.is_strict(path))
    }

    fn is_static_asset(&self, path: &str) -> bool {
        self.excluded_extensions
            .iter()
            .any(|ext| path.ends_with(ext.as_str()))
    }

    fn is_strict(&self, path: &str) -> bool {
        matches_prefix(&self.strict_paths, path)
    }

    fn first_rule(&self, path: &str) -> Option<(usize, &CompiledRule)> {
        self.rules
            .iter()
            .enumerate()
            .find(|(_, rule)| path.starts_with(rule.prefix.as_str()))
    }

    /// Resolve the policy for a path.
    ///
    /// `has_bearer_token` is the presence of a well-formed bearer token; the
    /// token itself is not inspected here.
    pub fn resolve(&self, path: &str, has_bearer_token: bool) -> Resolution {
        if matches_prefix(&self.excluded_paths, path) {
            return Resolution::Excluded;
        }

        let rule = self.first_rule(path);
        let strict = self.is_strict(path);
        if rule.is_none() && !strict && self.is_static_asset(path) {
            return Resolution::Excluded;
        }

        if strict {
            return Resolution::Limited(ResolvedLimit {
                policy: self.strict_policy.clone(),
                strategy: IdentityStrategy::Ip,
                source: ResolutionSource::Strict,
            });
        }

        if has_bearer_token && !matches_prefix(&self.user_excluded_paths, path) {
            return Resolution::Limited(ResolvedLimit {
                policy: self.user_policy.clone(),
                strategy: IdentityStrategy::User,
                source: ResolutionSource::User,
            });
        }

        let resolved = match rule {
            Some((index, rule)) => ResolvedLimit {
                policy: rule.policy.clone(),
                strategy: IdentityStrategy::Ip,
                source: ResolutionSource::Rule(index),
            },
            None => ResolvedLimit {
                policy: self.default_policy.clone(),
                strategy: IdentityStrategy::Ip,
                source: ResolutionSource::Default,
            },
        };

        Resolution::Limited(resolved)
    }
}

fn matches_prefix(prefixes: &[String], path: &str) -> bool {
    prefixes.iter().any(|p| path.starts_with(p.as_str()))
}
