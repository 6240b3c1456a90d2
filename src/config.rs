//! Configuration management for Tollgate.
//!
//! Configuration is assembled once at startup from built-in defaults, an
//! optional YAML file, and `TOLLGATE__`-prefixed environment variables. The
//! resulting structure is read-only for the lifetime of the process.

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, TollgateError};
use crate::ratelimit::{LimiterPolicy, RouteRule};

/// Main configuration for the Tollgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,

    /// Upper bound on a single counter store round trip
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            store_timeout_ms: default_store_timeout_ms(),
        }
    }
}

impl ServerConfig {
    /// The store timeout as a `Duration`.
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 3000))
}

fn default_store_timeout_ms() -> u64 {
    250
}

/// Which counter store backs the limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local counters. Only correct for a single instance.
    Memory,
    /// Shared Redis counters.
    Redis,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Backend selection
    #[serde(default = "default_backend")]
    pub backend: StoreBackend,

    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Namespace prepended to every counter key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// How often the in-memory store drops expired counters, in seconds
    #[serde(default = "default_purge_interval")]
    pub purge_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            redis_url: default_redis_url(),
            key_prefix: default_key_prefix(),
            purge_interval_secs: default_purge_interval(),
        }
    }
}

fn default_backend() -> StoreBackend {
    StoreBackend::Memory
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_key_prefix() -> String {
    "ratelimit:".to_string()
}

fn default_purge_interval() -> u64 {
    60
}

/// Rate limiting configuration: policies, the ordered rule table and the
/// override path sets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Policies added to, or replacing, the built-in registry entries
    #[serde(default)]
    pub policies: Vec<LimiterPolicy>,

    /// Ordered route rules; the first matching prefix wins
    #[serde(default = "default_rules")]
    pub rules: Vec<RouteRule>,

    /// Path prefixes that are never rate limited
    #[serde(default = "default_excluded_paths")]
    pub excluded_paths: Vec<String>,

    /// File extensions of static assets; they exclude only paths outside
    /// every rule and strict prefix
    #[serde(default = "default_excluded_extensions")]
    pub excluded_extensions: Vec<String>,

    /// Path prefixes governed by the strict policy
    #[serde(default = "default_strict_paths")]
    pub strict_paths: Vec<String>,

    /// Policy applied to strict paths
    #[serde(default = "default_strict_policy")]
    pub strict_policy: String,

    /// Path prefixes that are always limited by source IP
    #[serde(default = "default_user_excluded_paths")]
    pub user_excluded_paths: Vec<String>,

    /// Policy applied to bearer-authenticated callers
    #[serde(default = "default_user_policy")]
    pub user_policy: String,

    /// Policy applied when no rule matches
    #[serde(default = "default_policy")]
    pub default_policy: String,

    /// Header set by the trusted edge proxy with the client address
    #[serde(default = "default_trusted_proxy_header")]
    pub trusted_proxy_header: String,

    /// Number of trusted proxies appending to `X-Forwarded-For`
    #[serde(default)]
    pub trusted_proxy_hops: usize,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            policies: Vec::new(),
            rules: default_rules(),
            excluded_paths: default_excluded_paths(),
            excluded_extensions: default_excluded_extensions(),
            strict_paths: default_strict_paths(),
            strict_policy: default_strict_policy(),
            user_excluded_paths: default_user_excluded_paths(),
            user_policy: default_user_policy(),
            default_policy: default_policy(),
            trusted_proxy_header: default_trusted_proxy_header(),
            trusted_proxy_hops: 0,
        }
    }
}

fn default_rules() -> Vec<RouteRule> {
    vec![
        RouteRule::new("/api/auth", "auth"),
        RouteRule::new("/api/upload", "upload"),
        RouteRule::new("/api/videos/upload", "upload"),
        RouteRule::new("/api/analytics", "analytics"),
        RouteRule::new("/api/webhooks", "webhook"),
        RouteRule::new("/api", "api"),
    ]
}

fn default_excluded_paths() -> Vec<String> {
    ["/health", "/api/health", "/_next/static", "/static", "/favicon.ico"]
        .iter()
        .map(|p| p.to_string())
        .collect()
}

fn default_excluded_extensions() -> Vec<String> {
    [".css", ".js", ".map", ".png", ".jpg", ".svg", ".ico", ".woff", ".woff2"]
        .iter()
        .map(|e| e.to_string())
        .collect()
}

fn default_strict_paths() -> Vec<String> {
    vec!["/api/auth".to_string(), "/api/admin".to_string()]
}

fn default_strict_policy() -> String {
    "auth".to_string()
}

fn default_user_excluded_paths() -> Vec<String> {
    vec!["/api/webhooks".to_string()]
}

fn default_user_policy() -> String {
    "user".to_string()
}

fn default_policy() -> String {
    "api".to_string()
}

fn default_trusted_proxy_header() -> String {
    "cf-connecting-ip".to_string()
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TollgateConfig {
    /// Load configuration from defaults, an optional file and the environment.
    ///
    /// Environment variables use the `TOLLGATE__` prefix with `__` as the
    /// section separator, e.g. `TOLLGATE__STORE__BACKEND=redis`.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&TollgateConfig::default())?);

        if let Some(path) = path {
            info!(path = %path, "Loading configuration file");
            builder = builder.add_source(File::with_name(path));
        }

        let config = builder
            .add_source(Environment::with_prefix("TOLLGATE").separator("__"))
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    /// Load configuration from a YAML file path, without environment overrides.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| TollgateError::Config(format!("Failed to parse configuration: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TollgateConfig::default();
        assert_eq!(config.server.store_timeout(), Duration::from_millis(250));
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.rate_limiting.default_policy, "api");
        assert_eq!(config.rate_limiting.trusted_proxy_hops, 0);
        assert_eq!(config.rate_limiting.rules.last().unwrap().path_prefix, "/api");
    }

    #[test]
    fn test_parse_partial_yaml() {
        let yaml = r#"
server:
  http_addr: "0.0.0.0:8080"
store:
  backend: redis
  redis_url: "redis://cache:6379"
rate_limiting:
  policies:
    - name: search
      window_ms: 60000
      max_requests: 30
      message: "Too many searches"
  rules:
    - path_prefix: /api/search
      policy: search
    - path_prefix: /api/embed
      policy: custom
      inline:
        window_ms: 1000
        max_requests: 5
"#;
        let config = TollgateConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.server.http_addr.port(), 8080);
        assert_eq!(config.server.store_timeout_ms, 250);
        assert_eq!(config.store.backend, StoreBackend::Redis);
        assert_eq!(config.store.key_prefix, "ratelimit:");

        let rl = &config.rate_limiting;
        assert_eq!(rl.policies.len(), 1);
        assert_eq!(rl.rules.len(), 2);
        assert_eq!(rl.rules[1].policy, "custom");
        let inline = rl.rules[1].inline.as_ref().unwrap();
        assert_eq!(inline.max_requests, Some(5));
        assert_eq!(inline.message, None);
        // Unspecified sections keep their defaults
        assert_eq!(rl.strict_policy, "auth");
        assert_eq!(rl.user_excluded_paths, vec!["/api/webhooks".to_string()]);
    }

    #[test]
    fn test_parse_invalid_yaml() {
        let result = TollgateConfig::from_yaml("server: [not, a, map]");
        assert!(matches!(result, Err(TollgateError::Config(_))));
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = TollgateConfig::load(None).unwrap();
        assert_eq!(config.rate_limiting.rules.len(), default_rules().len());
        assert_eq!(config.store.purge_interval_secs, 60);
    }
}
