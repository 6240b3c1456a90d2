//! Caller identity extraction.
//!
//! Callers are counted either by client IP address or, for bearer-token
//! traffic, by a SHA-256 digest of the token. The raw token never leaves
//! this module.

use axum::http::header::{HeaderName, AUTHORIZATION};
use axum::http::HeaderMap;
use sha2::{Digest, Sha256};
use std::net::IpAddr;
use tracing::trace;

use crate::config::RateLimitingConfig;
use crate::error::{Result, TollgateError};

/// Identifier used when no address can be determined.
pub const UNKNOWN_CLIENT: &str = "unknown";

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_REAL_IP: &str = "x-real-ip";

/// The key under which a caller's requests are counted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    /// Client IP address (or `"unknown"`)
    Ip(String),
    /// Hex SHA-256 digest of the caller's bearer token
    User(String),
}

impl Identity {
    /// The value embedded in counter keys.
    pub fn value(&self) -> &str {
        match self {
            Identity::Ip(addr) => addr,
            Identity::User(digest) => digest,
        }
    }

    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Identity::Ip(_) => "ip",
            Identity::User(_) => "user",
        }
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind(), self.value())
    }
}

/// How a policy wants its callers identified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityStrategy {
    /// By client IP address
    Ip,
    /// By bearer token digest, falling back to IP
    User,
}

/// Outcome of identity extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractedIdentity {
    /// The requested strategy produced an identity.
    Resolved(Identity),
    /// The user strategy had no usable token; the IP identity is used instead.
    FellBack(Identity),
}

impl ExtractedIdentity {
    /// Borrow the identity, whichever way it was obtained.
    pub fn identity(&self) -> &Identity {
        match self {
            ExtractedIdentity::Resolved(id) | ExtractedIdentity::FellBack(id) => id,
        }
    }

    /// Take the identity.
    pub fn into_identity(self) -> Identity {
        match self {
            ExtractedIdentity::Resolved(id) | ExtractedIdentity::FellBack(id) => id,
        }
    }

    /// Whether the IP fallback was taken.
    pub fn is_fallback(&self) -> bool {
        matches!(self, ExtractedIdentity::FellBack(_))
    }
}

/// Derives caller identities from request metadata.
#[derive(Debug, Clone)]
pub struct IdentifierExtractor {
    trusted_proxy_header: HeaderName,
    trusted_proxy_hops: usize,
}

impl IdentifierExtractor {
    /// Create an extractor.
    ///
    /// `trusted_proxy_hops` is the number of proxies in front of the service
    /// that append to `X-Forwarded-For`. Zero trusts the first entry.
    pub fn new(trusted_proxy_header: &str, trusted_proxy_hops: usize) -> Result<Self> {
        let trusted_proxy_header = HeaderName::from_bytes(trusted_proxy_header.as_bytes())
            .map_err(|e| {
                TollgateError::Config(format!(
                    "invalid trusted proxy header '{}': {}",
                    trusted_proxy_header, e
                ))
            })?;
        Ok(Self {
            trusted_proxy_header,
            trusted_proxy_hops,
        })
    }

    /// Create an extractor from the rate limiting configuration.
    pub fn from_config(config: &RateLimitingConfig) -> Result<Self> {
        Self::new(&config.trusted_proxy_header, config.trusted_proxy_hops)
    }

    /// Extract an identity with the given strategy.
    pub fn extract(
        &self,
        strategy: IdentityStrategy,
        headers: &HeaderMap,
        peer: Option<IpAddr>,
    ) -> ExtractedIdentity {
        match strategy {
            IdentityStrategy::Ip => {
                ExtractedIdentity::Resolved(Identity::Ip(self.client_ip(headers, peer)))
            }
            IdentityStrategy::User => match user_identity(headers) {
                Ok(identity) => ExtractedIdentity::Resolved(identity),
                Err(reason) => {
                    trace!(reason = %reason, "Falling back to IP identity");
                    ExtractedIdentity::FellBack(Identity::Ip(self.client_ip(headers, peer)))
                }
            },
        }
    }

    /// Resolve the client address.
    ///
    /// Checks `X-Forwarded-For`, then `X-Real-IP`, then the trusted proxy
    /// header, then the socket peer, and finally returns `"unknown"`.
    pub fn client_ip(&self, headers: &HeaderMap, peer: Option<IpAddr>) -> String {
        if let Some(ip) = header_str(headers, X_FORWARDED_FOR).and_then(|v| self.forwarded_client(v)) {
            return ip;
        }

        for name in [X_REAL_IP, self.trusted_proxy_header.as_str()] {
            if let Some(value) = header_str(headers, name) {
                let value = value.trim();
                if !value.is_empty() {
                    return value.to_string();
                }
            }
        }

        peer.map(|ip| ip.to_string())
            .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
    }

    /// Pick the client entry from an `X-Forwarded-For` chain.
    fn forwarded_client(&self, value: &str) -> Option<String> {
        let hops: Vec<&str> = value.split(',').map(str::trim).collect();

        let candidate = if self.trusted_proxy_hops == 0 || hops.len() < self.trusted_proxy_hops {
            hops.first().copied()
        } else {
            hops.get(hops.len() - self.trusted_proxy_hops).copied()
        }?;

        if candidate.is_empty() {
            None
        } else {
            Some(candidate.to_string())
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Return the bearer token from the `Authorization` header, if well formed.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }

    let token = token.trim();
    if token.is_empty() || token.contains(char::is_whitespace) {
        return None;
    }
    Some(token)
}

/// Hex SHA-256 digest of a token.
pub fn token_digest(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Build the user identity for a request.
///
/// Fails with `NoIdentity` when the bearer token is missing or malformed.
pub fn user_identity(headers: &HeaderMap) -> Result<Identity> {
    bearer_token(headers)
        .map(|token| Identity::User(token_digest(token)))
        .ok_or(TollgateError::NoIdentity)
}
