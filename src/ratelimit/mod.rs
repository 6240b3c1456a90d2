//! Rate limiting logic: policies, rule resolution, identities and the
//! fixed-window engine.

mod clock;
mod identity;
mod key;
mod limiter;
mod policy;
mod rules;

pub use clock::{Clock, ManualClock, SystemClock};
pub use identity::{
    bearer_token, token_digest, user_identity, ExtractedIdentity, IdentifierExtractor, Identity,
    IdentityStrategy, UNKNOWN_CLIENT,
};
pub use key::CounterKey;
pub use limiter::{LimitDecision, LimiterEngine, DEFAULT_STORE_TIMEOUT};
pub use policy::{builtin_policies, LimiterPolicy, PolicyRegistry};
pub use rules::{
    InlineConfig, Resolution, ResolutionSource, ResolvedLimit, RouteRule, RuleResolver,
    CUSTOM_POLICY,
};
