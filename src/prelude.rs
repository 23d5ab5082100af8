//! Convenient re-exports for common tollgate types.
pub use crate::{
    cancel::{cancel_pair, CancelHandle, CancelSignal},
    config::{AdmissionConfig, Algorithm, RuleConfig, ThrottleSettings},
    policy::{Policy, PolicyError},
    rate_limit::{
        always, Decision, DenialReason, FixedWindow, InMemorySharedStore, KeyError, KeyExtractor,
        LimitKey, LocalTokenBucket, RateLimitLayer, RateLimiter, SharedStore, SlidingWindow,
        TokenBucket,
    },
    throttle::{
        ConcurrencyThrottle, ThrottleConfig, ThrottleLayer, ThrottleRejection, ThrottleStats,
    },
    AdmissionError,
};
