//! Rate limiting primitives.
//!
//! This module provides the building blocks for keyed rate limiting:
//! - [`RateLimiter`]: the capability every algorithm implements.
//! - [`Decision`]: the result of a check (allowed, or denied with a retry hint).
//! - [`RateLimitLayer`]: Tower middleware that enforces a limiter on HTTP requests.
//!
//! # Architecture
//!
//! - **Middleware**: `RateLimitLayer` wraps your service. It doesn't know *how* limiting works,
//!   only that it should ask a `RateLimiter` about the caller key it extracted.
//! - **Local backend**: [`local::LocalTokenBucket`] keeps one lock-free bucket per caller key in
//!   process memory and sweeps idle keys in the background.
//! - **Shared backend**: the algorithms in [`strategies`] (fixed window, sliding window, token
//!   bucket) run against a [`store::SharedStore`] so several instances enforce one quota.
//!
//! Every algorithm short-circuits to [`Decision::Allowed`] when its policy is disabled, and every
//! shared algorithm fails closed: a store error becomes a denial for a full window.

use crate::Policy;
use std::sync::Arc;
use std::time::Duration;

pub mod local;
pub mod middleware;
pub mod store;
pub mod strategies;

pub use local::LocalTokenBucket;
pub use middleware::{always, KeyError, KeyExtractor, LimitKey, RateLimitLayer, RateLimitService};
pub use store::{BucketSpec, InMemorySharedStore, SharedStore, TokenGrant};
pub use strategies::{FixedWindow, SlidingWindow, TokenBucket};

/// Why a request was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenialReason {
    /// The caller used up its quota; `wait` is the computed time until capacity returns.
    QuotaExhausted,
    /// The shared store could not be consulted; the request is rejected for a full window.
    BackendUnavailable,
}

/// The decision returned by a rate limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The request is allowed to proceed.
    Allowed,
    /// The request is denied.
    Denied {
        /// How long the caller should wait before retrying.
        /// Useful for `Retry-After` headers.
        wait: Duration,
        /// Reason for denial.
        reason: DenialReason,
    },
}

impl Decision {
    /// Helper to check if allowed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed)
    }

    /// Retry hint; zero when allowed.
    pub fn retry_after(&self) -> Duration {
        match self {
            Decision::Allowed => Duration::ZERO,
            Decision::Denied { wait, .. } => *wait,
        }
    }

    /// Denial reason, if denied.
    pub fn reason(&self) -> Option<DenialReason> {
        match self {
            Decision::Allowed => None,
            Decision::Denied { reason, .. } => Some(*reason),
        }
    }

    pub(crate) fn exhausted(wait: Duration) -> Self {
        Decision::Denied { wait, reason: DenialReason::QuotaExhausted }
    }

    pub(crate) fn unavailable(window: Duration) -> Self {
        Decision::Denied { wait: window, reason: DenialReason::BackendUnavailable }
    }
}

/// Core interface for keyed rate limiting.
///
/// Implementations must be safe to call concurrently from any number of tasks for any number
/// of caller keys. `caller` is the bare caller identity; implementations prefix it with the
/// policy namespace themselves.
#[async_trait::async_trait]
pub trait RateLimiter: Send + Sync {
    /// Try to admit one request for `caller`.
    async fn allow(&self, caller: &str) -> Decision;

    /// The rule this limiter enforces.
    fn policy(&self) -> &Policy;
}

#[async_trait::async_trait]
impl<L> RateLimiter for Arc<L>
where
    L: RateLimiter + ?Sized,
{
    async fn allow(&self, caller: &str) -> Decision {
        (**self).allow(caller).await
    }

    fn policy(&self) -> &Policy {
        (**self).policy()
    }
}
