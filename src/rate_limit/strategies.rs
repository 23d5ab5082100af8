//! Distributed rate-limiting algorithms over a [`SharedStore`](crate::rate_limit::SharedStore).
//!
//! | Algorithm | Store layout | Trade-off |
//! |---|---|---|
//! | [`FixedWindow`] | counter `<ns>:<caller>:<window index>` | cheapest; up to 2x quota across a window edge |
//! | [`SlidingWindow`] | hash `<ns>:<caller>`, one expiring field per request | smooth; one field per admitted request |
//! | [`TokenBucket`] | bucket `<ns>:<caller>` updated by one atomic store call | smooth with bursts; needs a scripting store |
//!
//! All three fail closed: when the store errors, the request is denied with
//! [`DenialReason::BackendUnavailable`](crate::rate_limit::DenialReason) and a full-window retry
//! hint, and the error is logged with the key and policy.

use crate::rate_limit::Decision;
use crate::Policy;

mod fixed_window;
mod sliding_window;
mod token_bucket;

pub use fixed_window::FixedWindow;
pub use sliding_window::SlidingWindow;
pub use token_bucket::TokenBucket;

fn store_failure(
    limiter: &'static str,
    op: &'static str,
    key: &str,
    policy: &Policy,
    error: &dyn std::error::Error,
) -> Decision {
    tracing::error!(
        limiter,
        op,
        key,
        quota = policy.quota(),
        window = ?policy.window(),
        error = %error,
        "shared store failed, rejecting request"
    );
    Decision::unavailable(policy.window())
}
