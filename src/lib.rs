#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # tollgate
//!
//! Admission control for async HTTP services: keyed rate limiting and a process-wide
//! concurrency throttle, both usable as tower middleware.
//!
//! ## Features
//!
//! - **Local token buckets** per caller key, lock-free withdrawal, idle sweeping
//! - **Shared-store limiters** (fixed window, sliding window, token bucket) that enforce one
//!   quota across every instance; errors fail closed
//! - **Concurrency throttle** with a serving pool, a bounded backlog and a backlog timeout
//! - **Tower layers** answering rejections with `429`, `Retry-After` and a JSON body
//! - **JSON configuration** for the whole stack
//!
//! ## Quick Start
//!
//! ```rust
//! use http::{Request, Response};
//! use std::convert::Infallible;
//! use std::time::Duration;
//! use tollgate::prelude::*;
//! use tower::{service_fn, ServiceBuilder, ServiceExt};
//!
//! #[tokio::main]
//! async fn main() {
//!     let policy = Policy::new(100, Duration::from_secs(60)).unwrap().with_namespace("api");
//!     let by_client = always(|req: &Request<String>| {
//!         req.headers()
//!             .get("x-client-id")
//!             .and_then(|v| v.to_str().ok())
//!             .map(str::to_owned)
//!             .ok_or_else(|| KeyError::new("missing x-client-id"))
//!     });
//!
//!     let svc = ServiceBuilder::new()
//!         .layer(ThrottleLayer::new(ConcurrencyThrottle::new(64).unwrap()))
//!         .layer(RateLimitLayer::new(LocalTokenBucket::new(policy), by_client))
//!         .service(service_fn(|_req: Request<String>| async {
//!             Ok::<_, Infallible>(Response::new(String::from("hello")))
//!         }));
//!
//!     let req = Request::builder().header("x-client-id", "7").body(String::new()).unwrap();
//!     let res = svc.oneshot(req).await.unwrap();
//!     assert_eq!(res.status(), 200);
//! }
//! ```

pub mod cancel;
pub mod clock;
pub mod config;
pub mod error;
pub mod policy;
pub mod prelude;
pub mod rate_limit;
pub mod response;
pub mod throttle;

// Re-exports
pub use cancel::{cancel_pair, CancelHandle, CancelSignal};
pub use clock::{Clock, ManualClock, MonotonicClock, SystemClock};
pub use config::{AdmissionConfig, ConfigError};
pub use error::AdmissionError;
pub use policy::{Policy, PolicyError};
pub use rate_limit::{
    Decision, DenialReason, FixedWindow, InMemorySharedStore, LocalTokenBucket, RateLimitLayer,
    RateLimiter, SharedStore, SlidingWindow, TokenBucket,
};
pub use throttle::{
    ConcurrencyThrottle, ThrottleBuildError, ThrottleConfig, ThrottleLayer, ThrottlePermit,
    ThrottleRejection, ThrottleStats,
};
