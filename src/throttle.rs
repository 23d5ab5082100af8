//! Process-wide concurrency throttle with a bounded backlog.
//!
//! Two counting semaphores are created once and never resized:
//!
//! - the **serving** pool holds `limit` permits, one per request currently running;
//! - the **backlog** pool holds `limit + backlog_limit` permits, one per request admitted at all
//!   (running or waiting).
//!
//! A request first takes a backlog permit without waiting (none free means
//! [`ThrottleRejection::CapacityExceeded`]), then waits up to `backlog_timeout` for a serving
//! permit. Both permits live in a [`ThrottlePermit`] and go back to their pools when it drops,
//! so a finished, failed, cancelled or panicking request always returns its slots. Waiters are
//! woken in the semaphore's order, which is not a promise to callers.
//!
//! ```
//! use std::time::Duration;
//! use tollgate::{CancelSignal, ConcurrencyThrottle};
//!
//! # #[tokio::main] async fn main() {
//! let throttle = ConcurrencyThrottle::with_backlog(2, 8, Duration::from_secs(5)).unwrap();
//! let answer = throttle
//!     .execute(&CancelSignal::never(), || async { Ok::<_, std::io::Error>(42) })
//!     .await
//!     .unwrap();
//! assert_eq!(answer, 42);
//! assert_eq!(throttle.stats().served, 1);
//! # }
//! ```

use crate::cancel::CancelSignal;
use crate::error::AdmissionError;
use http::StatusCode;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

pub mod middleware;

pub use middleware::{ThrottleLayer, ThrottleService};

/// How long a request may wait in the backlog unless configured otherwise.
pub const DEFAULT_BACKLOG_TIMEOUT: Duration = Duration::from_secs(60);

/// Computes an optional `Retry-After` for a rejection; the argument is `true` for cancellations.
pub type RetryAfterFn = Arc<dyn Fn(bool) -> Option<Duration> + Send + Sync>;

/// Why the throttle turned a request away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ThrottleRejection {
    /// Serving and backlog slots were all taken.
    #[error("server capacity exceeded")]
    CapacityExceeded,
    /// The request waited in the backlog for the whole backlog timeout.
    #[error("timed out while waiting for a pending request to complete")]
    TimedOut,
    /// The caller cancelled before a serving slot freed up.
    #[error("context was canceled")]
    Canceled,
}

/// Errors produced while building a [`ThrottleConfig`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ThrottleBuildError {
    /// `limit` must be > 0.
    #[error("limit must be > 0 (got {0})")]
    InvalidLimit(usize),
    /// `backlog_timeout` must be > 0.
    #[error("backlog timeout must be > 0")]
    ZeroBacklogTimeout,
    /// `limit + backlog_limit` does not fit a semaphore.
    #[error("limit + backlog_limit must be <= {max} (got {requested})")]
    TooManySlots { requested: u128, max: usize },
}

/// Validated throttle settings.
#[derive(Clone)]
pub struct ThrottleConfig {
    limit: usize,
    backlog_limit: usize,
    backlog_timeout: Duration,
    status_code: StatusCode,
    retry_after: Option<RetryAfterFn>,
}

impl std::fmt::Debug for ThrottleConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThrottleConfig")
            .field("limit", &self.limit)
            .field("backlog_limit", &self.backlog_limit)
            .field("backlog_timeout", &self.backlog_timeout)
            .field("status_code", &self.status_code)
            .field("retry_after", &self.retry_after.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

impl ThrottleConfig {
    /// Start a builder for `limit` concurrent requests.
    pub fn builder(limit: usize) -> ThrottleConfigBuilder {
        ThrottleConfigBuilder::new(limit)
    }

    /// Maximum requests served at once.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Extra requests allowed to wait.
    pub fn backlog_limit(&self) -> usize {
        self.backlog_limit
    }

    /// Longest wait in the backlog.
    pub fn backlog_timeout(&self) -> Duration {
        self.backlog_timeout
    }

    /// Status code of HTTP rejections.
    pub fn status_code(&self) -> StatusCode {
        self.status_code
    }

    /// `Retry-After` for a rejection, if a function was configured.
    pub fn retry_after(&self, canceled: bool) -> Option<Duration> {
        self.retry_after.as_ref().and_then(|f| f(canceled))
    }
}

/// Builder for [`ThrottleConfig`].
pub struct ThrottleConfigBuilder {
    limit: usize,
    backlog_limit: usize,
    backlog_timeout: Duration,
    status_code: StatusCode,
    retry_after: Option<RetryAfterFn>,
}

impl ThrottleConfigBuilder {
    /// No backlog, [`DEFAULT_BACKLOG_TIMEOUT`], status 429, no `Retry-After`.
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            backlog_limit: 0,
            backlog_timeout: DEFAULT_BACKLOG_TIMEOUT,
            status_code: StatusCode::TOO_MANY_REQUESTS,
            retry_after: None,
        }
    }

    /// Allow `backlog_limit` requests to wait for a serving slot.
    pub fn backlog_limit(mut self, backlog_limit: usize) -> Self {
        self.backlog_limit = backlog_limit;
        self
    }

    /// Longest time a request waits in the backlog. Must be > 0.
    pub fn backlog_timeout(mut self, timeout: Duration) -> Self {
        self.backlog_timeout = timeout;
        self
    }

    /// Status code for rejected HTTP requests.
    pub fn status_code(mut self, status: StatusCode) -> Self {
        self.status_code = status;
        self
    }

    /// Compute a `Retry-After` for rejections. The argument tells whether the request was
    /// cancelled rather than turned away.
    pub fn retry_after<F>(mut self, f: F) -> Self
    where
        F: Fn(bool) -> Option<Duration> + Send + Sync + 'static,
    {
        self.retry_after = Some(Arc::new(f));
        self
    }

    /// Validate and build.
    pub fn build(self) -> Result<ThrottleConfig, ThrottleBuildError> {
        if self.limit == 0 {
            return Err(ThrottleBuildError::InvalidLimit(self.limit));
        }
        if self.backlog_timeout.is_zero() {
            return Err(ThrottleBuildError::ZeroBacklogTimeout);
        }
        let requested = self.limit as u128 + self.backlog_limit as u128;
        if requested > Semaphore::MAX_PERMITS as u128 {
            return Err(ThrottleBuildError::TooManySlots { requested, max: Semaphore::MAX_PERMITS });
        }
        Ok(ThrottleConfig {
            limit: self.limit,
            backlog_limit: self.backlog_limit,
            backlog_timeout: self.backlog_timeout,
            status_code: self.status_code,
            retry_after: self.retry_after,
        })
    }
}

/// Counts of throttle outcomes since creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThrottleStats {
    /// Requests that got a serving slot.
    pub served: u64,
    /// Requests rejected because no slot was free.
    pub capacity_exceeded: u64,
    /// Requests rejected after waiting out the backlog timeout.
    pub timed_out: u64,
    /// Requests whose caller cancelled.
    pub canceled: u64,
}

#[derive(Debug, Default)]
struct Counters {
    served: AtomicU64,
    capacity_exceeded: AtomicU64,
    timed_out: AtomicU64,
    canceled: AtomicU64,
}

/// Both slots held by an admitted request; dropping it frees them.
#[derive(Debug)]
#[must_use = "the request is only admitted while the permit is held"]
pub struct ThrottlePermit {
    _serving: OwnedSemaphorePermit,
    _backlog: OwnedSemaphorePermit,
}

#[derive(Debug)]
struct Shared {
    serving: Arc<Semaphore>,
    backlog: Arc<Semaphore>,
    config: ThrottleConfig,
    counters: Counters,
}

/// Caps how many requests run at once, with a bounded, time-limited wait for the rest.
///
/// Clones share the same pools.
#[derive(Debug, Clone)]
pub struct ConcurrencyThrottle {
    shared: Arc<Shared>,
}

impl ConcurrencyThrottle {
    /// Serve at most `limit` requests at once and reject the rest immediately.
    pub fn new(limit: usize) -> Result<Self, ThrottleBuildError> {
        Ok(Self::from_config(ThrottleConfig::builder(limit).build()?))
    }

    /// Serve at most `limit` requests and let up to `backlog_limit` more wait `backlog_timeout`.
    pub fn with_backlog(
        limit: usize,
        backlog_limit: usize,
        backlog_timeout: Duration,
    ) -> Result<Self, ThrottleBuildError> {
        let config = ThrottleConfig::builder(limit)
            .backlog_limit(backlog_limit)
            .backlog_timeout(backlog_timeout)
            .build()?;
        Ok(Self::from_config(config))
    }

    /// Build from validated settings.
    pub fn from_config(config: ThrottleConfig) -> Self {
        let shared = Shared {
            serving: Arc::new(Semaphore::new(config.limit)),
            backlog: Arc::new(Semaphore::new(config.limit + config.backlog_limit)),
            config,
            counters: Counters::default(),
        };
        Self { shared: Arc::new(shared) }
    }

    /// The settings this throttle runs with.
    pub fn config(&self) -> &ThrottleConfig {
        &self.shared.config
    }

    /// Requests currently holding a serving slot.
    pub fn in_flight(&self) -> usize {
        self.shared.config.limit.saturating_sub(self.shared.serving.available_permits())
    }

    /// Requests currently waiting for a serving slot.
    pub fn waiting(&self) -> usize {
        self.admitted().saturating_sub(self.in_flight())
    }

    fn admitted(&self) -> usize {
        let total = self.shared.config.limit + self.shared.config.backlog_limit;
        total.saturating_sub(self.shared.backlog.available_permits())
    }

    /// Snapshot of outcome counters.
    pub fn stats(&self) -> ThrottleStats {
        let c = &self.shared.counters;
        ThrottleStats {
            served: c.served.load(Ordering::Relaxed),
            capacity_exceeded: c.capacity_exceeded.load(Ordering::Relaxed),
            timed_out: c.timed_out.load(Ordering::Relaxed),
            canceled: c.canceled.load(Ordering::Relaxed),
        }
    }

    /// Wait for a serving slot.
    ///
    /// Rejects immediately when the backlog is full, after `backlog_timeout` when no serving slot
    /// frees up, and as soon as `cancel` fires. Any slot taken before a rejection is returned.
    pub async fn acquire(&self, cancel: &CancelSignal) -> Result<ThrottlePermit, ThrottleRejection> {
        let shared = &self.shared;
        if cancel.is_cancelled() {
            return Err(self.reject(ThrottleRejection::Canceled));
        }

        let backlog = match shared.backlog.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => return Err(self.reject(ThrottleRejection::CapacityExceeded)),
        };

        if let Ok(serving) = shared.serving.clone().try_acquire_owned() {
            return Ok(self.admit(serving, backlog));
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(self.reject(ThrottleRejection::Canceled)),
            acquired = shared.serving.clone().acquire_owned() => match acquired {
                Ok(serving) => Ok(self.admit(serving, backlog)),
                // The pools are never closed.
                Err(_) => Err(self.reject(ThrottleRejection::CapacityExceeded)),
            },
            _ = tokio::time::sleep(shared.config.backlog_timeout) => {
                Err(self.reject(ThrottleRejection::TimedOut))
            }
        }
    }

    /// Run `operation` once a serving slot is free, holding the slot until it completes.
    pub async fn execute<T, E, Fut, Op>(
        &self,
        cancel: &CancelSignal,
        operation: Op,
    ) -> Result<T, AdmissionError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
        Op: FnOnce() -> Fut,
    {
        let started = tokio::time::Instant::now();
        let permit = match self.acquire(cancel).await {
            Ok(permit) => permit,
            Err(ThrottleRejection::CapacityExceeded) => {
                let config = &self.shared.config;
                return Err(AdmissionError::CapacityExceeded {
                    admitted: self.admitted(),
                    max: config.limit + config.backlog_limit,
                });
            }
            Err(ThrottleRejection::TimedOut) => {
                return Err(AdmissionError::TimedOut {
                    waited: started.elapsed(),
                    timeout: self.shared.config.backlog_timeout,
                });
            }
            Err(ThrottleRejection::Canceled) => return Err(AdmissionError::Canceled),
        };

        let result = operation().await;
        drop(permit);
        result.map_err(AdmissionError::Inner)
    }

    fn admit(&self, serving: OwnedSemaphorePermit, backlog: OwnedSemaphorePermit) -> ThrottlePermit {
        self.shared.counters.served.fetch_add(1, Ordering::Relaxed);
        ThrottlePermit { _serving: serving, _backlog: backlog }
    }

    fn reject(&self, rejection: ThrottleRejection) -> ThrottleRejection {
        let c = &self.shared.counters;
        let counter = match rejection {
            ThrottleRejection::CapacityExceeded => &c.capacity_exceeded,
            ThrottleRejection::TimedOut => &c.timed_out,
            ThrottleRejection::Canceled => &c.canceled,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            cause = %rejection,
            in_flight = self.in_flight(),
            waiting = self.waiting(),
            "throttle rejected request"
        );
        rejection
    }
}
