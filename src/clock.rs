//! Clock abstractions used by the rate limiters and the in-memory shared store.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Clock abstraction so timing can be faked in tests.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Microseconds since this clock's epoch.
    fn now_micros(&self) -> u64;

    /// Milliseconds since this clock's epoch.
    fn now_millis(&self) -> u64 {
        self.now_micros() / 1_000
    }
}

/// Monotonic clock backed by `Instant::now()`.
///
/// Notes: resets when the process restarts. Fine for process-local buckets, wrong for anything
/// compared across instances; use [`SystemClock`] there.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    start: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self { start: Instant::now() }
    }
}

impl Clock for MonotonicClock {
    fn now_micros(&self) -> u64 {
        u64::try_from(self.start.elapsed().as_micros()).unwrap_or(u64::MAX)
    }
}

/// Wall clock measured from the Unix epoch.
///
/// Window indexes and log timestamps written to a shared store must agree between instances,
/// so the shared algorithms default to this clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_micros(&self) -> u64 {
        let since_epoch = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        u64::try_from(since_epoch.as_micros()).unwrap_or(u64::MAX)
    }
}

/// Manually driven clock. Clones share the same time source.
///
/// ```
/// use std::time::Duration;
/// use tollgate::clock::{Clock, ManualClock};
///
/// let clock = ManualClock::new();
/// clock.advance(Duration::from_millis(1500));
/// assert_eq!(clock.now_millis(), 1500);
/// ```
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    /// Start at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start at an arbitrary instant, e.g. a realistic Unix timestamp.
    pub fn starting_at(start: Duration) -> Self {
        let clock = Self::new();
        clock.set(start);
        clock
    }

    /// Move time forward.
    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(duration_micros(by), Ordering::SeqCst);
    }

    /// Jump to an absolute instant.
    pub fn set(&self, at: Duration) {
        self.now.store(duration_micros(at), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_micros(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

pub(crate) fn duration_micros(d: Duration) -> u64 {
    u64::try_from(d.as_micros()).unwrap_or(u64::MAX)
}
