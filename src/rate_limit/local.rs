//! In-process token buckets, one per caller key.
//!
//! Each bucket refills continuously at `quota / window` tokens per second up to a burst of
//! `quota`. The bucket is stored as a single "theoretical arrival time" (TAT) in an `AtomicU64`:
//! a request is admitted when the TAT is no more than `quota - 1` refill intervals ahead of now,
//! and admission pushes the TAT one interval further. This is the same bucket expressed as a
//! single word, so withdrawal is one compare-and-swap and never takes the map lock.
//!
//! The map itself is guarded by one mutex, held only for lookup/insert. A background sweeper
//! ([`LocalTokenBucket::spawn_sweeper`]) wakes every [`SWEEP_INTERVAL`] and drops buckets idle
//! for at least [`IDLE_THRESHOLD`], so one-shot keys (e.g. client addresses seen once) do not
//! accumulate.

use crate::cancel::CancelSignal;
use crate::clock::{duration_micros, Clock, MonotonicClock};
use crate::rate_limit::{Decision, RateLimiter};
use crate::Policy;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

/// How often the sweeper wakes.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Buckets untouched for at least this long are evicted by the sweeper.
pub const IDLE_THRESHOLD: Duration = Duration::from_secs(3 * 60);

#[derive(Debug)]
struct Bucket {
    tat: AtomicU64,
    last_access: AtomicU64,
}

impl Bucket {
    fn new(now: u64) -> Self {
        Self { tat: AtomicU64::new(now), last_access: AtomicU64::new(now) }
    }

    fn try_take(&self, now: u64, interval: u64, tolerance: u64) -> bool {
        let mut tat = self.tat.load(Ordering::Acquire);
        loop {
            let base = tat.max(now);
            if base - now > tolerance {
                return false;
            }
            match self.tat.compare_exchange_weak(
                tat,
                base.saturating_add(interval),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => tat = actual,
            }
        }
    }
}

type BucketMap = Mutex<HashMap<String, Arc<Bucket>>>;

fn lock(map: &BucketMap) -> MutexGuard<'_, HashMap<String, Arc<Bucket>>> {
    // Buckets are plain atomics; a panic elsewhere cannot leave them half-written.
    map.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn evict(map: &BucketMap, now: u64, idle: u64) -> (usize, usize) {
    let mut guard = lock(map);
    let before = guard.len();
    guard.retain(|_, bucket| now.saturating_sub(bucket.last_access.load(Ordering::Acquire)) < idle);
    (before - guard.len(), guard.len())
}

/// Token-bucket limiter backed by process memory.
///
/// Clones share the same buckets.
///
/// ```
/// use std::time::Duration;
/// use tollgate::{LocalTokenBucket, Policy, RateLimiter};
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let policy = Policy::new(2, Duration::from_secs(60)).unwrap().with_namespace("pool");
/// let limiter = LocalTokenBucket::new(policy);
/// assert!(limiter.allow("node-a").await.is_allowed());
/// assert!(limiter.allow("node-a").await.is_allowed());
/// assert!(!limiter.allow("node-a").await.is_allowed());
/// assert!(limiter.allow("node-b").await.is_allowed());
/// # });
/// ```
#[derive(Clone)]
pub struct LocalTokenBucket {
    policy: Policy,
    buckets: Arc<BucketMap>,
    clock: Arc<dyn Clock>,
    interval: u64,
    tolerance: u64,
}

impl std::fmt::Debug for LocalTokenBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTokenBucket")
            .field("policy", &self.policy)
            .field("buckets", &self.len())
            .field("clock", &self.clock)
            .finish()
    }
}

impl LocalTokenBucket {
    /// Create a limiter enforcing `policy`. Call [`spawn_sweeper`](Self::spawn_sweeper) to
    /// enable idle eviction.
    pub fn new(policy: Policy) -> Self {
        // At least one microsecond per token; faster rates are indistinguishable from unlimited.
        let interval = duration_micros(policy.refill_interval()).max(1);
        let tolerance = interval.saturating_mul(u64::from(policy.quota() - 1));
        Self {
            policy,
            buckets: Arc::new(Mutex::new(HashMap::new())),
            clock: Arc::new(MonotonicClock::default()),
            interval,
            tolerance,
        }
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Number of live buckets.
    pub fn len(&self) -> usize {
        lock(&self.buckets).len()
    }

    /// Whether no bucket is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every bucket idle for at least [`IDLE_THRESHOLD`]. Returns how many were dropped.
    pub fn evict_idle(&self) -> usize {
        let (evicted, _) =
            evict(&self.buckets, self.clock.now_micros(), duration_micros(IDLE_THRESHOLD));
        evicted
    }

    /// Start the background sweeper on the current tokio runtime.
    ///
    /// The task stops when `shutdown` fires or when every clone of this limiter is dropped.
    pub fn spawn_sweeper(&self, shutdown: CancelSignal) -> JoinHandle<()> {
        let buckets: Weak<BucketMap> = Arc::downgrade(&self.buckets);
        let clock = self.clock.clone();
        let namespace = self.policy.namespace().to_string();
        let idle = duration_micros(IDLE_THRESHOLD);

        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + SWEEP_INTERVAL;
            let mut ticker = tokio::time::interval_at(start, SWEEP_INTERVAL);
            tracing::info!(namespace = %namespace, "local bucket sweeper started");
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(buckets) = buckets.upgrade() else { break };
                        let (evicted, remaining) = evict(&buckets, clock.now_micros(), idle);
                        if evicted > 0 {
                            tracing::debug!(namespace = %namespace, evicted, remaining, "evicted idle buckets");
                        }
                    }
                }
            }
            tracing::debug!(namespace = %namespace, "local bucket sweeper stopped");
        })
    }

    fn bucket(&self, key: String, now: u64) -> Arc<Bucket> {
        let mut guard = lock(&self.buckets);
        let bucket = guard.entry(key).or_insert_with(|| Arc::new(Bucket::new(now))).clone();
        bucket.last_access.store(now, Ordering::Release);
        bucket
    }
}

#[async_trait::async_trait]
impl RateLimiter for LocalTokenBucket {
    async fn allow(&self, caller: &str) -> Decision {
        if !self.policy.is_enabled() {
            return Decision::Allowed;
        }

        let now = self.clock.now_micros();
        let bucket = self.bucket(self.policy.key_for(caller), now);
        if bucket.try_take(now, self.interval, self.tolerance) {
            Decision::Allowed
        } else {
            Decision::exhausted(self.policy.refill_interval())
        }
    }

    fn policy(&self) -> &Policy {
        &self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::cancel_pair;
    use crate::clock::ManualClock;

    fn limiter(quota: u32, window: Duration) -> (LocalTokenBucket, ManualClock) {
        let clock = ManualClock::new();
        let policy = Policy::new(quota, window).unwrap().with_namespace("test");
        (LocalTokenBucket::new(policy).with_clock(clock.clone()), clock)
    }

    #[tokio::test]
    async fn admits_burst_then_rejects_with_refill_interval() {
        let (limiter, _clock) = limiter(3, Duration::from_secs(3));
        for _ in 0..3 {
            assert!(limiter.allow("k").await.is_allowed());
        }
        let denied = limiter.allow("k").await;
        assert!(!denied.is_allowed());
        assert_eq!(denied.retry_after(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn refills_continuously() {
        let (limiter, clock) = limiter(2, Duration::from_secs(2));
        assert!(limiter.allow("k").await.is_allowed());
        assert!(limiter.allow("k").await.is_allowed());
        assert!(!limiter.allow("k").await.is_allowed());

        clock.advance(Duration::from_millis(999));
        assert!(!limiter.allow("k").await.is_allowed());

        clock.advance(Duration::from_millis(1));
        assert!(limiter.allow("k").await.is_allowed());
        assert!(!limiter.allow("k").await.is_allowed());
    }

    #[tokio::test]
    async fn full_window_restores_full_burst() {
        let (limiter, clock) = limiter(5, Duration::from_secs(10));
        for _ in 0..5 {
            assert!(limiter.allow("k").await.is_allowed());
        }
        assert!(!limiter.allow("k").await.is_allowed());

        clock.advance(Duration::from_secs(60));
        for _ in 0..5 {
            assert!(limiter.allow("k").await.is_allowed());
        }
        assert!(!limiter.allow("k").await.is_allowed());
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let (limiter, _clock) = limiter(1, Duration::from_secs(60));
        assert!(limiter.allow("a").await.is_allowed());
        assert!(!limiter.allow("a").await.is_allowed());
        assert!(limiter.allow("b").await.is_allowed());
        assert_eq!(limiter.len(), 2);
    }

    #[tokio::test]
    async fn disabled_policy_never_creates_buckets() {
        let clock = ManualClock::new();
        let policy = Policy::new(1, Duration::from_secs(60)).unwrap().with_enabled(false);
        let limiter = LocalTokenBucket::new(policy).with_clock(clock);
        for _ in 0..100 {
            assert_eq!(limiter.allow("k").await, Decision::Allowed);
        }
        assert!(limiter.is_empty());
    }

    #[tokio::test]
    async fn evicts_only_idle_buckets() {
        let (limiter, clock) = limiter(1, Duration::from_secs(60));
        limiter.allow("old").await;
        clock.advance(Duration::from_secs(120));
        limiter.allow("fresh").await;
        clock.advance(Duration::from_secs(60));

        assert_eq!(limiter.evict_idle(), 1);
        assert_eq!(limiter.len(), 1);

        // The evicted key starts over with a full bucket.
        assert!(limiter.allow("old").await.is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_evicts_on_tick_and_stops_on_cancel() {
        let (limiter, clock) = limiter(1, Duration::from_secs(60));
        let (handle, signal) = cancel_pair();
        let task = limiter.spawn_sweeper(signal);

        assert!(limiter.allow("k").await.is_allowed());
        assert!(!limiter.allow("k").await.is_allowed());
        clock.advance(IDLE_THRESHOLD);

        tokio::time::sleep(SWEEP_INTERVAL + Duration::from_secs(1)).await;
        tokio::task::yield_now().await;
        assert!(limiter.is_empty());

        handle.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_exits_when_limiter_dropped() {
        let (limiter, _clock) = limiter(1, Duration::from_secs(60));
        let task = limiter.spawn_sweeper(CancelSignal::never());
        drop(limiter);
        tokio::time::sleep(SWEEP_INTERVAL * 2).await;
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("sweeper should exit")
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_callers_never_exceed_burst() {
        let (limiter, _clock) = limiter(50, Duration::from_secs(3600));
        let handles: Vec<_> = (0..400)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.allow("shared").await.is_allowed() })
            })
            .collect();
        let admitted = futures::future::join_all(handles)
            .await
            .into_iter()
            .filter(|r| *r.as_ref().unwrap())
            .count();
        assert_eq!(admitted, 50);
    }
}
