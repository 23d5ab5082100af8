use crate::cancel::CancelSignal;
use crate::clock::{duration_micros, Clock, SystemClock};
use crate::rate_limit::local::SWEEP_INTERVAL;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Shape of a token bucket kept in a shared store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketSpec {
    /// Burst ceiling (the policy quota).
    pub capacity: u32,
    /// Time to regain one token (`window / quota`).
    pub refill_interval: Duration,
    /// Expiry applied to the bucket after each touch; a bucket idle this long is full anyway.
    pub idle_ttl: Duration,
}

/// Outcome of an atomic token withdrawal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenGrant {
    /// Whether a token was withdrawn.
    pub allowed: bool,
    /// Time until the next token, when not allowed.
    pub wait: Duration,
}

/// Abstract interface to a shared key/value service (e.g. Redis) used by the distributed
/// algorithms.
///
/// The operations mirror what such a service offers natively: counters with expiry, hashes
/// whose fields expire individually, and one scripted token-bucket withdrawal. Each method is
/// atomic on its own; the algorithms never assume more isolation than that.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Error type for storage operations.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Read an integer counter. `None` if absent or expired.
    async fn get_counter(&self, key: &str) -> Result<Option<u64>, Self::Error>;

    /// Overwrite a counter and set its expiry.
    async fn set_counter(&self, key: &str, value: u64, ttl: Duration) -> Result<(), Self::Error>;

    /// Atomically increment a counter, returning the new value.
    async fn incr(&self, key: &str) -> Result<u64, Self::Error>;

    /// Remaining time to live of a key. `None` if the key is absent or has no expiry.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, Self::Error>;

    /// Number of live fields in a hash.
    async fn field_count(&self, key: &str) -> Result<u64, Self::Error>;

    /// Names of the live fields in a hash, in no particular order.
    async fn field_names(&self, key: &str) -> Result<Vec<String>, Self::Error>;

    /// Set a hash field only if it does not exist. Returns whether it was set.
    async fn set_field_if_absent(
        &self,
        key: &str,
        field: &str,
        value: &str,
    ) -> Result<bool, Self::Error>;

    /// Give one hash field its own expiry.
    async fn expire_field(&self, key: &str, field: &str, ttl: Duration)
        -> Result<(), Self::Error>;

    /// Remaining time to live of one hash field. `None` if absent or without expiry.
    async fn field_ttl(&self, key: &str, field: &str) -> Result<Option<Duration>, Self::Error>;

    /// Delete one hash field.
    async fn remove_field(&self, key: &str, field: &str) -> Result<(), Self::Error>;

    /// Atomically refill the bucket at `key` and try to withdraw one token.
    ///
    /// Implementations must perform read, refill, withdraw, and write as one indivisible step
    /// (a server-side script, a transaction, or a lock), using the store's own notion of time.
    /// A missing bucket starts full.
    async fn take_token(&self, key: &str, spec: BucketSpec) -> Result<TokenGrant, Self::Error>;

    /// Start a background task that frees expired entries, for stores that only expire lazily.
    ///
    /// Stores whose server drops expired keys itself keep this default and return `None`.
    fn spawn_sweeper(&self, _shutdown: CancelSignal) -> Option<JoinHandle<()>> {
        None
    }
}

#[derive(Debug, Clone)]
struct Expiring<T> {
    value: T,
    expires_at: Option<u64>,
}

impl<T> Expiring<T> {
    fn live(&self, now: u64) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }

    fn remaining(&self, now: u64) -> Option<Duration> {
        self.expires_at.map(|at| Duration::from_micros(at.saturating_sub(now)))
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    counters: HashMap<String, Expiring<u64>>,
    hashes: HashMap<String, HashMap<String, Expiring<String>>>,
    // Theoretical arrival time of the next token, in clock micros.
    buckets: HashMap<String, Expiring<u64>>,
}

impl MemoryState {
    fn counter(&mut self, key: &str, now: u64) -> Option<&mut Expiring<u64>> {
        if self.counters.get(key).is_some_and(|c| !c.live(now)) {
            self.counters.remove(key);
        }
        self.counters.get_mut(key)
    }

    fn hash(&mut self, key: &str, now: u64) -> Option<&mut HashMap<String, Expiring<String>>> {
        let hash = self.hashes.get_mut(key)?;
        hash.retain(|_, field| field.live(now));
        if hash.is_empty() {
            self.hashes.remove(key);
            return None;
        }
        self.hashes.get_mut(key)
    }

    fn len(&self) -> usize {
        self.counters.len() + self.hashes.len() + self.buckets.len()
    }

    fn purge_expired(&mut self, now: u64) -> usize {
        let before = self.len();
        self.counters.retain(|_, counter| counter.live(now));
        self.buckets.retain(|_, bucket| bucket.live(now));
        self.hashes.retain(|_, hash| {
            hash.retain(|_, field| field.live(now));
            !hash.is_empty()
        });
        before - self.len()
    }
}

fn lock_state(state: &Mutex<MemoryState>) -> MutexGuard<'_, MemoryState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// In-process [`SharedStore`] with lazy expiry.
///
/// Behaves like a single shared-store node, so every clone sees the same data; useful for tests
/// and for running the distributed algorithms in a single-instance deployment.
///
/// Expired entries are dropped when their key is touched again. Keys that are never touched
/// again (fixed-window counters of past windows, one-shot callers) are only freed by
/// [`purge_expired`](Self::purge_expired) or by the sweeper started with
/// [`SharedStore::spawn_sweeper`], which runs it every [`SWEEP_INTERVAL`].
#[derive(Clone)]
pub struct InMemorySharedStore {
    state: Arc<Mutex<MemoryState>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for InMemorySharedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemorySharedStore").field("clock", &self.clock).finish_non_exhaustive()
    }
}

impl Default for InMemorySharedStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemorySharedStore {
    /// Empty store on the wall clock.
    pub fn new() -> Self {
        Self { state: Arc::new(Mutex::new(MemoryState::default())), clock: Arc::new(SystemClock) }
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Number of stored keys (counters, hashes and buckets), expired or not.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired counter, hash field and bucket. Returns how many keys were freed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_micros();
        self.lock().purge_expired(now)
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        lock_state(&self.state)
    }

    fn deadline(&self, ttl: Duration) -> u64 {
        self.clock.now_micros().saturating_add(duration_micros(ttl))
    }
}

#[async_trait]
impl SharedStore for InMemorySharedStore {
    type Error = std::convert::Infallible;

    async fn get_counter(&self, key: &str) -> Result<Option<u64>, Self::Error> {
        let now = self.clock.now_micros();
        Ok(self.lock().counter(key, now).map(|c| c.value))
    }

    async fn set_counter(&self, key: &str, value: u64, ttl: Duration) -> Result<(), Self::Error> {
        let expires_at = Some(self.deadline(ttl));
        self.lock().counters.insert(key.to_string(), Expiring { value, expires_at });
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<u64, Self::Error> {
        let now = self.clock.now_micros();
        let mut state = self.lock();
        match state.counter(key, now) {
            Some(counter) => {
                counter.value = counter.value.saturating_add(1);
                Ok(counter.value)
            }
            None => {
                // Like INCR on a missing key: starts at 1 with no expiry.
                state.counters.insert(key.to_string(), Expiring { value: 1, expires_at: None });
                Ok(1)
            }
        }
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, Self::Error> {
        let now = self.clock.now_micros();
        Ok(self.lock().counter(key, now).and_then(|c| c.remaining(now)))
    }

    async fn field_count(&self, key: &str) -> Result<u64, Self::Error> {
        let now = self.clock.now_micros();
        Ok(self.lock().hash(key, now).map_or(0, |h| h.len() as u64))
    }

    async fn field_names(&self, key: &str) -> Result<Vec<String>, Self::Error> {
        let now = self.clock.now_micros();
        Ok(self.lock().hash(key, now).map(|h| h.keys().cloned().collect()).unwrap_or_default())
    }

    async fn set_field_if_absent(
        &self,
        key: &str,
        field: &str,
        value: &str,
    ) -> Result<bool, Self::Error> {
        let now = self.clock.now_micros();
        let mut state = self.lock();
        // Drop expired fields first so a stale one does not block the insert.
        state.hash(key, now);
        let hash = state.hashes.entry(key.to_string()).or_default();
        if hash.contains_key(field) {
            return Ok(false);
        }
        hash.insert(field.to_string(), Expiring { value: value.to_string(), expires_at: None });
        Ok(true)
    }

    async fn expire_field(
        &self,
        key: &str,
        field: &str,
        ttl: Duration,
    ) -> Result<(), Self::Error> {
        let now = self.clock.now_micros();
        let deadline = self.deadline(ttl);
        if let Some(entry) = self.lock().hash(key, now).and_then(|h| h.get_mut(field)) {
            entry.expires_at = Some(deadline);
        }
        Ok(())
    }

    async fn field_ttl(&self, key: &str, field: &str) -> Result<Option<Duration>, Self::Error> {
        let now = self.clock.now_micros();
        Ok(self.lock().hash(key, now).and_then(|h| h.get(field)).and_then(|f| f.remaining(now)))
    }

    async fn remove_field(&self, key: &str, field: &str) -> Result<(), Self::Error> {
        let mut state = self.lock();
        if let Some(hash) = state.hashes.get_mut(key) {
            hash.remove(field);
            if hash.is_empty() {
                state.hashes.remove(key);
            }
        }
        Ok(())
    }

    async fn take_token(&self, key: &str, spec: BucketSpec) -> Result<TokenGrant, Self::Error> {
        let now = self.clock.now_micros();
        let interval = duration_micros(spec.refill_interval).max(1);
        let tolerance = interval.saturating_mul(u64::from(spec.capacity.saturating_sub(1)));
        let expires_at = Some(self.deadline(spec.idle_ttl));

        let mut state = self.lock();
        let tat = state.buckets.get(key).filter(|b| b.live(now)).map_or(now, |b| b.value);
        let base = tat.max(now);
        if base - now > tolerance {
            let wait = Duration::from_micros(base - now - tolerance);
            return Ok(TokenGrant { allowed: false, wait });
        }
        state
            .buckets
            .insert(key.to_string(), Expiring { value: base.saturating_add(interval), expires_at });
        Ok(TokenGrant { allowed: true, wait: Duration::ZERO })
    }

    /// The task stops when `shutdown` fires or when every clone of this store is dropped.
    fn spawn_sweeper(&self, shutdown: CancelSignal) -> Option<JoinHandle<()>> {
        let state = Arc::downgrade(&self.state);
        let clock = self.clock.clone();

        Some(tokio::spawn(async move {
            let start = tokio::time::Instant::now() + SWEEP_INTERVAL;
            let mut ticker = tokio::time::interval_at(start, SWEEP_INTERVAL);
            tracing::info!("in-memory store sweeper started");
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(state) = state.upgrade() else { break };
                        let (purged, remaining) = {
                            let mut guard = lock_state(&state);
                            let purged = guard.purge_expired(clock.now_micros());
                            (purged, guard.len())
                        };
                        if purged > 0 {
                            tracing::debug!(purged, remaining, "purged expired store entries");
                        }
                    }
                }
            }
            tracing::debug!("in-memory store sweeper stopped");
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::cancel_pair;
    use crate::clock::ManualClock;

    fn store() -> (InMemorySharedStore, ManualClock) {
        let clock = ManualClock::new();
        (InMemorySharedStore::new().with_clock(clock.clone()), clock)
    }

    #[tokio::test]
    async fn counters_expire() {
        let (store, clock) = store();
        store.set_counter("c", 0, Duration::from_secs(10)).await.unwrap();
        assert_eq!(store.incr("c").await.unwrap(), 1);
        assert_eq!(store.get_counter("c").await.unwrap(), Some(1));
        clock.advance(Duration::from_secs(4));
        assert_eq!(store.ttl("c").await.unwrap(), Some(Duration::from_secs(6)));
        clock.advance(Duration::from_secs(6));
        assert_eq!(store.get_counter("c").await.unwrap(), None);
        assert_eq!(store.ttl("c").await.unwrap(), None);
    }

    #[tokio::test]
    async fn incr_on_missing_key_has_no_expiry() {
        let (store, _clock) = store();
        assert_eq!(store.incr("fresh").await.unwrap(), 1);
        assert_eq!(store.ttl("fresh").await.unwrap(), None);
    }

    #[tokio::test]
    async fn hash_fields_expire_individually() {
        let (store, clock) = store();
        assert!(store.set_field_if_absent("h", "1", "1").await.unwrap());
        assert!(!store.set_field_if_absent("h", "1", "1").await.unwrap());
        store.expire_field("h", "1", Duration::from_secs(1)).await.unwrap();

        clock.advance(Duration::from_millis(500));
        assert!(store.set_field_if_absent("h", "2", "1").await.unwrap());
        store.expire_field("h", "2", Duration::from_secs(1)).await.unwrap();
        assert_eq!(store.field_count("h").await.unwrap(), 2);

        clock.advance(Duration::from_millis(500));
        assert_eq!(store.field_names("h").await.unwrap(), vec!["2".to_string()]);
        assert_eq!(store.field_ttl("h", "2").await.unwrap(), Some(Duration::from_millis(500)));
        assert_eq!(store.field_ttl("h", "1").await.unwrap(), None);

        clock.advance(Duration::from_millis(500));
        assert_eq!(store.field_count("h").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn token_bucket_refills_and_reports_wait() {
        let (store, clock) = store();
        let spec = BucketSpec {
            capacity: 2,
            refill_interval: Duration::from_millis(500),
            idle_ttl: Duration::from_secs(1),
        };
        assert!(store.take_token("b", spec).await.unwrap().allowed);
        assert!(store.take_token("b", spec).await.unwrap().allowed);

        let denied = store.take_token("b", spec).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.wait, Duration::from_millis(500));

        clock.advance(Duration::from_millis(200));
        let denied = store.take_token("b", spec).await.unwrap();
        assert_eq!(denied.wait, Duration::from_millis(300));

        clock.advance(Duration::from_millis(300));
        assert!(store.take_token("b", spec).await.unwrap().allowed);
    }

    async fn fill_one_of_each(store: &InMemorySharedStore) {
        store.set_counter("c", 0, Duration::from_secs(1)).await.unwrap();
        store.set_field_if_absent("h", "1", "1").await.unwrap();
        store.expire_field("h", "1", Duration::from_secs(1)).await.unwrap();
        let spec = BucketSpec {
            capacity: 1,
            refill_interval: Duration::from_secs(1),
            idle_ttl: Duration::from_secs(1),
        };
        store.take_token("b", spec).await.unwrap();
    }

    #[tokio::test]
    async fn purge_frees_keys_nobody_reads_again() {
        let (store, clock) = store();
        fill_one_of_each(&store).await;
        store.set_field_if_absent("h2", "1", "1").await.unwrap();
        assert_eq!(store.len(), 4);

        clock.advance(Duration::from_secs(1));
        // Expired but untouched keys still occupy memory until purged.
        assert_eq!(store.len(), 4);
        assert_eq!(store.purge_expired(), 3);
        // A field without expiry is kept.
        assert_eq!(store.len(), 1);
        assert_eq!(store.field_count("h2").await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_purges_on_tick_and_stops_on_cancel() {
        let (store, clock) = store();
        let (handle, signal) = cancel_pair();
        let task = store.spawn_sweeper(signal).expect("in-memory store sweeps");

        fill_one_of_each(&store).await;
        clock.advance(Duration::from_secs(5));

        tokio::time::sleep(SWEEP_INTERVAL + Duration::from_secs(1)).await;
        tokio::task::yield_now().await;
        assert!(store.is_empty());

        handle.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_exits_when_store_dropped() {
        let (store, _clock) = store();
        let task = store.spawn_sweeper(CancelSignal::never()).expect("in-memory store sweeps");
        drop(store);
        tokio::time::sleep(SWEEP_INTERVAL * 2).await;
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("sweeper should exit")
            .unwrap();
    }
}
