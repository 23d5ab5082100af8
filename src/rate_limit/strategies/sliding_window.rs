use super::store_failure;
use crate::clock::{Clock, SystemClock};
use crate::rate_limit::{Decision, RateLimiter, SharedStore};
use crate::Policy;
use std::sync::Arc;

const NAME: &str = "sliding_window";

/// Attempts at finding a free millisecond field before the insert counts as failed.
const MAX_FIELD_ATTEMPTS: u64 = 8;

/// Sliding log kept as a hash with individually expiring fields.
///
/// Every admitted request adds a field named after its millisecond timestamp to the hash
/// `<namespace>:<caller>` and gives that field a time to live of one window. The live field
/// count is the number of requests admitted during the trailing window.
///
/// A denied caller is told to wait until the oldest surviving field expires. If the fields all
/// expire between counting and listing them, the request is admitted.
///
/// Requires per-field expiry in the store (Redis 7.4+ `HPEXPIRE`/`HPTTL`).
pub struct SlidingWindow<S> {
    store: Arc<S>,
    policy: Policy,
    clock: Arc<dyn Clock>,
}

impl<S> std::fmt::Debug for SlidingWindow<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlidingWindow").field("policy", &self.policy).finish_non_exhaustive()
    }
}

impl<S> SlidingWindow<S>
where
    S: SharedStore + 'static,
{
    /// Create a limiter backed by `store`.
    pub fn new(store: Arc<S>, policy: Policy) -> Self {
        Self { store, policy, clock: Arc::new(SystemClock) }
    }

    /// Override the clock used to timestamp fields.
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// `None` means the log emptied out and the request may proceed.
    async fn deny_until_oldest_expires(&self, key: &str) -> Option<Decision> {
        let window = self.policy.window();
        let names = match self.store.field_names(key).await {
            Ok(names) => names,
            Err(e) => {
                tracing::warn!(limiter = NAME, key, error = %e, "can't list log fields, sending full window");
                return Some(Decision::exhausted(window));
            }
        };

        let oldest = names
            .iter()
            .filter_map(|name| name.parse::<u64>().ok().map(|ts| (ts, name)))
            .min_by_key(|(ts, _)| *ts)
            .map(|(_, name)| name)?;

        let decision = match self.store.field_ttl(key, oldest).await {
            Ok(Some(ttl)) => Decision::exhausted(ttl),
            Ok(None) => Decision::exhausted(window),
            Err(e) => {
                tracing::warn!(limiter = NAME, key, error = %e, "can't read field ttl, sending full window");
                Decision::exhausted(window)
            }
        };
        Some(decision)
    }

    async fn record(&self, key: &str) -> Decision {
        let now = self.clock.now_millis();
        for offset in 0..MAX_FIELD_ATTEMPTS {
            let field = (now + offset).to_string();
            match self.store.set_field_if_absent(key, &field, &field).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => return store_failure(NAME, "insert", key, &self.policy, &e),
            }

            if let Err(e) = self.store.expire_field(key, &field, self.policy.window()).await {
                // A field without expiry would hold a slot forever.
                if let Err(cleanup) = self.store.remove_field(key, &field).await {
                    tracing::error!(limiter = NAME, key, field = %field, error = %cleanup, "can't remove unexpiring field");
                }
                return store_failure(NAME, "expire", key, &self.policy, &e);
            }
            return Decision::Allowed;
        }

        tracing::warn!(limiter = NAME, key, attempts = MAX_FIELD_ATTEMPTS, "no free timestamp field, rejecting request");
        Decision::unavailable(self.policy.window())
    }
}

#[async_trait::async_trait]
impl<S> RateLimiter for SlidingWindow<S>
where
    S: SharedStore + 'static,
{
    async fn allow(&self, caller: &str) -> Decision {
        if !self.policy.is_enabled() {
            return Decision::Allowed;
        }

        let key = self.policy.key_for(caller);
        let count = match self.store.field_count(&key).await {
            Ok(count) => count,
            Err(e) => return store_failure(NAME, "count", &key, &self.policy, &e),
        };

        if count >= u64::from(self.policy.quota()) {
            if let Some(denied) = self.deny_until_oldest_expires(&key).await {
                return denied;
            }
        }

        self.record(&key).await
    }

    fn policy(&self) -> &Policy {
        &self.policy
    }
}
