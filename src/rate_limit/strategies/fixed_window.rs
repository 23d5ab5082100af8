use super::store_failure;
use crate::clock::{Clock, SystemClock};
use crate::rate_limit::{Decision, RateLimiter, SharedStore};
use crate::Policy;
use std::sync::Arc;

const NAME: &str = "fixed_window";

/// Fixed-window counter in a shared store.
///
/// Requests are counted per `floor(now_ms / window_ms)`; the counter key is
/// `<namespace>:<caller>:<window index>` and expires one window after it is created. A denied
/// caller is told to come back when the counter expires.
///
/// Known gaps, kept because the cheap path is the point of this algorithm:
/// - Counter initialization is read-then-write, so concurrent first requests may both
///   initialize it. The later write resets the count to zero.
/// - Up to twice the quota can pass across a window boundary.
pub struct FixedWindow<S> {
    store: Arc<S>,
    policy: Policy,
    clock: Arc<dyn Clock>,
}

impl<S> std::fmt::Debug for FixedWindow<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixedWindow").field("policy", &self.policy).finish_non_exhaustive()
    }
}

impl<S> FixedWindow<S>
where
    S: SharedStore + 'static,
{
    /// Create a limiter backed by `store`.
    pub fn new(store: Arc<S>, policy: Policy) -> Self {
        Self { store, policy, clock: Arc::new(SystemClock) }
    }

    /// Override the clock used to compute window indexes.
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    fn window_key(&self, caller: &str) -> String {
        let window_ms = u64::try_from(self.policy.window().as_millis()).unwrap_or(u64::MAX).max(1);
        let index = self.clock.now_millis() / window_ms;
        format!("{}:{}", self.policy.key_for(caller), index)
    }

    async fn deny_until_reset(&self, key: &str) -> Decision {
        let window = self.policy.window();
        match self.store.ttl(key).await {
            Ok(Some(ttl)) => Decision::exhausted(ttl),
            Ok(None) => {
                tracing::warn!(limiter = NAME, key, "window counter has no ttl, sending full window");
                Decision::exhausted(window)
            }
            Err(e) => {
                tracing::warn!(limiter = NAME, key, error = %e, "can't read window ttl, sending full window");
                Decision::exhausted(window)
            }
        }
    }
}

#[async_trait::async_trait]
impl<S> RateLimiter for FixedWindow<S>
where
    S: SharedStore + 'static,
{
    async fn allow(&self, caller: &str) -> Decision {
        if !self.policy.is_enabled() {
            return Decision::Allowed;
        }

        let key = self.window_key(caller);
        let quota = u64::from(self.policy.quota());

        let count = match self.store.get_counter(&key).await {
            Ok(Some(count)) => count,
            Ok(None) => {
                if let Err(e) = self.store.set_counter(&key, 0, self.policy.window()).await {
                    return store_failure(NAME, "init", &key, &self.policy, &e);
                }
                0
            }
            Err(e) => return store_failure(NAME, "get", &key, &self.policy, &e),
        };

        if count >= quota {
            return self.deny_until_reset(&key).await;
        }

        match self.store.incr(&key).await {
            Ok(after) if after <= quota => Decision::Allowed,
            // Another caller took the last slot between our read and increment.
            Ok(_) => self.deny_until_reset(&key).await,
            Err(e) => store_failure(NAME, "incr", &key, &self.policy, &e),
        }
    }

    fn policy(&self) -> &Policy {
        &self.policy
    }
}
