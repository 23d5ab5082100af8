use super::store_failure;
use crate::rate_limit::{BucketSpec, Decision, RateLimiter, SharedStore};
use crate::Policy;
use std::sync::Arc;

const NAME: &str = "token_bucket";

/// A Token Bucket rate limiter shared between instances.
///
/// Replenishes `quota` tokens per `window`, up to a burst of `quota`, in the bucket stored at
/// `<namespace>:<caller>`. The whole refill-and-withdraw step is delegated to
/// [`SharedStore::take_token`], which the store performs atomically, so concurrent instances
/// never lose updates.
pub struct TokenBucket<S> {
    store: Arc<S>,
    policy: Policy,
    spec: BucketSpec,
}

impl<S> std::fmt::Debug for TokenBucket<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucket")
            .field("policy", &self.policy)
            .field("spec", &self.spec)
            .finish_non_exhaustive()
    }
}

impl<S> TokenBucket<S>
where
    S: SharedStore + 'static,
{
    /// Create a TokenBucket backed by `store`.
    pub fn new(store: Arc<S>, policy: Policy) -> Self {
        let spec = BucketSpec {
            capacity: policy.quota(),
            refill_interval: policy.refill_interval(),
            idle_ttl: policy.window(),
        };
        Self { store, policy, spec }
    }
}

#[async_trait::async_trait]
impl<S> RateLimiter for TokenBucket<S>
where
    S: SharedStore + 'static,
{
    async fn allow(&self, caller: &str) -> Decision {
        if !self.policy.is_enabled() {
            return Decision::Allowed;
        }

        let key = self.policy.key_for(caller);
        match self.store.take_token(&key, self.spec).await {
            Ok(grant) if grant.allowed => Decision::Allowed,
            Ok(grant) => Decision::exhausted(grant.wait),
            Err(e) => store_failure(NAME, "take", &key, &self.policy, &e),
        }
    }

    fn policy(&self) -> &Policy {
        &self.policy
    }
}
