//! Rate-limit rules.

use std::time::Duration;

/// Errors produced when validating a [`Policy`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    /// Quota must be > 0.
    #[error("quota must be > 0 (got {0})")]
    ZeroQuota(u32),
    /// Window must be > 0.
    #[error("window must be > 0 (got {0:?})")]
    ZeroWindow(Duration),
}

/// Immutable description of one rate-limit rule: at most `quota` operations per `window`
/// for every caller key under `namespace`.
///
/// ```
/// use std::time::Duration;
/// use tollgate::Policy;
///
/// let policy = Policy::new(5, Duration::from_secs(60)).unwrap().with_namespace("login");
/// assert_eq!(policy.key_for("10.0.0.1"), "login:10.0.0.1");
/// assert!(Policy::new(0, Duration::from_secs(1)).is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    quota: u32,
    window: Duration,
    enabled: bool,
    namespace: String,
}

impl Policy {
    /// Create an enabled policy with an empty namespace.
    ///
    /// # Errors
    /// Returns `PolicyError` if `quota` or `window` is zero.
    pub fn new(quota: u32, window: Duration) -> Result<Self, PolicyError> {
        if quota == 0 {
            return Err(PolicyError::ZeroQuota(quota));
        }
        if window.is_zero() {
            return Err(PolicyError::ZeroWindow(window));
        }
        Ok(Self { quota, window, enabled: true, namespace: String::new() })
    }

    /// Set the prefix that keeps this rule's keys apart from other rules in a shared store.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Toggle the rule. A disabled rule admits everything without touching its backend.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Maximum operations per window.
    pub fn quota(&self) -> u32 {
        self.quota
    }

    /// Time span the quota applies to.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Whether the rule is enforced.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Key namespace.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Time for a token bucket under this policy to regain one token (`window / quota`).
    pub fn refill_interval(&self) -> Duration {
        self.window / self.quota
    }

    /// Full store key for a caller: `<namespace>:<caller>`.
    pub fn key_for(&self, caller: &str) -> String {
        let mut key = String::with_capacity(self.namespace.len() + 1 + caller.len());
        key.push_str(&self.namespace);
        key.push(':');
        key.push_str(caller);
        key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_quota() {
        let err = Policy::new(0, Duration::from_secs(1)).expect_err("zero quota is invalid");
        assert_eq!(err, PolicyError::ZeroQuota(0));
    }

    #[test]
    fn rejects_zero_window() {
        let err = Policy::new(3, Duration::ZERO).expect_err("zero window is invalid");
        assert_eq!(err, PolicyError::ZeroWindow(Duration::ZERO));
    }

    #[test]
    fn refill_interval_divides_window_by_quota() {
        let policy = Policy::new(4, Duration::from_secs(1)).unwrap();
        assert_eq!(policy.refill_interval(), Duration::from_millis(250));
    }

    #[test]
    fn keys_are_namespaced() {
        let policy = Policy::new(1, Duration::from_secs(1)).unwrap().with_namespace("global");
        assert_eq!(policy.key_for("203.0.113.9"), "global:203.0.113.9");
        assert!(policy.is_enabled());
        assert!(!policy.clone().with_enabled(false).is_enabled());
    }
}
