//! JSON configuration for the whole admission stack.
//!
//! ```
//! use tollgate::config::{AdmissionConfig, Algorithm};
//!
//! let config = AdmissionConfig::from_json_str(r#"{
//!     "throttle": { "limit": 10, "backlog_limit": 50 },
//!     "rules": [
//!         { "namespace": "login", "quota": 3, "window_ms": 60000, "algorithm": "fixed_window" }
//!     ]
//! }"#).unwrap();
//! assert_eq!(config.rules[0].algorithm, Algorithm::FixedWindow);
//! assert!(config.rules[0].enabled);
//! assert_eq!(config.throttle.unwrap().backlog_timeout_ms, 60_000);
//! ```

use crate::cancel::CancelSignal;
use crate::policy::{Policy, PolicyError};
use crate::rate_limit::{
    FixedWindow, LocalTokenBucket, RateLimiter, SharedStore, SlidingWindow, TokenBucket,
};
use crate::throttle::{ThrottleBuildError, ThrottleConfig, DEFAULT_BACKLOG_TIMEOUT};
use http::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Errors produced while loading or applying configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    /// The document is not valid JSON for [`AdmissionConfig`].
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    /// A rule has an invalid quota or window.
    #[error("rule `{namespace}`: {source}")]
    Policy {
        namespace: String,
        #[source]
        source: PolicyError,
    },
    /// The throttle settings are invalid.
    #[error("throttle: {0}")]
    Throttle(#[from] ThrottleBuildError),
    /// `status_code` is not an HTTP status.
    #[error("throttle: invalid status code {0}")]
    InvalidStatusCode(u16),
    /// A shared-store rule was configured but no store was supplied.
    #[error("rule `{0}` needs a shared store")]
    MissingSharedStore(String),
    /// Two rules use the same namespace and would share keys.
    #[error("duplicate rule namespace `{0}`")]
    DuplicateNamespace(String),
}

/// Which algorithm enforces a rule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// [`LocalTokenBucket`]; per-process quota.
    #[default]
    LocalTokenBucket,
    /// [`FixedWindow`] over the shared store.
    FixedWindow,
    /// [`SlidingWindow`] over the shared store.
    SlidingWindow,
    /// [`TokenBucket`] over the shared store.
    TokenBucket,
}

impl Algorithm {
    /// Whether the algorithm keeps its state in a shared store.
    pub fn is_shared(self) -> bool {
        !matches!(self, Algorithm::LocalTokenBucket)
    }
}

fn enabled_by_default() -> bool {
    true
}

/// One rate-limit rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleConfig {
    pub namespace: String,
    pub quota: u32,
    pub window_ms: u64,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub algorithm: Algorithm,
}

impl RuleConfig {
    /// The validated [`Policy`] for this rule.
    pub fn policy(&self) -> Result<Policy, ConfigError> {
        let policy = Policy::new(self.quota, Duration::from_millis(self.window_ms))
            .map_err(|source| ConfigError::Policy { namespace: self.namespace.clone(), source })?;
        Ok(policy.with_namespace(self.namespace.clone()).with_enabled(self.enabled))
    }
}

fn default_backlog_timeout_ms() -> u64 {
    DEFAULT_BACKLOG_TIMEOUT.as_millis() as u64
}

fn default_status_code() -> u16 {
    StatusCode::TOO_MANY_REQUESTS.as_u16()
}

/// Serializable form of [`ThrottleConfig`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottleSettings {
    pub limit: usize,
    #[serde(default)]
    pub backlog_limit: usize,
    #[serde(default = "default_backlog_timeout_ms")]
    pub backlog_timeout_ms: u64,
    #[serde(default = "default_status_code")]
    pub status_code: u16,
}

impl ThrottleSettings {
    /// Validate into a [`ThrottleConfig`] (without a retry-after function; add one with the
    /// builder if needed).
    pub fn to_config(&self) -> Result<ThrottleConfig, ConfigError> {
        let status = StatusCode::from_u16(self.status_code)
            .map_err(|_| ConfigError::InvalidStatusCode(self.status_code))?;
        Ok(ThrottleConfig::builder(self.limit)
            .backlog_limit(self.backlog_limit)
            .backlog_timeout(Duration::from_millis(self.backlog_timeout_ms))
            .status_code(status)
            .build()?)
    }
}

/// Limiters built from configuration, by rule namespace.
pub type Limiters = HashMap<String, Arc<dyn RateLimiter>>;

/// Root configuration document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionConfig {
    #[serde(default)]
    pub throttle: Option<ThrottleSettings>,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

impl AdmissionConfig {
    /// Parse a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read and parse a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Check every rule and the throttle settings without building anything.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for rule in &self.rules {
            rule.policy()?;
            if !seen.insert(rule.namespace.as_str()) {
                return Err(ConfigError::DuplicateNamespace(rule.namespace.clone()));
            }
        }
        if let Some(throttle) = &self.throttle {
            throttle.to_config()?;
        }
        Ok(())
    }

    /// Build one limiter per rule.
    ///
    /// Shared-store rules use `store`; when every rule is local, pass `None` and name any store
    /// type (e.g. `build_limiters::<InMemorySharedStore>(None)`). Inside a tokio runtime, local
    /// buckets get their idle sweeper and the store gets [`SharedStore::spawn_sweeper`] when a
    /// shared rule uses it; each sweeper stops once what it cleans is dropped.
    pub fn build_limiters<S>(&self, store: Option<Arc<S>>) -> Result<Limiters, ConfigError>
    where
        S: SharedStore + 'static,
    {
        self.validate()?;
        let in_runtime = tokio::runtime::Handle::try_current().is_ok();
        if let Some(store) = &store {
            if self.rules.iter().any(|rule| rule.algorithm.is_shared()) {
                if in_runtime {
                    store.spawn_sweeper(CancelSignal::never());
                } else {
                    tracing::warn!("no tokio runtime, expired store entries will not be swept");
                }
            }
        }

        let mut limiters = Limiters::new();
        for rule in &self.rules {
            let policy = rule.policy()?;
            let limiter: Arc<dyn RateLimiter> = match (rule.algorithm, &store) {
                (Algorithm::LocalTokenBucket, _) => {
                    let local = LocalTokenBucket::new(policy);
                    if in_runtime {
                        local.spawn_sweeper(CancelSignal::never());
                    } else {
                        tracing::warn!(
                            namespace = %rule.namespace,
                            "no tokio runtime, idle buckets will not be swept"
                        );
                    }
                    Arc::new(local)
                }
                (_, None) => return Err(ConfigError::MissingSharedStore(rule.namespace.clone())),
                (Algorithm::FixedWindow, Some(store)) => {
                    Arc::new(FixedWindow::new(store.clone(), policy))
                }
                (Algorithm::SlidingWindow, Some(store)) => {
                    Arc::new(SlidingWindow::new(store.clone(), policy))
                }
                (Algorithm::TokenBucket, Some(store)) => {
                    Arc::new(TokenBucket::new(store.clone(), policy))
                }
            };
            limiters.insert(rule.namespace.clone(), limiter);
        }
        Ok(limiters)
    }
}
