use http::StatusCode;
use std::sync::Arc;
use std::time::Duration;
use tollgate::config::{AdmissionConfig, Algorithm, ConfigError};
use tollgate::{
    ConcurrencyThrottle, InMemorySharedStore, ManualClock, RateLimiter, ThrottleBuildError,
};

const FULL: &str = r#"{
    "throttle": { "limit": 10, "backlog_limit": 50, "backlog_timeout_ms": 10000, "status_code": 503 },
    "rules": [
        { "namespace": "global", "quota": 5, "window_ms": 60000, "algorithm": "token_bucket" },
        { "namespace": "login", "quota": 3, "window_ms": 60000, "algorithm": "fixed_window" },
        { "namespace": "search", "quota": 30, "window_ms": 1000, "algorithm": "sliding_window" },
        { "namespace": "local", "quota": 100, "window_ms": 60000, "enabled": false }
    ]
}"#;

#[tokio::test]
async fn builds_every_algorithm_from_json() {
    let config = AdmissionConfig::from_json_str(FULL).unwrap();
    config.validate().unwrap();
    assert_eq!(config.rules[3].algorithm, Algorithm::LocalTokenBucket);

    let store = Arc::new(InMemorySharedStore::new());
    let limiters = config.build_limiters(Some(store)).unwrap();
    assert_eq!(limiters.len(), 4);

    let login = &limiters["login"];
    assert_eq!(login.policy().quota(), 3);
    assert_eq!(login.policy().window(), Duration::from_secs(60));
    for _ in 0..3 {
        assert!(login.allow("10.1.1.1").await.is_allowed());
    }
    assert!(!login.allow("10.1.1.1").await.is_allowed());

    let local = &limiters["local"];
    assert!(!local.policy().is_enabled());
    for _ in 0..500 {
        assert!(local.allow("10.1.1.1").await.is_allowed());
    }
}

#[test]
fn throttle_settings_become_a_throttle() {
    let config = AdmissionConfig::from_json_str(FULL).unwrap();
    let throttle_config = config.throttle.unwrap().to_config().unwrap();
    assert_eq!(throttle_config.limit(), 10);
    assert_eq!(throttle_config.backlog_limit(), 50);
    assert_eq!(throttle_config.backlog_timeout(), Duration::from_secs(10));
    assert_eq!(throttle_config.status_code(), StatusCode::SERVICE_UNAVAILABLE);

    let throttle = ConcurrencyThrottle::from_config(throttle_config);
    assert_eq!(throttle.in_flight(), 0);
}

#[test]
fn shared_rules_need_a_store() {
    let config = AdmissionConfig::from_json_str(FULL).unwrap();
    let err = config.build_limiters::<InMemorySharedStore>(None).err().unwrap();
    assert!(matches!(err, ConfigError::MissingSharedStore(ref ns) if ns == "global"));
}

#[test]
fn local_only_config_needs_no_store_or_runtime() {
    let config = AdmissionConfig::from_json_str(
        r#"{ "rules": [ { "namespace": "a", "quota": 1, "window_ms": 500 } ] }"#,
    )
    .unwrap();
    let limiters = config.build_limiters::<InMemorySharedStore>(None).unwrap();
    assert!(limiters.contains_key("a"));
}

#[test]
fn duplicate_namespaces_are_rejected() {
    let config = AdmissionConfig::from_json_str(
        r#"{ "rules": [
            { "namespace": "a", "quota": 1, "window_ms": 500 },
            { "namespace": "a", "quota": 2, "window_ms": 500, "algorithm": "fixed_window" }
        ] }"#,
    )
    .unwrap();
    assert!(matches!(config.validate(), Err(ConfigError::DuplicateNamespace(ref ns)) if ns == "a"));
}

#[test]
fn invalid_values_are_configuration_errors() {
    let zero_window = AdmissionConfig::from_json_str(
        r#"{ "rules": [ { "namespace": "a", "quota": 1, "window_ms": 0 } ] }"#,
    )
    .unwrap();
    assert!(matches!(zero_window.validate(), Err(ConfigError::Policy { .. })));

    let zero_limit = AdmissionConfig::from_json_str(r#"{ "throttle": { "limit": 0 } }"#).unwrap();
    assert!(matches!(
        zero_limit.validate(),
        Err(ConfigError::Throttle(ThrottleBuildError::InvalidLimit(0)))
    ));

    let negative = AdmissionConfig::from_json_str(
        r#"{ "rules": [ { "namespace": "a", "quota": -1, "window_ms": 10 } ] }"#,
    );
    assert!(matches!(negative, Err(ConfigError::Parse(_))));
}

#[test]
fn loads_from_file() {
    let path = std::env::temp_dir().join(format!("tollgate-config-{}.json", std::process::id()));
    std::fs::write(&path, FULL).unwrap();
    let config = AdmissionConfig::from_file(&path).unwrap();
    std::fs::remove_file(&path).unwrap();
    assert_eq!(config.rules.len(), 4);

    let missing = AdmissionConfig::from_file(path.with_extension("missing"));
    assert!(matches!(missing, Err(ConfigError::Io(_))));
}

#[tokio::test(start_paused = true)]
async fn shared_store_gets_swept_once_limiters_are_built() {
    let clock = ManualClock::starting_at(Duration::from_secs(1_700_000_040));
    let store = Arc::new(InMemorySharedStore::new().with_clock(clock.clone()));
    let config = AdmissionConfig::from_json_str(
        r#"{ "rules": [ { "namespace": "tb", "quota": 2, "window_ms": 1000, "algorithm": "token_bucket" } ] }"#,
    )
    .unwrap();
    let limiters = config.build_limiters(Some(store.clone())).unwrap();

    for caller in ["a", "b", "c"] {
        assert!(limiters["tb"].allow(caller).await.is_allowed());
    }
    assert_eq!(store.len(), 3);

    clock.advance(Duration::from_secs(2));
    tokio::time::sleep(Duration::from_secs(61)).await;
    tokio::task::yield_now().await;
    assert!(store.is_empty());
}
