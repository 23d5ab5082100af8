use std::sync::Arc;
use std::time::Duration;
use tollgate::rate_limit::SharedStore;
use tollgate::{FixedWindow, Policy, RateLimiter, SlidingWindow, TokenBucket};
use tollgate_redis::RedisStore;

// Requires Redis >= 7.4. If TOLLGATE_TEST_REDIS_URL is unset, the tests skip.
async fn store() -> Option<Arc<RedisStore>> {
    let url = match std::env::var("TOLLGATE_TEST_REDIS_URL") {
        Ok(v) => v,
        Err(_) => {
            eprintln!("skipping: set TOLLGATE_TEST_REDIS_URL (e.g. redis://127.0.0.1/)");
            return None;
        }
    };
    let store = RedisStore::connect(&url)
        .await
        .unwrap_or_else(|e| panic!("Failed to connect to redis at '{}': {}", url, e));
    Some(Arc::new(store))
}

fn policy(quota: u32, window: Duration) -> Policy {
    Policy::new(quota, window).unwrap().with_namespace(format!("tollgate-test-{}", uuid::Uuid::new_v4()))
}

#[tokio::test]
async fn fixed_window_enforces_quota() {
    let Some(store) = store().await else { return };
    let limiter = FixedWindow::new(store, policy(3, Duration::from_secs(30)));
    for _ in 0..3 {
        assert!(limiter.allow("client").await.is_allowed());
    }
    let denied = limiter.allow("client").await;
    assert!(!denied.is_allowed());
    assert!(denied.retry_after() <= Duration::from_secs(30));
}

#[tokio::test]
async fn sliding_window_enforces_quota() {
    let Some(store) = store().await else { return };
    let limiter = SlidingWindow::new(store.clone(), policy(2, Duration::from_secs(30)));
    assert!(limiter.allow("client").await.is_allowed());
    assert!(limiter.allow("client").await.is_allowed());
    let denied = limiter.allow("client").await;
    assert!(!denied.is_allowed());
    assert!(denied.retry_after() > Duration::ZERO);

    let key = limiter.policy().key_for("client");
    assert_eq!(store.field_count(&key).await.unwrap(), 2);
    store.remove_field(&key, "missing").await.unwrap();
}

#[tokio::test]
async fn token_bucket_is_atomic_across_instances() {
    let Some(store) = store().await else { return };
    let shared = policy(5, Duration::from_secs(60));
    let limiters: Vec<_> = (0..4).map(|_| Arc::new(TokenBucket::new(store.clone(), shared.clone()))).collect();

    let mut handles = Vec::new();
    for i in 0..20 {
        let limiter = limiters[i % limiters.len()].clone();
        handles.push(tokio::spawn(async move { limiter.allow("client").await.is_allowed() }));
    }
    let mut admitted = 0;
    for handle in handles {
        if handle.await.unwrap() {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 5);
}
