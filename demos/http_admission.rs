//! Full admission stack over plain `http` types: throttle first, then a per-client rate limit.
//!
//! Rules come from JSON, the same document an operator would deploy.
use http::{Request, Response};
use std::convert::Infallible;
use std::sync::Arc;
use tollgate::config::AdmissionConfig;
use tollgate::rate_limit::{always, KeyError, RateLimitLayer};
use tollgate::{ConcurrencyThrottle, InMemorySharedStore, ThrottleLayer};
use tower::{service_fn, ServiceBuilder, ServiceExt};

const CONFIG: &str = r#"{
    "throttle": { "limit": 4, "backlog_limit": 16, "backlog_timeout_ms": 2000 },
    "rules": [
        { "namespace": "api", "quota": 3, "window_ms": 10000, "algorithm": "sliding_window" }
    ]
}"#;

fn client_id(req: &Request<String>) -> Result<String, KeyError> {
    req.headers()
        .get("x-client-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .ok_or_else(|| KeyError::new("missing x-client-id"))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_max_level(tracing::Level::DEBUG).init();

    let config = AdmissionConfig::from_json_str(CONFIG)?;
    let throttle_settings = config.throttle.clone().ok_or("config has no throttle")?;
    let throttle = ConcurrencyThrottle::from_config(throttle_settings.to_config()?);

    let store = Arc::new(InMemorySharedStore::new());
    let mut limiters = config.build_limiters(Some(store))?;
    let api = limiters.remove("api").ok_or("config has no api rule")?;

    let svc = ServiceBuilder::new()
        .layer(ThrottleLayer::new(throttle))
        .layer(RateLimitLayer::new(api, always(client_id)))
        .service(service_fn(|req: Request<String>| async move {
            Ok::<_, Infallible>(Response::new(format!("hello {}", req.uri().path())))
        }));

    for client in ["alice", "alice", "alice", "alice", "bob"] {
        let req = Request::builder().uri("/greet").header("x-client-id", client).body(String::new())?;
        let res = svc.clone().oneshot(req).await?;
        let retry = res.headers().get(http::header::RETRY_AFTER).and_then(|v| v.to_str().ok());
        println!("{client:>5}: {} {} (retry after: {:?})", res.status(), res.body(), retry);
    }

    let res = svc.oneshot(Request::new(String::new())).await?;
    println!("anonymous: {} {}", res.status(), res.body());
    Ok(())
}
