use crate::rate_limit::{Decision, RateLimiter};
use crate::response::{self, TOO_MANY_REQUESTS};
use futures::future::BoxFuture;
use http::{Request, Response, StatusCode};
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

/// What a [`KeyExtractor`] decided about a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LimitKey {
    /// Enforce the rule for this caller key.
    Apply(String),
    /// The rule does not apply to this request; pass it through untouched.
    Skip,
}

/// The request carried no usable caller identity.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot derive rate limit key: {0}")]
pub struct KeyError(pub String);

impl KeyError {
    /// Create an error with a human-readable reason.
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// Derives the caller key (and whether the rule applies) from a request.
///
/// Implemented for any `Fn(&Request<B>) -> Result<LimitKey, KeyError>`. Use [`always`] for
/// extractors that apply to every request.
pub trait KeyExtractor<B>: Send + Sync {
    /// Inspect the request.
    fn extract(&self, request: &Request<B>) -> Result<LimitKey, KeyError>;
}

impl<B, F> KeyExtractor<B> for F
where
    F: Fn(&Request<B>) -> Result<LimitKey, KeyError> + Send + Sync,
{
    fn extract(&self, request: &Request<B>) -> Result<LimitKey, KeyError> {
        self(request)
    }
}

/// Extractor returned by [`always`].
#[derive(Debug, Clone)]
pub struct ApplyAlways<F>(F);

impl<B, F> KeyExtractor<B> for ApplyAlways<F>
where
    F: Fn(&Request<B>) -> Result<String, KeyError> + Send + Sync,
{
    fn extract(&self, request: &Request<B>) -> Result<LimitKey, KeyError> {
        (self.0)(request).map(LimitKey::Apply)
    }
}

/// Adapt a plain `(request) -> key` function into an extractor whose rule always applies.
///
/// ```
/// use http::Request;
/// use tollgate::rate_limit::{always, KeyError, KeyExtractor, LimitKey};
///
/// let by_header = always(|req: &Request<()>| {
///     req.headers()
///         .get("x-account")
///         .and_then(|v| v.to_str().ok())
///         .map(str::to_owned)
///         .ok_or_else(|| KeyError::new("missing x-account"))
/// });
/// let req = Request::builder().header("x-account", "42").body(()).unwrap();
/// assert_eq!(by_header.extract(&req), Ok(LimitKey::Apply("42".into())));
/// ```
pub fn always<F>(f: F) -> ApplyAlways<F> {
    ApplyAlways(f)
}

/// A layer that enforces rate limits using a [`RateLimiter`].
///
/// Rejected requests get `429 Too Many Requests`, a `Retry-After` header in whole seconds
/// (rounded up), `X-RateLimit-Limit` with the rule's quota, and a JSON error body. A request
/// whose key cannot be extracted, or whose key is empty, gets `500` and never reaches the
/// limiter.
pub struct RateLimitLayer<L, K> {
    limiter: Arc<L>,
    extractor: Arc<K>,
}

impl<L, K> RateLimitLayer<L, K> {
    /// Create a new rate limit layer.
    pub fn new(limiter: L, extractor: K) -> Self {
        Self { limiter: Arc::new(limiter), extractor: Arc::new(extractor) }
    }

    /// Share an already-wrapped limiter between several layers.
    pub fn from_shared(limiter: Arc<L>, extractor: K) -> Self {
        Self { limiter, extractor: Arc::new(extractor) }
    }
}

impl<L, K> Clone for RateLimitLayer<L, K> {
    fn clone(&self) -> Self {
        Self { limiter: self.limiter.clone(), extractor: self.extractor.clone() }
    }
}

impl<L: RateLimiter, K> std::fmt::Debug for RateLimitLayer<L, K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitLayer").field("policy", self.limiter.policy()).finish_non_exhaustive()
    }
}

impl<S, L, K> Layer<S> for RateLimitLayer<L, K>
where
    L: RateLimiter + 'static,
{
    type Service = RateLimitService<S, L, K>;

    fn layer(&self, service: S) -> Self::Service {
        RateLimitService {
            inner: service,
            limiter: self.limiter.clone(),
            extractor: self.extractor.clone(),
        }
    }
}

/// Middleware service that enforces rate limits.
pub struct RateLimitService<S, L, K> {
    inner: S,
    limiter: Arc<L>,
    extractor: Arc<K>,
}

impl<S: Clone, L, K> Clone for RateLimitService<S, L, K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            limiter: self.limiter.clone(),
            extractor: self.extractor.clone(),
        }
    }
}

impl<S: std::fmt::Debug, L: RateLimiter, K> std::fmt::Debug for RateLimitService<S, L, K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitService")
            .field("inner", &self.inner)
            .field("policy", self.limiter.policy())
            .finish_non_exhaustive()
    }
}

impl<S, L, K, ReqBody, ResBody> Service<Request<ReqBody>> for RateLimitService<S, L, K>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    L: RateLimiter + 'static,
    K: KeyExtractor<ReqBody> + 'static,
    ReqBody: Send + 'static,
    ResBody: From<String> + Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let extracted = self.extractor.extract(&req);
        let limiter = self.limiter.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let caller = match extracted {
                Ok(LimitKey::Skip) => return inner.call(req).await,
                Ok(LimitKey::Apply(caller)) if !caller.is_empty() => caller,
                Ok(LimitKey::Apply(_)) => {
                    tracing::error!(
                        namespace = limiter.policy().namespace(),
                        "empty rate limit key, rejecting request"
                    );
                    return Ok(server_error());
                }
                Err(e) => {
                    tracing::error!(
                        namespace = limiter.policy().namespace(),
                        error = %e,
                        "rate limit key extraction failed"
                    );
                    return Ok(server_error());
                }
            };

            match limiter.allow(&caller).await {
                Decision::Allowed => inner.call(req).await,
                Decision::Denied { wait, reason } => {
                    let quota = limiter.policy().quota();
                    tracing::debug!(
                        key = %caller,
                        namespace = limiter.policy().namespace(),
                        retry_after = ?wait,
                        ?reason,
                        "rate limited"
                    );
                    let mut response =
                        response::json_error(StatusCode::TOO_MANY_REQUESTS, TOO_MANY_REQUESTS);
                    response::set_retry_after(response.headers_mut(), wait);
                    response::set_limit(response.headers_mut(), quota);
                    Ok(response)
                }
            }
        })
    }
}

fn server_error<B: From<String>>() -> Response<B> {
    response::json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
}
