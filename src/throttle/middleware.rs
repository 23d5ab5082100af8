use crate::cancel::CancelSignal;
use crate::response;
use crate::throttle::{ConcurrencyThrottle, ThrottleRejection};
use futures::future::BoxFuture;
use http::{Request, Response};
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

/// A layer that runs every request through a [`ConcurrencyThrottle`].
///
/// A [`CancelSignal`] found in the request extensions ends the backlog wait early. Rejections
/// are answered with the configured status code, a JSON error body and, when the throttle has a
/// retry-after function, a `Retry-After` header.
#[derive(Clone, Debug)]
pub struct ThrottleLayer {
    throttle: ConcurrencyThrottle,
}

impl ThrottleLayer {
    /// Create a new throttle layer. Services made from clones of it share one throttle.
    pub fn new(throttle: ConcurrencyThrottle) -> Self {
        Self { throttle }
    }
}

impl<S> Layer<S> for ThrottleLayer {
    type Service = ThrottleService<S>;

    fn layer(&self, service: S) -> Self::Service {
        ThrottleService { inner: service, throttle: self.throttle.clone() }
    }
}

/// Middleware service that enforces the concurrency throttle.
#[derive(Clone, Debug)]
pub struct ThrottleService<S> {
    inner: S,
    throttle: ConcurrencyThrottle,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for ThrottleService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
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
        let cancel =
            req.extensions().get::<CancelSignal>().cloned().unwrap_or_else(CancelSignal::never);
        let throttle = self.throttle.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            match throttle.acquire(&cancel).await {
                Ok(permit) => {
                    let result = inner.call(req).await;
                    drop(permit);
                    result
                }
                Err(rejection) => Ok(rejection_response(&throttle, rejection)),
            }
        })
    }
}

fn rejection_response<B: From<String>>(
    throttle: &ConcurrencyThrottle,
    rejection: ThrottleRejection,
) -> Response<B> {
    let config = throttle.config();
    let mut res = response::json_error(config.status_code(), &rejection.to_string());
    if let Some(wait) = config.retry_after(rejection == ThrottleRejection::Canceled) {
        response::set_retry_after(res.headers_mut(), wait);
    }
    res
}
