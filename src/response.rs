//! HTTP rendering shared by the rate-limit and throttle layers.

use http::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, RETRY_AFTER};
use http::{Response, StatusCode};
use std::time::Duration;

/// Header echoing the quota of the rule that rejected the request.
pub const X_RATELIMIT_LIMIT: &str = "x-ratelimit-limit";

/// Message body for rate-limit rejections.
pub const TOO_MANY_REQUESTS: &str = "too many requests";

/// Whole seconds for a `Retry-After` header, rounded up so clients never retry early.
///
/// ```
/// use std::time::Duration;
/// use tollgate::response::retry_after_secs;
///
/// assert_eq!(retry_after_secs(Duration::from_millis(1)), 1);
/// assert_eq!(retry_after_secs(Duration::from_secs(60)), 60);
/// assert_eq!(retry_after_secs(Duration::from_millis(60_001)), 61);
/// ```
pub fn retry_after_secs(wait: Duration) -> u64 {
    wait.as_secs() + u64::from(wait.subsec_nanos() > 0)
}

/// `{"error": message}` with `content-type: application/json`.
pub fn json_error<B: From<String>>(status: StatusCode, message: &str) -> Response<B> {
    let body = serde_json::json!({ "error": message }).to_string();
    let mut response = Response::new(B::from(body));
    *response.status_mut() = status;
    response.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

pub(crate) fn set_retry_after(headers: &mut HeaderMap, wait: Duration) {
    headers.insert(RETRY_AFTER, HeaderValue::from(retry_after_secs(wait)));
}

pub(crate) fn set_limit(headers: &mut HeaderMap, quota: u32) {
    headers.insert(HeaderName::from_static(X_RATELIMIT_LIMIT), HeaderValue::from(quota));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_body_is_json() {
        let response: Response<String> = json_error(StatusCode::TOO_MANY_REQUESTS, TOO_MANY_REQUESTS);
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[CONTENT_TYPE], "application/json");
        let body: serde_json::Value = serde_json::from_str(response.body()).unwrap();
        assert_eq!(body["error"], "too many requests");
    }

    #[test]
    fn headers_are_integers() {
        let mut headers = HeaderMap::new();
        set_retry_after(&mut headers, Duration::from_millis(1500));
        set_limit(&mut headers, 5);
        assert_eq!(headers[RETRY_AFTER], "2");
        assert_eq!(headers[X_RATELIMIT_LIMIT], "5");
    }

    #[test]
    fn zero_wait_rounds_to_zero() {
        assert_eq!(retry_after_secs(Duration::ZERO), 0);
    }
}
