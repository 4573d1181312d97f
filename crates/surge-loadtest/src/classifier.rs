//! Rate-limit classification of HTTP outcomes
//!
//! [`is_rate_limited`] is the only place that decides whether a response was
//! a rate-limit rejection. The bootstrapper, the probe's validation and the
//! backoff decision all call it, so one outcome always classifies the same way.

use std::time::Duration;

use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;

/// Body marker emitted by the target's rate limiter alongside (or instead of) a 429
pub const RATE_LIMIT_BODY_MARKER: &str = "Too many requests";

/// True when the response is a rate-limit rejection: status 429, or a body
/// containing [`RATE_LIMIT_BODY_MARKER`].
pub fn is_rate_limited(status: u16, body: &str) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS.as_u16() || body.contains(RATE_LIMIT_BODY_MARKER)
}

/// Server-provided wait hint for a rejected request.
///
/// Reads the `Retry-After` header (delta-seconds form), then falls back to the
/// `data.retry_after_seconds` field of a JSON body. Informational only: the
/// hint is logged and reported but never changes classification or backoff.
pub fn retry_after(headers: &HeaderMap, body: &str) -> Option<Duration> {
    let from_header = headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());

    from_header
        .or_else(|| {
            serde_json::from_str::<serde_json::Value>(body)
                .ok()?
                .pointer("/data/retry_after_seconds")?
                .as_u64()
        })
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_status_429_is_rate_limited() {
        assert!(is_rate_limited(429, ""));
        assert!(is_rate_limited(429, "{\"success\":true}"));
    }

    #[test]
    fn test_body_marker_is_rate_limited() {
        assert!(is_rate_limited(200, "Too many requests, slow down"));
        assert!(is_rate_limited(503, "{\"message\":\"Too many requests\"}"));
    }

    #[test]
    fn test_marker_is_case_sensitive() {
        assert!(!is_rate_limited(200, "too many requests"));
    }

    #[test]
    fn test_retry_after_header_wins() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("12"));
        let body = r#"{"data":{"retry_after_seconds":40}}"#;

        assert_eq!(retry_after(&headers, body), Some(Duration::from_secs(12)));
    }

    #[test]
    fn test_retry_after_from_body() {
        let body = r#"{"success":false,"message":"Terlalu banyak permintaan","data":{"retry_after_seconds":7}}"#;
        assert_eq!(
            retry_after(&HeaderMap::new(), body),
            Some(Duration::from_secs(7))
        );
    }

    #[test]
    fn test_retry_after_absent() {
        assert_eq!(retry_after(&HeaderMap::new(), "not json"), None);
        assert_eq!(retry_after(&HeaderMap::new(), "{\"data\":{}}"), None);
    }

    proptest! {
        #[test]
        fn prop_429_always_rate_limited(body in ".*") {
            prop_assert!(is_rate_limited(429, &body));
        }

        #[test]
        fn prop_200_without_marker_never_rate_limited(body in "[a-z0-9 {}\":,]*") {
            prop_assume!(!body.contains(RATE_LIMIT_BODY_MARKER));
            prop_assert!(!is_rate_limited(200, &body));
        }

        #[test]
        fn prop_classification_is_stable(status in 100u16..600, body in ".*") {
            prop_assert_eq!(is_rate_limited(status, &body), is_rate_limited(status, &body));
        }
    }
}
