//! Admission responses and rate limit headers.

use axum::{
    http::{header::RETRY_AFTER, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::Serialize;

use super::chain::{Quota, Rejection};
use crate::ratelimit::RejectionStyle;

pub const LIMIT_HEADER: &str = "x-ratelimit-limit";
pub const REMAINING_HEADER: &str = "x-ratelimit-remaining";
pub const RESET_HEADER: &str = "x-ratelimit-reset";

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    success: bool,
    error: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<RetryDetails>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RetryDetails {
    /// Minutes until the window resets
    retry_after: u64,
}

fn error_response(status: StatusCode, error: &str, details: Option<RetryDetails>) -> Response {
    let body = ErrorBody {
        success: false,
        error,
        details,
    };
    (status, Json(body)).into_response()
}

/// 429 for a limiter rejection.
///
/// Bare rejections carry no body at all.
pub fn limited(rejection: &Rejection) -> Response {
    if rejection.style == RejectionStyle::Bare {
        return StatusCode::TOO_MANY_REQUESTS.into_response();
    }

    let mut response = error_response(
        StatusCode::TOO_MANY_REQUESTS,
        &rejection.message,
        Some(RetryDetails {
            retry_after: rejection.retry_after_minutes,
        }),
    );

    let headers = response.headers_mut();
    headers.insert(RETRY_AFTER, HeaderValue::from(rejection.retry_after.as_secs()));
    headers.insert(LIMIT_HEADER, HeaderValue::from(rejection.limit));
    headers.insert(REMAINING_HEADER, HeaderValue::from(0u64));
    response
}

/// 403 for a banned client.
pub fn banned() -> Response {
    error_response(StatusCode::FORBIDDEN, "Access denied", None)
}

/// 503 when a fail-closed shared limiter cannot count.
pub fn unavailable() -> Response {
    error_response(
        StatusCode::SERVICE_UNAVAILABLE,
        "Service temporarily unavailable",
        None,
    )
}

/// JSON 404 for unknown routes.
pub fn not_found() -> Response {
    error_response(StatusCode::NOT_FOUND, "Route not found", None)
}

/// Stamp budget headers onto an admitted response.
pub fn apply_quota(headers: &mut HeaderMap, quota: &Quota) {
    let reset_at = Utc::now().timestamp() as u64 + quota.reset_after.as_secs();
    headers.insert(LIMIT_HEADER, HeaderValue::from(quota.limit));
    headers.insert(REMAINING_HEADER, HeaderValue::from(quota.remaining));
    headers.insert(RESET_HEADER, HeaderValue::from(reset_at));
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use std::time::Duration;

    fn rejection(style: RejectionStyle) -> Rejection {
        Rejection {
            rule: "auth".to_string(),
            message: "Too many login attempts".to_string(),
            style,
            limit: 5,
            retry_after: Duration::from_secs(900),
            retry_after_minutes: 15,
        }
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_limited_json_body() {
        let response = limited(&rejection(RejectionStyle::Json));
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[RETRY_AFTER], "900");
        assert_eq!(response.headers()[LIMIT_HEADER], "5");
        assert_eq!(response.headers()[REMAINING_HEADER], "0");

        let body = body_json(response).await;
        assert_eq!(
            body,
            serde_json::json!({
                "success": false,
                "error": "Too many login attempts",
                "details": { "retryAfter": 15 }
            })
        );
    }

    #[tokio::test]
    async fn test_limited_bare_is_empty() {
        let response = limited(&rejection(RejectionStyle::Bare));
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(bytes.is_empty());
    }

    #[tokio::test]
    async fn test_banned_body() {
        let response = banned();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            body_json(response).await,
            serde_json::json!({ "success": false, "error": "Access denied" })
        );
    }

    #[test]
    fn test_apply_quota() {
        let mut headers = HeaderMap::new();
        apply_quota(
            &mut headers,
            &Quota {
                limit: 100,
                remaining: 42,
                reset_after: Duration::from_secs(30),
            },
        );
        assert_eq!(headers[LIMIT_HEADER], "100");
        assert_eq!(headers[REMAINING_HEADER], "42");
        let reset: u64 = headers[RESET_HEADER].to_str().unwrap().parse().unwrap();
        assert!(reset >= Utc::now().timestamp() as u64);
    }
}
