//! API error types and HTTP response mapping.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::http::header::HeaderName;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use oncewrite_coordinator::{ExecuteError, IdempotencyError};

use crate::context::REQUEST_ID_HEADER;
use crate::social::SocialError;

/// API result type.
pub type ApiResult<T> = Result<T, ApiError>;

/// JSON error envelope: `{"error": {...}}`.
#[derive(Debug, Serialize)]
pub struct ApiErrorEnvelope {
    /// The error details.
    pub error: ApiErrorBody,
}

/// Error details inside the envelope.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorBody {
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message (safe for clients).
    pub message: String,
    /// Optional request ID for correlation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// HTTP API error with stable machine-readable code.
#[derive(Debug, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
    request_id: Option<String>,
    retry_after_secs: Option<u64>,
}

impl ApiError {
    /// Returns an error response for invalid input.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
    }

    /// Returns an error response for a missing caller identity.
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", message)
    }

    /// Returns an error response for missing resources.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
    }

    /// Returns an internal error response.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", message)
    }

    /// Returns a 409 for a token reused with a different request payload.
    #[must_use]
    pub fn idempotency_conflict() -> Self {
        Self::new(
            StatusCode::CONFLICT,
            "IDEMPOTENCY_CONFLICT",
            "Idempotency key already used with a different request body",
        )
    }

    /// Returns a 409 for in-progress idempotent requests with a Retry-After header.
    #[must_use]
    pub fn idempotency_in_progress(retry_after_secs: u64) -> Self {
        Self::new(
            StatusCode::CONFLICT,
            "IDEMPOTENCY_IN_PROGRESS",
            "A request with this idempotency key is already in progress",
        )
        .with_retry_after(retry_after_secs)
    }

    /// Returns a 503 when the idempotency store cannot guard the write.
    pub fn store_unavailable(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "IDEMPOTENCY_STORE_UNAVAILABLE",
            message,
        )
    }

    /// Attaches a request ID for correlation.
    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Attaches a Retry-After header value in seconds.
    #[must_use]
    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after_secs = Some(seconds);
        self
    }

    /// Returns the HTTP status code for this error.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        self.status
    }

    /// Returns the stable machine-readable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        self.code
    }

    /// Returns the human-readable error message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the request ID, if one was attached.
    #[must_use]
    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    /// Returns the Retry-After value, if one was attached.
    #[must_use]
    pub const fn retry_after_secs(&self) -> Option<u64> {
        self.retry_after_secs
    }

    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            request_id: None,
            retry_after_secs: None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let request_id = self.request_id;
        let retry_after_secs = self.retry_after_secs;
        let mut response = (
            self.status,
            Json(ApiErrorEnvelope {
                error: ApiErrorBody {
                    code: self.code.to_string(),
                    message: self.message,
                    request_id: request_id.clone(),
                },
            }),
        )
            .into_response();

        if let Some(request_id) = request_id {
            if let Ok(value) = HeaderValue::from_str(&request_id) {
                response
                    .headers_mut()
                    .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
            }
        }

        if let Some(secs) = retry_after_secs {
            response.headers_mut().insert(
                HeaderName::from_static("retry-after"),
                HeaderValue::from(secs),
            );
        }

        response
    }
}

impl From<IdempotencyError> for ApiError {
    fn from(value: IdempotencyError) -> Self {
        match value {
            IdempotencyError::InvalidKey(e) => Self::new(
                StatusCode::BAD_REQUEST,
                "INVALID_IDEMPOTENCY_KEY",
                e.to_string(),
            ),
            IdempotencyError::StoreUnavailable(e) => {
                tracing::error!(error = %e, "Idempotency store unavailable; refusing write");
                Self::store_unavailable("Idempotency store unavailable, retry later")
            }
            IdempotencyError::Contention { rounds } => {
                tracing::warn!(rounds, "Idempotency key contended; refusing write");
                Self::store_unavailable("Idempotency key is contended, retry later")
            }
            e @ (IdempotencyError::CorruptEntry { .. }
            | IdempotencyError::InvariantViolation { .. }) => {
                tracing::error!(error = %e, "Idempotency entry unusable");
                Self::internal("Idempotency state could not be resolved")
            }
        }
    }
}

impl From<ExecuteError<Self>> for ApiError {
    fn from(value: ExecuteError<Self>) -> Self {
        match value {
            ExecuteError::InProgress {
                retry_after_secs, ..
            } => Self::idempotency_in_progress(retry_after_secs),
            ExecuteError::FingerprintMismatch => Self::idempotency_conflict(),
            ExecuteError::Work(e) => e,
            ExecuteError::WorkPanicked => Self::internal("Request handler failed"),
            ExecuteError::WorkCancelled => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "SERVICE_UNAVAILABLE",
                "Request was interrupted, retry later",
            ),
            ExecuteError::Idempotency(e) => e.into(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(value: JsonRejection) -> Self {
        Self::new(value.status(), "INVALID_REQUEST_BODY", value.body_text())
    }
}

impl From<SocialError> for ApiError {
    fn from(value: SocialError) -> Self {
        match value {
            SocialError::EmptyContent | SocialError::ContentTooLong { .. } => {
                Self::bad_request(value.to_string())
            }
            SocialError::PostNotFound { .. } => Self::not_found(value.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use oncewrite_coordinator::IdempotencyKeyError;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 4096)
            .await
            .expect("read body");
        serde_json::from_slice(&bytes).expect("json body")
    }

    #[tokio::test]
    async fn test_error_body_is_wrapped() {
        let response = ApiError::not_found("post not found: p1")
            .with_request_id("req-1")
            .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response
                .headers()
                .get(REQUEST_ID_HEADER)
                .and_then(|v| v.to_str().ok()),
            Some("req-1")
        );

        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "NOT_FOUND");
        assert_eq!(body["error"]["message"], "post not found: p1");
        assert_eq!(body["error"]["requestId"], "req-1");
    }

    #[tokio::test]
    async fn test_request_id_omitted_when_absent() {
        let body = body_json(ApiError::bad_request("nope").into_response()).await;
        assert!(body["error"].get("requestId").is_none());
    }

    #[test]
    fn test_in_progress_has_retry_after() {
        let error = ApiError::from(ExecuteError::<ApiError>::InProgress {
            started_at: Utc::now(),
            retry_after_secs: 5,
        });
        assert_eq!(error.status(), StatusCode::CONFLICT);
        assert_eq!(error.code(), "IDEMPOTENCY_IN_PROGRESS");

        let response = error.into_response();
        let retry_after = response
            .headers()
            .get("retry-after")
            .expect("Retry-After header should be present");
        assert_eq!(retry_after.to_str().unwrap(), "5");
    }

    #[test]
    fn test_mismatch_has_no_retry_after() {
        let error = ApiError::from(ExecuteError::<ApiError>::FingerprintMismatch);
        assert_eq!(error.code(), "IDEMPOTENCY_CONFLICT");
        assert!(error.into_response().headers().get("retry-after").is_none());
    }

    #[tokio::test]
    async fn test_json_rejection_is_wrapped() {
        let request = axum::http::Request::builder()
            .method("POST")
            .header("content-type", "application/json")
            .body(axum::body::Body::from("{not json"))
            .expect("request");
        let rejection = <Json<serde_json::Value> as axum::extract::FromRequest<()>>::from_request(
            request,
            &(),
        )
        .await
        .expect_err("malformed body");

        let error = ApiError::from(rejection).with_request_id("req-9");
        assert_eq!(error.status(), StatusCode::BAD_REQUEST);
        let body = body_json(error.into_response()).await;
        assert_eq!(body["error"]["code"], "INVALID_REQUEST_BODY");
        assert_eq!(body["error"]["requestId"], "req-9");
    }

    #[test]
    fn test_cancelled_work_is_unavailable() {
        let error = ApiError::from(ExecuteError::<ApiError>::WorkCancelled);
        assert_eq!(error.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(error.code(), "SERVICE_UNAVAILABLE");
    }

    #[test]
    fn test_work_error_keeps_status() {
        let error = ApiError::from(ExecuteError::Work(ApiError::not_found("gone")));
        assert_eq!(error.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_idempotency_error_mapping() {
        let invalid = ApiError::from(IdempotencyError::InvalidKey(IdempotencyKeyError::EmptyToken));
        assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);
        assert_eq!(invalid.code(), "INVALID_IDEMPOTENCY_KEY");

        let down = ApiError::from(IdempotencyError::StoreUnavailable(
            oncewrite_core::Error::storage("connection refused"),
        ));
        assert_eq!(down.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(down.code(), "IDEMPOTENCY_STORE_UNAVAILABLE");
        assert!(!down.message().contains("connection refused"));

        let corrupt = ApiError::from(IdempotencyError::CorruptEntry {
            key: "k".into(),
            message: "bad json".into(),
        });
        assert_eq!(corrupt.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
