//! Request context extraction and middleware.
//!
//! Authentication happens upstream. This layer trusts the user ID the upstream
//! authenticator forwards in `X-User-Id`, and reads the idempotency token the client sent.

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::{FromRequestParts, State};
use axum::http::header::HeaderName;
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderValue, Request};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use ulid::Ulid;

use crate::error::ApiError;
use crate::server::AppState;

/// Header name for request IDs.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Header carrying the authenticated user ID.
pub const USER_ID_HEADER: &str = "x-user-id";

/// Primary idempotency token header.
pub const IDEMPOTENCY_KEY_HEADER: &str = "x-idempotency-key";

/// Accepted alias for [`IDEMPOTENCY_KEY_HEADER`].
pub const IDEMPOTENCY_KEY_ALIAS_HEADER: &str = "idempotency-key";

/// Per-request context derived from upstream authentication and headers.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Authenticated user ID.
    pub user_id: String,
    /// Request ID for tracing/correlation.
    pub request_id: String,
    /// Optional idempotency token (safe retries).
    pub idempotency_key: Option<String>,
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for RequestContext {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        if let Some(existing) = parts.extensions.get::<Self>() {
            return Ok(existing.clone());
        }

        let ctx = Self::from_headers(&parts.headers)?;
        parts.extensions.insert(ctx.clone());
        Ok(ctx)
    }
}

impl RequestContext {
    /// Builds a context from request headers.
    ///
    /// # Errors
    ///
    /// Returns 401 without a user ID, and 400 when both idempotency headers are present
    /// with different values.
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, ApiError> {
        let request_id =
            header_string(headers, REQUEST_ID_HEADER).unwrap_or_else(|| Ulid::new().to_string());

        let user_id = header_string(headers, USER_ID_HEADER)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                ApiError::unauthorized("missing X-User-Id header")
                    .with_request_id(request_id.clone())
            })?;

        let idempotency_key = idempotency_key_from_headers(headers)
            .map_err(|e| e.with_request_id(request_id.clone()))?;

        Ok(Self {
            user_id,
            request_id,
            idempotency_key,
        })
    }
}

fn idempotency_key_from_headers(headers: &HeaderMap) -> Result<Option<String>, ApiError> {
    let primary = header_string(headers, IDEMPOTENCY_KEY_HEADER);
    let alias = header_string(headers, IDEMPOTENCY_KEY_ALIAS_HEADER);
    match (primary, alias) {
        (Some(primary), Some(alias)) if primary != alias => Err(ApiError::bad_request(
            "X-Idempotency-Key and Idempotency-Key headers disagree",
        )),
        (Some(key), _) | (None, Some(key)) => Ok(Some(key)),
        (None, None) => Ok(None),
    }
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    let value = headers.get(name)?;
    header_value_to_string(value)
}

fn header_value_to_string(value: &HeaderValue) -> Option<String> {
    value.to_str().ok().map(str::to_string)
}

/// Context middleware for `/api/v1`.
///
/// Rejects requests without a caller identity, injects the [`RequestContext`] into
/// request extensions, and echoes the request ID on the response.
pub async fn context_middleware(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let (mut parts, body) = req.into_parts();

    let ctx = match RequestContext::from_request_parts(&mut parts, &state).await {
        Ok(ctx) => ctx,
        Err(err) => return err.into_response(),
    };

    let mut req = Request::from_parts(parts, body);
    let request_id = ctx.request_id.clone();
    req.extensions_mut().insert(ctx);

    let mut response = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }
    response
}
