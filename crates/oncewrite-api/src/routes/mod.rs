//! HTTP route handlers.

pub mod comments;
pub mod posts;

use std::future::Future;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::header::{self, HeaderName};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::Instrument;

use oncewrite_coordinator::{Execution, Operation, Reply, RequestFingerprint};
use oncewrite_core::observability::idempotency_span;

use crate::context::RequestContext;
use crate::error::{ApiError, ApiResult};
use crate::server::AppState;

/// Response header set on replayed replies.
pub const REPLAYED_HEADER: &str = "x-idempotent-replayed";

/// `/api/v1` routes (caller identity required).
pub fn api_v1_routes() -> Router<Arc<AppState>> {
    Router::new()
        .merge(posts::routes())
        .merge(comments::routes())
}

/// Runs a create handler under the idempotency coordinator.
///
/// `request` is the semantic request body; its canonical hash is the fingerprint.
/// The reply is serialized once, stored, and returned byte-for-byte on replays.
pub(crate) async fn run_idempotent<T, F, Fut>(
    state: &AppState,
    ctx: &RequestContext,
    operation: &'static str,
    request: &serde_json::Value,
    work: F,
) -> ApiResult<Response>
where
    T: Serialize + Send + 'static,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = ApiResult<T>> + Send + 'static,
{
    let request_id = ctx.request_id.clone();
    let operation = Operation::new(operation).map_err(|e| {
        ApiError::internal(format!("invalid operation name: {e}"))
            .with_request_id(request_id.clone())
    })?;
    let fingerprint = RequestFingerprint::from_json(request).map_err(|e| {
        ApiError::internal(format!("Failed to compute request hash: {e}"))
            .with_request_id(request_id.clone())
    })?;

    let span = idempotency_span(operation.as_str(), &ctx.user_id);
    let execution = state
        .coordinator()
        .execute(
            &ctx.user_id,
            &operation,
            ctx.idempotency_key.as_deref(),
            fingerprint,
            move || async move {
                let created = work().await?;
                let payload = serde_json::to_vec(&created).map_err(|e| {
                    ApiError::internal(format!("Failed to encode response: {e}"))
                })?;
                Ok::<_, ApiError>(Reply::new(StatusCode::CREATED.as_u16(), payload))
            },
        )
        .instrument(span)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(request_id.clone()))?;

    execution_response(execution).map_err(|e| e.with_request_id(request_id))
}

fn execution_response(execution: Execution) -> ApiResult<Response> {
    let status = StatusCode::from_u16(execution.status)
        .map_err(|e| ApiError::internal(format!("Stored status is invalid: {e}")))?;
    let replayed = execution.is_replay();

    let mut response = (
        status,
        [(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))],
        Body::from(execution.payload),
    )
        .into_response();
    if replayed {
        response.headers_mut().insert(
            HeaderName::from_static(REPLAYED_HEADER),
            HeaderValue::from_static("true"),
        );
    }
    Ok(response)
}
