//! Post API routes.
//!
//! ## Routes
//!
//! - `POST /posts` - Create a post (honours idempotency tokens)

use std::sync::Arc;

use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::response::Response;
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;

use crate::context::RequestContext;
use crate::error::ApiError;
use crate::server::AppState;

/// Operation name under which post creation tokens are scoped.
pub const CREATE_POST: &str = "create_post";

/// Request to create a post.
#[derive(Debug, Deserialize)]
pub struct CreatePostRequest {
    /// Post content, 1 to 500 characters after trimming.
    pub content: String,
}

/// Creates post routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/posts", post(create_post))
}

/// Create a post.
///
/// POST /api/v1/posts
pub(crate) async fn create_post(
    ctx: RequestContext,
    State(state): State<Arc<AppState>>,
    body: Result<Json<CreatePostRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(req) =
        body.map_err(|e| ApiError::from(e).with_request_id(ctx.request_id.clone()))?;
    tracing::info!(
        user_id = %ctx.user_id,
        request_id = %ctx.request_id,
        "Creating post"
    );

    let request_json = serde_json::json!({ "content": &req.content });
    let social = Arc::clone(state.social());
    let author_id = ctx.user_id.clone();

    super::run_idempotent(&state, &ctx, CREATE_POST, &request_json, move || async move {
        let post = social.create_post(&author_id, &req.content).await?;
        tracing::info!(post_id = %post.id, author_id = %post.author_id, "Post created");
        Ok::<_, ApiError>(post)
    })
    .await
}
