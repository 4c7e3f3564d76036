//! Comment API routes.
//!
//! ## Routes
//!
//! - `POST /posts/:post_id/comments` - Comment on a post (honours idempotency tokens)

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::response::Response;
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;

use crate::context::RequestContext;
use crate::error::ApiError;
use crate::server::AppState;

/// Operation name under which comment creation tokens are scoped.
pub const CREATE_COMMENT: &str = "create_comment";

/// Request to comment on a post.
#[derive(Debug, Deserialize)]
pub struct CreateCommentRequest {
    /// Comment content, 1 to 500 characters after trimming.
    pub content: String,
}

/// Creates comment routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/posts/:post_id/comments", post(create_comment))
}

/// Comment on a post.
///
/// POST /api/v1/posts/{post_id}/comments
pub(crate) async fn create_comment(
    ctx: RequestContext,
    State(state): State<Arc<AppState>>,
    Path(post_id): Path<String>,
    body: Result<Json<CreateCommentRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(req) =
        body.map_err(|e| ApiError::from(e).with_request_id(ctx.request_id.clone()))?;
    tracing::info!(
        user_id = %ctx.user_id,
        request_id = %ctx.request_id,
        post_id = %post_id,
        "Creating comment"
    );

    // The same token on two different posts is a different request.
    let request_json = serde_json::json!({
        "post_id": &post_id,
        "content": &req.content,
    });
    let social = Arc::clone(state.social());
    let author_id = ctx.user_id.clone();

    super::run_idempotent(&state, &ctx, CREATE_COMMENT, &request_json, move || async move {
        let comment = social
            .create_comment(&post_id, &author_id, &req.content)
            .await?;
        tracing::info!(comment_id = %comment.id, post_id = %comment.post_id, "Comment created");
        Ok::<_, ApiError>(comment)
    })
    .await
}
