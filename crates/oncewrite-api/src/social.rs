//! In-memory posts and comments behind the guarded write routes.
//!
//! Content is trimmed before it is validated or stored.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use ulid::Ulid;

/// Maximum post or comment length in characters, after trimming.
pub const MAX_CONTENT_CHARS: usize = 500;

/// Errors from the post and comment store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SocialError {
    /// Content was empty after trimming.
    #[error("content must not be empty")]
    EmptyContent,

    /// Content exceeded [`MAX_CONTENT_CHARS`].
    #[error("content is {len} characters, maximum is {max}")]
    ContentTooLong {
        /// Trimmed length in characters.
        len: usize,
        /// Maximum allowed length.
        max: usize,
    },

    /// The target post does not exist.
    #[error("post not found: {post_id}")]
    PostNotFound {
        /// Requested post ID.
        post_id: String,
    },
}

/// A stored post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    /// Post ID (ULID).
    pub id: String,
    /// Identity of the author.
    pub author_id: String,
    /// Trimmed content.
    pub content: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// A stored comment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    /// Comment ID (ULID).
    pub id: String,
    /// Post the comment belongs to.
    pub post_id: String,
    /// Identity of the author.
    pub author_id: String,
    /// Trimmed content.
    pub content: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Records {
    posts: HashMap<String, Post>,
    comments: Vec<Comment>,
}

/// Post and comment store.
#[derive(Debug, Default)]
pub struct SocialStore {
    records: RwLock<Records>,
}

impl SocialStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a post.
    ///
    /// # Errors
    ///
    /// Returns an error if the content is empty or too long.
    pub async fn create_post(&self, author_id: &str, content: &str) -> Result<Post, SocialError> {
        let content = validate_content(content)?;
        let post = Post {
            id: Ulid::new().to_string(),
            author_id: author_id.to_string(),
            content,
            created_at: Utc::now(),
        };
        self.records
            .write()
            .await
            .posts
            .insert(post.id.clone(), post.clone());
        Ok(post)
    }

    /// Adds a comment to an existing post.
    ///
    /// # Errors
    ///
    /// Returns an error if the content is invalid or the post does not exist.
    pub async fn create_comment(
        &self,
        post_id: &str,
        author_id: &str,
        content: &str,
    ) -> Result<Comment, SocialError> {
        let content = validate_content(content)?;
        let mut records = self.records.write().await;
        if !records.posts.contains_key(post_id) {
            return Err(SocialError::PostNotFound {
                post_id: post_id.to_string(),
            });
        }
        let comment = Comment {
            id: Ulid::new().to_string(),
            post_id: post_id.to_string(),
            author_id: author_id.to_string(),
            content,
            created_at: Utc::now(),
        };
        records.comments.push(comment.clone());
        Ok(comment)
    }

    /// Returns a post by ID.
    pub async fn post(&self, post_id: &str) -> Option<Post> {
        self.records.read().await.posts.get(post_id).cloned()
    }

    /// Number of stored posts.
    pub async fn post_count(&self) -> usize {
        self.records.read().await.posts.len()
    }

    /// Comments on a post, oldest first.
    pub async fn comments_for(&self, post_id: &str) -> Vec<Comment> {
        self.records
            .read()
            .await
            .comments
            .iter()
            .filter(|c| c.post_id == post_id)
            .cloned()
            .collect()
    }
}

fn validate_content(content: &str) -> Result<String, SocialError> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(SocialError::EmptyContent);
    }
    let len = trimmed.chars().count();
    if len > MAX_CONTENT_CHARS {
        return Err(SocialError::ContentTooLong {
            len,
            max: MAX_CONTENT_CHARS,
        });
    }
    Ok(trimmed.to_string())
}
