//! # oncewrite-api
//!
//! HTTP surface over the idempotency coordinator.
//!
//! - **Context**: caller identity, request IDs and idempotency tokens from headers
//! - **Routes**: guarded create endpoints for posts and comments
//! - **Errors**: coordinator outcomes mapped to stable HTTP codes
//! - **Observability**: request metrics, Prometheus export, health and readiness
//!
//! ## Endpoints
//!
//! ```text
//! GET  /health                              - Health check
//! GET  /ready                               - Readiness check (probes the key store)
//! GET  /metrics                             - Prometheus metrics
//! POST /api/v1/posts                        - Create a post
//! POST /api/v1/posts/{post_id}/comments     - Comment on a post
//! ```
//!
//! Clients send `X-Idempotency-Key` (or `Idempotency-Key`) on the POST routes to make
//! retries safe. Replayed replies carry `X-Idempotent-Replayed: true`.
//!
//! ## Example
//!
//! ```rust,ignore
//! use oncewrite_api::server::Server;
//!
//! let server = Server::builder().http_port(8080).build();
//! server.serve().await?;
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod context;
pub mod error;
pub mod metrics;
pub mod routes;
pub mod server;
pub mod social;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::context::RequestContext;
    pub use crate::error::{ApiError, ApiResult};
    pub use crate::server::Server;
}
