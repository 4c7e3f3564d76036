//! API server implementation.
//!
//! Provides health, ready, metrics and the guarded write endpoints.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::middleware;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use oncewrite_coordinator::IdempotencyCoordinator;
use oncewrite_core::{Error, KeyStore, MemoryKeyStore, Result, spawn_expiry_sweep};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::social::SocialStore;

// ============================================================================
// Health and Ready Responses
// ============================================================================

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Service status.
    pub status: String,
}

/// Readiness check response.
#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    /// Service readiness status.
    pub ready: bool,
    /// Optional message about readiness state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

// ============================================================================
// Application State
// ============================================================================

/// Shared application state for all request handlers.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    key_store: Arc<dyn KeyStore>,
    coordinator: IdempotencyCoordinator,
    social: Arc<SocialStore>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &self.config)
            .field("key_store", &"<KeyStore>")
            .field("coordinator", &self.coordinator)
            .finish_non_exhaustive()
    }
}

impl AppState {
    /// Creates application state over a shared key store.
    ///
    /// # Errors
    ///
    /// Returns an error if the idempotency settings are inconsistent.
    pub fn new(
        config: Config,
        key_store: Arc<dyn KeyStore>,
        social: Arc<SocialStore>,
    ) -> Result<Self> {
        let coordinator =
            IdempotencyCoordinator::with_key_store(Arc::clone(&key_store), config.idempotency.clone())?;
        Ok(Self {
            config,
            key_store,
            coordinator,
            social,
        })
    }

    /// Returns the idempotency coordinator.
    #[must_use]
    pub fn coordinator(&self) -> &IdempotencyCoordinator {
        &self.coordinator
    }

    /// Returns the post and comment store.
    #[must_use]
    pub fn social(&self) -> &Arc<SocialStore> {
        &self.social
    }

    /// Returns the key store shared with every other API instance.
    #[must_use]
    pub fn key_store(&self) -> &Arc<dyn KeyStore> {
        &self.key_store
    }
}

// ============================================================================
// Route Handlers
// ============================================================================

/// Health check endpoint handler.
///
/// Shallow liveness check; does not touch the key store.
async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

/// Readiness check endpoint handler.
///
/// Guarded writes fail closed without the key store, so readiness probes it.
async fn ready(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let check_key = "__oncewrite/ready-check";
    match state.key_store().get(check_key).await {
        Ok(_) => (
            StatusCode::OK,
            Json(ReadyResponse {
                ready: true,
                message: None,
            }),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadyResponse {
                ready: false,
                message: Some(format!("key store check failed: {e}")),
            }),
        ),
    }
}

// ============================================================================
// Server
// ============================================================================

/// The oncewrite API server.
pub struct Server {
    config: Config,
    key_store: Arc<dyn KeyStore>,
    social: Arc<SocialStore>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.config)
            .field("key_store", &"<KeyStore>")
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Creates a new server with the given configuration.
    ///
    /// Defaults to an in-memory key store, which only guards a single process.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self::builder().config(config).build()
    }

    /// Creates a new `ServerBuilder`.
    #[must_use]
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Returns the server configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Creates the router with all routes and middleware.
    fn create_router(&self) -> Result<Router> {
        let state = Arc::new(AppState::new(
            self.config.clone(),
            Arc::clone(&self.key_store),
            Arc::clone(&self.social),
        )?);

        let context_layer =
            middleware::from_fn_with_state(Arc::clone(&state), crate::context::context_middleware);
        let metrics_layer = middleware::from_fn(crate::metrics::metrics_middleware);

        Ok(Router::new()
            .route("/health", get(health))
            .route("/ready", get(ready))
            .route("/metrics", get(crate::metrics::serve_metrics))
            .nest(
                "/api/v1",
                crate::routes::api_v1_routes().layer(context_layer),
            )
            // Metrics outermost for timing, then trace.
            .layer(TraceLayer::new_for_http())
            .layer(metrics_layer)
            .with_state(state))
    }

    /// Starts the server and blocks until shutdown (Ctrl-C).
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the server cannot bind.
    pub async fn serve(&self) -> Result<()> {
        crate::metrics::init_metrics();
        oncewrite_coordinator::metrics::register_metrics();

        let router = self.create_router()?;
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.http_port));

        tracing::info!(
            http_port = self.config.http_port,
            stale_timeout_secs = self.config.idempotency.stale_timeout.as_secs(),
            completed_ttl_secs = self.config.idempotency.completed_ttl.as_secs(),
            "Starting oncewrite API server"
        );

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Internal {
                message: format!("failed to bind to {addr}: {e}"),
            })?;

        let sweep = self.start_expiry_sweep();
        let served = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await;
        sweep.abort();

        served.map_err(|e| Error::Internal {
            message: format!("server error: {e}"),
        })
    }

    /// Starts the periodic sweep of expired keys from the key store.
    ///
    /// Abort the returned handle to stop it.
    pub fn start_expiry_sweep(&self) -> JoinHandle<()> {
        tracing::debug!(
            interval_secs = self.config.expiry_sweep_interval.as_secs(),
            "Starting key store expiry sweep"
        );
        spawn_expiry_sweep(Arc::clone(&self.key_store), self.config.expiry_sweep_interval)
    }

    /// Creates a test router for the server.
    ///
    /// Useful for integration tests that drive the routes without binding a port.
    ///
    /// # Errors
    ///
    /// Returns an error if the idempotency settings are inconsistent.
    #[doc(hidden)]
    pub fn test_router(&self) -> Result<Router> {
        self.create_router()
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

/// Builder for constructing a server.
pub struct ServerBuilder {
    config: Config,
    key_store: Arc<dyn KeyStore>,
    social: Arc<SocialStore>,
}

impl std::fmt::Debug for ServerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerBuilder")
            .field("config", &self.config)
            .field("key_store", &"<KeyStore>")
            .finish_non_exhaustive()
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self {
            config: Config::default(),
            key_store: Arc::new(MemoryKeyStore::new()),
            social: Arc::new(SocialStore::new()),
        }
    }
}

impl ServerBuilder {
    /// Creates a new server builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole configuration.
    #[must_use]
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Sets the HTTP port.
    #[must_use]
    pub fn http_port(mut self, port: u16) -> Self {
        self.config.http_port = port;
        self
    }

    /// Sets the key store shared by all API instances.
    #[must_use]
    pub fn key_store(mut self, key_store: Arc<dyn KeyStore>) -> Self {
        self.key_store = key_store;
        self
    }

    /// Sets the post and comment store.
    #[must_use]
    pub fn social_store(mut self, social: Arc<SocialStore>) -> Self {
        self.social = social;
        self
    }

    /// Builds the server.
    #[must_use]
    pub fn build(self) -> Server {
        Server {
            config: self.config,
            key_store: self.key_store,
            social: self.social,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{Context, Result};
    use axum::body::Body;
    use axum::http::Request;
    use oncewrite_test_utils::TracingKeyStore;
    use tower::ServiceExt;

    async fn get_json(router: Router, uri: &str) -> Result<(StatusCode, serde_json::Value)> {
        let request = Request::builder()
            .uri(uri)
            .body(Body::empty())
            .context("build request")?;
        let response = router.oneshot(request).await.map_err(|err| match err {})?;
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), 1024)
            .await
            .context("read response body")?;
        Ok((status, serde_json::from_slice(&body).context("parse JSON body")?))
    }

    #[tokio::test]
    async fn test_health_endpoint() -> Result<()> {
        let router = ServerBuilder::new().build().test_router()?;
        let (status, body) = get_json(router, "/health").await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        Ok(())
    }

    #[tokio::test]
    async fn test_ready_endpoint() -> Result<()> {
        let router = ServerBuilder::new().build().test_router()?;
        let (status, body) = get_json(router, "/ready").await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ready"], true);
        Ok(())
    }

    #[tokio::test]
    async fn test_ready_fails_when_store_down() -> Result<()> {
        let store = TracingKeyStore::new();
        store.set_unavailable(true);
        let router = ServerBuilder::new()
            .key_store(Arc::new(store))
            .build()
            .test_router()?;
        let (status, body) = get_json(router, "/ready").await?;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["ready"], false);
        Ok(())
    }

    #[test]
    fn test_invalid_idempotency_config_rejected() {
        let mut config = Config::default();
        config.idempotency.completed_ttl = config.idempotency.stale_timeout;
        assert!(Server::new(config).test_router().is_err());
    }
}
