//! API integration tests.
//!
//! Tests the complete request flow: HTTP -> context -> coordinator -> key store.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::http::{HeaderMap, Method, Request, StatusCode, header};
use bytes::Bytes;
use tower::ServiceExt;

use oncewrite_api::config::Config;
use oncewrite_api::server::ServerBuilder;
use oncewrite_api::social::SocialStore;
use oncewrite_coordinator::{
    ClaimResult, IdempotencyKey, IdempotencyStore, KeyStoreIdempotencyStore, LockEntry, Operation,
    RequestFingerprint,
};
use oncewrite_core::KeyStore;
use oncewrite_test_utils::TracingKeyStore;

struct TestApp {
    router: axum::Router,
    social: Arc<SocialStore>,
    store: TracingKeyStore,
}

fn test_app() -> Result<TestApp> {
    test_app_with(Config::default())
}

fn test_app_with(config: Config) -> Result<TestApp> {
    let store = TracingKeyStore::new();
    let social = Arc::new(SocialStore::new());
    let router = ServerBuilder::new()
        .config(config)
        .key_store(Arc::new(store.clone()))
        .social_store(Arc::clone(&social))
        .build()
        .test_router()
        .context("build router")?;
    Ok(TestApp {
        router,
        social,
        store,
    })
}

#[tokio::test]
async fn test_retry_replays_stored_post() -> Result<()> {
    let app = test_app()?;
    let body = serde_json::json!({ "content": "hello world" });

    let first = helpers::post(&app.router, "/api/v1/posts", "user-1", Some("create-post-7f3a"), &body).await?;
    let retry = helpers::post(&app.router, "/api/v1/posts", "user-1", Some("create-post-7f3a"), &body).await?;

    assert_eq!(first.status, StatusCode::CREATED);
    assert_eq!(retry.status, StatusCode::CREATED);
    assert_eq!(first.body, retry.body);
    assert!(first.headers.get("x-idempotent-replayed").is_none());
    assert_eq!(helpers::header(&retry.headers, "x-idempotent-replayed"), Some("true"));
    assert_eq!(app.social.post_count().await, 1);

    let post = first.json()?;
    assert_eq!(post["author_id"], "user-1");
    assert_eq!(post["content"], "hello world");
    assert!(post["id"].as_str().is_some_and(|id| !id.is_empty()));
    assert!(post["created_at"].is_string());
    Ok(())
}

#[tokio::test]
async fn test_token_reuse_with_new_body_conflicts() -> Result<()> {
    let app = test_app()?;

    let first = helpers::post(
        &app.router,
        "/api/v1/posts",
        "user-1",
        Some("x1"),
        &serde_json::json!({ "content": "hi" }),
    )
    .await?;
    assert_eq!(first.status, StatusCode::CREATED);

    let second = helpers::post(
        &app.router,
        "/api/v1/posts",
        "user-1",
        Some("x1"),
        &serde_json::json!({ "content": "bye" }),
    )
    .await?;
    assert_eq!(second.status, StatusCode::CONFLICT);
    let error = second.json()?;
    assert_eq!(error["error"]["code"], "IDEMPOTENCY_CONFLICT");
    assert!(error["error"]["requestId"].is_string());
    assert!(second.headers.get("retry-after").is_none());

    assert_eq!(app.social.post_count().await, 1);
    Ok(())
}

#[tokio::test]
async fn test_missing_user_is_unauthorized() -> Result<()> {
    let app = test_app()?;
    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/v1/posts")
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-request-id", "req-anon")
        .body(Body::from(r#"{"content":"hi"}"#))
        .context("build request")?;
    let response = helpers::send(&app.router, request).await?;

    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
    assert_eq!(helpers::header(&response.headers, "x-request-id"), Some("req-anon"));
    let error = response.json()?;
    assert_eq!(error["error"]["code"], "UNAUTHORIZED");
    assert_eq!(error["error"]["requestId"], "req-anon");
    assert_eq!(app.social.post_count().await, 0);
    Ok(())
}

#[tokio::test]
async fn test_malformed_body_uses_error_envelope() -> Result<()> {
    let app = test_app()?;
    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/v1/posts")
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-user-id", "user-1")
        .header("x-request-id", "req-garbled")
        .header("x-idempotency-key", "garbled-1")
        .body(Body::from(r#"{"content": "#))
        .context("build request")?;
    let response = helpers::send(&app.router, request).await?;

    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    let error = response.json()?;
    assert_eq!(error["error"]["code"], "INVALID_REQUEST_BODY");
    assert_eq!(error["error"]["requestId"], "req-garbled");
    assert!(app.store.operations().is_empty(), "rejected before the token is claimed");
    Ok(())
}

#[tokio::test]
async fn test_request_id_echoed_on_success() -> Result<()> {
    let app = test_app()?;
    let request = helpers::request(
        "/api/v1/posts",
        &[("x-user-id", "user-1"), ("x-request-id", "req-123")],
        &serde_json::json!({ "content": "hi" }),
    )?;
    let response = helpers::send(&app.router, request).await?;
    assert_eq!(response.status, StatusCode::CREATED);
    assert_eq!(helpers::header(&response.headers, "x-request-id"), Some("req-123"));
    Ok(())
}

#[tokio::test]
async fn test_alias_header_replays_primary() -> Result<()> {
    let app = test_app()?;
    let body = serde_json::json!({ "content": "hi" });

    let first = helpers::send(
        &app.router,
        helpers::request(
            "/api/v1/posts",
            &[("x-user-id", "user-1"), ("x-idempotency-key", "alias-1")],
            &body,
        )?,
    )
    .await?;
    let retry = helpers::send(
        &app.router,
        helpers::request(
            "/api/v1/posts",
            &[("x-user-id", "user-1"), ("idempotency-key", "alias-1")],
            &body,
        )?,
    )
    .await?;

    assert_eq!(first.status, StatusCode::CREATED);
    assert_eq!(helpers::header(&retry.headers, "x-idempotent-replayed"), Some("true"));
    assert_eq!(first.body, retry.body);
    assert_eq!(app.social.post_count().await, 1);
    Ok(())
}

#[tokio::test]
async fn test_disagreeing_token_headers_rejected() -> Result<()> {
    let app = test_app()?;
    let response = helpers::send(
        &app.router,
        helpers::request(
            "/api/v1/posts",
            &[
                ("x-user-id", "user-1"),
                ("x-idempotency-key", "a"),
                ("idempotency-key", "b"),
            ],
            &serde_json::json!({ "content": "hi" }),
        )?,
    )
    .await?;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(app.social.post_count().await, 0);
    Ok(())
}

#[tokio::test]
async fn test_invalid_token_rejected() -> Result<()> {
    let app = test_app()?;
    let long_token = "k".repeat(256);
    let response = helpers::post(
        &app.router,
        "/api/v1/posts",
        "user-1",
        Some(long_token.as_str()),
        &serde_json::json!({ "content": "hi" }),
    )
    .await?;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(response.json()?["error"]["code"], "INVALID_IDEMPOTENCY_KEY");
    assert!(app.store.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_validation_failure_releases_token() -> Result<()> {
    let app = test_app()?;

    let rejected = helpers::post(
        &app.router,
        "/api/v1/posts",
        "user-1",
        Some("retry-me"),
        &serde_json::json!({ "content": "   " }),
    )
    .await?;
    assert_eq!(rejected.status, StatusCode::BAD_REQUEST);
    assert_eq!(rejected.json()?["error"]["code"], "BAD_REQUEST");
    assert!(app.store.is_empty(), "failed work must not hold the key");

    // Same request again runs again, and still fails the same way.
    let again = helpers::post(
        &app.router,
        "/api/v1/posts",
        "user-1",
        Some("retry-me"),
        &serde_json::json!({ "content": "   " }),
    )
    .await?;
    assert_eq!(again.status, StatusCode::BAD_REQUEST);
    assert!(again.headers.get("x-idempotent-replayed").is_none());

    let fixed = helpers::post(
        &app.router,
        "/api/v1/posts",
        "user-1",
        Some("retry-me"),
        &serde_json::json!({ "content": "fixed" }),
    )
    .await?;
    assert_eq!(fixed.status, StatusCode::CREATED);
    assert_eq!(app.social.post_count().await, 1);
    Ok(())
}

#[tokio::test]
async fn test_comment_flow() -> Result<()> {
    let app = test_app()?;
    let post = app.social.create_post("author", "a post").await?;
    let uri = format!("/api/v1/posts/{}/comments", post.id);
    let body = serde_json::json!({ "content": "nice post" });

    let first = helpers::post(&app.router, &uri, "user-2", Some("c-1"), &body).await?;
    let retry = helpers::post(&app.router, &uri, "user-2", Some("c-1"), &body).await?;

    assert_eq!(first.status, StatusCode::CREATED);
    assert_eq!(first.body, retry.body);
    assert_eq!(helpers::header(&retry.headers, "x-idempotent-replayed"), Some("true"));

    let comment = first.json()?;
    assert_eq!(comment["post_id"], post.id.as_str());
    assert_eq!(comment["author_id"], "user-2");
    assert_eq!(app.social.comments_for(&post.id).await.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_comment_on_missing_post_is_not_found() -> Result<()> {
    let app = test_app()?;
    let response = helpers::post(
        &app.router,
        "/api/v1/posts/does-not-exist/comments",
        "user-1",
        Some("c-404"),
        &serde_json::json!({ "content": "hello?" }),
    )
    .await?;
    assert_eq!(response.status, StatusCode::NOT_FOUND);
    assert_eq!(response.json()?["error"]["code"], "NOT_FOUND");
    assert!(app.store.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_comment_token_bound_to_post() -> Result<()> {
    let app = test_app()?;
    let a = app.social.create_post("author", "post a").await?;
    let b = app.social.create_post("author", "post b").await?;
    let body = serde_json::json!({ "content": "same words" });

    let first = helpers::post(
        &app.router,
        &format!("/api/v1/posts/{}/comments", a.id),
        "user-1",
        Some("c-shared"),
        &body,
    )
    .await?;
    let second = helpers::post(
        &app.router,
        &format!("/api/v1/posts/{}/comments", b.id),
        "user-1",
        Some("c-shared"),
        &body,
    )
    .await?;

    assert_eq!(first.status, StatusCode::CREATED);
    assert_eq!(second.status, StatusCode::CONFLICT);
    assert!(app.social.comments_for(&b.id).await.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_tokens_scoped_by_user_and_operation() -> Result<()> {
    let app = test_app()?;
    let body = serde_json::json!({ "content": "hi" });

    let alice = helpers::post(&app.router, "/api/v1/posts", "alice", Some("shared"), &body).await?;
    let bob = helpers::post(&app.router, "/api/v1/posts", "bob", Some("shared"), &body).await?;
    assert_eq!(alice.status, StatusCode::CREATED);
    assert_eq!(bob.status, StatusCode::CREATED);
    assert_ne!(alice.body, bob.body);
    assert_eq!(app.social.post_count().await, 2);

    let post_id = alice.json()?["id"].as_str().map(str::to_string).context("post id")?;
    let comment = helpers::post(
        &app.router,
        &format!("/api/v1/posts/{post_id}/comments"),
        "alice",
        Some("shared"),
        &body,
    )
    .await?;
    assert_eq!(comment.status, StatusCode::CREATED);
    assert!(comment.headers.get("x-idempotent-replayed").is_none());
    Ok(())
}

#[tokio::test]
async fn test_in_progress_returns_retry_after() -> Result<()> {
    let config = Config::default();
    let app = test_app_with(config.clone())?;
    let body = serde_json::json!({ "content": "hi" });

    // Another instance is mid-flight on this key.
    let entries = KeyStoreIdempotencyStore::new(Arc::new(app.store.clone()), &config.idempotency);
    let key = IdempotencyKey::new("user-1", Operation::new("create_post")?, "busy-1")?;
    let entry = LockEntry::new_in_progress(&key, RequestFingerprint::from_json(&body)?);
    assert!(matches!(
        entries.claim(&key, &entry).await?,
        ClaimResult::Claimed { .. }
    ));

    let response = helpers::post(&app.router, "/api/v1/posts", "user-1", Some("busy-1"), &body).await?;
    assert_eq!(response.status, StatusCode::CONFLICT);
    assert_eq!(response.json()?["error"]["code"], "IDEMPOTENCY_IN_PROGRESS");

    let retry_after: u64 = helpers::header(&response.headers, "retry-after")
        .context("Retry-After header should be present")?
        .parse()?;
    assert!((1..=300).contains(&retry_after));
    assert_eq!(app.social.post_count().await, 0);
    Ok(())
}

#[tokio::test]
async fn test_store_outage_fails_closed() -> Result<()> {
    let app = test_app()?;
    app.store.set_unavailable(true);
    let body = serde_json::json!({ "content": "hi" });

    let guarded = helpers::post(&app.router, "/api/v1/posts", "user-1", Some("k-down"), &body).await?;
    assert_eq!(guarded.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(guarded.json()?["error"]["code"], "IDEMPOTENCY_STORE_UNAVAILABLE");
    assert_eq!(app.social.post_count().await, 0);

    // Requests without a token never touch the store.
    let unguarded = helpers::post(&app.router, "/api/v1/posts", "user-1", None, &body).await?;
    assert_eq!(unguarded.status, StatusCode::CREATED);
    assert_eq!(app.social.post_count().await, 1);
    Ok(())
}

#[tokio::test]
async fn test_transient_store_error_is_retried() -> Result<()> {
    let app = test_app()?;
    app.store.fail_next(1);

    let response = helpers::post(
        &app.router,
        "/api/v1/posts",
        "user-1",
        Some("k-flaky"),
        &serde_json::json!({ "content": "hi" }),
    )
    .await?;
    assert_eq!(response.status, StatusCode::CREATED);
    assert_eq!(app.store.injected_failures(), 1);
    assert_eq!(app.social.post_count().await, 1);
    Ok(())
}

#[tokio::test]
async fn test_requests_without_token_always_run() -> Result<()> {
    let app = test_app()?;
    let body = serde_json::json!({ "content": "hi" });
    for _ in 0..3 {
        let response = helpers::post(&app.router, "/api/v1/posts", "user-1", None, &body).await?;
        assert_eq!(response.status, StatusCode::CREATED);
    }
    assert_eq!(app.social.post_count().await, 3);
    assert!(app.store.operations().is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_duplicates_create_one_post() -> Result<()> {
    let app = test_app()?;
    let body = serde_json::json!({ "content": "double click" });

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let router = app.router.clone();
        let body = body.clone();
        tasks.push(tokio::spawn(async move {
            helpers::post(&router, "/api/v1/posts", "user-1", Some("dbl-1"), &body).await
        }));
    }

    let mut created = Vec::new();
    for task in tasks {
        let response = task.await??;
        match response.status {
            StatusCode::CREATED => created.push(response.body),
            StatusCode::CONFLICT => {
                assert_eq!(response.json()?["error"]["code"], "IDEMPOTENCY_IN_PROGRESS");
            }
            other => panic!("unexpected status {other}"),
        }
    }

    assert!(!created.is_empty());
    assert!(created.windows(2).all(|pair| pair[0] == pair[1]));
    assert_eq!(app.social.post_count().await, 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_expiry_sweep_drops_settled_tokens() -> Result<()> {
    let mut config = Config::default();
    config.idempotency.stale_timeout = Duration::from_secs(10);
    config.idempotency.completed_ttl = Duration::from_secs(30);
    config.expiry_sweep_interval = Duration::from_secs(5);
    let store = TracingKeyStore::new();
    let server = ServerBuilder::new()
        .config(config)
        .key_store(Arc::new(store.clone()))
        .build();
    let router = server.test_router()?;
    let sweep = server.start_expiry_sweep();

    for i in 0..50 {
        let token = format!("burst-{i}");
        let body = serde_json::json!({ "content": format!("post {i}") });
        let response =
            helpers::post(&router, "/api/v1/posts", "user-1", Some(token.as_str()), &body).await?;
        assert_eq!(response.status, StatusCode::CREATED);
    }
    assert_eq!(store.len(), 50);

    tokio::time::sleep(Duration::from_secs(40)).await;

    assert!(store.is_empty());
    assert_eq!(store.sweep_expired().await?, 0, "expired tokens were already swept");
    sweep.abort();
    Ok(())
}

#[tokio::test]
async fn test_metrics_endpoint_exports_coordinator_metrics() -> Result<()> {
    oncewrite_api::metrics::init_metrics();
    let app = test_app()?;
    let body = serde_json::json!({ "content": "hi" });
    helpers::post(&app.router, "/api/v1/posts", "user-1", Some("m-1"), &body).await?;

    let request = Request::builder()
        .uri("/metrics")
        .body(Body::empty())
        .context("build request")?;
    let response = helpers::send(&app.router, request).await?;
    assert_eq!(response.status, StatusCode::OK);

    let text = String::from_utf8(response.body.to_vec())?;
    assert!(text.contains("oncewrite_idempotency_check_total"));
    assert!(text.contains("oncewrite_api_request_total"));
    Ok(())
}

mod helpers {
    use super::*;

    pub struct TestResponse {
        pub status: StatusCode,
        pub headers: HeaderMap,
        pub body: Bytes,
    }

    impl TestResponse {
        pub fn json(&self) -> Result<serde_json::Value> {
            serde_json::from_slice(&self.body).context("parse JSON body")
        }
    }

    pub fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
        headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn request(
        uri: &str,
        headers: &[(&str, &str)],
        body: &serde_json::Value,
    ) -> Result<Request<Body>> {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder
            .body(Body::from(
                serde_json::to_vec(body).context("serialize request body")?,
            ))
            .context("build request")
    }

    pub async fn send(router: &axum::Router, request: Request<Body>) -> Result<TestResponse> {
        let response = router
            .clone()
            .oneshot(request)
            .await
            .map_err(|err| match err {})?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
            .await
            .context("read response body")?;
        Ok(TestResponse {
            status,
            headers,
            body,
        })
    }

    pub async fn post(
        router: &axum::Router,
        uri: &str,
        user_id: &str,
        token: Option<&str>,
        body: &serde_json::Value,
    ) -> Result<TestResponse> {
        let mut headers = vec![("x-user-id", user_id)];
        if let Some(token) = token {
            headers.push(("x-idempotency-key", token));
        }
        send(router, request(uri, &headers, body)?).await
    }
}
