//! Handler-level tests using tower::ServiceExt::oneshot.
//!
//! Tests the full Axum router (middleware + handlers) without binding a TCP
//! listener. None of these requests reach an upstream.

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode},
};
use http_body_util::BodyExt;
use tower::ServiceExt;
use tvrelay::config::Config;
use tvrelay::server::build_router;

/// Build a test config with sensible defaults.
fn test_config() -> Config {
    Config {
        port: 0,
        ..Config::default()
    }
}

async fn app() -> Router {
    build_router(test_config()).await.unwrap()
}

async fn send(app: Router, method: &str, uri: &str) -> axum::response::Response {
    let req = Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    app.oneshot(req).await.unwrap()
}

async fn json_body(resp: axum::response::Response) -> serde_json::Value {
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&body).unwrap()
}

fn assert_cors(resp: &axum::response::Response) {
    let h = resp.headers();
    assert_eq!(h["access-control-allow-origin"], "*");
    assert_eq!(h["access-control-allow-headers"], "Content-Type, Accept, Range");
    assert_eq!(h["access-control-allow-methods"], "GET, OPTIONS, HEAD");
    assert_eq!(
        h["access-control-expose-headers"],
        "Content-Length, Content-Range"
    );
}

// ── Health endpoint ─────────────────────────────────────────────────────────

#[tokio::test]
async fn health_returns_200_with_json() {
    let resp = send(app().await, "GET", "/health").await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_cors(&resp);

    let json = json_body(resp).await;
    assert_eq!(json["status"], "ok");
    assert!(json["version"].is_string());
    assert!(json["uptime_seconds"].is_number());
}

#[tokio::test]
async fn root_serves_health() {
    let resp = send(app().await, "GET", "/").await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(json_body(resp).await["status"], "ok");
}

// ── Relay boundary ──────────────────────────────────────────────────────────

#[tokio::test]
async fn proxy_without_url_is_health_probe() {
    let resp = send(app().await, "GET", "/proxy").await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_cors(&resp);

    let json = json_body(resp).await;
    assert_eq!(json["status"], "ok");
    assert!(json["message"].as_str().unwrap().contains("/proxy?url="));
}

#[tokio::test]
async fn empty_url_is_treated_as_absent() {
    let resp = send(app().await, "GET", "/proxy?url=").await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(json_body(resp).await["status"], "ok");
}

#[tokio::test]
async fn options_is_preflight_204() {
    let resp = send(
        app().await,
        "OPTIONS",
        "/proxy?url=https%3A%2F%2Fcdn.test%2Flive.m3u8",
    )
    .await;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    assert_cors(&resp);

    let body = resp.into_body().collect().await.unwrap().to_bytes();
    assert!(body.is_empty());
}

#[tokio::test]
async fn non_http_target_is_400_json() {
    let resp = send(app().await, "GET", "/proxy?url=ftp%3A%2F%2Fcdn.test%2Ffile.ts").await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_cors(&resp);

    let json = json_body(resp).await;
    assert_eq!(json["error"], "Invalid target");
    assert!(json["details"].as_str().unwrap().contains("ftp"));
}

#[tokio::test]
async fn relative_target_is_400() {
    let resp = send(app().await, "GET", "/proxy?url=live%2Findex.m3u8").await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn private_targets_blocked_when_configured() {
    let config = Config {
        block_private_targets: true,
        ..test_config()
    };
    let app = build_router(config).await.unwrap();

    let resp = send(app, "GET", "/proxy?url=http%3A%2F%2F127.0.0.1%2Fa.ts").await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(resp).await["error"], "Invalid target");
}

#[tokio::test]
async fn custom_proxy_path_is_routed() {
    let config = Config {
        proxy_path: "/relay".to_string(),
        ..test_config()
    };
    let app = build_router(config).await.unwrap();

    let resp = send(app.clone(), "GET", "/relay").await;
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = send(app, "GET", "/proxy").await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn post_is_not_allowed() {
    let resp = send(app().await, "POST", "/proxy").await;
    assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    assert_cors(&resp);
}

// ── Version header ──────────────────────────────────────────────────────────

#[tokio::test]
async fn all_responses_include_version_header() {
    let resp = send(app().await, "GET", "/health").await;
    let version = resp
        .headers()
        .get("x-tvrelay-version")
        .expect("missing X-Tvrelay-Version header");

    assert_eq!(version.to_str().unwrap(), env!("CARGO_PKG_VERSION"));
}

// ── 404 for unknown routes ──────────────────────────────────────────────────

#[tokio::test]
async fn unknown_route_returns_404_with_cors() {
    let resp = send(app().await, "GET", "/nonexistent").await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    assert_cors(&resp);
}

// ── Metrics ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn metrics_endpoint_renders_prometheus_text() {
    let app = app().await;
    let _ = send(app.clone(), "GET", "/proxy?url=ftp%3A%2F%2Fx.test%2Fa").await;

    let resp = send(app, "GET", "/metrics").await;
    assert_eq!(resp.status(), StatusCode::OK);

    let body = resp.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("tvrelay_requests_total"));
}
