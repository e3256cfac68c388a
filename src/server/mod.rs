pub mod handlers;
pub mod public_url;
pub mod state;
pub mod url_validation;

use crate::{config::Config, events::EventSink};
use axum::{
    Router,
    http::{HeaderName, HeaderValue, StatusCode, header},
    routing::get,
};
use state::AppState;
use std::sync::Arc;
use tower_http::{set_header::SetResponseHeaderLayer, trace::TraceLayer};
use tracing::{error, info};

/// Build the application router from config.
///
/// Extracted from `start()` so integration tests can use the router directly
/// with `tower::ServiceExt::oneshot` without binding a TCP listener.
pub async fn build_router(config: Config) -> Result<Router, reqwest::Error> {
    Ok(router(AppState::new(config)?))
}

/// Same as [`build_router`], reporting relay events to `events`
pub async fn build_router_with_events(
    config: Config,
    events: Arc<dyn EventSink>,
) -> Result<Router, reqwest::Error> {
    Ok(router(AppState::with_events(config, events)?))
}

fn router(state: AppState) -> Router {
    let proxy_path = state.config.proxy_path.clone();

    Router::new()
        .route("/", get(handlers::health::health_check))
        .route("/health", get(handlers::health::health_check))
        .route("/metrics", get(handlers::metrics::serve_metrics))
        .route(
            &proxy_path,
            get(handlers::proxy::proxy)
                .head(handlers::proxy::proxy)
                .options(handlers::proxy::proxy),
        )
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .layer(cors_header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"))
        .layer(cors_header(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            "Content-Type, Accept, Range",
        ))
        .layer(cors_header(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            "GET, OPTIONS, HEAD",
        ))
        .layer(cors_header(
            header::ACCESS_CONTROL_EXPOSE_HEADERS,
            "Content-Length, Content-Range",
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-tvrelay-version"),
            HeaderValue::from_static(env!("CARGO_PKG_VERSION")),
        ))
        .with_state(state)
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

/// Fixed CORS header, set on every response including errors and 404s
fn cors_header(name: HeaderName, value: &'static str) -> SetResponseHeaderLayer<HeaderValue> {
    SetResponseHeaderLayer::overriding(name, HeaderValue::from_static(value))
}

/// Start the Axum HTTP server.
///
/// Runs until `shutdown` resolves, then drains in-flight requests.
pub async fn start(
    config: Config,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("0.0.0.0:{}", config.port);
    let proxy_path = config.proxy_path.clone();

    let app = match build_router(config).await {
        Ok(app) => app,
        Err(e) => {
            error!("Failed to create HTTP client: {}", e);
            return Err(e.into());
        }
    };

    // Bind TCP listener
    let listener = match tokio::net::TcpListener::bind(addr.as_str()).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to address {}: {}", addr, e);
            return Err(e.into());
        }
    };

    info!("Relay listening on http://{}{}", addr, proxy_path);

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!("Server error: {}", e);
        return Err(e.into());
    }

    Ok(())
}
