use crate::{
    classify::ContentClass,
    error::Result,
    metrics,
    playlist::URL_PARAM,
    relay::relay,
    server::{
        handlers::health::HealthPayload, public_url::proxy_endpoint, state::AppState,
        url_validation::parse_target_url,
    },
    upstream::ProxyRequest,
};
use axum::{
    Json,
    extract::{Query, State},
    http::{HeaderMap, Method, StatusCode, header},
    response::{IntoResponse, Response},
};
use std::collections::HashMap;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// The relay endpoint.
///
/// `OPTIONS` answers the CORS preflight. A request without `url` doubles as
/// a liveness probe and never touches the network. Everything else is
/// fetched upstream with identity fallback and relayed per content class.
pub async fn proxy(
    method: Method,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Response> {
    if method == Method::OPTIONS {
        return Ok(StatusCode::NO_CONTENT.into_response());
    }

    let Some(raw) = params.get(URL_PARAM).filter(|v| !v.trim().is_empty()) else {
        debug!("No target supplied, answering with health payload");
        return Ok(Json(HealthPayload::new(&state)).into_response());
    };

    let start = Instant::now();
    match relay_target(&state, method, raw, &headers).await {
        Ok((class, response)) => {
            metrics::record_request(class.as_str(), response.status().as_u16());
            metrics::record_duration(class.as_str(), start);
            Ok(response)
        }
        Err(e) => {
            metrics::record_request("error", e.status().as_u16());
            metrics::record_duration("error", start);
            Err(e)
        }
    }
}

async fn relay_target(
    state: &AppState,
    method: Method,
    raw: &str,
    headers: &HeaderMap,
) -> Result<(ContentClass, Response)> {
    let target_url = parse_target_url(raw, state.config.block_private_targets)?;
    let proxy_endpoint = proxy_endpoint(&state.config, headers)?;

    let request = ProxyRequest {
        target_url,
        method: if method == Method::HEAD {
            Method::HEAD
        } else {
            Method::GET
        },
        range: headers.get(header::RANGE).cloned(),
        proxy_endpoint,
    };

    info!(
        "Relaying {} {}{}",
        request.method,
        request.target_url,
        request
            .range
            .as_ref()
            .and_then(|r| r.to_str().ok())
            .map(|r| format!(" ({r})"))
            .unwrap_or_default()
    );

    // Fires on every exit path: error, handler drop, or end of the body stream
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();

    let upstream = state
        .fetcher
        .fetch(&request, &cancel, state.events.as_ref())
        .await?;

    relay(
        upstream,
        &request,
        &state.fetcher,
        &cancel,
        guard,
        state.events.clone(),
    )
    .await
}
