use crate::server::state::AppState;
use axum::{Json, extract::State};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct HealthPayload {
    pub status: &'static str,
    pub message: String,
    pub version: &'static str,
    pub uptime_seconds: u64,
    pub timestamp: String,
}

impl HealthPayload {
    pub fn new(state: &AppState) -> Self {
        Self {
            status: "ok",
            message: format!(
                "IPTV relay is running. Use {}?url=<encoded upstream URL>",
                state.config.proxy_path
            ),
            version: env!("CARGO_PKG_VERSION"),
            uptime_seconds: state.uptime_seconds(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> Json<HealthPayload> {
    Json(HealthPayload::new(&state))
}
