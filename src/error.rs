use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, warn};

/// Errors surfaced to the client by the relay.
///
/// Manifest rewrite problems are intentionally absent: a URL that cannot be
/// rewritten is left in place and reported as an event instead.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Invalid target URL: {0}")]
    InvalidTarget(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Upstream unreachable: {0}")]
    UpstreamUnreachable(#[source] reqwest::Error),

    #[error("Upstream did not respond within {}ms", .0.as_millis())]
    UpstreamTimeout(Duration),

    #[error("Failed to read upstream body: {0}")]
    UpstreamBody(#[source] reqwest::Error),

    #[error("Request cancelled before the upstream responded")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, RelayError>;

/// JSON error payload: `{error, details}`
#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    details: String,
}

impl RelayError {
    /// HTTP status reflecting the failure class
    pub fn status(&self) -> StatusCode {
        match self {
            RelayError::InvalidTarget(_) | RelayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            RelayError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            RelayError::UpstreamUnreachable(_)
            | RelayError::UpstreamBody(_)
            | RelayError::Cancelled => StatusCode::BAD_GATEWAY,
        }
    }

    /// Short label used for the `error` field and the error metrics
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::InvalidTarget(_) => "Invalid target",
            RelayError::BadRequest(_) => "Bad request",
            RelayError::UpstreamTimeout(_) => "Timeout",
            RelayError::UpstreamUnreachable(_)
            | RelayError::UpstreamBody(_)
            | RelayError::Cancelled => "Proxy Error",
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status();

        if status.is_server_error() {
            error!("Relay error: {}", self);
        } else {
            warn!("Rejected request: {}", self);
        }

        let body = ErrorBody {
            error: self.kind(),
            details: self.to_string(),
        };

        (status, Json(body)).into_response()
    }
}
