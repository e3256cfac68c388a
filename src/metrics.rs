//! Prometheus metrics for the relay.
//!
//! Recording goes through the `metrics` facade; when no recorder is
//! installed (unit tests) every call is a no-op.

use metrics::{counter, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;
use tracing::warn;

static HANDLE: OnceLock<Option<PrometheusHandle>> = OnceLock::new();

/// Install the global Prometheus recorder once and return its handle.
///
/// Later calls return the same handle. `None` means another recorder was
/// already installed by someone else.
pub fn init() -> Option<PrometheusHandle> {
    HANDLE
        .get_or_init(|| match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("Prometheus recorder not installed: {}", e);
                None
            }
        })
        .clone()
}

/// Count a finished relay request by content class and status
pub fn record_request(class: &'static str, status: u16) {
    counter!(
        "tvrelay_requests_total",
        "class" => class,
        "status" => status.to_string()
    )
    .increment(1);
}

/// Observe end-to-end handling time up to the first response byte
pub fn record_duration(class: &'static str, start: Instant) {
    histogram!("tvrelay_request_duration_seconds", "class" => class)
        .record(start.elapsed().as_secs_f64());
}

/// An identity was rejected with 403 and the next one is tried
pub fn record_identity_fallback(profile: &'static str) {
    counter!("tvrelay_identity_fallbacks_total", "profile" => profile).increment(1);
}

/// Fetch-level failure, labelled by error kind
pub fn record_upstream_error(kind: &'static str) {
    counter!("tvrelay_upstream_errors_total", "kind" => kind).increment(1);
}

/// Bytes forwarded on the binary path
pub fn record_streamed_bytes(bytes: u64) {
    counter!("tvrelay_streamed_bytes_total").increment(bytes);
}
