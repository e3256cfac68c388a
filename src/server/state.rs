use crate::{
    config::Config,
    events::{EventSink, TracingSink},
    metrics,
    upstream::UpstreamFetcher,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use std::time::Instant;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<Config>,
    /// Upstream fetcher wrapping the pooled HTTP client
    pub fetcher: Arc<UpstreamFetcher>,
    /// Destination for relay diagnostics
    pub events: Arc<dyn EventSink>,
    /// Prometheus handle, `None` when another recorder owns the process
    pub metrics: Option<PrometheusHandle>,
    pub started_at: Instant,
}

impl AppState {
    /// Create state that reports relay events through `tracing`
    pub fn new(config: Config) -> reqwest::Result<Self> {
        Self::with_events(config, Arc::new(TracingSink))
    }

    /// Create state with a custom event sink
    pub fn with_events(config: Config, events: Arc<dyn EventSink>) -> reqwest::Result<Self> {
        let client = UpstreamFetcher::build_client(&config)?;
        let fetcher = UpstreamFetcher::new(client, config.fetch_timeout);

        Ok(Self {
            config: Arc::new(config),
            fetcher: Arc::new(fetcher),
            events,
            metrics: metrics::init(),
            started_at: Instant::now(),
        })
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
