use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tvrelay::{config::Config, server};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("tvrelay=info,tower_http=info")),
        )
        .init();

    info!("Starting tvrelay {}", env!("CARGO_PKG_VERSION"));

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        "Running in {} mode (fetch timeout {:?}, max redirects {})",
        if config.is_dev { "DEV" } else { "PROD" },
        config.fetch_timeout,
        config.max_redirects
    );

    if let Err(e) = server::start(config, shutdown_signal()).await {
        error!("Failed to start server: {}", e);
        std::process::exit(1);
    }

    info!("Shut down cleanly");
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        // Without a signal handler, run until killed
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
