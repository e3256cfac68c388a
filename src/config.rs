use std::env;
use std::time::Duration;

/// Default per-attempt upstream budget in milliseconds
pub const DEFAULT_FETCH_TIMEOUT_MS: u64 = 15_000;

/// Default TCP/TLS connect budget in milliseconds
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;

/// Default redirect chain cap
pub const DEFAULT_MAX_REDIRECTS: usize = 10;

/// Default route for the relay endpoint
pub const DEFAULT_PROXY_PATH: &str = "/proxy";

/// Routes served regardless of `PROXY_PATH`
const RESERVED_PATHS: [&str; 2] = ["/health", "/metrics"];

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub is_dev: bool,
    /// Externally visible base URL (scheme + host, optional path prefix).
    /// When unset it is derived per request from forwarding headers.
    pub public_base_url: Option<String>,
    /// Route the relay is mounted on; always starts with `/`
    pub proxy_path: String,
    /// Budget for a single upstream attempt (headers, or full body for text)
    pub fetch_timeout: Duration,
    /// Budget for establishing the upstream connection
    pub connect_timeout: Duration,
    /// Maximum redirects followed per attempt
    pub max_redirects: usize,
    /// Reject targets that are private/loopback IP literals
    pub block_private_targets: bool,
}

impl Config {
    /// Load configuration from environment variables
    /// In DEV mode, provides sensible defaults. In PROD mode, PORT is required.
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let is_dev = env::var("DEV_MODE")
            .unwrap_or_else(|_| "false".to_string())
            .parse()
            .unwrap_or(false);

        // Port: required in prod, defaults to 8080 in dev
        let port = if is_dev {
            env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()?
        } else {
            env::var("PORT")
                .map_err(|_| "PORT is required in production")?
                .parse()?
        };

        let public_base_url = env::var("PUBLIC_BASE_URL")
            .ok()
            .map(|s| s.trim_end_matches('/').to_string())
            .filter(|s| !s.is_empty());

        let proxy_path = normalize_path(
            &env::var("PROXY_PATH").unwrap_or_else(|_| DEFAULT_PROXY_PATH.to_string()),
        );
        if RESERVED_PATHS.contains(&proxy_path.as_str()) {
            return Err(format!("PROXY_PATH '{proxy_path}' collides with a built-in route").into());
        }

        let fetch_timeout_ms: u64 = env::var("FETCH_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|ms| *ms > 0)
            .unwrap_or(DEFAULT_FETCH_TIMEOUT_MS);

        let connect_timeout_ms: u64 = env::var("CONNECT_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|ms| *ms > 0)
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS);

        let max_redirects = env::var("MAX_REDIRECTS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_MAX_REDIRECTS);

        let block_private_targets = env::var("BLOCK_PRIVATE_TARGETS")
            .unwrap_or_else(|_| "false".to_string())
            .parse()
            .unwrap_or(false);

        Ok(Config {
            port,
            is_dev,
            public_base_url,
            proxy_path,
            fetch_timeout: Duration::from_millis(fetch_timeout_ms),
            connect_timeout: Duration::from_millis(connect_timeout_ms),
            max_redirects,
            block_private_targets,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            is_dev: true,
            public_base_url: None,
            proxy_path: DEFAULT_PROXY_PATH.to_string(),
            fetch_timeout: Duration::from_millis(DEFAULT_FETCH_TIMEOUT_MS),
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            max_redirects: DEFAULT_MAX_REDIRECTS,
            block_private_targets: false,
        }
    }
}

/// Ensure a route path starts with `/` and has no trailing slash
fn normalize_path(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        DEFAULT_PROXY_PATH.to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}
