use crate::{
    config::Config,
    error::{RelayError, Result},
};
use axum::http::{HeaderMap, header::HOST};
use url::Url;

const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
const X_FORWARDED_HOST: &str = "x-forwarded-host";

/// Absolute URL of this relay's endpoint as clients see it.
///
/// Rewritten manifests point here. The base comes from `PUBLIC_BASE_URL`
/// when configured, then from forwarding headers, then from `Host`, and
/// finally `http://localhost:<port>`.
///
/// # Errors
/// [`RelayError::BadRequest`] when the request headers describe a host that
/// does not form a valid URL.
pub fn proxy_endpoint(config: &Config, headers: &HeaderMap) -> Result<Url> {
    let base = match &config.public_base_url {
        Some(base) => base.clone(),
        None => derive_base(config.port, headers),
    };

    let raw = format!("{}{}", base.trim_end_matches('/'), config.proxy_path);
    Url::parse(&raw)
        .map_err(|e| RelayError::BadRequest(format!("Cannot build public URL '{raw}': {e}")))
}

fn derive_base(port: u16, headers: &HeaderMap) -> String {
    let proto = first_value(headers, X_FORWARDED_PROTO)
        .map(|p| p.to_ascii_lowercase())
        .filter(|p| p == "http" || p == "https")
        .unwrap_or_else(|| "http".to_string());

    let host =
        first_value(headers, X_FORWARDED_HOST).or_else(|| first_value(headers, HOST.as_str()));

    match host {
        Some(host) => format!("{proto}://{host}"),
        None => format!("http://localhost:{port}"),
    }
}

/// First comma-separated entry of a header, trimmed; proxies append to these
fn first_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
