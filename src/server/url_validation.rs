use crate::error::{RelayError, Result};
use std::net::{Ipv4Addr, Ipv6Addr};
use url::{Host, Url};

/// Parse and validate the `url` query parameter.
///
/// Accepts only absolute `http://` and `https://` URLs with a host. When
/// `block_private` is set, IP literals in private or reserved ranges are
/// rejected as well. Hostnames are never resolved.
///
/// # Errors
/// Returns [`RelayError::InvalidTarget`] for:
/// - Invalid or relative URLs
/// - Non-HTTP(S) schemes
/// - Private IP literals, when blocking is enabled
pub fn parse_target_url(raw: &str, block_private: bool) -> Result<Url> {
    let parsed = Url::parse(raw.trim())
        .map_err(|e| RelayError::InvalidTarget(format!("Invalid URL '{raw}': {e}")))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(RelayError::InvalidTarget(format!(
                "Scheme '{scheme}' not allowed, only http/https"
            )));
        }
    }

    let host = parsed
        .host()
        .ok_or_else(|| RelayError::InvalidTarget(format!("No host in URL: {raw}")))?;

    if block_private {
        match host {
            Host::Ipv4(ip) if is_blocked_ipv4(ip) => {
                return Err(RelayError::InvalidTarget(format!(
                    "Private or reserved IPv4 address not allowed: {ip}"
                )));
            }
            Host::Ipv6(ip) if is_blocked_ipv6(ip) => {
                return Err(RelayError::InvalidTarget(format!(
                    "Private or reserved IPv6 address not allowed: {ip}"
                )));
            }
            _ => {}
        }
    }

    Ok(parsed)
}

/// Returns `true` for IPv4 addresses in private or reserved ranges.
///
/// Blocked ranges:
/// - `0.0.0.0/8`      "this" network (RFC 1122)
/// - `10.0.0.0/8`     RFC 1918 private
/// - `127.0.0.0/8`    loopback
/// - `169.254.0.0/16` link-local / cloud metadata
/// - `172.16.0.0/12`  RFC 1918 private
/// - `192.168.0.0/16` RFC 1918 private
fn is_blocked_ipv4(ip: Ipv4Addr) -> bool {
    let octets = ip.octets();
    let (a, b) = (octets[0], octets[1]);

    a == 0
        || a == 10
        || a == 127
        || (a == 169 && b == 254)
        || (a == 172 && (16..=31).contains(&b))
        || (a == 192 && b == 168)
}

/// Returns `true` for IPv6 loopback, link-local (`fe80::/10`) and
/// unique-local (`fc00::/7`) addresses.
fn is_blocked_ipv6(ip: Ipv6Addr) -> bool {
    let s = ip.segments();

    ip.is_loopback() || (s[0] & 0xffc0) == 0xfe80 || (s[0] & 0xfe00) == 0xfc00
}
