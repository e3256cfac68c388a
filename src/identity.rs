//! Outbound request identities.
//!
//! Many IPTV origins allow-list clients by header shape. The relay walks
//! [`PROFILES`] in order and keeps the first identity the origin does not
//! answer with `403 Forbidden`.

use reqwest::header::{
    ACCEPT, ACCEPT_ENCODING, ACCEPT_LANGUAGE, HeaderMap, HeaderValue, ORIGIN, RANGE, REFERER,
    USER_AGENT,
};
use url::Url;

const CHROME_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

/// A named set of outbound headers mimicking a particular client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentityProfile {
    pub name: &'static str,
    pub user_agent: &'static str,
    pub accept: &'static str,
    pub accept_language: Option<&'static str>,
    pub accept_encoding: Option<&'static str>,
    /// Send `Referer`/`Origin` derived from the target's own origin
    pub send_origin: bool,
}

/// Identities in priority order, from minimal player to full browser.
pub const PROFILES: [IdentityProfile; 4] = [
    // Xtream panels frequently accept a bare player and nothing else
    IdentityProfile {
        name: "media-player",
        user_agent: "VLC/3.0.20 LibVLC/3.0.20",
        accept: "*/*",
        accept_language: None,
        accept_encoding: None,
        send_origin: false,
    },
    IdentityProfile {
        name: "browser",
        user_agent: CHROME_UA,
        accept: "*/*",
        accept_language: Some("en-US,en;q=0.9"),
        accept_encoding: None,
        send_origin: false,
    },
    IdentityProfile {
        name: "browser-with-origin",
        user_agent: CHROME_UA,
        accept: "*/*",
        accept_language: Some("en-US,en;q=0.9,es;q=0.8"),
        // identity keeps relayed bytes and Content-Length untouched
        accept_encoding: Some("identity"),
        send_origin: true,
    },
    IdentityProfile {
        name: "alternate-player",
        user_agent: "Lavf/60.16.100",
        accept: "*/*",
        accept_language: None,
        accept_encoding: None,
        send_origin: false,
    },
];

impl IdentityProfile {
    /// Build the outbound header set for `target`.
    ///
    /// The inbound `Range` header is re-included verbatim so seeking
    /// survives identity fallback.
    pub fn headers(&self, target: &Url, range: Option<&HeaderValue>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(self.user_agent));
        headers.insert(ACCEPT, HeaderValue::from_static(self.accept));

        if let Some(lang) = self.accept_language {
            headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static(lang));
        }
        if let Some(encoding) = self.accept_encoding {
            headers.insert(ACCEPT_ENCODING, HeaderValue::from_static(encoding));
        }

        if self.send_origin
            && let Some(origin) = target_origin(target)
        {
            if let Ok(referer) = HeaderValue::from_str(&format!("{origin}/")) {
                headers.insert(REFERER, referer);
            }
            if let Ok(origin) = HeaderValue::from_str(&origin) {
                headers.insert(ORIGIN, origin);
            }
        }

        if let Some(range) = range {
            headers.insert(RANGE, range.clone());
        }

        headers
    }
}

/// `scheme://host[:port]` of the target, or `None` for opaque origins
fn target_origin(target: &Url) -> Option<String> {
    let origin = target.origin();
    origin
        .is_tuple()
        .then(|| origin.ascii_serialization())
}
