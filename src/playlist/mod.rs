//! Manifest rewriting.
//!
//! Both rewriters are line oriented and never parse the full playlist
//! grammar: anything they do not recognise is copied through byte for byte,
//! including `\r\n` line endings and surrounding whitespace.

pub mod hls;
pub mod m3u;

use crate::events::{EventSink, RelayEvent};
use url::Url;

pub use hls::rewrite_hls;
pub use m3u::rewrite_classic;

/// Canonical MIME type for rewritten HLS manifests
pub const HLS_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";

/// Default MIME type for classic channel lists
pub const M3U_CONTENT_TYPE: &str = "audio/x-mpegurl";

/// Name of the query parameter carrying the upstream URL
pub const URL_PARAM: &str = "url";

/// Per-invocation rewrite state
#[derive(Debug, Clone)]
pub struct RewriteContext {
    /// URL relative references are resolved against (post-redirect)
    pub base: Url,
    /// This relay's public endpoint
    pub proxy_endpoint: Url,
}

/// Result of rewriting a single URL reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rewrite {
    Wrapped(String),
    Untouched,
}

/// Counters reported once per manifest
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct RewriteStats {
    pub rewritten: usize,
    pub untouched: usize,
}

impl RewriteStats {
    /// Apply `rewrite` to `original` and record the outcome
    pub fn apply(&mut self, original: &str, rewrite: Rewrite) -> String {
        match rewrite {
            Rewrite::Wrapped(url) => {
                self.rewritten += 1;
                url
            }
            Rewrite::Untouched => {
                self.untouched += 1;
                original.to_string()
            }
        }
    }
}

impl RewriteContext {
    pub fn new(base: Url, proxy_endpoint: Url) -> Self {
        Self {
            base,
            proxy_endpoint,
        }
    }

    /// Resolve `reference` against the base URL and wrap it in the proxy
    /// endpoint.
    ///
    /// References that already target the proxy, that fail to resolve, or
    /// that resolve to a non-HTTP scheme (`skd://`, `data:`) are left
    /// untouched.
    pub fn rewrite_reference(&self, reference: &str, events: &dyn EventSink) -> Rewrite {
        let resolved = match self.base.join(reference) {
            Ok(url) => url,
            Err(e) => {
                events.record(RelayEvent::UrlLeftUnchanged {
                    value: reference.to_string(),
                    reason: e.to_string(),
                });
                return Rewrite::Untouched;
            }
        };

        wrap_url(&self.proxy_endpoint, &resolved, reference, events)
    }
}

/// Wrap an absolute URL in the proxy endpoint.
///
/// URLs already pointing at the endpoint are left alone. Non-HTTP schemes are
/// reported and left alone too. `original` is the text as it appeared in the
/// manifest.
pub(crate) fn wrap_url(
    proxy_endpoint: &Url,
    absolute: &Url,
    original: &str,
    events: &dyn EventSink,
) -> Rewrite {
    if is_proxy_url(proxy_endpoint, absolute) {
        return Rewrite::Untouched;
    }

    if !matches!(absolute.scheme(), "http" | "https") {
        events.record(RelayEvent::UrlLeftUnchanged {
            value: original.to_string(),
            reason: format!("scheme '{}' is not relayed", absolute.scheme()),
        });
        return Rewrite::Untouched;
    }

    Rewrite::Wrapped(proxied_url(proxy_endpoint, absolute.as_str()))
}

/// `proxy_endpoint?url=<form-encoded target>`
pub fn proxied_url(proxy_endpoint: &Url, target: &str) -> String {
    let mut url = proxy_endpoint.clone();
    url.set_query(None);
    url.set_fragment(None);
    url.query_pairs_mut().append_pair(URL_PARAM, target);
    url.into()
}

/// Exact scheme/host/port/path match against the proxy endpoint
pub fn is_proxy_url(proxy_endpoint: &Url, url: &Url) -> bool {
    url.scheme() == proxy_endpoint.scheme()
        && url.host_str() == proxy_endpoint.host_str()
        && url.port_or_known_default() == proxy_endpoint.port_or_known_default()
        && url.path() == proxy_endpoint.path()
}

/// Split a line produced by `split_inclusive('\n')` into content and
/// terminator (`"\r\n"`, `"\n"` or `""`).
pub(crate) fn split_terminator(line: &str) -> (&str, &str) {
    if let Some(content) = line.strip_suffix("\r\n") {
        (content, "\r\n")
    } else if let Some(content) = line.strip_suffix('\n') {
        (content, "\n")
    } else {
        (line, "")
    }
}

/// Split `content` into leading whitespace, token, trailing whitespace
pub(crate) fn split_padding(content: &str) -> (&str, &str, &str) {
    let start = content.len() - content.trim_start().len();
    let end = content.trim_end().len();
    if start >= end {
        return (content, "", "");
    }
    (&content[..start], &content[start..end], &content[end..])
}
