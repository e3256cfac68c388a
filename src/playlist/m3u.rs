//! Classic channel-list (`.m3u`) rewriting.
//!
//! Only lines that are themselves absolute `http(s)://` URLs are routed
//! through the relay. `#EXTINF` metadata, attribute lines, and anything
//! relative are left exactly as they were.

use super::{Rewrite, RewriteStats, split_padding, split_terminator, wrap_url};
use crate::classify::ContentClass;
use crate::events::{EventSink, RelayEvent};
use url::Url;

/// Rewrite standalone absolute URL lines of a classic playlist.
pub fn rewrite_classic(text: &str, proxy_endpoint: &Url, events: &dyn EventSink) -> String {
    let mut stats = RewriteStats::default();
    let mut result = String::with_capacity(text.len() + text.len() / 2);

    for line in text.split_inclusive('\n') {
        let (content, terminator) = split_terminator(line);
        let (leading, token, trailing) = split_padding(content);

        if !is_absolute_http(token) {
            result.push_str(line);
            continue;
        }

        let rewrite = match Url::parse(token) {
            Ok(url) => wrap_url(proxy_endpoint, &url, token, events),
            Err(e) => {
                events.record(RelayEvent::UrlLeftUnchanged {
                    value: token.to_string(),
                    reason: e.to_string(),
                });
                Rewrite::Untouched
            }
        };

        result.push_str(leading);
        result.push_str(&stats.apply(token, rewrite));
        result.push_str(trailing);
        result.push_str(terminator);
    }

    events.record(RelayEvent::ManifestRewritten {
        class: ContentClass::ClassicPlaylist,
        rewritten: stats.rewritten,
        untouched: stats.untouched,
    });

    result
}

/// Whole token is an absolute HTTP(S) URL with no embedded whitespace
fn is_absolute_http(token: &str) -> bool {
    let lower = token.get(..8).unwrap_or(token).to_ascii_lowercase();
    (lower.starts_with("http://") || lower.starts_with("https://"))
        && !token.contains(char::is_whitespace)
}
