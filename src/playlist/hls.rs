//! HLS (`.m3u8`) rewriting.
//!
//! Two kinds of references are routed back through the relay:
//! - locator lines (segments, variant playlists): any non-empty line that
//!   does not start with `#`
//! - quoted `URI="..."` attributes inside `#EXT-X-` tags (`EXT-X-MEDIA`,
//!   `EXT-X-MAP`, `EXT-X-KEY`, `EXT-X-I-FRAME-STREAM-INF`, LL-HLS parts...)

use super::{RewriteContext, RewriteStats, split_padding, split_terminator};
use crate::classify::ContentClass;
use crate::events::{EventSink, RelayEvent};

const URI_MARKER: &str = "URI=\"";

/// Rewrite every reference in an HLS manifest.
///
/// Already-proxied references are left alone, so running this on its own
/// output is a no-op.
pub fn rewrite_hls(text: &str, ctx: &RewriteContext, events: &dyn EventSink) -> String {
    let mut stats = RewriteStats::default();
    let mut result = String::with_capacity(text.len() + text.len() / 2);

    for line in text.split_inclusive('\n') {
        let (content, terminator) = split_terminator(line);
        let (leading, token, trailing) = split_padding(content);

        if token.is_empty() {
            result.push_str(line);
            continue;
        }

        if token.starts_with("#EXT-X-") {
            result.push_str(leading);
            result.push_str(&rewrite_uri_attributes(token, ctx, events, &mut stats));
            result.push_str(trailing);
        } else if token.starts_with('#') {
            result.push_str(content);
        } else {
            let rewrite = ctx.rewrite_reference(token, events);
            result.push_str(leading);
            result.push_str(&stats.apply(token, rewrite));
            result.push_str(trailing);
        }
        result.push_str(terminator);
    }

    events.record(RelayEvent::ManifestRewritten {
        class: ContentClass::Hls,
        rewritten: stats.rewritten,
        untouched: stats.untouched,
    });

    result
}

/// Rewrite each `URI="..."` attribute of a tag line.
///
/// Only attributes that start at an attribute boundary (after `:` or `,`)
/// are touched, so names such as `X-URI="..."` pass through.
fn rewrite_uri_attributes(
    tag: &str,
    ctx: &RewriteContext,
    events: &dyn EventSink,
    stats: &mut RewriteStats,
) -> String {
    let mut result = String::with_capacity(tag.len() + 128);
    let mut rest = tag;

    while let Some(marker_pos) = rest.find(URI_MARKER) {
        let value_start = marker_pos + URI_MARKER.len();
        let Some(closing_quote) = rest[value_start..].find('"') else {
            // Unterminated value: copy the remainder verbatim
            break;
        };
        let value_end = value_start + closing_quote;
        let value = &rest[value_start..value_end];

        let at_boundary =
            marker_pos > 0 && matches!(rest.as_bytes()[marker_pos - 1], b':' | b',');

        result.push_str(&rest[..value_start]);
        if at_boundary && !value.is_empty() {
            let rewrite = ctx.rewrite_reference(value, events);
            result.push_str(&stats.apply(value, rewrite));
        } else {
            result.push_str(value);
        }
        result.push('"');

        rest = &rest[value_end + 1..];
    }

    result.push_str(rest);
    result
}
