//! Pick a handling path from the upstream `Content-Type` and the target URL.
//!
//! Body bytes are never sniffed.

use url::Url;

/// How a relayed response body is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentClass {
    /// HLS manifest (`.m3u8`): rewritten, resolved against the final URL
    Hls,
    /// Classic channel list (`.m3u`): absolute URL lines rewritten
    ClassicPlaylist,
    /// Text, JSON, XML: buffered and relayed unchanged
    Text,
    /// Everything else: streamed through
    Binary,
}

impl ContentClass {
    /// Label used in metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentClass::Hls => "hls",
            ContentClass::ClassicPlaylist => "m3u",
            ContentClass::Text => "text",
            ContentClass::Binary => "binary",
        }
    }
}

/// Classify a response, first match wins:
///
/// 1. target path ends in `.m3u8` → [`ContentClass::Hls`]
/// 2. target path ends in `.m3u` → [`ContentClass::ClassicPlaylist`]
/// 3. content type mentions `mpegurl` → [`ContentClass::Hls`]
/// 4. content type mentions `text`, `json` or `xml` → [`ContentClass::Text`]
/// 5. otherwise → [`ContentClass::Binary`]
pub fn classify(content_type: &str, target_url: &str) -> ContentClass {
    let content_type = content_type.to_ascii_lowercase();
    let path = target_path(target_url);

    if path.ends_with(".m3u8") {
        ContentClass::Hls
    } else if path.ends_with(".m3u") {
        ContentClass::ClassicPlaylist
    } else if content_type.contains("mpegurl") {
        ContentClass::Hls
    } else if ["text", "json", "xml"]
        .iter()
        .any(|needle| content_type.contains(needle))
    {
        ContentClass::Text
    } else {
        ContentClass::Binary
    }
}

/// Lower-cased path of the target, without query or fragment
fn target_path(target_url: &str) -> String {
    match Url::parse(target_url) {
        Ok(url) => url.path().to_ascii_lowercase(),
        Err(_) => target_url
            .split(['?', '#'])
            .next()
            .unwrap_or(target_url)
            .to_ascii_lowercase(),
    }
}
