//! Turn the selected upstream response into the client response.
//!
//! Manifests and text are buffered (they are small and must be rewritten or
//! re-labelled). Everything else is piped through [`RelayStream`] without
//! buffering, so memory stays bounded by hyper's write buffer and backpressure
//! from the client reaches the upstream socket.

use crate::{
    classify::{ContentClass, classify},
    error::Result,
    events::{EventSink, RelayEvent},
    metrics,
    playlist::{self, HLS_CONTENT_TYPE, M3U_CONTENT_TYPE, RewriteContext},
    upstream::{ProxyRequest, UpstreamFetcher, UpstreamResponse},
};
use axum::{
    body::{Body, Bytes},
    http::{
        HeaderMap, HeaderName, HeaderValue, Method, StatusCode,
        header::{ACCEPT_RANGES, CACHE_CONTROL, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
};
use futures_util::{Stream, StreamExt, stream::BoxStream};
use std::{
    io,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};
use tokio_util::sync::{CancellationToken, DropGuard};

const OCTET_STREAM: &str = "application/octet-stream";
const TEXT_PLAIN: &str = "text/plain; charset=utf-8";

/// Build the client response for `upstream`.
///
/// `guard` cancels the request's token when dropped. For binary bodies it is
/// moved into the body stream, so a client disconnect cancels the token and
/// drops the upstream connection.
///
/// # Errors
///
/// Only body reads on the buffered paths can fail here.
pub async fn relay(
    upstream: UpstreamResponse,
    request: &ProxyRequest,
    fetcher: &UpstreamFetcher,
    cancel: &CancellationToken,
    guard: DropGuard,
    events: Arc<dyn EventSink>,
) -> Result<(ContentClass, Response)> {
    let class = classify(
        upstream.content_type().unwrap_or_default(),
        request.target_url.as_str(),
    );
    events.record(RelayEvent::Classified { class });

    if request.method == Method::HEAD {
        return Ok((class, head_response(&upstream, class)));
    }

    // Error pages are relayed as-is, never rewritten as manifests
    let rewrite = upstream.status().is_success();

    let response = match class {
        ContentClass::Hls if rewrite => {
            let final_url = upstream.final_url().clone();
            let status = upstream.status();
            let text = fetcher.read_text(upstream, cancel).await?;
            let ctx = RewriteContext::new(final_url, request.proxy_endpoint.clone());
            let body = playlist::rewrite_hls(&text, &ctx, events.as_ref());
            manifest_response(status, HLS_CONTENT_TYPE, body)
        }
        ContentClass::ClassicPlaylist if rewrite => {
            let status = upstream.status();
            let content_type = upstream
                .content_type()
                .unwrap_or(M3U_CONTENT_TYPE)
                .to_string();
            let text = fetcher.read_text(upstream, cancel).await?;
            let body = playlist::rewrite_classic(&text, &request.proxy_endpoint, events.as_ref());
            (
                status,
                [(CONTENT_TYPE, header_or(&content_type, M3U_CONTENT_TYPE))],
                body,
            )
                .into_response()
        }
        ContentClass::Binary => stream_response(upstream, guard, events),
        _ => text_response(upstream, fetcher, cancel).await?,
    };

    Ok((class, response))
}

/// Rewritten HLS: canonical MIME type, never cached
fn manifest_response(status: StatusCode, content_type: &'static str, body: String) -> Response {
    (
        status,
        [
            (CONTENT_TYPE, HeaderValue::from_static(content_type)),
            (CACHE_CONTROL, HeaderValue::from_static("no-cache")),
        ],
        body,
    )
        .into_response()
}

/// Buffered passthrough; bytes are emitted exactly as received
async fn text_response(
    upstream: UpstreamResponse,
    fetcher: &UpstreamFetcher,
    cancel: &CancellationToken,
) -> Result<Response> {
    let status = upstream.status();
    let content_type = header_or(upstream.content_type().unwrap_or_default(), TEXT_PLAIN);
    let body = fetcher.read_bytes(upstream, cancel).await?;

    Ok((status, [(CONTENT_TYPE, content_type)], body).into_response())
}

/// Unbuffered passthrough preserving status and range headers
fn stream_response(
    upstream: UpstreamResponse,
    guard: DropGuard,
    events: Arc<dyn EventSink>,
) -> Response {
    let status = upstream.status();
    let headers = passthrough_headers(&upstream);
    let stream = RelayStream::new(upstream.response.bytes_stream().boxed(), guard, events);

    (status, headers, Body::from_stream(stream)).into_response()
}

/// Status and entity headers only, for `HEAD`
fn head_response(upstream: &UpstreamResponse, class: ContentClass) -> Response {
    let mut headers = passthrough_headers(upstream);
    if class == ContentClass::Hls && upstream.status().is_success() {
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(HLS_CONTENT_TYPE));
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        // The rewritten manifest length differs from the upstream one
        headers.remove(CONTENT_LENGTH);
    }

    (upstream.status(), headers, empty_unsized_body()).into_response()
}

/// Empty body whose size hint is unknown.
///
/// `Body::empty()` reports an exact size of zero, which makes hyper emit
/// `Content-Length: 0` on a `HEAD` response whenever no length was forwarded.
fn empty_unsized_body() -> Body {
    Body::from_stream(futures_util::stream::empty::<io::Result<Bytes>>())
}

/// `Content-Type` (defaulted), plus `Content-Length`, `Content-Range` and
/// `Accept-Ranges` copied verbatim when present
fn passthrough_headers(upstream: &UpstreamResponse) -> HeaderMap {
    let source = upstream.response.headers();
    let mut headers = HeaderMap::new();

    headers.insert(
        CONTENT_TYPE,
        source
            .get(CONTENT_TYPE)
            .cloned()
            .unwrap_or_else(|| HeaderValue::from_static(OCTET_STREAM)),
    );

    let forwarded: [HeaderName; 3] = [CONTENT_LENGTH, CONTENT_RANGE, ACCEPT_RANGES];
    for name in forwarded {
        if let Some(value) = source.get(&name) {
            headers.insert(name, value.clone());
        }
    }

    headers
}

/// Parse `value` as a header, falling back to the static `default`
fn header_or(value: &str, default: &'static str) -> HeaderValue {
    if value.is_empty() {
        return HeaderValue::from_static(default);
    }
    HeaderValue::from_str(value).unwrap_or_else(|_| HeaderValue::from_static(default))
}

/// Upstream body stream relayed to the client.
///
/// Reports completion, mid-stream upstream failure, or client disconnect
/// exactly once, and cancels the request token when dropped.
pub struct RelayStream {
    inner: BoxStream<'static, reqwest::Result<Bytes>>,
    events: Arc<dyn EventSink>,
    bytes: u64,
    finished: bool,
    _guard: DropGuard,
}

impl RelayStream {
    pub fn new(
        inner: BoxStream<'static, reqwest::Result<Bytes>>,
        guard: DropGuard,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            inner,
            events,
            bytes: 0,
            finished: false,
            _guard: guard,
        }
    }
}

impl Stream for RelayStream {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }

        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.bytes += chunk.len() as u64;
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                // Bytes already sent cannot be retried; the response ends here
                this.finished = true;
                metrics::record_streamed_bytes(this.bytes);
                this.events.record(RelayEvent::StreamAborted {
                    bytes: this.bytes,
                    reason: e.to_string(),
                });
                Poll::Ready(Some(Err(io::Error::other(e))))
            }
            Poll::Ready(None) => {
                this.finished = true;
                metrics::record_streamed_bytes(this.bytes);
                this.events
                    .record(RelayEvent::StreamCompleted { bytes: this.bytes });
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for RelayStream {
    fn drop(&mut self) {
        if !self.finished {
            metrics::record_streamed_bytes(self.bytes);
            self.events
                .record(RelayEvent::ClientDisconnected { bytes: self.bytes });
        }
    }
}
