//! Upstream fetch with identity fallback.
//!
//! [`UpstreamFetcher::fetch`] walks the identity table strictly in order and
//! keeps the first response that is not `403 Forbidden`. Each attempt has a
//! single deadline, fixed when it starts, that covers the response headers
//! and any buffered body read. The request's cancellation token can end it
//! earlier.

use crate::{
    config::Config,
    error::{RelayError, Result},
    events::{EventSink, RelayEvent},
    identity::{IdentityProfile, PROFILES},
    metrics,
};
use bytes::Bytes;
use reqwest::{
    Client, Method, Response, StatusCode,
    header::{CONTENT_TYPE, HeaderValue},
    redirect,
};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use url::Url;

/// A validated inbound relay request
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    /// Absolute upstream URL supplied by the client
    pub target_url: Url,
    /// `GET` or `HEAD`
    pub method: Method,
    /// Inbound `Range` header, forwarded on every attempt
    pub range: Option<HeaderValue>,
    /// This relay's public endpoint, used for rewriting
    pub proxy_endpoint: Url,
}

/// The upstream response selected by identity fallback
#[derive(Debug)]
pub struct UpstreamResponse {
    pub response: Response,
    /// Identity that produced this response
    pub profile: &'static str,
    /// Number of requests issued, including this one
    pub attempts: usize,
    /// End of this attempt's budget; buffered body reads must finish by then
    pub deadline: Instant,
}

impl UpstreamResponse {
    pub fn status(&self) -> StatusCode {
        self.response.status()
    }

    /// URL after following redirects
    pub fn final_url(&self) -> &Url {
        self.response.url()
    }

    /// Header value as a string, if present and valid UTF-8
    pub fn header_str(&self, name: impl reqwest::header::AsHeaderName) -> Option<&str> {
        self.response
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header_str(CONTENT_TYPE)
    }
}

/// Issues outbound requests on behalf of relay clients
#[derive(Debug, Clone)]
pub struct UpstreamFetcher {
    client: Client,
    timeout: Duration,
    profiles: Vec<IdentityProfile>,
}

impl UpstreamFetcher {
    /// Create a fetcher using the default identity table
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self {
            client,
            timeout,
            profiles: PROFILES.to_vec(),
        }
    }

    /// Build the shared HTTP client from configuration
    pub fn build_client(config: &Config) -> reqwest::Result<Client> {
        Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .connect_timeout(config.connect_timeout)
            .redirect(redirect::Policy::limited(config.max_redirects))
            .build()
    }

    /// Replace the identity table. An empty table is ignored.
    pub fn with_profiles(mut self, profiles: Vec<IdentityProfile>) -> Self {
        if !profiles.is_empty() {
            self.profiles = profiles;
        }
        self
    }

    /// Fetch `request.target_url`, falling back through identities on `403`.
    ///
    /// Only `403` triggers the next identity; any other status is returned
    /// from the attempt that produced it. When every identity is rejected,
    /// the last `403` response is returned as-is.
    ///
    /// # Errors
    ///
    /// Network failures, timeouts, and cancellation end the walk immediately
    /// and are returned as [`RelayError`].
    pub async fn fetch(
        &self,
        request: &ProxyRequest,
        cancel: &CancellationToken,
        events: &dyn EventSink,
    ) -> Result<UpstreamResponse> {
        let (last, earlier) = match self.profiles.split_last() {
            Some(split) => split,
            None => (&PROFILES[PROFILES.len() - 1], &[][..]),
        };

        for (idx, profile) in earlier.iter().enumerate() {
            let attempt = idx + 1;
            let (response, deadline) = self
                .attempt(request, profile, attempt, cancel, events)
                .await?;

            if response.status() == StatusCode::FORBIDDEN {
                events.record(RelayEvent::IdentityRejected {
                    profile: profile.name,
                    attempt,
                });
                metrics::record_identity_fallback(profile.name);
                // Dropping the response releases the connection before the next attempt
                drop(response);
                continue;
            }

            return Ok(self.selected(response, profile, attempt, deadline, events));
        }

        // Final identity: whatever it returns is relayed, 403 included
        let attempt = earlier.len() + 1;
        let (response, deadline) = self
            .attempt(request, last, attempt, cancel, events)
            .await?;
        Ok(self.selected(response, last, attempt, deadline, events))
    }

    /// Read a textual body before the attempt's deadline.
    ///
    /// # Errors
    ///
    /// [`RelayError::UpstreamTimeout`], [`RelayError::Cancelled`], or
    /// [`RelayError::UpstreamBody`] when the body cannot be read.
    pub async fn read_text(
        &self,
        upstream: UpstreamResponse,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let deadline = upstream.deadline;
        self.read_body(upstream.response.text(), deadline, cancel).await
    }

    /// Read a body as raw bytes, for passthrough without re-encoding.
    ///
    /// # Errors
    ///
    /// Same as [`UpstreamFetcher::read_text`].
    pub async fn read_bytes(
        &self,
        upstream: UpstreamResponse,
        cancel: &CancellationToken,
    ) -> Result<Bytes> {
        let deadline = upstream.deadline;
        self.read_body(upstream.response.bytes(), deadline, cancel).await
    }

    async fn read_body<T>(
        &self,
        body: impl Future<Output = reqwest::Result<T>>,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<T> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RelayError::Cancelled),
            result = tokio::time::timeout_at(deadline, body) => match result {
                Err(_) => Err(RelayError::UpstreamTimeout(self.timeout)),
                Ok(Err(e)) if e.is_timeout() => Err(RelayError::UpstreamTimeout(self.timeout)),
                Ok(Err(e)) => Err(RelayError::UpstreamBody(e)),
                Ok(Ok(body)) => Ok(body),
            },
        }
    }

    async fn attempt(
        &self,
        request: &ProxyRequest,
        profile: &IdentityProfile,
        attempt: usize,
        cancel: &CancellationToken,
        events: &dyn EventSink,
    ) -> Result<(Response, Instant)> {
        events.record(RelayEvent::AttemptStarted {
            profile: profile.name,
            attempt,
        });

        let deadline = Instant::now() + self.timeout;
        let response = self
            .send_once(request, profile, deadline, cancel)
            .await
            .map_err(|e| {
                events.record(RelayEvent::UpstreamFailed {
                    profile: profile.name,
                    attempt,
                    reason: e.to_string(),
                });
                metrics::record_upstream_error(e.kind());
                e
            })?;

        Ok((response, deadline))
    }

    async fn send_once(
        &self,
        request: &ProxyRequest,
        profile: &IdentityProfile,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<Response> {
        let headers = profile.headers(&request.target_url, request.range.as_ref());
        let send = self
            .client
            .request(request.method.clone(), request.target_url.clone())
            .headers(headers)
            .send();

        // Losing either race drops the in-flight request, closing its connection
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RelayError::Cancelled),
            result = tokio::time::timeout_at(deadline, send) => match result {
                Err(_) => Err(RelayError::UpstreamTimeout(self.timeout)),
                Ok(Err(e)) if e.is_timeout() => Err(RelayError::UpstreamTimeout(self.timeout)),
                Ok(Err(e)) => Err(RelayError::UpstreamUnreachable(e)),
                Ok(Ok(response)) => Ok(response),
            },
        }
    }

    fn selected(
        &self,
        response: Response,
        profile: &IdentityProfile,
        attempt: usize,
        deadline: Instant,
        events: &dyn EventSink,
    ) -> UpstreamResponse {
        events.record(RelayEvent::UpstreamResponded {
            profile: profile.name,
            attempt,
            status: response.status().as_u16(),
            final_url: response.url().to_string(),
        });

        UpstreamResponse {
            response,
            profile: profile.name,
            attempts: attempt,
            deadline,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingSink;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fetcher(timeout: Duration) -> UpstreamFetcher {
        UpstreamFetcher::new(Client::new(), timeout)
    }

    fn request(server: &MockServer, route: &str, range: Option<&'static str>) -> ProxyRequest {
        ProxyRequest {
            target_url: Url::parse(&format!("{}{}", server.uri(), route)).unwrap(),
            method: Method::GET,
            range: range.map(HeaderValue::from_static),
            proxy_endpoint: Url::parse("http://relay.local/proxy").unwrap(),
        }
    }

    /// Mount a response for requests carrying `profile`'s User-Agent.
    ///
    /// Profiles 2 and 3 share a User-Agent, so `Referer` tells them apart and
    /// the Referer-matching mock gets the higher priority.
    async fn mount_for(server: &MockServer, profile: usize, status: u16) {
        let mut builder = Mock::given(method("GET"))
            .and(header("user-agent", PROFILES[profile].user_agent));
        let mut priority = 5;
        if PROFILES[profile].send_origin {
            builder = builder.and(header("referer", format!("{}/", server.uri()).as_str()));
            priority = 1;
        }
        builder
            .respond_with(ResponseTemplate::new(status).set_body_string(PROFILES[profile].name))
            .with_priority(priority)
            .mount(server)
            .await;
    }

    fn user_agents(requests: &[wiremock::Request]) -> Vec<String> {
        requests
            .iter()
            .map(|r| {
                r.headers
                    .get("user-agent")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string()
            })
            .collect()
    }

    #[tokio::test]
    async fn first_non_403_wins() {
        let server = MockServer::start().await;
        mount_for(&server, 0, 200).await;

        let sink = RecordingSink::new();
        let result = fetcher(Duration::from_secs(5))
            .fetch(&request(&server, "/a.ts", None), &CancellationToken::new(), &sink)
            .await
            .unwrap();

        assert_eq!(result.status(), StatusCode::OK);
        assert_eq!(result.profile, "media-player");
        assert_eq!(result.attempts, 1);
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn falls_back_in_order_until_third_profile() {
        let server = MockServer::start().await;
        mount_for(&server, 0, 403).await;
        mount_for(&server, 1, 403).await;
        mount_for(&server, 2, 200).await;

        let sink = RecordingSink::new();
        let result = fetcher(Duration::from_secs(5))
            .fetch(&request(&server, "/live.ts", None), &CancellationToken::new(), &sink)
            .await
            .unwrap();

        assert_eq!(result.status(), StatusCode::OK);
        assert_eq!(result.profile, "browser-with-origin");
        assert_eq!(result.attempts, 3);

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 3);
        assert_eq!(
            user_agents(&requests),
            vec![
                PROFILES[0].user_agent,
                PROFILES[1].user_agent,
                PROFILES[2].user_agent
            ]
        );
        assert!(requests[1].headers.get("referer").is_none());
        assert!(requests[2].headers.get("referer").is_some());

        let rejected: Vec<_> = sink
            .events()
            .into_iter()
            .filter_map(|e| match e {
                RelayEvent::IdentityRejected { profile, .. } => Some(profile),
                _ => None,
            })
            .collect();
        assert_eq!(rejected, vec!["media-player", "browser"]);
    }

    #[tokio::test]
    async fn all_forbidden_returns_last_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403).set_body_string("denied"))
            .mount(&server)
            .await;

        let sink = RecordingSink::new();
        let result = fetcher(Duration::from_secs(5))
            .fetch(&request(&server, "/x", None), &CancellationToken::new(), &sink)
            .await
            .expect("exhausted identities are not an error");

        assert_eq!(result.status(), StatusCode::FORBIDDEN);
        assert_eq!(result.profile, PROFILES[PROFILES.len() - 1].name);
        assert_eq!(result.attempts, PROFILES.len());

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), PROFILES.len());
        assert_eq!(
            requests.last().unwrap().headers.get("user-agent").unwrap(),
            PROFILES[PROFILES.len() - 1].user_agent
        );
    }

    #[tokio::test]
    async fn other_errors_do_not_trigger_fallback() {
        for status in [404u16, 500, 401] {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .respond_with(ResponseTemplate::new(status))
                .mount(&server)
                .await;

            let sink = RecordingSink::new();
            let result = fetcher(Duration::from_secs(5))
                .fetch(&request(&server, "/x", None), &CancellationToken::new(), &sink)
                .await
                .unwrap();

            assert_eq!(result.status().as_u16(), status);
            assert_eq!(server.received_requests().await.unwrap().len(), 1);
        }
    }

    #[tokio::test]
    async fn range_is_sent_on_every_attempt() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let sink = RecordingSink::new();
        let _ = fetcher(Duration::from_secs(5))
            .fetch(
                &request(&server, "/movie.mp4", Some("bytes=1000-1999")),
                &CancellationToken::new(),
                &sink,
            )
            .await
            .unwrap();

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), PROFILES.len());
        for req in &requests {
            assert_eq!(req.headers.get("range").unwrap(), "bytes=1000-1999");
        }
    }

    #[tokio::test]
    async fn partial_content_is_returned_unchanged() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("range", "bytes=0-3"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("content-range", "bytes 0-3/10")
                    .set_body_bytes(vec![1u8, 2, 3, 4]),
            )
            .mount(&server)
            .await;

        let sink = RecordingSink::new();
        let result = fetcher(Duration::from_secs(5))
            .fetch(
                &request(&server, "/v.mp4", Some("bytes=0-3")),
                &CancellationToken::new(),
                &sink,
            )
            .await
            .unwrap();

        assert_eq!(result.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(result.header_str("content-range"), Some("bytes 0-3/10"));
    }

    #[tokio::test]
    async fn final_url_follows_redirects() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/old/index.m3u8"))
            .respond_with(
                ResponseTemplate::new(302)
                    .insert_header("location", format!("{}/new/index.m3u8", server.uri()).as_str()),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/new/index.m3u8"))
            .respond_with(ResponseTemplate::new(200).set_body_string("#EXTM3U\n"))
            .mount(&server)
            .await;

        let sink = RecordingSink::new();
        let result = fetcher(Duration::from_secs(5))
            .fetch(
                &request(&server, "/old/index.m3u8", None),
                &CancellationToken::new(),
                &sink,
            )
            .await
            .unwrap();

        assert_eq!(result.final_url().path(), "/new/index.m3u8");
    }

    #[tokio::test]
    async fn slow_upstream_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let sink = RecordingSink::new();
        let err = fetcher(Duration::from_millis(100))
            .fetch(&request(&server, "/slow", None), &CancellationToken::new(), &sink)
            .await
            .unwrap_err();

        assert!(matches!(err, RelayError::UpstreamTimeout(_)));
        // A timeout is not a 403: no further identities are tried
        assert!(
            sink.events()
                .iter()
                .all(|e| !matches!(e, RelayEvent::IdentityRejected { .. }))
        );
        assert_eq!(
            sink.events()
                .iter()
                .filter(|e| matches!(e, RelayEvent::AttemptStarted { .. }))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn unreachable_upstream_is_distinct_from_timeout() {
        // Bind then drop a listener so the port refuses connections
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let req = ProxyRequest {
            target_url: Url::parse(&format!("http://{}/x.ts", addr)).unwrap(),
            method: Method::GET,
            range: None,
            proxy_endpoint: Url::parse("http://relay.local/proxy").unwrap(),
        };

        let sink = RecordingSink::new();
        let err = fetcher(Duration::from_secs(5))
            .fetch(&req, &CancellationToken::new(), &sink)
            .await
            .unwrap_err();

        assert!(matches!(err, RelayError::UpstreamUnreachable(_)));
        assert_eq!(sink.events().len(), 2, "one attempt, one failure");
    }

    #[tokio::test]
    async fn cancellation_aborts_pending_fetch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let sink = RecordingSink::new();
        let err = fetcher(Duration::from_secs(10))
            .fetch(&request(&server, "/slow", None), &cancel, &sink)
            .await
            .unwrap_err();

        assert!(matches!(err, RelayError::Cancelled));
    }

    #[tokio::test]
    async fn custom_profiles_replace_default_table() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let sink = RecordingSink::new();
        let result = fetcher(Duration::from_secs(5))
            .with_profiles(vec![PROFILES[3]])
            .fetch(&request(&server, "/x", None), &CancellationToken::new(), &sink)
            .await
            .unwrap();

        assert_eq!(result.attempts, 1);
        assert_eq!(result.profile, "alternate-player");
    }

    #[tokio::test]
    async fn read_text_returns_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("#EXTM3U\n"))
            .mount(&server)
            .await;

        let f = fetcher(Duration::from_secs(5));
        let sink = RecordingSink::new();
        let cancel = CancellationToken::new();
        let upstream = f
            .fetch(&request(&server, "/i.m3u8", None), &cancel, &sink)
            .await
            .unwrap();

        assert_eq!(f.read_text(upstream, &cancel).await.unwrap(), "#EXTM3U\n");
    }

    #[tokio::test]
    async fn body_read_is_bounded_by_attempt_deadline() {
        use axum::{Router, body::Body, routing::get};
        use futures_util::stream;
        use std::convert::Infallible;

        // Headers after 300ms, last chunk after 600ms
        let app = Router::new().route(
            "/i.m3u8",
            get(|| async {
                tokio::time::sleep(Duration::from_millis(300)).await;
                let body = stream::unfold(0u8, |step| async move {
                    match step {
                        0 => Some((Ok::<_, Infallible>(Bytes::from_static(b"#EXTM3U\n")), 1)),
                        1 => {
                            tokio::time::sleep(Duration::from_millis(300)).await;
                            Some((Ok(Bytes::from_static(b"a.ts\n")), 2))
                        }
                        _ => None,
                    }
                });
                Body::from_stream(body)
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let req = ProxyRequest {
            target_url: Url::parse(&format!("http://{}/i.m3u8", addr)).unwrap(),
            method: Method::GET,
            range: None,
            proxy_endpoint: Url::parse("http://relay.local/proxy").unwrap(),
        };

        let f = fetcher(Duration::from_millis(400));
        let sink = RecordingSink::new();
        let cancel = CancellationToken::new();
        let started = Instant::now();
        let upstream = f.fetch(&req, &cancel, &sink).await.unwrap();

        let err = f.read_text(upstream, &cancel).await.unwrap_err();
        assert!(matches!(err, RelayError::UpstreamTimeout(_)));
        // The body read did not get a fresh 400ms of its own
        assert!(started.elapsed() < Duration::from_millis(550));
    }
}
