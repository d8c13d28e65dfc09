//! reqwest-backed [`Fetcher`].

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::{Fetcher, NetError, Request, Response};

/// Chunks buffered between the socket and the reader of a streaming body.
const BODY_CHANNEL_CAPACITY: usize = 16;

/// Loader configuration.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// User agent string.
    pub user_agent: String,
    /// Time allowed until response headers arrive. A body may stream for longer.
    pub default_timeout: Duration,
    /// Maximum redirects.
    pub max_redirects: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            user_agent: concat!("swkit/", env!("CARGO_PKG_VERSION")).to_string(),
            default_timeout: Duration::from_secs(30),
            max_redirects: 10,
        }
    }
}

/// Fetches over HTTP(S) with reqwest.
pub struct HttpFetcher {
    client: Client,
    timeout: Duration,
}

impl HttpFetcher {
    /// Create a new fetcher.
    pub fn new(config: LoaderConfig) -> Result<Self, NetError> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .connect_timeout(config.default_timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()
            .map_err(|e| NetError::RequestFailed(e.to_string()))?;

        info!(user_agent = %config.user_agent, "HttpFetcher initialized");

        Ok(Self {
            client,
            timeout: config.default_timeout,
        })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        debug!(url = %request.url, method = %request.method, "Fetching resource");

        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone());

        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = tokio::time::timeout(self.timeout, builder.send())
            .await
            .map_err(|_| {
                warn!(url = %request.url, timeout = ?self.timeout, "Fetch timed out");
                NetError::Timeout(self.timeout)
            })?
            .map_err(|e| {
                warn!(url = %request.url, error = %e, "Fetch failed");
                if e.is_connect() {
                    NetError::Offline(e.to_string())
                } else {
                    NetError::Http(e)
                }
            })?;

        let status = response.status();
        let headers = response.headers().clone();
        let url = response.url().clone();

        trace!(
            url = %url,
            status = %status,
            content_length = ?response.content_length(),
            "Response headers received"
        );

        let (tx, rx) = mpsc::channel(BODY_CHANNEL_CAPACITY);
        let mut stream = Box::pin(response.bytes_stream());
        let body_url = url.clone();
        tokio::spawn(async move {
            let mut received = 0usize;
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(NetError::from);
                let failed = chunk.is_err();
                if let Ok(bytes) = &chunk {
                    received += bytes.len();
                }
                if tx.send(chunk).await.is_err() {
                    debug!(url = %body_url, received, "Body reader went away");
                    return;
                }
                if failed {
                    warn!(url = %body_url, received, "Body stream failed");
                    return;
                }
            }
            trace!(url = %body_url, received, "Body complete");
        });

        let mut response = Response::streaming(status.as_u16(), rx);
        response.url = Some(url);
        response.status_text = status.canonical_reason().unwrap_or_default().to_string();
        response.headers = headers;
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;
    use url::Url;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_loader_config_default() {
        let config = LoaderConfig::default();
        assert!(config.user_agent.starts_with("swkit/"));
        assert_eq!(config.max_redirects, 10);
    }

    #[tokio::test]
    async fn test_fetch_returns_body_and_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/offline.html"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<h1>offline</h1>"))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(LoaderConfig::default()).unwrap();
        let url = Url::parse(&format!("{}/offline.html", server.uri())).unwrap();
        let response = fetcher.fetch(Request::get(url)).await.unwrap();

        assert!(response.ok());
        assert!(response.is_streaming());
        let response = response.buffered().await.unwrap();
        assert_eq!(response.text().unwrap(), "<h1>offline</h1>");
    }

    #[tokio::test]
    async fn test_body_streams_before_response_completes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (release_tx, release_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 1024];
            let _ = socket.read(&mut request).await.unwrap();
            socket
                .write_all(
                    b"HTTP/1.1 200 OK\r\n\
                      content-type: text/event-stream\r\n\
                      transfer-encoding: chunked\r\n\r\n",
                )
                .await
                .unwrap();
            socket.write_all(b"9\r\ndata: 1\n\n\r\n").await.unwrap();
            let _ = release_rx.await;
            socket
                .write_all(b"9\r\ndata: 2\n\n\r\n0\r\n\r\n")
                .await
                .unwrap();
        });

        let fetcher = HttpFetcher::new(LoaderConfig {
            default_timeout: Duration::from_millis(200),
            ..LoaderConfig::default()
        })
        .unwrap();
        let url = Url::parse(&format!("http://{addr}/sse")).unwrap();
        let response = fetcher.fetch(Request::get(url)).await.unwrap();

        assert!(response.is_streaming());
        assert_eq!(response.content_type().as_deref(), Some("text/event-stream"));

        // The second event is held back by the server until the first is read.
        let mut body = response.body.clone();
        assert_eq!(body.next_chunk().await.unwrap().unwrap(), "data: 1\n\n");

        // The stream outlives the header timeout.
        tokio::time::sleep(Duration::from_millis(400)).await;
        release_tx.send(()).unwrap();
        assert_eq!(body.next_chunk().await.unwrap().unwrap(), "data: 2\n\n");
        assert!(body.next_chunk().await.is_none());
    }

    #[tokio::test]
    async fn test_timeout_covers_headers_only() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/slow"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(LoaderConfig {
            default_timeout: Duration::from_millis(50),
            ..LoaderConfig::default()
        })
        .unwrap();
        let url = Url::parse(&format!("{}/slow", server.uri())).unwrap();
        let err = fetcher.fetch(Request::get(url)).await.unwrap_err();

        assert!(matches!(err, NetError::Timeout(_)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_http_errors_are_responses() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(LoaderConfig::default()).unwrap();
        let url = Url::parse(&format!("{}/missing", server.uri())).unwrap();
        let response = fetcher.fetch(Request::get(url)).await.unwrap();

        assert_eq!(response.status, 404);
        assert!(!response.ok());
    }

    #[tokio::test]
    async fn test_connection_refused_is_transient() {
        let fetcher = HttpFetcher::new(LoaderConfig::default()).unwrap();
        let url = Url::parse("http://127.0.0.1:1/").unwrap();
        let err = fetcher.fetch(Request::get(url)).await.unwrap_err();
        assert!(err.is_transient());
    }
}
