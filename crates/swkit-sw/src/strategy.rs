//! Caching strategies.
//!
//! The set is closed: [`Strategy`] is an enum, and each variant can be
//! exercised on its own against a [`WorkerContext`].

use std::sync::Arc;
use std::time::Duration;

use http::Method;
use swkit_common::with_timeout;
use swkit_net::{Request, Response, ResponseType};
use tracing::{debug, trace, warn};

use crate::context::WorkerContext;
use crate::error::{SwError, SwResult};
use crate::precache::PrecacheController;

/// Default bound on a network-first fetch before falling back to cache.
pub const DEFAULT_NETWORK_TIMEOUT: Duration = Duration::from_secs(10);

const EVENT_STREAM: &str = "text/event-stream";

/// Always go to the network; never read or write a cache.
#[derive(Debug, Clone, Default)]
pub struct NetworkOnly;

impl NetworkOnly {
    pub async fn handle(&self, ctx: &WorkerContext, request: Request) -> SwResult<Response> {
        trace!(url = %request.url, "NetworkOnly fetch");
        Ok(ctx.fetcher().fetch(request).await?)
    }
}

/// Prefer the network; fall back to the last cached copy on failure.
#[derive(Debug, Clone)]
pub struct NetworkFirst {
    pub cache_name: String,
    pub network_timeout: Duration,
}

impl NetworkFirst {
    pub fn new(cache_name: impl Into<String>) -> Self {
        Self {
            cache_name: cache_name.into(),
            network_timeout: DEFAULT_NETWORK_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.network_timeout = timeout;
        self
    }

    /// Status 200 and opaque responses are stored. Event streams never are.
    pub fn is_cacheable(response: &Response) -> bool {
        if response.content_type().as_deref() == Some(EVENT_STREAM) {
            return false;
        }
        response.status == 200 || response.kind == ResponseType::Opaque
    }

    pub async fn handle(&self, ctx: &WorkerContext, request: Request) -> SwResult<Response> {
        let cacheable_method = request.method == Method::GET;
        let fetcher = ctx.fetcher().clone();
        let outgoing = request.clone();

        let failure = match with_timeout(self.network_timeout, || fetcher.fetch(outgoing)).await {
            Ok(Ok(response)) => {
                if !(cacheable_method && Self::is_cacheable(&response)) {
                    trace!(
                        url = %request.url,
                        status = response.status,
                        "Response not cacheable"
                    );
                    return Ok(response);
                }
                // The stored copy and the returned one share the buffered body.
                match response.buffered().await {
                    Ok(response) => {
                        if let Err(e) = ctx
                            .caches()
                            .put(&self.cache_name, &request, response.clone())
                            .await
                        {
                            warn!(url = %request.url, error = %e, "Failed to cache response");
                        }
                        return Ok(response);
                    }
                    Err(e) => e.to_string(),
                }
            }
            Ok(Err(e)) => e.to_string(),
            Err(e) => e.to_string(),
        };

        debug!(url = %request.url, reason = %failure, "Network failed, trying cache");

        if cacheable_method {
            if let Some(cached) = ctx.caches().match_url(&self.cache_name, &request.url).await? {
                debug!(url = %request.url, cache = %self.cache_name, "Serving cached copy");
                return Ok(cached);
            }
        }

        Err(SwError::NoResponse {
            url: request.url.to_string(),
            reason: failure,
        })
    }
}

/// Serve from the precache, going to the network (without storing) on a miss.
#[derive(Debug, Clone)]
pub struct PrecacheLookup {
    controller: Arc<PrecacheController>,
}

impl PrecacheLookup {
    pub fn new(controller: Arc<PrecacheController>) -> Self {
        Self { controller }
    }

    pub fn controller(&self) -> &Arc<PrecacheController> {
        &self.controller
    }

    pub async fn handle(&self, ctx: &WorkerContext, request: Request) -> SwResult<Response> {
        if let Some(response) = self.controller.match_request(ctx, &request).await? {
            trace!(url = %request.url, "Precache hit");
            return Ok(response);
        }

        debug!(url = %request.url, "Precache miss, using network");
        Ok(ctx.fetcher().fetch(request).await?)
    }
}

/// A caching strategy.
#[derive(Debug, Clone)]
pub enum Strategy {
    NetworkOnly(NetworkOnly),
    NetworkFirst(NetworkFirst),
    Precache(PrecacheLookup),
}

impl Strategy {
    pub fn network_only() -> Self {
        Strategy::NetworkOnly(NetworkOnly)
    }

    pub fn network_first(cache_name: impl Into<String>, timeout: Duration) -> Self {
        Strategy::NetworkFirst(NetworkFirst::new(cache_name).with_timeout(timeout))
    }

    pub fn precache(controller: Arc<PrecacheController>) -> Self {
        Strategy::Precache(PrecacheLookup::new(controller))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Strategy::NetworkOnly(_) => "network-only",
            Strategy::NetworkFirst(_) => "network-first",
            Strategy::Precache(_) => "precache",
        }
    }

    /// Produce a response for `request`.
    pub async fn handle(&self, ctx: &WorkerContext, request: Request) -> SwResult<Response> {
        match self {
            Strategy::NetworkOnly(s) => s.handle(ctx, request).await,
            Strategy::NetworkFirst(s) => s.handle(ctx, request).await,
            Strategy::Precache(s) => s.handle(ctx, request).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockFetcher;
    use bytes::Bytes;
    use http::{HeaderName, HeaderValue};
    use tokio::sync::mpsc;
    use url::Url;

    const RUNTIME: &str = "runtime";

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn context(fetcher: Arc<MockFetcher>) -> Arc<WorkerContext> {
        WorkerContext::builder().fetcher(fetcher).build().unwrap()
    }

    #[tokio::test]
    async fn test_network_first_caches_success() {
        let fetcher = Arc::new(MockFetcher::new());
        fetcher.respond("https://app.test/a.js", Response::new(200, "v1"));
        let ctx = context(fetcher.clone());
        let strategy = NetworkFirst::new(RUNTIME);

        let response = strategy
            .handle(&ctx, Request::get(url("https://app.test/a.js")))
            .await
            .unwrap();
        assert_eq!(response.body, Bytes::from("v1"));

        let cached = ctx
            .caches()
            .match_url(RUNTIME, &url("https://app.test/a.js"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cached.body, Bytes::from("v1"));
    }

    #[tokio::test]
    async fn test_network_first_serves_cache_when_offline() {
        let fetcher = Arc::new(MockFetcher::new());
        fetcher.respond("https://app.test/", Response::new(200, "home"));
        let ctx = context(fetcher.clone());
        let strategy = NetworkFirst::new(RUNTIME);

        strategy
            .handle(&ctx, Request::navigate(url("https://app.test/")))
            .await
            .unwrap();

        fetcher.set_offline(true);
        let response = strategy
            .handle(&ctx, Request::navigate(url("https://app.test/")))
            .await
            .unwrap();
        assert_eq!(response.body, Bytes::from("home"));
    }

    #[tokio::test]
    async fn test_network_first_fails_without_cached_copy() {
        let fetcher = Arc::new(MockFetcher::offline());
        let ctx = context(fetcher);

        let result = NetworkFirst::new(RUNTIME)
            .handle(&ctx, Request::get(url("https://app.test/missing.js")))
            .await;
        assert!(matches!(result, Err(SwError::NoResponse { .. })));
    }

    #[tokio::test]
    async fn test_network_first_does_not_cache_errors() {
        let fetcher = Arc::new(MockFetcher::new());
        fetcher.respond("https://app.test/gone", Response::new(404, "nope"));
        let ctx = context(fetcher);

        let response = NetworkFirst::new(RUNTIME)
            .handle(&ctx, Request::get(url("https://app.test/gone")))
            .await
            .unwrap();

        assert_eq!(response.status, 404);
        assert!(ctx.caches().keys(RUNTIME).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_network_first_caches_opaque() {
        let fetcher = Arc::new(MockFetcher::new());
        let cdn = url("https://cdn.test/lib.js");
        fetcher.respond(cdn.as_str(), Response::opaque(cdn.clone()));
        let ctx = context(fetcher);

        NetworkFirst::new(RUNTIME)
            .handle(&ctx, Request::get(cdn.clone()))
            .await
            .unwrap();
        assert_eq!(ctx.caches().keys(RUNTIME).await.unwrap(), vec![cdn]);
    }

    #[tokio::test]
    async fn test_network_first_skips_cache_for_post() {
        let fetcher = Arc::new(MockFetcher::new());
        fetcher.respond("https://app.test/api", Response::new(200, "created"));
        let ctx = context(fetcher.clone());
        let strategy = NetworkFirst::new(RUNTIME);
        let post = Request::with_method(url("https://app.test/api"), Method::POST, None);

        strategy.handle(&ctx, post.clone()).await.unwrap();
        assert!(ctx.caches().keys(RUNTIME).await.unwrap().is_empty());

        fetcher.set_offline(true);
        assert!(strategy.handle(&ctx, post).await.is_err());
    }

    #[tokio::test]
    async fn test_network_first_times_out_to_cache() {
        let fetcher = Arc::new(MockFetcher::new());
        fetcher.respond("https://app.test/slow", Response::new(200, "fast"));
        let ctx = context(fetcher.clone());
        let strategy = NetworkFirst::new(RUNTIME).with_timeout(Duration::from_millis(20));

        strategy
            .handle(&ctx, Request::get(url("https://app.test/slow")))
            .await
            .unwrap();

        fetcher.set_delay(Duration::from_millis(500));
        let response = strategy
            .handle(&ctx, Request::get(url("https://app.test/slow")))
            .await
            .unwrap();
        assert_eq!(response.body, Bytes::from("fast"));
    }

    #[tokio::test]
    async fn test_network_only_never_touches_cache() {
        let fetcher = Arc::new(MockFetcher::new());
        fetcher.respond("https://app.test/sse", Response::new(200, "data: 1\n\n"));
        let ctx = context(fetcher.clone());

        Strategy::network_only()
            .handle(&ctx, Request::get(url("https://app.test/sse")))
            .await
            .unwrap();
        assert!(ctx.caches().cache_names().await.is_empty());

        fetcher.set_offline(true);
        let result = Strategy::network_only()
            .handle(&ctx, Request::get(url("https://app.test/sse")))
            .await;
        assert!(matches!(result, Err(SwError::Network(_))));
    }

    fn event_stream(rx: mpsc::Receiver<Result<Bytes, swkit_net::NetError>>) -> Response {
        Response::streaming(200, rx).with_header(
            HeaderName::from_static("content-type"),
            HeaderValue::from_static("text/event-stream"),
        )
    }

    #[tokio::test]
    async fn test_network_only_passes_stream_through() {
        let fetcher = Arc::new(MockFetcher::new());
        let (tx, rx) = mpsc::channel(4);
        fetcher.respond("https://app.test/sse", event_stream(rx));
        let ctx = context(fetcher);

        let response = Strategy::network_only()
            .handle(&ctx, Request::get(url("https://app.test/sse")))
            .await
            .unwrap();
        assert!(response.is_streaming());

        // Events sent after the response was handed back still reach the page.
        let mut body = response.body.clone();
        tx.send(Ok(Bytes::from("data: 1\n\n"))).await.unwrap();
        assert_eq!(body.next_chunk().await.unwrap().unwrap(), "data: 1\n\n");
        drop(tx);
        assert!(body.next_chunk().await.is_none());
    }

    #[tokio::test]
    async fn test_network_first_never_caches_event_stream() {
        let fetcher = Arc::new(MockFetcher::new());
        let (_tx, rx) = mpsc::channel(4);
        fetcher.respond("https://app.test/events", event_stream(rx));
        let ctx = context(fetcher);

        let response = NetworkFirst::new(RUNTIME)
            .handle(&ctx, Request::get(url("https://app.test/events")))
            .await
            .unwrap();

        assert!(response.is_streaming());
        assert!(ctx.caches().keys(RUNTIME).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_network_first_buffers_streamed_body_for_cache() {
        let fetcher = Arc::new(MockFetcher::new());
        let (tx, rx) = mpsc::channel(4);
        tx.send(Ok(Bytes::from("con"))).await.unwrap();
        tx.send(Ok(Bytes::from("sole.log(1)"))).await.unwrap();
        drop(tx);
        fetcher.respond("https://app.test/a.js", Response::streaming(200, rx));
        let ctx = context(fetcher);

        let response = NetworkFirst::new(RUNTIME)
            .handle(&ctx, Request::get(url("https://app.test/a.js")))
            .await
            .unwrap();

        assert_eq!(response.body, Bytes::from("console.log(1)"));
        let cached = ctx
            .caches()
            .match_url(RUNTIME, &url("https://app.test/a.js"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cached.body, Bytes::from("console.log(1)"));
    }

    #[test]
    fn test_strategy_names() {
        assert_eq!(Strategy::network_only().name(), "network-only");
        assert_eq!(
            Strategy::network_first(RUNTIME, DEFAULT_NETWORK_TIMEOUT).name(),
            "network-first"
        );
    }
}
