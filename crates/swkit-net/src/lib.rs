//! # swkit Net
//!
//! Request/response model and the fetch capability seen by a service worker.
//!
//! ## Design Goals
//!
//! 1. **Browser-shaped types**: requests carry a destination and mode, responses
//!    carry a type, so strategies can reason the way a worker does.
//! 2. **Injectable fetch**: every network access goes through [`Fetcher`], so the
//!    caching layer can be exercised offline.
//! 3. **Streaming bodies**: a network response hands its body over chunk by
//!    chunk ([`ResponseBody::Stream`]); only a cache write buffers it. Buffered
//!    bodies are [`Bytes`], so cloning a cached response never copies the payload.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use url::Url;

pub mod loader;

pub use loader::{HttpFetcher, LoaderConfig};

/// Errors that can occur while fetching.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Network unavailable: {0}")]
    Offline(String),

    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Response body is still streaming")]
    Streaming,
}

impl NetError {
    /// Transport-level failures a cache can stand in for.
    pub fn is_transient(&self) -> bool {
        match self {
            NetError::Offline(_) | NetError::Timeout(_) | NetError::RequestFailed(_) => true,
            NetError::Http(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            NetError::InvalidUrl(_) | NetError::Streaming => false,
        }
    }
}

/// What the browser intends to do with the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RequestDestination {
    /// Plain `fetch()` / XHR.
    #[default]
    Empty,
    /// Top-level or framed document navigation.
    Document,
    Script,
    Style,
    Image,
    Font,
    Manifest,
    Worker,
    Audio,
    Video,
}

impl RequestDestination {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestDestination::Empty => "",
            RequestDestination::Document => "document",
            RequestDestination::Script => "script",
            RequestDestination::Style => "style",
            RequestDestination::Image => "image",
            RequestDestination::Font => "font",
            RequestDestination::Manifest => "manifest",
            RequestDestination::Worker => "worker",
            RequestDestination::Audio => "audio",
            RequestDestination::Video => "video",
        }
    }
}

/// Request mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    Navigate,
    SameOrigin,
    NoCors,
    #[default]
    Cors,
}

/// A request as seen by the worker.
#[derive(Debug, Clone)]
pub struct Request {
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub destination: RequestDestination,
    pub mode: RequestMode,
}

impl Request {
    /// Create a GET request with no particular destination.
    pub fn get(url: Url) -> Self {
        Self {
            url,
            method: Method::GET,
            headers: HeaderMap::new(),
            body: None,
            destination: RequestDestination::Empty,
            mode: RequestMode::Cors,
        }
    }

    /// Create a document navigation request.
    pub fn navigate(url: Url) -> Self {
        Self {
            destination: RequestDestination::Document,
            mode: RequestMode::Navigate,
            ..Self::get(url)
        }
    }

    /// Create a request with an arbitrary method and body.
    pub fn with_method(url: Url, method: Method, body: Option<Bytes>) -> Self {
        Self {
            method,
            body,
            ..Self::get(url)
        }
    }

    /// Parse `url` and create a GET request.
    pub fn parse(url: &str) -> Result<Self, NetError> {
        let url = Url::parse(url).map_err(|e| NetError::InvalidUrl(format!("{url}: {e}")))?;
        Ok(Self::get(url))
    }

    /// Set the destination.
    pub fn destination(mut self, destination: RequestDestination) -> Self {
        self.destination = destination;
        self
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Whether this request loads a new document.
    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate || self.destination == RequestDestination::Document
    }

    /// Key under which a response for this request is cached.
    pub fn cache_key(&self) -> Url {
        cache_key(&self.url)
    }
}

/// Normalize a URL for cache storage: the fragment never takes part in matching.
pub fn cache_key(url: &Url) -> Url {
    let mut key = url.clone();
    key.set_fragment(None);
    key
}

/// Response type, as exposed by `Response.type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseType {
    #[default]
    Basic,
    Cors,
    /// Cross-origin no-cors response; status reads as 0.
    Opaque,
    /// Network error.
    Error,
}

/// Chunks of a body still arriving from the network.
pub type BodyChunks = mpsc::Receiver<Result<Bytes, NetError>>;

/// Response body.
#[derive(Clone)]
pub enum ResponseBody {
    /// Fully buffered.
    Full(Bytes),
    /// Streaming body. Clones share one receiver, so each chunk is read once.
    Stream(Arc<Mutex<BodyChunks>>),
}

impl ResponseBody {
    pub fn is_stream(&self) -> bool {
        matches!(self, ResponseBody::Stream(_))
    }

    /// The buffered bytes, `None` while streaming.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            ResponseBody::Full(bytes) => Some(bytes),
            ResponseBody::Stream(_) => None,
        }
    }

    /// Next chunk of the body.
    ///
    /// A full body yields itself once, then `None`.
    pub async fn next_chunk(&mut self) -> Option<Result<Bytes, NetError>> {
        match self {
            ResponseBody::Full(bytes) if bytes.is_empty() => None,
            ResponseBody::Full(bytes) => Some(Ok(std::mem::take(bytes))),
            ResponseBody::Stream(rx) => {
                let mut rx = rx.lock().await;
                rx.recv().await
            }
        }
    }

    /// Read the rest of the body into memory.
    pub async fn bytes(self) -> Result<Bytes, NetError> {
        match self {
            ResponseBody::Full(bytes) => Ok(bytes),
            ResponseBody::Stream(rx) => {
                let mut rx = rx.lock().await;
                let mut chunks = Vec::new();
                while let Some(chunk) = rx.recv().await {
                    chunks.push(chunk?);
                }
                Ok(chunks.into_iter().flatten().collect())
            }
        }
    }
}

impl Default for ResponseBody {
    fn default() -> Self {
        ResponseBody::Full(Bytes::new())
    }
}

impl From<Bytes> for ResponseBody {
    fn from(bytes: Bytes) -> Self {
        ResponseBody::Full(bytes)
    }
}

impl PartialEq<Bytes> for ResponseBody {
    fn eq(&self, other: &Bytes) -> bool {
        self.as_bytes() == Some(other)
    }
}

impl std::fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResponseBody::Full(bytes) => f.debug_tuple("Full").field(&bytes.len()).finish(),
            ResponseBody::Stream(_) => f.write_str("Stream"),
        }
    }
}

/// A response, either from the network or synthesized by the worker.
#[derive(Debug, Clone)]
pub struct Response {
    /// Final URL, `None` for synthesized responses.
    pub url: Option<Url>,
    pub status: u16,
    pub status_text: String,
    pub headers: HeaderMap,
    pub body: ResponseBody,
    pub kind: ResponseType,
}

impl Response {
    /// Create a basic response.
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self::with_body(status, ResponseBody::Full(body.into()))
    }

    /// Create a basic response whose body arrives over `chunks`.
    pub fn streaming(status: u16, chunks: BodyChunks) -> Self {
        Self::with_body(status, ResponseBody::Stream(Arc::new(Mutex::new(chunks))))
    }

    fn with_body(status: u16, body: ResponseBody) -> Self {
        Self {
            url: None,
            status,
            status_text: http::StatusCode::from_u16(status)
                .ok()
                .and_then(|s| s.canonical_reason())
                .unwrap_or_default()
                .to_string(),
            headers: HeaderMap::new(),
            body,
            kind: ResponseType::Basic,
        }
    }

    /// The network-error response (`Response.error()`).
    pub fn error() -> Self {
        Self {
            url: None,
            status: 0,
            status_text: String::new(),
            headers: HeaderMap::new(),
            body: ResponseBody::default(),
            kind: ResponseType::Error,
        }
    }

    /// An opaque response (`no-cors` cross-origin).
    pub fn opaque(url: Url) -> Self {
        Self {
            url: Some(url),
            kind: ResponseType::Opaque,
            ..Self::error()
        }
    }

    /// Set the URL.
    pub fn with_url(mut self, url: Url) -> Self {
        self.url = Some(url);
        self
    }

    /// Add a header.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Status is 2xx.
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// This is a network-error response.
    pub fn is_error(&self) -> bool {
        self.kind == ResponseType::Error
    }

    /// Get a header value as a string.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// The body is still arriving from the network.
    pub fn is_streaming(&self) -> bool {
        self.body.is_stream()
    }

    /// Content type without parameters, lowercased.
    pub fn content_type(&self) -> Option<String> {
        self.header("content-type")
            .and_then(|v| v.split(';').next())
            .map(|v| v.trim().to_ascii_lowercase())
    }

    /// Read a streaming body to the end, leaving the response buffered.
    pub async fn buffered(mut self) -> Result<Self, NetError> {
        if self.body.is_stream() {
            let body = std::mem::take(&mut self.body).bytes().await?;
            self.body = ResponseBody::Full(body);
        }
        Ok(self)
    }

    fn buffered_bytes(&self) -> Result<&Bytes, NetError> {
        self.body.as_bytes().ok_or(NetError::Streaming)
    }

    /// Body as UTF-8 text. Streaming bodies must be [`buffered`](Self::buffered) first.
    pub fn text(&self) -> Result<String, NetError> {
        String::from_utf8(self.buffered_bytes()?.to_vec())
            .map_err(|e| NetError::RequestFailed(e.to_string()))
    }

    /// Body as JSON.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, NetError> {
        serde_json::from_slice(self.buffered_bytes()?)
            .map_err(|e| NetError::RequestFailed(e.to_string()))
    }
}

/// Network access available to a worker.
///
/// Transport failures are `Err`; any HTTP status, including 4xx/5xx, is `Ok`.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: Request) -> Result<Response, NetError>;
}
