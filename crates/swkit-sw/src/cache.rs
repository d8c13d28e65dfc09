//! Named cache storage (`caches` / `Cache`).
//!
//! Each named cache holds at most one response per normalized request URL; a
//! later `put` for the same key replaces the earlier one. Operations are atomic
//! per key, and `put_all` commits a whole batch at once. Stored bodies are
//! always buffered.

use std::sync::Arc;

use async_trait::async_trait;
use hashbrown::HashMap;
use http::Method;
use swkit_net::{cache_key, Request, Response};
use tokio::sync::RwLock;
use tracing::trace;
use url::Url;

use crate::context::{Clock, SystemClock};
use crate::error::{SwError, SwResult};

/// A stored request/response pair.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Normalized request URL.
    pub url: Url,

    /// Stored response.
    pub response: Response,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

/// A single named cache.
#[derive(Debug, Default)]
pub struct Cache {
    /// Cache name.
    pub name: String,

    entries: HashMap<String, CacheEntry>,
}

impl Cache {
    /// Create an empty cache.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
        }
    }

    /// Look up the entry stored for `url`.
    pub fn match_url(&self, url: &Url) -> Option<&CacheEntry> {
        self.entries.get(cache_key(url).as_str())
    }

    /// Store `response` under `url` at `cached_at`, replacing any previous entry.
    pub fn put(&mut self, url: &Url, response: Response, cached_at: u64) {
        let key = cache_key(url);
        let entry = CacheEntry {
            url: key.clone(),
            response,
            cached_at,
        };
        self.entries.insert(key.into(), entry);
    }

    /// Delete the entry for `url`.
    pub fn delete(&mut self, url: &Url) -> bool {
        self.entries.remove(cache_key(url).as_str()).is_some()
    }

    /// Stored URLs, sorted.
    pub fn keys(&self) -> Vec<Url> {
        let mut keys: Vec<Url> = self.entries.values().map(|e| e.url.clone()).collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Cache storage available to a worker.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Create the named cache if it does not exist.
    async fn open(&self, name: &str) -> SwResult<()>;

    /// Check if a cache exists.
    async fn has(&self, name: &str) -> bool;

    /// Delete a whole cache.
    async fn delete_cache(&self, name: &str) -> SwResult<bool>;

    /// All cache names, sorted.
    async fn cache_names(&self) -> Vec<String>;

    /// Response stored in `name` for `url`.
    async fn match_url(&self, name: &str, url: &Url) -> SwResult<Option<Response>>;

    /// First response stored for `url` in any cache.
    async fn match_any(&self, url: &Url) -> SwResult<Option<Response>>;

    /// Store a response for `request` in `name`, creating the cache if needed.
    async fn put(&self, name: &str, request: &Request, response: Response) -> SwResult<()>;

    /// Store a batch of responses in one step; either all land or none do.
    async fn put_all(&self, name: &str, entries: Vec<(Url, Response)>) -> SwResult<()>;

    /// Delete the entry for `url` in `name`.
    async fn delete(&self, name: &str, url: &Url) -> SwResult<bool>;

    /// URLs stored in `name`.
    async fn keys(&self, name: &str) -> SwResult<Vec<Url>>;
}

/// Reject responses the Cache API refuses to store.
fn check_storable(url: &Url, response: &Response) -> SwResult<()> {
    if response.status == 206 {
        return Err(SwError::Cache(format!(
            "partial response for {url} cannot be cached"
        )));
    }
    if response.header("vary").map(|v| v.trim() == "*").unwrap_or(false) {
        return Err(SwError::Cache(format!(
            "response for {url} has Vary: * and cannot be cached"
        )));
    }
    Ok(())
}

/// In-memory cache storage.
pub struct MemoryCacheStorage {
    caches: RwLock<HashMap<String, Cache>>,
    clock: Arc<dyn Clock>,
}

impl MemoryCacheStorage {
    /// Create new cache storage stamped by the wall clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create new cache storage that stamps entries with `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            caches: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Total number of entries across all caches.
    pub async fn entry_count(&self) -> usize {
        self.caches.read().await.values().map(Cache::len).sum()
    }

    /// Full entry for `url` in `name`, including its timestamp.
    pub async fn entry(&self, name: &str, url: &Url) -> Option<CacheEntry> {
        self.caches
            .read()
            .await
            .get(name)
            .and_then(|c| c.match_url(url).cloned())
    }
}

impl Default for MemoryCacheStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryCacheStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCacheStorage").finish_non_exhaustive()
    }
}

#[async_trait]
impl CacheStorage for MemoryCacheStorage {
    async fn open(&self, name: &str) -> SwResult<()> {
        self.caches
            .write()
            .await
            .entry(name.to_string())
            .or_insert_with(|| Cache::new(name));
        Ok(())
    }

    async fn has(&self, name: &str) -> bool {
        self.caches.read().await.contains_key(name)
    }

    async fn delete_cache(&self, name: &str) -> SwResult<bool> {
        Ok(self.caches.write().await.remove(name).is_some())
    }

    async fn cache_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.caches.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    async fn match_url(&self, name: &str, url: &Url) -> SwResult<Option<Response>> {
        let caches = self.caches.read().await;
        Ok(caches
            .get(name)
            .and_then(|c| c.match_url(url))
            .map(|e| e.response.clone()))
    }

    async fn match_any(&self, url: &Url) -> SwResult<Option<Response>> {
        let caches = self.caches.read().await;
        let mut names: Vec<&String> = caches.keys().collect();
        names.sort();
        Ok(names
            .into_iter()
            .filter_map(|n| caches.get(n))
            .find_map(|c| c.match_url(url))
            .map(|e| e.response.clone()))
    }

    async fn put(&self, name: &str, request: &Request, response: Response) -> SwResult<()> {
        if request.method != Method::GET {
            return Err(SwError::Cache(format!(
                "cannot cache {} request for {}",
                request.method, request.url
            )));
        }
        check_storable(&request.url, &response)?;
        let response = response.buffered().await?;

        trace!(cache = name, url = %request.url, status = response.status, "Cache put");
        let cached_at = self.clock.now_millis();
        self.caches
            .write()
            .await
            .entry(name.to_string())
            .or_insert_with(|| Cache::new(name))
            .put(&request.url, response, cached_at);
        Ok(())
    }

    async fn put_all(&self, name: &str, entries: Vec<(Url, Response)>) -> SwResult<()> {
        let mut buffered = Vec::with_capacity(entries.len());
        for (url, response) in entries {
            check_storable(&url, &response)?;
            buffered.push((url, response.buffered().await?));
        }

        let cached_at = self.clock.now_millis();
        let mut caches = self.caches.write().await;
        let cache = caches
            .entry(name.to_string())
            .or_insert_with(|| Cache::new(name));
        for (url, response) in buffered {
            cache.put(&url, response, cached_at);
        }
        Ok(())
    }

    async fn delete(&self, name: &str, url: &Url) -> SwResult<bool> {
        Ok(self
            .caches
            .write()
            .await
            .get_mut(name)
            .map(|c| c.delete(url))
            .unwrap_or(false))
    }

    async fn keys(&self, name: &str) -> SwResult<Vec<Url>> {
        Ok(self
            .caches
            .read()
            .await
            .get(name)
            .map(Cache::keys)
            .unwrap_or_default())
    }
}
