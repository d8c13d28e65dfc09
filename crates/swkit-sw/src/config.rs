//! Worker configuration.
//!
//! Everything the worker needs is fixed when it is built: the scope, the
//! offline page, the warm set, stream endpoints and the precache manifest.
//! Only the scope is required; the other fields default to the wardrobe
//! application's worker.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use swkit_common::ResultExt;
use tracing::debug;
use url::Url;

use crate::error::{SwError, SwResult};
use crate::precache::PrecacheManifest;

/// Worker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Registration scope; relative URLs below resolve against it.
    pub scope: Url,

    /// Page served in place of a failed navigation.
    #[serde(default = "defaults::fallback_url")]
    pub fallback_url: String,

    /// URLs fetched into the runtime cache during install.
    #[serde(default = "defaults::warm_urls")]
    pub warm_urls: Vec<String>,

    /// Request paths that always bypass the cache, on any origin.
    #[serde(default = "defaults::stream_paths")]
    pub stream_paths: Vec<String>,

    /// Network-first timeout before falling back to cache.
    #[serde(default = "defaults::network_timeout_ms")]
    pub network_timeout_ms: u64,

    /// Prefix for cache names.
    #[serde(default = "defaults::cache_prefix")]
    pub cache_prefix: String,

    /// Activate as soon as install finishes.
    #[serde(default = "defaults::enabled")]
    pub skip_waiting: bool,

    /// Take control of open pages on activation.
    #[serde(default = "defaults::enabled")]
    pub claim_clients: bool,

    #[serde(default)]
    pub precache_manifest: PrecacheManifest,
}

mod defaults {
    pub fn fallback_url() -> String {
        "/offline.html".to_string()
    }

    pub fn warm_urls() -> Vec<String> {
        [
            "/offline.html",
            "/modules/htmx.min.js",
            "/modules/_hyperscript.min.js",
            "/modules/sse.js",
            "/modules/pwa-install.bundle.js",
        ]
        .into_iter()
        .map(String::from)
        .collect()
    }

    pub fn stream_paths() -> Vec<String> {
        vec!["/sse".to_string()]
    }

    pub fn network_timeout_ms() -> u64 {
        10_000
    }

    pub fn cache_prefix() -> String {
        "swkit".to_string()
    }

    pub fn enabled() -> bool {
        true
    }
}

impl WorkerConfig {
    /// Defaults for a worker registered at `scope`.
    pub fn for_scope(scope: Url) -> Self {
        Self {
            scope,
            fallback_url: defaults::fallback_url(),
            warm_urls: defaults::warm_urls(),
            stream_paths: defaults::stream_paths(),
            network_timeout_ms: defaults::network_timeout_ms(),
            cache_prefix: defaults::cache_prefix(),
            skip_waiting: defaults::enabled(),
            claim_clients: defaults::enabled(),
            precache_manifest: PrecacheManifest::default(),
        }
    }

    pub fn from_json(json: &str) -> SwResult<Self> {
        let config: Self = serde_json::from_str(json).context("Failed to parse worker config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> SwResult<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "Loading worker config");
        let json = std::fs::read_to_string(path)
            .context(format!("Failed to read worker config {}", path.display()))?;
        Self::from_json(&json)
    }

    pub fn to_json(&self) -> SwResult<String> {
        Ok(serde_json::to_string_pretty(self).context("Failed to encode worker config")?)
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_millis(self.network_timeout_ms)
    }

    fn scope_suffix(&self) -> &str {
        self.scope.as_str()
    }

    /// Runtime cache name, unique per scope.
    pub fn runtime_cache_name(&self) -> String {
        format!("{}-runtime-{}", self.cache_prefix, self.scope_suffix())
    }

    /// Precache name, unique per scope.
    pub fn precache_cache_name(&self) -> String {
        format!("{}-precache-v2-{}", self.cache_prefix, self.scope_suffix())
    }

    /// Resolve a configured URL against the scope.
    pub fn resolve(&self, url: &str) -> SwResult<Url> {
        self.scope
            .join(url)
            .map_err(|e| SwError::Config(format!("invalid URL {url:?}: {e}")))
    }

    pub fn fallback(&self) -> SwResult<Url> {
        self.resolve(&self.fallback_url)
    }

    pub fn warm_set(&self) -> SwResult<Vec<Url>> {
        self.warm_urls.iter().map(|u| self.resolve(u)).collect()
    }

    /// Whether `url` is one of the streaming endpoints. The origin is not
    /// considered, so an event stream on another host is still never cached.
    pub fn is_stream(&self, url: &Url) -> bool {
        self.stream_paths.iter().any(|p| url.path() == p)
    }

    /// Check the configuration for inconsistencies.
    pub fn validate(&self) -> SwResult<()> {
        if !matches!(self.scope.scheme(), "http" | "https") {
            return Err(SwError::Config(format!(
                "scope must be http(s), got {}",
                self.scope
            )));
        }
        if self.cache_prefix.is_empty() {
            return Err(SwError::Config("cache prefix must not be empty".into()));
        }
        if self.network_timeout_ms == 0 {
            return Err(SwError::Config("network timeout must be positive".into()));
        }
        if let Some(path) = self.stream_paths.iter().find(|p| !p.starts_with('/')) {
            return Err(SwError::Config(format!(
                "stream path {path:?} must start with '/'"
            )));
        }

        let fallback = self.fallback()?;
        let warm = self.warm_set()?;
        if !warm.contains(&fallback) {
            return Err(SwError::Config(format!(
                "fallback {fallback} is not in the warm set"
            )));
        }
        if let Some(url) = warm.iter().find(|u| self.is_stream(u)) {
            return Err(SwError::Config(format!(
                "stream endpoint {url} cannot be warmed"
            )));
        }
        for entry in self.precache_manifest.entries() {
            let url = self.resolve(&entry.url)?;
            if self.is_stream(&url) {
                return Err(SwError::Config(format!(
                    "stream endpoint {url} cannot be precached"
                )));
            }
        }

        Ok(())
    }
}
