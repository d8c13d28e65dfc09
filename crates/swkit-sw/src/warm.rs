//! Cache warming: populate a strategy's cache ahead of first use.

use futures::future::join_all;
use swkit_net::{Request, ResponseType};
use tracing::{debug, info, warn};
use url::Url;

use crate::context::WorkerContext;
use crate::strategy::Strategy;

/// Result of one warm pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WarmReport {
    pub warmed: Vec<Url>,
    /// URLs that could not be fetched, with the reason.
    pub failed: Vec<(Url, String)>,
}

impl WarmReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Runs a fixed URL list through a strategy, keeping only the cache side
/// effect.
#[derive(Debug, Clone)]
pub struct CacheWarmer {
    urls: Vec<Url>,
    strategy: Strategy,
}

impl CacheWarmer {
    pub fn new(urls: Vec<Url>, strategy: Strategy) -> Self {
        Self { urls, strategy }
    }

    pub fn urls(&self) -> &[Url] {
        &self.urls
    }

    /// Fetch every URL concurrently. Failures are logged and reported but
    /// never fail the pass.
    pub async fn warm(&self, ctx: &WorkerContext) -> WarmReport {
        debug!(count = self.urls.len(), strategy = self.strategy.name(), "Warming cache");

        let results = join_all(self.urls.iter().map(|url| async move {
            let result = self.strategy.handle(ctx, Request::get(url.clone())).await;
            (url.clone(), result)
        }))
        .await;

        let mut report = WarmReport::default();
        for (url, result) in results {
            match result {
                Ok(response) if response.ok() || response.kind == ResponseType::Opaque => {
                    report.warmed.push(url)
                }
                Ok(response) => {
                    warn!(url = %url, status = response.status, "Warm fetch returned error status");
                    report
                        .failed
                        .push((url, format!("status {}", response.status)));
                }
                Err(e) => {
                    warn!(url = %url, error = %e, "Failed to warm cache entry");
                    report.failed.push((url, e.to_string()));
                }
            }
        }

        info!(
            warmed = report.warmed.len(),
            failed = report.failed.len(),
            "Cache warm pass finished"
        );
        report
    }
}
