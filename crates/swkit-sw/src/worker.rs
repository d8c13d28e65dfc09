//! The offline worker: precache, warm set, routes, fallback, lifecycle and
//! push wired into one event table.

use std::sync::Arc;

use swkit_net::{HttpFetcher, LoaderConfig, Request, Response};
use tracing::{debug, info, warn};

use crate::cache::MemoryCacheStorage;
use crate::config::WorkerConfig;
use crate::context::{RegistrationInfo, WorkerContext};
use crate::error::{SwError, SwResult};
use crate::fallback::OfflineFallback;
use crate::lifecycle::EventDispatcher;
use crate::precache::{InstallReport, PrecacheController};
use crate::push::{handle_push, PushOutcome};
use crate::registration::WorkerScript;
use crate::router::{Route, RouteMatcher, RouteOutcome, Router};
use crate::strategy::Strategy;
use crate::warm::{CacheWarmer, WarmReport};

/// Offline-capable worker assembled from a [`WorkerConfig`].
pub struct OfflineWorker {
    config: WorkerConfig,
    ctx: Arc<WorkerContext>,
    precache: Arc<PrecacheController>,
    warmer: Arc<CacheWarmer>,
    router: Arc<Router>,
    dispatcher: EventDispatcher,
}

impl OfflineWorker {
    /// Assemble the worker on top of `ctx`.
    pub fn new(config: WorkerConfig, ctx: Arc<WorkerContext>) -> SwResult<Self> {
        config.validate()?;

        let runtime = Strategy::network_first(config.runtime_cache_name(), config.network_timeout());

        let precache = Arc::new(PrecacheController::new(
            config.precache_cache_name(),
            &config.scope,
            &config.precache_manifest,
        )?);

        let warmer = Arc::new(CacheWarmer::new(config.warm_set()?, runtime.clone()));

        let mut router = Router::with_scope(config.scope.clone());
        router.register(Route::new(
            RouteMatcher::Precached(precache.clone()),
            Strategy::precache(precache.clone()),
        ));
        for path in &config.stream_paths {
            router.register(Route::new(
                RouteMatcher::AnyOriginPath(path.clone()),
                Strategy::network_only(),
            ));
        }
        router.register(Route::new(RouteMatcher::Always, runtime.clone()));
        router.set_catch_handler(Arc::new(OfflineFallback::new(config.fallback()?, runtime)));
        let router = Arc::new(router);

        let mut worker = Self {
            config,
            ctx,
            precache,
            warmer,
            router,
            dispatcher: EventDispatcher::new(),
        };
        worker.register_listeners();

        info!(
            scope = %worker.config.scope,
            precached = worker.precache.cache_keys().len(),
            warm = worker.warmer.urls().len(),
            routes = worker.router.routes().len(),
            "Offline worker ready"
        );
        Ok(worker)
    }

    /// Worker backed by the real network and in-memory caches.
    pub fn with_http(config: WorkerConfig, loader: LoaderConfig) -> SwResult<Self> {
        let ctx = WorkerContext::builder()
            .fetcher(Arc::new(HttpFetcher::new(loader)?))
            .caches(Arc::new(MemoryCacheStorage::new()))
            .registration(RegistrationInfo {
                scope: config.scope.clone(),
                push_supported: false,
            })
            .build()?;
        Self::new(config, ctx)
    }

    fn register_listeners(&mut self) {
        let dispatcher = &mut self.dispatcher;

        {
            let ctx = self.ctx.clone();
            let precache = self.precache.clone();
            dispatcher.on_install(move |event| {
                let ctx = ctx.clone();
                let precache = precache.clone();
                event.wait_until(async move { precache.install(&ctx).await.map(|_| ()) });
            });
        }

        {
            let ctx = self.ctx.clone();
            let warmer = self.warmer.clone();
            dispatcher.on_install(move |event| {
                let ctx = ctx.clone();
                let warmer = warmer.clone();
                event.wait_until(async move {
                    warmer.warm(&ctx).await;
                    Ok::<_, SwError>(())
                });
            });
        }

        if self.config.skip_waiting {
            let ctx = self.ctx.clone();
            dispatcher.on_install(move |_| {
                debug!("Worker installing, skipping waiting");
                ctx.skip_waiting();
            });
        }

        if self.config.claim_clients {
            let ctx = self.ctx.clone();
            dispatcher.on_activate(move |event| {
                let ctx = ctx.clone();
                event.wait_until(async move { ctx.clients_claim().await.map(|_| ()) });
            });
        }

        {
            let ctx = self.ctx.clone();
            let precache = self.precache.clone();
            dispatcher.on_activate(move |event| {
                let ctx = ctx.clone();
                let precache = precache.clone();
                event.wait_until(async move { precache.activate(&ctx).await.map(|_| ()) });
            });
        }

        {
            let ctx = self.ctx.clone();
            let router = self.router.clone();
            dispatcher.on_fetch(move |event| {
                if router.find_route(event.request()).is_none() {
                    return;
                }
                let ctx = ctx.clone();
                let router = router.clone();
                let request = event.request().clone();
                let result = event.respond_with(async move {
                    match router.handle_request(&ctx, request.clone()).await {
                        RouteOutcome::Handled(r) | RouteOutcome::CatchHandled(r) => Ok(r),
                        RouteOutcome::Failed(e) => Err(e),
                        RouteOutcome::Passthrough => {
                            ctx.fetcher().fetch(request).await.map_err(SwError::from)
                        }
                    }
                });
                if let Err(e) = result {
                    warn!(error = %e, "Fetch already answered");
                }
            });
        }

        {
            let ctx = self.ctx.clone();
            dispatcher.on_push(move |event| {
                let ctx = ctx.clone();
                let data = event.data().map(str::to_string);
                event.extendable().wait_until(async move {
                    handle_push(&ctx, data.as_deref()).await.map(|_| ())
                });
            });
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn context(&self) -> &Arc<WorkerContext> {
        &self.ctx
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn precache(&self) -> &Arc<PrecacheController> {
        &self.precache
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    /// Run the install event.
    pub async fn install(&self) -> SwResult<()> {
        self.dispatcher.install().await
    }

    /// Run the activate event.
    pub async fn activate(&self) -> SwResult<()> {
        self.dispatcher.activate().await
    }

    /// Run a fetch event. `None` means the request goes to the network.
    pub async fn handle_fetch(&self, request: Request) -> SwResult<Option<Response>> {
        self.dispatcher.fetch(request).await
    }

    /// Run a push event.
    pub async fn push(&self, data: Option<String>) -> SwResult<()> {
        self.dispatcher.push(data).await
    }

    /// Route a request directly, reporting how it was resolved.
    pub async fn route(&self, request: Request) -> RouteOutcome {
        self.router.handle_request(&self.ctx, request).await
    }

    /// Precache install without the rest of the install event.
    pub async fn install_precache(&self) -> SwResult<InstallReport> {
        self.precache.install(&self.ctx).await
    }

    /// One warm pass outside the install event.
    pub async fn warm(&self) -> WarmReport {
        self.warmer.warm(&self.ctx).await
    }

    /// Handle a push payload and report the outcome.
    pub async fn handle_push(&self, data: Option<&str>) -> SwResult<PushOutcome> {
        handle_push(&self.ctx, data).await
    }
}

impl WorkerScript for OfflineWorker {
    fn context(&self) -> &Arc<WorkerContext> {
        &self.ctx
    }

    fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }
}

impl std::fmt::Debug for OfflineWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineWorker")
            .field("scope", &self.config.scope.as_str())
            .field("router", &self.router)
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::EventKind;
    use crate::push::DropReason;
    use crate::testing::{MockFetcher, RecordingNotifier};
    use url::Url;

    fn scope() -> Url {
        Url::parse("http://localhost:3000/").unwrap()
    }

    fn worker() -> OfflineWorker {
        let ctx = WorkerContext::builder()
            .fetcher(Arc::new(MockFetcher::new()))
            .build()
            .unwrap();
        OfflineWorker::new(WorkerConfig::for_scope(scope()), ctx).unwrap()
    }

    fn push_worker(push_supported: bool) -> (OfflineWorker, Arc<RecordingNotifier>) {
        let notifier = Arc::new(RecordingNotifier::new());
        let ctx = WorkerContext::builder()
            .fetcher(Arc::new(MockFetcher::new()))
            .notifier(notifier.clone())
            .registration(RegistrationInfo {
                scope: scope(),
                push_supported,
            })
            .build()
            .unwrap();
        let worker = OfflineWorker::new(WorkerConfig::for_scope(scope()), ctx).unwrap();
        (worker, notifier)
    }

    #[test]
    fn test_route_order() {
        let worker = worker();
        let names: Vec<_> = worker
            .router()
            .routes()
            .iter()
            .map(|r| r.strategy.name())
            .collect();
        assert_eq!(names, vec!["precache", "network-only", "network-first"]);
    }

    #[test]
    fn test_listeners_registered() {
        let worker = worker();
        let dispatcher = worker.dispatcher();
        assert_eq!(dispatcher.listener_count(EventKind::Install), 3);
        assert_eq!(dispatcher.listener_count(EventKind::Activate), 2);
        assert_eq!(dispatcher.listener_count(EventKind::Fetch), 1);
        assert_eq!(dispatcher.listener_count(EventKind::Push), 1);
    }

    #[tokio::test]
    async fn test_install_requests_skip_waiting() {
        let worker = worker();
        worker.install().await.unwrap();
        assert!(worker.context().skip_waiting_requested());
    }

    #[tokio::test]
    async fn test_push_event_shows_notification() {
        let (worker, notifier) = push_worker(true);

        worker
            .push(Some(r#"{"title":"Outfit ready","options":{"tag":"daily"}}"#.into()))
            .await
            .unwrap();

        let shown = notifier.shown();
        assert_eq!(shown.len(), 1);
        assert_eq!(shown[0].0, "Outfit ready");
        assert_eq!(shown[0].1.tag.as_deref(), Some("daily"));
    }

    #[tokio::test]
    async fn test_push_event_guards_show_nothing() {
        let (worker, notifier) = push_worker(true);
        worker.push(None).await.unwrap();
        assert_eq!(
            worker.handle_push(None).await.unwrap(),
            PushOutcome::Dropped(DropReason::NoData)
        );
        assert!(notifier.shown().is_empty());

        let (worker, notifier) = push_worker(false);
        worker.push(Some("Hello".into())).await.unwrap();
        assert_eq!(
            worker.handle_push(Some("Hello")).await.unwrap(),
            PushOutcome::Dropped(DropReason::PushUnsupported)
        );
        assert!(notifier.shown().is_empty());

        // No registration at all.
        let notifier = Arc::new(RecordingNotifier::new());
        let ctx = WorkerContext::builder()
            .fetcher(Arc::new(MockFetcher::new()))
            .notifier(notifier.clone())
            .build()
            .unwrap();
        let worker = OfflineWorker::new(WorkerConfig::for_scope(scope()), ctx).unwrap();
        worker.push(Some("Hello".into())).await.unwrap();
        assert_eq!(
            worker.handle_push(Some("Hello")).await.unwrap(),
            PushOutcome::Dropped(DropReason::NoRegistration)
        );
        assert!(notifier.shown().is_empty());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let ctx = WorkerContext::builder()
            .fetcher(Arc::new(MockFetcher::new()))
            .build()
            .unwrap();
        let mut config = WorkerConfig::for_scope(scope());
        config.warm_urls.clear();
        assert!(OfflineWorker::new(config, ctx).is_err());
    }
}
