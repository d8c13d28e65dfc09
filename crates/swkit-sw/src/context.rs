//! Runtime context handed to every worker handler.
//!
//! Replaces the implicit global scope of a browser worker with an explicit
//! object: fetch capability, cache storage, notification display, the clients
//! registry, a clock, and the lifecycle requests (`skipWaiting`, `clients.claim`)
//! the hosting runtime reads back.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use swkit_net::Fetcher;
use tokio::sync::RwLock;
use tracing::{debug, info};
use url::Url;

use crate::cache::{CacheStorage, MemoryCacheStorage};
use crate::clients::Clients;
use crate::error::{SwError, SwResult};
use crate::lifecycle::WorkerId;
use crate::push::NotificationOptions;

/// Millisecond clock.
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn now_millis(&self) -> u64;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default()
    }
}

/// System notification display (`registration.showNotification`).
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn show_notification(&self, title: &str, options: &NotificationOptions) -> SwResult<()>;
}

/// What the worker knows about its registration.
#[derive(Debug, Clone)]
pub struct RegistrationInfo {
    /// Registration scope.
    pub scope: Url,
    /// A push manager is available.
    pub push_supported: bool,
}

/// Explicit runtime context for one worker version.
pub struct WorkerContext {
    id: WorkerId,
    fetcher: Arc<dyn Fetcher>,
    caches: Arc<dyn CacheStorage>,
    notifier: Option<Arc<dyn Notifier>>,
    registration: Option<RegistrationInfo>,
    clients: Arc<RwLock<Clients>>,
    clock: Arc<dyn Clock>,
    skip_waiting: AtomicBool,
}

impl WorkerContext {
    /// Start building a context.
    pub fn builder() -> WorkerContextBuilder {
        WorkerContextBuilder::default()
    }

    /// Identity of the worker version this context belongs to.
    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn fetcher(&self) -> &Arc<dyn Fetcher> {
        &self.fetcher
    }

    pub fn caches(&self) -> &Arc<dyn CacheStorage> {
        &self.caches
    }

    pub fn notifier(&self) -> Option<&Arc<dyn Notifier>> {
        self.notifier.as_ref()
    }

    pub fn registration(&self) -> Option<&RegistrationInfo> {
        self.registration.as_ref()
    }

    pub fn clients(&self) -> &Arc<RwLock<Clients>> {
        &self.clients
    }

    /// Current time in ms since the Unix epoch.
    pub fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }

    /// Ask the runtime to activate this worker without waiting.
    pub fn skip_waiting(&self) {
        if !self.skip_waiting.swap(true, Ordering::SeqCst) {
            info!(worker = ?self.id, "Skip waiting requested");
        }
    }

    /// Whether `skip_waiting` was called.
    pub fn skip_waiting_requested(&self) -> bool {
        self.skip_waiting.load(Ordering::SeqCst)
    }

    /// Take control of every open client in scope.
    ///
    /// Returns the number of clients that changed controller. Without a
    /// registration there is no scope to claim, which is an error.
    pub async fn clients_claim(&self) -> SwResult<usize> {
        let scope = self
            .registration
            .as_ref()
            .map(|r| r.scope.clone())
            .ok_or_else(|| SwError::StateError("clients.claim() without registration".into()))?;

        let claimed = self.clients.write().await.claim(self.id, &scope);
        debug!(worker = ?self.id, claimed, "clients.claim() done");
        Ok(claimed)
    }
}

impl std::fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerContext")
            .field("id", &self.id)
            .field("registration", &self.registration)
            .field("skip_waiting", &self.skip_waiting_requested())
            .finish_non_exhaustive()
    }
}

/// Builder for [`WorkerContext`].
#[derive(Default)]
pub struct WorkerContextBuilder {
    fetcher: Option<Arc<dyn Fetcher>>,
    caches: Option<Arc<dyn CacheStorage>>,
    notifier: Option<Arc<dyn Notifier>>,
    registration: Option<RegistrationInfo>,
    clients: Option<Arc<RwLock<Clients>>>,
    clock: Option<Arc<dyn Clock>>,
}

impl WorkerContextBuilder {
    pub fn fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn caches(mut self, caches: Arc<dyn CacheStorage>) -> Self {
        self.caches = Some(caches);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn registration(mut self, registration: RegistrationInfo) -> Self {
        self.registration = Some(registration);
        self
    }

    /// Share a clients registry between worker versions.
    pub fn clients(mut self, clients: Arc<RwLock<Clients>>) -> Self {
        self.clients = Some(clients);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Build the context.
    ///
    /// A fetcher is required. Caches default to memory stamped by the
    /// context's clock.
    pub fn build(self) -> SwResult<Arc<WorkerContext>> {
        let fetcher = self
            .fetcher
            .ok_or_else(|| SwError::StateError("worker context needs a fetcher".into()))?;
        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let caches = match self.caches {
            Some(caches) => caches,
            None => Arc::new(MemoryCacheStorage::with_clock(clock.clone())),
        };

        Ok(Arc::new(WorkerContext {
            id: WorkerId::new(),
            fetcher,
            caches,
            notifier: self.notifier,
            registration: self.registration,
            clients: self.clients.unwrap_or_default(),
            clock,
            skip_waiting: AtomicBool::new(false),
        }))
    }
}
