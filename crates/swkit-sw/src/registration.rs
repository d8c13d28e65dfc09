//! Registration harness: the browser-owned side of the worker lifecycle.
//!
//! A [`Registration`] holds the installing, waiting and active versions for
//! one scope and drives them through install and activation the way a
//! browser does. Hosts and tests use it to run a worker end to end.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use hashbrown::HashMap;
use swkit_common::{retry_with_backoff, RetryConfig};
use swkit_net::{Request, Response};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use crate::clients::Clients;
use crate::context::WorkerContext;
use crate::error::{SwError, SwResult};
use crate::lifecycle::{EventDispatcher, WorkerId, WorkerState};

/// An evaluated worker script: its runtime context and listener table.
pub trait WorkerScript: Send + Sync {
    fn context(&self) -> &Arc<WorkerContext>;
    fn dispatcher(&self) -> &EventDispatcher;
}

/// One version of the worker known to a registration.
#[derive(Clone)]
pub struct ServiceWorker {
    pub id: WorkerId,
    pub state: WorkerState,
    pub state_changed_at: Instant,
    script: Arc<dyn WorkerScript>,
}

impl ServiceWorker {
    fn new(script: Arc<dyn WorkerScript>) -> Self {
        Self {
            id: script.context().id(),
            state: WorkerState::Parsed,
            state_changed_at: Instant::now(),
            script,
        }
    }

    fn set_state(&mut self, state: WorkerState) -> SwResult<()> {
        if !self.state.can_transition_to(state) {
            return Err(SwError::StateError(format!(
                "worker {} cannot go from {:?} to {:?}",
                self.id, self.state, state
            )));
        }
        self.state = state;
        self.state_changed_at = Instant::now();
        Ok(())
    }

    pub fn script(&self) -> &Arc<dyn WorkerScript> {
        &self.script
    }
}

impl fmt::Debug for ServiceWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceWorker")
            .field("id", &self.id)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// Lifecycle notifications from a registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationEvent {
    /// A new version started installing.
    UpdateFound { worker_id: WorkerId },
    StateChange {
        worker_id: WorkerId,
        state: WorkerState,
    },
    /// Install failed; the version is redundant.
    InstallFailed { worker_id: WorkerId, error: String },
    /// A client is now controlled by a different worker.
    ControllerChange {
        client_id: String,
        worker_id: WorkerId,
    },
}

#[derive(Default)]
struct Versions {
    installing: Option<ServiceWorker>,
    waiting: Option<ServiceWorker>,
    active: Option<ServiceWorker>,
    states: HashMap<WorkerId, WorkerState>,
}

impl Versions {
    fn record(&mut self, worker: &ServiceWorker) {
        self.states.insert(worker.id, worker.state);
    }
}

/// Worker versions registered for one scope.
pub struct Registration {
    scope: Url,
    versions: Mutex<Versions>,
    clients: Arc<RwLock<Clients>>,
    event_tx: mpsc::UnboundedSender<RegistrationEvent>,
}

impl Registration {
    /// Create a registration and the receiver for its lifecycle events.
    pub fn new(scope: Url) -> (Self, mpsc::UnboundedReceiver<RegistrationEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            Self {
                scope,
                versions: Mutex::new(Versions::default()),
                clients: Arc::new(RwLock::new(Clients::new())),
                event_tx,
            },
            event_rx,
        )
    }

    pub fn scope(&self) -> &Url {
        &self.scope
    }

    /// Open clients for this origin. Worker contexts should share it so
    /// `clients.claim()` is visible here.
    pub fn clients(&self) -> Arc<RwLock<Clients>> {
        self.clients.clone()
    }

    fn emit(&self, event: RegistrationEvent) {
        let _ = self.event_tx.send(event);
    }

    fn set_state(&self, versions: &mut Versions, worker: &mut ServiceWorker, state: WorkerState) {
        if let Err(e) = worker.set_state(state) {
            warn!(error = %e, "Ignoring invalid state transition");
            return;
        }
        versions.record(worker);
        debug!(worker = %worker.id, ?state, "Worker state changed");
        self.emit(RegistrationEvent::StateChange {
            worker_id: worker.id,
            state,
        });
    }

    /// Install a new version.
    ///
    /// On failure the version becomes redundant and the error is returned.
    /// On success it waits, or activates right away when it asked to skip
    /// waiting or no version is active yet.
    pub async fn install(&self, script: Arc<dyn WorkerScript>) -> SwResult<WorkerId> {
        let mut worker = ServiceWorker::new(script.clone());
        let id = worker.id;
        {
            let mut versions = self.versions.lock().await;
            versions.record(&worker);
            self.emit(RegistrationEvent::UpdateFound { worker_id: id });
            self.set_state(&mut versions, &mut worker, WorkerState::Installing);
            versions.installing = Some(worker.clone());
        }

        info!(worker = %id, scope = %self.scope, "Installing worker");
        let result = script.dispatcher().install().await;

        let activate_now = {
            let mut versions = self.versions.lock().await;
            versions.installing = None;

            if let Err(e) = result {
                warn!(worker = %id, error = %e, "Install failed");
                self.set_state(&mut versions, &mut worker, WorkerState::Redundant);
                self.emit(RegistrationEvent::InstallFailed {
                    worker_id: id,
                    error: e.to_string(),
                });
                return Err(e);
            }

            self.set_state(&mut versions, &mut worker, WorkerState::Installed);
            if let Some(mut previous) = versions.waiting.take() {
                self.set_state(&mut versions, &mut previous, WorkerState::Redundant);
            }
            versions.waiting = Some(worker);
            script.context().skip_waiting_requested() || versions.active.is_none()
        };

        if activate_now {
            self.activate_waiting().await?;
        }
        Ok(id)
    }

    /// Install with retries, evaluating a fresh script for each attempt.
    pub async fn install_with_retry<F>(
        &self,
        config: &RetryConfig,
        mut evaluate: F,
    ) -> SwResult<WorkerId>
    where
        F: FnMut() -> SwResult<Arc<dyn WorkerScript>>,
    {
        retry_with_backoff(config, |attempt| {
            let script = evaluate();
            async move {
                debug!(attempt, "Install attempt");
                self.install(script?).await
            }
        })
        .await
    }

    /// Activate the waiting version, if any.
    ///
    /// The previous active version becomes redundant. Activation errors are
    /// logged; the version still becomes active.
    pub async fn activate_waiting(&self) -> SwResult<Option<WorkerId>> {
        let mut worker = {
            let mut versions = self.versions.lock().await;
            let Some(mut worker) = versions.waiting.take() else {
                return Ok(None);
            };
            self.set_state(&mut versions, &mut worker, WorkerState::Activating);
            if let Some(mut old) = versions.active.take() {
                self.set_state(&mut versions, &mut old, WorkerState::Redundant);
            }
            worker
        };

        let before: HashMap<String, Option<WorkerId>> = self
            .clients
            .read()
            .await
            .in_scope(&self.scope)
            .into_iter()
            .map(|c| (c.id.clone(), c.controller))
            .collect();

        if let Err(e) = worker.script.dispatcher().activate().await {
            warn!(worker = %worker.id, error = %e, "Activate handler failed");
        }

        let id = worker.id;
        {
            let mut versions = self.versions.lock().await;
            self.set_state(&mut versions, &mut worker, WorkerState::Activated);
            versions.active = Some(worker);
        }

        for client in self.clients.read().await.controlled_by(id) {
            if before.get(&client.id).copied().flatten() != Some(id) {
                self.emit(RegistrationEvent::ControllerChange {
                    client_id: client.id.clone(),
                    worker_id: id,
                });
            }
        }

        info!(worker = %id, scope = %self.scope, "Worker activated");
        Ok(Some(id))
    }

    async fn active_script(&self) -> SwResult<Arc<dyn WorkerScript>> {
        self.versions
            .lock()
            .await
            .active
            .as_ref()
            .map(|w| w.script.clone())
            .ok_or_else(|| SwError::StateError(format!("no active worker for {}", self.scope)))
    }

    /// Deliver a fetch to the active version.
    ///
    /// Without `respond_with` the request goes straight to the network. A
    /// failed `respond_with` yields a network-error response.
    pub async fn handle_fetch(&self, request: Request) -> SwResult<Response> {
        let script = self.active_script().await?;
        match script.dispatcher().fetch(request.clone()).await {
            Ok(Some(response)) => Ok(response),
            Ok(None) => Ok(script.context().fetcher().fetch(request).await?),
            Err(e) => {
                warn!(url = %request.url, error = %e, "respond_with rejected");
                Ok(Response::error())
            }
        }
    }

    /// Deliver a push message to the active version.
    pub async fn push(&self, data: Option<String>) -> SwResult<()> {
        self.active_script().await?.dispatcher().push(data).await
    }

    pub async fn active(&self) -> Option<WorkerId> {
        self.versions.lock().await.active.as_ref().map(|w| w.id)
    }

    pub async fn waiting(&self) -> Option<WorkerId> {
        self.versions.lock().await.waiting.as_ref().map(|w| w.id)
    }

    pub async fn installing(&self) -> Option<WorkerId> {
        self.versions.lock().await.installing.as_ref().map(|w| w.id)
    }

    /// Last known state of any version this registration has seen.
    pub async fn state_of(&self, id: WorkerId) -> Option<WorkerState> {
        self.versions.lock().await.states.get(&id).copied()
    }

    /// Make every version redundant.
    pub async fn unregister(&self) {
        let mut versions = self.versions.lock().await;
        for mut worker in [
            versions.installing.take(),
            versions.waiting.take(),
            versions.active.take(),
        ]
        .into_iter()
        .flatten()
        {
            self.set_state(&mut versions, &mut worker, WorkerState::Redundant);
        }
        info!(scope = %self.scope, "Registration removed");
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("scope", &self.scope.as_str())
            .finish_non_exhaustive()
    }
}
