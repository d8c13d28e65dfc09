//! Worker lifecycle: states, events, and the event dispatch table.
//!
//! Listeners are plain synchronous closures, as in a worker script: they
//! inspect the event and hand any asynchronous work to
//! [`ExtendableEvent::wait_until`] or [`FetchEvent::respond_with`]. The
//! dispatcher then settles the event by awaiting everything that was
//! registered.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use swkit_net::{Request, Response};
use tracing::{debug, trace};

use crate::error::{SwError, SwResult};

/// Unique identifier for a worker version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(u64);

impl WorkerId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sw-{}", self.0)
    }
}

/// Worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    /// Script evaluated, listeners registered.
    #[default]
    Parsed,
    /// Install event running.
    Installing,
    /// Installed and waiting for activation.
    Installed,
    /// Activate event running.
    Activating,
    /// Active and handling fetches.
    Activated,
    /// Install failed or replaced by a newer version.
    Redundant,
}

impl WorkerState {
    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self, next),
            (Parsed, Installing)
                | (Installing, Installed)
                | (Installed, Activating)
                | (Activating, Activated)
                | (_, Redundant)
        ) && self != Redundant
    }
}

/// Kinds of events a worker can listen for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Install,
    Activate,
    Fetch,
    Push,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// An event whose lifetime can be extended with `wait_until`.
///
/// Cloning shares the pending work list, so a listener can keep a handle.
#[derive(Clone, Default)]
pub struct ExtendableEvent {
    pending: Arc<Mutex<Vec<BoxFuture<'static, SwResult<()>>>>>,
}

impl ExtendableEvent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep the event alive until `work` completes.
    ///
    /// An error from `work` fails the event: a failed install makes the
    /// worker redundant.
    pub fn wait_until<F>(&self, work: F)
    where
        F: std::future::Future<Output = SwResult<()>> + Send + 'static,
    {
        lock(&self.pending).push(work.boxed());
    }

    /// Number of registered lifetime extensions not yet settled.
    pub fn pending(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Await every registered extension; returns the first error.
    ///
    /// Work registered while settling is awaited too.
    pub async fn settle(&self) -> SwResult<()> {
        let mut first_error = None;
        loop {
            let batch: Vec<_> = lock(&self.pending).drain(..).collect();
            if batch.is_empty() {
                break;
            }
            trace!(count = batch.len(), "Settling extended lifetimes");
            for result in join_all(batch).await {
                if let Err(e) = result {
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for ExtendableEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtendableEvent")
            .field("pending", &self.pending())
            .finish()
    }
}

/// A fetch intercepted by the worker.
#[derive(Clone)]
pub struct FetchEvent {
    request: Request,
    extend: ExtendableEvent,
    response: Arc<Mutex<Option<BoxFuture<'static, SwResult<Response>>>>>,
}

impl FetchEvent {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            extend: ExtendableEvent::new(),
            response: Arc::new(Mutex::new(None)),
        }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    /// The lifetime-extension half of the event.
    pub fn extendable(&self) -> &ExtendableEvent {
        &self.extend
    }

    /// Provide the response for this request.
    ///
    /// Only the first call counts; later calls fail.
    pub fn respond_with<F>(&self, response: F) -> SwResult<()>
    where
        F: std::future::Future<Output = SwResult<Response>> + Send + 'static,
    {
        let mut slot = lock(&self.response);
        if slot.is_some() {
            return Err(SwError::StateError(format!(
                "respond_with already called for {}",
                self.request.url
            )));
        }
        *slot = Some(response.boxed());
        Ok(())
    }

    /// Whether a listener called `respond_with`.
    pub fn has_response(&self) -> bool {
        lock(&self.response).is_some()
    }

    fn take_response(&self) -> Option<BoxFuture<'static, SwResult<Response>>> {
        lock(&self.response).take()
    }
}

impl fmt::Debug for FetchEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchEvent")
            .field("url", &self.request.url.as_str())
            .field("has_response", &self.has_response())
            .finish()
    }
}

/// A push message delivered to the worker.
#[derive(Clone, Debug)]
pub struct PushEvent {
    data: Option<String>,
    extend: ExtendableEvent,
}

impl PushEvent {
    pub fn new(data: Option<String>) -> Self {
        Self {
            data,
            extend: ExtendableEvent::new(),
        }
    }

    /// Payload text, if the message carried one.
    pub fn data(&self) -> Option<&str> {
        self.data.as_deref()
    }

    pub fn extendable(&self) -> &ExtendableEvent {
        &self.extend
    }
}

/// An event delivered to worker listeners.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Install(ExtendableEvent),
    Activate(ExtendableEvent),
    Fetch(FetchEvent),
    Push(PushEvent),
}

impl WorkerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            WorkerEvent::Install(_) => EventKind::Install,
            WorkerEvent::Activate(_) => EventKind::Activate,
            WorkerEvent::Fetch(_) => EventKind::Fetch,
            WorkerEvent::Push(_) => EventKind::Push,
        }
    }

    fn extendable(&self) -> &ExtendableEvent {
        match self {
            WorkerEvent::Install(e) | WorkerEvent::Activate(e) => e,
            WorkerEvent::Fetch(e) => e.extendable(),
            WorkerEvent::Push(e) => e.extendable(),
        }
    }
}

/// An event listener.
pub type Listener = Arc<dyn Fn(&WorkerEvent) + Send + Sync>;

/// Table of listeners keyed by event kind.
#[derive(Clone, Default)]
pub struct EventDispatcher {
    listeners: HashMap<EventKind, Vec<Listener>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a listener for `kind`. Listeners run in registration order.
    pub fn add_listener(&mut self, kind: EventKind, listener: Listener) {
        self.listeners.entry(kind).or_default().push(listener);
    }

    pub fn on_install<F>(&mut self, f: F)
    where
        F: Fn(&ExtendableEvent) + Send + Sync + 'static,
    {
        self.add_listener(
            EventKind::Install,
            Arc::new(move |event: &WorkerEvent| {
                if let WorkerEvent::Install(e) = event {
                    f(e)
                }
            }),
        );
    }

    pub fn on_activate<F>(&mut self, f: F)
    where
        F: Fn(&ExtendableEvent) + Send + Sync + 'static,
    {
        self.add_listener(
            EventKind::Activate,
            Arc::new(move |event: &WorkerEvent| {
                if let WorkerEvent::Activate(e) = event {
                    f(e)
                }
            }),
        );
    }

    pub fn on_fetch<F>(&mut self, f: F)
    where
        F: Fn(&FetchEvent) + Send + Sync + 'static,
    {
        self.add_listener(
            EventKind::Fetch,
            Arc::new(move |event: &WorkerEvent| {
                if let WorkerEvent::Fetch(e) = event {
                    f(e)
                }
            }),
        );
    }

    pub fn on_push<F>(&mut self, f: F)
    where
        F: Fn(&PushEvent) + Send + Sync + 'static,
    {
        self.add_listener(
            EventKind::Push,
            Arc::new(move |event: &WorkerEvent| {
                if let WorkerEvent::Push(e) = event {
                    f(e)
                }
            }),
        );
    }

    /// Number of listeners registered for `kind`.
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners.get(&kind).map(Vec::len).unwrap_or(0)
    }

    /// Run every listener for the event's kind, without settling it.
    pub fn dispatch(&self, event: &WorkerEvent) {
        let kind = event.kind();
        let listeners = self.listeners.get(&kind).map(Vec::as_slice).unwrap_or(&[]);
        debug!(?kind, listeners = listeners.len(), "Dispatching event");
        for listener in listeners {
            listener(event);
        }
    }

    /// Dispatch an event and await its extended lifetime.
    pub async fn dispatch_and_settle(&self, event: WorkerEvent) -> SwResult<()> {
        self.dispatch(&event);
        event.extendable().settle().await
    }

    /// Dispatch the install event.
    pub async fn install(&self) -> SwResult<()> {
        self.dispatch_and_settle(WorkerEvent::Install(ExtendableEvent::new()))
            .await
    }

    /// Dispatch the activate event.
    pub async fn activate(&self) -> SwResult<()> {
        self.dispatch_and_settle(WorkerEvent::Activate(ExtendableEvent::new()))
            .await
    }

    /// Dispatch a push event.
    pub async fn push(&self, data: Option<String>) -> SwResult<()> {
        self.dispatch_and_settle(WorkerEvent::Push(PushEvent::new(data)))
            .await
    }

    /// Dispatch a fetch event.
    ///
    /// Returns `Ok(None)` when no listener called `respond_with`; the
    /// request then goes to the network as if no worker were installed.
    pub async fn fetch(&self, request: Request) -> SwResult<Option<Response>> {
        let event = FetchEvent::new(request);
        self.dispatch(&WorkerEvent::Fetch(event.clone()));

        let response = match event.take_response() {
            Some(response) => Some(response.await?),
            None => None,
        };
        event.extendable().settle().await?;
        Ok(response)
    }
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut counts: Vec<_> = self
            .listeners
            .iter()
            .map(|(kind, l)| (*kind, l.len()))
            .collect();
        counts.sort_by_key(|(kind, _)| *kind as u8);
        f.debug_struct("EventDispatcher")
            .field("listeners", &counts)
            .finish()
    }
}
