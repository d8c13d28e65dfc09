//! Clients API: pages a worker may control.

use hashbrown::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;
use url::Url;

use crate::lifecycle::WorkerId;

/// A client (open page or worker).
#[derive(Debug, Clone)]
pub struct Client {
    /// Client ID.
    pub id: String,

    /// Client URL.
    pub url: Url,

    /// Client type.
    pub client_type: ClientType,

    /// Worker currently controlling this client.
    pub controller: Option<WorkerId>,
}

/// Client type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientType {
    #[default]
    Window,
    Worker,
    SharedWorker,
}

/// Registry of open clients.
#[derive(Debug, Default)]
pub struct Clients {
    clients: HashMap<String, Client>,
}

impl Clients {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a client by ID.
    pub fn get(&self, id: &str) -> Option<&Client> {
        self.clients.get(id)
    }

    /// Open a window client at `url`, uncontrolled.
    pub fn open_window(&mut self, url: Url) -> Client {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        let id = format!("client-{}", COUNTER.fetch_add(1, Ordering::Relaxed));
        let client = Client {
            id: id.clone(),
            url,
            client_type: ClientType::Window,
            controller: None,
        };
        self.clients.insert(id, client.clone());
        client
    }

    /// Remove a client (tab closed).
    pub fn remove(&mut self, id: &str) -> Option<Client> {
        self.clients.remove(id)
    }

    /// Clients inside `scope`.
    pub fn in_scope(&self, scope: &Url) -> Vec<&Client> {
        self.clients
            .values()
            .filter(|c| c.url.as_str().starts_with(scope.as_str()))
            .collect()
    }

    /// Clients controlled by `worker`.
    pub fn controlled_by(&self, worker: WorkerId) -> Vec<&Client> {
        self.clients
            .values()
            .filter(|c| c.controller == Some(worker))
            .collect()
    }

    /// Make `worker` the controller of every client in `scope`.
    ///
    /// Returns the number of clients whose controller changed.
    pub fn claim(&mut self, worker: WorkerId, scope: &Url) -> usize {
        let mut claimed = 0;
        for client in self.clients.values_mut() {
            if client.url.as_str().starts_with(scope.as_str()) && client.controller != Some(worker)
            {
                client.controller = Some(worker);
                claimed += 1;
            }
        }
        debug!(?worker, scope = %scope, claimed, "Clients claimed");
        claimed
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
