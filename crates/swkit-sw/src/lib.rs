//! # swkit Service Worker
//!
//! An offline-capable service worker for a server-rendered web application.
//!
//! ## Features
//!
//! - **Strategies**: network-only, network-first with a timeout, precache lookup
//! - **Precache**: revisioned manifest, atomic install, cleanup on activate
//! - **Warm cache**: a fixed URL set fetched into the runtime cache on install
//! - **Offline fallback**: failed navigations get the offline page
//! - **Push**: JSON or plain-text payloads become notifications
//! - **Lifecycle**: install, activate, fetch and push events with
//!   `wait_until` / `respond_with`
//!
//! ## Architecture
//!
//! ```text
//! Registration (install / waiting / active)
//!     │
//!     └── OfflineWorker
//!             ├── EventDispatcher (install, activate, fetch, push)
//!             ├── PrecacheController ── CacheStorage ("…-precache-v2-<scope>")
//!             ├── CacheWarmer ───────── CacheStorage ("…-runtime-<scope>")
//!             └── Router
//!                     ├── Precached      → Precache
//!                     ├── stream paths   → NetworkOnly
//!                     ├── everything     → NetworkFirst
//!                     └── catch handler  → OfflineFallback
//! ```
//!
//! All network access goes through [`swkit_net::Fetcher`], so a worker can be
//! driven entirely in memory with the doubles in [`testing`].

pub mod cache;
pub mod clients;
pub mod config;
pub mod context;
pub mod error;
pub mod fallback;
pub mod lifecycle;
pub mod precache;
pub mod push;
pub mod registration;
pub mod router;
pub mod strategy;
pub mod testing;
pub mod warm;
pub mod worker;

pub use cache::{Cache, CacheStorage, MemoryCacheStorage};
pub use clients::{Client, ClientType, Clients};
pub use config::WorkerConfig;
pub use context::{Clock, Notifier, RegistrationInfo, SystemClock, WorkerContext};
pub use error::{SwError, SwResult};
pub use fallback::OfflineFallback;
pub use lifecycle::{
    EventDispatcher, EventKind, ExtendableEvent, FetchEvent, PushEvent, WorkerEvent, WorkerId,
    WorkerState,
};
pub use precache::{InstallReport, PrecacheController, PrecacheEntry, PrecacheManifest};
pub use push::{handle_push, DropReason, NotificationOptions, PushNotification, PushOutcome, PushPayload};
pub use registration::{Registration, RegistrationEvent, ServiceWorker, WorkerScript};
pub use router::{CatchHandler, Route, RouteMatcher, RouteOutcome, Router};
pub use strategy::{NetworkFirst, NetworkOnly, PrecacheLookup, Strategy};
pub use warm::{CacheWarmer, WarmReport};
pub use worker::OfflineWorker;
