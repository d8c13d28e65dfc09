//! In-memory doubles for driving a worker without a network or a browser.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use hashbrown::{HashMap, HashSet};
use swkit_net::{cache_key, Fetcher, NetError, Request, Response};
use url::Url;

use crate::context::{Clock, Notifier};
use crate::error::SwResult;
use crate::push::NotificationOptions;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn key(url: &str) -> String {
    match Url::parse(url) {
        Ok(url) => cache_key(&url).into(),
        Err(_) => url.to_string(),
    }
}

/// Scripted [`Fetcher`].
///
/// Known URLs return their scripted response, unknown ones a 404. The whole
/// network can be switched off, and single URLs can be made to fail.
#[derive(Debug, Default)]
pub struct MockFetcher {
    responses: Mutex<HashMap<String, Response>>,
    failing: Mutex<HashSet<String>>,
    offline: AtomicBool,
    delay: Mutex<Duration>,
    requests: Mutex<Vec<Request>>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fetcher with the network switched off.
    pub fn offline() -> Self {
        let fetcher = Self::new();
        fetcher.set_offline(true);
        fetcher
    }

    /// Serve `response` for `url`.
    pub fn respond(&self, url: &str, response: Response) {
        lock(&self.failing).remove(&key(url));
        lock(&self.responses).insert(key(url), response);
    }

    /// Make fetches of `url` fail at the transport level.
    pub fn fail(&self, url: &str) {
        lock(&self.failing).insert(key(url));
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Delay every fetch by `delay`.
    pub fn set_delay(&self, delay: Duration) {
        *lock(&self.delay) = delay;
    }

    /// Every request seen so far, in order.
    pub fn requests(&self) -> Vec<Request> {
        lock(&self.requests).clone()
    }

    pub fn request_count(&self) -> usize {
        lock(&self.requests).len()
    }

    /// Number of requests seen for `url`.
    pub fn requests_for(&self, url: &str) -> usize {
        let key = key(url);
        lock(&self.requests)
            .iter()
            .filter(|r| r.cache_key().as_str() == key)
            .count()
    }
}

#[async_trait]
impl Fetcher for MockFetcher {
    async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        lock(&self.requests).push(request.clone());

        let delay = *lock(&self.delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self.offline.load(Ordering::SeqCst) {
            return Err(NetError::Offline(format!("offline: {}", request.url)));
        }

        let key = request.cache_key();
        if lock(&self.failing).contains(key.as_str()) {
            return Err(NetError::RequestFailed(format!("scripted failure: {key}")));
        }

        let scripted = lock(&self.responses).get(key.as_str()).cloned();
        Ok(scripted
            .unwrap_or_else(|| Response::new(404, "Not Found"))
            .with_url(request.url))
    }
}

/// [`Notifier`] that records every notification it is asked to show.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    shown: Mutex<Vec<(String, NotificationOptions)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shown(&self) -> Vec<(String, NotificationOptions)> {
        lock(&self.shown).clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn show_notification(&self, title: &str, options: &NotificationOptions) -> SwResult<()> {
        lock(&self.shown).push((title.to_string(), options.clone()));
        Ok(())
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(now_ms: u64) -> Self {
        Self {
            now: AtomicU64::new(now_ms),
        }
    }

    pub fn set(&self, now_ms: u64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.now
            .fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}
