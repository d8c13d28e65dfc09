//! Precache: a versioned manifest of build assets stored at install time.
//!
//! Each manifest entry maps to a cache key. With a revision the key carries a
//! `__WB_REVISION__` query parameter, so a changed revision yields a new key
//! while an unchanged one is found already cached and is not fetched again.
//!
//! Install is all-or-nothing: responses are staged and committed in a single
//! batch only after every fetch succeeded. Activation removes keys that no
//! longer belong to the manifest.

use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::future::join_all;
use hashbrown::{HashMap, HashSet};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use swkit_common::ResultExt;
use swkit_net::{cache_key, Request, Response};
use tracing::{debug, info, warn};
use url::Url;

use crate::context::WorkerContext;
use crate::error::{SwError, SwResult};

/// Query parameter carrying an entry's revision in its cache key.
pub const REVISION_PARAM: &str = "__WB_REVISION__";

/// One asset in the precache manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawEntry")]
pub struct PrecacheEntry {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub integrity: Option<String>,
}

impl PrecacheEntry {
    pub fn new(url: impl Into<String>, revision: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            revision: Some(revision.into()),
            integrity: None,
        }
    }

    /// An entry whose URL already carries a content hash.
    pub fn unversioned(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            revision: None,
            integrity: None,
        }
    }

    pub fn with_integrity(mut self, integrity: impl Into<String>) -> Self {
        self.integrity = Some(integrity.into());
        self
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawEntry {
    Url(String),
    Entry {
        url: String,
        #[serde(default)]
        revision: Option<String>,
        #[serde(default)]
        integrity: Option<String>,
    },
}

impl From<RawEntry> for PrecacheEntry {
    fn from(raw: RawEntry) -> Self {
        match raw {
            RawEntry::Url(url) => PrecacheEntry::unversioned(url),
            RawEntry::Entry {
                url,
                revision,
                integrity,
            } => PrecacheEntry {
                url,
                revision,
                integrity,
            },
        }
    }
}

/// The build-time list of precached assets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<PrecacheEntry>", into = "Vec<PrecacheEntry>")]
pub struct PrecacheManifest {
    entries: Vec<PrecacheEntry>,
}

impl TryFrom<Vec<PrecacheEntry>> for PrecacheManifest {
    type Error = SwError;

    fn try_from(entries: Vec<PrecacheEntry>) -> SwResult<Self> {
        Self::new(entries)
    }
}

impl From<PrecacheManifest> for Vec<PrecacheEntry> {
    fn from(manifest: PrecacheManifest) -> Self {
        manifest.entries
    }
}

impl PrecacheManifest {
    /// Build a manifest, dropping exact duplicates.
    ///
    /// The same URL listed with two different revisions is rejected.
    pub fn new(entries: Vec<PrecacheEntry>) -> SwResult<Self> {
        let mut seen: HashMap<String, Option<String>> = HashMap::new();
        let mut unique = Vec::with_capacity(entries.len());

        for entry in entries {
            match seen.get(&entry.url) {
                Some(revision) if *revision == entry.revision => continue,
                Some(revision) => {
                    return Err(SwError::Precache(format!(
                        "{} listed with conflicting revisions {:?} and {:?}",
                        entry.url, revision, entry.revision
                    )))
                }
                None => {
                    seen.insert(entry.url.clone(), entry.revision.clone());
                    unique.push(entry);
                }
            }
        }

        Ok(Self { entries: unique })
    }

    pub fn from_json(json: &str) -> SwResult<Self> {
        let entries: Vec<PrecacheEntry> =
            serde_json::from_str(json).context("Failed to parse precache manifest")?;
        Self::new(entries)
    }

    pub fn from_file(path: impl AsRef<Path>) -> SwResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .context(format!("Failed to read precache manifest {}", path.display()))?;
        Self::from_json(&json)
    }

    pub fn entries(&self) -> &[PrecacheEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Outcome of a successful install.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallReport {
    /// Keys fetched and stored by this install.
    pub updated: Vec<Url>,
    /// Keys already cached with the same revision.
    pub not_updated: Vec<Url>,
}

#[derive(Debug, Clone)]
struct ResolvedEntry {
    /// Where to fetch the asset.
    url: Url,
    /// Key the response is stored under.
    key: Url,
    integrity: Option<String>,
}

/// Owns the precache: install, cleanup, and lookup.
#[derive(Debug)]
pub struct PrecacheController {
    cache_name: String,
    entries: Vec<ResolvedEntry>,
    /// Asset URL (no fragment, no revision) to cache key.
    keys_by_url: HashMap<String, Url>,
}

impl PrecacheController {
    /// Resolve `manifest` against `scope`.
    pub fn new(
        cache_name: impl Into<String>,
        scope: &Url,
        manifest: &PrecacheManifest,
    ) -> SwResult<Self> {
        let mut entries = Vec::with_capacity(manifest.len());
        let mut keys_by_url = HashMap::with_capacity(manifest.len());

        for entry in manifest.entries() {
            let url = scope
                .join(&entry.url)
                .map(|u| cache_key(&u))
                .map_err(|e| SwError::Precache(format!("invalid URL {}: {e}", entry.url)))?;

            let mut key = url.clone();
            if let Some(revision) = &entry.revision {
                key.query_pairs_mut().append_pair(REVISION_PARAM, revision);
            }

            keys_by_url.insert(url.to_string(), key.clone());
            entries.push(ResolvedEntry {
                url,
                key,
                integrity: entry.integrity.clone(),
            });
        }

        Ok(Self {
            cache_name: cache_name.into(),
            entries,
            keys_by_url,
        })
    }

    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    /// All cache keys of the current manifest.
    pub fn cache_keys(&self) -> Vec<Url> {
        self.entries.iter().map(|e| e.key.clone()).collect()
    }

    /// Cache key for an exact asset URL.
    pub fn cache_key_for(&self, url: &Url) -> Option<&Url> {
        self.keys_by_url.get(cache_key(url).as_str())
    }

    /// Cache key for a request URL or one of its variations.
    pub fn lookup_key(&self, url: &Url) -> Option<&Url> {
        url_variations(url)
            .iter()
            .find_map(|candidate| self.keys_by_url.get(candidate.as_str()))
    }

    /// Whether `url` (or a variation of it) is precached.
    pub fn is_precached(&self, url: &Url) -> bool {
        self.lookup_key(url).is_some()
    }

    /// Fetch and store every entry not already cached.
    ///
    /// Any failed fetch, error status, or integrity mismatch fails the whole
    /// install and nothing from this attempt is stored.
    pub async fn install(&self, ctx: &WorkerContext) -> SwResult<InstallReport> {
        let cached: HashSet<Url> = ctx
            .caches()
            .keys(&self.cache_name)
            .await?
            .into_iter()
            .collect();

        let (present, missing): (Vec<_>, Vec<_>) =
            self.entries.iter().partition(|e| cached.contains(&e.key));

        info!(
            cache = %self.cache_name,
            to_fetch = missing.len(),
            cached = present.len(),
            "Installing precache"
        );

        let results = join_all(missing.iter().map(|entry| self.fetch_entry(ctx, entry))).await;

        let mut staged = Vec::with_capacity(results.len());
        let mut first_error = None;
        for result in results {
            match result {
                Ok(item) => staged.push(item),
                Err(e) => {
                    warn!(error = %e, "Precache fetch failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        let updated: Vec<Url> = staged.iter().map(|(key, _)| key.clone()).collect();
        if !staged.is_empty() {
            ctx.caches().put_all(&self.cache_name, staged).await?;
        }

        info!(cache = %self.cache_name, updated = updated.len(), "Precache installed");
        Ok(InstallReport {
            updated,
            not_updated: present.into_iter().map(|e| e.key.clone()).collect(),
        })
    }

    async fn fetch_entry(
        &self,
        ctx: &WorkerContext,
        entry: &ResolvedEntry,
    ) -> SwResult<(Url, Response)> {
        debug!(url = %entry.url, key = %entry.key, "Precaching");
        let response = ctx
            .fetcher()
            .fetch(Request::get(entry.url.clone()))
            .await
            .map_err(|e| SwError::Precache(format!("{}: {e}", entry.url)))?;

        if response.is_error() || response.status >= 400 {
            return Err(SwError::BadPrecacheResponse {
                url: entry.url.to_string(),
                status: response.status,
            });
        }

        let response = response
            .buffered()
            .await
            .map_err(|e| SwError::Precache(format!("{}: {e}", entry.url)))?;

        if let Some(integrity) = &entry.integrity {
            let body = response.body.as_bytes().map(|b| b.as_ref()).unwrap_or_default();
            verify_integrity(integrity, body)
                .map_err(|reason| SwError::Integrity(format!("{}: {reason}", entry.url)))?;
        }

        Ok((entry.key.clone(), response))
    }

    /// Delete cached keys that are not in the current manifest.
    ///
    /// Returns the deleted keys.
    pub async fn activate(&self, ctx: &WorkerContext) -> SwResult<Vec<Url>> {
        let expected: HashSet<&Url> = self.entries.iter().map(|e| &e.key).collect();
        let mut deleted = Vec::new();

        for key in ctx.caches().keys(&self.cache_name).await? {
            if !expected.contains(&key) {
                ctx.caches().delete(&self.cache_name, &key).await?;
                deleted.push(key);
            }
        }

        if !deleted.is_empty() {
            info!(cache = %self.cache_name, deleted = deleted.len(), "Removed stale precache entries");
        }
        Ok(deleted)
    }

    /// Precached response for `request`, if any.
    pub async fn match_request(
        &self,
        ctx: &WorkerContext,
        request: &Request,
    ) -> SwResult<Option<Response>> {
        match self.lookup_key(&request.url) {
            Some(key) => ctx.caches().match_url(&self.cache_name, key).await,
            None => Ok(None),
        }
    }
}

fn is_ignored_param(name: &str) -> bool {
    name.starts_with("utm_") || name == "fbclid"
}

/// Candidate URLs a request may be precached under, most specific first.
pub fn url_variations(url: &Url) -> Vec<Url> {
    let plain = cache_key(url);
    let mut variations = vec![plain.clone()];

    let mut stripped = plain.clone();
    let kept: Vec<(String, String)> = plain
        .query_pairs()
        .filter(|(name, _)| !is_ignored_param(name))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        stripped.set_query(None);
    } else {
        stripped.query_pairs_mut().clear().extend_pairs(kept);
    }
    if stripped != plain {
        variations.push(stripped.clone());
    }

    let path = stripped.path().to_string();
    if path.ends_with('/') {
        let mut index = stripped.clone();
        index.set_path(&format!("{path}index.html"));
        variations.push(index);
    } else {
        let mut clean = stripped;
        clean.set_path(&format!("{path}.html"));
        variations.push(clean);
    }

    variations
}

/// Check `body` against an SRI string such as `sha256-<base64>`.
///
/// Several space-separated hashes may be given; one match is enough.
fn verify_integrity(integrity: &str, body: &[u8]) -> Result<(), String> {
    let digest = BASE64.encode(Sha256::digest(body));
    let mut supported = false;

    for token in integrity.split_whitespace() {
        let Some(expected) = token.strip_prefix("sha256-") else {
            continue;
        };
        supported = true;
        // Options after `?` are ignored.
        let expected = expected.split('?').next().unwrap_or_default();
        if expected == digest {
            return Ok(());
        }
    }

    if supported {
        Err(format!("expected {integrity}, got sha256-{digest}"))
    } else {
        Err(format!("no supported hash in {integrity:?}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockFetcher;
    use std::sync::Arc;

    const PRECACHE: &str = "precache-v2";

    fn scope() -> Url {
        Url::parse("https://app.test/").unwrap()
    }

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn manifest(entries: &[(&str, &str)]) -> PrecacheManifest {
        PrecacheManifest::new(
            entries
                .iter()
                .map(|(u, r)| PrecacheEntry::new(*u, *r))
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_manifest_accepts_strings_and_objects() {
        let m = PrecacheManifest::from_json(
            r#"["/app.4f2a.js", {"url": "/index.html", "revision": "abc"}]"#,
        )
        .unwrap();
        assert_eq!(m.len(), 2);
        assert_eq!(m.entries()[0], PrecacheEntry::unversioned("/app.4f2a.js"));
        assert_eq!(m.entries()[1].revision.as_deref(), Some("abc"));
    }

    #[test]
    fn test_manifest_rejects_conflicting_revisions() {
        let result = PrecacheManifest::new(vec![
            PrecacheEntry::new("/a.css", "1"),
            PrecacheEntry::new("/a.css", "2"),
        ]);
        assert!(matches!(result, Err(SwError::Precache(_))));

        let deduped = PrecacheManifest::new(vec![
            PrecacheEntry::new("/a.css", "1"),
            PrecacheEntry::new("/a.css", "1"),
        ])
        .unwrap();
        assert_eq!(deduped.len(), 1);
    }

    #[test]
    fn test_manifest_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        std::fs::write(&path, r#"[{"url": "/offline.html", "revision": "1"}]"#).unwrap();

        assert_eq!(PrecacheManifest::from_file(&path).unwrap().len(), 1);
        assert!(PrecacheManifest::from_file(dir.path().join("missing.json")).is_err());
    }

    #[test]
    fn test_cache_key_carries_revision() {
        let controller =
            PrecacheController::new(PRECACHE, &scope(), &manifest(&[("/styles/app.css", "r1")]))
                .unwrap();

        let key = controller
            .cache_key_for(&url("https://app.test/styles/app.css"))
            .unwrap();
        assert_eq!(
            key.as_str(),
            "https://app.test/styles/app.css?__WB_REVISION__=r1"
        );
    }

    #[test]
    fn test_url_variations() {
        let controller = PrecacheController::new(
            PRECACHE,
            &scope(),
            &manifest(&[("/index.html", "1"), ("/about.html", "1"), ("/docs/", "1")]),
        )
        .unwrap();

        assert!(controller.is_precached(&url("https://app.test/")));
        assert!(controller.is_precached(&url("https://app.test/about")));
        assert!(controller.is_precached(&url("https://app.test/about.html?utm_source=x")));
        assert!(controller.is_precached(&url("https://app.test/docs/#intro")));
        assert!(!controller.is_precached(&url("https://app.test/about.html?page=2")));
    }

    #[test]
    fn test_url_variations_keep_other_params() {
        let variations = url_variations(&url("https://app.test/a?utm_source=x&q=1&fbclid=y"));
        assert_eq!(variations[1].as_str(), "https://app.test/a?q=1");
    }

    #[tokio::test]
    async fn test_install_stores_all_entries() {
        let fetcher = Arc::new(MockFetcher::new());
        fetcher.respond("https://app.test/a.js", Response::new(200, "a"));
        fetcher.respond("https://app.test/b.css", Response::new(200, "b"));
        let ctx = WorkerContext::builder().fetcher(fetcher).build().unwrap();

        let controller = PrecacheController::new(
            PRECACHE,
            &scope(),
            &manifest(&[("/a.js", "1"), ("/b.css", "1")]),
        )
        .unwrap();
        let report = controller.install(&ctx).await.unwrap();

        assert_eq!(report.updated.len(), 2);
        let response = controller
            .match_request(&ctx, &Request::get(url("https://app.test/a.js")))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.text().unwrap(), "a");
    }

    #[tokio::test]
    async fn test_install_skips_unchanged_revisions() {
        let fetcher = Arc::new(MockFetcher::new());
        fetcher.respond("https://app.test/a.js", Response::new(200, "a"));
        let ctx = WorkerContext::builder()
            .fetcher(fetcher.clone())
            .build()
            .unwrap();
        let m = manifest(&[("/a.js", "1")]);

        PrecacheController::new(PRECACHE, &scope(), &m)
            .unwrap()
            .install(&ctx)
            .await
            .unwrap();
        let report = PrecacheController::new(PRECACHE, &scope(), &m)
            .unwrap()
            .install(&ctx)
            .await
            .unwrap();

        assert!(report.updated.is_empty());
        assert_eq!(report.not_updated.len(), 1);
        assert_eq!(fetcher.request_count(), 1);
    }

    #[tokio::test]
    async fn test_install_rejects_error_status() {
        let fetcher = Arc::new(MockFetcher::new());
        fetcher.respond("https://app.test/a.js", Response::new(500, ""));
        let ctx = WorkerContext::builder().fetcher(fetcher).build().unwrap();

        let controller =
            PrecacheController::new(PRECACHE, &scope(), &manifest(&[("/a.js", "1")])).unwrap();
        let result = controller.install(&ctx).await;

        assert!(matches!(
            result,
            Err(SwError::BadPrecacheResponse { status: 500, .. })
        ));
        assert!(ctx.caches().keys(PRECACHE).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_install_checks_integrity() {
        let fetcher = Arc::new(MockFetcher::new());
        fetcher.respond("https://app.test/a.js", Response::new(200, "tampered"));
        let ctx = WorkerContext::builder().fetcher(fetcher).build().unwrap();

        let good = format!("sha256-{}", BASE64.encode(Sha256::digest(b"original")));
        let m = PrecacheManifest::new(vec![PrecacheEntry::new("/a.js", "1").with_integrity(good)])
            .unwrap();
        let controller = PrecacheController::new(PRECACHE, &scope(), &m).unwrap();

        assert!(matches!(
            controller.install(&ctx).await,
            Err(SwError::Integrity(_))
        ));
    }

    #[tokio::test]
    async fn test_install_buffers_streamed_body_before_integrity() {
        let fetcher = Arc::new(MockFetcher::new());
        let (tx, rx) = tokio::sync::mpsc::channel(4);
        tx.send(Ok(bytes::Bytes::from("orig"))).await.unwrap();
        tx.send(Ok(bytes::Bytes::from("inal"))).await.unwrap();
        drop(tx);
        fetcher.respond("https://app.test/a.js", Response::streaming(200, rx));
        let ctx = WorkerContext::builder().fetcher(fetcher).build().unwrap();

        let good = format!("sha256-{}", BASE64.encode(Sha256::digest(b"original")));
        let m = PrecacheManifest::new(vec![PrecacheEntry::new("/a.js", "1").with_integrity(good)])
            .unwrap();
        let controller = PrecacheController::new(PRECACHE, &scope(), &m).unwrap();
        controller.install(&ctx).await.unwrap();

        let request = Request::get(url("https://app.test/a.js"));
        let cached = controller.match_request(&ctx, &request).await.unwrap().unwrap();
        assert_eq!(cached.text().unwrap(), "original");
    }

    #[test]
    fn test_verify_integrity() {
        let digest = BASE64.encode(Sha256::digest(b"body"));
        assert!(verify_integrity(&format!("sha256-{digest}"), b"body").is_ok());
        assert!(verify_integrity(&format!("sha384-x sha256-{digest}"), b"body").is_ok());
        assert!(verify_integrity("sha256-AAAA", b"body").is_err());
        assert!(verify_integrity("md5-AAAA", b"body").is_err());
    }

    #[tokio::test]
    async fn test_activate_removes_stale_keys() {
        let fetcher = Arc::new(MockFetcher::new());
        fetcher.respond("https://app.test/a.js", Response::new(200, "a"));
        fetcher.respond("https://app.test/b.js", Response::new(200, "b"));
        let ctx = WorkerContext::builder().fetcher(fetcher).build().unwrap();

        let old = PrecacheController::new(
            PRECACHE,
            &scope(),
            &manifest(&[("/a.js", "1"), ("/b.js", "1")]),
        )
        .unwrap();
        old.install(&ctx).await.unwrap();

        let new = PrecacheController::new(PRECACHE, &scope(), &manifest(&[("/a.js", "2")]))
            .unwrap();
        new.install(&ctx).await.unwrap();
        let deleted = new.activate(&ctx).await.unwrap();

        assert_eq!(deleted.len(), 2);
        assert_eq!(
            ctx.caches().keys(PRECACHE).await.unwrap(),
            new.cache_keys()
        );
    }
}
