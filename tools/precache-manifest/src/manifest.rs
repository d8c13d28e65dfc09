//! Manifest generation and injection.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use sha2::{Digest, Sha256};
use swkit_sw::{PrecacheEntry, PrecacheManifest, WorkerConfig};
use tracing::{debug, info};
use walkdir::WalkDir;

/// Hex digits of the SHA-256 kept as the revision.
pub const REVISION_LEN: usize = 16;

/// Options for [`generate`].
#[derive(Debug, Clone)]
pub struct GenerateOptions {
    /// Directory served at `prefix`.
    pub root: PathBuf,
    /// Glob patterns, relative to `root`.
    pub patterns: Vec<String>,
    /// URL prefix for every entry.
    pub prefix: String,
}

fn glob_set(patterns: &[String]) -> Result<GlobSet> {
    if patterns.is_empty() {
        bail!("at least one --pattern is required");
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).with_context(|| format!("invalid pattern {pattern:?}"))?;
        builder.add(glob);
    }
    Ok(builder.build()?)
}

/// Content revision of a file.
pub fn revision(bytes: &[u8]) -> String {
    let mut digest = hex::encode(Sha256::digest(bytes));
    digest.truncate(REVISION_LEN);
    digest
}

fn entry_url(prefix: &str, relative: &Path) -> String {
    let path = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    format!("{}/{}", prefix.trim_end_matches('/'), path)
}

/// Walk `options.root` and build a manifest of every matching file.
///
/// Entries are sorted by URL so the output is stable between builds.
pub fn generate(options: &GenerateOptions) -> Result<PrecacheManifest> {
    let globs = glob_set(&options.patterns)?;
    let mut entries = Vec::new();

    for item in WalkDir::new(&options.root).follow_links(true) {
        let item = item.with_context(|| format!("walking {}", options.root.display()))?;
        if !item.file_type().is_file() {
            continue;
        }
        let relative = item.path().strip_prefix(&options.root)?;
        if !globs.is_match(relative) {
            continue;
        }

        let bytes =
            fs::read(item.path()).with_context(|| format!("reading {}", item.path().display()))?;
        let url = entry_url(&options.prefix, relative);
        debug!(url = %url, size = bytes.len(), "Adding precache entry");
        entries.push(PrecacheEntry::new(url, revision(&bytes)));
    }

    entries.sort_by(|a, b| a.url.cmp(&b.url));
    info!(
        root = %options.root.display(),
        entries = entries.len(),
        "Generated precache manifest"
    );
    Ok(PrecacheManifest::new(entries)?)
}

/// Embed `manifest` into the worker config at `config_path`, in place.
pub fn inject(manifest: PrecacheManifest, config_path: &Path) -> Result<WorkerConfig> {
    let mut config = WorkerConfig::from_file(config_path)?;
    config.precache_manifest = manifest;
    config
        .validate()
        .with_context(|| format!("manifest does not fit {}", config_path.display()))?;

    fs::write(config_path, config.to_json()?)
        .with_context(|| format!("writing {}", config_path.display()))?;
    info!(
        config = %config_path.display(),
        entries = config.precache_manifest.len(),
        "Injected precache manifest"
    );
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("assets/img")).unwrap();
        fs::write(dir.path().join("index.html"), "<h1>closet</h1>").unwrap();
        fs::write(dir.path().join("assets/app.js"), "console.log(1)").unwrap();
        fs::write(dir.path().join("assets/app.css"), "body{}").unwrap();
        fs::write(dir.path().join("assets/img/logo.png"), [0u8, 1, 2]).unwrap();
        dir
    }

    fn options(root: &Path, patterns: &[&str]) -> GenerateOptions {
        GenerateOptions {
            root: root.to_path_buf(),
            patterns: patterns.iter().map(|p| p.to_string()).collect(),
            prefix: "/".to_string(),
        }
    }

    #[test]
    fn test_generate_filters_and_sorts() {
        let dir = site();
        let manifest = generate(&options(dir.path(), &["**/*.{js,css,html}"])).unwrap();

        let urls: Vec<_> = manifest.entries().iter().map(|e| e.url.as_str()).collect();
        assert_eq!(urls, vec!["/assets/app.css", "/assets/app.js", "/index.html"]);
        assert!(manifest
            .entries()
            .iter()
            .all(|e| e.revision.as_ref().map(String::len) == Some(REVISION_LEN)));
    }

    #[test]
    fn test_revision_tracks_content() {
        assert_eq!(revision(b"a"), revision(b"a"));
        assert_ne!(revision(b"a"), revision(b"b"));
    }

    #[test]
    fn test_prefix() {
        let dir = site();
        let mut opts = options(dir.path(), &["*.html"]);
        opts.prefix = "/static/".to_string();
        let manifest = generate(&opts).unwrap();
        assert_eq!(manifest.entries()[0].url, "/static/index.html");
    }

    #[test]
    fn test_invalid_pattern() {
        let dir = site();
        assert!(generate(&options(dir.path(), &["a{"])).is_err());
        assert!(generate(&options(dir.path(), &[])).is_err());
    }

    fn worker_config() -> WorkerConfig {
        WorkerConfig::from_json(r#"{"scope": "https://wardrobe.test/"}"#).unwrap()
    }

    #[test]
    fn test_inject_round_trip() {
        let dir = site();
        let config_path = dir.path().join("worker.json");
        fs::write(&config_path, worker_config().to_json().unwrap()).unwrap();

        let manifest = generate(&options(dir.path(), &["**/*.js"])).unwrap();
        inject(manifest.clone(), &config_path).unwrap();

        let config = WorkerConfig::from_file(&config_path).unwrap();
        assert_eq!(config.precache_manifest, manifest);
    }

    #[test]
    fn test_inject_rejects_stream_endpoint() {
        let dir = site();
        let config_path = dir.path().join("worker.json");
        fs::write(&config_path, worker_config().to_json().unwrap()).unwrap();

        let manifest = PrecacheManifest::new(vec![PrecacheEntry::new("/sse", "1")]).unwrap();
        assert!(inject(manifest, &config_path).is_err());
    }
}
