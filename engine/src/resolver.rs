//! Resolution orchestrator
//!
//! Turns a registry entry into the path of a runnable executable:
//!
//! - local entries resolve to the bundled file under the plugin root;
//! - remote entries resolve through the verified cache, downloading and
//!   verifying on a miss.
//!
//! A stale auto-update record is returned immediately while a refresh runs
//! in the background. Refresh failures never fail a resolution.

use registry::fetcher::Fetcher;
use registry::verifier;
use sdk::entry::{EntrySource, RegistryEntry, RemoteSource};
use sdk::errors::{ResolveError, Stage};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::cache::{CacheKey, CacheManager, CacheRecord};
use crate::platform::{expand, PlatformTarget};

/// Consecutive refresh failures after which each further one is an error
pub const REFRESH_FAILURE_WARN_THRESHOLD: u32 = 3;

/// How long a cache miss may wait for its download by default
pub const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(120);

/// Resolves registry entries to executable paths
pub struct Resolver {
    cache: Arc<CacheManager>,
    fetcher: Arc<dyn Fetcher>,
    target: PlatformTarget,
    plugin_root: PathBuf,
    download_timeout: Duration,
}

impl Resolver {
    pub fn new(
        cache: Arc<CacheManager>,
        fetcher: Arc<dyn Fetcher>,
        target: PlatformTarget,
        plugin_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            cache,
            fetcher,
            target,
            plugin_root: plugin_root.into(),
            download_timeout: DEFAULT_DOWNLOAD_TIMEOUT,
        }
    }

    pub fn with_download_timeout(mut self, timeout: Duration) -> Self {
        self.download_timeout = timeout;
        self
    }

    pub fn target(&self) -> PlatformTarget {
        self.target
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    pub fn plugin_root(&self) -> &Path {
        &self.plugin_root
    }

    /// Resolve `entry` to an executable path
    ///
    /// # Errors
    ///
    /// - `PluginNotFound` if a bundled executable is missing
    /// - `TemplateExpansion` if the download URL cannot be built
    /// - `DownloadFailed` if a cache miss cannot be downloaded in time
    /// - `ChecksumMismatch` if downloaded bytes do not match the registry
    /// - `CacheWrite` if verified bytes cannot be stored
    pub async fn resolve(&self, entry: &RegistryEntry) -> Result<PathBuf, ResolveError> {
        self.resolve_with_timeout(entry, self.download_timeout).await
    }

    /// Resolve `entry`, waiting at most `timeout` for a cache miss download
    pub async fn resolve_with_timeout(
        &self,
        entry: &RegistryEntry,
        timeout: Duration,
    ) -> Result<PathBuf, ResolveError> {
        match &entry.source {
            EntrySource::Local { path } => self.resolve_local(&entry.name, path),
            EntrySource::Remote(remote) => self.resolve_remote(entry, remote, timeout).await,
        }
    }

    fn resolve_local(&self, name: &str, path: &str) -> Result<PathBuf, ResolveError> {
        let full = self
            .plugin_root
            .join(format!("{}{}", path, self.target.executable_suffix()));

        if !is_executable(&full) {
            return Err(ResolveError::PluginNotFound {
                plugin: name.to_string(),
                path: full,
            });
        }

        debug!(plugin = name, path = %full.display(), "Resolved bundled plugin");
        Ok(full)
    }

    async fn resolve_remote(
        &self,
        entry: &RegistryEntry,
        remote: &RemoteSource,
        timeout: Duration,
    ) -> Result<PathBuf, ResolveError> {
        let key = CacheKey::new(&entry.name, &entry.version, self.target);

        if let Some(record) = cached(&self.cache, &key, &remote.checksum).await {
            if !self.cache.is_stale(&record, remote.auto_update) {
                debug!(plugin = %entry.name, version = %entry.version, "Cache hit");
            } else if self.cache.refresh_backing_off(&key) {
                debug!(plugin = %entry.name, version = %entry.version, "Cached binary is stale, refresh backing off after failure");
            } else {
                info!(plugin = %entry.name, version = %entry.version, "Cached binary is stale, refreshing in background");
                self.start_refresh(&key, remote);
            }
            return Ok(record.local_path);
        }

        let url = expand(&entry.name, &remote.download_url, &entry.version, self.target)?;
        let deadline = tokio::time::Instant::now() + timeout;

        let record = self.await_download(&key, &url, remote, deadline, timeout).await?;
        if record.matches(&remote.checksum) {
            return Ok(record.local_path);
        }

        // Joined a download started for an earlier checksum of this version
        debug!(plugin = %entry.name, "Joined download was for a different checksum, downloading again");
        let record = self.await_download(&key, &url, remote, deadline, timeout).await?;
        if record.matches(&remote.checksum) {
            Ok(record.local_path)
        } else {
            Err(ResolveError::ChecksumMismatch {
                plugin: entry.name.clone(),
                expected: remote.checksum.clone(),
                actual: record.checksum,
            })
        }
    }

    async fn await_download(
        &self,
        key: &CacheKey,
        url: &str,
        remote: &RemoteSource,
        deadline: tokio::time::Instant,
        timeout: Duration,
    ) -> Result<CacheRecord, ResolveError> {
        let work = self.download_and_store(key.clone(), url.to_string(), remote.checksum.clone(), true);
        let flight = self.cache.fetch_once(key, work);
        if flight.joined {
            debug!(plugin = %key.name, "Waiting for download already in progress");
        }

        match tokio::time::timeout_at(deadline, flight.future).await {
            Ok(result) => result,
            Err(_) => {
                warn!(plugin = %key.name, timeout_secs = timeout.as_secs_f64(), "Download timed out");
                Err(ResolveError::DownloadFailed {
                    plugin: key.name.clone(),
                    stage: Stage::Download,
                    reason: format!("timed out after {:?}", timeout),
                })
            }
        }
    }

    /// Refresh a stale record without blocking the caller
    ///
    /// The existing record stays in place until the replacement has been
    /// verified and stored. Failures are logged, never returned.
    fn start_refresh(&self, key: &CacheKey, remote: &RemoteSource) {
        let url = match expand(&key.name, &remote.download_url, &key.version, self.target) {
            Ok(url) => url,
            Err(e) => {
                log_refresh_failure(&self.cache, key, &e);
                return;
            }
        };

        let cache = Arc::clone(&self.cache);
        let observed = key.clone();
        let work = self.download_and_store(key.clone(), url, remote.checksum.clone(), false);
        let flight = self.cache.fetch_once(key, async move {
            let result = work.await.map_err(ResolveError::during_refresh);
            match &result {
                Ok(record) => {
                    cache.clear_refresh_failures(&observed);
                    info!(key = %observed, path = %record.local_path.display(), "Refreshed cached binary");
                }
                Err(e) => log_refresh_failure(&cache, &observed, e),
            }
            result
        });

        if flight.joined {
            debug!(%key, "Refresh already in progress");
        }
    }

    /// Download, verify and store one binary
    ///
    /// Bytes are only ever written to the cache after they match `checksum`.
    fn download_and_store(
        &self,
        key: CacheKey,
        url: String,
        checksum: String,
        recheck: bool,
    ) -> impl Future<Output = Result<CacheRecord, ResolveError>> + Send + 'static {
        let cache = Arc::clone(&self.cache);
        let fetcher = Arc::clone(&self.fetcher);

        async move {
            // Another task may have stored this key while we were queued
            if recheck {
                if let Some(record) = cached(&cache, &key, &checksum).await {
                    return Ok(record);
                }
            }

            info!(plugin = %key.name, version = %key.version, os = %key.os, arch = %key.arch, %url, "Downloading plugin binary");
            let bytes = fetcher.fetch(&key.name, &url).await?;

            let trust = verifier::verify(&bytes, &checksum);
            if !trust.matched {
                error!(
                    plugin = %key.name,
                    version = %key.version,
                    expected = %trust.expected,
                    actual = %trust.actual,
                    "Checksum mismatch, discarding download"
                );
            }
            trust.into_result(&key.name)?;

            let plugin = key.name.clone();
            tokio::task::spawn_blocking(move || cache.store(&key, &bytes, true))
                .await
                .map_err(|e| ResolveError::cache_write(plugin, e))?
        }
    }
}

/// Look up a record for `key` that still matches `checksum`, hashing off the runtime
async fn cached(cache: &Arc<CacheManager>, key: &CacheKey, checksum: &str) -> Option<CacheRecord> {
    let (cache, key, checksum) = (Arc::clone(cache), key.clone(), checksum.to_string());
    tokio::task::spawn_blocking(move || cache.lookup_verified(&key, &checksum))
        .await
        .unwrap_or_else(|e| {
            warn!("Cache lookup task failed: {}", e);
            None
        })
}

fn log_refresh_failure(cache: &CacheManager, key: &CacheKey, error: &ResolveError) {
    let failures = cache.record_refresh_failure(key);
    if failures >= REFRESH_FAILURE_WARN_THRESHOLD {
        error!(%key, failures, "Refresh keeps failing, still serving cached binary: {}", error);
    } else {
        warn!(%key, failures, "Refresh failed, serving cached binary: {}", error);
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{Arch, Os};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const LINUX: PlatformTarget = PlatformTarget::new(Os::Linux, Arch::Amd64);
    const WINDOWS: PlatformTarget = PlatformTarget::new(Os::Windows, Arch::Amd64);

    /// Serves fixed bytes and records every requested URL
    struct StaticFetcher {
        body: Mutex<Result<Vec<u8>, String>>,
        delay: Duration,
        urls: Mutex<Vec<String>>,
        calls: AtomicUsize,
    }

    impl StaticFetcher {
        fn new(body: &[u8]) -> Arc<Self> {
            Self::with_delay(body, Duration::ZERO)
        }

        fn with_delay(body: &[u8], delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                body: Mutex::new(Ok(body.to_vec())),
                delay,
                urls: Mutex::new(Vec::new()),
                calls: AtomicUsize::new(0),
            })
        }

        fn fail_with(&self, reason: &str) {
            *self.body.lock().unwrap() = Err(reason.to_string());
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Fetcher for StaticFetcher {
        async fn fetch(&self, plugin: &str, url: &str) -> Result<Vec<u8>, ResolveError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.urls.lock().unwrap().push(url.to_string());
            tokio::time::sleep(self.delay).await;
            self.body
                .lock()
                .unwrap()
                .clone()
                .map_err(|reason| ResolveError::download(plugin, reason))
        }
    }

    fn remote_entry(bytes: &[u8], auto_update: bool) -> RegistryEntry {
        RegistryEntry {
            name: "tool".to_string(),
            description: String::new(),
            version: "2.1.0".to_string(),
            source: EntrySource::Remote(RemoteSource {
                download_url: "https://x/v{version}/tool-{os}-{arch}".to_string(),
                checksum: verifier::compute_hash(bytes),
                auto_update,
                github_repo: None,
            }),
        }
    }

    fn resolver(
        dir: &tempfile::TempDir,
        fetcher: Arc<StaticFetcher>,
        target: PlatformTarget,
    ) -> Resolver {
        let cache = Arc::new(CacheManager::open(dir.path().join("cache")).unwrap());
        Resolver::new(cache, fetcher, target, dir.path().join("bundled"))
    }

    #[tokio::test]
    async fn test_miss_downloads_verifies_and_caches() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = StaticFetcher::new(b"binary B");
        let resolver = resolver(&dir, Arc::clone(&fetcher), WINDOWS);

        let path = resolver.resolve(&remote_entry(b"binary B", false)).await.unwrap();

        assert!(path.to_string_lossy().ends_with(".exe"));
        assert_eq!(std::fs::read(&path).unwrap(), b"binary B");
        assert_eq!(
            fetcher.urls.lock().unwrap().as_slice(),
            ["https://x/v2.1.0/tool-windows-amd64"]
        );
    }

    #[tokio::test]
    async fn test_second_resolve_is_cache_hit() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = StaticFetcher::new(b"binary");
        let resolver = resolver(&dir, Arc::clone(&fetcher), LINUX);
        let entry = remote_entry(b"binary", false);

        let first = resolver.resolve(&entry).await.unwrap();
        let second = resolver.resolve(&entry).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_checksum_mismatch_is_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = StaticFetcher::new(b"tampered");
        let resolver = resolver(&dir, fetcher, LINUX);
        let entry = remote_entry(b"binary", false);

        let err = resolver.resolve(&entry).await.unwrap_err();

        match err {
            ResolveError::ChecksumMismatch { plugin, expected, actual } => {
                assert_eq!(plugin, "tool");
                assert_eq!(expected, verifier::compute_hash(b"binary"));
                assert_eq!(actual, verifier::compute_hash(b"tampered"));
            }
            other => panic!("expected checksum mismatch, got {other:?}"),
        }
        assert!(resolver.cache().records().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_misses_download_once() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = StaticFetcher::with_delay(b"binary", Duration::from_millis(50));
        let resolver = resolver(&dir, Arc::clone(&fetcher), LINUX);
        let entry = remote_entry(b"binary", false);

        let (a, b) = tokio::join!(resolver.resolve(&entry), resolver.resolve(&entry));

        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_miss_times_out_but_download_completes() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = StaticFetcher::with_delay(b"binary", Duration::from_millis(100));
        let resolver = resolver(&dir, fetcher, LINUX);
        let entry = remote_entry(b"binary", false);

        let err = resolver
            .resolve_with_timeout(&entry, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::DownloadFailed { stage: Stage::Download, .. }));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(resolver.cache().records().len(), 1);
    }

    #[tokio::test]
    async fn test_stale_refresh_failure_serves_cached_binary() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = StaticFetcher::new(b"binary");
        let cache = Arc::new(
            CacheManager::open(dir.path().join("cache"))
                .unwrap()
                .with_refresh_interval(Duration::ZERO),
        );
        let resolver = Resolver::new(
            Arc::clone(&cache),
            Arc::clone(&fetcher) as Arc<dyn Fetcher>,
            LINUX,
            dir.path(),
        );
        let entry = remote_entry(b"binary", true);

        let first = resolver.resolve(&entry).await.unwrap();
        fetcher.fail_with("connection reset");
        tokio::time::sleep(Duration::from_millis(5)).await;

        let second = resolver.resolve(&entry).await.unwrap();
        assert_eq!(first, second);

        // Let the background refresh finish
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fetcher.calls(), 2);
        let key = CacheKey::new("tool", "2.1.0", LINUX);
        assert_eq!(cache.lookup(&key).map(|r| r.local_path), Some(first));
        assert_eq!(cache.record_refresh_failure(&key), 2);
    }

    #[tokio::test]
    async fn test_failed_refresh_backs_off_before_retrying() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = StaticFetcher::new(b"binary");
        let cache = Arc::new(
            CacheManager::open(dir.path().join("cache"))
                .unwrap()
                .with_refresh_interval(Duration::from_millis(200)),
        );
        let resolver = Resolver::new(
            Arc::clone(&cache),
            Arc::clone(&fetcher) as Arc<dyn Fetcher>,
            LINUX,
            dir.path(),
        );
        let entry = remote_entry(b"binary", true);

        resolver.resolve(&entry).await.unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;
        fetcher.fail_with("404 Not Found");

        resolver.resolve(&entry).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fetcher.calls(), 2);

        // Still stale, but the last refresh failed moments ago
        resolver.resolve(&entry).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fetcher.calls(), 2);

        tokio::time::sleep(Duration::from_millis(250)).await;
        resolver.resolve(&entry).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fetcher.calls(), 3);
    }

    #[tokio::test]
    async fn test_stale_refresh_success_updates_fetched_at() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = StaticFetcher::new(b"binary");
        let cache = Arc::new(
            CacheManager::open(dir.path().join("cache"))
                .unwrap()
                .with_refresh_interval(Duration::ZERO),
        );
        let resolver = Resolver::new(
            Arc::clone(&cache),
            Arc::clone(&fetcher) as Arc<dyn Fetcher>,
            LINUX,
            dir.path(),
        );
        let entry = remote_entry(b"binary", true);
        let key = CacheKey::new("tool", "2.1.0", LINUX);

        resolver.resolve(&entry).await.unwrap();
        let before = cache.lookup(&key).unwrap().fetched_at;
        tokio::time::sleep(Duration::from_millis(5)).await;

        resolver.resolve(&entry).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let after = cache.lookup(&key).unwrap();
        assert!(after.verified);
        assert!(after.fetched_at > before);
        assert!(after.fetched_at <= Utc::now());
    }

    #[tokio::test]
    async fn test_pinned_entry_never_refreshes() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = StaticFetcher::new(b"binary");
        let cache = Arc::new(
            CacheManager::open(dir.path().join("cache"))
                .unwrap()
                .with_refresh_interval(Duration::ZERO),
        );
        let resolver = Resolver::new(cache, Arc::clone(&fetcher) as Arc<dyn Fetcher>, LINUX, dir.path());
        let entry = remote_entry(b"binary", false);

        resolver.resolve(&entry).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        resolver.resolve(&entry).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_bad_template_fails_before_download() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = StaticFetcher::new(b"binary");
        let resolver = resolver(&dir, Arc::clone(&fetcher), LINUX);
        let mut entry = remote_entry(b"binary", false);
        if let EntrySource::Remote(remote) = &mut entry.source {
            remote.download_url = "https://x/{version".to_string();
        }

        let err = resolver.resolve(&entry).await.unwrap_err();
        assert_eq!(err.stage(), Stage::Expand);
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn test_missing_bundled_plugin() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = resolver(&dir, StaticFetcher::new(b""), LINUX);
        let entry = RegistryEntry {
            name: "math".to_string(),
            description: String::new(),
            version: "1.0.0".to_string(),
            source: EntrySource::Local {
                path: "plugins/math/math".to_string(),
            },
        };

        let err = resolver.resolve(&entry).await.unwrap_err();
        assert!(matches!(err, ResolveError::PluginNotFound { ref plugin, .. } if plugin == "math"));
    }
}
