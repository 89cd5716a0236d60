//! Verified binary cache
//!
//! The cache manager exclusively owns the cache directory. Every file it
//! advertises has passed checksum verification; unverified bytes only ever
//! live in temporary files that are deleted when dropped.
//!
//! # Directory Layout
//!
//! ```text
//! <cache dir>/
//! ├── index.json                               # verified records
//! ├── .tmp/                                    # in-progress writes
//! └── tool/
//!     ├── tool-2.1.0-linux-amd64
//!     └── tool-2.1.0-windows-amd64.exe
//! ```
//!
//! Writes go to a temporary file first and are promoted with an atomic
//! rename, so a partially written binary is never observed as a hit.

mod inflight;

pub use inflight::{InFlight, SharedResolution};

use chrono::{DateTime, Utc};
use registry::verifier;
use sdk::errors::ResolveError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tempfile::{NamedTempFile, TempPath};
use tracing::{debug, info, warn};

use crate::platform::{Arch, Os, PlatformTarget};

/// Staleness interval for auto-updating plugins
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Wait after the first failed refresh of a key, doubled per further failure
/// and capped at the refresh interval
pub const REFRESH_RETRY_BACKOFF: Duration = Duration::from_secs(30);

const INDEX_FILE: &str = "index.json";
const TMP_DIR: &str = ".tmp";

/// Identity of one cached artifact
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    pub name: String,
    pub version: String,
    pub os: Os,
    pub arch: Arch,
}

impl CacheKey {
    pub fn new(name: &str, version: &str, target: PlatformTarget) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
            os: target.os,
            arch: target.arch,
        }
    }

    pub fn target(&self) -> PlatformTarget {
        PlatformTarget::new(self.os, self.arch)
    }

    /// Deterministic file name, including the platform's executable suffix
    pub fn file_name(&self) -> String {
        format!(
            "{}-{}-{}-{}{}",
            self.name,
            self.version,
            self.os,
            self.arch,
            self.os.executable_suffix()
        )
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{} ({}-{})", self.name, self.version, self.os, self.arch)
    }
}

/// One binary in the cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRecord {
    #[serde(flatten)]
    pub key: CacheKey,
    pub local_path: PathBuf,
    /// Set on download, never touched by cache hits
    pub fetched_at: DateTime<Utc>,
    pub verified: bool,
    /// SHA-256 of the stored bytes
    #[serde(default)]
    pub checksum: String,
}

impl CacheRecord {
    /// Whether this record was stored for an entry published with `checksum`
    pub fn matches(&self, checksum: &str) -> bool {
        verifier::digests_equal(&self.checksum, checksum.trim())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexFile {
    #[serde(default)]
    records: Vec<CacheRecord>,
}

/// Owner of the on-disk binary cache
pub struct CacheManager {
    root: PathBuf,
    refresh_interval: Duration,
    index: Mutex<HashMap<CacheKey, CacheRecord>>,
    inflight: Mutex<HashMap<CacheKey, SharedResolution>>,
    refresh_failures: Mutex<HashMap<CacheKey, RefreshFailures>>,
    provisional: Mutex<HashMap<CacheKey, TempPath>>,
    /// Serializes index.json rewrites; never held together with `index`
    index_writer: Mutex<()>,
}

#[derive(Debug, Clone, Copy)]
struct RefreshFailures {
    count: u32,
    last: Instant,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl CacheManager {
    /// Open (or create) a cache rooted at `root`
    ///
    /// Leftover temporary files from an interrupted process are removed and
    /// index records whose binary is gone are dropped.
    ///
    /// # Errors
    ///
    /// Returns `ResolveError::Config` if the cache directory cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, ResolveError> {
        let root = root.into();
        let tmp_dir = root.join(TMP_DIR);

        if tmp_dir.exists() {
            if let Err(e) = fs::remove_dir_all(&tmp_dir) {
                warn!(path = %tmp_dir.display(), "Failed to clear temporary cache files: {}", e);
            }
        }
        fs::create_dir_all(&tmp_dir).map_err(|e| {
            ResolveError::Config(format!(
                "Failed to create cache directory {}: {}",
                root.display(),
                e
            ))
        })?;

        let index = load_index(&root.join(INDEX_FILE));
        info!(path = %root.display(), records = index.len(), "Cache opened");

        Ok(Self {
            root,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            index: Mutex::new(index),
            inflight: Mutex::new(HashMap::new()),
            refresh_failures: Mutex::new(HashMap::new()),
            provisional: Mutex::new(HashMap::new()),
            index_writer: Mutex::new(()),
        })
    }

    /// Override the auto-update staleness interval
    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn refresh_interval(&self) -> Duration {
        self.refresh_interval
    }

    /// Where the binary for `key` lives once promoted
    pub fn binary_path(&self, key: &CacheKey) -> PathBuf {
        self.root.join(&key.name).join(key.file_name())
    }

    /// Return the verified record for `key`, if there is one
    ///
    /// A record whose file has disappeared from disk is dropped.
    pub fn lookup(&self, key: &CacheKey) -> Option<CacheRecord> {
        let record = lock(&self.index).get(key).filter(|r| r.verified).cloned()?;

        if !record.local_path.is_file() {
            warn!(%key, path = %record.local_path.display(), "Cached binary vanished, dropping record");
            self.forget(&record);
            return None;
        }

        Some(record)
    }

    /// Return the record for `key` only if its binary still hashes to `checksum`
    ///
    /// A record stored for a different checksum is a miss and is left for the
    /// next download to overwrite. A binary whose bytes changed after it was
    /// stored is dropped from the index. Reads and hashes the whole file, so
    /// call it off the async runtime.
    pub fn lookup_verified(&self, key: &CacheKey, checksum: &str) -> Option<CacheRecord> {
        let record = self.lookup(key)?;

        if !record.matches(checksum) {
            info!(%key, cached = %record.checksum, expected = %checksum, "Cached binary was stored for a different checksum");
            return None;
        }

        let bytes = match fs::read(&record.local_path) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(%key, path = %record.local_path.display(), "Failed to read cached binary, dropping record: {}", e);
                self.forget(&record);
                return None;
            }
        };

        let trust = verifier::verify(&bytes, checksum);
        if !trust.matched {
            warn!(
                %key,
                path = %record.local_path.display(),
                expected = %trust.expected,
                actual = %trust.actual,
                "Cached binary changed on disk, dropping record"
            );
            self.forget(&record);
            return None;
        }

        Some(record)
    }

    /// Drop `record` from the in-memory index unless it was replaced meanwhile
    fn forget(&self, record: &CacheRecord) {
        let mut index = lock(&self.index);
        if index.get(&record.key) == Some(record) {
            index.remove(&record.key);
        }
    }

    /// Whether `record` should be refreshed
    ///
    /// Records of plugins without auto-update are never stale: a new version
    /// is a new key and simply misses.
    pub fn is_stale(&self, record: &CacheRecord, auto_update: bool) -> bool {
        self.is_stale_at(record, auto_update, Utc::now())
    }

    pub fn is_stale_at(&self, record: &CacheRecord, auto_update: bool, now: DateTime<Utc>) -> bool {
        if !auto_update {
            return false;
        }
        match (now - record.fetched_at).to_std() {
            Ok(age) => age > self.refresh_interval,
            // fetched_at lies in the future: clock went backwards
            Err(_) => false,
        }
    }

    /// Write `bytes` for `key`
    ///
    /// Verified bytes are promoted into the cache with an atomic rename and
    /// recorded in the index; records for older versions of the same plugin
    /// and platform are evicted. Unverified bytes stay in a temporary file
    /// that is never promoted and never indexed, and that is deleted by
    /// [`CacheManager::discard`] or when the manager is dropped.
    ///
    /// # Errors
    ///
    /// Returns `ResolveError::CacheWrite` on any I/O failure. A previously
    /// verified record for the key stays usable.
    pub fn store(&self, key: &CacheKey, bytes: &[u8], verified: bool) -> Result<CacheRecord, ResolveError> {
        let fail = |e: &dyn fmt::Display| ResolveError::cache_write(&key.name, e);

        let mut tmp = NamedTempFile::new_in(self.root.join(TMP_DIR)).map_err(|e| fail(&e))?;
        tmp.write_all(bytes).map_err(|e| fail(&e))?;
        tmp.as_file().sync_all().map_err(|e| fail(&e))?;
        set_executable(tmp.path()).map_err(|e| fail(&e))?;
        let checksum = verifier::compute_hash(bytes);

        if !verified {
            let path = tmp.into_temp_path();
            let record = CacheRecord {
                key: key.clone(),
                local_path: path.to_path_buf(),
                fetched_at: Utc::now(),
                verified: false,
                checksum,
            };
            debug!(%key, path = %path.display(), "Holding unverified binary in temporary file");
            lock(&self.provisional).insert(key.clone(), path);
            return Ok(record);
        }

        let dest = self.binary_path(key);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| fail(&e))?;
        }
        tmp.persist(&dest).map_err(|e| fail(&e.error))?;

        let record = CacheRecord {
            key: key.clone(),
            local_path: dest,
            fetched_at: Utc::now(),
            verified: true,
            checksum,
        };

        let (previous, evicted) = {
            let mut index = lock(&self.index);
            let previous = index.insert(key.clone(), record.clone());
            (previous, take_superseded(&mut index, key))
        };

        if let Err(e) = self.persist_index() {
            let mut index = lock(&self.index);
            if index.get(key) == Some(&record) {
                index.remove(key);
                if let Some(previous) = previous {
                    index.insert(key.clone(), previous);
                }
            }
            for old in evicted {
                index.entry(old.key.clone()).or_insert(old);
            }
            return Err(fail(&e));
        }

        for old in &evicted {
            info!(key = %old.key, "Evicting superseded binary");
            remove_binary(&old.local_path);
        }
        lock(&self.provisional).remove(key);

        info!(%key, path = %record.local_path.display(), "Stored verified binary");
        Ok(record)
    }

    /// Delete any unverified temporary file held for `key`
    pub fn discard(&self, key: &CacheKey) {
        if lock(&self.provisional).remove(key).is_some() {
            debug!(%key, "Discarded unverified binary");
        }
    }

    /// Remove cached binaries for one plugin, or for every plugin
    pub fn purge(&self, name: Option<&str>) -> Result<Vec<CacheRecord>, ResolveError> {
        let removed: Vec<CacheRecord> = {
            let mut index = lock(&self.index);
            let keys: Vec<CacheKey> = index
                .keys()
                .filter(|k| name.map_or(true, |n| k.name == n))
                .cloned()
                .collect();
            keys.iter().filter_map(|k| index.remove(k)).collect()
        };

        if let Err(e) = self.persist_index() {
            let mut index = lock(&self.index);
            for record in removed {
                index.entry(record.key.clone()).or_insert(record);
            }
            return Err(ResolveError::cache_write(name.unwrap_or("*"), e));
        }

        for record in &removed {
            remove_binary(&record.local_path);
            if let Some(dir) = record.local_path.parent() {
                // Only succeeds once the plugin directory is empty
                let _ = fs::remove_dir(dir);
            }
        }

        info!(plugin = name.unwrap_or("*"), removed = removed.len(), "Cache purged");
        Ok(removed)
    }

    /// Every verified record, ordered by key
    pub fn records(&self) -> Vec<CacheRecord> {
        let mut records: Vec<CacheRecord> = lock(&self.index)
            .values()
            .filter(|r| r.verified)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        records
    }

    /// Count a failed refresh for `key` and return the consecutive total
    pub fn record_refresh_failure(&self, key: &CacheKey) -> u32 {
        let mut failures = lock(&self.refresh_failures);
        let entry = failures.entry(key.clone()).or_insert(RefreshFailures {
            count: 0,
            last: Instant::now(),
        });
        entry.count += 1;
        entry.last = Instant::now();
        entry.count
    }

    pub fn clear_refresh_failures(&self, key: &CacheKey) {
        lock(&self.refresh_failures).remove(key);
    }

    /// Whether a refresh of `key` failed too recently to try again
    pub fn refresh_backing_off(&self, key: &CacheKey) -> bool {
        self.refresh_backing_off_at(key, Instant::now())
    }

    pub fn refresh_backing_off_at(&self, key: &CacheKey, now: Instant) -> bool {
        let failures = match lock(&self.refresh_failures).get(key).copied() {
            Some(failures) => failures,
            None => return false,
        };
        let doublings = failures.count.saturating_sub(1).min(10);
        let wait = REFRESH_RETRY_BACKOFF
            .saturating_mul(1 << doublings)
            .min(self.refresh_interval);
        now.saturating_duration_since(failures.last) < wait
    }

    /// Rewrite index.json from the current in-memory index
    ///
    /// Writers queue on `index_writer` and snapshot the index only once they
    /// hold it, so the last write always carries the newest state.
    fn persist_index(&self) -> std::io::Result<()> {
        let _writer = lock(&self.index_writer);

        let mut records: Vec<CacheRecord> = lock(&self.index)
            .values()
            .filter(|r| r.verified)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.key.cmp(&b.key));

        let json = serde_json::to_vec_pretty(&IndexFile { records })?;
        let mut tmp = NamedTempFile::new_in(self.root.join(TMP_DIR))?;
        tmp.write_all(&json)?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.root.join(INDEX_FILE))
            .map_err(|e| e.error)?;
        Ok(())
    }
}

/// Remove records for older versions of the same plugin and platform
fn take_superseded(index: &mut HashMap<CacheKey, CacheRecord>, key: &CacheKey) -> Vec<CacheRecord> {
    let superseded: Vec<CacheKey> = index
        .keys()
        .filter(|k| {
            k.name == key.name
                && k.os == key.os
                && k.arch == key.arch
                && is_older(&k.version, &key.version)
        })
        .cloned()
        .collect();

    superseded.iter().filter_map(|k| index.remove(k)).collect()
}

/// Semver ordering where both versions parse, inequality otherwise
fn is_older(candidate: &str, current: &str) -> bool {
    let parse = |v: &str| semver::Version::parse(v.strip_prefix('v').unwrap_or(v)).ok();
    match (parse(candidate), parse(current)) {
        (Some(candidate), Some(current)) => candidate < current,
        _ => candidate != current,
    }
}

fn load_index(path: &Path) -> HashMap<CacheKey, CacheRecord> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return HashMap::new(),
        Err(e) => {
            warn!(path = %path.display(), "Failed to read cache index, starting empty: {}", e);
            return HashMap::new();
        }
    };

    let file: IndexFile = match serde_json::from_str(&contents) {
        Ok(file) => file,
        Err(e) => {
            warn!(path = %path.display(), "Corrupt cache index, starting empty: {}", e);
            return HashMap::new();
        }
    };

    file.records
        .into_iter()
        .filter(|r| r.verified && r.local_path.is_file())
        .map(|r| (r.key.clone(), r))
        .collect()
}

fn remove_binary(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), "Failed to remove cached binary: {}", e),
    }
}

#[cfg(unix)]
fn set_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
