//! Single-flight downloads
//!
//! At most one download runs per cache key. Later callers for the same key
//! join the running one and observe its outcome, success or failure.

use futures::future::{BoxFuture, FutureExt, Shared};
use sdk::errors::ResolveError;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

use super::{lock, CacheKey, CacheManager, CacheRecord};

/// Outcome of a download shared between every caller that joined it
pub type SharedResolution = Shared<BoxFuture<'static, Result<CacheRecord, ResolveError>>>;

/// Handle on a running download
pub struct InFlight {
    pub future: SharedResolution,
    /// `true` when another caller had already started this download
    pub joined: bool,
}

/// Removes the in-flight entry once the download task finishes
struct InFlightGuard {
    cache: Arc<CacheManager>,
    key: CacheKey,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        lock(&self.cache.inflight).remove(&self.key);
    }
}

impl CacheManager {
    /// Run `work` unless a download for `key` is already running
    ///
    /// The work runs on its own task, so it completes and populates the
    /// cache even when every caller stops waiting for it.
    pub fn fetch_once<F>(self: &Arc<Self>, key: &CacheKey, work: F) -> InFlight
    where
        F: Future<Output = Result<CacheRecord, ResolveError>> + Send + 'static,
    {
        let mut inflight = lock(&self.inflight);
        if let Some(existing) = inflight.get(key) {
            debug!(%key, "Joining in-flight download");
            return InFlight {
                future: existing.clone(),
                joined: true,
            };
        }

        let guard = InFlightGuard {
            cache: Arc::clone(self),
            key: key.clone(),
        };
        let handle = tokio::spawn(async move {
            let _guard = guard;
            work.await
        });

        let plugin = key.name.clone();
        let future = async move {
            handle.await.unwrap_or_else(|e| {
                Err(ResolveError::download(plugin, format!("download task failed: {}", e)))
            })
        }
        .boxed()
        .shared();

        inflight.insert(key.clone(), future.clone());
        InFlight {
            future,
            joined: false,
        }
    }

    /// The download currently running for `key`, if any
    pub fn pending(&self, key: &CacheKey) -> Option<SharedResolution> {
        lock(&self.inflight).get(key).cloned()
    }

    /// Every download currently running
    pub fn pending_all(&self) -> Vec<SharedResolution> {
        lock(&self.inflight).values().cloned().collect()
    }
}
