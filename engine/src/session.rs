//! Wiring between configuration, registry, cache and resolver

use anyhow::{Context, Result};
use futures::future::join_all;
use registry::fetcher::{Fetcher, HttpFetcher};
use registry::registry::{load, Registry, RegistrySource};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::cache::CacheManager;
use crate::config::Config;
use crate::platform::PlatformTarget;
use crate::resolver::Resolver;

/// Everything one CLI invocation needs
pub struct Session {
    config: Config,
    fetcher: Arc<HttpFetcher>,
    resolver: Resolver,
}

impl Session {
    /// Open the cache and build the HTTP client described by `config`
    ///
    /// # Errors
    ///
    /// Fails on an unsupported platform, an unusable cache directory or an
    /// HTTP client that cannot be built.
    pub fn new(config: Config) -> Result<Self> {
        let target = PlatformTarget::current()?;

        let cache = CacheManager::open(&config.cache.dir)
            .context("Failed to open plugin cache")?
            .with_refresh_interval(config.refresh_interval());
        let fetcher = Arc::new(HttpFetcher::new(&config.network.user_agent)?);

        let resolver = Resolver::new(
            Arc::new(cache),
            Arc::clone(&fetcher) as Arc<dyn Fetcher>,
            target,
            &config.registry.plugin_root,
        )
        .with_download_timeout(config.download_timeout());

        debug!(%target, cache = %config.cache.dir.display(), "Session ready");
        Ok(Self {
            config,
            fetcher,
            resolver,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    pub fn cache(&self) -> &CacheManager {
        self.resolver.cache()
    }

    pub fn http_client(&self) -> &reqwest::Client {
        self.fetcher.client()
    }

    /// Load a fresh registry snapshot from the configured source
    pub async fn load_registry(&self) -> Result<Arc<Registry>> {
        let source = RegistrySource::parse(&self.config.registry.source);
        let registry = load(
            &source,
            self.fetcher.as_ref(),
            &self.config.registry_cache_path(),
        )
        .await
        .with_context(|| format!("Failed to load registry from {}", self.config.registry.source))?;
        Ok(registry)
    }

    /// Wait up to `timeout` for background downloads to finish
    ///
    /// A process that exits right after resolving would otherwise abandon a
    /// refresh it started.
    pub async fn settle(&self, timeout: Duration) {
        let pending = self.cache().pending_all();
        if pending.is_empty() {
            return;
        }

        debug!(count = pending.len(), "Waiting for background downloads");
        if tokio::time::timeout(timeout, join_all(pending)).await.is_err() {
            warn!(
                timeout_secs = timeout.as_secs(),
                "Background downloads still running at exit, abandoning"
            );
        }
    }
}
