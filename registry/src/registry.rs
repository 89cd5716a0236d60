//! Plugin registry — loads snapshots from a local file or a remote URL
//!
//! A snapshot is immutable. Reloading the registry builds a new [`Registry`]
//! and callers swap their `Arc`; nothing is mutated in place while a
//! resolution is running.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use sdk::entry::{RawEntry, RegistryEntry};
use sdk::errors::ResolveError;

use crate::fetcher::Fetcher;

/// Label used when the registry document itself is downloaded
const REGISTRY_LABEL: &str = "registry";

/// The registry document as stored on disk or served remotely
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryDocument {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub plugins: Vec<RawEntry>,
}

/// Immutable, validated registry snapshot
#[derive(Debug, Clone, Default)]
pub struct Registry {
    version: Option<String>,
    entries: BTreeMap<String, Arc<RegistryEntry>>,
}

impl Registry {
    /// Validate every record of a document
    ///
    /// # Errors
    ///
    /// Returns `ResolveError::MalformedEntry` for the first invalid record or
    /// for a name that appears twice.
    pub fn from_document(document: RegistryDocument) -> Result<Self, ResolveError> {
        let mut entries = BTreeMap::new();
        for raw in document.plugins {
            let entry = RegistryEntry::parse(raw)?;
            if entries.contains_key(&entry.name) {
                return Err(ResolveError::malformed(
                    &entry.name,
                    "name appears more than once in the registry",
                ));
            }
            entries.insert(entry.name.clone(), Arc::new(entry));
        }

        Ok(Self {
            version: document.version,
            entries,
        })
    }

    /// Parse and validate a JSON registry document
    pub fn from_json(json: &str) -> Result<Self, ResolveError> {
        let document: RegistryDocument = serde_json::from_str(json)
            .map_err(|e| ResolveError::Registry(format!("Failed to parse registry: {}", e)))?;
        Self::from_document(document)
    }

    /// Find a plugin entry by name
    pub fn get(&self, name: &str) -> Option<Arc<RegistryEntry>> {
        self.entries.get(name).cloned()
    }

    /// All entries, ordered by name
    pub fn entries(&self) -> impl Iterator<Item = &Arc<RegistryEntry>> {
        self.entries.values()
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Where the registry document lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrySource {
    Local(PathBuf),
    Remote(String),
}

impl RegistrySource {
    /// Classify a configured source string
    pub fn parse(source: &str) -> Self {
        if source.starts_with("https://") || source.starts_with("http://") {
            Self::Remote(source.to_string())
        } else {
            Self::Local(PathBuf::from(source))
        }
    }
}

/// Load a registry snapshot
///
/// A remote document is cached at `cache_path` after every successful fetch.
/// When the remote source is unreachable the cached copy is used instead.
///
/// # Errors
///
/// Returns `ResolveError::Registry` when no document can be read, and
/// `ResolveError::MalformedEntry` when the document holds an invalid record.
pub async fn load(
    source: &RegistrySource,
    fetcher: &dyn Fetcher,
    cache_path: &Path,
) -> Result<Arc<Registry>, ResolveError> {
    let registry = match source {
        RegistrySource::Local(path) => {
            let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
                ResolveError::Registry(format!("Failed to read registry {}: {}", path.display(), e))
            })?;
            Registry::from_json(&contents)?
        }
        RegistrySource::Remote(url) => match fetcher.fetch(REGISTRY_LABEL, url).await {
            Ok(bytes) => {
                let contents = String::from_utf8(bytes)
                    .map_err(|e| ResolveError::Registry(format!("Registry is not UTF-8: {}", e)))?;
                let registry = Registry::from_json(&contents)?;
                if let Err(e) = cache_document(cache_path, &contents).await {
                    warn!(path = %cache_path.display(), "Failed to cache registry: {}", e);
                }
                registry
            }
            Err(e) => {
                warn!(url, "Registry fetch failed, trying cached copy: {}", e);
                let contents = load_cached_document(cache_path).await?.ok_or_else(|| {
                    ResolveError::Registry(format!("Failed to fetch registry {}: {}", url, e))
                })?;
                Registry::from_json(&contents)?
            }
        },
    };

    info!(
        plugins = registry.len(),
        version = registry.version().unwrap_or("unversioned"),
        "Registry loaded"
    );
    Ok(Arc::new(registry))
}

/// Cache a registry document locally
async fn cache_document(path: &Path, contents: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, contents).await?;
    tokio::fs::rename(&tmp, path).await
}

/// Load cached document if available
async fn load_cached_document(path: &Path) -> Result<Option<String>, ResolveError> {
    if !path.exists() {
        return Ok(None);
    }
    tokio::fs::read_to_string(path)
        .await
        .map(Some)
        .map_err(|e| ResolveError::Registry(format!("Failed to read cached registry: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOCUMENT: &str = r#"{
        "version": "3",
        "plugins": [
            {"name": "math", "description": "Math", "path": "plugins/math/math", "version": "1.0.0"},
            {
                "name": "tool",
                "description": "Tool",
                "version": "2.1.0",
                "download_url": "https://x/v{version}/tool-{os}-{arch}",
                "checksum": "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08",
                "auto_update": false,
                "github_repo": "acme/tool"
            }
        ]
    }"#;

    #[test]
    fn test_from_json_builds_snapshot() {
        let registry = Registry::from_json(DOCUMENT).unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.version(), Some("3"));
        assert!(!registry.get("math").unwrap().is_remote());
        assert!(registry.get("tool").unwrap().is_remote());
        assert!(registry.get("missing").is_none());

        let names: Vec<&str> = registry.entries().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["math", "tool"]);
    }

    #[test]
    fn test_duplicate_names_are_rejected() {
        let json = r#"{"plugins": [
            {"name": "math", "path": "a", "version": "1"},
            {"name": "math", "path": "b", "version": "2"}
        ]}"#;
        let err = Registry::from_json(json).unwrap_err();
        assert!(matches!(err, ResolveError::MalformedEntry { .. }));
    }

    #[test]
    fn test_invalid_json_is_registry_error() {
        assert!(matches!(
            Registry::from_json("not json"),
            Err(ResolveError::Registry(_))
        ));
    }

    #[test]
    fn test_source_classification() {
        assert_eq!(
            RegistrySource::parse("https://example.com/registry.json"),
            RegistrySource::Remote("https://example.com/registry.json".to_string())
        );
        assert_eq!(
            RegistrySource::parse("/etc/plughub/registry.json"),
            RegistrySource::Local(PathBuf::from("/etc/plughub/registry.json"))
        );
    }
}
