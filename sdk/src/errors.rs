//! Error types and handling
//!
//! This module provides the error taxonomy shared by the registry loader and
//! the resolution engine. Every error names the plugin it concerns and the
//! stage the resolution had reached when it failed, so a caller can report a
//! failure without digging through logs.
//!
//! All errors implement [`ResolveErrorExt`], which supplies a user-facing
//! hint and tells the caller whether an explicit retry can help.

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

/// Placeholder used when a malformed record does not even carry a name.
pub const UNNAMED_PLUGIN: &str = "<unnamed>";

/// Trait for resolution error extensions
pub trait ResolveErrorExt {
    /// Returns a user-friendly hint for the error
    fn user_hint(&self) -> &str;

    /// Returns whether a later, explicit resolution attempt may succeed
    ///
    /// Nothing in the engine retries automatically. This only tells the
    /// caller whether asking again is worthwhile.
    fn is_retryable(&self) -> bool;
}

/// Stage a resolution had reached when it stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Registry record validation
    Parse,
    /// Bundled executable lookup
    LocalLookup,
    /// Download URL templating
    Expand,
    /// Network fetch for a cache miss
    Download,
    /// Checksum comparison
    Verify,
    /// Writing into the cache directory
    Store,
    /// Background refresh of a stale record
    Refresh,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Parse => "parse",
            Self::LocalLookup => "local-lookup",
            Self::Expand => "expand",
            Self::Download => "download",
            Self::Verify => "verify",
            Self::Store => "store",
            Self::Refresh => "refresh",
        };
        f.write_str(name)
    }
}

/// Resolution error
///
/// `Clone` so that a single in-flight download outcome can be handed to every
/// caller that joined it.
///
/// # Examples
///
/// ```
/// use sdk::errors::{ResolveError, ResolveErrorExt, Stage};
///
/// let error = ResolveError::ChecksumMismatch {
///     plugin: "tool".to_string(),
///     expected: "aa".repeat(32),
///     actual: "bb".repeat(32),
/// };
/// assert_eq!(error.stage(), Stage::Verify);
/// assert!(!error.is_retryable());
/// assert!(error.to_string().contains(&"bb".repeat(32)));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("Malformed registry entry '{plugin}' (stage: parse): {reason}")]
    MalformedEntry { plugin: String, reason: String },

    #[error("Plugin '{plugin}' not found (stage: local-lookup): {path:?} is missing or not executable")]
    PluginNotFound { plugin: String, path: PathBuf },

    #[error("Template expansion failed for '{plugin}' (stage: expand): {reason} in {template:?}")]
    TemplateExpansion {
        plugin: String,
        template: String,
        reason: String,
    },

    #[error("Download failed for '{plugin}' (stage: {stage}): {reason}")]
    DownloadFailed {
        plugin: String,
        stage: Stage,
        reason: String,
    },

    #[error("Checksum mismatch for '{plugin}' (stage: verify): expected {expected}, got {actual}")]
    ChecksumMismatch {
        plugin: String,
        expected: String,
        actual: String,
    },

    #[error("Cache write failed for '{plugin}' (stage: {stage}): {reason}")]
    CacheWrite {
        plugin: String,
        stage: Stage,
        reason: String,
    },

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ResolveError {
    /// Build a `MalformedEntry` error
    pub fn malformed(plugin: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedEntry {
            plugin: plugin.into(),
            reason: reason.into(),
        }
    }

    /// Build a `DownloadFailed` error at the download stage
    pub fn download(plugin: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::DownloadFailed {
            plugin: plugin.into(),
            stage: Stage::Download,
            reason: reason.to_string(),
        }
    }

    /// Build a `CacheWrite` error at the store stage
    pub fn cache_write(plugin: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::CacheWrite {
            plugin: plugin.into(),
            stage: Stage::Store,
            reason: reason.to_string(),
        }
    }

    /// Name of the plugin the error concerns, if any
    pub fn plugin(&self) -> Option<&str> {
        match self {
            Self::MalformedEntry { plugin, .. }
            | Self::PluginNotFound { plugin, .. }
            | Self::TemplateExpansion { plugin, .. }
            | Self::DownloadFailed { plugin, .. }
            | Self::ChecksumMismatch { plugin, .. }
            | Self::CacheWrite { plugin, .. } => Some(plugin),
            Self::Registry(_) | Self::Config(_) => None,
        }
    }

    /// Stage the resolution had reached
    pub fn stage(&self) -> Stage {
        match self {
            Self::MalformedEntry { .. } | Self::Registry(_) | Self::Config(_) => Stage::Parse,
            Self::PluginNotFound { .. } => Stage::LocalLookup,
            Self::TemplateExpansion { .. } => Stage::Expand,
            Self::DownloadFailed { stage, .. } | Self::CacheWrite { stage, .. } => *stage,
            Self::ChecksumMismatch { .. } => Stage::Verify,
        }
    }

    /// Re-tag a download or store failure as having happened during a refresh
    pub fn during_refresh(self) -> Self {
        match self {
            Self::DownloadFailed { plugin, reason, .. } => Self::DownloadFailed {
                plugin,
                stage: Stage::Refresh,
                reason,
            },
            Self::CacheWrite { plugin, reason, .. } => Self::CacheWrite {
                plugin,
                stage: Stage::Refresh,
                reason,
            },
            other => other,
        }
    }
}

impl ResolveErrorExt for ResolveError {
    fn user_hint(&self) -> &str {
        match self {
            Self::MalformedEntry { .. } => "The registry entry is invalid. Fix the registry source",
            Self::PluginNotFound { .. } => {
                "The bundled plugin executable is missing. Reinstall the application"
            }
            Self::TemplateExpansion { .. } => {
                "The download URL template is invalid. Fix the registry source"
            }
            Self::DownloadFailed { .. } => "Download failed. Check your connection and try again",
            Self::ChecksumMismatch { .. } => {
                "Downloaded binary does not match the registry checksum. It may be corrupted or tampered with"
            }
            Self::CacheWrite { .. } => "Could not write to the plugin cache. Check disk space and permissions",
            Self::Registry(_) => "The plugin registry could not be loaded",
            Self::Config(_) => "Check your config.toml file for errors",
        }
    }

    fn is_retryable(&self) -> bool {
        matches!(self, Self::DownloadFailed { .. } | Self::CacheWrite { .. })
    }
}
