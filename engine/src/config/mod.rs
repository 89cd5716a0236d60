//! Configuration management
//!
//! This module handles loading, validation, and management of the plughub
//! configuration. Configuration is stored in TOML format at
//! ~/.plughub/config.toml.
//!
//! # Configuration Sections
//!
//! - **core**: Log level, data directory
//! - **registry**: Registry source and the root bundled plugins live under
//! - **cache**: Binary cache directory, refresh interval, download timeout
//! - **network**: HTTP user agent
//!
//! # Path Expansion
//!
//! Every path (and a registry source that is not a URL) has a leading `~`
//! expanded to the user's home directory. The data and cache directories
//! are created when missing.
//!
//! # Examples
//!
//! ```no_run
//! use plughub_engine::config::Config;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load_or_create()?;
//!
//! println!("Registry: {}", config.registry.source);
//! println!("Cache: {:?}", config.cache.dir);
//! # Ok(())
//! # }
//! ```

use sdk::errors::ResolveError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Allowed values for `core.log_level`
pub const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Core settings
    #[serde(default)]
    pub core: CoreConfig,

    /// Registry location
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Binary cache settings
    #[serde(default)]
    pub cache: CacheConfig,

    /// HTTP settings
    #[serde(default)]
    pub network: NetworkConfig,
}

/// Core configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Data directory path (supports ~ expansion)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Local path or http(s) URL of the registry document
    #[serde(default = "default_registry_source")]
    pub source: String,

    /// Root that local entry paths are relative to
    #[serde(default = "default_plugin_root")]
    pub plugin_root: PathBuf,
}

/// Binary cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Cache directory (supports ~ expansion)
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,

    /// Age after which an auto-update binary is refreshed
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,

    /// How long a cache miss may wait for its download
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            data_dir: default_data_dir(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            source: default_registry_source(),
            plugin_root: default_plugin_root(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: default_cache_dir(),
            refresh_interval_secs: default_refresh_interval_secs(),
            download_timeout_secs: default_download_timeout_secs(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("~/.plughub")
}

fn default_registry_source() -> String {
    "~/.plughub/registry.json".to_string()
}

fn default_plugin_root() -> PathBuf {
    PathBuf::from("~/.plughub/bundled")
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("~/.plughub/cache")
}

fn default_refresh_interval_secs() -> u64 {
    3600
}

fn default_download_timeout_secs() -> u64 {
    120
}

fn default_user_agent() -> String {
    registry::fetcher::default_user_agent()
}

impl Default for Config {
    fn default() -> Self {
        Self::default_config()
    }
}

impl Config {
    /// Load configuration from the default location (~/.plughub/config.toml)
    ///
    /// If the configuration file doesn't exist, creates a default configuration.
    ///
    /// # Errors
    ///
    /// Returns `ResolveError::Config` if:
    /// - Configuration file cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    pub fn load_or_create() -> Result<Self, ResolveError> {
        let config_path = Self::default_config_path()?;
        Self::load_or_create_at(&config_path)
    }

    /// Load configuration from `path`, writing defaults there first if it is missing
    pub fn load_or_create_at(path: &Path) -> Result<Self, ResolveError> {
        if path.exists() {
            Self::load_from_path(path)
        } else {
            Self::create_default(path)
        }
    }

    /// Load configuration from a specific path
    ///
    /// # Errors
    ///
    /// Returns `ResolveError::Config` if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    pub fn load_from_path(path: &Path) -> Result<Self, ResolveError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| ResolveError::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_toml(&contents)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml(contents: &str) -> Result<Self, ResolveError> {
        let mut config: Config = toml::from_str(contents)
            .map_err(|e| ResolveError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate_and_process()?;

        Ok(config)
    }

    /// Create default configuration and save to path
    fn create_default(path: &Path) -> Result<Self, ResolveError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                ResolveError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        // Written before processing so the file keeps its `~` paths
        let mut config = Self::default_config();
        let toml_string = toml::to_string_pretty(&config)
            .map_err(|e| ResolveError::Config(format!("Failed to serialize config: {}", e)))?;

        fs::write(path, toml_string)
            .map_err(|e| ResolveError::Config(format!("Failed to write config file: {}", e)))?;

        config.validate_and_process()?;

        Ok(config)
    }

    /// Get the default configuration file path (~/.plughub/config.toml)
    pub fn default_config_path() -> Result<PathBuf, ResolveError> {
        let home = dirs::home_dir()
            .ok_or_else(|| ResolveError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(".plughub").join("config.toml"))
    }

    fn default_config() -> Self {
        Self {
            core: CoreConfig::default(),
            registry: RegistryConfig::default(),
            cache: CacheConfig::default(),
            network: NetworkConfig::default(),
        }
    }

    /// Replace the registry source, expanding `~` the same way the file does
    pub fn set_registry_source(&mut self, source: &str) -> Result<(), ResolveError> {
        self.registry.source = expand_source(source)?;
        Ok(())
    }

    /// Where a remote registry document is cached
    pub fn registry_cache_path(&self) -> PathBuf {
        self.core.data_dir.join("registry-cache.json")
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.cache.refresh_interval_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.cache.download_timeout_secs)
    }

    /// Validate and process configuration
    ///
    /// This method:
    /// - Validates the log level, intervals and registry source
    /// - Expands ~ in paths
    /// - Creates the data directory if it doesn't exist
    fn validate_and_process(&mut self) -> Result<(), ResolveError> {
        if !LOG_LEVELS.contains(&self.core.log_level.as_str()) {
            return Err(ResolveError::Config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.core.log_level,
                LOG_LEVELS.join(", ")
            )));
        }

        if self.cache.refresh_interval_secs == 0 {
            return Err(ResolveError::Config(
                "cache.refresh_interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.cache.download_timeout_secs == 0 {
            return Err(ResolveError::Config(
                "cache.download_timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.registry.source.trim().is_empty() {
            return Err(ResolveError::Config(
                "registry.source must not be empty".to_string(),
            ));
        }
        self.registry.source = expand_source(self.registry.source.trim())?;

        self.core.data_dir = expand_path(&self.core.data_dir)?;
        self.registry.plugin_root = expand_path(&self.registry.plugin_root)?;
        self.cache.dir = expand_path(&self.cache.dir)?;

        if !self.core.data_dir.exists() {
            fs::create_dir_all(&self.core.data_dir).map_err(|e| {
                ResolveError::Config(format!("Failed to create data directory: {}", e))
            })?;
        }

        Ok(())
    }
}

/// Expand a registry source unless it is a URL
fn expand_source(source: &str) -> Result<String, ResolveError> {
    if source.starts_with("https://") || source.starts_with("http://") {
        return Ok(source.to_string());
    }
    let expanded = expand_path(Path::new(source))?;
    expanded
        .into_os_string()
        .into_string()
        .map_err(|_| ResolveError::Config("Invalid UTF-8 in registry source".to_string()))
}

/// Expand ~ in path to user's home directory
///
/// # Examples
///
/// ```ignore
/// let path = PathBuf::from("~/.plughub");
/// let expanded = expand_path(&path)?;
/// // expanded is now /home/user/.plughub (on Unix)
/// ```
fn expand_path(path: &Path) -> Result<PathBuf, ResolveError> {
    let path_str = path
        .to_str()
        .ok_or_else(|| ResolveError::Config("Invalid UTF-8 in path".to_string()))?;

    if let Some(rest) = path_str.strip_prefix("~/") {
        let home = dirs::home_dir()
            .ok_or_else(|| ResolveError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(rest))
    } else if path_str == "~" {
        dirs::home_dir()
            .ok_or_else(|| ResolveError::Config("Could not determine home directory".to_string()))
    } else {
        Ok(path.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_creation() {
        let config = Config::default_config();

        assert_eq!(config.core.log_level, "info");
        assert_eq!(config.cache.refresh_interval_secs, 3600);
        assert_eq!(config.cache.download_timeout_secs, 120);
        assert!(config.network.user_agent.starts_with("plughub/"));
    }

    #[test]
    fn test_expand_path_with_tilde() {
        let path = PathBuf::from("~/test");
        let expanded = expand_path(&path).unwrap();

        let home = dirs::home_dir().unwrap();
        assert_eq!(expanded, home.join("test"));
    }

    #[test]
    fn test_expand_path_without_tilde() {
        let path = PathBuf::from("/absolute/path");
        let expanded = expand_path(&path).unwrap();

        assert_eq!(expanded, path);
    }

    #[test]
    fn test_expand_source_keeps_urls() {
        assert_eq!(
            expand_source("https://example.com/~/registry.json").unwrap(),
            "https://example.com/~/registry.json"
        );
        let home = dirs::home_dir().unwrap();
        assert_eq!(
            PathBuf::from(expand_source("~/registry.json").unwrap()),
            home.join("registry.json")
        );
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default_config();
        let toml_string = toml::to_string(&config).unwrap();

        let deserialized: Config = toml::from_str(&toml_string).unwrap();
        assert_eq!(config.core.log_level, deserialized.core.log_level);
        assert_eq!(config.registry.source, deserialized.registry.source);
    }

    #[test]
    fn test_missing_sections_use_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let toml = format!("[core]\ndata_dir = {:?}\n", dir.path().join("data"));

        let config = Config::from_toml(&toml).unwrap();
        assert_eq!(config.cache.refresh_interval_secs, 3600);
        assert!(config.core.data_dir.is_dir());
    }

    #[test]
    fn test_invalid_values_are_config_errors() {
        for toml in [
            "[core]\nlog_level = \"loud\"\n",
            "[cache]\nrefresh_interval_secs = 0\n",
            "[cache]\ndownload_timeout_secs = 0\n",
            "[registry]\nsource = \"  \"\n",
            "not toml",
        ] {
            assert!(
                matches!(Config::from_toml(toml), Err(ResolveError::Config(_))),
                "accepted {toml:?}"
            );
        }
    }
}
