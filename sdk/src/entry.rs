//! Registry entry model
//!
//! A registry record describes one plugin either as a *local* executable
//! bundled with the application or as a *remote* binary downloaded from a
//! templated URL and pinned by a SHA-256 checksum. [`RawEntry`] mirrors the
//! record as it appears in the registry document; [`RegistryEntry::parse`]
//! validates it into the typed form the engine resolves.

use std::path::{Component, Path};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::{ResolveError, UNNAMED_PLUGIN};

/// Placeholders a download URL template may reference
pub const PLACEHOLDERS: [&str; 3] = ["version", "os", "arch"];

/// Length of a hex-encoded SHA-256 digest
pub const SHA256_HEX_LEN: usize = 64;

const MAX_NAME_LEN: usize = 64;

/// Registry record exactly as read from the registry document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEntry {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub download_url: Option<String>,
    #[serde(default)]
    pub checksum: Option<String>,
    #[serde(default)]
    pub auto_update: Option<bool>,
    #[serde(default)]
    pub github_repo: Option<String>,
}

/// Validated registry entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistryEntry {
    /// Unique name within a registry, also the cache and lookup key
    pub name: String,
    pub description: String,
    /// Version string, opaque to the engine
    pub version: String,
    pub source: EntrySource,
}

/// Where a plugin's executable comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntrySource {
    /// Executable bundled under the plugin root, without platform suffix
    Local { path: String },
    /// Executable downloaded from a templated URL
    Remote(RemoteSource),
}

/// Download parameters of a remote plugin
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteSource {
    /// URL template using `{version}`, `{os}` and `{arch}`
    pub download_url: String,
    /// Lowercase hex SHA-256 digest of the binary
    pub checksum: String,
    pub auto_update: bool,
    /// `owner/repo`, used for update checks only
    pub github_repo: Option<String>,
}

impl RegistryEntry {
    /// Validate a raw record
    ///
    /// # Errors
    ///
    /// Returns `ResolveError::MalformedEntry` when:
    /// - `name` or `version` is absent, empty, or unsafe as a path component
    /// - the record is neither or both of local and remote
    /// - a remote record has no checksum, or the checksum is not 64 hex digits
    /// - the URL template references a placeholder other than `{version}`, `{os}`, `{arch}`
    pub fn parse(raw: RawEntry) -> Result<Self, ResolveError> {
        let name = match raw.name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => return Err(ResolveError::malformed(UNNAMED_PLUGIN, "missing name")),
        };
        validate_name(&name)?;

        let version = match raw.version.as_deref().map(str::trim) {
            Some(version) if !version.is_empty() => version.to_string(),
            _ => return Err(ResolveError::malformed(&name, "missing version")),
        };
        validate_version(&name, &version)?;

        let description = raw.description.unwrap_or_default();

        let source = match (raw.path, raw.download_url) {
            (Some(_), Some(_)) => {
                return Err(ResolveError::malformed(
                    &name,
                    "entry declares both a local path and a download URL",
                ))
            }
            (None, None) => {
                return Err(ResolveError::malformed(
                    &name,
                    "entry declares neither a local path nor a download URL",
                ))
            }
            (Some(path), None) => {
                validate_local_path(&name, &path)?;
                EntrySource::Local { path }
            }
            (None, Some(download_url)) => {
                let checksum = match raw.checksum.as_deref().map(str::trim) {
                    Some(checksum) if !checksum.is_empty() => checksum.to_ascii_lowercase(),
                    _ => {
                        return Err(ResolveError::malformed(
                            &name,
                            "remote entry has no checksum",
                        ))
                    }
                };
                validate_checksum(&name, &checksum)?;
                validate_template(&name, &download_url)?;
                EntrySource::Remote(RemoteSource {
                    download_url,
                    checksum,
                    auto_update: raw.auto_update.unwrap_or(false),
                    github_repo: raw.github_repo.filter(|repo| !repo.trim().is_empty()),
                })
            }
        };

        Ok(Self {
            name,
            description,
            version,
            source,
        })
    }

    /// Parse a single JSON record
    pub fn from_json(json: &str) -> Result<Self, ResolveError> {
        let raw: RawEntry = serde_json::from_str(json)
            .map_err(|e| ResolveError::malformed(UNNAMED_PLUGIN, e.to_string()))?;
        Self::parse(raw)
    }

    /// Remote download parameters, if this is a remote entry
    pub fn remote(&self) -> Option<&RemoteSource> {
        match &self.source {
            EntrySource::Remote(remote) => Some(remote),
            EntrySource::Local { .. } => None,
        }
    }

    pub fn is_remote(&self) -> bool {
        self.remote().is_some()
    }
}

impl TryFrom<RawEntry> for RegistryEntry {
    type Error = ResolveError;

    fn try_from(raw: RawEntry) -> Result<Self, Self::Error> {
        Self::parse(raw)
    }
}

fn placeholder_regex() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| Regex::new(r"\{([^{}]*)\}").expect("placeholder pattern is valid"))
}

/// Names of every `{...}` placeholder in a template, in order of appearance
pub fn placeholders(template: &str) -> impl Iterator<Item = &str> {
    placeholder_regex()
        .captures_iter(template)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
}

fn validate_template(name: &str, template: &str) -> Result<(), ResolveError> {
    if !(template.starts_with("https://") || template.starts_with("http://")) {
        return Err(ResolveError::malformed(
            name,
            format!("download URL must be http(s): {template}"),
        ));
    }

    if let Some(unknown) = placeholders(template).find(|p| !PLACEHOLDERS.contains(p)) {
        return Err(ResolveError::malformed(
            name,
            format!("unknown placeholder {{{unknown}}} in download URL"),
        ));
    }

    Ok(())
}

fn validate_checksum(name: &str, checksum: &str) -> Result<(), ResolveError> {
    if checksum.len() != SHA256_HEX_LEN || !checksum.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ResolveError::malformed(
            name,
            format!("checksum must be {SHA256_HEX_LEN} hex digits"),
        ));
    }
    Ok(())
}

// Names become directory and file names inside the cache.
fn validate_name(name: &str) -> Result<(), ResolveError> {
    if name.len() > MAX_NAME_LEN {
        return Err(ResolveError::malformed(
            name,
            format!("name cannot exceed {MAX_NAME_LEN} characters"),
        ));
    }

    let valid = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
    if !valid || name.starts_with('.') || name.contains("..") {
        return Err(ResolveError::malformed(
            name,
            "name may only contain letters, digits, '-', '_' and '.'",
        ));
    }

    Ok(())
}

fn validate_version(name: &str, version: &str) -> Result<(), ResolveError> {
    let unsafe_char = version
        .chars()
        .any(|c| c == '/' || c == '\\' || c.is_whitespace() || c.is_control());
    if unsafe_char || version.contains("..") {
        return Err(ResolveError::malformed(
            name,
            format!("version {version:?} contains path or whitespace characters"),
        ));
    }
    if version.contains('{') || version.contains('}') {
        return Err(ResolveError::malformed(
            name,
            format!("version {version:?} contains placeholder braces"),
        ));
    }
    Ok(())
}

fn validate_local_path(name: &str, path: &str) -> Result<(), ResolveError> {
    if path.trim().is_empty() {
        return Err(ResolveError::malformed(name, "local path is empty"));
    }

    let path = Path::new(path);
    let escapes = path
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        return Err(ResolveError::malformed(
            name,
            format!("local path {path:?} must stay inside the plugin root"),
        ));
    }

    Ok(())
}
