//! Platform-specific utilities
//!
//! This module maps the running platform onto the values a registry's
//! download templates understand and onto the executable suffix binaries
//! need on that platform.
//!
//! # Placeholder Values
//!
//! | Rust target | `{os}`    | `{arch}` | suffix |
//! |-------------|-----------|----------|--------|
//! | macos       | `darwin`  |          |        |
//! | linux       | `linux`   |          |        |
//! | windows     | `windows` |          | `.exe` |
//! | x86_64      |           | `amd64`  |        |
//! | aarch64     |           | `arm64`  |        |
//!
//! Any other platform cannot run a single plugin, so detecting one is a
//! fatal configuration error for the whole process rather than a
//! per-resolution failure.

pub mod template;

use sdk::errors::ResolveError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

pub use template::expand;

/// Operating systems plugins are published for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Os {
    Darwin,
    Linux,
    Windows,
}

impl Os {
    /// Value substituted for `{os}`
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Darwin => "darwin",
            Self::Linux => "linux",
            Self::Windows => "windows",
        }
    }

    /// Suffix every executable carries on this OS
    pub fn executable_suffix(self) -> &'static str {
        match self {
            Self::Windows => ".exe",
            Self::Darwin | Self::Linux => "",
        }
    }

    /// Map a `std::env::consts::OS` value
    pub fn from_rust(os: &str) -> Option<Self> {
        match os {
            "macos" => Some(Self::Darwin),
            "linux" => Some(Self::Linux),
            "windows" => Some(Self::Windows),
            _ => None,
        }
    }
}

impl fmt::Display for Os {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// CPU architectures plugins are published for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    Amd64,
    Arm64,
}

impl Arch {
    /// Value substituted for `{arch}`
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Amd64 => "amd64",
            Self::Arm64 => "arm64",
        }
    }

    /// Map a `std::env::consts::ARCH` value
    pub fn from_rust(arch: &str) -> Option<Self> {
        match arch {
            "x86_64" => Some(Self::Amd64),
            "aarch64" => Some(Self::Arm64),
            _ => None,
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The platform a binary is resolved for
///
/// # Examples
///
/// ```
/// use plughub_engine::platform::{Arch, Os, PlatformTarget};
///
/// let target = PlatformTarget::new(Os::Windows, Arch::Amd64);
/// assert_eq!(target.executable_suffix(), ".exe");
/// assert_eq!(target.to_string(), "windows-amd64");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlatformTarget {
    pub os: Os,
    pub arch: Arch,
}

impl PlatformTarget {
    pub const fn new(os: Os, arch: Arch) -> Self {
        Self { os, arch }
    }

    /// Map Rust's OS and architecture names onto a target
    pub fn detect(os: &str, arch: &str) -> Option<Self> {
        Some(Self::new(Os::from_rust(os)?, Arch::from_rust(arch)?))
    }

    /// The platform this process runs on, detected once
    ///
    /// # Errors
    ///
    /// Returns `ResolveError::Config` on a platform no plugin is published
    /// for. Callers should treat this as fatal at startup.
    pub fn current() -> Result<Self, ResolveError> {
        static CURRENT: OnceLock<Option<PlatformTarget>> = OnceLock::new();

        CURRENT
            .get_or_init(|| Self::detect(std::env::consts::OS, std::env::consts::ARCH))
            .ok_or_else(|| {
                ResolveError::Config(format!(
                    "Unsupported platform {}/{}: plugins are published for darwin, linux and windows on amd64 and arm64",
                    std::env::consts::OS,
                    std::env::consts::ARCH
                ))
            })
    }

    pub fn executable_suffix(&self) -> &'static str {
        self.os.executable_suffix()
    }
}

impl fmt::Display for PlatformTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.os, self.arch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_known_platforms() {
        assert_eq!(
            PlatformTarget::detect("macos", "aarch64"),
            Some(PlatformTarget::new(Os::Darwin, Arch::Arm64))
        );
        assert_eq!(
            PlatformTarget::detect("linux", "x86_64"),
            Some(PlatformTarget::new(Os::Linux, Arch::Amd64))
        );
        assert_eq!(
            PlatformTarget::detect("windows", "x86_64"),
            Some(PlatformTarget::new(Os::Windows, Arch::Amd64))
        );
    }

    #[test]
    fn test_detect_unknown_platforms() {
        assert_eq!(PlatformTarget::detect("freebsd", "x86_64"), None);
        assert_eq!(PlatformTarget::detect("linux", "riscv64"), None);
    }

    #[test]
    fn test_suffix_only_on_windows() {
        assert_eq!(Os::Windows.executable_suffix(), ".exe");
        assert_eq!(Os::Linux.executable_suffix(), "");
        assert_eq!(Os::Darwin.executable_suffix(), "");
    }

    #[test]
    fn test_current_is_stable() {
        let first = PlatformTarget::current();
        let second = PlatformTarget::current();
        assert_eq!(first, second);

        #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
        assert_eq!(first, Ok(PlatformTarget::new(Os::Linux, Arch::Amd64)));
    }

    #[test]
    fn test_serde_uses_placeholder_values() {
        let json = serde_json::to_string(&PlatformTarget::new(Os::Darwin, Arch::Arm64)).unwrap();
        assert_eq!(json, r#"{"os":"darwin","arch":"arm64"}"#);
    }
}
