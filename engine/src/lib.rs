//! Plughub Engine Library
//!
//! This library resolves registry entries to runnable executables: bundled
//! plugins are looked up under the plugin root, remote plugins are downloaded,
//! verified against their SHA-256 checksum and cached per platform.
//! It is used by both the main binary and integration tests.

/// Configuration management module
pub mod config;

/// Platform detection and download URL templating
pub mod platform;

/// Verified binary cache
pub mod cache;

/// Resolution orchestrator
pub mod resolver;

/// GitHub release checks
pub mod update;

/// Runtime wiring for CLI commands
pub mod session;

/// Telemetry and Observability
pub mod telemetry;

/// CLI interface module
pub mod cli;

/// Command handlers module
pub mod handlers;

pub use cache::{CacheKey, CacheManager, CacheRecord};
pub use platform::{Arch, Os, PlatformTarget};
pub use resolver::Resolver;
