//! Plughub SDK
//!
//! Shared types for the plugin distribution engine: the registry entry model
//! and the resolution error taxonomy. Used by the registry loader and the
//! engine alike.

/// Error types and handling
pub mod errors;

/// Registry entry model
pub mod entry;

// Re-export commonly used types
pub use entry::{EntrySource, RawEntry, RegistryEntry, RemoteSource};
pub use errors::{ResolveError, ResolveErrorExt, Stage};
