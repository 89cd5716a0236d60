//! Plughub Plugin Registry
//!
//! This crate loads registry snapshots from a local file or a remote URL,
//! fetches plugin binaries over HTTP, and verifies downloaded bytes against
//! the SHA-256 checksum the registry declares for them.

pub mod fetcher;
pub mod registry;
pub mod verifier;

pub use fetcher::{Fetcher, HttpFetcher};
pub use registry::{Registry, RegistryDocument, RegistrySource};
pub use verifier::TrustResult;
