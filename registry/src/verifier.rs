//! Plugin verification — SHA-256 checksum checks

use sdk::errors::ResolveError;
use sha2::{Digest, Sha256};

/// Outcome of comparing a binary's digest with the registry checksum
///
/// Never persisted. The caller decides immediately whether to accept or
/// discard the bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustResult {
    /// Digest declared by the registry
    pub expected: String,
    /// Lowercase hex digest of the bytes
    pub actual: String,
    pub matched: bool,
}

impl TrustResult {
    /// Turn a failed verification into `ResolveError::ChecksumMismatch`
    pub fn into_result(self, plugin: &str) -> Result<Self, ResolveError> {
        if self.matched {
            Ok(self)
        } else {
            Err(ResolveError::ChecksumMismatch {
                plugin: plugin.to_string(),
                expected: self.expected,
                actual: self.actual,
            })
        }
    }
}

/// Verify that the SHA-256 digest of `data` matches `expected_hex`
///
/// The comparison ignores hex case and walks the full length of both strings
/// regardless of where they first differ.
pub fn verify(data: &[u8], expected_hex: &str) -> TrustResult {
    let actual = compute_hash(data);
    let matched = digests_equal(&actual, expected_hex.trim());

    TrustResult {
        expected: expected_hex.trim().to_string(),
        actual,
        matched,
    }
}

/// Compute the SHA-256 hash of `data` and return hex string
pub fn compute_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Compare two hex digests without regard to case
pub fn digests_equal(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    let mut diff = a.len() ^ b.len();
    for i in 0..a.len().max(b.len()) {
        let x = a.get(i).copied().unwrap_or(0).to_ascii_lowercase();
        let y = b.get(i).copied().unwrap_or(0).to_ascii_lowercase();
        diff |= usize::from(x ^ y);
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELLO_WORLD: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    #[test]
    fn test_compute_and_verify_hash() {
        let data = b"hello world";
        assert_eq!(compute_hash(data), HELLO_WORLD);

        let trust = verify(data, HELLO_WORLD);
        assert!(trust.matched);
        assert_eq!(trust.actual, HELLO_WORLD);
    }

    #[test]
    fn test_verify_is_case_insensitive() {
        let trust = verify(b"hello world", &HELLO_WORLD.to_ascii_uppercase());
        assert!(trust.matched);
    }

    #[test]
    fn test_verify_hash_mismatch() {
        let data = b"hello world";
        let expected = "0".repeat(64);
        let trust = verify(data, &expected);

        assert!(!trust.matched);
        assert_eq!(trust.expected, expected);
        assert_eq!(trust.actual, HELLO_WORLD);

        match trust.into_result("tool") {
            Err(ResolveError::ChecksumMismatch {
                plugin,
                expected: e,
                actual,
            }) => {
                assert_eq!(plugin, "tool");
                assert_eq!(e, expected);
                assert_eq!(actual, HELLO_WORLD);
            }
            other => panic!("Expected ChecksumMismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_prefix_of_digest_does_not_match() {
        assert!(!verify(b"hello world", &HELLO_WORLD[..63]).matched);
        assert!(!verify(b"hello world", "").matched);
    }

    #[test]
    fn test_verify_does_not_mutate_input() {
        let data = b"hello world".to_vec();
        let before = data.clone();
        let _ = verify(&data, HELLO_WORLD);
        assert_eq!(data, before);
    }
}
