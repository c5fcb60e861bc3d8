//! Hex SHA-256 hashing and rolling-hash chain verification.
//!
//! Every digest in the kernel is a lowercase hex SHA-256: request
//! fingerprints, audit rolling hashes, identity digests and snapshot
//! digests. The chain primitives here back the append-only audit log,
//! where each entry commits to the previous entry's rolling hash.

use sha2::{Digest, Sha256};
use thiserror::Error;

/// Length of a hex-encoded SHA-256 digest.
pub const DIGEST_HEX_LEN: usize = 64;

/// Previous-hash value for the first entry of a chain.
pub const GENESIS_PREV_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// Errors that can occur during hash chain verification.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HashChainError {
    /// An entry's `prev_hash` does not match the preceding entry's
    /// rolling hash.
    #[error("hash chain broken: expected prev {expected}, got {actual}")]
    ChainBroken {
        /// The rolling hash of the preceding entry.
        expected: String,
        /// The `prev_hash` actually recorded.
        actual: String,
    },

    /// An entry's rolling hash does not match the recomputed value.
    #[error("rolling hash mismatch: expected {expected}, got {actual}")]
    HashMismatch {
        /// The recomputed rolling hash.
        expected: String,
        /// The rolling hash actually recorded.
        actual: String,
    },
}

/// Hashes raw content, returning lowercase hex.
#[must_use]
pub fn sha256_hex(content: &[u8]) -> String {
    let digest = Sha256::digest(content);
    let mut out = String::with_capacity(DIGEST_HEX_LEN);
    for byte in digest {
        use std::fmt::Write as _;
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Computes a rolling hash over `prev_hash || content`.
///
/// Chaining the previous hash into each entry means any insertion,
/// deletion or mutation breaks every subsequent link.
#[must_use]
pub fn chain_hash(prev_hash: &str, content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash.as_bytes());
    hasher.update(content);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(DIGEST_HEX_LEN);
    for byte in digest {
        use std::fmt::Write as _;
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Returns true when `value` is a well-formed lowercase hex digest.
#[must_use]
pub fn is_hex_digest(value: &str) -> bool {
    value.len() == DIGEST_HEX_LEN && value.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Verifies that a recorded rolling hash matches the recomputed value.
///
/// # Errors
///
/// Returns `HashMismatch` if the recomputed hash differs.
pub fn verify_entry_hash(
    content: &[u8],
    prev_hash: &str,
    expected_hash: &str,
) -> Result<(), HashChainError> {
    let computed = chain_hash(prev_hash, content);
    if computed != expected_hash {
        return Err(HashChainError::HashMismatch {
            expected: computed,
            actual: expected_hash.to_string(),
        });
    }
    Ok(())
}

/// Verifies the link between two consecutive entries.
///
/// # Errors
///
/// Returns `ChainBroken` if `current_prev_hash` does not match the
/// rolling hash of the preceding entry.
pub fn verify_chain_link(
    current_prev_hash: &str,
    previous_rolling_hash: &str,
) -> Result<(), HashChainError> {
    if current_prev_hash != previous_rolling_hash {
        return Err(HashChainError::ChainBroken {
            expected: previous_rolling_hash.to_string(),
            actual: current_prev_hash.to_string(),
        });
    }
    Ok(())
}
