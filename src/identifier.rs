//! Content-derived identifiers.

use sha2::{Digest, Sha256};

/// Derive a stable identifier from a byte buffer.
///
/// The identifier is the lowercase hex SHA-256 digest of `buffer`, so equal
/// inputs always produce equal identifiers.
#[must_use]
pub fn identifier_from_bytes(buffer: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(buffer);
    format!("{:x}", hasher.finalize())
}
