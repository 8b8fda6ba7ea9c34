//! Content normalization and hashing for memory deduplication.
//!
//! Two contents that differ only in case, punctuation, or whitespace must
//! hash identically.

use sha2::{Digest, Sha256};

/// Lowercase, strip non-alphanumerics (spaces survive), collapse runs of
/// whitespace to a single space, trim.
pub fn normalize(content: &str) -> String {
    let lowered: String = content
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() {
                c
            } else if c.is_whitespace() {
                ' '
            } else {
                // Punctuation drops out entirely.
                '\u{0}'
            }
        })
        .filter(|c| *c != '\u{0}')
        .collect();
    lowered.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Hex SHA-256 over the normalized content.
pub fn content_hash(content: &str) -> String {
    hex::encode(Sha256::digest(normalize(content).as_bytes()))
}
