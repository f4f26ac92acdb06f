//! Content hashing used for change detection.

use sha2::{Digest, Sha256};

/// Length of a content hash in hex characters.
pub const CONTENT_HASH_LEN: usize = 64;

/// Stable SHA-256 hex digest of page text.
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn is_content_hash(s: &str) -> bool {
    s.len() == CONTENT_HASH_LEN && s.bytes().all(|b| b.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_length_hex() {
        let h = content_hash("Rust is a systems programming language.");
        assert_eq!(h.len(), CONTENT_HASH_LEN);
        assert!(is_content_hash(&h));
        assert_eq!(h, content_hash("Rust is a systems programming language."));
        assert_ne!(h, content_hash("Rust is a systems programming language"));
    }

    #[test]
    fn known_digest() {
        assert_eq!(
            content_hash(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
