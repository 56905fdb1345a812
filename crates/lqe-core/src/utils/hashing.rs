//! Hashing Utilities

use sha2::{Digest, Sha256};

/// SHA-256 hex digest of an ordered list of parts
///
/// Each part is length-prefixed so part boundaries cannot be shifted to
/// produce the same digest.
pub fn fingerprint<'a>(parts: impl IntoIterator<Item = &'a str>) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_hex_sha256() {
        let digest = fingerprint(["temporal", "episodic"]);
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(digest, fingerprint(["temporal", "episodic"]));
    }

    #[test]
    fn test_fingerprint_boundaries() {
        // "ab" + "c" must not collide with "a" + "bc"
        assert_ne!(fingerprint(["ab", "c"]), fingerprint(["a", "bc"]));
        assert_ne!(fingerprint(["a", "b"]), fingerprint(["b", "a"]));
    }

    #[test]
    fn test_empty_parts_count() {
        assert_ne!(fingerprint(std::iter::empty::<&str>()), fingerprint([""]));
    }
}
