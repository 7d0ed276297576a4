//! # Keccak-256 Hashing
//!
//! Legacy Keccak (pre-NIST padding), as used for packet hashes and
//! node distance coordinates.

use sha3::{Digest, Keccak256};

/// Keccak-256 hash output (256-bit).
pub type Hash = [u8; 32];

/// Hash data with Keccak-256 (one-shot).
pub fn keccak256(data: &[u8]) -> Hash {
    Keccak256::digest(data).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keccak256_empty_input() {
        let hash = keccak256(b"");
        assert_eq!(
            hex::encode(hash),
            "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
    }

    #[test]
    fn test_deterministic() {
        let h1 = keccak256(b"test");
        let h2 = keccak256(b"test");
        assert_eq!(h1, h2);
    }

    #[test]
    fn test_different_inputs() {
        let h1 = keccak256(b"input1");
        let h2 = keccak256(b"input2");
        assert_ne!(h1, h2);
    }
}
