//! # Shared Crypto - Discovery Cryptographic Primitives
//!
//! ## Components
//!
//! | Module | Algorithm | Use Case |
//! |--------|-----------|----------|
//! | `hashing` | Keccak-256 | Packet hashes, node distance coordinates |
//! | `ecdsa` | secp256k1 (recoverable) | Packet signing, sender recovery |
//!
//! ## Security Properties
//!
//! - **secp256k1**: RFC 6979 deterministic, low-S normalization (EIP-2)
//! - **Recovery**: the sender identity is the public key recovered from the
//!   65-byte `r || s || v` signature, no key is carried on the wire

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod ecdsa;
pub mod errors;
pub mod hashing;

// Re-exports
pub use ecdsa::{recover_public_key, RecoverableSignature, Secp256k1KeyPair, Secp256k1PublicKey};
pub use errors::CryptoError;
pub use hashing::{keccak256, Hash};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
