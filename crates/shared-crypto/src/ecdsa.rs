//! # ECDSA Signatures (secp256k1, recoverable)
//!
//! Recoverable ECDSA signatures over 32-byte digests.
//!
//! ## Security Properties
//!
//! - RFC 6979 deterministic nonces (no RNG dependency for signing)
//! - Low-S normalization (EIP-2), the recovery id is adjusted accordingly
//! - Constant-time operations
//!
//! ## Wire Layout
//!
//! Signatures are 65 bytes: `r (32) || s (32) || v (1)` with `v` in `{0, 1}`.
//! Public keys are 64 bytes: the uncompressed point without the `0x04` tag.

use crate::CryptoError;
use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use zeroize::Zeroize;

/// Length of an uncompressed public key without the SEC1 tag byte.
pub const PUBLIC_KEY_LENGTH: usize = 64;

/// Length of a recoverable signature.
pub const SIGNATURE_LENGTH: usize = 65;

/// Uncompressed secp256k1 public key (64 bytes, `x || y`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Secp256k1PublicKey([u8; PUBLIC_KEY_LENGTH]);

impl Secp256k1PublicKey {
    /// Create from raw `x || y` bytes, validating that the point is on the curve.
    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_LENGTH]) -> Result<Self, CryptoError> {
        let mut sec1 = [0u8; PUBLIC_KEY_LENGTH + 1];
        sec1[0] = 0x04;
        sec1[1..].copy_from_slice(&bytes);
        VerifyingKey::from_sec1_bytes(&sec1).map_err(|_| CryptoError::InvalidPublicKey)?;
        Ok(Self(bytes))
    }

    /// Get raw `x || y` bytes.
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LENGTH] {
        &self.0
    }

    fn from_verifying_key(key: &VerifyingKey) -> Result<Self, CryptoError> {
        let point = key.to_encoded_point(false);
        let encoded = point.as_bytes();
        if encoded.len() != PUBLIC_KEY_LENGTH + 1 {
            return Err(CryptoError::InvalidPublicKey);
        }
        let mut bytes = [0u8; PUBLIC_KEY_LENGTH];
        bytes.copy_from_slice(&encoded[1..]);
        Ok(Self(bytes))
    }
}

/// Recoverable ECDSA signature (65 bytes, `r || s || v`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecoverableSignature([u8; SIGNATURE_LENGTH]);

impl RecoverableSignature {
    /// Create from bytes (65 bytes).
    pub fn from_bytes(bytes: [u8; SIGNATURE_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Create from a slice, checking the length.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; SIGNATURE_LENGTH] =
            bytes
                .try_into()
                .map_err(|_| CryptoError::InvalidKeyLength {
                    expected: SIGNATURE_LENGTH,
                    actual: bytes.len(),
                })?;
        Ok(Self(arr))
    }

    /// Get raw bytes.
    pub fn as_bytes(&self) -> &[u8; SIGNATURE_LENGTH] {
        &self.0
    }
}

/// secp256k1 ECDSA keypair.
pub struct Secp256k1KeyPair {
    signing_key: SigningKey,
}

impl Secp256k1KeyPair {
    /// Generate random keypair.
    pub fn generate() -> Self {
        let signing_key = SigningKey::random(&mut rand::thread_rng());
        Self { signing_key }
    }

    /// Create from secret key bytes (32 bytes).
    pub fn from_bytes(bytes: [u8; 32]) -> Result<Self, CryptoError> {
        let signing_key =
            SigningKey::from_bytes((&bytes).into()).map_err(|_| CryptoError::InvalidPrivateKey)?;
        Ok(Self { signing_key })
    }

    /// Create from a secret key slice, checking the length.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength {
                expected: 32,
                actual: bytes.len(),
            })?;
        Self::from_bytes(arr)
    }

    /// Get the uncompressed public key.
    pub fn public_key(&self) -> Result<Secp256k1PublicKey, CryptoError> {
        Secp256k1PublicKey::from_verifying_key(self.signing_key.verifying_key())
    }

    /// Sign a 32-byte digest, producing `r || s || v`.
    pub fn sign_recoverable(&self, digest: &[u8; 32]) -> Result<RecoverableSignature, CryptoError> {
        let (sig, recid): (Signature, RecoveryId) = self
            .signing_key
            .sign_prehash_recoverable(digest)
            .map_err(|e| CryptoError::SigningFailed(e.to_string()))?;
        let mut bytes = [0u8; SIGNATURE_LENGTH];
        bytes[..64].copy_from_slice(&sig.to_bytes());
        bytes[64] = recid.to_byte();
        Ok(RecoverableSignature(bytes))
    }

    /// Get secret key bytes (for serialization).
    pub fn to_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes().into()
    }
}

impl Clone for Secp256k1KeyPair {
    fn clone(&self) -> Self {
        Self {
            signing_key: self.signing_key.clone(),
        }
    }
}

impl std::fmt::Debug for Secp256k1KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secp256k1KeyPair").finish_non_exhaustive()
    }
}

impl Drop for Secp256k1KeyPair {
    fn drop(&mut self) {
        // Zeroize secret key material
        let mut bytes: [u8; 32] = self.signing_key.to_bytes().into();
        bytes.zeroize();
    }
}

/// Recover the signer's public key from a digest and a recoverable signature.
pub fn recover_public_key(
    digest: &[u8; 32],
    signature: &RecoverableSignature,
) -> Result<Secp256k1PublicKey, CryptoError> {
    let bytes = signature.as_bytes();
    let sig = Signature::from_slice(&bytes[..64]).map_err(|_| CryptoError::InvalidSignatureFormat)?;
    let recid = RecoveryId::from_byte(bytes[64]).ok_or(CryptoError::InvalidRecoveryId(bytes[64]))?;
    let key = VerifyingKey::recover_from_prehash(digest, &sig, recid)
        .map_err(|_| CryptoError::RecoveryFailed)?;
    Secp256k1PublicKey::from_verifying_key(&key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keccak256;

    #[test]
    fn test_sign_recover() {
        let keypair = Secp256k1KeyPair::generate();
        let digest = keccak256(b"Hello, secp256k1!");

        let signature = keypair.sign_recoverable(&digest).unwrap();
        let recovered = recover_public_key(&digest, &signature).unwrap();

        assert_eq!(recovered, keypair.public_key().unwrap());
    }

    #[test]
    fn test_wrong_digest_recovers_other_key() {
        let keypair = Secp256k1KeyPair::generate();

        let signature = keypair.sign_recoverable(&keccak256(b"message1")).unwrap();
        let recovered = recover_public_key(&keccak256(b"message2"), &signature);

        match recovered {
            Ok(key) => assert_ne!(key, keypair.public_key().unwrap()),
            Err(e) => assert_eq!(e, CryptoError::RecoveryFailed),
        }
    }

    #[test]
    fn test_deterministic_signatures() {
        let keypair = Secp256k1KeyPair::from_bytes([0xABu8; 32]).unwrap();
        let digest = keccak256(b"deterministic test");

        let sig1 = keypair.sign_recoverable(&digest).unwrap();
        let sig2 = keypair.sign_recoverable(&digest).unwrap();

        assert_eq!(sig1.as_bytes(), sig2.as_bytes());
        assert!(sig1.as_bytes()[64] <= 1);
    }

    #[test]
    fn test_invalid_recovery_id() {
        let keypair = Secp256k1KeyPair::generate();
        let digest = keccak256(b"payload");
        let mut bytes = *keypair.sign_recoverable(&digest).unwrap().as_bytes();
        bytes[64] = 9;

        let result = recover_public_key(&digest, &RecoverableSignature::from_bytes(bytes));
        assert_eq!(result, Err(CryptoError::InvalidRecoveryId(9)));
    }

    #[test]
    fn test_public_key_validation() {
        assert_eq!(
            Secp256k1PublicKey::from_bytes([0u8; 64]),
            Err(CryptoError::InvalidPublicKey)
        );

        let keypair = Secp256k1KeyPair::generate();
        let pk = keypair.public_key().unwrap();
        assert_eq!(Secp256k1PublicKey::from_bytes(*pk.as_bytes()), Ok(pk));
    }

    #[test]
    fn test_roundtrip_bytes() {
        let original = Secp256k1KeyPair::generate();
        let bytes = original.to_bytes();
        let restored = Secp256k1KeyPair::from_bytes(bytes).unwrap();

        assert_eq!(original.public_key(), restored.public_key());
        assert!(Secp256k1KeyPair::from_slice(&bytes[..31]).is_err());
    }
}
