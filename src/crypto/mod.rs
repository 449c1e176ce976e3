//! Cryptographic identities and boxes for the group protocol.
//!
//! Identity keys are extended keypairs: an Ed25519 signing key plus the
//! X25519 encryption key derived from it (same Curve25519 point in its two
//! representations). Session keys are ephemeral X25519 pairs created per
//! peer connection. All payload encryption is XChaCha20-Poly1305 over a
//! precomputed shared key derived from an ECDH exchange with Blake3.

pub mod boxes;
pub mod hash;
pub mod keys;

pub use boxes::{new_nonce, open_precomputed, precompute_handshake_key, precompute_session_key, seal_precomputed, SharedKey};
pub use hash::jenkins_hash;
pub use keys::{compare_enc_keys, ExtendedKeyPair, ExtendedPublicKey, SessionKeys};

use thiserror::Error;

/// Byte length of an X25519 encryption public key.
pub const ENC_PUBLIC_KEY_SIZE: usize = 32;
/// Byte length of an Ed25519 signature public key.
pub const SIG_PUBLIC_KEY_SIZE: usize = 32;
/// Byte length of an extended public key (encryption key ‖ signature key).
pub const EXT_PUBLIC_KEY_SIZE: usize = ENC_PUBLIC_KEY_SIZE + SIG_PUBLIC_KEY_SIZE;
/// Byte length of a detached Ed25519 signature.
pub const SIGNATURE_SIZE: usize = 64;
/// Byte length of an XChaCha20-Poly1305 nonce.
pub const NONCE_SIZE: usize = 24;
/// Byte length of the AEAD authentication tag.
pub const MAC_SIZE: usize = 16;
/// Byte length of a chat id (the group's Ed25519 signature public key).
pub const CHAT_ID_SIZE: usize = SIG_PUBLIC_KEY_SIZE;
/// Byte length of the Blake3 hashes used by the moderation machinery.
pub const MOD_HASH_SIZE: usize = 32;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Invalid public key")]
    InvalidPublicKey,

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Decryption failed")]
    DecryptionFailed,

    #[error("Encryption failed")]
    EncryptionFailed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_constants() {
        assert_eq!(EXT_PUBLIC_KEY_SIZE, 64);
        assert_eq!(SIGNATURE_SIZE, 64);
        assert_eq!(NONCE_SIZE, 24);
        assert_eq!(MAC_SIZE, 16);
    }
}
