// Authenticated boxes over precomputed shared keys.
//
// Flow for session traffic:
// 1. ECDH: self session secret × peer session public → raw shared secret
// 2. KDF: Blake3::derive_key(raw) → 32-byte symmetric key
// 3. AEAD: XChaCha20-Poly1305(key, nonce, plaintext)
//
// Handshake traffic runs the same construction over the *static* encryption
// keys of both identities, since no session keys exist yet.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::Zeroize;

use super::{CryptoError, ENC_PUBLIC_KEY_SIZE, NONCE_SIZE};

/// KDF context for session-key traffic. Changing either context string
/// breaks compatibility with every deployed peer.
const SESSION_KDF_CONTEXT: &str = "conclave v2 group session key 2026-03-11";
/// KDF context for handshake traffic under static identity keys.
const HANDSHAKE_KDF_CONTEXT: &str = "conclave v2 group handshake key 2026-03-11";

/// A precomputed symmetric key shared with one peer.
#[derive(Clone)]
pub struct SharedKey([u8; 32]);

impl SharedKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl Drop for SharedKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

fn precompute(
    context: &str,
    self_secret: &StaticSecret,
    peer_public: &[u8; ENC_PUBLIC_KEY_SIZE],
) -> SharedKey {
    let peer = X25519PublicKey::from(*peer_public);
    let raw = self_secret.diffie_hellman(&peer);
    SharedKey(blake3::derive_key(context, raw.as_bytes()))
}

/// Derive the symmetric key for lossless/lossy traffic from the local
/// session secret and the peer's session public key.
pub fn precompute_session_key(
    self_session_secret: &StaticSecret,
    peer_session_public: &[u8; ENC_PUBLIC_KEY_SIZE],
) -> SharedKey {
    precompute(SESSION_KDF_CONTEXT, self_session_secret, peer_session_public)
}

/// Derive the symmetric key for handshake frames from the static identity
/// encryption keys. Both directions derive the same key.
pub fn precompute_handshake_key(
    self_enc_secret: &StaticSecret,
    peer_enc_public: &[u8; ENC_PUBLIC_KEY_SIZE],
) -> SharedKey {
    precompute(HANDSHAKE_KDF_CONTEXT, self_enc_secret, peer_enc_public)
}

/// A fresh random 24-byte nonce.
pub fn new_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Encrypt and authenticate `plaintext` under a precomputed key.
pub fn seal_precomputed(
    key: &SharedKey,
    nonce: &[u8; NONCE_SIZE],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new_from_slice(key.as_bytes())
        .map_err(|_| CryptoError::EncryptionFailed)?;
    cipher
        .encrypt(XNonce::from_slice(nonce), plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)
}

/// Decrypt and verify a ciphertext produced by [`seal_precomputed`].
pub fn open_precomputed(
    key: &SharedKey,
    nonce: &[u8; NONCE_SIZE],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new_from_slice(key.as_bytes())
        .map_err(|_| CryptoError::DecryptionFailed)?;
    cipher
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::{ExtendedKeyPair, SessionKeys};
    use crate::crypto::MAC_SIZE;

    #[test]
    fn test_session_box_roundtrip() {
        let alice = SessionKeys::generate();
        let bob = SessionKeys::generate();

        let k_ab = precompute_session_key(alice.secret(), bob.public());
        let k_ba = precompute_session_key(bob.secret(), alice.public());

        let nonce = new_nonce();
        let ct = seal_precomputed(&k_ab, &nonce, b"hello group").unwrap();
        assert_eq!(ct.len(), b"hello group".len() + MAC_SIZE);

        let pt = open_precomputed(&k_ba, &nonce, &ct).unwrap();
        assert_eq!(pt, b"hello group");
    }

    #[test]
    fn test_handshake_box_roundtrip() {
        let alice = ExtendedKeyPair::generate();
        let bob = ExtendedKeyPair::generate();

        let k_ab = precompute_handshake_key(alice.enc_secret(), bob.public().enc());
        let k_ba = precompute_handshake_key(bob.enc_secret(), alice.public().enc());

        let nonce = new_nonce();
        let ct = seal_precomputed(&k_ab, &nonce, b"hs payload").unwrap();
        let pt = open_precomputed(&k_ba, &nonce, &ct).unwrap();
        assert_eq!(pt, b"hs payload");
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let alice = SessionKeys::generate();
        let bob = SessionKeys::generate();
        let key = precompute_session_key(alice.secret(), bob.public());

        let nonce = new_nonce();
        let mut ct = seal_precomputed(&key, &nonce, b"payload").unwrap();
        ct[0] ^= 0xFF;
        assert_eq!(
            open_precomputed(&key, &nonce, &ct),
            Err(CryptoError::DecryptionFailed)
        );
    }

    #[test]
    fn test_wrong_key_rejected() {
        let alice = SessionKeys::generate();
        let bob = SessionKeys::generate();
        let eve = SessionKeys::generate();

        let key = precompute_session_key(alice.secret(), bob.public());
        let wrong = precompute_session_key(eve.secret(), bob.public());

        let nonce = new_nonce();
        let ct = seal_precomputed(&key, &nonce, b"payload").unwrap();
        assert!(open_precomputed(&wrong, &nonce, &ct).is_err());
    }

    #[test]
    fn test_session_and_handshake_keys_domain_separated() {
        let alice = SessionKeys::generate();
        let bob = SessionKeys::generate();
        let session = precompute_session_key(alice.secret(), bob.public());
        let handshake = precompute_handshake_key(alice.secret(), bob.public());
        assert_ne!(session.as_bytes(), handshake.as_bytes());
    }
}
