// Extended identity keypairs and session keys.
//
// An identity is a single Ed25519 signing key; its X25519 encryption half is
// derived deterministically (clamped SHA-512 scalar for the secret, the
// Edwards→Montgomery birational map for the public), so the 64-byte extended
// public key always describes one identity.

use std::cmp::Ordering;
use std::fmt;

use ed25519_dalek::{Signature as Ed25519Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use sha2::{Digest, Sha512};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::Zeroize;

use super::{CryptoError, CHAT_ID_SIZE, ENC_PUBLIC_KEY_SIZE, EXT_PUBLIC_KEY_SIZE, SIGNATURE_SIZE, SIG_PUBLIC_KEY_SIZE};

/// Convert an Ed25519 signing key to an X25519 static secret for ECDH.
///
/// Ed25519 derives its secret scalar as the clamped low half of
/// SHA-512(seed). `StaticSecret` clamps on construction, so the raw half is
/// handed over as-is.
fn ed25519_to_x25519_secret(signing_key: &SigningKey) -> StaticSecret {
    let digest = Sha512::digest(signing_key.to_bytes());
    let mut scalar = [0u8; 32];
    scalar.copy_from_slice(&digest[..32]);
    let secret = StaticSecret::from(scalar);
    scalar.zeroize();
    secret
}

/// Convert an Ed25519 verifying (public) key to an X25519 public key via the
/// standard Edwards→Montgomery map: u = (1 + y) / (1 - y) mod p.
pub fn ed25519_public_to_x25519(public_key_bytes: &[u8; 32]) -> Result<[u8; 32], CryptoError> {
    use curve25519_dalek::edwards::CompressedEdwardsY;

    CompressedEdwardsY(*public_key_bytes)
        .decompress()
        .map(|point| point.to_montgomery().to_bytes())
        .ok_or(CryptoError::InvalidPublicKey)
}

/// A 64-byte extended public key: X25519 encryption half ‖ Ed25519 signature
/// half, both describing the same identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExtendedPublicKey {
    enc: [u8; ENC_PUBLIC_KEY_SIZE],
    sig: [u8; SIG_PUBLIC_KEY_SIZE],
}

impl ExtendedPublicKey {
    pub fn new(enc: [u8; ENC_PUBLIC_KEY_SIZE], sig: [u8; SIG_PUBLIC_KEY_SIZE]) -> Self {
        Self { enc, sig }
    }

    /// Expands a chat id (a bare signature key) into the extended public key
    /// by deriving the encryption half.
    pub fn from_chat_id(chat_id: &[u8; CHAT_ID_SIZE]) -> Result<Self, CryptoError> {
        Ok(Self {
            enc: ed25519_public_to_x25519(chat_id)?,
            sig: *chat_id,
        })
    }

    pub fn from_bytes(bytes: &[u8; EXT_PUBLIC_KEY_SIZE]) -> Self {
        let mut enc = [0u8; ENC_PUBLIC_KEY_SIZE];
        let mut sig = [0u8; SIG_PUBLIC_KEY_SIZE];
        enc.copy_from_slice(&bytes[..ENC_PUBLIC_KEY_SIZE]);
        sig.copy_from_slice(&bytes[ENC_PUBLIC_KEY_SIZE..]);
        Self { enc, sig }
    }

    pub fn to_bytes(&self) -> [u8; EXT_PUBLIC_KEY_SIZE] {
        let mut out = [0u8; EXT_PUBLIC_KEY_SIZE];
        out[..ENC_PUBLIC_KEY_SIZE].copy_from_slice(&self.enc);
        out[ENC_PUBLIC_KEY_SIZE..].copy_from_slice(&self.sig);
        out
    }

    pub fn enc(&self) -> &[u8; ENC_PUBLIC_KEY_SIZE] {
        &self.enc
    }

    pub fn sig(&self) -> &[u8; SIG_PUBLIC_KEY_SIZE] {
        &self.sig
    }

    /// The chat id of a group identity is its signature half.
    pub fn chat_id(&self) -> &[u8; CHAT_ID_SIZE] {
        &self.sig
    }

    /// Installs the signature half learned during a handshake.
    pub fn set_sig(&mut self, sig: [u8; SIG_PUBLIC_KEY_SIZE]) {
        self.sig = sig;
    }

    /// Verify a detached signature made by this identity's signing key.
    pub fn verify(&self, data: &[u8], signature: &[u8; SIGNATURE_SIZE]) -> Result<(), CryptoError> {
        verify_sig(&self.sig, data, signature)
    }
}

impl fmt::Debug for ExtendedPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExtendedPublicKey({}…)", &hex::encode(self.enc)[..8])
    }
}

/// Verify a detached Ed25519 signature under `sig_pk`.
pub fn verify_sig(
    sig_pk: &[u8; SIG_PUBLIC_KEY_SIZE],
    data: &[u8],
    signature: &[u8; SIGNATURE_SIZE],
) -> Result<(), CryptoError> {
    let verifying_key = VerifyingKey::from_bytes(sig_pk).map_err(|_| CryptoError::InvalidPublicKey)?;
    let sig = Ed25519Signature::from_bytes(signature);
    verifying_key
        .verify(data, &sig)
        .map_err(|_| CryptoError::InvalidSignature)
}

/// Lexicographic ordering of two encryption keys, used to break symmetric
/// races in the handshake.
pub fn compare_enc_keys(a: &[u8; ENC_PUBLIC_KEY_SIZE], b: &[u8; ENC_PUBLIC_KEY_SIZE]) -> Ordering {
    a.cmp(b)
}

/// An extended identity keypair. The encryption secret is derived from the
/// signing key, so only the signing key is stored and exported.
#[derive(Clone)]
pub struct ExtendedKeyPair {
    signing_key: SigningKey,
    enc_secret: StaticSecret,
    public: ExtendedPublicKey,
}

impl ExtendedKeyPair {
    /// Generate a fresh identity from the OS RNG.
    pub fn generate() -> Self {
        let mut secret_key_bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut secret_key_bytes);
        let signing_key = SigningKey::from_bytes(&secret_key_bytes);
        secret_key_bytes.zeroize();
        Self::from_signing_key(signing_key)
    }

    pub fn from_signing_key(signing_key: SigningKey) -> Self {
        let enc_secret = ed25519_to_x25519_secret(&signing_key);
        let enc = X25519PublicKey::from(&enc_secret).to_bytes();
        let sig = signing_key.verifying_key().to_bytes();
        Self {
            signing_key,
            enc_secret,
            public: ExtendedPublicKey::new(enc, sig),
        }
    }

    /// Restore an identity from its exported 32 secret bytes.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let secret: [u8; 32] = bytes.try_into().map_err(|_| CryptoError::InvalidPublicKey)?;
        Ok(Self::from_signing_key(SigningKey::from_bytes(&secret)))
    }

    pub fn public(&self) -> &ExtendedPublicKey {
        &self.public
    }

    pub fn enc_secret(&self) -> &StaticSecret {
        &self.enc_secret
    }

    /// Detached signature over `data`.
    pub fn sign(&self, data: &[u8]) -> [u8; SIGNATURE_SIZE] {
        self.signing_key.sign(data).to_bytes()
    }

    /// Secret bytes for the persisted snapshot. Callers must zeroize.
    pub fn secret_bytes(&self) -> zeroize::Zeroizing<Vec<u8>> {
        zeroize::Zeroizing::new(self.signing_key.to_bytes().to_vec())
    }
}

impl fmt::Debug for ExtendedKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExtendedKeyPair({}…)", &hex::encode(self.public.enc)[..8])
    }
}

/// Ephemeral X25519 session keypair, one per peer connection.
#[derive(Clone)]
pub struct SessionKeys {
    secret: StaticSecret,
    public: [u8; ENC_PUBLIC_KEY_SIZE],
}

impl SessionKeys {
    pub fn generate() -> Self {
        let mut secret_bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut secret_bytes);
        let secret = StaticSecret::from(secret_bytes);
        secret_bytes.zeroize();
        let public = X25519PublicKey::from(&secret).to_bytes();
        Self { secret, public }
    }

    pub fn public(&self) -> &[u8; ENC_PUBLIC_KEY_SIZE] {
        &self.public
    }

    pub fn secret(&self) -> &StaticSecret {
        &self.secret
    }
}

impl fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionKeys({}…)", &hex::encode(self.public)[..8])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extended_key_roundtrip() {
        let pair = ExtendedKeyPair::generate();
        let bytes = pair.public().to_bytes();
        let restored = ExtendedPublicKey::from_bytes(&bytes);
        assert_eq!(*pair.public(), restored);
    }

    #[test]
    fn test_enc_half_matches_derivation() {
        // The public encryption half must equal the converted signature half.
        let pair = ExtendedKeyPair::generate();
        let derived = ed25519_public_to_x25519(pair.public().sig()).unwrap();
        assert_eq!(*pair.public().enc(), derived);
    }

    #[test]
    fn test_chat_id_expansion() {
        let pair = ExtendedKeyPair::generate();
        let expanded = ExtendedPublicKey::from_chat_id(pair.public().chat_id()).unwrap();
        assert_eq!(*pair.public(), expanded);
    }

    #[test]
    fn test_sign_verify() {
        let pair = ExtendedKeyPair::generate();
        let sig = pair.sign(b"payload");
        pair.public().verify(b"payload", &sig).unwrap();
        assert_eq!(
            pair.public().verify(b"other", &sig),
            Err(CryptoError::InvalidSignature)
        );
    }

    #[test]
    fn test_secret_restore() {
        let pair = ExtendedKeyPair::generate();
        let restored = ExtendedKeyPair::from_secret_bytes(&pair.secret_bytes()).unwrap();
        assert_eq!(pair.public(), restored.public());
    }

    #[test]
    fn test_key_ordering_is_total() {
        let a = ExtendedKeyPair::generate();
        let b = ExtendedKeyPair::generate();
        let ord = compare_enc_keys(a.public().enc(), b.public().enc());
        let rev = compare_enc_keys(b.public().enc(), a.public().enc());
        assert_eq!(ord, rev.reverse());
    }

    #[test]
    fn test_session_keys_distinct() {
        let a = SessionKeys::generate();
        let b = SessionKeys::generate();
        assert_ne!(a.public(), b.public());
    }
}
