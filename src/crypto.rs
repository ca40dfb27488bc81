//! Cryptographic primitives facade.
//!
//! Every other module consumes cryptography only through this surface:
//! ECDH and ECDSA on P-256 (via the key handles in [`crate::keys`]),
//! HKDF-SHA-256, HMAC-SHA-256, AES-256-GCM, base64, and the platform RNG.

use crate::error::{Error, Result};
use crate::keys::{DhKeyPair, DhOutput, DhPublicKey, SigningKeyPair};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand_core::{OsRng, RngCore};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// HKDF info label for the X3DH shared secret
pub(crate) const X3DH_INFO: &[u8] = b"signal-x3dh-shared-secret";

/// HKDF info label for root-chain derivation
const ROOT_CHAIN_INFO: &[u8] = b"signal-root-chain";

/// HKDF info label for per-message AEAD material
const MSG_ENCRYPT_INFO: &[u8] = b"signal-msg-encrypt";

/// HMAC seed byte yielding the message key
const MESSAGE_KEY_SEED: u8 = 0x01;

/// HMAC seed byte yielding the next chain key
const CHAIN_KEY_SEED: u8 = 0x02;

/// Size of symmetric keys (32 bytes for 256-bit security)
pub const KEY_SIZE: usize = 32;

/// Size of the AES-GCM nonce
const NONCE_SIZE: usize = 12;

/// Registration ids occupy 14 bits
const REGISTRATION_ID_MASK: u16 = 0x3fff;

/// 32-byte symmetric key (root key, chain key, or message key) with
/// automatic zeroization
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey([u8; KEY_SIZE]);

impl SymmetricKey {
    /// Create from raw bytes
    #[must_use]
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get key as bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SymmetricKey([REDACTED])")
    }
}

/// Generate a fresh P-256 Diffie-Hellman key pair from the platform RNG
#[must_use]
pub fn generate_dh_keypair() -> DhKeyPair {
    DhKeyPair::generate(&mut OsRng)
}

/// Generate a fresh ECDSA P-256 signing key pair from the platform RNG
#[must_use]
pub fn generate_signing_keypair() -> SigningKeyPair {
    SigningKeyPair::generate(&mut OsRng)
}

/// Pick a random 14-bit registration identifier
#[must_use]
pub fn generate_registration_id() -> u16 {
    let mut bytes = [0u8; 2];
    OsRng.fill_bytes(&mut bytes);
    u16::from_be_bytes(bytes) & REGISTRATION_ID_MASK
}

/// ECDH: the shared X coordinate as 32 raw bytes
#[must_use]
pub fn dh(keypair: &DhKeyPair, public: &DhPublicKey) -> DhOutput {
    keypair.diffie_hellman(public)
}

/// HKDF-SHA-256 with explicit salt, info and output length.
///
/// A salt of 32 zero bytes is a legal value and is used at several
/// call sites.
#[must_use]
pub fn hkdf(ikm: &[u8], salt: &[u8], info: &[u8], length: usize) -> Vec<u8> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = vec![0u8; length];
    hk.expand(info, &mut okm)
        .expect("HKDF output length is valid");
    okm
}

/// HMAC-SHA-256
#[must_use]
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; KEY_SIZE] {
    type HmacSha256 = Hmac<Sha256>;
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC accepts any key size");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Root-chain KDF step.
///
/// `out = HKDF(ikm = dh_out, salt = rk, info = "signal-root-chain", 64)`,
/// split as `(rk_new, ck) = (out[0..32], out[32..64])`.
#[must_use]
pub fn kdf_rk(root_key: &SymmetricKey, dh_output: &DhOutput) -> (SymmetricKey, SymmetricKey) {
    let mut okm = hkdf(
        dh_output.as_bytes(),
        root_key.as_bytes(),
        ROOT_CHAIN_INFO,
        KEY_SIZE * 2,
    );

    let mut rk = [0u8; KEY_SIZE];
    let mut ck = [0u8; KEY_SIZE];
    rk.copy_from_slice(&okm[..KEY_SIZE]);
    ck.copy_from_slice(&okm[KEY_SIZE..]);
    okm.zeroize();

    (SymmetricKey(rk), SymmetricKey(ck))
}

/// Symmetric-chain KDF step.
///
/// `mk = HMAC(ck, 0x01)`, `ck_next = HMAC(ck, 0x02)`.
/// Returns `(ck_next, mk)`.
#[must_use]
pub fn kdf_ck(chain_key: &SymmetricKey) -> (SymmetricKey, SymmetricKey) {
    let message_key = hmac_sha256(chain_key.as_bytes(), &[MESSAGE_KEY_SEED]);
    let next_chain_key = hmac_sha256(chain_key.as_bytes(), &[CHAIN_KEY_SEED]);
    (SymmetricKey(next_chain_key), SymmetricKey(message_key))
}

/// Derive the AES-256 key and GCM nonce for one message key.
///
/// The nonce is deterministic in the message key. That is sound here
/// because every message key is used for exactly one payload: chain keys
/// advance before each use and skipped keys leave the cache when popped.
fn derive_aead_material(message_key: &SymmetricKey) -> ([u8; KEY_SIZE], [u8; NONCE_SIZE]) {
    let mut okm = hkdf(
        message_key.as_bytes(),
        &[0u8; KEY_SIZE],
        MSG_ENCRYPT_INFO,
        KEY_SIZE + NONCE_SIZE,
    );
    let mut key = [0u8; KEY_SIZE];
    let mut nonce = [0u8; NONCE_SIZE];
    key.copy_from_slice(&okm[..KEY_SIZE]);
    nonce.copy_from_slice(&okm[KEY_SIZE..]);
    okm.zeroize();
    (key, nonce)
}

/// Encrypt one payload under a single-use message key with AES-256-GCM
pub fn aead_encrypt(message_key: &SymmetricKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    let (mut key, nonce) = derive_aead_material(message_key);
    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| Error::InvalidKey)?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| Error::InvalidKey)?;
    key.zeroize();
    Ok(ciphertext)
}

/// Decrypt one payload; fails with [`Error::AuthenticationFailed`] if the
/// tag does not verify
pub fn aead_decrypt(message_key: &SymmetricKey, ciphertext: &[u8]) -> Result<Vec<u8>> {
    let (mut key, nonce) = derive_aead_material(message_key);
    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| Error::InvalidKey)?;
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&nonce), ciphertext)
        .map_err(|_| Error::AuthenticationFailed);
    key.zeroize();
    plaintext
}

/// Base64 (standard alphabet) encode, used for ciphertext and signatures
#[must_use]
pub fn b64_encode(data: &[u8]) -> String {
    STANDARD.encode(data)
}

/// Base64 (standard alphabet) decode
pub fn b64_decode(text: &str) -> Result<Vec<u8>> {
    STANDARD.decode(text).map_err(|_| Error::MalformedEnvelope)
}

/// Base64url (no padding) encode, used for JWK coordinates
#[must_use]
pub fn b64url_encode(data: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(data)
}

/// Base64url (no padding) decode
pub fn b64url_decode(text: &str) -> Result<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(text)
        .map_err(|_| Error::MalformedEnvelope)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hkdf_output_length() {
        let okm = hkdf(b"input", &[0u8; 32], b"test", 44);
        assert_eq!(okm.len(), 44);
    }

    #[test]
    fn hkdf_is_deterministic() {
        let a = hkdf(b"ikm", &[0u8; 32], b"info", 32);
        let b = hkdf(b"ikm", &[0u8; 32], b"info", 32);
        assert_eq!(a, b);
    }

    #[test]
    fn kdf_ck_diverges_from_input() {
        let ck = SymmetricKey::from_bytes([7u8; KEY_SIZE]);
        let (next, mk) = kdf_ck(&ck);
        assert_ne!(next.as_bytes(), ck.as_bytes());
        assert_ne!(mk.as_bytes(), ck.as_bytes());
        assert_ne!(next.as_bytes(), mk.as_bytes());
    }

    #[test]
    fn kdf_rk_splits_into_two_keys() {
        let rk = SymmetricKey::from_bytes([1u8; KEY_SIZE]);
        let alice = generate_dh_keypair();
        let bob = generate_dh_keypair();
        let dh_out = dh(&alice, &bob.public());

        let (rk1, ck1) = kdf_rk(&rk, &dh_out);
        let (rk2, ck2) = kdf_rk(&rk, &dh_out);

        assert_eq!(rk1.as_bytes(), rk2.as_bytes());
        assert_eq!(ck1.as_bytes(), ck2.as_bytes());
        assert_ne!(rk1.as_bytes(), ck1.as_bytes());
    }

    #[test]
    fn aead_round_trip() {
        let mk = SymmetricKey::from_bytes([3u8; KEY_SIZE]);
        let ciphertext = aead_encrypt(&mk, b"hello world").expect("encrypt should succeed");
        let plaintext = aead_decrypt(&mk, &ciphertext).expect("decrypt should succeed");
        assert_eq!(&plaintext, b"hello world");
    }

    #[test]
    fn aead_rejects_wrong_key() {
        let mk1 = SymmetricKey::from_bytes([3u8; KEY_SIZE]);
        let mk2 = SymmetricKey::from_bytes([4u8; KEY_SIZE]);
        let ciphertext = aead_encrypt(&mk1, b"secret").expect("encrypt should succeed");
        assert_eq!(
            aead_decrypt(&mk2, &ciphertext).unwrap_err(),
            Error::AuthenticationFailed
        );
    }

    #[test]
    fn aead_rejects_tampered_ciphertext() {
        let mk = SymmetricKey::from_bytes([3u8; KEY_SIZE]);
        let mut ciphertext = aead_encrypt(&mk, b"secret").expect("encrypt should succeed");
        ciphertext[0] ^= 1;
        assert_eq!(
            aead_decrypt(&mk, &ciphertext).unwrap_err(),
            Error::AuthenticationFailed
        );
    }

    #[test]
    fn base64_round_trips() {
        let data = vec![0u8, 1, 2, 250, 255];
        assert_eq!(b64_decode(&b64_encode(&data)).unwrap(), data);
        assert_eq!(b64url_decode(&b64url_encode(&data)).unwrap(), data);
    }

    #[test]
    fn registration_id_fits_fourteen_bits() {
        for _ in 0..64 {
            assert!(generate_registration_id() < (1 << 14));
        }
    }
}
