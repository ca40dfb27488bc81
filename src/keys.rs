//! Typed key handles for P-256 with JWK import/export.
//!
//! Every key that crosses a process boundary (wire envelopes, the key
//! directory, the durable store) travels as a JSON Web Key. The canonical
//! JSON form produced here has a fixed field order (`crv`, `kty`, `x`, `y`)
//! so that signatures and fingerprints computed over it are stable across
//! implementations.

use crate::crypto::{b64url_decode, b64url_encode};
use crate::error::{Error, Result};

use p256::ecdh;
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use p256::{EncodedPoint, FieldBytes, PublicKey, SecretKey};
use rand_core::CryptoRngCore;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// JWK key type for elliptic-curve keys
const JWK_KTY: &str = "EC";

/// JWK curve name
const JWK_CRV: &str = "P-256";

/// JSON Web Key map for a P-256 key.
///
/// Field order is the canonical serialization order; `d` is present only
/// for private keys and is never part of the canonical public form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    /// Curve name, always `"P-256"`
    pub crv: String,
    /// Key type, always `"EC"`
    pub kty: String,
    /// X coordinate, base64url without padding
    pub x: String,
    /// Y coordinate, base64url without padding
    pub y: String,
    /// Private scalar, base64url without padding; absent for public keys
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub d: Option<String>,
}

impl Jwk {
    /// Strip the private scalar, leaving the public half.
    #[must_use]
    pub fn public_half(&self) -> Jwk {
        Jwk {
            d: None,
            ..self.clone()
        }
    }
}

fn public_to_jwk(key: &PublicKey) -> Jwk {
    let point = key.to_encoded_point(false);
    let x = point.x().expect("uncompressed point has an x coordinate");
    let y = point.y().expect("uncompressed point has a y coordinate");
    Jwk {
        crv: JWK_CRV.to_string(),
        kty: JWK_KTY.to_string(),
        x: b64url_encode(x),
        y: b64url_encode(y),
        d: None,
    }
}

fn public_from_jwk(jwk: &Jwk) -> Result<PublicKey> {
    if jwk.kty != JWK_KTY || jwk.crv != JWK_CRV {
        return Err(Error::InvalidKey);
    }
    let x = b64url_decode(&jwk.x).map_err(|_| Error::InvalidKey)?;
    let y = b64url_decode(&jwk.y).map_err(|_| Error::InvalidKey)?;
    if x.len() != 32 || y.len() != 32 {
        return Err(Error::InvalidKey);
    }
    let point = EncodedPoint::from_affine_coordinates(
        FieldBytes::from_slice(&x),
        FieldBytes::from_slice(&y),
        false,
    );
    let key: Option<PublicKey> = PublicKey::from_encoded_point(&point).into();
    key.ok_or(Error::InvalidKey)
}

fn secret_to_jwk(secret: &SecretKey) -> Jwk {
    let mut jwk = public_to_jwk(&secret.public_key());
    let mut scalar = secret.to_bytes().to_vec();
    jwk.d = Some(b64url_encode(&scalar));
    scalar.zeroize();
    jwk
}

fn secret_from_jwk(jwk: &Jwk) -> Result<SecretKey> {
    // Validate the public half too, so a mismatched JWK is rejected early.
    let public = public_from_jwk(jwk)?;
    let d = jwk.d.as_ref().ok_or(Error::InvalidKey)?;
    let mut scalar = b64url_decode(d).map_err(|_| Error::InvalidKey)?;
    let secret = SecretKey::from_slice(&scalar).map_err(|_| Error::InvalidKey);
    scalar.zeroize();
    let secret = secret?;
    if secret.public_key() != public {
        return Err(Error::InvalidKey);
    }
    Ok(secret)
}

fn canonical_json(key: &PublicKey) -> String {
    serde_json::to_string(&public_to_jwk(key)).expect("JWK serialization is infallible")
}

/// Public half of a P-256 Diffie-Hellman key pair
#[derive(Clone, PartialEq, Eq)]
pub struct DhPublicKey(PublicKey);

impl DhPublicKey {
    /// Import from a JWK map. Fails if the point is not on the curve.
    pub fn from_jwk(jwk: &Jwk) -> Result<Self> {
        public_from_jwk(jwk).map(Self)
    }

    /// Export as a JWK map
    #[must_use]
    pub fn to_jwk(&self) -> Jwk {
        public_to_jwk(&self.0)
    }

    /// Canonical JSON encoding, the byte string signatures and
    /// fingerprints are computed over
    #[must_use]
    pub fn canonical_json(&self) -> String {
        canonical_json(&self.0)
    }

    /// SEC1 uncompressed encoding (65 bytes), used to index the
    /// skipped-key cache and to compare ratchet keys
    #[must_use]
    pub fn sec1_bytes(&self) -> Vec<u8> {
        self.0.to_encoded_point(false).as_bytes().to_vec()
    }
}

impl std::fmt::Debug for DhPublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DhPublicKey([REDACTED])")
    }
}

/// P-256 Diffie-Hellman key pair
#[derive(Clone)]
pub struct DhKeyPair {
    secret: SecretKey,
}

impl DhKeyPair {
    /// Generate a new random key pair
    pub fn generate<R: CryptoRngCore>(rng: &mut R) -> Self {
        Self {
            secret: SecretKey::random(rng),
        }
    }

    /// The public half
    #[must_use]
    pub fn public(&self) -> DhPublicKey {
        DhPublicKey(self.secret.public_key())
    }

    /// Export as a private JWK map (includes `d`)
    #[must_use]
    pub fn to_jwk(&self) -> Jwk {
        secret_to_jwk(&self.secret)
    }

    /// Import from a private JWK map
    pub fn from_jwk(jwk: &Jwk) -> Result<Self> {
        secret_from_jwk(jwk).map(|secret| Self { secret })
    }

    /// ECDH agreement: the shared X coordinate as 32 raw bytes
    #[must_use]
    pub fn diffie_hellman(&self, public: &DhPublicKey) -> DhOutput {
        let shared = ecdh::diffie_hellman(self.secret.to_nonzero_scalar(), public.0.as_affine());
        let mut out = [0u8; 32];
        out.copy_from_slice(shared.raw_secret_bytes().as_slice());
        DhOutput(out)
    }
}

impl std::fmt::Debug for DhKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DhKeyPair([REDACTED])")
    }
}

/// Output of a Diffie-Hellman operation (32 bytes), zeroized on drop
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DhOutput([u8; 32]);

impl DhOutput {
    /// Raw shared-secret bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for DhOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DhOutput([REDACTED])")
    }
}

/// ECDSA P-256 signing key pair for prekey signatures
#[derive(Clone)]
pub struct SigningKeyPair {
    secret: SecretKey,
}

impl SigningKeyPair {
    /// Generate a new random signing pair
    pub fn generate<R: CryptoRngCore>(rng: &mut R) -> Self {
        Self {
            secret: SecretKey::random(rng),
        }
    }

    /// The verifying (public) half
    #[must_use]
    pub fn public(&self) -> SigningPublicKey {
        SigningPublicKey(self.secret.public_key())
    }

    /// Export as a private JWK map
    #[must_use]
    pub fn to_jwk(&self) -> Jwk {
        secret_to_jwk(&self.secret)
    }

    /// Import from a private JWK map
    pub fn from_jwk(jwk: &Jwk) -> Result<Self> {
        secret_from_jwk(jwk).map(|secret| Self { secret })
    }

    /// Sign a message, returning the 64-byte fixed-width signature
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        let signing = SigningKey::from_bytes(&self.secret.to_bytes()).map_err(|_| Error::InvalidKey)?;
        let signature: Signature = signing.sign(message);
        Ok(signature.to_bytes().to_vec())
    }
}

impl std::fmt::Debug for SigningKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SigningKeyPair([REDACTED])")
    }
}

/// ECDSA P-256 verifying key
#[derive(Clone, PartialEq, Eq)]
pub struct SigningPublicKey(PublicKey);

impl SigningPublicKey {
    /// Import from a JWK map
    pub fn from_jwk(jwk: &Jwk) -> Result<Self> {
        public_from_jwk(jwk).map(Self)
    }

    /// Export as a JWK map
    #[must_use]
    pub fn to_jwk(&self) -> Jwk {
        public_to_jwk(&self.0)
    }

    /// Verify a 64-byte signature over `message`
    #[must_use]
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        let Ok(signature) = Signature::from_slice(signature) else {
            return false;
        };
        let point = self.0.to_encoded_point(false);
        let Ok(verifying) = VerifyingKey::from_sec1_bytes(point.as_bytes()) else {
            return false;
        };
        verifying.verify(message, &signature).is_ok()
    }
}

impl std::fmt::Debug for SigningPublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SigningPublicKey([REDACTED])")
    }
}
