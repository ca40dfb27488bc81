//! X3DH (Extended Triple Diffie-Hellman) asynchronous key agreement.
//!
//! Bootstraps a pairwise session without both parties being online:
//!
//! 1. The responder publishes a prekey bundle (identity key, signed
//!    prekey, optional one-time prekeys) through the key directory.
//! 2. The initiator fetches the bundle and computes
//!    - `DH1 = DH(IK_A, SPK_B)`
//!    - `DH2 = DH(EK_A, IK_B)`
//!    - `DH3 = DH(EK_A, SPK_B)`
//!    - `DH4 = DH(EK_A, OPK_B)` if a one-time prekey was claimed
//!    - `SK = HKDF(DH1 || DH2 || DH3 [|| DH4])`
//! 3. The responder reconstructs the same `SK` from the initiator's
//!    first-message preamble.
//!
//! The DH concatenation order is cryptographically significant; any
//! deviation desynchronises both sides.

use crate::crypto::{self, SymmetricKey, KEY_SIZE};
use crate::error::{Error, Result};
use crate::keys::{DhKeyPair, DhOutput, DhPublicKey, SigningPublicKey};

use zeroize::Zeroize;

/// Prekey bundle fetched from the key directory.
///
/// Contains everything the initiator needs to perform X3DH against an
/// offline responder. Request-scoped; never persisted.
#[derive(Debug, Clone)]
pub struct PreKeyBundle {
    /// Responder's long-term identity public key
    pub identity_key: DhPublicKey,
    /// Responder's signing public key, used to verify the signed prekey
    pub signing_key: SigningPublicKey,
    /// Id of the responder's current signed prekey
    pub signed_prekey_id: u32,
    /// Responder's current signed prekey
    pub signed_prekey: DhPublicKey,
    /// Signature over the canonical JWK JSON of `signed_prekey`
    pub signed_prekey_signature: Vec<u8>,
    /// One claimed one-time prekey, if the pool was not exhausted
    pub one_time_prekey: Option<(u32, DhPublicKey)>,
}

impl PreKeyBundle {
    /// Verify the signed-prekey signature against the bundle's signing key
    pub fn verify_signature(&self) -> Result<()> {
        let message = self.signed_prekey.canonical_json();
        if self
            .signing_key
            .verify(message.as_bytes(), &self.signed_prekey_signature)
        {
            Ok(())
        } else {
            Err(Error::BundleInvalid)
        }
    }
}

/// Result of the initiator-side agreement
pub struct InitiatorResult {
    /// The shared secret both sides derive
    pub shared_secret: SymmetricKey,
    /// Ephemeral public key to echo in the first-message preamble
    pub ephemeral_key: DhPublicKey,
    /// Id of the one-time prekey consumed from the bundle, if any
    pub used_one_time_prekey_id: Option<u32>,
}

impl std::fmt::Debug for InitiatorResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitiatorResult")
            .field("used_one_time_prekey_id", &self.used_one_time_prekey_id)
            .finish_non_exhaustive()
    }
}

fn derive_shared_secret(
    dh1: &DhOutput,
    dh2: &DhOutput,
    dh3: &DhOutput,
    dh4: Option<&DhOutput>,
) -> SymmetricKey {
    let mut input = Vec::with_capacity(KEY_SIZE * 4);
    input.extend_from_slice(dh1.as_bytes());
    input.extend_from_slice(dh2.as_bytes());
    input.extend_from_slice(dh3.as_bytes());
    if let Some(dh4) = dh4 {
        input.extend_from_slice(dh4.as_bytes());
    }

    let mut okm = crypto::hkdf(&input, &[0u8; KEY_SIZE], crypto::X3DH_INFO, KEY_SIZE);
    let mut secret = [0u8; KEY_SIZE];
    secret.copy_from_slice(&okm);

    input.zeroize();
    okm.zeroize();
    SymmetricKey::from_bytes(secret)
}

/// Initiator side of the agreement.
///
/// Verifies the bundle signature, generates a fresh ephemeral pair, and
/// combines the four DH outputs into the shared secret.
pub fn initiate(local_identity: &DhKeyPair, bundle: &PreKeyBundle) -> Result<InitiatorResult> {
    bundle.verify_signature()?;

    let ephemeral = crypto::generate_dh_keypair();

    let dh1 = crypto::dh(local_identity, &bundle.signed_prekey);
    let dh2 = crypto::dh(&ephemeral, &bundle.identity_key);
    let dh3 = crypto::dh(&ephemeral, &bundle.signed_prekey);
    let dh4 = bundle
        .one_time_prekey
        .as_ref()
        .map(|(_, opk)| crypto::dh(&ephemeral, opk));

    let shared_secret = derive_shared_secret(&dh1, &dh2, &dh3, dh4.as_ref());

    Ok(InitiatorResult {
        shared_secret,
        ephemeral_key: ephemeral.public(),
        used_one_time_prekey_id: bundle.one_time_prekey.as_ref().map(|(id, _)| *id),
    })
}

/// Responder side of the agreement.
///
/// Mirrors the initiator's four DH computations from the first-message
/// preamble, yielding a bit-identical shared secret.
pub fn respond(
    local_identity: &DhKeyPair,
    signed_prekey: &DhKeyPair,
    one_time_prekey: Option<&DhKeyPair>,
    initiator_identity: &DhPublicKey,
    initiator_ephemeral: &DhPublicKey,
) -> SymmetricKey {
    let dh1 = crypto::dh(signed_prekey, initiator_identity);
    let dh2 = crypto::dh(local_identity, initiator_ephemeral);
    let dh3 = crypto::dh(signed_prekey, initiator_ephemeral);
    let dh4 = one_time_prekey.map(|opk| crypto::dh(opk, initiator_ephemeral));

    derive_shared_secret(&dh1, &dh2, &dh3, dh4.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{generate_dh_keypair, generate_signing_keypair};

    struct Responder {
        identity: DhKeyPair,
        signed_prekey: DhKeyPair,
        one_time_prekey: DhKeyPair,
        bundle: PreKeyBundle,
    }

    fn responder_with_bundle() -> Responder {
        let identity = generate_dh_keypair();
        let signing = generate_signing_keypair();
        let signed_prekey = generate_dh_keypair();
        let one_time_prekey = generate_dh_keypair();

        let signature = signing
            .sign(signed_prekey.public().canonical_json().as_bytes())
            .expect("signing should succeed");

        let bundle = PreKeyBundle {
            identity_key: identity.public(),
            signing_key: signing.public(),
            signed_prekey_id: 1,
            signed_prekey: signed_prekey.public(),
            signed_prekey_signature: signature,
            one_time_prekey: Some((1, one_time_prekey.public())),
        };

        Responder {
            identity,
            signed_prekey,
            one_time_prekey,
            bundle,
        }
    }

    #[test]
    fn both_sides_derive_identical_secret_with_opk() {
        let responder = responder_with_bundle();
        let initiator_identity = generate_dh_keypair();

        let init = initiate(&initiator_identity, &responder.bundle).unwrap();
        assert_eq!(init.used_one_time_prekey_id, Some(1));

        let responder_secret = respond(
            &responder.identity,
            &responder.signed_prekey,
            Some(&responder.one_time_prekey),
            &initiator_identity.public(),
            &init.ephemeral_key,
        );

        assert_eq!(
            init.shared_secret.as_bytes(),
            responder_secret.as_bytes()
        );
    }

    #[test]
    fn both_sides_derive_identical_secret_without_opk() {
        let mut responder = responder_with_bundle();
        responder.bundle.one_time_prekey = None;
        let initiator_identity = generate_dh_keypair();

        let init = initiate(&initiator_identity, &responder.bundle).unwrap();
        assert!(init.used_one_time_prekey_id.is_none());

        let responder_secret = respond(
            &responder.identity,
            &responder.signed_prekey,
            None,
            &initiator_identity.public(),
            &init.ephemeral_key,
        );

        assert_eq!(
            init.shared_secret.as_bytes(),
            responder_secret.as_bytes()
        );
    }

    #[test]
    fn opk_participation_changes_the_secret() {
        let responder = responder_with_bundle();
        let initiator_identity = generate_dh_keypair();

        let with_opk = initiate(&initiator_identity, &responder.bundle).unwrap();

        let mut stripped = responder.bundle.clone();
        stripped.one_time_prekey = None;
        let without_opk = initiate(&initiator_identity, &stripped).unwrap();

        assert_ne!(
            with_opk.shared_secret.as_bytes(),
            without_opk.shared_secret.as_bytes()
        );
    }

    #[test]
    fn tampered_signature_is_refused() {
        let mut responder = responder_with_bundle();
        responder.bundle.signed_prekey_signature[0] ^= 1;

        let initiator_identity = generate_dh_keypair();
        let result = initiate(&initiator_identity, &responder.bundle);
        assert_eq!(result.unwrap_err(), Error::BundleInvalid);
    }

    #[test]
    fn signature_over_different_prekey_is_refused() {
        let mut responder = responder_with_bundle();
        responder.bundle.signed_prekey = generate_dh_keypair().public();

        let initiator_identity = generate_dh_keypair();
        let result = initiate(&initiator_identity, &responder.bundle);
        assert_eq!(result.unwrap_err(), Error::BundleInvalid);
    }
}
