//! Double Ratchet session state machine.
//!
//! Combines a Diffie-Hellman "outer" ratchet (stepped on each round trip)
//! with a symmetric "inner" ratchet (stepped on each message), providing
//! forward secrecy and tolerance for out-of-order delivery through a
//! bounded skipped-key cache.
//!
//! ## State
//!
//! Each party maintains:
//! - Root key `RK`, updated on every DH ratchet step
//! - Sending chain key `CKs` and receiving chain key `CKr`
//! - Its own ratchet pair `DHs` and the latest remote ratchet key `DHr`
//! - Counters `Ns`, `Nr` and the previous-chain length `PN`
//! - Skipped message keys indexed by (remote key bytes, message number)

use crate::crypto::{self, SymmetricKey};
use crate::envelope::Header;
use crate::error::{Error, Result};
use crate::keys::{DhKeyPair, DhPublicKey, Jwk};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use zeroize::Zeroize;

/// Maximum number of messages that may be skipped within one receiving
/// chain; a larger gap refuses the message
pub const MAX_SKIP: u32 = 256;

/// Cache key for a skipped message key: the sender's full ratchet public
/// key (SEC1 bytes) plus the message number. Keys from superseded chains
/// must never be confused with keys from the current chain.
type SkippedKeyId = (Vec<u8>, u32);

/// Live Double Ratchet state for one pairwise session
pub struct DoubleRatchet {
    /// Local ratchet pair
    dhs: DhKeyPair,
    /// Latest remote ratchet public key; absent in the responder's
    /// initial state
    dhr: Option<DhPublicKey>,
    /// Root key
    root_key: SymmetricKey,
    /// Sending chain key; absent until the first DH step installs it
    send_chain_key: Option<SymmetricKey>,
    /// Receiving chain key; absent until the first inbound DH step
    recv_chain_key: Option<SymmetricKey>,
    /// Messages sent in the current chain
    ns: u32,
    /// Messages received in the current chain
    nr: u32,
    /// Length of the previous sending chain
    pn: u32,
    /// Skipped message keys for out-of-order delivery
    skipped: HashMap<SkippedKeyId, SymmetricKey>,
}

impl DoubleRatchet {
    /// Session-initiator initial state, entered after X3DH `initiate`.
    ///
    /// Generates a fresh ratchet pair and immediately advances the root
    /// chain against the responder's signed prekey, so a sending chain
    /// exists before the first encrypt.
    #[must_use]
    pub fn init_alice(shared_secret: SymmetricKey, remote_signed_prekey: DhPublicKey) -> Self {
        let dhs = crypto::generate_dh_keypair();
        let dh_out = crypto::dh(&dhs, &remote_signed_prekey);
        let (root_key, send_chain_key) = crypto::kdf_rk(&shared_secret, &dh_out);

        Self {
            dhs,
            dhr: Some(remote_signed_prekey),
            root_key,
            send_chain_key: Some(send_chain_key),
            recv_chain_key: None,
            ns: 0,
            nr: 0,
            pn: 0,
            skipped: HashMap::new(),
        }
    }

    /// Session-responder initial state, entered after X3DH `respond`.
    ///
    /// The local signed prekey pair becomes the first ratchet pair; the
    /// first inbound message triggers the first DH step.
    #[must_use]
    pub fn init_bob(shared_secret: SymmetricKey, signed_prekey_pair: DhKeyPair) -> Self {
        Self {
            dhs: signed_prekey_pair,
            dhr: None,
            root_key: shared_secret,
            send_chain_key: None,
            recv_chain_key: None,
            ns: 0,
            nr: 0,
            pn: 0,
            skipped: HashMap::new(),
        }
    }

    /// Encrypt one plaintext, advancing the sending chain.
    ///
    /// Returns the header and the base64 ciphertext. Fails with
    /// [`Error::NotInitialized`] if no sending chain exists yet (the
    /// responder before its first DH step).
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<(Header, String)> {
        let chain_key = self.send_chain_key.as_ref().ok_or(Error::NotInitialized)?;
        let (next_chain_key, message_key) = crypto::kdf_ck(chain_key);

        let header = Header {
            dh: self.dhs.public().to_jwk(),
            pn: self.pn,
            n: self.ns,
        };

        let ciphertext = crypto::aead_encrypt(&message_key, plaintext)?;

        self.send_chain_key = Some(next_chain_key);
        self.ns += 1;

        Ok((header, crypto::b64_encode(&ciphertext)))
    }

    /// Decrypt one envelope payload.
    ///
    /// Tries the skipped-key cache first, performs a DH ratchet step when
    /// the header carries a new remote key, caches any in-chain skipped
    /// keys, then advances the receiving chain.
    ///
    /// Failure semantics: [`Error::TooManySkipped`] leaves the state
    /// exactly as it was; [`Error::AuthenticationFailed`] retains
    /// DH-step mutations (the step is driven by the header) but rolls
    /// back the receiving counter, receiving chain key, and the skipped
    /// keys this call inserted.
    pub fn decrypt(&mut self, header: &Header, ciphertext_b64: &str) -> Result<Vec<u8>> {
        let remote = DhPublicKey::from_jwk(&header.dh)?;
        let ciphertext = crypto::b64_decode(ciphertext_b64)?;

        let cache_id = (remote.sec1_bytes(), header.n);
        if let Some(message_key) = self.skipped.remove(&cache_id) {
            return match crypto::aead_decrypt(&message_key, &ciphertext) {
                Ok(plaintext) => Ok(plaintext),
                Err(err) => {
                    // The key was not consumed; keep it for a retry.
                    self.skipped.insert(cache_id, message_key);
                    Err(err)
                }
            };
        }

        let saved = self.clone_state();
        match self.decrypt_inner(header, &remote, &ciphertext) {
            Err(Error::TooManySkipped) => {
                *self = saved;
                Err(Error::TooManySkipped)
            }
            other => other,
        }
    }

    fn decrypt_inner(
        &mut self,
        header: &Header,
        remote: &DhPublicKey,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>> {
        let remote_changed = match &self.dhr {
            Some(dhr) => dhr.sec1_bytes() != remote.sec1_bytes(),
            None => true,
        };
        if remote_changed {
            self.dh_ratchet(header, remote)?;
        }

        let chain_key_before = self.recv_chain_key.clone();
        let nr_before = self.nr;
        let inserted = self.skip_message_keys(header.n)?;

        let chain_key = self.recv_chain_key.as_ref().ok_or(Error::NotInitialized)?;
        let (next_chain_key, message_key) = crypto::kdf_ck(chain_key);
        self.recv_chain_key = Some(next_chain_key);
        self.nr += 1;

        match crypto::aead_decrypt(&message_key, ciphertext) {
            Ok(plaintext) => Ok(plaintext),
            Err(err) => {
                self.recv_chain_key = chain_key_before;
                self.nr = nr_before;
                for id in inserted {
                    self.skipped.remove(&id);
                }
                Err(err)
            }
        }
    }

    /// DH ratchet step on a new remote key.
    ///
    /// Caches not-yet-seen keys from the tail of the old remote chain
    /// (bounded by `header.pn`), then derives a fresh receiving chain and
    /// a fresh sending chain under a new local pair.
    fn dh_ratchet(&mut self, header: &Header, remote: &DhPublicKey) -> Result<()> {
        if self.recv_chain_key.is_some() {
            self.skip_message_keys(header.pn)?;
        }

        self.pn = self.ns;
        self.ns = 0;
        self.nr = 0;
        self.dhr = Some(remote.clone());

        let dh_out = crypto::dh(&self.dhs, remote);
        let (root_key, recv_chain_key) = crypto::kdf_rk(&self.root_key, &dh_out);
        self.root_key = root_key;
        self.recv_chain_key = Some(recv_chain_key);

        self.dhs = crypto::generate_dh_keypair();
        let dh_out = crypto::dh(&self.dhs, remote);
        let (root_key, send_chain_key) = crypto::kdf_rk(&self.root_key, &dh_out);
        self.root_key = root_key;
        self.send_chain_key = Some(send_chain_key);

        Ok(())
    }

    /// Advance the receiving chain up to (not including) `until`, caching
    /// each intermediate message key.
    ///
    /// Returns the cache ids inserted by this call so a failed decrypt
    /// can evict them. Refuses with [`Error::TooManySkipped`] when the
    /// gap exceeds [`MAX_SKIP`]; `until` values behind the chain position
    /// are a no-op (already-seen numbers are served from the cache,
    /// never by rewinding).
    fn skip_message_keys(&mut self, until: u32) -> Result<Vec<SkippedKeyId>> {
        if until.saturating_sub(self.nr) > MAX_SKIP {
            return Err(Error::TooManySkipped);
        }

        let mut inserted = Vec::new();
        if self.nr >= until {
            return Ok(inserted);
        }

        let chain_key = self.recv_chain_key.as_ref().ok_or(Error::NotInitialized)?;
        let remote_bytes = self
            .dhr
            .as_ref()
            .ok_or(Error::NotInitialized)?
            .sec1_bytes();

        let mut current = chain_key.clone();
        while self.nr < until {
            let (next_chain_key, message_key) = crypto::kdf_ck(&current);
            let id = (remote_bytes.clone(), self.nr);
            self.skipped.insert(id.clone(), message_key);
            inserted.push(id);
            current = next_chain_key;
            self.nr += 1;
        }
        self.recv_chain_key = Some(current);

        Ok(inserted)
    }

    /// Number of cached skipped message keys
    #[must_use]
    pub fn skipped_key_count(&self) -> usize {
        self.skipped.len()
    }

    /// Current sending-chain ratchet public key
    #[must_use]
    pub fn ratchet_public_key(&self) -> DhPublicKey {
        self.dhs.public()
    }

    fn clone_state(&self) -> Self {
        Self {
            dhs: self.dhs.clone(),
            dhr: self.dhr.clone(),
            root_key: self.root_key.clone(),
            send_chain_key: self.send_chain_key.clone(),
            recv_chain_key: self.recv_chain_key.clone(),
            ns: self.ns,
            nr: self.nr,
            pn: self.pn,
            skipped: self.skipped.clone(),
        }
    }

    /// Snapshot the full state for persistence
    #[must_use]
    pub fn to_snapshot(&self) -> RatchetSnapshot {
        RatchetSnapshot {
            dh_sending: self.dhs.to_jwk(),
            dh_remote: self.dhr.as_ref().map(DhPublicKey::to_jwk),
            root_key: crypto::b64_encode(self.root_key.as_bytes()),
            send_chain_key: self
                .send_chain_key
                .as_ref()
                .map(|ck| crypto::b64_encode(ck.as_bytes())),
            recv_chain_key: self
                .recv_chain_key
                .as_ref()
                .map(|ck| crypto::b64_encode(ck.as_bytes())),
            ns: self.ns,
            nr: self.nr,
            pn: self.pn,
            skipped: self
                .skipped
                .iter()
                .map(|((dh, n), mk)| SkippedKey {
                    dh: crypto::b64_encode(dh),
                    n: *n,
                    mk: crypto::b64_encode(mk.as_bytes()),
                })
                .collect(),
        }
    }

    /// Rehydrate a live ratchet from a persisted snapshot
    pub fn from_snapshot(snapshot: &RatchetSnapshot) -> Result<Self> {
        let dhs = DhKeyPair::from_jwk(&snapshot.dh_sending)?;
        let dhr = snapshot
            .dh_remote
            .as_ref()
            .map(|jwk| DhPublicKey::from_jwk(jwk))
            .transpose()?;

        let mut skipped = HashMap::with_capacity(snapshot.skipped.len());
        for entry in &snapshot.skipped {
            let dh = decode_key_bytes(&entry.dh)?;
            skipped.insert((dh, entry.n), decode_symmetric(&entry.mk)?);
        }

        Ok(Self {
            dhs,
            dhr,
            root_key: decode_symmetric(&snapshot.root_key)?,
            send_chain_key: snapshot
                .send_chain_key
                .as_deref()
                .map(decode_symmetric)
                .transpose()?,
            recv_chain_key: snapshot
                .recv_chain_key
                .as_deref()
                .map(decode_symmetric)
                .transpose()?,
            ns: snapshot.ns,
            nr: snapshot.nr,
            pn: snapshot.pn,
            skipped,
        })
    }
}

fn decode_key_bytes(text: &str) -> Result<Vec<u8>> {
    crypto::b64_decode(text).map_err(|_| Error::Storage("corrupt ratchet snapshot".to_string()))
}

fn decode_symmetric(text: &str) -> Result<SymmetricKey> {
    let bytes = decode_key_bytes(text)?;
    let key: [u8; 32] = bytes
        .try_into()
        .map_err(|_| Error::Storage("corrupt ratchet snapshot".to_string()))?;
    Ok(SymmetricKey::from_bytes(key))
}

impl std::fmt::Debug for DoubleRatchet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DoubleRatchet")
            .field("ns", &self.ns)
            .field("nr", &self.nr)
            .field("pn", &self.pn)
            .field("skipped", &self.skipped.len())
            .finish_non_exhaustive()
    }
}

impl Zeroize for DoubleRatchet {
    fn zeroize(&mut self) {
        self.root_key.zeroize();
        self.send_chain_key.zeroize();
        self.recv_chain_key.zeroize();
        self.skipped.clear();
    }
}

impl Drop for DoubleRatchet {
    fn drop(&mut self) {
        self.zeroize();
    }
}

/// Serialized form of a live ratchet, written to the session store after
/// every encrypt and every successful decrypt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatchetSnapshot {
    /// Local ratchet pair as a private JWK
    pub dh_sending: Jwk,
    /// Latest remote ratchet key, if one has been seen
    pub dh_remote: Option<Jwk>,
    /// Root key, base64
    pub root_key: String,
    /// Sending chain key, base64
    pub send_chain_key: Option<String>,
    /// Receiving chain key, base64
    pub recv_chain_key: Option<String>,
    /// Sending counter
    pub ns: u32,
    /// Receiving counter
    pub nr: u32,
    /// Previous sending-chain length
    pub pn: u32,
    /// Cached skipped message keys
    pub skipped: Vec<SkippedKey>,
}

/// One cached skipped message key in serialized form
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkippedKey {
    /// Remote ratchet public key, base64 SEC1 bytes
    pub dh: String,
    /// Message number within that chain
    pub n: u32,
    /// Message key, base64
    pub mk: String,
}
