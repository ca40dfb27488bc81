//! Protocol orchestrator: the facade the chat layer talks to.
//!
//! Owns identity provisioning and publication, the signed-prekey rotation
//! and one-time-prekey refill policies, the per-conversation session
//! registry, and the encrypt/decrypt paths that drive X3DH and the
//! Double Ratchet.
//!
//! ## Concurrency
//!
//! Each conversation has its own async guard; the read session → advance
//! ratchet → persist session sequence runs entirely under it, so two
//! operations on the same conversation observe strictly ordered ratchet
//! states. Operations on different conversations proceed in parallel.
//! Rotation and refill are writes to per-user global state and run under
//! a separate per-user guard; identity reads do not take it.

use crate::crypto;
use crate::directory::{
    DirectoryIdentity, KeyDirectory, PublishedOneTimePrekey, PublishedSignedPrekey,
};
use crate::double_ratchet::DoubleRatchet;
use crate::envelope::{self, Envelope, X3dhPreamble, ENVELOPE_VERSION};
use crate::error::{Error, Result};
use crate::fingerprint;
use crate::keys::{DhKeyPair, DhPublicKey, SigningKeyPair, SigningPublicKey};
use crate::storage::{
    HandshakeRecord, IdentityRecord, KeyStore, OneTimePrekeyRecord, SessionRecord,
    SignedPrekeyRecord,
};
use crate::x3dh::{self, PreKeyBundle};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// A fresh signed prekey is generated and published when the last
/// rotation is older than this (seven days)
pub const SIGNED_PREKEY_ROTATION_MS: u64 = 7 * 24 * 60 * 60 * 1000;

/// Refill the one-time prekey pool when the published unused count drops
/// below this
const ONE_TIME_PREKEY_MIN: u32 = 10;

/// Pool size the refill tops back up to
const ONE_TIME_PREKEY_TARGET: u32 = 20;

const META_NEXT_SIGNED: &str = "next-signed-prekey-id";
const META_CURRENT_SIGNED: &str = "current-signed-prekey-id";
const META_NEXT_ONE_TIME: &str = "next-one-time-prekey-id";
const META_LAST_ROTATION: &str = "last-rotation-ms";

/// Time source for rotation decisions
pub trait Clock: Send + Sync {
    /// Current unix time in milliseconds
    fn now_ms(&self) -> u64;
}

/// Wall-clock [`Clock`]
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0)
    }
}

/// Outcome of a decrypt call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decrypted {
    /// The envelope decrypted to this plaintext
    Plaintext(String),
    /// The input was not a protocol ciphertext; passed through unchanged
    NotEncrypted(String),
}

struct LiveSession {
    remote_user_id: String,
    ratchet: DoubleRatchet,
    x3dh_completed: bool,
    handshake: Option<HandshakeRecord>,
    created_at_ms: u64,
}

impl LiveSession {
    fn from_record(record: SessionRecord) -> Result<Self> {
        Ok(Self {
            remote_user_id: record.remote_user_id,
            ratchet: DoubleRatchet::from_snapshot(&record.ratchet)?,
            x3dh_completed: record.x3dh_completed,
            handshake: record.handshake,
            created_at_ms: record.created_at_ms,
        })
    }
}

type SessionSlot = Arc<Mutex<Option<LiveSession>>>;

/// The cryptographic engine for one signed-in user.
///
/// Lifecycle is tied to sign-in: construct after sign-in, call
/// [`Engine::initialize`], then route conversation traffic through
/// [`Engine::encrypt`] and [`Engine::decrypt`]. [`Engine::clear_all`]
/// destroys everything on sign-out.
pub struct Engine {
    user_id: String,
    store: Arc<dyn KeyStore>,
    directory: Arc<dyn KeyDirectory>,
    clock: Arc<dyn Clock>,
    sessions: Mutex<HashMap<String, SessionSlot>>,
    user_guard: Mutex<()>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("user_id", &self.user_id)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Create an engine using the wall clock
    pub fn new(
        user_id: impl Into<String>,
        store: Arc<dyn KeyStore>,
        directory: Arc<dyn KeyDirectory>,
    ) -> Self {
        Self::with_clock(user_id, store, directory, Arc::new(SystemClock))
    }

    /// Create an engine with an injected clock (rotation tests)
    pub fn with_clock(
        user_id: impl Into<String>,
        store: Arc<dyn KeyStore>,
        directory: Arc<dyn KeyDirectory>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            store,
            directory,
            clock,
            sessions: Mutex::new(HashMap::new()),
            user_guard: Mutex::new(()),
        }
    }

    /// Pure predicate: is `text` a protocol envelope?
    #[must_use]
    pub fn is_signal_envelope(text: &str) -> bool {
        envelope::is_signal_envelope(text)
    }

    /// Prepare the engine for use.
    ///
    /// First run: generate and persist the identity, signing pair,
    /// registration id, signed prekey 1 and one-time prekeys 1..=20, and
    /// publish the public halves. Subsequent runs: re-publish if the
    /// directory lost the identity record, then run the rotation and
    /// refill checks concurrently. Rotation/refill failures are
    /// non-fatal; the next call re-checks.
    pub async fn initialize(&self) -> Result<()> {
        let _guard = self.user_guard.lock().await;

        match self.store.get_identity(&self.user_id).await? {
            None => self.provision().await,
            Some(identity) => {
                if self.directory.fetch_identity(&self.user_id).await?.is_none() {
                    self.republish(&identity).await?;
                }
                let (rotation, refill) = tokio::join!(
                    self.rotate_signed_prekey_if_due(&identity),
                    self.refill_one_time_prekeys()
                );
                if let Err(err) = rotation {
                    warn!(user = %self.user_id, error = %err, "signed prekey rotation failed");
                }
                if let Err(err) = refill {
                    warn!(user = %self.user_id, error = %err, "one-time prekey refill failed");
                }
                Ok(())
            }
        }
    }

    async fn provision(&self) -> Result<()> {
        let now = self.clock.now_ms();
        let dh = crypto::generate_dh_keypair();
        let signing = crypto::generate_signing_keypair();
        let registration_id = crypto::generate_registration_id();

        let identity = IdentityRecord {
            user_id: self.user_id.clone(),
            dh_key: dh.to_jwk(),
            signing_key: signing.to_jwk(),
            registration_id,
            created_at_ms: now,
        };
        self.store.put_identity(&identity).await?;

        let signed = self.new_signed_prekey(&signing, 1, now).await?;
        let one_time = self.new_one_time_prekeys(1, ONE_TIME_PREKEY_TARGET).await?;

        self.directory
            .upsert_identity(
                &self.user_id,
                &DirectoryIdentity {
                    identity_key: dh.public().to_jwk(),
                    signing_key: signing.public().to_jwk(),
                    registration_id,
                },
            )
            .await?;
        self.directory.upsert_signed_prekey(&self.user_id, &signed).await?;
        self.directory.add_one_time_prekeys(&self.user_id, &one_time).await?;

        self.store.put_meta(META_NEXT_SIGNED, 2).await?;
        self.store.put_meta(META_CURRENT_SIGNED, 1).await?;
        self.store
            .put_meta(META_NEXT_ONE_TIME, u64::from(ONE_TIME_PREKEY_TARGET) + 1)
            .await?;
        self.store.put_meta(META_LAST_ROTATION, now).await?;

        info!(user = %self.user_id, "identity provisioned and published");
        Ok(())
    }

    /// The directory, not local state, is the source of truth for what
    /// peers can fetch; restore it from local records when it lost them.
    async fn republish(&self, identity: &IdentityRecord) -> Result<()> {
        let dh = DhKeyPair::from_jwk(&identity.dh_key)?;
        let signing = SigningKeyPair::from_jwk(&identity.signing_key)?;

        self.directory
            .upsert_identity(
                &self.user_id,
                &DirectoryIdentity {
                    identity_key: dh.public().to_jwk(),
                    signing_key: signing.public().to_jwk(),
                    registration_id: identity.registration_id,
                },
            )
            .await?;

        if let Some(current) = self.store.get_meta(META_CURRENT_SIGNED).await? {
            let current = meta_key_id(current)?;
            if let Some(record) = self.store.get_signed_prekey(&self.user_id, current).await? {
                let pair = DhKeyPair::from_jwk(&record.key)?;
                self.directory
                    .upsert_signed_prekey(
                        &self.user_id,
                        &PublishedSignedPrekey {
                            key_id: record.key_id,
                            public_key: pair.public().to_jwk(),
                            signature: record.signature.clone(),
                        },
                    )
                    .await?;
            }
        }

        info!(user = %self.user_id, "republished public key material");
        Ok(())
    }

    async fn new_signed_prekey(
        &self,
        signing: &SigningKeyPair,
        key_id: u32,
        now: u64,
    ) -> Result<PublishedSignedPrekey> {
        let pair = crypto::generate_dh_keypair();
        let signature = signing.sign(pair.public().canonical_json().as_bytes())?;
        let record = SignedPrekeyRecord {
            key_id,
            key: pair.to_jwk(),
            signature: crypto::b64_encode(&signature),
            created_at_ms: now,
        };
        self.store.put_signed_prekey(&self.user_id, &record).await?;

        Ok(PublishedSignedPrekey {
            key_id,
            public_key: pair.public().to_jwk(),
            signature: record.signature,
        })
    }

    async fn new_one_time_prekeys(
        &self,
        start_id: u32,
        count: u32,
    ) -> Result<Vec<PublishedOneTimePrekey>> {
        let mut published = Vec::with_capacity(count as usize);
        for key_id in start_id..start_id + count {
            let pair = crypto::generate_dh_keypair();
            let record = OneTimePrekeyRecord {
                key_id,
                key: pair.to_jwk(),
                used: false,
            };
            self.store.put_one_time_prekey(&self.user_id, &record).await?;
            published.push(PublishedOneTimePrekey {
                key_id,
                public_key: pair.public().to_jwk(),
            });
        }
        Ok(published)
    }

    async fn rotate_signed_prekey_if_due(&self, identity: &IdentityRecord) -> Result<()> {
        let now = self.clock.now_ms();
        let last = self.store.get_meta(META_LAST_ROTATION).await?.unwrap_or(0);
        if now.saturating_sub(last) < SIGNED_PREKEY_ROTATION_MS {
            return Ok(());
        }

        let signing = SigningKeyPair::from_jwk(&identity.signing_key)?;
        let key_id = meta_key_id(self.store.get_meta(META_NEXT_SIGNED).await?.unwrap_or(2))?;

        let published = self.new_signed_prekey(&signing, key_id, now).await?;
        self.directory.upsert_signed_prekey(&self.user_id, &published).await?;

        // Older signed prekeys stay in the store so in-flight X3DH
        // against them can still complete.
        self.store.put_meta(META_NEXT_SIGNED, u64::from(key_id) + 1).await?;
        self.store.put_meta(META_CURRENT_SIGNED, u64::from(key_id)).await?;
        self.store.put_meta(META_LAST_ROTATION, now).await?;

        info!(user = %self.user_id, key_id, "rotated signed prekey");
        Ok(())
    }

    async fn refill_one_time_prekeys(&self) -> Result<()> {
        let unused = self.directory.unused_one_time_prekey_count(&self.user_id).await?;
        if unused >= ONE_TIME_PREKEY_MIN {
            return Ok(());
        }

        let needed = ONE_TIME_PREKEY_TARGET - unused;
        let start_id = meta_key_id(self.store.get_meta(META_NEXT_ONE_TIME).await?.unwrap_or(1))?;

        let published = self.new_one_time_prekeys(start_id, needed).await?;
        self.directory.add_one_time_prekeys(&self.user_id, &published).await?;
        self.store
            .put_meta(META_NEXT_ONE_TIME, u64::from(start_id + needed))
            .await?;

        info!(user = %self.user_id, count = needed, "refilled one-time prekeys");
        Ok(())
    }

    async fn require_identity(&self) -> Result<IdentityRecord> {
        self.store
            .get_identity(&self.user_id)
            .await?
            .ok_or(Error::NotInitialized)
    }

    async fn session_slot(&self, conversation_id: &str) -> SessionSlot {
        let mut sessions = self.sessions.lock().await;
        sessions.entry(conversation_id.to_string()).or_default().clone()
    }

    async fn load_session(&self, conversation_id: &str) -> Result<Option<LiveSession>> {
        match self.store.get_session(conversation_id).await? {
            Some(record) => {
                let live = LiveSession::from_record(record)?;
                debug!(conversation = conversation_id, "session rehydrated from store");
                Ok(Some(live))
            }
            None => Ok(None),
        }
    }

    async fn persist_session(&self, conversation_id: &str, live: &LiveSession) -> Result<()> {
        let record = SessionRecord {
            conversation_id: conversation_id.to_string(),
            remote_user_id: live.remote_user_id.clone(),
            ratchet: live.ratchet.to_snapshot(),
            x3dh_completed: live.x3dh_completed,
            handshake: live.handshake.clone(),
            created_at_ms: live.created_at_ms,
            updated_at_ms: self.clock.now_ms(),
        };
        self.store.put_session(&record).await
    }

    /// Fetch the remote bundle, claiming one one-time prekey, and run the
    /// X3DH initiator into an Alice-initial ratchet.
    async fn initiate_session(
        &self,
        identity: &IdentityRecord,
        remote_user_id: &str,
    ) -> Result<LiveSession> {
        let remote_identity = self
            .directory
            .fetch_identity(remote_user_id)
            .await?
            .ok_or(Error::BundleUnavailable)?;
        let signed_prekey = self
            .directory
            .fetch_signed_prekey(remote_user_id)
            .await?
            .ok_or(Error::BundleUnavailable)?;
        let one_time = self.directory.claim_one_time_prekey(remote_user_id).await?;

        let bundle = PreKeyBundle {
            identity_key: DhPublicKey::from_jwk(&remote_identity.identity_key)?,
            signing_key: SigningPublicKey::from_jwk(&remote_identity.signing_key)?,
            signed_prekey_id: signed_prekey.key_id,
            signed_prekey: DhPublicKey::from_jwk(&signed_prekey.public_key)?,
            signed_prekey_signature: crypto::b64_decode(&signed_prekey.signature)
                .map_err(|_| Error::BundleInvalid)?,
            one_time_prekey: match one_time {
                Some(prekey) => Some((prekey.key_id, DhPublicKey::from_jwk(&prekey.public_key)?)),
                None => None,
            },
        };

        let local_dh = DhKeyPair::from_jwk(&identity.dh_key)?;
        let init = x3dh::initiate(&local_dh, &bundle).map_err(|err| {
            if err == Error::BundleInvalid {
                warn!(remote = remote_user_id, "signed prekey signature verification failed");
            }
            err
        })?;

        let ratchet = DoubleRatchet::init_alice(init.shared_secret, bundle.signed_prekey.clone());

        Ok(LiveSession {
            remote_user_id: remote_user_id.to_string(),
            ratchet,
            x3dh_completed: false,
            handshake: Some(HandshakeRecord {
                ephemeral_key: init.ephemeral_key.to_jwk(),
                one_time_prekey_id: init.used_one_time_prekey_id,
            }),
            created_at_ms: self.clock.now_ms(),
        })
    }

    /// Run the X3DH responder from a first-message preamble into a
    /// Bob-initial ratchet, consuming the referenced one-time prekey.
    async fn complete_session(
        &self,
        identity: &IdentityRecord,
        remote_user_id: &str,
        preamble: &X3dhPreamble,
    ) -> Result<LiveSession> {
        let current = self
            .store
            .get_meta(META_CURRENT_SIGNED)
            .await?
            .ok_or(Error::Undecryptable)?;
        let signed_record = self
            .store
            .get_signed_prekey(&self.user_id, meta_key_id(current)?)
            .await?
            .ok_or(Error::Undecryptable)?;
        let signed_pair = DhKeyPair::from_jwk(&signed_record.key)?;

        let one_time_pair = match preamble.one_time_prekey_id {
            Some(key_id) => {
                let record = self
                    .store
                    .get_one_time_prekey(&self.user_id, key_id)
                    .await?
                    .ok_or(Error::Undecryptable)?;
                Some(DhKeyPair::from_jwk(&record.key)?)
            }
            None => None,
        };

        let local_dh = DhKeyPair::from_jwk(&identity.dh_key)?;
        let initiator_identity = DhPublicKey::from_jwk(&preamble.identity_key)?;
        let initiator_ephemeral = DhPublicKey::from_jwk(&preamble.ephemeral_key)?;

        let shared_secret = x3dh::respond(
            &local_dh,
            &signed_pair,
            one_time_pair.as_ref(),
            &initiator_identity,
            &initiator_ephemeral,
        );

        if let Some(key_id) = preamble.one_time_prekey_id {
            self.store.delete_one_time_prekey(&self.user_id, key_id).await?;
        }

        let ratchet = DoubleRatchet::init_bob(shared_secret, signed_pair);

        Ok(LiveSession {
            remote_user_id: remote_user_id.to_string(),
            ratchet,
            x3dh_completed: true,
            handshake: Some(HandshakeRecord {
                ephemeral_key: preamble.ephemeral_key.clone(),
                one_time_prekey_id: preamble.one_time_prekey_id,
            }),
            created_at_ms: self.clock.now_ms(),
        })
    }

    /// Encrypt one message for a conversation, initiating a session on
    /// first use, and return the wire envelope JSON.
    pub async fn encrypt(
        &self,
        conversation_id: &str,
        remote_user_id: &str,
        plaintext: &str,
    ) -> Result<String> {
        let identity = self.require_identity().await?;

        let slot = self.session_slot(conversation_id).await;
        let mut session = slot.lock().await;

        if session.is_none() {
            *session = self.load_session(conversation_id).await?;
        }
        if session.is_none() {
            *session = Some(self.initiate_session(&identity, remote_user_id).await?);
            debug!(
                conversation = conversation_id,
                remote = remote_user_id,
                "session initiated"
            );
        }
        let Some(live) = session.as_mut() else {
            return Err(Error::NoSession);
        };

        let (header, ciphertext) = live.ratchet.encrypt(plaintext.as_bytes())?;

        let x3dh = if live.x3dh_completed {
            None
        } else {
            live.x3dh_completed = true;
            let handshake = live.handshake.as_ref().ok_or(Error::NoSession)?;
            let local_dh = DhKeyPair::from_jwk(&identity.dh_key)?;
            Some(X3dhPreamble {
                identity_key: local_dh.public().to_jwk(),
                ephemeral_key: handshake.ephemeral_key.clone(),
                one_time_prekey_id: handshake.one_time_prekey_id,
            })
        };

        let envelope = Envelope {
            v: ENVELOPE_VERSION,
            header,
            ciphertext,
            x3dh,
        };

        self.persist_session(conversation_id, live).await?;
        envelope.to_json()
    }

    /// Decrypt one inbound payload for a conversation.
    ///
    /// Non-protocol payloads pass through as
    /// [`Decrypted::NotEncrypted`]; protocol envelopes that cannot be
    /// decrypted surface [`Error::Undecryptable`] without mutating
    /// persisted state.
    pub async fn decrypt(
        &self,
        conversation_id: &str,
        remote_user_id: &str,
        payload: &str,
    ) -> Result<Decrypted> {
        if !envelope::is_signal_envelope(payload) {
            return Ok(Decrypted::NotEncrypted(payload.to_string()));
        }

        let identity = self.require_identity().await?;
        let envelope = Envelope::from_json(payload).map_err(Error::into_undecryptable)?;

        let slot = self.session_slot(conversation_id).await;
        let mut session = slot.lock().await;

        if session.is_none() {
            *session = self.load_session(conversation_id).await?;
        }
        if session.is_none() {
            match &envelope.x3dh {
                Some(preamble) => {
                    let live = self
                        .complete_session(&identity, remote_user_id, preamble)
                        .await
                        .map_err(Error::into_undecryptable)?;
                    debug!(
                        conversation = conversation_id,
                        remote = remote_user_id,
                        "session completed from X3DH preamble"
                    );
                    *session = Some(live);
                }
                None => return Err(Error::NoSession),
            }
        }
        let Some(live) = session.as_mut() else {
            return Err(Error::NoSession);
        };

        let plaintext = live
            .ratchet
            .decrypt(&envelope.header, &envelope.ciphertext)
            .map_err(|err| {
                warn!(conversation = conversation_id, error = %err, "undecryptable envelope");
                err.into_undecryptable()
            })?;

        self.persist_session(conversation_id, live).await?;

        let text = String::from_utf8(plaintext).map_err(|_| Error::Undecryptable)?;
        Ok(Decrypted::Plaintext(text))
    }

    /// Derive the safety number for this user and a remote peer
    pub async fn safety_number(&self, remote_user_id: &str) -> Result<String> {
        let identity = self.require_identity().await?;
        let remote = self
            .directory
            .fetch_identity(remote_user_id)
            .await?
            .ok_or(Error::BundleUnavailable)?;

        let local_dh = DhKeyPair::from_jwk(&identity.dh_key)?;
        let remote_key = DhPublicKey::from_jwk(&remote.identity_key)?;
        Ok(fingerprint::safety_number(&local_dh.public(), &remote_key))
    }

    /// Whether a live or persisted session exists for a conversation
    pub async fn has_session(&self, conversation_id: &str) -> bool {
        {
            let sessions = self.sessions.lock().await;
            if let Some(slot) = sessions.get(conversation_id) {
                if slot.lock().await.is_some() {
                    return true;
                }
            }
        }
        matches!(self.store.get_session(conversation_id).await, Ok(Some(_)))
    }

    /// Destroy every local record and cached session; called on sign-out
    pub async fn clear_all(&self) -> Result<()> {
        let mut sessions = self.sessions.lock().await;
        sessions.clear();
        self.store.clear_all().await?;
        info!(user = %self.user_id, "cleared all local key material");
        Ok(())
    }
}

fn meta_key_id(value: u64) -> Result<u32> {
    u32::try_from(value).map_err(|_| Error::Storage("corrupt key id metadata".to_string()))
}
