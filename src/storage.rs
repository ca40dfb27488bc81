//! Durable key store abstraction and record types.
//!
//! The store holds all per-user secret material in exported (JWK) form so
//! it survives process restarts: the identity, signed prekeys, one-time
//! prekeys, per-conversation session records, and small scalar metadata.
//! It performs no cryptography; the key handles re-import material on
//! load.
//!
//! Implementations must be `Send + Sync`; single-record operations on
//! disjoint keys must not interfere, and `clear_all` must leave no secret
//! bytes readable through this interface.

use crate::double_ratchet::RatchetSnapshot;
use crate::error::{Error, Result};
use crate::keys::Jwk;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Local long-term identity, created once per user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityRecord {
    /// Owning user id
    pub user_id: String,
    /// Long-term DH key pair (private JWK)
    pub dh_key: Jwk,
    /// ECDSA signing key pair (private JWK)
    pub signing_key: Jwk,
    /// 14-bit registration identifier
    pub registration_id: u16,
    /// Creation time, unix milliseconds
    pub created_at_ms: u64,
}

/// Medium-lived signed prekey
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedPrekeyRecord {
    /// Monotonically assigned id
    pub key_id: u32,
    /// Key pair (private JWK)
    pub key: Jwk,
    /// Base64 signature over the canonical JSON of the public half
    pub signature: String,
    /// Creation time, unix milliseconds
    pub created_at_ms: u64,
}

/// Short-lived one-time prekey, consumed by at most one session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OneTimePrekeyRecord {
    /// Monotonically assigned id
    pub key_id: u32,
    /// Key pair (private JWK)
    pub key: Jwk,
    /// Whether this prekey has been consumed
    pub used: bool,
}

/// X3DH completion material kept on the session record so a replayed
/// first message re-completes idempotently
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeRecord {
    /// Initiator's ephemeral public key
    pub ephemeral_key: Jwk,
    /// One-time prekey id consumed by the handshake, if any
    pub one_time_prekey_id: Option<u32>,
}

/// Per-conversation session record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Conversation this session belongs to
    pub conversation_id: String,
    /// The remote participant
    pub remote_user_id: String,
    /// Serialized ratchet state
    pub ratchet: RatchetSnapshot,
    /// Whether the X3DH preamble has been emitted (initiator) or
    /// consumed (responder)
    pub x3dh_completed: bool,
    /// Handshake material for idempotent re-completion
    pub handshake: Option<HandshakeRecord>,
    /// Creation time, unix milliseconds
    pub created_at_ms: u64,
    /// Last update time, unix milliseconds
    pub updated_at_ms: u64,
}

/// Durable, per-user key material store.
///
/// Single-record put/get/delete over five logical collections. All
/// failures surface as [`Error::Storage`].
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Store the local identity
    async fn put_identity(&self, record: &IdentityRecord) -> Result<()>;

    /// Load the local identity for a user
    async fn get_identity(&self, user_id: &str) -> Result<Option<IdentityRecord>>;

    /// Store a signed prekey under (user, key id)
    async fn put_signed_prekey(&self, user_id: &str, record: &SignedPrekeyRecord) -> Result<()>;

    /// Load a signed prekey by id
    async fn get_signed_prekey(
        &self,
        user_id: &str,
        key_id: u32,
    ) -> Result<Option<SignedPrekeyRecord>>;

    /// Store a one-time prekey under (user, key id)
    async fn put_one_time_prekey(
        &self,
        user_id: &str,
        record: &OneTimePrekeyRecord,
    ) -> Result<()>;

    /// Load a one-time prekey by id
    async fn get_one_time_prekey(
        &self,
        user_id: &str,
        key_id: u32,
    ) -> Result<Option<OneTimePrekeyRecord>>;

    /// Delete a one-time prekey after the responder step consumed it
    async fn delete_one_time_prekey(&self, user_id: &str, key_id: u32) -> Result<()>;

    /// Store a session record, replacing any previous snapshot
    async fn put_session(&self, record: &SessionRecord) -> Result<()>;

    /// Load a session record by conversation id
    async fn get_session(&self, conversation_id: &str) -> Result<Option<SessionRecord>>;

    /// Delete a session record
    async fn delete_session(&self, conversation_id: &str) -> Result<()>;

    /// Store a scalar metadata value by name
    async fn put_meta(&self, name: &str, value: u64) -> Result<()>;

    /// Load a scalar metadata value
    async fn get_meta(&self, name: &str) -> Result<Option<u64>>;

    /// Remove every record; called on sign-out
    async fn clear_all(&self) -> Result<()>;
}

#[derive(Default)]
struct MemoryInner {
    identities: HashMap<String, String>,
    signed_prekeys: HashMap<(String, u32), String>,
    one_time_prekeys: HashMap<(String, u32), String>,
    sessions: HashMap<String, String>,
    meta: HashMap<String, u64>,
}

/// In-memory [`KeyStore`] holding records in their serialized JSON form.
///
/// Serializing on every put and parsing on every get keeps this
/// reference implementation honest about what a durable backend would
/// round-trip. Clones share the same underlying maps.
#[derive(Clone, Default)]
pub struct MemoryKeyStore {
    inner: std::sync::Arc<RwLock<MemoryInner>>,
}

impl MemoryKeyStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Debug for MemoryKeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryKeyStore").finish_non_exhaustive()
    }
}

fn encode<T: Serialize>(record: &T) -> Result<String> {
    serde_json::to_string(record).map_err(|e| Error::Storage(e.to_string()))
}

fn decode<T: for<'de> Deserialize<'de>>(text: &str) -> Result<T> {
    serde_json::from_str(text).map_err(|e| Error::Storage(e.to_string()))
}

#[async_trait]
impl KeyStore for MemoryKeyStore {
    async fn put_identity(&self, record: &IdentityRecord) -> Result<()> {
        let encoded = encode(record)?;
        let mut inner = self.inner.write().await;
        inner.identities.insert(record.user_id.clone(), encoded);
        Ok(())
    }

    async fn get_identity(&self, user_id: &str) -> Result<Option<IdentityRecord>> {
        let inner = self.inner.read().await;
        inner.identities.get(user_id).map(|t| decode(t)).transpose()
    }

    async fn put_signed_prekey(&self, user_id: &str, record: &SignedPrekeyRecord) -> Result<()> {
        let encoded = encode(record)?;
        let mut inner = self.inner.write().await;
        inner
            .signed_prekeys
            .insert((user_id.to_string(), record.key_id), encoded);
        Ok(())
    }

    async fn get_signed_prekey(
        &self,
        user_id: &str,
        key_id: u32,
    ) -> Result<Option<SignedPrekeyRecord>> {
        let inner = self.inner.read().await;
        inner
            .signed_prekeys
            .get(&(user_id.to_string(), key_id))
            .map(|t| decode(t))
            .transpose()
    }

    async fn put_one_time_prekey(
        &self,
        user_id: &str,
        record: &OneTimePrekeyRecord,
    ) -> Result<()> {
        let encoded = encode(record)?;
        let mut inner = self.inner.write().await;
        inner
            .one_time_prekeys
            .insert((user_id.to_string(), record.key_id), encoded);
        Ok(())
    }

    async fn get_one_time_prekey(
        &self,
        user_id: &str,
        key_id: u32,
    ) -> Result<Option<OneTimePrekeyRecord>> {
        let inner = self.inner.read().await;
        inner
            .one_time_prekeys
            .get(&(user_id.to_string(), key_id))
            .map(|t| decode(t))
            .transpose()
    }

    async fn delete_one_time_prekey(&self, user_id: &str, key_id: u32) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.one_time_prekeys.remove(&(user_id.to_string(), key_id));
        Ok(())
    }

    async fn put_session(&self, record: &SessionRecord) -> Result<()> {
        let encoded = encode(record)?;
        let mut inner = self.inner.write().await;
        inner.sessions.insert(record.conversation_id.clone(), encoded);
        Ok(())
    }

    async fn get_session(&self, conversation_id: &str) -> Result<Option<SessionRecord>> {
        let inner = self.inner.read().await;
        inner.sessions.get(conversation_id).map(|t| decode(t)).transpose()
    }

    async fn delete_session(&self, conversation_id: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.sessions.remove(conversation_id);
        Ok(())
    }

    async fn put_meta(&self, name: &str, value: u64) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.meta.insert(name.to_string(), value);
        Ok(())
    }

    async fn get_meta(&self, name: &str) -> Result<Option<u64>> {
        let inner = self.inner.read().await;
        Ok(inner.meta.get(name).copied())
    }

    async fn clear_all(&self) -> Result<()> {
        let mut inner = self.inner.write().await;
        *inner = MemoryInner::default();
        Ok(())
    }
}
