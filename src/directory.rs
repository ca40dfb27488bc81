//! Key directory abstraction: the remote service holding public prekey
//! material.
//!
//! Peers publish their identity, current signed prekey, and batches of
//! one-time prekeys here, and fetch each other's bundles to initiate
//! sessions. The one claim operation is the sole multi-party critical
//! section in the protocol: it must atomically select an unused one-time
//! prekey, mark it used, and return it, so concurrent initiators never
//! draw the same key.

use crate::error::Result;
use crate::keys::Jwk;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::Mutex;

/// Published identity material for one user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryIdentity {
    /// Long-term DH identity public key
    pub identity_key: Jwk,
    /// ECDSA signing public key
    pub signing_key: Jwk,
    /// 14-bit registration identifier
    pub registration_id: u16,
}

/// Published signed prekey: `{key_id, public_key, signature}` where the
/// signature is over the canonical JSON of `public_key`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishedSignedPrekey {
    /// Monotonically assigned id
    pub key_id: u32,
    /// Public half
    pub public_key: Jwk,
    /// Base64 ECDSA signature
    pub signature: String,
}

/// Published one-time prekey public half
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishedOneTimePrekey {
    /// Monotonically assigned id
    pub key_id: u32,
    /// Public half
    pub public_key: Jwk,
}

/// Remote directory of public key material.
///
/// All failures surface as [`crate::Error::Directory`]; callers may
/// retry, and no local state is mutated on a failed call.
#[async_trait]
pub trait KeyDirectory: Send + Sync {
    /// Publish or replace a user's identity record
    async fn upsert_identity(&self, user_id: &str, identity: &DirectoryIdentity) -> Result<()>;

    /// Publish or replace a signed prekey by id; the newest upsert
    /// becomes the one served in bundles
    async fn upsert_signed_prekey(
        &self,
        user_id: &str,
        prekey: &PublishedSignedPrekey,
    ) -> Result<()>;

    /// Publish a batch of one-time prekeys
    async fn add_one_time_prekeys(
        &self,
        user_id: &str,
        prekeys: &[PublishedOneTimePrekey],
    ) -> Result<()>;

    /// Fetch a user's identity record
    async fn fetch_identity(&self, user_id: &str) -> Result<Option<DirectoryIdentity>>;

    /// Fetch a user's latest signed prekey
    async fn fetch_signed_prekey(&self, user_id: &str) -> Result<Option<PublishedSignedPrekey>>;

    /// Count a user's unclaimed one-time prekeys
    async fn unused_one_time_prekey_count(&self, user_id: &str) -> Result<u32>;

    /// Atomically claim one unused one-time prekey, marking it used.
    ///
    /// Returns `None` when the pool is exhausted; X3DH then proceeds
    /// without `DH4`.
    async fn claim_one_time_prekey(&self, user_id: &str)
        -> Result<Option<PublishedOneTimePrekey>>;
}

#[derive(Default)]
struct DirectoryEntry {
    identity: Option<DirectoryIdentity>,
    signed_prekey: Option<PublishedSignedPrekey>,
    one_time_prekeys: Vec<(PublishedOneTimePrekey, bool)>,
}

/// In-memory [`KeyDirectory`].
///
/// The claim operation runs entirely under one lock, giving the
/// SELECT-FOR-UPDATE SKIP LOCKED semantics a database-backed directory
/// would provide. Clones share the same underlying state.
#[derive(Clone, Default)]
pub struct MemoryDirectory {
    entries: std::sync::Arc<Mutex<HashMap<String, DirectoryEntry>>>,
}

impl MemoryDirectory {
    /// Create an empty directory
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Debug for MemoryDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryDirectory").finish_non_exhaustive()
    }
}

#[async_trait]
impl KeyDirectory for MemoryDirectory {
    async fn upsert_identity(&self, user_id: &str, identity: &DirectoryIdentity) -> Result<()> {
        let mut entries = self.entries.lock().await;
        entries.entry(user_id.to_string()).or_default().identity = Some(identity.clone());
        Ok(())
    }

    async fn upsert_signed_prekey(
        &self,
        user_id: &str,
        prekey: &PublishedSignedPrekey,
    ) -> Result<()> {
        let mut entries = self.entries.lock().await;
        entries.entry(user_id.to_string()).or_default().signed_prekey = Some(prekey.clone());
        Ok(())
    }

    async fn add_one_time_prekeys(
        &self,
        user_id: &str,
        prekeys: &[PublishedOneTimePrekey],
    ) -> Result<()> {
        let mut entries = self.entries.lock().await;
        let entry = entries.entry(user_id.to_string()).or_default();
        entry
            .one_time_prekeys
            .extend(prekeys.iter().map(|p| (p.clone(), false)));
        Ok(())
    }

    async fn fetch_identity(&self, user_id: &str) -> Result<Option<DirectoryIdentity>> {
        let entries = self.entries.lock().await;
        Ok(entries.get(user_id).and_then(|e| e.identity.clone()))
    }

    async fn fetch_signed_prekey(&self, user_id: &str) -> Result<Option<PublishedSignedPrekey>> {
        let entries = self.entries.lock().await;
        Ok(entries.get(user_id).and_then(|e| e.signed_prekey.clone()))
    }

    async fn unused_one_time_prekey_count(&self, user_id: &str) -> Result<u32> {
        let entries = self.entries.lock().await;
        let count = entries
            .get(user_id)
            .map(|e| e.one_time_prekeys.iter().filter(|(_, used)| !used).count())
            .unwrap_or(0);
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    async fn claim_one_time_prekey(
        &self,
        user_id: &str,
    ) -> Result<Option<PublishedOneTimePrekey>> {
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.get_mut(user_id) else {
            return Ok(None);
        };
        for (prekey, used) in &mut entry.one_time_prekeys {
            if !*used {
                *used = true;
                return Ok(Some(prekey.clone()));
            }
        }
        Ok(None)
    }
}
