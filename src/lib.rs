//! # pairlock
//!
//! End-to-end encrypted messaging engine: X3DH asynchronous key
//! agreement, Double Ratchet message encryption, prekey lifecycle
//! (publication, rotation, claim, exhaustion), durable session
//! persistence, and safety-number derivation.
//!
//! ## Security Properties
//!
//! - **Forward secrecy**: past messages stay secure if current keys leak
//! - **Asynchronous**: a sender can initiate without the peer online
//! - **Out-of-order tolerance**: up to 256 skipped messages per chain
//!   are cached and decrypt on late arrival
//!
//! ## Architecture
//!
//! The [`Engine`] is the facade the chat layer uses. It consumes two
//! external collaborators through narrow async traits: a durable
//! [`KeyStore`](storage::KeyStore) for local secret material, and a
//! [`KeyDirectory`](directory::KeyDirectory) holding published public
//! material (with an atomic one-time-prekey claim). In-memory
//! implementations of both ship for tests and embedding.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use pairlock::{Engine, MemoryDirectory, MemoryKeyStore};
//! use std::sync::Arc;
//!
//! # async fn demo() -> pairlock::Result<()> {
//! let directory = Arc::new(MemoryDirectory::new());
//!
//! let alice = Engine::new("alice", Arc::new(MemoryKeyStore::new()), directory.clone());
//! let bob = Engine::new("bob", Arc::new(MemoryKeyStore::new()), directory);
//! alice.initialize().await?;
//! bob.initialize().await?;
//!
//! let envelope = alice.encrypt("conv-1", "bob", "hello").await?;
//! let plaintext = bob.decrypt("conv-1", "alice", &envelope).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![warn(clippy::all, clippy::pedantic, clippy::cargo)]

pub mod crypto;
pub mod directory;
pub mod double_ratchet;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod fingerprint;
pub mod keys;
pub mod storage;
pub mod x3dh;

// Re-export main types
pub use directory::{KeyDirectory, MemoryDirectory};
pub use double_ratchet::{DoubleRatchet, RatchetSnapshot, MAX_SKIP};
pub use engine::{Clock, Decrypted, Engine, SystemClock};
pub use envelope::{is_signal_envelope, Envelope, Header, X3dhPreamble, ENVELOPE_VERSION};
pub use error::{Error, Result};
pub use keys::{DhKeyPair, DhPublicKey, Jwk, SigningKeyPair, SigningPublicKey};
pub use storage::{KeyStore, MemoryKeyStore, SessionRecord};
pub use x3dh::{InitiatorResult, PreKeyBundle};
