//! Error types for the messaging engine.

use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during engine operations.
///
/// The orchestrator surfaces only the coarse kinds to the chat layer;
/// ratchet-internal failures ([`Error::AuthenticationFailed`],
/// [`Error::TooManySkipped`], [`Error::MalformedEnvelope`],
/// [`Error::InvalidKey`]) are collapsed into [`Error::Undecryptable`] at
/// that boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// No local identity exists yet; `initialize` has not run
    #[error("identity not initialized")]
    NotInitialized,

    /// A ratchet envelope arrived for a conversation with no session
    #[error("no session for conversation")]
    NoSession,

    /// The envelope could not be decrypted
    #[error("undecryptable envelope")]
    Undecryptable,

    /// The directory has no identity or signed prekey for the remote user
    #[error("prekey bundle unavailable")]
    BundleUnavailable,

    /// The signed-prekey signature in a fetched bundle did not verify
    #[error("prekey bundle signature invalid")]
    BundleInvalid,

    /// Local key store failure
    #[error("storage error: {0}")]
    Storage(String),

    /// Remote key directory failure
    #[error("directory error: {0}")]
    Directory(String),

    /// AEAD authentication failed
    #[error("authentication failed")]
    AuthenticationFailed,

    /// The sender skipped more messages than the cache bound allows
    #[error("too many skipped messages")]
    TooManySkipped,

    /// The envelope does not parse as a protocol ciphertext
    #[error("malformed envelope")]
    MalformedEnvelope,

    /// A key failed to import (bad encoding, point not on curve)
    #[error("invalid key material")]
    InvalidKey,
}

impl Error {
    /// Collapse ratchet-internal kinds into the caller-facing
    /// [`Error::Undecryptable`]; the coarse kinds pass through.
    #[must_use]
    pub(crate) fn into_undecryptable(self) -> Self {
        match self {
            Error::AuthenticationFailed
            | Error::TooManySkipped
            | Error::MalformedEnvelope
            | Error::InvalidKey => Error::Undecryptable,
            other => other,
        }
    }
}
