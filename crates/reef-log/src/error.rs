//! Error types for the log crate.

use reef_store::StoreError;
use reef_types::{Cid, Timestamp};

/// Failures to open, produce or authorize protected entry content.
#[derive(Debug, thiserror::Error)]
pub enum AccessError {
    /// None of the envelope's receivers has a key in the keychain.
    #[error("no key available to decrypt envelope")]
    NoKey,

    /// A key was found but the ciphertext did not open under it.
    #[error("decryption failed: {0}")]
    Decrypt(String),

    /// Sealing an envelope failed.
    #[error("encryption failed: {0}")]
    Encrypt(String),

    /// The append authorization hook rejected the entry.
    #[error("entry rejected by append authorization")]
    Unauthorized,

    /// No signature on the entry could be resolved and verified.
    #[error("entry {0} has no verified signature")]
    NoVerifiedSignature(Cid),
}

/// Errors that can occur during log operations.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    /// Access to encrypted content or to the log itself was denied.
    #[error("access error: {0}")]
    Access(#[from] AccessError),

    /// A clock does not postdate a causal predecessor, or the clock has
    /// reached [`Timestamp::MAX`] and nothing can follow it.
    #[error("causality violation: predecessor clock {next} is not before {clock}")]
    Causality {
        /// Timestamp of the offending `next` entry.
        next: Timestamp,
        /// The supplied timestamp.
        clock: Timestamp,
    },

    /// Entry content was accessed before `init` bound an encoding/keychain.
    #[error("entry not initialized: {0} requires an encoding/keychain context")]
    NotInitialized(&'static str),

    /// Block store failure.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Entry bytes do not describe a valid entry.
    #[error("malformed entry: {0}")]
    Malformed(String),

    /// Configuration could not be read or parsed.
    #[error("config error: {0}")]
    Config(String),

    /// A referenced entry is not present in the log.
    #[error("entry not found: {0}")]
    NotFound(Cid),

    /// A fetch task panicked or was cancelled.
    #[error("fetch task failed: {0}")]
    Task(String),
}

impl From<postcard::Error> for LogError {
    fn from(e: postcard::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
