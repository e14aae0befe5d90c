//! Error types for block storage operations.

use reef_types::Cid;

/// Errors that can occur during block storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backend could not serve the request.
    #[error("block store unavailable for {cid}: {reason}")]
    Unavailable {
        /// The block being accessed.
        cid: Cid,
        /// Backend-specific description.
        reason: String,
    },

    /// An I/O error occurred.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored bytes do not hash to the address they were stored under.
    #[error("block corruption detected: expected {expected}, actual hash {actual}")]
    Corrupt {
        /// The address that was requested.
        expected: Cid,
        /// The address computed from the bytes actually held.
        actual: Cid,
    },
}
