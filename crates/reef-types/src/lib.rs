//! Shared types and identifiers for reef.
//!
//! This crate defines the types used across the reef workspace:
//! identifiers ([`Cid`], [`PublicKey`]), causal time ([`Timestamp`],
//! [`LamportClock`], [`HybridClock`]) and the intra-process [`events`] bus
//! used to publish log notifications to dependents such as indexes.

pub mod clock;
pub mod events;

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use clock::HybridClock;

// ---------------------------------------------------------------------------
// ID types
// ---------------------------------------------------------------------------

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Default, Serialize, Deserialize)]
        pub struct $name([u8; 32]);

        impl $name {
            /// Create an ID by hashing arbitrary data with BLAKE3.
            pub fn from_data(data: &[u8]) -> Self {
                Self(blake3::hash(data).into())
            }

            /// Return the raw 32-byte representation.
            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }
        }

        impl From<[u8; 32]> for $name {
            fn from(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                for byte in &self.0 {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }

        impl FromStr for $name {
            type Err = ParseIdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                decode_hex32(s).map(Self)
            }
        }
    };
}

define_id!(
    /// Content address of a block: `blake3(stored_bytes)`.
    ///
    /// Entries are identified by the content address of their serialized
    /// form (without the hash field itself).
    Cid
);

define_id!(
    /// Raw ed25519 verifying key of a writer.
    PublicKey
);

impl Cid {
    /// Placeholder carried by an entry before the block store has addressed it.
    pub const UNASSIGNED: Cid = Cid([0u8; 32]);
}

impl PublicKey {
    /// Hex BLAKE3 digest of the key, used to key per-signer receiver sets.
    pub fn hashcode(&self) -> String {
        Cid::from_data(&self.0).to_string()
    }
}

/// Error returned when parsing a hex identifier fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseIdError(String);

impl fmt::Display for ParseIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid identifier: {}", self.0)
    }
}

impl std::error::Error for ParseIdError {}

fn decode_hex32(s: &str) -> Result<[u8; 32], ParseIdError> {
    if s.len() != 64 {
        return Err(ParseIdError(format!("expected 64 hex chars, got {}", s.len())));
    }

    let mut out = [0u8; 32];
    let bytes = s.as_bytes();

    for (i, pair) in bytes.chunks(2).enumerate() {
        let hi = hex_value(pair[0]).ok_or_else(|| ParseIdError(s.to_string()))?;
        let lo = hex_value(pair[1]).ok_or_else(|| ParseIdError(s.to_string()))?;
        out[i] = (hi << 4) | lo;
    }

    Ok(out)
}

fn hex_value(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Causal time
// ---------------------------------------------------------------------------

/// Hybrid logical timestamp, totally ordered by `(wall_time, logical)`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct Timestamp {
    /// Wall clock component in nanoseconds since the Unix epoch.
    pub wall_time: u64,
    /// Counter disambiguating events within the same wall time.
    pub logical: u32,
}

impl Timestamp {
    /// The smallest timestamp.
    pub const ZERO: Timestamp = Timestamp {
        wall_time: 0,
        logical: 0,
    };

    /// The largest timestamp.
    pub const MAX: Timestamp = Timestamp {
        wall_time: u64::MAX,
        logical: u32::MAX,
    };

    pub fn new(wall_time: u64, logical: u32) -> Self {
        Self { wall_time, logical }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.wall_time, self.logical)
    }
}

/// A writer-stamped timestamp carried in every entry's metadata.
///
/// Ordered by timestamp first; the writer id only breaks ties.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LamportClock {
    /// Writer identity (public key bytes of the creating identity).
    pub id: Vec<u8>,
    /// Hybrid logical timestamp.
    pub timestamp: Timestamp,
}

impl LamportClock {
    pub fn new(id: impl Into<Vec<u8>>, timestamp: Timestamp) -> Self {
        Self {
            id: id.into(),
            timestamp,
        }
    }
}

impl Ord for LamportClock {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for LamportClock {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
