//! Causal, content-addressed, signed CRDT append-only log.
//!
//! A [`Log`] is a DAG of [`Entry`] values linked by `next` pointers and
//! ordered by hybrid logical clock timestamps. Entries are signed by one or
//! more identities, and their metadata, payload and signatures can each be
//! sealed for a different set of receivers ([`envelope`]).
//!
//! Replicas converge through [`Log::join`], which is idempotent, commutative
//! and associative over the resulting entry set, heads and shadowed gids.
//! History is pulled from a block store with [`fetch_all`], a bounded,
//! concurrent, best-effort backward traversal.

pub mod config;
pub mod encoding;
pub mod envelope;
mod entry;
mod error;
pub mod fetch;
mod graph;
pub mod identity;
mod log;
pub mod telemetry;
mod trim;

#[cfg(test)]
mod tests;

pub use config::LogConfig;
pub use encoding::{BytesEncoding, Encoding, PostcardEncoding, StringEncoding};
pub use entry::{
    CanAppend, CreateProperties, EncryptionOptions, Entry, EntryContext, EntryType, Meta, Payload,
    SignatureReceivers,
};
pub use envelope::{ExchangeKeypair, ExchangePublicKey, Keychain, KeyResolver, MaybeEncrypted, ReceiverSet};
pub use error::{AccessError, LogError};
pub use fetch::{FetchOptions, FetchResult, fetch_all};
pub use identity::{Ed25519Identity, Identity, SignatureWithKey};
pub use log::{
    AppendOptions, AppendResult, JoinOptions, JoinReport, LoadReport, Log, LogOptions, LogSnapshot,
};
pub use trim::TrimPolicy;
