//! Tests for the reef-log crate.


use std::sync::Arc;

use reef_store::{BlockStore, MemoryBlockStore};
use reef_types::Cid;

use crate::encoding::StringEncoding;
use crate::entry::{Meta, Payload};
use crate::envelope::MaybeEncrypted;
use crate::identity::Ed25519Identity;
use crate::log::{AppendOptions, Log, LogOptions};

/// Deterministic identity from a one-byte seed.
fn test_identity(seed: u8) -> Arc<Ed25519Identity> {
    Arc::new(Ed25519Identity::from_seed([seed; 32]))
}

fn test_store() -> Arc<dyn BlockStore> {
    crate::telemetry::init_test_logging();
    Arc::new(MemoryBlockStore::new())
}

fn string_options() -> LogOptions<String> {
    LogOptions::new(Arc::new(StringEncoding))
}

/// A string log with id `"X"` writing as identity `seed`.
fn test_log(store: &Arc<dyn BlockStore>, seed: u8) -> Log<String> {
    Log::new(store.clone(), test_identity(seed), string_options().id(b"X".to_vec()))
}

/// Append options rooting a new chain under a gid derived from `seed`.
fn seeded(seed: &str) -> AppendOptions {
    AppendOptions {
        gid_seed: Some(seed.as_bytes().to_vec()),
        ..Default::default()
    }
}

/// Stored bytes of a record written by a foreign implementation: plain
/// `meta`, `value` as payload and the signatures field left out.
fn unsigned_record(meta: &Meta, value: &str) -> Vec<u8> {
    #[derive(serde::Serialize)]
    struct Record<'a> {
        meta: MaybeEncrypted<&'a Meta>,
        payload: MaybeEncrypted<Payload>,
        reserved: [u8; 4],
        signatures: Option<()>,
        hash: Option<Cid>,
    }

    postcard::to_allocvec(&Record {
        meta: MaybeEncrypted::Decrypted(meta),
        payload: MaybeEncrypted::Decrypted(Payload {
            data: value.as_bytes().to_vec(),
        }),
        reserved: [0u8; 4],
        signatures: None,
        hash: None,
    })
    .unwrap()
}
