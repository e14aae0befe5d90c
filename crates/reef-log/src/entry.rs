//! Log entries: immutable, content-addressed, signed DAG nodes.
//!
//! # Wire format
//!
//! An entry is serialized with postcard as the fixed-order record
//!
//! ```text
//! meta envelope | payload envelope | 4 reserved bytes | signatures? | hash?
//! ```
//!
//! - *Signable bytes* are this record with `signatures` and `hash` absent.
//! - *Stored bytes* (what the block store holds and addresses) carry the
//!   signatures but no hash; the entry's hash is `blake3(stored bytes)`.
//! - The transport form ([`Entry::encode_with_hash`]) additionally embeds the
//!   hash, which the receiver checks against the recomputed address.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use reef_store::BlockStore;
use reef_types::{Cid, HybridClock, LamportClock, PublicKey, Timestamp};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::encoding::Encoding;
use crate::envelope::{KeyResolver, MaybeEncrypted, ReceiverSet};
use crate::error::{AccessError, LogError};
use crate::identity::{Identity, SignatureWithKey};

type Result<T> = std::result::Result<T, LogError>;

/// Authorization hook run on a fully signed entry before it is addressed.
pub type CanAppend<T> = Arc<dyn Fn(&Entry<T>) -> bool + Send + Sync>;

/// Kind of an entry. The discriminant is part of the wire format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryType {
    /// A regular value.
    #[default]
    Append,
    /// Deletes the entry's causal history from every log it joins.
    Cut,
}

/// Entry metadata: everything the log needs to place an entry in the DAG.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meta {
    pub clock: LamportClock,
    /// Graph id; the minimum gid of the causal predecessors.
    pub gid: String,
    /// Hashes of the causal predecessors.
    pub next: Vec<Cid>,
    pub kind: EntryType,
    /// Opaque application metadata.
    pub data: Option<Vec<u8>>,
}

/// Encoded value bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub data: Vec<u8>,
}

#[derive(Serialize)]
struct WireRef<'a> {
    meta: &'a MaybeEncrypted<Meta>,
    payload: &'a MaybeEncrypted<Payload>,
    reserved: [u8; 4],
    signatures: Option<&'a [MaybeEncrypted<SignatureWithKey>]>,
    hash: Option<&'a Cid>,
}

#[derive(Deserialize)]
struct WireOwned {
    meta: MaybeEncrypted<Meta>,
    payload: MaybeEncrypted<Payload>,
    reserved: [u8; 4],
    signatures: Option<Vec<MaybeEncrypted<SignatureWithKey>>>,
    hash: Option<Cid>,
}

/// Runtime context needed to read an entry's protected or encoded fields.
pub struct EntryContext<T> {
    pub encoding: Arc<dyn Encoding<T>>,
    pub keychain: Option<Arc<dyn KeyResolver>>,
}

impl<T> EntryContext<T> {
    pub fn new(encoding: Arc<dyn Encoding<T>>) -> Self {
        Self {
            encoding,
            keychain: None,
        }
    }

    pub fn with_keychain(mut self, keychain: Arc<dyn KeyResolver>) -> Self {
        self.keychain = Some(keychain);
        self
    }

    fn resolver(&self) -> Option<&dyn KeyResolver> {
        self.keychain.as_deref()
    }
}

impl<T> Clone for EntryContext<T> {
    fn clone(&self) -> Self {
        Self {
            encoding: self.encoding.clone(),
            keychain: self.keychain.clone(),
        }
    }
}

/// A single node of the log DAG.
///
/// Entries are immutable once created; the only per-instance mutable state is
/// the bound [`EntryContext`] and lazily filled caches of decrypted fields.
#[derive(Clone)]
pub struct Entry<T> {
    hash: Cid,
    meta: MaybeEncrypted<Meta>,
    payload: MaybeEncrypted<Payload>,
    signatures: Option<Vec<MaybeEncrypted<SignatureWithKey>>>,
    reserved: [u8; 4],
    size: usize,
    context: Option<EntryContext<T>>,
    meta_cache: OnceLock<Meta>,
    payload_cache: OnceLock<Payload>,
    value_cache: OnceLock<T>,
}

impl<T> Entry<T> {
    /// Content address of the stored bytes.
    pub fn hash(&self) -> Cid {
        self.hash
    }

    /// Length of the stored bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_initialized(&self) -> bool {
        self.context.is_some()
    }

    /// Bind the encoding and keychain used to open fields.
    pub fn init(&mut self, context: EntryContext<T>) {
        self.context = Some(context);
    }

    pub fn with_context(mut self, context: EntryContext<T>) -> Self {
        self.init(context);
        self
    }

    pub fn meta_envelope(&self) -> &MaybeEncrypted<Meta> {
        &self.meta
    }

    pub fn payload_envelope(&self) -> &MaybeEncrypted<Payload> {
        &self.payload
    }

    pub fn signature_envelopes(&self) -> &[MaybeEncrypted<SignatureWithKey>] {
        self.signatures.as_deref().unwrap_or(&[])
    }

    /// The entry metadata, decrypting it on first access.
    pub fn meta(&self) -> Result<&Meta> {
        if let Some(meta) = self.meta.as_decrypted() {
            return Ok(meta);
        }
        if let Some(meta) = self.meta_cache.get() {
            return Ok(meta);
        }

        let context = self
            .context
            .as_ref()
            .ok_or(LogError::NotInitialized("meta"))?;
        let meta = self.meta.decrypt(context.resolver())?.into_owned();
        Ok(self.meta_cache.get_or_init(|| meta))
    }

    /// The encoded payload, decrypting it on first access.
    pub fn payload(&self) -> Result<&Payload> {
        if let Some(payload) = self.payload.as_decrypted() {
            return Ok(payload);
        }
        if let Some(payload) = self.payload_cache.get() {
            return Ok(payload);
        }

        let context = self
            .context
            .as_ref()
            .ok_or(LogError::NotInitialized("payload"))?;
        let payload = self.payload.decrypt(context.resolver())?.into_owned();
        Ok(self.payload_cache.get_or_init(|| payload))
    }

    /// The decoded value.
    pub fn value(&self) -> Result<&T> {
        if let Some(value) = self.value_cache.get() {
            return Ok(value);
        }

        let context = self
            .context
            .as_ref()
            .ok_or(LogError::NotInitialized("value"))?;
        let value = context.encoding.decode(&self.payload()?.data)?;
        Ok(self.value_cache.get_or_init(|| value))
    }

    /// All signatures. Fails if any of them cannot be opened.
    pub fn signatures(&self) -> Result<Vec<SignatureWithKey>> {
        let resolver = self.context.as_ref().and_then(|c| c.resolver());
        let envelopes = self.signature_envelopes();
        let mut out = Vec::with_capacity(envelopes.len());

        for envelope in envelopes {
            if envelope.is_encrypted() && self.context.is_none() {
                return Err(LogError::NotInitialized("signatures"));
            }
            out.push(envelope.decrypt(resolver)?.into_owned());
        }

        Ok(out)
    }

    /// Public keys of the signatures that can be opened locally.
    pub fn signers(&self) -> Vec<PublicKey> {
        self.resolvable_signatures()
            .into_iter()
            .map(|s| s.public_key)
            .collect()
    }

    /// Verify every signature resolvable with local keys.
    ///
    /// Unresolvable signatures are skipped. Returns `false` if none could be
    /// resolved or any resolved signature is invalid.
    pub fn verify_signatures(&self) -> Result<bool> {
        let resolved = self.resolvable_signatures();
        if resolved.is_empty() {
            return Ok(false);
        }

        let signable = self.signable_bytes()?;
        Ok(resolved.iter().all(|s| s.verify(&signable)))
    }

    fn resolvable_signatures(&self) -> Vec<SignatureWithKey> {
        let resolver = self.context.as_ref().and_then(|c| c.resolver());
        self.signature_envelopes()
            .iter()
            .filter_map(|envelope| envelope.decrypt(resolver).ok())
            .map(|s| s.into_owned())
            .collect()
    }

    fn wire(&self, signatures: bool, hash: bool) -> WireRef<'_> {
        WireRef {
            meta: &self.meta,
            payload: &self.payload,
            reserved: self.reserved,
            signatures: self.signatures.as_deref().filter(|_| signatures),
            hash: hash.then_some(&self.hash),
        }
    }

    /// Bytes covered by the signatures.
    pub fn signable_bytes(&self) -> Result<Vec<u8>> {
        Ok(postcard::to_allocvec(&self.wire(false, false))?)
    }

    /// Stored form: everything but the hash.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(postcard::to_allocvec(&self.wire(true, false))?)
    }

    /// Transport form: the stored form plus the embedded hash.
    pub fn encode_with_hash(&self) -> Result<Vec<u8>> {
        Ok(postcard::to_allocvec(&self.wire(true, true))?)
    }

    /// Parse stored bytes. The hash is the content address of `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let wire = decode_wire(bytes)?;

        if wire.hash.is_some() {
            return Err(LogError::Malformed("stored entry embeds a hash".into()));
        }

        Ok(Self::from_wire(wire, Cid::from_data(bytes), bytes.len()))
    }

    /// Parse the transport form, checking the embedded hash.
    pub fn decode_with_hash(bytes: &[u8]) -> Result<Self> {
        let wire = decode_wire(bytes)?;
        let claimed = wire
            .hash
            .ok_or_else(|| LogError::Malformed("missing embedded hash".into()))?;

        let mut entry = Self::from_wire(wire, claimed, 0);
        let stored = entry.to_bytes()?;
        let actual = Cid::from_data(&stored);

        if actual != claimed {
            return Err(LogError::Malformed(format!(
                "embedded hash {claimed} does not match content {actual}"
            )));
        }

        entry.size = stored.len();
        Ok(entry)
    }

    fn from_wire(wire: WireOwned, hash: Cid, size: usize) -> Self {
        Self {
            hash,
            meta: wire.meta,
            payload: wire.payload,
            signatures: wire.signatures,
            reserved: wire.reserved,
            size,
            context: None,
            meta_cache: OnceLock::new(),
            payload_cache: OnceLock::new(),
            value_cache: OnceLock::new(),
        }
    }
}

fn decode_wire(bytes: &[u8]) -> Result<WireOwned> {
    let (wire, rest) = postcard::take_from_bytes::<WireOwned>(bytes)
        .map_err(|e| LogError::Malformed(e.to_string()))?;

    if !rest.is_empty() {
        return Err(LogError::Malformed(format!(
            "{} trailing bytes after entry",
            rest.len()
        )));
    }

    Ok(wire)
}

impl<T> fmt::Debug for Entry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("hash", &self.hash)
            .field("size", &self.size)
            .field("meta_encrypted", &self.meta.is_encrypted())
            .field("payload_encrypted", &self.payload.is_encrypted())
            .field("signatures", &self.signature_envelopes().len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Creation
// ---------------------------------------------------------------------------

/// Receiver sets for the signatures of a new entry.
#[derive(Clone, Debug)]
pub enum SignatureReceivers {
    /// Every signature is sealed for the same receivers.
    All(ReceiverSet),
    /// Keyed by [`PublicKey::hashcode`] of the signer; signers without an
    /// entry stay in the clear.
    PerSigner(HashMap<String, ReceiverSet>),
}

/// Which fields of a new entry to seal, and for whom.
#[derive(Clone, Debug, Default)]
pub struct EncryptionOptions {
    pub meta: Option<ReceiverSet>,
    pub payload: Option<ReceiverSet>,
    pub signatures: Option<SignatureReceivers>,
}

/// Inputs to [`Entry::create`].
pub struct CreateProperties<'a, T> {
    store: &'a dyn BlockStore,
    identity: &'a dyn Identity,
    data: &'a T,
    encoding: Arc<dyn Encoding<T>>,
    keychain: Option<Arc<dyn KeyResolver>>,
    signers: Vec<Arc<dyn Identity>>,
    clock: Option<Timestamp>,
    hlc: Option<&'a HybridClock>,
    next: Vec<&'a Entry<T>>,
    gid_seed: Option<Vec<u8>>,
    kind: EntryType,
    meta_data: Option<Vec<u8>>,
    encryption: EncryptionOptions,
    can_append: Option<CanAppend<T>>,
}

impl<'a, T> CreateProperties<'a, T> {
    pub fn new(
        store: &'a dyn BlockStore,
        identity: &'a dyn Identity,
        data: &'a T,
        encoding: Arc<dyn Encoding<T>>,
    ) -> Self {
        Self {
            store,
            identity,
            data,
            encoding,
            keychain: None,
            signers: Vec::new(),
            clock: None,
            hlc: None,
            next: Vec::new(),
            gid_seed: None,
            kind: EntryType::Append,
            meta_data: None,
            encryption: EncryptionOptions::default(),
            can_append: None,
        }
    }

    pub fn keychain(mut self, keychain: Option<Arc<dyn KeyResolver>>) -> Self {
        self.keychain = keychain;
        self
    }

    /// Additional identities signing next to the primary one.
    pub fn signers(mut self, signers: Vec<Arc<dyn Identity>>) -> Self {
        self.signers = signers;
        self
    }

    /// Use an explicit timestamp instead of ticking a clock.
    pub fn clock(mut self, clock: Option<Timestamp>) -> Self {
        self.clock = clock;
        self
    }

    /// Clock merged with the predecessors and ticked for the entry.
    pub fn hlc(mut self, hlc: &'a HybridClock) -> Self {
        self.hlc = Some(hlc);
        self
    }

    pub fn next(mut self, next: Vec<&'a Entry<T>>) -> Self {
        self.next = next;
        self
    }

    /// Seed for the gid of a root entry.
    pub fn gid_seed(mut self, seed: Option<Vec<u8>>) -> Self {
        self.gid_seed = seed;
        self
    }

    pub fn kind(mut self, kind: EntryType) -> Self {
        self.kind = kind;
        self
    }

    pub fn meta_data(mut self, data: Option<Vec<u8>>) -> Self {
        self.meta_data = data;
        self
    }

    pub fn encryption(mut self, encryption: EncryptionOptions) -> Self {
        self.encryption = encryption;
        self
    }

    pub fn can_append(mut self, can_append: Option<CanAppend<T>>) -> Self {
        self.can_append = can_append;
        self
    }
}

impl<T: Clone> Entry<T> {
    /// Build, sign, authorize and store a new entry.
    pub async fn create(props: CreateProperties<'_, T>) -> Result<Self> {
        let gid = resolve_gid(&props.next, props.gid_seed.as_deref())?;
        let timestamp = resolve_clock(&props.next, props.clock, props.hlc)?;

        let meta = Meta {
            clock: LamportClock::new(props.identity.public_key().as_bytes().to_vec(), timestamp),
            gid,
            next: props.next.iter().map(|e| e.hash).collect(),
            kind: props.kind,
            data: props.meta_data,
        };
        let payload = Payload {
            data: props.encoding.encode(props.data)?,
        };

        let mut entry = Entry {
            hash: Cid::UNASSIGNED,
            meta: match &props.encryption.meta {
                Some(receivers) => MaybeEncrypted::encrypt(&meta, receivers)?,
                None => MaybeEncrypted::Decrypted(meta.clone()),
            },
            payload: match &props.encryption.payload {
                Some(receivers) => MaybeEncrypted::encrypt(&payload, receivers)?,
                None => MaybeEncrypted::Decrypted(payload.clone()),
            },
            signatures: None,
            reserved: [0u8; 4],
            size: 0,
            context: Some(EntryContext {
                encoding: props.encoding,
                keychain: props.keychain,
            }),
            meta_cache: OnceLock::new(),
            payload_cache: OnceLock::new(),
            value_cache: OnceLock::new(),
        };

        let signable = entry.signable_bytes()?;
        let mut signatures = vec![props.identity.sign(&signable)];
        signatures.extend(props.signers.iter().map(|s| s.sign(&signable)));
        signatures.sort_by(|a, b| a.signature.cmp(&b.signature));

        entry.signatures = Some(
            signatures
                .into_iter()
                .map(|s| seal_signature(s, props.encryption.signatures.as_ref()))
                .collect::<Result<_>>()?,
        );

        let _ = entry.meta_cache.set(meta);
        let _ = entry.payload_cache.set(payload);
        let _ = entry.value_cache.set(props.data.clone());

        if let Some(can_append) = &props.can_append {
            if !can_append(&entry) {
                return Err(AccessError::Unauthorized.into());
            }
        }

        let bytes = entry.to_bytes()?;
        entry.size = bytes.len();
        entry.hash = props.store.put(Bytes::from(bytes)).await?;

        trace!(hash = %entry.hash, size = entry.size, "created entry");
        Ok(entry)
    }
}

fn resolve_gid<T>(next: &[&Entry<T>], seed: Option<&[u8]>) -> Result<String> {
    let mut min: Option<&str> = None;
    for entry in next {
        let gid = entry.meta()?.gid.as_str();
        if min.is_none_or(|m| gid < m) {
            min = Some(gid);
        }
    }

    Ok(match (min, seed) {
        (Some(gid), _) => gid.to_string(),
        (None, Some(seed)) => Cid::from_data(seed).to_string(),
        (None, None) => Cid::from(rand::random::<[u8; 32]>()).to_string(),
    })
}

fn resolve_clock<T>(
    next: &[&Entry<T>],
    explicit: Option<Timestamp>,
    hlc: Option<&HybridClock>,
) -> Result<Timestamp> {
    if let Some(clock) = explicit {
        if clock == Timestamp::MAX {
            return Err(LogError::Causality {
                next: Timestamp::MAX,
                clock,
            });
        }
        for entry in next {
            let prev = entry.meta()?.clock.timestamp;
            if prev >= clock {
                return Err(LogError::Causality { next: prev, clock });
            }
        }
        if let Some(hlc) = hlc {
            hlc.update(clock);
        }
        return Ok(clock);
    }

    let fresh;
    let hlc = match hlc {
        Some(hlc) => hlc,
        None => {
            fresh = HybridClock::new();
            &fresh
        }
    };

    for entry in next {
        hlc.update(entry.meta()?.clock.timestamp);
    }
    hlc.now().ok_or(LogError::Causality {
        next: hlc.last(),
        clock: Timestamp::MAX,
    })
}

fn seal_signature(
    signature: SignatureWithKey,
    receivers: Option<&SignatureReceivers>,
) -> Result<MaybeEncrypted<SignatureWithKey>> {
    let receivers = match receivers {
        None => None,
        Some(SignatureReceivers::All(receivers)) => Some(receivers),
        Some(SignatureReceivers::PerSigner(map)) => map.get(&signature.public_key.hashcode()),
    };

    match receivers {
        Some(receivers) => MaybeEncrypted::encrypt(&signature, receivers),
        None => Ok(MaybeEncrypted::Decrypted(signature)),
    }
}
