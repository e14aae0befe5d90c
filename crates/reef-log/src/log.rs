//! The CRDT log: append, join, heads/tails tracking, gid shadowing, trimming.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use reef_store::BlockStore;
use reef_types::events::{EntriesJoined, EntriesTrimmed, EntryAppended, EventBus, GidsRemoved};
use reef_types::{Cid, HybridClock, Timestamp};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::encoding::Encoding;
use crate::entry::{
    CanAppend, CreateProperties, EncryptionOptions, Entry, EntryContext, EntryType,
};
use crate::envelope::KeyResolver;
use crate::error::{AccessError, LogError};
use crate::fetch::{FetchOptions, fetch_all};
use crate::graph::{Frontier, Node, cut};
use crate::identity::Identity;
use crate::trim::TrimPolicy;

type Result<T> = std::result::Result<T, LogError>;

/// Runtime options for [`Log::new`].
pub struct LogOptions<T> {
    id: Option<Vec<u8>>,
    encoding: Arc<dyn Encoding<T>>,
    keychain: Option<Arc<dyn KeyResolver>>,
    can_append: Option<CanAppend<T>>,
    trim: Option<TrimPolicy>,
    events: Option<EventBus>,
    clock: Option<Arc<HybridClock>>,
}

impl<T> LogOptions<T> {
    pub fn new(encoding: Arc<dyn Encoding<T>>) -> Self {
        Self {
            id: None,
            encoding,
            keychain: None,
            can_append: None,
            trim: None,
            events: None,
            clock: None,
        }
    }

    /// Log id. Defaults to 32 random bytes.
    pub fn id(mut self, id: impl Into<Vec<u8>>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn keychain(mut self, keychain: Arc<dyn KeyResolver>) -> Self {
        self.keychain = Some(keychain);
        self
    }

    /// Authorization hook applied to appended and joined entries.
    pub fn can_append(mut self, hook: impl Fn(&Entry<T>) -> bool + Send + Sync + 'static) -> Self {
        self.can_append = Some(Arc::new(hook));
        self
    }

    pub fn trim(mut self, policy: TrimPolicy) -> Self {
        self.trim = Some(policy);
        self
    }

    pub fn events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Share a clock (for example one with a frozen wall source).
    pub fn clock(mut self, clock: Arc<HybridClock>) -> Self {
        self.clock = Some(clock);
        self
    }
}

/// Per-call options for [`Log::append_with`].
#[derive(Default)]
pub struct AppendOptions {
    /// Explicit timestamp; must postdate every predecessor.
    pub clock: Option<Timestamp>,
    /// Predecessors to use instead of the current heads.
    pub next: Option<Vec<Cid>>,
    /// Seed for the gid of an entry without predecessors.
    pub gid_seed: Option<Vec<u8>>,
    pub kind: EntryType,
    pub meta_data: Option<Vec<u8>>,
    /// Identities signing in addition to the log's own.
    pub signers: Vec<Arc<dyn Identity>>,
    pub encryption: EncryptionOptions,
}

/// Options for [`Log::join`].
#[derive(Debug, Clone, Copy)]
pub struct JoinOptions {
    /// Reject the whole join if any new entry fails signature verification.
    pub verify_signatures: bool,
    /// Apply the retention policy after merging.
    pub trim: bool,
}

impl Default for JoinOptions {
    fn default() -> Self {
        Self {
            verify_signatures: false,
            trim: true,
        }
    }
}

/// Outcome of an append.
#[derive(Debug)]
pub struct AppendResult<T> {
    pub entry: Entry<T>,
    pub removed_gids: Vec<String>,
    pub trimmed: Vec<Cid>,
}

/// Outcome of a join.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct JoinReport {
    /// Newly inserted hashes, sorted.
    pub added: Vec<Cid>,
    /// Gids that became shadowed, sorted.
    pub removed_gids: Vec<String>,
    /// Entries evicted by the retention policy or by cuts.
    pub trimmed: Vec<Cid>,
    /// Entries refused by the authorization hook or stamped with
    /// [`Timestamp::MAX`].
    pub rejected: Vec<Cid>,
}

/// Outcome of [`Log::load`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LoadReport {
    pub join: JoinReport,
    pub timed_out: Vec<Cid>,
    pub missing: Vec<Cid>,
}

/// Order-independent summary of a log's state, for comparing replicas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogSnapshot {
    pub id: Vec<u8>,
    pub heads: Vec<Cid>,
    /// All entry hashes, oldest first.
    pub entries: Vec<Cid>,
}

/// A causal, content-addressed CRDT log.
///
/// Mutations take `&mut self`; a caller sharing a log across tasks wraps it
/// in a lock, which also serializes concurrent appends.
pub struct Log<T> {
    id: Vec<u8>,
    store: Arc<dyn BlockStore>,
    identity: Arc<dyn Identity>,
    clock: Arc<HybridClock>,
    context: EntryContext<T>,
    can_append: Option<CanAppend<T>>,
    trim: Option<TrimPolicy>,
    events: Option<EventBus>,
    nodes: HashMap<Cid, Node<T>>,
    frontier: Frontier,
    tombstones: HashSet<Cid>,
}

impl<T: Clone> Clone for Log<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            store: self.store.clone(),
            identity: self.identity.clone(),
            clock: self.clock.clone(),
            context: self.context.clone(),
            can_append: self.can_append.clone(),
            trim: self.trim,
            events: self.events.clone(),
            nodes: self.nodes.clone(),
            frontier: self.frontier.clone(),
            tombstones: self.tombstones.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Log<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Log")
            .field("len", &self.nodes.len())
            .field("heads", &self.frontier.heads)
            .field("trim", &self.trim)
            .finish_non_exhaustive()
    }
}

impl<T> Log<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(store: Arc<dyn BlockStore>, identity: Arc<dyn Identity>, options: LogOptions<T>) -> Self {
        let mut context = EntryContext::new(options.encoding);
        context.keychain = options.keychain;

        Self {
            id: options
                .id
                .unwrap_or_else(|| rand::random::<[u8; 32]>().to_vec()),
            store,
            identity,
            clock: options.clock.unwrap_or_default(),
            context,
            can_append: options.can_append,
            trim: options.trim,
            events: options.events,
            nodes: HashMap::new(),
            frontier: Frontier::default(),
            tombstones: HashSet::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn id(&self) -> &[u8] {
        &self.id
    }

    pub fn identity(&self) -> &Arc<dyn Identity> {
        &self.identity
    }

    pub fn store(&self) -> &Arc<dyn BlockStore> {
        &self.store
    }

    pub fn clock(&self) -> &HybridClock {
        &self.clock
    }

    /// The encoding/keychain context bound to entries this log reads.
    pub fn context(&self) -> &EntryContext<T> {
        &self.context
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn has(&self, hash: &Cid) -> bool {
        self.nodes.contains_key(hash)
    }

    pub fn get(&self, hash: &Cid) -> Option<&Entry<T>> {
        self.nodes.get(hash).map(|n| &n.entry)
    }

    /// Heads, newest first.
    pub fn heads(&self) -> Vec<&Entry<T>> {
        self.frontier
            .heads
            .iter()
            .filter_map(|h| self.get(h))
            .collect()
    }

    pub fn head_hashes(&self) -> &[Cid] {
        &self.frontier.heads
    }

    /// Entries referencing a predecessor this log does not hold.
    pub fn tails(&self) -> Vec<&Entry<T>> {
        self.frontier
            .tails
            .iter()
            .filter_map(|h| self.get(h))
            .collect()
    }

    /// The absent predecessors referenced by [`tails`](Self::tails): where
    /// replication resumes.
    pub fn tail_hashes(&self) -> Vec<Cid> {
        self.frontier.tail_hashes.iter().copied().collect()
    }

    /// Entries without predecessors.
    pub fn roots(&self) -> Vec<&Entry<T>> {
        let mut roots: Vec<&Node<T>> = self
            .nodes
            .values()
            .filter(|n| n.meta.next.is_empty())
            .collect();
        roots.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        roots.into_iter().map(|n| &n.entry).collect()
    }

    /// Every gid carried by an entry in the log.
    pub fn gids(&self) -> BTreeSet<String> {
        self.nodes.values().map(|n| n.meta.gid.clone()).collect()
    }

    /// Gids that no head carries any more.
    pub fn shadowed_gids(&self) -> &BTreeSet<String> {
        &self.frontier.shadowed
    }

    /// Whether `hash` was deleted by a cut and will be refused.
    pub fn is_cut(&self, hash: &Cid) -> bool {
        self.tombstones.contains(hash)
    }

    /// All entries, in no particular order.
    pub fn entries(&self) -> impl Iterator<Item = &Entry<T>> {
        self.nodes.values().map(|n| &n.entry)
    }

    /// All entries, oldest first.
    pub fn ordered_entries(&self) -> Vec<&Entry<T>> {
        let mut nodes: Vec<&Node<T>> = self.nodes.values().collect();
        nodes.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        nodes.into_iter().map(|n| &n.entry).collect()
    }

    /// Decoded values, oldest first.
    pub fn values(&self) -> Result<Vec<&T>> {
        self.ordered_entries().into_iter().map(|e| e.value()).collect()
    }

    pub fn snapshot(&self) -> LogSnapshot {
        LogSnapshot {
            id: self.id.clone(),
            heads: self.frontier.heads.clone(),
            entries: self.ordered_entries().iter().map(|e| e.hash()).collect(),
        }
    }

    // -----------------------------------------------------------------------
    // Mutation
    // -----------------------------------------------------------------------

    /// Append `value` on top of the current heads.
    pub async fn append(&mut self, value: T) -> Result<AppendResult<T>> {
        self.append_with(value, AppendOptions::default()).await
    }

    pub async fn append_with(&mut self, value: T, options: AppendOptions) -> Result<AppendResult<T>> {
        let next_hashes = options.next.unwrap_or_else(|| self.frontier.heads.clone());
        let mut next = Vec::with_capacity(next_hashes.len());
        for hash in &next_hashes {
            next.push(self.get(hash).ok_or(LogError::NotFound(*hash))?);
        }

        let entry = Entry::create(
            CreateProperties::new(&*self.store, &*self.identity, &value, self.context.encoding.clone())
                .keychain(self.context.keychain.clone())
                .signers(options.signers)
                .clock(options.clock)
                .hlc(&self.clock)
                .next(next)
                .gid_seed(options.gid_seed)
                .kind(options.kind)
                .meta_data(options.meta_data)
                .encryption(options.encryption)
                .can_append(self.can_append.clone()),
        )
        .await?;

        let meta = entry.meta()?.clone();
        let hash = entry.hash();
        let gid = meta.gid.clone();
        let is_cut = meta.kind == EntryType::Cut;
        let cut_roots = meta.next.clone();

        self.nodes.insert(
            hash,
            Node {
                entry: entry.clone(),
                meta,
            },
        );

        let mut removed = Vec::new();
        if is_cut {
            removed = cut(&mut self.nodes, &mut self.tombstones, cut_roots);
        }

        let (removed_gids, trimmed) = self.settle(true);
        removed.extend(trimmed);

        debug!(%hash, gid, heads = self.frontier.heads.len(), "appended entry");

        if let Some(events) = &self.events {
            events.emit(EntryAppended { hash, gid });
        }
        self.emit_changes(&removed_gids, &removed);

        Ok(AppendResult {
            entry,
            removed_gids,
            trimmed: removed,
        })
    }

    /// Merge `entries` into the log.
    ///
    /// Entries already present (or deleted by a cut) are ignored, so the
    /// operation is idempotent, commutative and associative over the
    /// resulting entry set, heads and shadowed gids. Nothing is modified if
    /// the call fails.
    pub async fn join(
        &mut self,
        entries: impl IntoIterator<Item = Entry<T>>,
        options: JoinOptions,
    ) -> Result<JoinReport> {
        let mut incoming: Vec<Node<T>> = Vec::new();
        let mut batch = HashSet::new();
        let mut cut_roots = Vec::new();
        let mut rejected = Vec::new();

        for mut entry in entries {
            let hash = entry.hash();
            if self.nodes.contains_key(&hash) || !batch.insert(hash) {
                continue;
            }
            if !entry.is_initialized() {
                entry.init(self.context.clone());
            }

            let meta = entry.meta()?.clone();

            if self.tombstones.contains(&hash) {
                cut_roots.extend(meta.next.iter().copied());
                continue;
            }

            if options.verify_signatures && !entry.verify_signatures()? {
                return Err(AccessError::NoVerifiedSignature(hash).into());
            }

            // Nothing could ever be appended after such an entry.
            if meta.clock.timestamp == Timestamp::MAX {
                warn!(%hash, "entry rejected: clock exhausted");
                rejected.push(hash);
                continue;
            }

            if let Some(can_append) = &self.can_append {
                if !can_append(&entry) {
                    warn!(%hash, "entry rejected by append authorization");
                    rejected.push(hash);
                    continue;
                }
            }

            if meta.kind == EntryType::Cut {
                cut_roots.extend(meta.next.iter().copied());
            }
            incoming.push(Node { entry, meta });
        }

        for node in &incoming {
            let hash = node.entry.hash();
            if self.store.has(&hash).await? {
                continue;
            }
            let stored = self.store.put(Bytes::from(node.entry.to_bytes()?)).await?;
            if stored != hash {
                return Err(LogError::Malformed(format!(
                    "entry {hash} is stored under {stored}"
                )));
            }
        }

        let mut added = Vec::with_capacity(incoming.len());
        for node in incoming {
            self.clock.update(node.meta.clock.timestamp);
            added.push(node.entry.hash());
            self.nodes.insert(node.entry.hash(), node);
        }

        let mut removed = if cut_roots.is_empty() {
            Vec::new()
        } else {
            cut(&mut self.nodes, &mut self.tombstones, cut_roots)
        };
        added.retain(|h| self.nodes.contains_key(h));
        added.sort();

        let (removed_gids, trimmed) = self.settle(options.trim);

        debug!(
            added = added.len(),
            removed_gids = removed_gids.len(),
            trimmed = trimmed.len() + removed.len(),
            len = self.nodes.len(),
            "joined entries"
        );

        if !added.is_empty() {
            if let Some(events) = &self.events {
                events.emit(EntriesJoined {
                    added: added.clone(),
                });
            }
        }
        removed.extend(trimmed);
        self.emit_changes(&removed_gids, &removed);

        Ok(JoinReport {
            added,
            removed_gids,
            trimmed: removed,
            rejected,
        })
    }

    /// Join every entry of `other`.
    pub async fn join_log(&mut self, other: &Log<T>) -> Result<JoinReport> {
        self.join(other.entries().cloned(), JoinOptions::default())
            .await
    }

    /// Fetch history reachable from `heads` out of this log's store, then join it.
    pub async fn load(&mut self, heads: &[Cid], options: FetchOptions<T>) -> Result<LoadReport> {
        let fetched = fetch_all(self.store.clone(), heads, &self.context, &options).await?;
        let join = self.join(fetched.entries, JoinOptions::default()).await?;

        Ok(LoadReport {
            join,
            timed_out: fetched.timed_out,
            missing: fetched.missing,
        })
    }

    /// Remove an entry, and with `recursive` everything it reaches.
    ///
    /// Removed entries are not tombstoned: joining them again restores them.
    pub fn remove(&mut self, hash: &Cid, recursive: bool) -> Result<Vec<Cid>> {
        if !self.nodes.contains_key(hash) {
            return Err(LogError::NotFound(*hash));
        }

        let mut removed = Vec::new();
        let mut stack = vec![*hash];
        while let Some(hash) = stack.pop() {
            let Some(node) = self.nodes.remove(&hash) else {
                continue;
            };
            if recursive {
                stack.extend(node.meta.next.iter().copied());
            }
            removed.push(hash);
        }

        self.frontier = Frontier::compute(&self.nodes, &self.tombstones);
        debug!(removed = removed.len(), "removed entries");
        Ok(removed)
    }

    /// Recompute the frontier after an insertion, report newly shadowed
    /// gids, and apply the retention policy.
    fn settle(&mut self, trim: bool) -> (Vec<String>, Vec<Cid>) {
        let merged = Frontier::compute(&self.nodes, &self.tombstones);
        let removed_gids = merged.newly_shadowed(&self.frontier);

        let evicted = match (&self.trim, trim) {
            (Some(policy), true) => policy.select(&self.nodes),
            _ => Vec::new(),
        };

        if evicted.is_empty() {
            self.frontier = merged;
        } else {
            for hash in &evicted {
                self.nodes.remove(hash);
            }
            self.frontier = Frontier::compute(&self.nodes, &self.tombstones);
            debug!(evicted = evicted.len(), len = self.nodes.len(), "trimmed log");
        }

        (removed_gids, evicted)
    }

    fn emit_changes(&self, removed_gids: &[String], removed: &[Cid]) {
        let Some(events) = &self.events else {
            return;
        };
        if !removed_gids.is_empty() {
            events.emit(GidsRemoved {
                gids: removed_gids.to_vec(),
            });
        }
        if !removed.is_empty() {
            events.emit(EntriesTrimmed {
                hashes: removed.to_vec(),
            });
        }
    }
}
