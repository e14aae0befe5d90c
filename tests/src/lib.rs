//! Shared test harness for reef integration tests.
//!
//! Provides [`Swarm`], a set of replicas of one log. Each replica owns a
//! local block store; reads that miss locally fall through to the other
//! replicas' stores, standing in for a network. Replicas can be taken down
//! to simulate partitions.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use reef_log::{
    Ed25519Identity, FetchOptions, LoadReport, Log, LogOptions, StringEncoding, TrimPolicy,
};
use reef_store::{BlockStore, MemoryBlockStore, StoreError};
use reef_types::Cid;

/// Log id shared by every replica in a swarm.
pub const LOG_ID: &[u8] = b"swarm";

// =========================================================================
// Peer-backed store
// =========================================================================

/// Local store that falls back to reachable peers on a miss.
struct PeerStore {
    index: usize,
    local: Arc<MemoryBlockStore>,
    peers: Arc<RwLock<Vec<Arc<MemoryBlockStore>>>>,
    down: Arc<RwLock<HashSet<usize>>>,
}

#[async_trait]
impl BlockStore for PeerStore {
    async fn put(&self, data: Bytes) -> Result<Cid, StoreError> {
        self.local.put(data).await
    }

    async fn get(&self, cid: &Cid) -> Result<Option<Bytes>, StoreError> {
        if let Some(bytes) = self.local.get(cid).await? {
            return Ok(Some(bytes));
        }

        // Snapshot the reachable peers so no lock is held across awaits.
        let reachable: Vec<Arc<MemoryBlockStore>> = {
            let down = self.down.read().expect("down set lock poisoned");
            if down.contains(&self.index) {
                return Ok(None);
            }
            self.peers
                .read()
                .expect("peers lock poisoned")
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != self.index && !down.contains(i))
                .map(|(_, store)| store.clone())
                .collect()
        };

        for peer in reachable {
            if let Some(bytes) = peer.get(cid).await? {
                return Ok(Some(bytes));
            }
        }
        Ok(None)
    }

    async fn has(&self, cid: &Cid) -> Result<bool, StoreError> {
        self.local.has(cid).await
    }

    async fn rm(&self, cid: &Cid) -> Result<(), StoreError> {
        self.local.rm(cid).await
    }

    async fn len(&self) -> Result<usize, StoreError> {
        self.local.len().await
    }
}

// =========================================================================
// Swarm
// =========================================================================

/// N replicas of the same log, each with its own writer identity.
pub struct Swarm {
    replicas: Vec<Log<String>>,
    locals: Arc<RwLock<Vec<Arc<MemoryBlockStore>>>>,
    down: Arc<RwLock<HashSet<usize>>>,
}

impl Swarm {
    /// Create `n` replicas with no retention policy.
    pub fn new(n: usize) -> Self {
        Self::build(n, None)
    }

    /// Create `n` replicas that all trim with `policy`.
    pub fn with_trim(n: usize, policy: TrimPolicy) -> Self {
        Self::build(n, Some(policy))
    }

    fn build(n: usize, policy: Option<TrimPolicy>) -> Self {
        assert!(n >= 1, "need at least one replica");
        assert!(n < 255, "too many replicas");
        reef_log::telemetry::init_test_logging();

        let locals: Vec<Arc<MemoryBlockStore>> =
            (0..n).map(|_| Arc::new(MemoryBlockStore::new())).collect();
        let locals = Arc::new(RwLock::new(locals));
        let down = Arc::new(RwLock::new(HashSet::new()));

        let replicas = (0..n)
            .map(|index| {
                let local = locals.read().expect("peers lock poisoned")[index].clone();
                let store: Arc<dyn BlockStore> = Arc::new(PeerStore {
                    index,
                    local,
                    peers: locals.clone(),
                    down: down.clone(),
                });

                let mut options = LogOptions::new(Arc::new(StringEncoding)).id(LOG_ID.to_vec());
                if let Some(policy) = policy {
                    options = options.trim(policy);
                }

                let identity = Arc::new(Ed25519Identity::from_seed([index as u8 + 1; 32]));
                Log::new(store, identity, options)
            })
            .collect();

        Self {
            replicas,
            locals,
            down,
        }
    }

    /// Replica `i`.
    pub fn replica(&self, i: usize) -> &Log<String> {
        &self.replicas[i]
    }

    /// Mutable access to replica `i`.
    pub fn replica_mut(&mut self, i: usize) -> &mut Log<String> {
        &mut self.replicas[i]
    }

    /// Number of replicas.
    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    /// Returns `true` if the swarm has no replicas.
    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }

    /// Blocks held in replica `i`'s local store.
    pub async fn local_block_count(&self, i: usize) -> usize {
        let local = self.locals.read().expect("peers lock poisoned")[i].clone();
        local.len().await.unwrap()
    }

    /// Cut replica `i` off: it can neither serve nor pull blocks.
    pub fn kill(&self, i: usize) {
        self.down.write().expect("down set lock poisoned").insert(i);
    }

    /// Reconnect replica `i`.
    pub fn revive(&self, i: usize) {
        self.down.write().expect("down set lock poisoned").remove(&i);
    }

    /// Append `value` on replica `i`.
    pub async fn append(&mut self, i: usize, value: impl Into<String>) -> Cid {
        self.replicas[i]
            .append(value.into())
            .await
            .unwrap()
            .entry
            .hash()
    }

    /// Replica `to` pulls everything reachable from replica `from`'s heads
    /// that it does not already hold.
    pub async fn sync(&mut self, from: usize, to: usize) -> LoadReport {
        let known: HashSet<Cid> = self.replicas[to].entries().map(|e| e.hash()).collect();
        let options = FetchOptions::new().should_fetch(move |hash| !known.contains(hash));
        self.sync_with(from, to, options).await
    }

    /// Like [`Swarm::sync`] with explicit fetch options.
    pub async fn sync_with(
        &mut self,
        from: usize,
        to: usize,
        options: FetchOptions<String>,
    ) -> LoadReport {
        let heads = self.replicas[from].head_hashes().to_vec();
        self.replicas[to].load(&heads, options).await.unwrap()
    }

    /// Pull every replica's heads into every other replica, twice round, so
    /// everything reachable has propagated.
    pub async fn sync_all(&mut self) {
        for _ in 0..2 {
            for from in 0..self.len() {
                for to in 0..self.len() {
                    if from != to {
                        self.sync(from, to).await;
                    }
                }
            }
        }
    }
}

/// Deterministic value for writer `writer`'s `i`-th append.
pub fn value(writer: usize, i: usize) -> String {
    format!("w{writer}-{i:04}")
}
