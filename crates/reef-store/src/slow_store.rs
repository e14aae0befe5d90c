//! A [`BlockStore`] wrapper that injects latency, stalls and failures.
//!
//! `SlowStore` wraps any `Arc<dyn BlockStore>` and sleeps for a random
//! duration before each read or write. Individual blocks can additionally be
//! marked as stalled (reads never complete) or failing (reads return
//! [`StoreError::Unavailable`]). The RNG is seeded for reproducible runs.
//!
//! # Example
//!
//! ```ignore
//! let slow = SlowStore::new(inner)
//!     .read_latency(5, 20)    // 5–20 ms per read
//!     .write_latency(10, 30)  // 10–30 ms per write
//!     .seed(42);
//! slow.stall(cid);
//! ```

use std::collections::HashSet;
use std::sync::{Arc, Mutex, RwLock};

use bytes::Bytes;
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;
use reef_types::Cid;

use crate::error::StoreError;
use crate::traits::BlockStore;

/// A [`BlockStore`] wrapper for exercising timeouts and races.
pub struct SlowStore {
    inner: Arc<dyn BlockStore>,
    read_latency_ms: (u64, u64),
    write_latency_ms: (u64, u64),
    rng: Mutex<StdRng>,
    stalled: RwLock<HashSet<Cid>>,
    failing: RwLock<HashSet<Cid>>,
}

impl SlowStore {
    /// Wrap an existing store with zero latency (pass-through) by default.
    pub fn new(inner: Arc<dyn BlockStore>) -> Self {
        Self {
            inner,
            read_latency_ms: (0, 0),
            write_latency_ms: (0, 0),
            rng: Mutex::new(StdRng::seed_from_u64(0)),
            stalled: RwLock::new(HashSet::new()),
            failing: RwLock::new(HashSet::new()),
        }
    }

    /// Set the read latency range in milliseconds (uniform random).
    pub fn read_latency(mut self, min_ms: u64, max_ms: u64) -> Self {
        self.read_latency_ms = (min_ms, max_ms);
        self
    }

    /// Set the write latency range in milliseconds (uniform random).
    pub fn write_latency(mut self, min_ms: u64, max_ms: u64) -> Self {
        self.write_latency_ms = (min_ms, max_ms);
        self
    }

    /// Set the RNG seed for deterministic behaviour.
    pub fn seed(self, seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            ..self
        }
    }

    /// Make every future `get` of `cid` hang forever.
    pub fn stall(&self, cid: Cid) {
        self.stalled.write().expect("lock poisoned").insert(cid);
    }

    /// Make every future `get` of `cid` fail.
    pub fn fail(&self, cid: Cid) {
        self.failing.write().expect("lock poisoned").insert(cid);
    }

    /// Sleep for a random duration in `[min, max]` milliseconds.
    async fn delay(&self, range: (u64, u64)) {
        let (min, max) = range;

        if max == 0 {
            return;
        }

        let ms = if min == max {
            min
        } else {
            self.rng
                .lock()
                .expect("rng lock poisoned")
                .random_range(min..=max)
        };

        if ms > 0 {
            tokio::time::sleep(tokio::time::Duration::from_millis(ms)).await;
        }
    }
}

#[async_trait::async_trait]
impl BlockStore for SlowStore {
    async fn put(&self, data: Bytes) -> Result<Cid, StoreError> {
        self.delay(self.write_latency_ms).await;
        self.inner.put(data).await
    }

    async fn get(&self, cid: &Cid) -> Result<Option<Bytes>, StoreError> {
        self.delay(self.read_latency_ms).await;

        if self.stalled.read().expect("lock poisoned").contains(cid) {
            std::future::pending::<()>().await;
        }

        if self.failing.read().expect("lock poisoned").contains(cid) {
            return Err(StoreError::Unavailable {
                cid: *cid,
                reason: "injected failure".to_string(),
            });
        }

        self.inner.get(cid).await
    }

    async fn has(&self, cid: &Cid) -> Result<bool, StoreError> {
        self.delay(self.read_latency_ms).await;
        self.inner.has(cid).await
    }

    async fn rm(&self, cid: &Cid) -> Result<(), StoreError> {
        self.delay(self.write_latency_ms).await;
        self.inner.rm(cid).await
    }

    async fn len(&self) -> Result<usize, StoreError> {
        self.inner.len().await
    }
}
