//! Byte-bounded block cache for repeated history fetches.
//!
//! Holds block bytes that a reader has already parsed and checked against
//! their address, so a replica re-syncing the same history from several
//! peers does not go back to the store for them. Eviction is second-chance
//! (CLOCK): a hit only sets a flag, and the eviction hand skips flagged
//! blocks once before dropping them.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use bytes::Bytes;
use reef_types::Cid;
use tracing::trace;

struct Slot {
    bytes: Bytes,
    referenced: bool,
}

#[derive(Default)]
struct Ring {
    slots: HashMap<Cid, Slot>,
    /// Eviction order. Every key of `slots` appears exactly once.
    hand: VecDeque<Cid>,
    used: u64,
}

impl Ring {
    /// Drop unreferenced blocks from the hand until `incoming` more bytes fit.
    fn make_room(&mut self, incoming: u64, capacity: u64) {
        while self.used + incoming > capacity {
            let Some(cid) = self.hand.pop_front() else {
                return;
            };
            let Some(slot) = self.slots.get_mut(&cid) else {
                continue;
            };

            if slot.referenced {
                slot.referenced = false;
                self.hand.push_back(cid);
                continue;
            }

            if let Some(slot) = self.slots.remove(&cid) {
                self.used -= slot.bytes.len() as u64;
                trace!(%cid, "evicted cached block");
            }
        }
    }
}

/// Shared cache of verified block bytes, bounded by total size.
pub struct BlockCache {
    capacity: u64,
    ring: Mutex<Ring>,
}

impl BlockCache {
    /// A cache holding at most `capacity` bytes. Zero disables it.
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            ring: Mutex::new(Ring::default()),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Remember the bytes of `cid`. Blocks larger than the whole cache are
    /// ignored.
    pub fn insert(&self, cid: Cid, bytes: Bytes) {
        let size = bytes.len() as u64;
        if size > self.capacity {
            return;
        }

        let mut ring = self.ring.lock().expect("cache lock poisoned");
        if let Some(slot) = ring.slots.get_mut(&cid) {
            // Content addressed: the bytes cannot differ.
            slot.referenced = true;
            return;
        }

        ring.make_room(size, self.capacity);
        ring.used += size;
        ring.hand.push_back(cid);
        ring.slots.insert(
            cid,
            Slot {
                bytes,
                referenced: false,
            },
        );
    }

    pub fn get(&self, cid: &Cid) -> Option<Bytes> {
        let mut ring = self.ring.lock().expect("cache lock poisoned");
        let slot = ring.slots.get_mut(cid)?;
        slot.referenced = true;
        Some(slot.bytes.clone())
    }

    pub fn contains(&self, cid: &Cid) -> bool {
        self.ring
            .lock()
            .expect("cache lock poisoned")
            .slots
            .contains_key(cid)
    }

    /// Number of cached blocks.
    pub fn len(&self) -> usize {
        self.ring.lock().expect("cache lock poisoned").slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total bytes currently held.
    pub fn used_bytes(&self) -> u64 {
        self.ring.lock().expect("cache lock poisoned").used
    }
}

impl std::fmt::Debug for BlockCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockCache")
            .field("capacity", &self.capacity)
            .field("used", &self.used_bytes())
            .finish()
    }
}
