//! In-memory block storage backend.

use std::collections::HashMap;
use std::sync::RwLock;

use bytes::Bytes;
use reef_types::Cid;
use tracing::trace;

use crate::error::StoreError;
use crate::traits::BlockStore;

/// In-memory block store backed by a `RwLock<HashMap>`.
///
/// Reads re-hash the held bytes, so tampering with a block surfaces as
/// [`StoreError::Corrupt`] instead of silently returning foreign content.
#[derive(Default)]
pub struct MemoryBlockStore {
    blocks: RwLock<HashMap<Cid, Bytes>>,
}

impl MemoryBlockStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the bytes held under `cid` without re-addressing them.
    ///
    /// Only useful for simulating disk corruption in tests.
    pub fn overwrite_unchecked(&self, cid: Cid, data: Bytes) {
        self.blocks
            .write()
            .expect("lock poisoned")
            .insert(cid, data);
    }
}

#[async_trait::async_trait]
impl BlockStore for MemoryBlockStore {
    async fn put(&self, data: Bytes) -> Result<Cid, StoreError> {
        let cid = Cid::from_data(&data);
        trace!(%cid, size = data.len(), "storing block in memory");
        self.blocks.write().expect("lock poisoned").insert(cid, data);
        Ok(cid)
    }

    async fn get(&self, cid: &Cid) -> Result<Option<Bytes>, StoreError> {
        let map = self.blocks.read().expect("lock poisoned");

        let Some(data) = map.get(cid) else {
            return Ok(None);
        };

        let actual = Cid::from_data(data);

        if actual != *cid {
            return Err(StoreError::Corrupt {
                expected: *cid,
                actual,
            });
        }

        Ok(Some(data.clone()))
    }

    async fn has(&self, cid: &Cid) -> Result<bool, StoreError> {
        Ok(self.blocks.read().expect("lock poisoned").contains_key(cid))
    }

    async fn rm(&self, cid: &Cid) -> Result<(), StoreError> {
        self.blocks.write().expect("lock poisoned").remove(cid);
        trace!(%cid, "removed block from memory");
        Ok(())
    }

    async fn len(&self) -> Result<usize, StoreError> {
        Ok(self.blocks.read().expect("lock poisoned").len())
    }
}
