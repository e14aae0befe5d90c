//! Core trait for content-addressed block storage.

use bytes::Bytes;
use reef_types::Cid;

use crate::error::StoreError;

/// Content-addressed block store.
///
/// `put` derives the address from the bytes, so storing the same bytes twice
/// yields the same [`Cid`]. All implementations must be `Send + Sync` for use
/// across fetch tasks.
#[async_trait::async_trait]
pub trait BlockStore: Send + Sync {
    /// Store a block and return its content address.
    async fn put(&self, data: Bytes) -> Result<Cid, StoreError>;

    /// Retrieve a block. Returns `None` if it is not held.
    async fn get(&self, cid: &Cid) -> Result<Option<Bytes>, StoreError>;

    /// Check whether a block is held.
    async fn has(&self, cid: &Cid) -> Result<bool, StoreError>;

    /// Remove a block. Removing an absent block is not an error.
    async fn rm(&self, cid: &Cid) -> Result<(), StoreError>;

    /// Number of blocks held.
    async fn len(&self) -> Result<usize, StoreError>;

    /// Whether the store holds no blocks.
    async fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len().await? == 0)
    }
}
