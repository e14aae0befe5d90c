//! Content-addressed block storage for reef.
//!
//! This crate defines the [`BlockStore`] trait the log relies on for entry
//! addressing and fetch traversal, along with:
//!
//! - [`MemoryBlockStore`] — in-memory storage backed by a `RwLock<HashMap>`.
//! - [`SlowStore`] — wrapper injecting latency, stalls and failures for tests.
//! - [`BlockCache`] — byte-bounded cache of verified blocks, consulted before store reads.

mod cache;
mod error;
mod memory_store;
mod slow_store;
mod traits;

pub use cache::BlockCache;
pub use error::StoreError;
pub use memory_store::MemoryBlockStore;
pub use slow_store::SlowStore;
pub use traits::BlockStore;
