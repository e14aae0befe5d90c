//! Bounded, concurrent, best-effort backward traversal of a log's DAG.
//!
//! [`fetch_all`] walks `next` pointers from a set of head hashes, reading
//! entries from a [`BlockStore`]. Candidates are explored newest-first through
//! a max-heap keyed by the timestamp of the entry that referenced them, so
//! that with a `length` bound the result is the `length` entries with the
//! largest timestamps reachable from the heads.
//!
//! Reads run on a [`JoinSet`] with at most `concurrency` in flight. A read
//! that exceeds the per-hash timeout abandons that branch; a store error or a
//! corrupt entry fails the whole call.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use reef_store::{BlockCache, BlockStore, StoreError};
use reef_types::events::{EventBus, FetchTimedOut};
use reef_types::{Cid, Timestamp};
use tokio::task::JoinSet;
use tracing::{debug, trace, warn};

use crate::entry::{Entry, EntryContext};
use crate::error::LogError;

/// Default number of concurrent store reads.
pub const DEFAULT_CONCURRENCY: usize = 32;

/// Default per-hash read timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

type HashFilter = Arc<dyn Fn(&Cid) -> bool + Send + Sync>;
type EntryFilter<T> = Arc<dyn Fn(&Entry<T>) -> bool + Send + Sync>;

/// Options for [`fetch_all`].
pub struct FetchOptions<T> {
    /// Maximum number of entries to return; `None` fetches everything.
    pub length: Option<usize>,
    pub concurrency: usize,
    /// Per-hash read timeout.
    pub timeout: Duration,
    should_fetch: Option<HashFilter>,
    should_include: Option<EntryFilter<T>>,
    cache: Option<Arc<BlockCache>>,
    events: Option<EventBus>,
}

impl<T> FetchOptions<T> {
    pub fn new() -> Self {
        Self {
            length: None,
            concurrency: DEFAULT_CONCURRENCY,
            timeout: DEFAULT_TIMEOUT,
            should_fetch: None,
            should_include: None,
            cache: None,
            events: None,
        }
    }

    pub fn length(mut self, length: usize) -> Self {
        self.length = Some(length);
        self
    }

    pub fn unbounded(mut self) -> Self {
        self.length = None;
        self
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Hashes rejected by `filter` are left out of the result. They are still
    /// read so traversal can continue through them.
    pub fn should_fetch(mut self, filter: impl Fn(&Cid) -> bool + Send + Sync + 'static) -> Self {
        self.should_fetch = Some(Arc::new(filter));
        self
    }

    /// Entries rejected by `filter` are left out of the result, but their
    /// predecessors are still traversed.
    pub fn should_include(
        mut self,
        filter: impl Fn(&Entry<T>) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.should_include = Some(Arc::new(filter));
        self
    }

    /// Consult `cache` before reading the store. Blocks read from the store
    /// are added once they parse and match their hash.
    pub fn cache(mut self, cache: Arc<BlockCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn block_cache(&self) -> Option<&Arc<BlockCache>> {
        self.cache.as_ref()
    }

    /// Publish [`FetchTimedOut`] events on `events`.
    pub fn events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }
}

impl<T> Default for FetchOptions<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for FetchOptions<T> {
    fn clone(&self) -> Self {
        Self {
            length: self.length,
            concurrency: self.concurrency,
            timeout: self.timeout,
            should_fetch: self.should_fetch.clone(),
            should_include: self.should_include.clone(),
            cache: self.cache.clone(),
            events: self.events.clone(),
        }
    }
}

impl<T> fmt::Debug for FetchOptions<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchOptions")
            .field("length", &self.length)
            .field("concurrency", &self.concurrency)
            .field("timeout", &self.timeout)
            .field("cache", &self.cache.is_some())
            .finish_non_exhaustive()
    }
}

/// What [`fetch_all`] found.
#[derive(Debug)]
pub struct FetchResult<T> {
    /// Accepted entries, newest first.
    pub entries: Vec<Entry<T>>,
    /// Hashes whose read timed out.
    pub timed_out: Vec<Cid>,
    /// Hashes the store does not hold.
    pub missing: Vec<Cid>,
}

#[derive(Debug, PartialEq, Eq)]
struct Candidate {
    /// Timestamp of the entry that referenced `hash`.
    discovered: Timestamp,
    hash: Cid,
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.discovered
            .cmp(&other.discovered)
            .then_with(|| self.hash.cmp(&other.hash))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

enum ReadOutcome {
    Cached(Bytes),
    Loaded(Bytes),
    Missing,
    TimedOut,
    Failed(StoreError),
}

async fn read_block(
    store: Arc<dyn BlockStore>,
    cache: Option<Arc<BlockCache>>,
    hash: Cid,
    timeout: Duration,
) -> (Cid, ReadOutcome) {
    if let Some(bytes) = cache.as_ref().and_then(|c| c.get(&hash)) {
        trace!(%hash, "fetch cache hit");
        return (hash, ReadOutcome::Cached(bytes));
    }

    let outcome = match tokio::time::timeout(timeout, store.get(&hash)).await {
        Err(_) => ReadOutcome::TimedOut,
        Ok(Err(e)) => ReadOutcome::Failed(e),
        Ok(Ok(None)) => ReadOutcome::Missing,
        Ok(Ok(Some(bytes))) => ReadOutcome::Loaded(bytes),
    };

    (hash, outcome)
}

/// Fetch entries reachable from `heads`.
///
/// Entries are bound to `context` so their metadata can be opened. Entries
/// whose metadata cannot be opened with the context's keychain are skipped
/// with a warning, since their predecessors are unknown.
pub async fn fetch_all<T>(
    store: Arc<dyn BlockStore>,
    heads: &[Cid],
    context: &EntryContext<T>,
    options: &FetchOptions<T>,
) -> Result<FetchResult<T>, LogError> {
    let mut queue = BinaryHeap::new();
    let mut seen = HashSet::new();
    let mut accepted: BTreeMap<(Timestamp, Cid), Entry<T>> = BTreeMap::new();
    let mut timed_out = Vec::new();
    let mut missing = Vec::new();
    let mut in_flight = JoinSet::new();

    for head in heads {
        if seen.insert(*head) {
            queue.push(Candidate {
                discovered: Timestamp::MAX,
                hash: *head,
            });
        }
    }

    // Once the result is full, only candidates newer than its oldest member
    // can still displace it.
    let floor = |accepted: &BTreeMap<(Timestamp, Cid), Entry<T>>| -> Option<Timestamp> {
        let limit = options.length?;
        if accepted.len() < limit {
            return None;
        }
        Some(accepted.keys().next().map_or(Timestamp::MAX, |(ts, _)| *ts))
    };

    loop {
        while in_flight.len() < options.concurrency {
            let Some(candidate) = queue.pop() else {
                break;
            };

            if let Some(floor) = floor(&accepted) {
                if candidate.discovered <= floor {
                    trace!(pruned = queue.len() + 1, "fetch bound reached");
                    queue.clear();
                    break;
                }
            }

            in_flight.spawn(read_block(
                store.clone(),
                options.cache.clone(),
                candidate.hash,
                options.timeout,
            ));
        }

        let Some(joined) = in_flight.join_next().await else {
            break;
        };
        let (hash, outcome) = joined.map_err(|e| LogError::Task(e.to_string()))?;

        let (bytes, cached) = match outcome {
            ReadOutcome::Cached(bytes) => (bytes, true),
            ReadOutcome::Loaded(bytes) => (bytes, false),
            ReadOutcome::Missing => {
                trace!(%hash, "block not in store");
                missing.push(hash);
                continue;
            }
            ReadOutcome::TimedOut => {
                warn!(%hash, timeout_ms = options.timeout.as_millis() as u64, "fetch timed out, abandoning branch");
                if let Some(events) = &options.events {
                    events.emit(FetchTimedOut { hash });
                }
                timed_out.push(hash);
                continue;
            }
            ReadOutcome::Failed(e) => return Err(e.into()),
        };

        let entry = Entry::from_bytes(&bytes)?.with_context(context.clone());
        if entry.hash() != hash {
            return Err(LogError::Malformed(format!(
                "block {hash} hashes to {}",
                entry.hash()
            )));
        }
        if !cached {
            if let Some(cache) = &options.cache {
                cache.insert(hash, bytes);
            }
        }

        let (timestamp, next) = match entry.meta() {
            Ok(meta) => (meta.clock.timestamp, meta.next.clone()),
            Err(LogError::Access(e)) => {
                warn!(%hash, error = %e, "skipping entry with unreadable metadata");
                continue;
            }
            Err(e) => return Err(e),
        };

        let include = options.should_fetch.as_ref().is_none_or(|filter| filter(&hash))
            && options
                .should_include
                .as_ref()
                .is_none_or(|filter| filter(&entry));

        if include {
            match floor(&accepted) {
                None => {
                    accepted.insert((timestamp, hash), entry);
                }
                Some(_) => {
                    let key = (timestamp, hash);
                    if accepted.keys().next().is_some_and(|oldest| key > *oldest) {
                        accepted.insert(key, entry);
                        accepted.pop_first();
                    }
                }
            }
        }

        // Predecessors are strictly older than `timestamp`.
        if floor(&accepted).is_some_and(|floor| timestamp <= floor) {
            continue;
        }

        for prev in next {
            if seen.insert(prev) {
                queue.push(Candidate {
                    discovered: timestamp,
                    hash: prev,
                });
            }
        }
    }

    debug!(
        fetched = accepted.len(),
        timed_out = timed_out.len(),
        missing = missing.len(),
        "fetch complete"
    );

    Ok(FetchResult {
        entries: accepted.into_values().rev().collect(),
        timed_out,
        missing,
    })
}
