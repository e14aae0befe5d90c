//! Type-safe event bus for log notifications.
//!
//! The [`EventBus`] lets a log publish typed events (appends, joins, gids
//! shadowed by a merge, trimmed entries) and lets dependents such as an index
//! subscribe to the types they care about without direct coupling.
//!
//! # Design
//!
//! One broadcast channel per event type, keyed by `TypeId` and created on the
//! first `subscribe()`. Emitting to a type nobody listens to is a no-op.
//! `emit()` never awaits: by the time it returns the event sits in every
//! subscriber's queue, which is what lets a log report shadowed gids before
//! the `append` or `join` that caused them completes.
//!
//! # Example
//!
//! ```rust
//! use reef_types::events::{EventBus, GidsRemoved};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let bus = EventBus::new();
//! let mut rx = bus.subscribe::<GidsRemoved>();
//!
//! bus.emit(GidsRemoved {
//!     gids: vec!["abc".to_string()],
//! });
//!
//! let event = rx.recv().await.unwrap();
//! assert_eq!(event.gids, vec!["abc".to_string()]);
//! # });
//! ```

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tracing::warn;

use crate::Cid;

// ---------------------------------------------------------------------------
// Event trait
// ---------------------------------------------------------------------------

/// Marker trait for all events that can travel through the [`EventBus`].
pub trait Event: Any + Send + Sync + Clone + std::fmt::Debug + 'static {}

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

/// A local writer appended an entry.
#[derive(Clone, Debug)]
pub struct EntryAppended {
    /// Content address of the new entry.
    pub hash: Cid,
    /// Graph id the entry was assigned.
    pub gid: String,
}
impl Event for EntryAppended {}

/// A join inserted entries that were not present before.
#[derive(Clone, Debug)]
pub struct EntriesJoined {
    /// Hashes of the newly inserted entries.
    pub added: Vec<Cid>,
}
impl Event for EntriesJoined {}

/// Gids whose entries are now all causally dominated by entries of other
/// gids. Derived state keyed by these gids may be dropped.
#[derive(Clone, Debug)]
pub struct GidsRemoved {
    /// The shadowed gids, sorted.
    pub gids: Vec<String>,
}
impl Event for GidsRemoved {}

/// The retention policy evicted entries from a log.
#[derive(Clone, Debug)]
pub struct EntriesTrimmed {
    /// Hashes of the evicted entries.
    pub hashes: Vec<Cid>,
}
impl Event for EntriesTrimmed {}

/// A fetch abandoned a branch because the block store did not answer in time.
#[derive(Clone, Debug)]
pub struct FetchTimedOut {
    /// The hash whose read timed out.
    pub hash: Cid,
}
impl Event for FetchTimedOut {}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Default broadcast channel capacity.
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

struct EventBusInner {
    channels: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

/// A type-safe event bus.
///
/// Clonable (`Arc` inside). Thread-safe. Non-blocking emits.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<EventBusInner>>,
}

impl EventBus {
    /// Create a new empty event bus.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(EventBusInner {
                channels: HashMap::new(),
            })),
        }
    }

    /// Emit an event to all current subscribers of type `E`.
    ///
    /// If nobody subscribed to `E` the event is dropped.
    pub fn emit<E: Event>(&self, event: E) {
        let inner = self.inner.lock().expect("event bus lock poisoned");

        let Some(sender) = inner
            .channels
            .get(&TypeId::of::<E>())
            .and_then(|boxed| boxed.downcast_ref::<broadcast::Sender<E>>())
        else {
            return;
        };

        // An error only means every receiver is gone.
        let _ = sender.send(event);
    }

    /// Subscribe to events of type `E`.
    pub fn subscribe<E: Event>(&self) -> EventReceiver<E> {
        let mut inner = self.inner.lock().expect("event bus lock poisoned");

        let sender = inner
            .channels
            .entry(TypeId::of::<E>())
            .or_insert_with(|| {
                let (tx, _) = broadcast::channel::<E>(DEFAULT_CHANNEL_CAPACITY);
                Box::new(tx)
            })
            .downcast_ref::<broadcast::Sender<E>>()
            .expect("type mismatch in event bus");

        EventReceiver {
            rx: sender.subscribe(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().expect("event bus lock poisoned");
        f.debug_struct("EventBus")
            .field("channel_count", &inner.channels.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// EventReceiver
// ---------------------------------------------------------------------------

/// Typed receiver for a specific event type.
pub struct EventReceiver<E: Event> {
    rx: broadcast::Receiver<E>,
}

impl<E: Event> EventReceiver<E> {
    /// Wait for the next event.
    ///
    /// Returns `None` once the bus has been dropped. Lagged events are
    /// skipped with a warning.
    pub async fn recv(&mut self) -> Option<E> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(
                        skipped = n,
                        event_type = std::any::type_name::<E>(),
                        "event receiver lagged"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Return an already-queued event without waiting.
    ///
    /// Emission is synchronous, so events fired by a finished `append` or
    /// `join` are visible here immediately.
    pub fn try_recv(&mut self) -> Option<E> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    warn!(
                        skipped = n,
                        event_type = std::any::type_name::<E>(),
                        "event receiver lagged"
                    );
                }
                Err(_) => return None,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
