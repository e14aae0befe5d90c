//! Hybrid logical clock.

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::Timestamp;

type WallSource = Box<dyn Fn() -> u64 + Send + Sync>;

/// Hybrid logical clock producing strictly increasing [`Timestamp`]s.
///
/// `now()` emits a timestamp greater than every timestamp previously emitted
/// or merged through [`update`](Self::update). All methods take `&self`; the
/// state lives behind a mutex so one clock can be shared by a log and its
/// fetch tasks.
pub struct HybridClock {
    last: Mutex<Timestamp>,
    wall: WallSource,
}

impl HybridClock {
    /// Clock reading the system wall time in nanoseconds.
    pub fn new() -> Self {
        Self::with_source(system_nanos)
    }

    /// Clock reading wall time from `source` (used by tests to freeze time).
    pub fn with_source(source: impl Fn() -> u64 + Send + Sync + 'static) -> Self {
        Self {
            last: Mutex::new(Timestamp::ZERO),
            wall: Box::new(source),
        }
    }

    /// Emit the next timestamp.
    ///
    /// Wall time advances to `max(local wall clock, last wall time)`. When
    /// that equals the previous wall time the logical counter increments,
    /// otherwise it resets to zero. [`Timestamp::MAX`] is never emitted;
    /// `None` is returned once the clock can no longer advance below it.
    pub fn now(&self) -> Option<Timestamp> {
        let local = (self.wall)();
        let mut last = self.last.lock().expect("clock lock poisoned");

        let next = if local > last.wall_time {
            Timestamp::new(local, 0)
        } else if let Some(logical) = last.logical.checked_add(1) {
            Timestamp::new(last.wall_time, logical)
        } else {
            // Counter exhausted: borrow one nanosecond from the future.
            Timestamp::new(last.wall_time.checked_add(1)?, 0)
        };
        if next == Timestamp::MAX {
            return None;
        }

        *last = next;
        Some(next)
    }

    /// Merge an externally observed timestamp without emitting.
    pub fn update(&self, observed: Timestamp) {
        let mut last = self.last.lock().expect("clock lock poisoned");

        if observed > *last {
            *last = observed;
        }
    }

    /// The most recent timestamp emitted or merged.
    pub fn last(&self) -> Timestamp {
        *self.last.lock().expect("clock lock poisoned")
    }
}

impl Default for HybridClock {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HybridClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HybridClock")
            .field("last", &self.last())
            .finish()
    }
}

fn system_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;

    fn frozen(at: u64) -> (HybridClock, Arc<AtomicU64>) {
        let wall = Arc::new(AtomicU64::new(at));
        let source = wall.clone();
        let clock = HybridClock::with_source(move || source.load(Ordering::SeqCst));
        (clock, wall)
    }

    #[test]
    fn test_now_is_strictly_increasing() {
        let clock = HybridClock::new();
        let mut prev = clock.now().unwrap();
        for _ in 0..1000 {
            let next = clock.now().unwrap();
            assert!(next > prev);
            prev = next;
        }
    }

    #[test]
    fn test_same_wall_time_increments_logical() {
        let (clock, _) = frozen(100);
        assert_eq!(clock.now(), Some(Timestamp::new(100, 0)));
        assert_eq!(clock.now(), Some(Timestamp::new(100, 1)));
        assert_eq!(clock.now(), Some(Timestamp::new(100, 2)));
    }

    #[test]
    fn test_advancing_wall_resets_logical() {
        let (clock, wall) = frozen(100);
        clock.now();
        clock.now();
        wall.store(200, Ordering::SeqCst);
        assert_eq!(clock.now(), Some(Timestamp::new(200, 0)));
    }

    #[test]
    fn test_update_from_future_dominates_local_wall() {
        let (clock, _) = frozen(100);
        clock.update(Timestamp::new(500, 7));
        assert_eq!(clock.now(), Some(Timestamp::new(500, 8)));
    }

    #[test]
    fn test_update_from_past_is_ignored() {
        let (clock, _) = frozen(100);
        let first = clock.now().unwrap();
        clock.update(Timestamp::new(1, 0));
        assert!(clock.now().unwrap() > first);
        assert_eq!(clock.last(), Timestamp::new(100, 1));
    }

    #[test]
    fn test_logical_overflow_carries_into_wall_time() {
        let (clock, _) = frozen(100);
        clock.update(Timestamp::new(100, u32::MAX));
        assert_eq!(clock.now(), Some(Timestamp::new(101, 0)));
    }

    #[test]
    fn test_exhausted_clock_refuses_to_emit() {
        let (clock, _) = frozen(100);
        clock.update(Timestamp::MAX);
        assert_eq!(clock.now(), None);
        assert_eq!(clock.now(), None);
        assert_eq!(clock.last(), Timestamp::MAX);
    }

    #[test]
    fn test_max_is_never_emitted() {
        let (clock, _) = frozen(100);
        let almost = Timestamp::new(u64::MAX, u32::MAX - 1);
        clock.update(almost);
        assert_eq!(clock.now(), None);
        assert_eq!(clock.last(), almost);
    }
}
