//! # Time Module
//!
//! Watermark bookkeeping, timer scheduling, and deduplicated per-key timer
//! registration.
//!
//! ## Concepts
//!
//! - **Event Time**: the timestamp attached to a row
//! - **Processing Time**: the wall clock at the moment a row is processed
//! - **Watermark**: the last timestamp a key has finalized; rows at or
//!   before it are late
//! - **Timer**: a scheduled (key, timestamp) firing that finalizes a bucket
//!
//! ## Registration Flow
//!
//! Operators never talk to [`TimerService`] directly for their bucket
//! timers. They go through a [`TimerRegistrar`], which persists the single
//! currently-pending timestamp in a state cell and skips the registration
//! call when the requested timestamp is already pending. The service itself
//! additionally collapses identical (timestamp, key) registrations, so
//! interleaved registration patterns cannot produce a double firing.
//!
//! ```rust
//! use weir_core::state::InMemoryStore;
//! use weir_core::time::{TimerRegistrar, TimerService};
//!
//! let mut state = InMemoryStore::new();
//! let mut timers = TimerService::new();
//! let registrar = TimerRegistrar::new(b"tmr:");
//!
//! assert!(registrar.register_if_absent(&mut state, &mut timers, 100).unwrap());
//! // Same timestamp again: nothing to do.
//! assert!(!registrar.register_if_absent(&mut state, &mut timers, 100).unwrap());
//! assert_eq!(timers.pending_count(), 1);
//!
//! for fired in timers.poll_timers(100) {
//!     registrar.acknowledge(&mut state, fired.timestamp).unwrap();
//! }
//! assert_eq!(registrar.pending(&state).unwrap(), None);
//! ```

use crate::state::{StateError, StateStore, StateStoreExt};
use fxhash::FxHashMap;
use smallvec::SmallVec;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Timer key type for substrates that multiplex several keys through one
/// service instance.
///
/// Uses `SmallVec` so keys up to 16 bytes stay off the heap.
pub type TimerKey = SmallVec<[u8; 16]>;

/// Collection type for fired timers.
///
/// Sized for the common case where a poll releases a handful of timers.
pub type FiredTimersVec = SmallVec<[TimerRegistration; 8]>;

/// The last timestamp a key has finalized.
///
/// Unlike a classic in-flight watermark (a strict lower bound on future
/// input), this marker names a timestamp whose bucket has already been
/// emitted: a row at exactly the marker belongs to a finalized bucket and is
/// therefore late.
///
/// # Example
///
/// ```rust
/// use weir_core::time::Watermark;
///
/// let finalized = Watermark::new(1000);
/// assert!(finalized.is_late(999));
/// assert!(finalized.is_late(1000)); // the bucket at 1000 is already out
/// assert!(!finalized.is_late(1001));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Watermark(pub i64);

impl Watermark {
    /// Creates a marker at the given timestamp.
    #[inline]
    #[must_use]
    pub fn new(timestamp: i64) -> Self {
        Self(timestamp)
    }

    /// The finalized timestamp in milliseconds.
    #[inline]
    #[must_use]
    pub fn timestamp(&self) -> i64 {
        self.0
    }

    /// Checks whether a row timestamp falls at or before the finalized
    /// frontier.
    #[inline]
    #[must_use]
    pub fn is_late(&self, event_time: i64) -> bool {
        event_time <= self.0
    }
}

impl From<i64> for Watermark {
    fn from(timestamp: i64) -> Self {
        Self(timestamp)
    }
}

impl From<Watermark> for i64 {
    fn from(watermark: Watermark) -> Self {
        watermark.0
    }
}

/// A pending timer registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerRegistration {
    /// Unique timer ID
    pub id: u64,
    /// Scheduled timestamp in milliseconds
    pub timestamp: i64,
    /// Timer key, for substrates multiplexing several keys
    pub key: Option<TimerKey>,
}

impl Ord for TimerRegistration {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for min-heap behavior (earliest first)
        other.timestamp.cmp(&self.timestamp)
    }
}

impl PartialOrd for TimerRegistration {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Timer facility fulfilling the substrate's scheduling contract.
///
/// Maintains a priority queue of registrations ordered by timestamp, and
/// collapses identical (timestamp, key) registrations: registering the same
/// pair twice before it fires yields one eventual firing. Polling releases
/// every registration at or before the given time, earliest first.
///
/// # Example
///
/// ```rust
/// use weir_core::time::TimerService;
///
/// let mut service = TimerService::new();
/// let id1 = service.register_timer(100, None);
/// let id2 = service.register_timer(100, None);
/// assert_eq!(id1, id2); // collapsed
///
/// let fired = service.poll_timers(150);
/// assert_eq!(fired.len(), 1);
/// ```
pub struct TimerService {
    timers: BinaryHeap<TimerRegistration>,
    /// Pending (timestamp, key) pairs mapped to their timer ID.
    pending: FxHashMap<(i64, Option<TimerKey>), u64>,
    next_timer_id: u64,
}

impl TimerService {
    /// Creates a new timer service.
    #[must_use]
    pub fn new() -> Self {
        Self {
            timers: BinaryHeap::new(),
            pending: FxHashMap::default(),
            next_timer_id: 0,
        }
    }

    /// Registers a timer, returning its ID.
    ///
    /// If an identical (timestamp, key) registration is already pending,
    /// no new timer is created and the existing ID is returned.
    pub fn register_timer(&mut self, timestamp: i64, key: Option<TimerKey>) -> u64 {
        if let Some(&id) = self.pending.get(&(timestamp, key.clone())) {
            return id;
        }

        let id = self.next_timer_id;
        self.next_timer_id += 1;

        self.pending.insert((timestamp, key.clone()), id);
        self.timers
            .push(TimerRegistration { id, timestamp, key });

        id
    }

    /// Releases all timers with timestamps at or before `current_time`,
    /// earliest first.
    ///
    /// # Panics
    ///
    /// Does not panic in practice: the internal `expect` runs only after a
    /// successful peek confirms the heap is non-empty.
    #[inline]
    pub fn poll_timers(&mut self, current_time: i64) -> FiredTimersVec {
        let mut fired = FiredTimersVec::new();

        while let Some(timer) = self.timers.peek() {
            if timer.timestamp > current_time {
                break;
            }
            let timer = self.timers.pop().expect("peeked entry must pop");
            self.pending.remove(&(timer.timestamp, timer.key.clone()));
            fired.push(timer);
        }

        fired
    }

    /// Cancels a timer by ID.
    ///
    /// Returns `true` if the timer was pending and got cancelled.
    pub fn cancel_timer(&mut self, id: u64) -> bool {
        let count_before = self.timers.len();
        self.timers.retain(|t| t.id != id);
        self.pending.retain(|_, &mut pending_id| pending_id != id);
        self.timers.len() < count_before
    }

    /// Number of pending timers.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.timers.len()
    }

    /// Timestamp of the next timer to fire, if any.
    #[must_use]
    pub fn next_timer_timestamp(&self) -> Option<i64> {
        self.timers.peek().map(|t| t.timestamp)
    }

    /// Clears all pending timers.
    pub fn clear(&mut self) {
        self.timers.clear();
        self.pending.clear();
    }
}

impl Default for TimerService {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-key registration driver with a persisted pending-timestamp cell.
///
/// State machine per key: `Idle → Registered → Fired → Idle`. The cell holds
/// the single timestamp currently registered and not yet fired;
/// [`register_if_absent`](TimerRegistrar::register_if_absent) transitions
/// `Idle → Registered` only when the requested timestamp differs from the
/// pending one, and [`acknowledge`](TimerRegistrar::acknowledge) completes
/// `Registered → Fired → Idle`. Because the cell is persisted, a restart
/// does not forget what was already registered.
///
/// The registrar chooses *which* timestamp to register: the event
/// timestamp itself for event-time operators, `now + 1` for the
/// processing-time operator. Collapsing exact duplicates is
/// [`TimerService`]'s job.
pub struct TimerRegistrar {
    /// State key of the pending-timestamp value cell.
    cell_key: Vec<u8>,
}

impl TimerRegistrar {
    /// Creates a registrar persisting under the given state cell key.
    #[must_use]
    pub fn new(cell_key: &[u8]) -> Self {
        Self {
            cell_key: cell_key.to_vec(),
        }
    }

    /// Registers `timestamp` unless it is already the pending one.
    ///
    /// Returns `true` if a registration call was issued.
    ///
    /// # Errors
    ///
    /// Returns `StateError` if the pending cell cannot be read or written.
    pub fn register_if_absent(
        &self,
        state: &mut dyn StateStore,
        timers: &mut TimerService,
        timestamp: i64,
    ) -> Result<bool, StateError> {
        if state.get_typed::<i64>(&self.cell_key)? == Some(timestamp) {
            return Ok(false);
        }
        timers.register_timer(timestamp, None);
        state.put_typed(&self.cell_key, &timestamp)?;
        Ok(true)
    }

    /// Completes the `Registered → Fired → Idle` transition for a firing.
    ///
    /// Clears the pending cell when it matches the fired timestamp; a
    /// mismatch means a newer registration superseded this one and the cell
    /// is left alone.
    ///
    /// # Errors
    ///
    /// Returns `StateError` if the pending cell cannot be read or cleared.
    pub fn acknowledge(&self, state: &mut dyn StateStore, fired: i64) -> Result<(), StateError> {
        if state.get_typed::<i64>(&self.cell_key)? == Some(fired) {
            state.delete(&self.cell_key)?;
        }
        Ok(())
    }

    /// The currently pending timestamp, if any.
    ///
    /// # Errors
    ///
    /// Returns `StateError` if the pending cell cannot be read.
    pub fn pending(&self, state: &dyn StateStore) -> Result<Option<i64>, StateError> {
        state.get_typed::<i64>(&self.cell_key)
    }
}
