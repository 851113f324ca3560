//! # Keyed State Module
//!
//! Durable per-key storage for the streaming operators.
//!
//! The execution substrate owns persistence: it scopes one [`StateStore`] to
//! each (operator instance, key) pair, checkpoints it, and restores it on
//! recovery. The operators consume the store through this narrow contract
//! and never see the substrate's I/O.
//!
//! ## Cell Shapes
//!
//! Operators express three cell shapes over the byte-keyed store:
//!
//! - *Value cell*: one typed value under a fixed key (a counter, the
//!   last-fired timestamp)
//! - *List cell*: an ordered row sequence under a fixed key, rewritten in
//!   one operation (carried-over candidate rows)
//! - *Map cell*: timestamp-keyed entries under an order-preserving encoded
//!   prefix, iterated via [`StateStore::prefix_scan`] (time-bucketed row
//!   buffers, retraction sets)
//!
//! A missing key is never an error: it is the lazy-initialization path, and
//! each caller materializes its documented default (zero, empty, fresh).
//!
//! ## Example
//!
//! ```rust
//! use weir_core::state::{InMemoryStore, StateStore, StateStoreExt};
//!
//! let mut store = InMemoryStore::new();
//!
//! store.put(b"marker", b"t1").unwrap();
//! assert_eq!(store.get(b"marker").unwrap().as_ref(), b"t1");
//!
//! // Typed access serializes with rkyv.
//! store.put_typed(b"count", &42u64).unwrap();
//! let count: u64 = store.get_typed(b"count").unwrap().unwrap();
//! assert_eq!(count, 42);
//!
//! // Snapshots capture the full key space for replay testing.
//! let snapshot = store.snapshot();
//! store.delete(b"marker").unwrap();
//! store.restore(snapshot);
//! assert!(store.contains(b"marker"));
//! ```

use bytes::Bytes;
use rkyv::{
    api::high::{HighDeserializer, HighSerializer, HighValidator},
    bytecheck::CheckBytes,
    rancor::Error as RkyvError,
    ser::allocator::ArenaHandle,
    util::AlignedVec,
    Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize,
};
use std::collections::BTreeMap;
use std::ops::Bound;

/// Compute the lexicographic successor of a byte prefix.
///
/// Returns `None` if no successor exists (empty prefix or all bytes 0xFF).
/// Used to bound prefix scans on the sorted key space.
fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    if prefix.is_empty() {
        return None;
    }
    let mut successor = prefix.to_vec();
    while let Some(last) = successor.last_mut() {
        if *last < 0xFF {
            *last += 1;
            return Some(successor);
        }
        successor.pop();
    }
    None
}

/// Contract for the per-key durable store the substrate provides.
///
/// One instance is scoped to one (operator instance, key) pair and is only
/// ever touched by that key's serialized thread of control, so implementations
/// need no internal synchronization. Stores are `Send` but not `Sync`.
///
/// # Iteration Rules
///
/// [`prefix_scan`](StateStore::prefix_scan) borrows the store for the length
/// of the iteration; structural mutation during a scan is impossible.
/// Callers that remove entries discovered by a scan collect the keys first
/// and issue the removals after the scan ends (two-phase removal).
pub trait StateStore: Send {
    /// Get a value by key.
    ///
    /// Returns `None` if the key does not exist. A missing key is the
    /// documented lazy-initialization path, not an error.
    fn get(&self, key: &[u8]) -> Option<Bytes>;

    /// Store a key-value pair, overwriting any existing value.
    ///
    /// # Errors
    ///
    /// Returns `StateError` if the backing store rejects the write. The
    /// operators treat this as fatal for the current invocation.
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), StateError>;

    /// Delete a key. Deleting a missing key is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `StateError` if the backing store rejects the removal.
    fn delete(&mut self, key: &[u8]) -> Result<(), StateError>;

    /// Scan all entries whose key starts with `prefix`, in lexicographic
    /// key order.
    fn prefix_scan<'a>(&'a self, prefix: &'a [u8])
        -> Box<dyn Iterator<Item = (Bytes, Bytes)> + 'a>;

    /// Check whether a key exists without fetching its value.
    fn contains(&self, key: &[u8]) -> bool {
        self.get(key).is_some()
    }

    /// Number of entries in the store.
    fn len(&self) -> usize;

    /// Check whether the store is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Capture the complete key space at this point in time.
    ///
    /// Replay tests snapshot before a firing, restore, and fire again to
    /// prove the firing is idempotent under recovery.
    fn snapshot(&self) -> StateSnapshot;

    /// Replace the current contents with a snapshot's contents.
    fn restore(&mut self, snapshot: StateSnapshot);

    /// Remove all entries.
    fn clear(&mut self);
}

/// Extension trait for [`StateStore`] providing typed access.
///
/// These methods are generic and cannot live on the dyn-compatible
/// [`StateStore`] trait. Values are serialized with rkyv; types must derive
/// `Archive`, `rkyv::Serialize`, and `rkyv::Deserialize`.
pub trait StateStoreExt: StateStore {
    /// Get a value and deserialize it.
    ///
    /// # Errors
    ///
    /// Returns `StateError::Serialization` if the stored bytes do not
    /// decode as `T`.
    fn get_typed<T>(&self, key: &[u8]) -> Result<Option<T>, StateError>
    where
        T: Archive,
        T::Archived: for<'a> CheckBytes<HighValidator<'a, RkyvError>>
            + RkyvDeserialize<T, HighDeserializer<RkyvError>>,
    {
        match self.get(key) {
            Some(bytes) => decode_value(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Serialize and store a value.
    ///
    /// # Errors
    ///
    /// Returns `StateError::Serialization` if serialization fails, or the
    /// underlying write error.
    fn put_typed<T>(&mut self, key: &[u8], value: &T) -> Result<(), StateError>
    where
        T: for<'a> RkyvSerialize<HighSerializer<AlignedVec, ArenaHandle<'a>, RkyvError>>,
    {
        let bytes = rkyv::to_bytes::<RkyvError>(value)
            .map_err(|e| StateError::Serialization(e.to_string()))?;
        self.put(key, &bytes)
    }
}

// Blanket implementation for all StateStore types.
impl<T: StateStore + ?Sized> StateStoreExt for T {}

/// Deserialize a stored value from raw bytes.
///
/// Scans yield `(key, value)` byte pairs; this decodes a value the same way
/// [`StateStoreExt::get_typed`] does.
///
/// # Errors
///
/// Returns `StateError::Serialization` if the bytes do not decode as `T`.
pub fn decode_value<T>(bytes: &[u8]) -> Result<T, StateError>
where
    T: Archive,
    T::Archived: for<'a> CheckBytes<HighValidator<'a, RkyvError>>
        + RkyvDeserialize<T, HighDeserializer<RkyvError>>,
{
    let archived = rkyv::access::<T::Archived, RkyvError>(bytes)
        .map_err(|e| StateError::Serialization(e.to_string()))?;
    rkyv::deserialize::<T, RkyvError>(archived)
        .map_err(|e| StateError::Serialization(e.to_string()))
}

/// A point-in-time copy of a store's contents.
///
/// Serializable so a test harness (or the substrate) can hold it across a
/// firing and roll the store back.
#[derive(Debug, Clone, Archive, RkyvSerialize, RkyvDeserialize)]
pub struct StateSnapshot {
    /// Captured key-value pairs
    data: Vec<(Vec<u8>, Vec<u8>)>,
}

impl StateSnapshot {
    /// Create a snapshot from key-value pairs.
    #[must_use]
    pub fn new(data: Vec<(Vec<u8>, Vec<u8>)>) -> Self {
        Self { data }
    }

    /// The captured key-value pairs.
    #[must_use]
    pub fn data(&self) -> &[(Vec<u8>, Vec<u8>)] {
        &self.data
    }

    /// Number of captured entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check whether the snapshot captured nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Serialize the snapshot.
    ///
    /// # Errors
    ///
    /// Returns `StateError::Serialization` if serialization fails.
    pub fn to_bytes(&self) -> Result<AlignedVec, StateError> {
        rkyv::to_bytes::<RkyvError>(self).map_err(|e| StateError::Serialization(e.to_string()))
    }

    /// Deserialize a snapshot.
    ///
    /// # Errors
    ///
    /// Returns `StateError::Serialization` if the bytes are not a snapshot.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StateError> {
        decode_value(bytes)
    }
}

/// In-memory store over a `BTreeMap`.
///
/// The reference implementation of the substrate's store contract, and the
/// harness the operator tests run against. `BTreeMap` keeps keys sorted, so
/// prefix scans walk timestamp-encoded map cells in time order.
pub struct InMemoryStore {
    /// The underlying sorted map
    data: BTreeMap<Vec<u8>, Bytes>,
}

impl InMemoryStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: BTreeMap::new(),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore for InMemoryStore {
    #[inline]
    fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.data.get(key).cloned()
    }

    #[inline]
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), StateError> {
        self.data
            .insert(key.to_vec(), Bytes::copy_from_slice(value));
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), StateError> {
        self.data.remove(key);
        Ok(())
    }

    fn prefix_scan<'a>(
        &'a self,
        prefix: &'a [u8],
    ) -> Box<dyn Iterator<Item = (Bytes, Bytes)> + 'a> {
        if prefix.is_empty() {
            return Box::new(
                self.data
                    .iter()
                    .map(|(k, v)| (Bytes::copy_from_slice(k), v.clone())),
            );
        }
        if let Some(end) = prefix_successor(prefix) {
            Box::new(
                self.data
                    .range::<[u8], _>((Bound::Included(prefix), Bound::Excluded(end.as_slice())))
                    .map(|(k, v)| (Bytes::copy_from_slice(k), v.clone())),
            )
        } else {
            // All-0xFF prefix: scan from prefix to the end of the key space
            Box::new(
                self.data
                    .range::<[u8], _>((Bound::Included(prefix), Bound::Unbounded))
                    .map(|(k, v)| (Bytes::copy_from_slice(k), v.clone())),
            )
        }
    }

    #[inline]
    fn contains(&self, key: &[u8]) -> bool {
        self.data.contains_key(key)
    }

    fn len(&self) -> usize {
        self.data.len()
    }

    fn snapshot(&self) -> StateSnapshot {
        let data = self
            .data
            .iter()
            .map(|(k, v)| (k.clone(), v.to_vec()))
            .collect();
        StateSnapshot::new(data)
    }

    fn restore(&mut self, snapshot: StateSnapshot) {
        self.data.clear();
        for (key, value) in snapshot.data {
            self.data.insert(key, Bytes::from(value));
        }
    }

    fn clear(&mut self) {
        self.data.clear();
    }
}

/// Errors that can occur in state operations.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// I/O error from the backing store
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Value failed to serialize or deserialize
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The backing store rejected the operation
    #[error("Backend error: {0}")]
    Backend(String),
}
