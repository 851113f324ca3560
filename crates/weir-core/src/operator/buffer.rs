//! # Time-Bucketed Row Buffer
//!
//! Groups buffered rows by timestamp inside a keyed map cell.
//!
//! Bucket keys are the cell prefix followed by the timestamp in
//! sign-flipped big-endian form, so a lexicographic prefix scan walks
//! buckets in ascending time order across the full `i64` range.
//!
//! The backing store forbids structural mutation during a scan, so
//! [`remove_below`](TimeBucketedRowBuffer::remove_below) works in two
//! phases: collect the buckets while scanning, then issue the removals.
//! The borrow checker enforces the same split: the scan borrows the store
//! immutably.

use super::Row;
use crate::state::{decode_value, StateError, StateStore, StateStoreExt};

/// A per-key map cell of timestamp-ordered row buckets.
///
/// Holds no row data itself: every operation goes straight to the durable
/// store, so a restarted operator sees exactly the rows it had buffered.
pub struct TimeBucketedRowBuffer {
    /// Cell prefix separating this buffer from the key's other cells.
    prefix: Vec<u8>,
}

impl TimeBucketedRowBuffer {
    /// Creates a buffer persisting under the given cell prefix.
    #[must_use]
    pub fn new(prefix: &[u8]) -> Self {
        Self {
            prefix: prefix.to_vec(),
        }
    }

    /// Encodes a bucket key: prefix plus order-preserving timestamp bytes.
    ///
    /// XOR with the sign bit converts signed comparison to unsigned, then
    /// big-endian layout makes byte order equal numeric order.
    #[inline]
    #[allow(clippy::cast_sign_loss)]
    fn bucket_key(&self, timestamp: i64) -> Vec<u8> {
        let mut key = Vec::with_capacity(self.prefix.len() + 8);
        key.extend_from_slice(&self.prefix);
        key.extend_from_slice(&((timestamp as u64) ^ (1u64 << 63)).to_be_bytes());
        key
    }

    /// Decodes the timestamp out of a scanned bucket key.
    #[allow(clippy::cast_possible_wrap)]
    fn timestamp_of(&self, key: &[u8]) -> Option<i64> {
        let suffix = key.get(self.prefix.len()..)?;
        let bytes: [u8; 8] = suffix.try_into().ok()?;
        Some((u64::from_be_bytes(bytes) ^ (1u64 << 63)) as i64)
    }

    /// Appends a row to the bucket for `timestamp`, creating the bucket if
    /// absent.
    ///
    /// # Errors
    ///
    /// Returns `StateError` if the bucket cannot be read or written.
    pub fn append(
        &self,
        state: &mut dyn StateStore,
        timestamp: i64,
        row: Row,
    ) -> Result<(), StateError> {
        let key = self.bucket_key(timestamp);
        let mut rows: Vec<Row> = state.get_typed(&key)?.unwrap_or_default();
        rows.push(row);
        state.put_typed(&key, &rows)
    }

    /// The bucket for `timestamp`, if one exists.
    ///
    /// # Errors
    ///
    /// Returns `StateError` if the bucket cannot be read.
    pub fn get(
        &self,
        state: &dyn StateStore,
        timestamp: i64,
    ) -> Result<Option<Vec<Row>>, StateError> {
        state.get_typed(&self.bucket_key(timestamp))
    }

    /// Removes and returns the bucket for `timestamp`.
    ///
    /// # Errors
    ///
    /// Returns `StateError` if the bucket cannot be read or removed.
    pub fn take(
        &self,
        state: &mut dyn StateStore,
        timestamp: i64,
    ) -> Result<Option<Vec<Row>>, StateError> {
        let key = self.bucket_key(timestamp);
        let rows = state.get_typed(&key)?;
        if rows.is_some() {
            state.delete(&key)?;
        }
        Ok(rows)
    }

    /// Overwrites the bucket for `timestamp`, removing it when `rows` is
    /// empty.
    ///
    /// # Errors
    ///
    /// Returns `StateError` if the bucket cannot be written.
    pub fn replace(
        &self,
        state: &mut dyn StateStore,
        timestamp: i64,
        rows: Vec<Row>,
    ) -> Result<(), StateError> {
        let key = self.bucket_key(timestamp);
        if rows.is_empty() {
            state.delete(&key)
        } else {
            state.put_typed(&key, &rows)
        }
    }

    /// Removes and returns every bucket with timestamp strictly below
    /// `threshold`, in ascending timestamp order.
    ///
    /// Two-phase: the scan collects, the removals follow.
    ///
    /// # Errors
    ///
    /// Returns `StateError` if a bucket cannot be decoded or removed.
    pub fn remove_below(
        &self,
        state: &mut dyn StateStore,
        threshold: i64,
    ) -> Result<Vec<(i64, Vec<Row>)>, StateError> {
        let mut drained = Vec::new();
        for (key, value) in state.prefix_scan(&self.prefix) {
            let Some(timestamp) = self.timestamp_of(&key) else {
                continue;
            };
            if timestamp >= threshold {
                break;
            }
            drained.push((timestamp, decode_value::<Vec<Row>>(&value)?));
        }
        for (timestamp, _) in &drained {
            state.delete(&self.bucket_key(*timestamp))?;
        }
        Ok(drained)
    }

    /// Every bucket in ascending timestamp order.
    ///
    /// # Errors
    ///
    /// Returns `StateError` if a bucket cannot be decoded.
    pub fn entries(&self, state: &dyn StateStore) -> Result<Vec<(i64, Vec<Row>)>, StateError> {
        let mut entries = Vec::new();
        for (key, value) in state.prefix_scan(&self.prefix) {
            let Some(timestamp) = self.timestamp_of(&key) else {
                continue;
            };
            entries.push((timestamp, decode_value::<Vec<Row>>(&value)?));
        }
        Ok(entries)
    }
}
