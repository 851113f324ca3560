//! # Retracting Event-Time Sort Operator
//!
//! Event-time sort whose output is a revisable top slice: when a later
//! firing produces rows that qualify for the `OFFSET/FETCH` window, rows
//! emitted earlier are pushed out and explicitly retracted, so downstream
//! always holds at most `fetch` rows.
//!
//! Per firing, the candidate sequence is the sorted current bucket followed
//! by the rows carried over from the previous firing whose index fell below
//! `offset` then. Candidates below `offset` are carried again; candidates
//! inside the window are emitted, displacing the oldest previously emitted
//! row once the window is full; candidates past the window are dropped for
//! this firing.
//!
//! The emitted history is persisted in a map cell under the key's
//! last-fired timestamp and moves forward with the frontier, so a restart
//! resumes with exactly the rows downstream currently holds. An unbounded
//! fetch never retracts, so no history is kept for it.

use super::buffer::TimeBucketedRowBuffer;
use super::event_sort::SortLimitConfig;
use super::limit::LimitSpec;
use super::ordering::RowComparator;
use super::{ChangeRow, ChangeVec, Operator, OperatorContext, OperatorError, Row};
use crate::state::StateStoreExt;
use crate::time::{TimerRegistrar, Watermark};

/// Buffered-row cell prefix.
const BUFFER_PREFIX: &[u8; 4] = b"buf:";
/// Emitted-history map cell prefix, keyed by last-fired timestamp.
const EMITTED_PREFIX: &[u8; 4] = b"ret:";
/// Carried-over (below-offset) rows cell key.
const CARRIED_KEY: &[u8; 4] = b"pre:";
/// Last finalized timestamp cell key.
const LAST_FIRED_KEY: &[u8; 4] = b"lft:";
/// Pending-timer cell key.
const TIMER_KEY: &[u8; 4] = b"tmr:";

/// Retracting event-time sort operator.
pub struct RetractSortOperator {
    limit: LimitSpec,
    comparator: Box<dyn RowComparator>,
    buffer: TimeBucketedRowBuffer,
    /// Emitted-history cell; reuses the bucketed layout for its
    /// timestamp-keyed point get/put/remove.
    emitted: TimeBucketedRowBuffer,
    registrar: TimerRegistrar,
    /// Rows dropped for arriving at or before the finalized frontier.
    late_rows_dropped: u64,
}

impl RetractSortOperator {
    /// Creates the operator from its configuration.
    ///
    /// # Errors
    ///
    /// Returns `OperatorError::InvalidConfig` if no comparator is supplied:
    /// a revisable sort is meaningless without an order.
    pub fn try_new(config: SortLimitConfig) -> Result<Self, OperatorError> {
        let comparator = config.comparator.ok_or_else(|| {
            OperatorError::InvalidConfig(
                "retracting sort requires a row comparator".to_string(),
            )
        })?;
        Ok(Self {
            limit: LimitSpec::new(config.offset, config.fetch),
            comparator,
            buffer: TimeBucketedRowBuffer::new(BUFFER_PREFIX),
            emitted: TimeBucketedRowBuffer::new(EMITTED_PREFIX),
            registrar: TimerRegistrar::new(TIMER_KEY),
            late_rows_dropped: 0,
        })
    }

    /// Number of late rows dropped since this instance was created.
    #[must_use]
    pub fn late_rows_dropped(&self) -> u64 {
        self.late_rows_dropped
    }
}

impl Operator for RetractSortOperator {
    fn process_record(
        &mut self,
        row: Row,
        time: i64,
        ctx: &mut OperatorContext,
    ) -> Result<ChangeVec, OperatorError> {
        if let Some(marker) = ctx.state.get_typed::<i64>(LAST_FIRED_KEY)? {
            if Watermark::new(marker).is_late(time) {
                self.late_rows_dropped += 1;
                tracing::debug!(timestamp = time, frontier = marker, "dropping late row");
                return Ok(ChangeVec::new());
            }
        }

        self.buffer.append(ctx.state, time, row)?;
        self.registrar
            .register_if_absent(ctx.state, ctx.timers, time)?;
        Ok(ChangeVec::new())
    }

    fn on_timer(
        &mut self,
        fired_timestamp: i64,
        ctx: &mut OperatorContext,
    ) -> Result<ChangeVec, OperatorError> {
        let previous = ctx.state.get_typed::<i64>(LAST_FIRED_KEY)?;
        if let Some(marker) = previous {
            // A duplicate firing for an already-finalized bucket is a no-op.
            if Watermark::new(marker).is_late(fired_timestamp) {
                return Ok(ChangeVec::new());
            }
        }

        let mut bucket = self
            .buffer
            .take(ctx.state, fired_timestamp)?
            .unwrap_or_default();
        bucket.sort_by(|a, b| self.comparator.compare(a, b));

        let carried: Vec<Row> = ctx.state.get_typed(CARRIED_KEY)?.unwrap_or_default();
        let mut retained: Vec<Row> = match previous {
            Some(timestamp) => self.emitted.get(ctx.state, timestamp)?.unwrap_or_default(),
            None => Vec::new(),
        };

        let window_cap = self.limit.fetch().bound();
        let mut held = Vec::new();
        let mut changes = ChangeVec::new();

        for (i, row) in bucket.into_iter().chain(carried).enumerate() {
            let index = i as u64;
            if index < self.limit.offset() {
                held.push(row);
                continue;
            }
            if !self.limit.emits_at(index) {
                // Past the window this firing
                continue;
            }
            if let Some(cap) = window_cap {
                if retained.len() as u64 >= cap {
                    let oldest = retained.remove(0);
                    changes.push(ChangeRow::retract(oldest));
                }
            }
            changes.push(ChangeRow::insert(row.clone()));
            if window_cap.is_some() {
                retained.push(row);
            }
        }

        if held.is_empty() {
            ctx.state.delete(CARRIED_KEY)?;
        } else {
            ctx.state.put_typed(CARRIED_KEY, &held)?;
        }

        self.emitted.replace(ctx.state, fired_timestamp, retained)?;
        if let Some(timestamp) = previous {
            if timestamp != fired_timestamp {
                self.emitted.replace(ctx.state, timestamp, Vec::new())?;
            }
        }

        ctx.state.put_typed(LAST_FIRED_KEY, &fired_timestamp)?;
        self.registrar.acknowledge(ctx.state, fired_timestamp)?;
        Ok(changes)
    }
}
