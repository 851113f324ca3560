//! # Event-Time Sort Operator
//!
//! Buffers rows by event timestamp and, when the timer for a timestamp
//! fires under the advancing watermark, emits that bucket's `OFFSET/FETCH`
//! slice in comparator order. Without a comparator the bucket keeps arrival
//! order (an identity sort within the timestamp).
//!
//! Output is append-only: each bucket is finalized exactly once, so nothing
//! emitted here is ever revised. Rows at or before the last finalized
//! timestamp are late; they are dropped, counted, and traced.

use super::buffer::TimeBucketedRowBuffer;
use super::limit::{Fetch, LimitSpec};
use super::ordering::RowComparator;
use super::{ChangeRow, ChangeVec, Operator, OperatorContext, OperatorError, Row};
use crate::state::StateStoreExt;
use crate::time::{TimerRegistrar, Watermark};
use arrow_schema::SchemaRef;

/// Buffered-row cell prefix.
const BUFFER_PREFIX: &[u8; 4] = b"buf:";
/// Last finalized timestamp cell key.
const LAST_FIRED_KEY: &[u8; 4] = b"lft:";
/// Pending-timer cell key.
const TIMER_KEY: &[u8; 4] = b"tmr:";

/// Configuration shared by the event-time sort operators.
pub struct SortLimitConfig {
    /// Schema of the input rows
    pub input_schema: SchemaRef,
    /// Number of leading rows to skip per candidate sequence
    pub offset: u64,
    /// Maximum number of rows to pass
    pub fetch: Fetch,
    /// Secondary order within a timestamp bucket; `None` keeps arrival
    /// order. The retracting operator requires a comparator.
    pub comparator: Option<Box<dyn RowComparator>>,
}

/// Non-retracting event-time sort operator.
pub struct EventTimeSortOperator {
    limit: LimitSpec,
    comparator: Option<Box<dyn RowComparator>>,
    buffer: TimeBucketedRowBuffer,
    registrar: TimerRegistrar,
    /// Rows dropped for arriving at or before the finalized frontier.
    late_rows_dropped: u64,
}

impl EventTimeSortOperator {
    /// Creates the operator from its configuration.
    ///
    /// # Errors
    ///
    /// Currently infallible; returns `Result` for parity with the other
    /// operator constructors.
    pub fn try_new(config: SortLimitConfig) -> Result<Self, OperatorError> {
        Ok(Self {
            limit: LimitSpec::new(config.offset, config.fetch),
            comparator: config.comparator,
            buffer: TimeBucketedRowBuffer::new(BUFFER_PREFIX),
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

impl Operator for EventTimeSortOperator {
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
        // A duplicate firing for an already-finalized bucket is a no-op.
        if let Some(marker) = ctx.state.get_typed::<i64>(LAST_FIRED_KEY)? {
            if Watermark::new(marker).is_late(fired_timestamp) {
                return Ok(ChangeVec::new());
            }
        }

        let mut changes = ChangeVec::new();
        if let Some(mut rows) = self.buffer.take(ctx.state, fired_timestamp)? {
            if let Some(comparator) = &self.comparator {
                rows.sort_by(|a, b| comparator.compare(a, b));
            }
            for row in self.limit.slice_bucket(rows) {
                changes.push(ChangeRow::insert(row));
            }
        }

        ctx.state.put_typed(LAST_FIRED_KEY, &fired_timestamp)?;
        self.registrar.acknowledge(ctx.state, fired_timestamp)?;
        Ok(changes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::ordering::{ColumnComparator, SortColumn};
    use crate::operator::Datum;
    use crate::state::{InMemoryStore, StateStore};
    use crate::time::TimerService;
    use arrow_schema::{DataType, Field, Schema};
    use std::sync::Arc;

    fn schema() -> SchemaRef {
        Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]))
    }

    fn make_operator(offset: u64, fetch: Fetch, sorted: bool) -> EventTimeSortOperator {
        let comparator: Option<Box<dyn RowComparator>> = if sorted {
            Some(Box::new(
                ColumnComparator::try_new(&schema(), vec![SortColumn::ascending("v")]).unwrap(),
            ))
        } else {
            None
        };
        EventTimeSortOperator::try_new(SortLimitConfig {
            input_schema: schema(),
            offset,
            fetch,
            comparator,
        })
        .unwrap()
    }

    fn row(v: i64) -> Row {
        Row::new(vec![Datum::Int64(v)])
    }

    fn inserts(values: &[i64]) -> Vec<ChangeRow> {
        values.iter().map(|v| ChangeRow::insert(row(*v))).collect()
    }

    fn feed(
        op: &mut EventTimeSortOperator,
        state: &mut InMemoryStore,
        timers: &mut TimerService,
        time: i64,
        values: &[i64],
    ) {
        let mut ctx = OperatorContext { state, timers };
        for v in values {
            let out = op.process_record(row(*v), time, &mut ctx).unwrap();
            assert!(out.is_empty(), "sort paths buffer, they never emit here");
        }
    }

    fn fire(
        op: &mut EventTimeSortOperator,
        state: &mut InMemoryStore,
        timers: &mut TimerService,
        watermark: i64,
    ) -> Vec<ChangeRow> {
        let mut ctx = OperatorContext { state, timers };
        let mut emitted = Vec::new();
        for fired in ctx.timers.poll_timers(watermark) {
            emitted.extend(op.on_timer(fired.timestamp, &mut ctx).unwrap());
        }
        emitted
    }

    // ==================== Emission ====================

    #[test]
    fn test_emits_sorted_slice_after_firing() {
        let mut op = make_operator(1, Fetch::Bounded(2), true);
        let mut state = InMemoryStore::new();
        let mut timers = TimerService::new();

        feed(&mut op, &mut state, &mut timers, 100, &[40, 10, 30, 20]);
        let emitted = fire(&mut op, &mut state, &mut timers, 100);

        assert_eq!(emitted, inserts(&[20, 30]));
    }

    #[test]
    fn test_emission_count_matches_offset_fetch() {
        // min(fetch, max(0, N - offset)) rows, for several shapes
        for (n, offset, fetch, expected) in [
            (5u64, 0u64, Fetch::Bounded(3), 3usize),
            (5, 4, Fetch::Bounded(3), 1),
            (5, 7, Fetch::Bounded(3), 0),
            (5, 2, Fetch::Unbounded, 3),
            (5, 0, Fetch::Bounded(0), 0),
        ] {
            let mut op = make_operator(offset, fetch, true);
            let mut state = InMemoryStore::new();
            let mut timers = TimerService::new();

            #[allow(clippy::cast_possible_wrap)]
            let values: Vec<i64> = (0..n as i64).rev().collect();
            feed(&mut op, &mut state, &mut timers, 100, &values);
            let emitted = fire(&mut op, &mut state, &mut timers, 100);

            assert_eq!(emitted.len(), expected, "n={n} offset={offset} {fetch:?}");
        }
    }

    #[test]
    fn test_identity_sort_keeps_arrival_order() {
        let mut op = make_operator(0, Fetch::Unbounded, false);
        let mut state = InMemoryStore::new();
        let mut timers = TimerService::new();

        feed(&mut op, &mut state, &mut timers, 100, &[3, 1, 2]);
        let emitted = fire(&mut op, &mut state, &mut timers, 100);

        assert_eq!(emitted, inserts(&[3, 1, 2]));
    }

    #[test]
    fn test_each_bucket_gets_its_own_window() {
        let mut op = make_operator(0, Fetch::Bounded(1), true);
        let mut state = InMemoryStore::new();
        let mut timers = TimerService::new();

        feed(&mut op, &mut state, &mut timers, 100, &[5, 3]);
        feed(&mut op, &mut state, &mut timers, 200, &[9, 7]);

        let emitted = fire(&mut op, &mut state, &mut timers, 200);
        assert_eq!(emitted, inserts(&[3, 7]));
    }

    // ==================== Late Data ====================

    #[test]
    fn test_late_rows_dropped_and_counted() {
        let mut op = make_operator(0, Fetch::Unbounded, true);
        let mut state = InMemoryStore::new();
        let mut timers = TimerService::new();

        feed(&mut op, &mut state, &mut timers, 100, &[1]);
        fire(&mut op, &mut state, &mut timers, 100);

        // At the frontier and before it: late
        feed(&mut op, &mut state, &mut timers, 100, &[2]);
        feed(&mut op, &mut state, &mut timers, 99, &[3]);
        assert_eq!(op.late_rows_dropped(), 2);

        // Strictly after the frontier: accepted
        feed(&mut op, &mut state, &mut timers, 101, &[4]);
        let emitted = fire(&mut op, &mut state, &mut timers, 101);
        assert_eq!(emitted, inserts(&[4]));
        assert_eq!(op.late_rows_dropped(), 2);
    }

    #[test]
    fn test_duplicate_firing_is_noop() {
        let mut op = make_operator(0, Fetch::Unbounded, true);
        let mut state = InMemoryStore::new();
        let mut timers = TimerService::new();

        feed(&mut op, &mut state, &mut timers, 100, &[1]);
        let first = fire(&mut op, &mut state, &mut timers, 100);
        assert_eq!(first.len(), 1);

        let mut ctx = OperatorContext {
            state: &mut state,
            timers: &mut timers,
        };
        let again = op.on_timer(100, &mut ctx).unwrap();
        assert!(again.is_empty());
    }

    // ==================== Frontier Bookkeeping ====================

    #[test]
    fn test_firing_advances_frontier_even_for_empty_bucket() {
        let mut op = make_operator(0, Fetch::Unbounded, true);
        let mut state = InMemoryStore::new();
        let mut timers = TimerService::new();

        let mut ctx = OperatorContext {
            state: &mut state,
            timers: &mut timers,
        };
        assert!(op.on_timer(100, &mut ctx).unwrap().is_empty());

        let marker: i64 = state.get_typed(LAST_FIRED_KEY).unwrap().unwrap();
        assert_eq!(marker, 100);
    }

    // ==================== Replay ====================

    #[test]
    fn test_replayed_firing_repeats_exactly() {
        let mut op = make_operator(0, Fetch::Bounded(2), true);
        let mut state = InMemoryStore::new();
        let mut timers = TimerService::new();

        feed(&mut op, &mut state, &mut timers, 100, &[4, 2, 8]);

        let snapshot = state.snapshot();
        let first = {
            let mut ctx = OperatorContext {
                state: &mut state,
                timers: &mut timers,
            };
            op.on_timer(100, &mut ctx).unwrap()
        };
        assert_eq!(first.len(), 2);

        state.restore(snapshot);
        let replayed = {
            let mut ctx = OperatorContext {
                state: &mut state,
                timers: &mut timers,
            };
            op.on_timer(100, &mut ctx).unwrap()
        };
        assert_eq!(first, replayed);
    }
}
