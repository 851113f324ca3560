//! # Processing-Time Limit Operator
//!
//! `OFFSET/FETCH` over arrival order on an unbounded stream.
//!
//! Rows are buffered under their arrival millisecond and a timer is
//! registered one millisecond ahead, so nothing is emitted before the fixed
//! processing-time delay has elapsed. Each firing drains every bucket below
//! the fired timestamp (exactly the rows buffered since the previous
//! firing) and walks them in arrival order against a single persisted
//! counter of rows ever considered.
//!
//! The counter saturates at `offset + fetch` (at `offset` when fetch is
//! unbounded): past that point further increments cannot change any
//! emission decision, so high-churn keys never risk overflow.
//!
//! This path is append-only; it never retracts.

use super::buffer::TimeBucketedRowBuffer;
use super::limit::{Fetch, LimitSpec};
use super::{ChangeRow, ChangeVec, Operator, OperatorContext, OperatorError, Row};
use crate::state::StateStoreExt;
use crate::time::TimerRegistrar;
use arrow_schema::SchemaRef;

/// Buffered-row cell prefix.
const BUFFER_PREFIX: &[u8; 4] = b"buf:";
/// Persisted row-counter cell key.
const COUNTER_KEY: &[u8; 4] = b"cnt:";
/// Pending-timer cell key.
const TIMER_KEY: &[u8; 4] = b"tmr:";

/// Configuration for [`ProcTimeLimitOperator`].
pub struct ProcTimeLimitConfig {
    /// Schema of the input rows
    pub input_schema: SchemaRef,
    /// Number of leading rows to skip
    pub offset: u64,
    /// Maximum number of rows to pass
    pub fetch: Fetch,
}

/// Processing-time `OFFSET/FETCH` operator.
///
/// Holds no durable data itself: the row buffer, the counter, and the
/// pending-timer marker all live in the keyed store, so a restarted
/// instance picks up mid-stream.
pub struct ProcTimeLimitOperator {
    limit: LimitSpec,
    buffer: TimeBucketedRowBuffer,
    registrar: TimerRegistrar,
    input_arity: usize,
}

impl ProcTimeLimitOperator {
    /// Creates the operator from its configuration.
    ///
    /// # Errors
    ///
    /// Currently infallible; returns `Result` for parity with the other
    /// operator constructors, which validate their richer configs.
    pub fn try_new(config: ProcTimeLimitConfig) -> Result<Self, OperatorError> {
        Ok(Self {
            limit: LimitSpec::new(config.offset, config.fetch),
            buffer: TimeBucketedRowBuffer::new(BUFFER_PREFIX),
            registrar: TimerRegistrar::new(TIMER_KEY),
            input_arity: config.input_schema.fields().len(),
        })
    }

    /// The configured window.
    #[must_use]
    pub fn limit(&self) -> &LimitSpec {
        &self.limit
    }
}

impl Operator for ProcTimeLimitOperator {
    fn process_record(
        &mut self,
        row: Row,
        time: i64,
        ctx: &mut OperatorContext,
    ) -> Result<ChangeVec, OperatorError> {
        debug_assert_eq!(row.arity(), self.input_arity);

        self.buffer.append(ctx.state, time, row)?;
        self.registrar
            .register_if_absent(ctx.state, ctx.timers, time + 1)?;
        Ok(ChangeVec::new())
    }

    fn on_timer(
        &mut self,
        fired_timestamp: i64,
        ctx: &mut OperatorContext,
    ) -> Result<ChangeVec, OperatorError> {
        let drained = self.buffer.remove_below(ctx.state, fired_timestamp)?;

        let mut changes = ChangeVec::new();
        if !drained.is_empty() {
            let mut counter: u64 = ctx.state.get_typed(COUNTER_KEY)?.unwrap_or(0);
            for (_, rows) in drained {
                for row in rows {
                    if self.limit.emits_at(counter) {
                        changes.push(ChangeRow::insert(row));
                    }
                    counter = self.limit.bump(counter);
                }
            }
            ctx.state.put_typed(COUNTER_KEY, &counter)?;
        }

        self.registrar.acknowledge(ctx.state, fired_timestamp)?;
        Ok(changes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::Datum;
    use crate::state::{InMemoryStore, StateStore};
    use crate::time::TimerService;
    use arrow_schema::{DataType, Field, Schema};
    use std::sync::Arc;

    fn make_operator(offset: u64, fetch: Fetch) -> ProcTimeLimitOperator {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Utf8, false)]));
        ProcTimeLimitOperator::try_new(ProcTimeLimitConfig {
            input_schema: schema,
            offset,
            fetch,
        })
        .unwrap()
    }

    fn row(name: &str) -> Row {
        Row::new(vec![Datum::Utf8(name.to_string())])
    }

    /// Feeds rows at one arrival millisecond and fires the resulting timer.
    fn feed_and_fire(
        op: &mut ProcTimeLimitOperator,
        state: &mut InMemoryStore,
        timers: &mut TimerService,
        now: i64,
        rows: Vec<Row>,
    ) -> Vec<ChangeRow> {
        let mut ctx = OperatorContext { state, timers };
        for r in rows {
            let out = op.process_record(r, now, &mut ctx).unwrap();
            assert!(out.is_empty(), "sort paths buffer, they never emit here");
        }
        let mut emitted = Vec::new();
        for fired in ctx.timers.poll_timers(now + 1) {
            emitted.extend(op.on_timer(fired.timestamp, &mut ctx).unwrap());
        }
        emitted
    }

    // ==================== Emission ====================

    #[test]
    fn test_offset_fetch_window_over_one_firing() {
        let mut op = make_operator(1, Fetch::Bounded(2));
        let mut state = InMemoryStore::new();
        let mut timers = TimerService::new();

        let emitted = feed_and_fire(
            &mut op,
            &mut state,
            &mut timers,
            1_000,
            vec![row("a"), row("b"), row("c")],
        );

        assert_eq!(emitted.len(), 2);
        assert_eq!(emitted[0], ChangeRow::insert(row("b")));
        assert_eq!(emitted[1], ChangeRow::insert(row("c")));

        let counter: u64 = state.get_typed(COUNTER_KEY).unwrap().unwrap();
        assert_eq!(counter, 3);
    }

    #[test]
    fn test_counter_spans_firings() {
        let mut op = make_operator(1, Fetch::Bounded(2));
        let mut state = InMemoryStore::new();
        let mut timers = TimerService::new();

        let first = feed_and_fire(&mut op, &mut state, &mut timers, 1_000, vec![row("a")]);
        assert!(first.is_empty());

        let second = feed_and_fire(
            &mut op,
            &mut state,
            &mut timers,
            2_000,
            vec![row("b"), row("c"), row("d")],
        );
        assert_eq!(second, vec![ChangeRow::insert(row("b")), ChangeRow::insert(row("c"))]);
    }

    #[test]
    fn test_counter_saturates_under_churn() {
        let mut op = make_operator(2, Fetch::Bounded(1));
        let mut state = InMemoryStore::new();
        let mut timers = TimerService::new();

        for i in 0..50 {
            feed_and_fire(
                &mut op,
                &mut state,
                &mut timers,
                1_000 + i,
                vec![row("x")],
            );
            let counter: u64 = state.get_typed(COUNTER_KEY).unwrap().unwrap();
            assert!(counter <= 3);
        }

        let counter: u64 = state.get_typed(COUNTER_KEY).unwrap().unwrap();
        assert_eq!(counter, 3);
    }

    #[test]
    fn test_unbounded_fetch_emits_everything_past_offset() {
        let mut op = make_operator(2, Fetch::Unbounded);
        let mut state = InMemoryStore::new();
        let mut timers = TimerService::new();

        let emitted = feed_and_fire(
            &mut op,
            &mut state,
            &mut timers,
            1_000,
            vec![row("a"), row("b"), row("c"), row("d")],
        );
        assert_eq!(emitted, vec![ChangeRow::insert(row("c")), ChangeRow::insert(row("d"))]);

        // Every later row passes
        let emitted = feed_and_fire(&mut op, &mut state, &mut timers, 2_000, vec![row("e")]);
        assert_eq!(emitted, vec![ChangeRow::insert(row("e"))]);
    }

    #[test]
    fn test_zero_fetch_emits_nothing() {
        let mut op = make_operator(0, Fetch::Bounded(0));
        let mut state = InMemoryStore::new();
        let mut timers = TimerService::new();

        let emitted = feed_and_fire(
            &mut op,
            &mut state,
            &mut timers,
            1_000,
            vec![row("a"), row("b")],
        );
        assert!(emitted.is_empty());
    }

    // ==================== Timer Behavior ====================

    #[test]
    fn test_one_timer_per_arrival_millisecond() {
        let mut op = make_operator(0, Fetch::Unbounded);
        let mut state = InMemoryStore::new();
        let mut timers = TimerService::new();
        let mut ctx = OperatorContext {
            state: &mut state,
            timers: &mut timers,
        };

        op.process_record(row("a"), 1_000, &mut ctx).unwrap();
        op.process_record(row("b"), 1_000, &mut ctx).unwrap();
        op.process_record(row("c"), 1_001, &mut ctx).unwrap();

        assert_eq!(ctx.timers.pending_count(), 2);
    }

    #[test]
    fn test_firing_with_empty_buffer_is_silent() {
        let mut op = make_operator(0, Fetch::Unbounded);
        let mut state = InMemoryStore::new();
        let mut timers = TimerService::new();
        let mut ctx = OperatorContext {
            state: &mut state,
            timers: &mut timers,
        };

        let emitted = op.on_timer(1_001, &mut ctx).unwrap();
        assert!(emitted.is_empty());
        assert!(!ctx.state.contains(COUNTER_KEY));
    }

    // ==================== Replay ====================

    #[test]
    fn test_replayed_firing_repeats_exactly() {
        let mut op = make_operator(1, Fetch::Bounded(2));
        let mut state = InMemoryStore::new();
        let mut timers = TimerService::new();

        {
            let mut ctx = OperatorContext {
                state: &mut state,
                timers: &mut timers,
            };
            for r in [row("a"), row("b"), row("c")] {
                op.process_record(r, 1_000, &mut ctx).unwrap();
            }
        }

        let snapshot = state.snapshot();
        let first = {
            let mut ctx = OperatorContext {
                state: &mut state,
                timers: &mut timers,
            };
            op.on_timer(1_001, &mut ctx).unwrap()
        };

        state.restore(snapshot);
        let replayed = {
            let mut ctx = OperatorContext {
                state: &mut state,
                timers: &mut timers,
            };
            op.on_timer(1_001, &mut ctx).unwrap()
        };

        assert_eq!(first, replayed);
    }
}
