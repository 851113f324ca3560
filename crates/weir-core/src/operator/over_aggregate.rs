//! # Bounded OVER Aggregation Operator
//!
//! Per-row sliding aggregates over a preceding window: every input row
//! produces exactly one output row carrying its forwarded fields plus the
//! current value of each configured aggregate function.
//!
//! The window slides by retraction, never by recomputation. On the first
//! row of each new time coordinate, rows that fell out of the preceding
//! window are retracted from every accumulator and their buckets removed;
//! further rows at the same coordinate share that window state and skip
//! expiry. The incoming row is then accumulated before it is buffered, so
//! it is always part of its own window and never eligible for same-call
//! retraction; the window is inclusive at both ends.
//!
//! This path is append-only: it never retracts its own output, only adjusts
//! accumulator contents.

use super::aggregate::{Accumulator, AggregateFunction};
use super::buffer::TimeBucketedRowBuffer;
use super::{ChangeRow, ChangeVec, Datum, Operator, OperatorContext, OperatorError, Row};
use crate::state::StateStoreExt;
use arrow_schema::SchemaRef;

/// Buffered-row cell prefix.
const BUFFER_PREFIX: &[u8; 4] = b"buf:";
/// Persisted accumulator-list cell key.
const ACC_KEY: &[u8; 4] = b"acc:";
/// Last processed time coordinate cell key.
const LAST_TIME_KEY: &[u8; 4] = b"lpt:";
/// Buffered-row count cell key (row-count windows only).
const COUNT_KEY: &[u8; 4] = b"cnt:";

/// The preceding window of a bounded OVER aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrecedingBound {
    /// This many rows before the current row
    Rows(u64),
    /// This time span, in milliseconds, before the current row's time
    Time(i64),
}

/// Configuration for [`BoundedOverAggregateOperator`].
pub struct OverAggregateConfig {
    /// Schema of the input rows
    pub input_schema: SchemaRef,
    /// Aggregate functions, in output order
    pub aggregates: Vec<Box<dyn AggregateFunction>>,
    /// Input field each function aggregates, parallel to `aggregates`
    pub aggregate_field_indices: Vec<usize>,
    /// Number of leading input fields copied into each output row
    pub forwarded_field_count: usize,
    /// The preceding window
    pub bound: PrecedingBound,
}

/// Bounded OVER aggregation operator.
///
/// Accumulators, the row buffer, and the last-processed time all live in
/// the keyed store; the struct itself carries only the plan-supplied
/// function descriptors and field wiring.
pub struct BoundedOverAggregateOperator {
    aggregates: Vec<Box<dyn AggregateFunction>>,
    field_indices: Vec<usize>,
    forwarded_field_count: usize,
    bound: PrecedingBound,
    buffer: TimeBucketedRowBuffer,
}

impl BoundedOverAggregateOperator {
    /// Creates the operator from its configuration.
    ///
    /// # Errors
    ///
    /// Returns `OperatorError::InvalidConfig` if the function and
    /// field-index lists differ in length, an index or the forwarded-field
    /// count falls outside the input schema, or the time span is negative.
    pub fn try_new(config: OverAggregateConfig) -> Result<Self, OperatorError> {
        if config.aggregates.len() != config.aggregate_field_indices.len() {
            return Err(OperatorError::InvalidConfig(format!(
                "{} aggregate functions but {} field indices",
                config.aggregates.len(),
                config.aggregate_field_indices.len()
            )));
        }
        let arity = config.input_schema.fields().len();
        if let Some(index) = config
            .aggregate_field_indices
            .iter()
            .find(|index| **index >= arity)
        {
            return Err(OperatorError::InvalidConfig(format!(
                "aggregate field index {index} outside schema of {arity} fields"
            )));
        }
        if config.forwarded_field_count > arity {
            return Err(OperatorError::InvalidConfig(format!(
                "cannot forward {} fields from a schema of {arity}",
                config.forwarded_field_count
            )));
        }
        if let PrecedingBound::Time(span) = config.bound {
            if span < 0 {
                return Err(OperatorError::InvalidConfig(format!(
                    "negative preceding time span: {span}"
                )));
            }
        }

        Ok(Self {
            aggregates: config.aggregates,
            field_indices: config.aggregate_field_indices,
            forwarded_field_count: config.forwarded_field_count,
            bound: config.bound,
            buffer: TimeBucketedRowBuffer::new(BUFFER_PREFIX),
        })
    }

    /// Retracts one expired row from every accumulator.
    fn retract_row(&self, accumulators: &mut [Accumulator], row: &Row) {
        for (j, func) in self.aggregates.iter().enumerate() {
            func.retract(&mut accumulators[j], row.field(self.field_indices[j]));
        }
    }

    /// Retracts and removes everything outside the window ending at `time`.
    fn expire(
        &self,
        accumulators: &mut [Accumulator],
        time: i64,
        ctx: &mut OperatorContext,
    ) -> Result<(), OperatorError> {
        match self.bound {
            PrecedingBound::Time(span) => {
                let limit = time.saturating_sub(span);
                for (_, rows) in self.buffer.remove_below(ctx.state, limit)? {
                    for expired in &rows {
                        self.retract_row(accumulators, expired);
                    }
                }
            }
            PrecedingBound::Rows(keep) => {
                let count: u64 = ctx.state.get_typed(COUNT_KEY)?.unwrap_or(0);
                if count > keep {
                    let mut excess = count - keep;
                    for (timestamp, rows) in self.buffer.entries(ctx.state)? {
                        if excess == 0 {
                            break;
                        }
                        if rows.len() as u64 <= excess {
                            excess -= rows.len() as u64;
                            for expired in &rows {
                                self.retract_row(accumulators, expired);
                            }
                            self.buffer.replace(ctx.state, timestamp, Vec::new())?;
                        } else {
                            #[allow(clippy::cast_possible_truncation)]
                            let split = excess as usize;
                            for expired in &rows[..split] {
                                self.retract_row(accumulators, expired);
                            }
                            self.buffer
                                .replace(ctx.state, timestamp, rows[split..].to_vec())?;
                            excess = 0;
                        }
                    }
                    ctx.state.put_typed(COUNT_KEY, &keep)?;
                }
            }
        }
        Ok(())
    }
}

impl Operator for BoundedOverAggregateOperator {
    fn process_record(
        &mut self,
        row: Row,
        time: i64,
        ctx: &mut OperatorContext,
    ) -> Result<ChangeVec, OperatorError> {
        let mut accumulators: Vec<Accumulator> =
            match ctx.state.get_typed(ACC_KEY)? {
                Some(accumulators) => accumulators,
                None => self
                    .aggregates
                    .iter()
                    .map(|func| func.create_accumulator())
                    .collect(),
            };

        // Rows at an already-seen coordinate share the window state; only
        // the first row at a new coordinate slides the window forward.
        let last: Option<i64> = ctx.state.get_typed(LAST_TIME_KEY)?;
        let advances = last.map_or(true, |l| time > l);
        if advances {
            self.expire(&mut accumulators, time, ctx)?;
        }

        for (j, func) in self.aggregates.iter().enumerate() {
            func.accumulate(&mut accumulators[j], row.field(self.field_indices[j]));
        }

        let mut values: Vec<Datum> = row.values()[..self.forwarded_field_count].to_vec();
        for (j, func) in self.aggregates.iter().enumerate() {
            values.push(func.value(&accumulators[j]));
        }

        self.buffer.append(ctx.state, time, row)?;
        if matches!(self.bound, PrecedingBound::Rows(_)) {
            let count: u64 = ctx.state.get_typed(COUNT_KEY)?.unwrap_or(0);
            ctx.state.put_typed(COUNT_KEY, &(count + 1))?;
        }
        ctx.state.put_typed(ACC_KEY, &accumulators)?;
        if advances {
            ctx.state.put_typed(LAST_TIME_KEY, &time)?;
        }

        let mut changes = ChangeVec::new();
        changes.push(ChangeRow::insert(Row::new(values)));
        Ok(changes)
    }

    fn on_timer(
        &mut self,
        _fired_timestamp: i64,
        _ctx: &mut OperatorContext,
    ) -> Result<ChangeVec, OperatorError> {
        // Window expiry rides the record path; this operator registers no
        // timers of its own.
        Ok(ChangeVec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::aggregate::{CountAggregate, MinAggregate, SumAggregate};
    use crate::state::InMemoryStore;
    use crate::time::TimerService;
    use arrow_schema::{DataType, Field, Schema};
    use std::sync::Arc;

    fn schema() -> SchemaRef {
        Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]))
    }

    fn sum_operator(bound: PrecedingBound) -> BoundedOverAggregateOperator {
        BoundedOverAggregateOperator::try_new(OverAggregateConfig {
            input_schema: schema(),
            aggregates: vec![Box::new(SumAggregate)],
            aggregate_field_indices: vec![0],
            forwarded_field_count: 1,
            bound,
        })
        .unwrap()
    }

    fn row(v: i64) -> Row {
        Row::new(vec![Datum::Int64(v)])
    }

    fn process(
        op: &mut BoundedOverAggregateOperator,
        state: &mut InMemoryStore,
        timers: &mut TimerService,
        time: i64,
        value: i64,
    ) -> Row {
        let mut ctx = OperatorContext { state, timers };
        let changes = op.process_record(row(value), time, &mut ctx).unwrap();
        assert_eq!(changes.len(), 1, "one output row per input row");
        assert!(changes[0].is_insert(), "this path never retracts output");
        changes[0].row.clone()
    }

    // ==================== Time Windows ====================

    #[test]
    fn test_time_window_retracts_expired_rows() {
        let mut op = sum_operator(PrecedingBound::Time(2));
        let mut state = InMemoryStore::new();
        let mut timers = TimerService::new();

        let out = process(&mut op, &mut state, &mut timers, 10, 5);
        assert_eq!(out, Row::new(vec![Datum::Int64(5), Datum::Int64(5)]));

        let out = process(&mut op, &mut state, &mut timers, 11, 3);
        assert_eq!(out, Row::new(vec![Datum::Int64(3), Datum::Int64(8)]));

        // 13 - 2 = 11: the rows at 10 leave the window, 11 stays
        let out = process(&mut op, &mut state, &mut timers, 13, 2);
        assert_eq!(out, Row::new(vec![Datum::Int64(2), Datum::Int64(5)]));
    }

    #[test]
    fn test_time_window_is_inclusive_at_the_lower_edge() {
        let mut op = sum_operator(PrecedingBound::Time(2));
        let mut state = InMemoryStore::new();
        let mut timers = TimerService::new();

        process(&mut op, &mut state, &mut timers, 10, 5);
        // 12 - 2 = 10: the row at exactly the limit stays in the window
        let out = process(&mut op, &mut state, &mut timers, 12, 1);
        assert_eq!(out, Row::new(vec![Datum::Int64(1), Datum::Int64(6)]));
    }

    #[test]
    fn test_same_time_rows_share_window_state() {
        let mut op = sum_operator(PrecedingBound::Time(0));
        let mut state = InMemoryStore::new();
        let mut timers = TimerService::new();

        // Zero span: each new coordinate evicts everything earlier, but the
        // second row at t=10 skips expiry and joins the first
        process(&mut op, &mut state, &mut timers, 10, 5);
        let out = process(&mut op, &mut state, &mut timers, 10, 7);
        assert_eq!(out, Row::new(vec![Datum::Int64(7), Datum::Int64(12)]));

        let out = process(&mut op, &mut state, &mut timers, 11, 1);
        assert_eq!(out, Row::new(vec![Datum::Int64(1), Datum::Int64(1)]));
    }

    // ==================== Row-Count Windows ====================

    #[test]
    fn test_row_window_keeps_preceding_rows() {
        let mut op = sum_operator(PrecedingBound::Rows(1));
        let mut state = InMemoryStore::new();
        let mut timers = TimerService::new();

        let out = process(&mut op, &mut state, &mut timers, 1, 1);
        assert_eq!(out.field(1), &Datum::Int64(1));

        let out = process(&mut op, &mut state, &mut timers, 2, 2);
        assert_eq!(out.field(1), &Datum::Int64(3));

        // Window is the current row plus one preceding: 1 falls out
        let out = process(&mut op, &mut state, &mut timers, 3, 4);
        assert_eq!(out.field(1), &Datum::Int64(6));
    }

    #[test]
    fn test_row_window_expires_across_bucket_boundaries() {
        let mut op = sum_operator(PrecedingBound::Rows(2));
        let mut state = InMemoryStore::new();
        let mut timers = TimerService::new();

        // Three rows at t=1 share the window, then t=2 trims to two
        process(&mut op, &mut state, &mut timers, 1, 1);
        process(&mut op, &mut state, &mut timers, 1, 2);
        let out = process(&mut op, &mut state, &mut timers, 1, 4);
        assert_eq!(out.field(1), &Datum::Int64(7));

        let out = process(&mut op, &mut state, &mut timers, 2, 8);
        assert_eq!(out.field(1), &Datum::Int64(14)); // 2 + 4 + 8
    }

    // ==================== Output Composition ====================

    #[test]
    fn test_multiple_aggregates_in_configured_order() {
        let mut op = BoundedOverAggregateOperator::try_new(OverAggregateConfig {
            input_schema: schema(),
            aggregates: vec![
                Box::new(SumAggregate),
                Box::new(CountAggregate),
                Box::new(MinAggregate),
            ],
            aggregate_field_indices: vec![0, 0, 0],
            forwarded_field_count: 1,
            bound: PrecedingBound::Time(10),
        })
        .unwrap();
        let mut state = InMemoryStore::new();
        let mut timers = TimerService::new();

        process(&mut op, &mut state, &mut timers, 1, 5);
        let out = process(&mut op, &mut state, &mut timers, 2, 3);
        assert_eq!(
            out,
            Row::new(vec![
                Datum::Int64(3),
                Datum::Int64(8),
                Datum::Int64(2),
                Datum::Int64(3),
            ])
        );
    }

    #[test]
    fn test_on_timer_is_silent() {
        let mut op = sum_operator(PrecedingBound::Time(1));
        let mut state = InMemoryStore::new();
        let mut timers = TimerService::new();
        let mut ctx = OperatorContext {
            state: &mut state,
            timers: &mut timers,
        };

        assert!(op.on_timer(100, &mut ctx).unwrap().is_empty());
    }

    // ==================== Construction ====================

    #[test]
    fn test_mismatched_function_and_index_lists() {
        let err = BoundedOverAggregateOperator::try_new(OverAggregateConfig {
            input_schema: schema(),
            aggregates: vec![Box::new(SumAggregate)],
            aggregate_field_indices: vec![0, 0],
            forwarded_field_count: 0,
            bound: PrecedingBound::Time(1),
        });
        assert!(matches!(err, Err(OperatorError::InvalidConfig(_))));
    }

    #[test]
    fn test_field_index_outside_schema() {
        let err = BoundedOverAggregateOperator::try_new(OverAggregateConfig {
            input_schema: schema(),
            aggregates: vec![Box::new(SumAggregate)],
            aggregate_field_indices: vec![1],
            forwarded_field_count: 0,
            bound: PrecedingBound::Time(1),
        });
        assert!(matches!(err, Err(OperatorError::InvalidConfig(_))));
    }

    #[test]
    fn test_forwarded_count_outside_schema() {
        let err = BoundedOverAggregateOperator::try_new(OverAggregateConfig {
            input_schema: schema(),
            aggregates: vec![Box::new(SumAggregate)],
            aggregate_field_indices: vec![0],
            forwarded_field_count: 2,
            bound: PrecedingBound::Time(1),
        });
        assert!(matches!(err, Err(OperatorError::InvalidConfig(_))));
    }

    #[test]
    fn test_negative_time_span() {
        let err = BoundedOverAggregateOperator::try_new(OverAggregateConfig {
            input_schema: schema(),
            aggregates: vec![Box::new(SumAggregate)],
            aggregate_field_indices: vec![0],
            forwarded_field_count: 0,
            bound: PrecedingBound::Time(-1),
        });
        assert!(matches!(err, Err(OperatorError::InvalidConfig(_))));
    }
}
