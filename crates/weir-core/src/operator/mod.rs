//! # Operator Module
//!
//! The four time-triggered, keyed-state operators and their shared row,
//! change, and configuration types.
//!
//! ## Operators
//!
//! - [`ProcTimeLimitOperator`]: `OFFSET/FETCH` over arrival order with a
//!   fixed one-millisecond emission delay and a saturating persisted counter
//! - [`EventTimeSortOperator`]: per-watermark-bucket sort with `OFFSET/FETCH`
//!   applied to each finalized bucket, append-only output
//! - [`RetractSortOperator`]: event-time sort that revises previously
//!   delivered results, retracting rows pushed out of the fetch window
//! - [`BoundedOverAggregateOperator`]: per-row sliding aggregates over a
//!   preceding row-count or time-span window, with exact retraction
//!
//! All durable state lives in the keyed store reached through
//! [`OperatorContext`]; the operator structs themselves hold only immutable
//! configuration and diagnostic counters, so a key can be recovered from its
//! persisted cells alone.

use crate::state::{StateError, StateStore};
use crate::time::TimerService;
use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
use smallvec::SmallVec;

pub mod aggregate;
pub mod buffer;
pub mod event_sort;
pub mod limit;
pub mod ordering;
pub mod over_aggregate;
pub mod proc_time_limit;
pub mod retract_sort;

pub use aggregate::{
    Accumulator, AggregateFunction, AvgAggregate, CountAggregate, MaxAggregate, MinAggregate,
    SumAggregate,
};
pub use buffer::TimeBucketedRowBuffer;
pub use event_sort::{EventTimeSortOperator, SortLimitConfig};
pub use limit::{Fetch, LimitSpec};
pub use ordering::{ColumnComparator, RowComparator, SortColumn};
pub use over_aggregate::{BoundedOverAggregateOperator, OverAggregateConfig, PrecedingBound};
pub use proc_time_limit::{ProcTimeLimitConfig, ProcTimeLimitOperator};
pub use retract_sort::RetractSortOperator;

/// A typed scalar field value.
///
/// The field types the runtime sorts, aggregates, and persists. Timestamps
/// are milliseconds since the epoch, matching the operators' time axis.
#[derive(Debug, Clone, PartialEq, Archive, RkyvSerialize, RkyvDeserialize)]
pub enum Datum {
    /// Absent value
    Null,
    /// Boolean
    Bool(bool),
    /// 64-bit signed integer
    Int64(i64),
    /// 64-bit float
    Float64(f64),
    /// UTF-8 string
    Utf8(String),
    /// Millisecond timestamp
    Timestamp(i64),
}

impl Datum {
    /// Returns true for [`Datum::Null`].
    #[inline]
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// The integer value, if this datum is an `Int64` or `Timestamp`.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int64(v) | Self::Timestamp(v) => Some(*v),
            _ => None,
        }
    }

    /// The float value, widening `Int64` if needed.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float64(v) => Some(*v),
            Self::Int64(v) => Some(*v as f64),
            _ => None,
        }
    }
}

/// An immutable, fixed-arity ordered tuple of typed fields, addressed by
/// position.
#[derive(Debug, Clone, PartialEq, Archive, RkyvSerialize, RkyvDeserialize)]
pub struct Row {
    values: Vec<Datum>,
}

impl Row {
    /// Creates a row from its field values.
    #[must_use]
    pub fn new(values: Vec<Datum>) -> Self {
        Self { values }
    }

    /// The field at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds. Field indices are validated
    /// against the input schema at operator construction.
    #[inline]
    #[must_use]
    pub fn field(&self, index: usize) -> &Datum {
        &self.values[index]
    }

    /// Number of fields.
    #[must_use]
    pub fn arity(&self) -> usize {
        self.values.len()
    }

    /// All field values in positional order.
    #[must_use]
    pub fn values(&self) -> &[Datum] {
        &self.values
    }
}

/// Direction of a result-set change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// The row is now part of the result set
    Insert,
    /// The row must be removed from a previously delivered result set
    Retract,
}

impl ChangeKind {
    /// Z-set weight of the change: +1 for insert, -1 for retract.
    #[must_use]
    pub fn weight(&self) -> i32 {
        match self {
            Self::Insert => 1,
            Self::Retract => -1,
        }
    }
}

/// A row paired with its change direction.
///
/// Downstream consumers apply change rows in delivery order to reconstruct
/// the current result set.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRow {
    /// Direction of the change
    pub kind: ChangeKind,
    /// The row value
    pub row: Row,
}

impl ChangeRow {
    /// Creates an insertion.
    #[must_use]
    pub fn insert(row: Row) -> Self {
        Self {
            kind: ChangeKind::Insert,
            row,
        }
    }

    /// Creates a retraction.
    #[must_use]
    pub fn retract(row: Row) -> Self {
        Self {
            kind: ChangeKind::Retract,
            row,
        }
    }

    /// Returns true for insertions.
    #[must_use]
    pub fn is_insert(&self) -> bool {
        self.kind == ChangeKind::Insert
    }
}

/// Collection type for emitted change rows.
///
/// Sized so the common small firing avoids heap allocation.
pub type ChangeVec = SmallVec<[ChangeRow; 4]>;

/// Context handed to an operator for one callback.
///
/// Both handles are scoped to the current key by the substrate; the operator
/// reads, modifies, and persists within the one synchronous callback.
pub struct OperatorContext<'a> {
    /// The key's durable state store
    pub state: &'a mut dyn StateStore,
    /// The key's timer facility
    pub timers: &'a mut TimerService,
}

/// Trait implemented by the keyed streaming operators.
///
/// The substrate calls [`process_record`](Operator::process_record) once per
/// input row in arrival order for the key, and
/// [`on_timer`](Operator::on_timer) once per fired timer. Both are
/// synchronous, run-to-completion callbacks; a state failure aborts the
/// invocation and recovery is the substrate's checkpoint/restart concern.
pub trait Operator: Send {
    /// Processes one input row.
    ///
    /// `time` is the row's time coordinate: the wall clock at call time for
    /// processing-time operators, the attached event timestamp for
    /// event-time operators.
    ///
    /// # Errors
    ///
    /// Returns `OperatorError` if persisted state cannot be read or written.
    fn process_record(
        &mut self,
        row: Row,
        time: i64,
        ctx: &mut OperatorContext,
    ) -> Result<ChangeVec, OperatorError>;

    /// Handles a fired timer.
    ///
    /// # Errors
    ///
    /// Returns `OperatorError` if persisted state cannot be read or written.
    fn on_timer(
        &mut self,
        fired_timestamp: i64,
        ctx: &mut OperatorContext,
    ) -> Result<ChangeVec, OperatorError>;

    /// Releases the operator instance.
    ///
    /// Nothing durable needs flushing: buffered rows are recovered from the
    /// persisted cells on restart.
    fn close(&mut self) {}
}

/// Errors that can occur in operators.
#[derive(Debug, thiserror::Error)]
pub enum OperatorError {
    /// Construction-time configuration rejection
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Persisted state access failed
    #[error("State access failed: {0}")]
    State(#[from] StateError),
}
