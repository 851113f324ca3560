//! # Weir Core
//!
//! The keyed runtime layer for continuous `ORDER BY ... OFFSET/FETCH` and
//! bounded `OVER (PARTITION BY ... ORDER BY time ...)` execution over
//! unbounded row streams.
//!
//! This crate provides:
//! - **Operators**: the four time-triggered, keyed-state operators that
//!   buffer rows, decide emission/retraction order, and maintain sliding
//!   aggregates
//! - **State**: the durable per-key store contract the execution substrate
//!   fulfils, plus an in-memory reference implementation
//! - **Time**: watermark bookkeeping, timer scheduling, and deduplicated
//!   timer registration
//!
//! ## Execution Model
//!
//! The surrounding substrate partitions the stream by key and routes every
//! record and timer firing for one key through a single serialized queue.
//! Each operator instance therefore runs single-threaded per key, owns that
//! key's state cells exclusively, and performs no internal locking. All
//! durable state lives in the [`state::StateStore`]; an operator struct holds
//! only immutable configuration and diagnostic counters, so a restart
//! recovers everything from the store.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use arrow_schema::{DataType, Field, Schema};
//! use weir_core::operator::{
//!     Datum, Fetch, Operator, OperatorContext, ProcTimeLimitConfig,
//!     ProcTimeLimitOperator, Row,
//! };
//! use weir_core::state::InMemoryStore;
//! use weir_core::time::TimerService;
//!
//! let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]));
//! let mut op = ProcTimeLimitOperator::try_new(ProcTimeLimitConfig {
//!     input_schema: schema,
//!     offset: 1,
//!     fetch: Fetch::Bounded(2),
//! })
//! .unwrap();
//!
//! let mut state = InMemoryStore::new();
//! let mut timers = TimerService::new();
//! let mut ctx = OperatorContext { state: &mut state, timers: &mut timers };
//!
//! for v in [10, 20, 30] {
//!     let row = Row::new(vec![Datum::Int64(v)]);
//!     op.process_record(row, 1_000, &mut ctx).unwrap();
//! }
//! for timer in ctx.timers.poll_timers(1_001) {
//!     let changes = op.on_timer(timer.timestamp, &mut ctx).unwrap();
//!     assert_eq!(changes.len(), 2); // rows 20 and 30: the first is skipped
//! }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod operator;
pub mod state;
pub mod time;

/// Result type for weir-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for weir-core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// State store errors
    #[error("State error: {0}")]
    State(#[from] state::StateError),

    /// Operator errors
    #[error("Operator error: {0}")]
    Operator(#[from] operator::OperatorError),
}
