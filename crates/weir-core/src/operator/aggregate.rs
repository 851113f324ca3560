//! # Incremental Aggregate Functions
//!
//! The accumulator contract the plan layer fulfils, plus the retractable
//! built-ins.
//!
//! Every function maintains running state that supports both
//! [`accumulate`](AggregateFunction::accumulate) and its exact inverse
//! [`retract`](AggregateFunction::retract), so a sliding preceding window
//! never recomputes from scratch: rows entering the window are accumulated
//! once, rows leaving it are retracted once, and
//! [`value`](AggregateFunction::value) reflects precisely the current
//! window contents.
//!
//! NULL input values are skipped by every built-in, on both the accumulate
//! and the retract path, so the two stay symmetric.

use super::ordering::cmp_datum;
use super::Datum;
use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};

/// Opaque running state for one (key, aggregate function) pair.
///
/// Physically an ordered sequence of datum slots; the slot layout is private
/// to the function that created the accumulator, and no other code should
/// interpret it. The container is serializable so the operator can persist
/// accumulators between callbacks.
#[derive(Debug, Clone, Default, PartialEq, Archive, RkyvSerialize, RkyvDeserialize)]
pub struct Accumulator {
    slots: Vec<Datum>,
}

impl Accumulator {
    /// Creates an accumulator with the given slot layout.
    #[must_use]
    pub fn with_slots(slots: Vec<Datum>) -> Self {
        Self { slots }
    }

    /// The slots, readable by the owning function.
    #[must_use]
    pub fn slots(&self) -> &[Datum] {
        &self.slots
    }

    /// The slots, writable by the owning function.
    pub fn slots_mut(&mut self) -> &mut Vec<Datum> {
        &mut self.slots
    }
}

/// Trait for aggregate functions supplied by the plan layer.
///
/// Consumed as opaque trait objects in the order the plan lists them; the
/// operator never inspects what a function computes, it only moves values
/// in and out of the function's accumulator.
pub trait AggregateFunction: Send {
    /// Creates the empty accumulator for this function.
    fn create_accumulator(&self) -> Accumulator;

    /// Folds one input value into the accumulator.
    fn accumulate(&self, acc: &mut Accumulator, value: &Datum);

    /// Reverses one previous [`accumulate`](AggregateFunction::accumulate)
    /// of the same value.
    fn retract(&self, acc: &mut Accumulator, value: &Datum);

    /// The current aggregate result.
    fn value(&self, acc: &Accumulator) -> Datum;
}

/// Adds two numeric datums, widening to float when either side is a float.
fn numeric_add(a: &Datum, b: &Datum) -> Datum {
    match (a, b) {
        (Datum::Null, other) | (other, Datum::Null) => other.clone(),
        (Datum::Int64(x), Datum::Int64(y)) => Datum::Int64(x + y),
        _ => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => Datum::Float64(x + y),
            _ => Datum::Null,
        },
    }
}

/// Subtracts a numeric datum from another, widening like [`numeric_add`].
fn numeric_sub(a: &Datum, b: &Datum) -> Datum {
    match (a, b) {
        (other, Datum::Null) => other.clone(),
        (Datum::Int64(x), Datum::Int64(y)) => Datum::Int64(x - y),
        _ => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => Datum::Float64(x - y),
            _ => Datum::Null,
        },
    }
}

/// COUNT over non-null values.
#[derive(Debug, Clone, Copy, Default)]
pub struct CountAggregate;

impl AggregateFunction for CountAggregate {
    fn create_accumulator(&self) -> Accumulator {
        Accumulator::with_slots(vec![Datum::Int64(0)])
    }

    fn accumulate(&self, acc: &mut Accumulator, value: &Datum) {
        if value.is_null() {
            return;
        }
        if let Datum::Int64(count) = &mut acc.slots_mut()[0] {
            *count += 1;
        }
    }

    fn retract(&self, acc: &mut Accumulator, value: &Datum) {
        if value.is_null() {
            return;
        }
        if let Datum::Int64(count) = &mut acc.slots_mut()[0] {
            *count -= 1;
        }
    }

    fn value(&self, acc: &Accumulator) -> Datum {
        acc.slots()[0].clone()
    }
}

/// SUM over non-null numeric values.
///
/// Yields NULL while the window holds no non-null value, per SQL semantics;
/// a second slot counts the live values so retraction can restore that
/// state exactly.
#[derive(Debug, Clone, Copy, Default)]
pub struct SumAggregate;

impl AggregateFunction for SumAggregate {
    fn create_accumulator(&self) -> Accumulator {
        Accumulator::with_slots(vec![Datum::Null, Datum::Int64(0)])
    }

    fn accumulate(&self, acc: &mut Accumulator, value: &Datum) {
        if value.is_null() {
            return;
        }
        let sum = numeric_add(&acc.slots()[0], value);
        let slots = acc.slots_mut();
        slots[0] = sum;
        if let Datum::Int64(count) = &mut slots[1] {
            *count += 1;
        }
    }

    fn retract(&self, acc: &mut Accumulator, value: &Datum) {
        if value.is_null() {
            return;
        }
        let sum = numeric_sub(&acc.slots()[0], value);
        let slots = acc.slots_mut();
        if let Datum::Int64(count) = &mut slots[1] {
            *count -= 1;
            slots[0] = if *count == 0 { Datum::Null } else { sum };
        }
    }

    fn value(&self, acc: &Accumulator) -> Datum {
        acc.slots()[0].clone()
    }
}

/// AVG over non-null numeric values.
#[derive(Debug, Clone, Copy, Default)]
pub struct AvgAggregate;

impl AggregateFunction for AvgAggregate {
    fn create_accumulator(&self) -> Accumulator {
        Accumulator::with_slots(vec![Datum::Float64(0.0), Datum::Int64(0)])
    }

    fn accumulate(&self, acc: &mut Accumulator, value: &Datum) {
        let Some(v) = value.as_f64() else {
            return;
        };
        let slots = acc.slots_mut();
        if let Datum::Float64(sum) = &mut slots[0] {
            *sum += v;
        }
        if let Datum::Int64(count) = &mut slots[1] {
            *count += 1;
        }
    }

    fn retract(&self, acc: &mut Accumulator, value: &Datum) {
        let Some(v) = value.as_f64() else {
            return;
        };
        let slots = acc.slots_mut();
        if let Datum::Float64(sum) = &mut slots[0] {
            *sum -= v;
        }
        if let Datum::Int64(count) = &mut slots[1] {
            *count -= 1;
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn value(&self, acc: &Accumulator) -> Datum {
        match (&acc.slots()[0], &acc.slots()[1]) {
            (Datum::Float64(sum), Datum::Int64(count)) if *count > 0 => {
                Datum::Float64(sum / *count as f64)
            }
            _ => Datum::Null,
        }
    }
}

/// Inserts a value into a slot multiset kept sorted by [`cmp_datum`].
fn multiset_insert(acc: &mut Accumulator, value: &Datum) {
    let slots = acc.slots_mut();
    let pos = slots
        .binary_search_by(|probe| cmp_datum(probe, value))
        .unwrap_or_else(|pos| pos);
    slots.insert(pos, value.clone());
}

/// Removes one occurrence of a value from a sorted slot multiset.
fn multiset_remove(acc: &mut Accumulator, value: &Datum) {
    let slots = acc.slots_mut();
    if let Ok(pos) = slots.binary_search_by(|probe| cmp_datum(probe, value)) {
        slots.remove(pos);
    }
}

/// MIN over non-null values.
///
/// Retraction can expose the second-smallest value, so the accumulator keeps
/// the full in-window value multiset, sorted ascending.
#[derive(Debug, Clone, Copy, Default)]
pub struct MinAggregate;

impl AggregateFunction for MinAggregate {
    fn create_accumulator(&self) -> Accumulator {
        Accumulator::default()
    }

    fn accumulate(&self, acc: &mut Accumulator, value: &Datum) {
        if !value.is_null() {
            multiset_insert(acc, value);
        }
    }

    fn retract(&self, acc: &mut Accumulator, value: &Datum) {
        if !value.is_null() {
            multiset_remove(acc, value);
        }
    }

    fn value(&self, acc: &Accumulator) -> Datum {
        acc.slots().first().cloned().unwrap_or(Datum::Null)
    }
}

/// MAX over non-null values.
///
/// Same multiset layout as [`MinAggregate`], read from the other end.
#[derive(Debug, Clone, Copy, Default)]
pub struct MaxAggregate;

impl AggregateFunction for MaxAggregate {
    fn create_accumulator(&self) -> Accumulator {
        Accumulator::default()
    }

    fn accumulate(&self, acc: &mut Accumulator, value: &Datum) {
        if !value.is_null() {
            multiset_insert(acc, value);
        }
    }

    fn retract(&self, acc: &mut Accumulator, value: &Datum) {
        if !value.is_null() {
            multiset_remove(acc, value);
        }
    }

    fn value(&self, acc: &Accumulator) -> Datum {
        acc.slots().last().cloned().unwrap_or(Datum::Null)
    }
}
