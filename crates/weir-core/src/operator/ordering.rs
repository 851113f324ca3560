//! # Row Ordering
//!
//! The comparator seam between the plan layer and the sort operators.
//!
//! The operators treat the comparator as opaque: any [`RowComparator`]
//! implementation works. The plan layer's common case, `ORDER BY` over
//! named columns with per-column direction and null placement, is covered
//! by [`ColumnComparator`], which resolves column names against the input
//! schema at construction and fails fast on unknown names.

use super::{Datum, OperatorError, Row};
use arrow_schema::Schema;
use std::cmp::Ordering;

/// Total order between two datums of the same column.
///
/// `Null` sorts before every value. Numeric datums compare across
/// `Int64`/`Float64` by widening; floats use IEEE total ordering so `NaN`
/// has a stable position. Datums of unrelated types fall back to a fixed
/// type rank; a well-typed column never hits that case.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub(crate) fn cmp_datum(a: &Datum, b: &Datum) -> Ordering {
    match (a, b) {
        (Datum::Null, Datum::Null) => Ordering::Equal,
        (Datum::Null, _) => Ordering::Less,
        (_, Datum::Null) => Ordering::Greater,
        (Datum::Bool(x), Datum::Bool(y)) => x.cmp(y),
        (Datum::Int64(x), Datum::Int64(y)) | (Datum::Timestamp(x), Datum::Timestamp(y)) => {
            x.cmp(y)
        }
        (Datum::Float64(x), Datum::Float64(y)) => x.total_cmp(y),
        (Datum::Int64(x), Datum::Float64(y)) => (*x as f64).total_cmp(y),
        (Datum::Float64(x), Datum::Int64(y)) => x.total_cmp(&(*y as f64)),
        (Datum::Utf8(x), Datum::Utf8(y)) => x.cmp(y),
        (x, y) => type_rank(x).cmp(&type_rank(y)),
    }
}

fn type_rank(datum: &Datum) -> u8 {
    match datum {
        Datum::Null => 0,
        Datum::Bool(_) => 1,
        Datum::Int64(_) => 2,
        Datum::Float64(_) => 3,
        Datum::Utf8(_) => 4,
        Datum::Timestamp(_) => 5,
    }
}

/// Trait for comparing two rows of the same schema.
///
/// Supplied by the plan layer as an opaque value object; the operators only
/// ever call [`compare`](RowComparator::compare). Sorting against a
/// comparator is stable, so rows comparing equal keep arrival order.
pub trait RowComparator: Send {
    /// Compares two rows.
    fn compare(&self, a: &Row, b: &Row) -> Ordering;
}

/// Configuration for one sort column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortColumn {
    /// Column name in the input schema
    pub column_name: String,
    /// Sort in descending order
    pub descending: bool,
    /// Place NULL values before non-NULL values
    pub nulls_first: bool,
}

impl SortColumn {
    /// Creates an ascending sort column.
    #[must_use]
    pub fn ascending(name: impl Into<String>) -> Self {
        Self {
            column_name: name.into(),
            descending: false,
            nulls_first: false,
        }
    }

    /// Creates a descending sort column.
    #[must_use]
    pub fn descending(name: impl Into<String>) -> Self {
        Self {
            column_name: name.into(),
            descending: true,
            nulls_first: false,
        }
    }

    /// Sets whether nulls should sort first.
    #[must_use]
    pub fn with_nulls_first(mut self, nulls_first: bool) -> Self {
        self.nulls_first = nulls_first;
        self
    }
}

/// A [`RowComparator`] over named columns of the input schema.
///
/// Column names are resolved to positions once, at construction; comparison
/// itself is allocation-free.
pub struct ColumnComparator {
    /// Resolved (field position, column spec) pairs, in priority order.
    columns: Vec<(usize, SortColumn)>,
}

impl ColumnComparator {
    /// Resolves the sort columns against the input schema.
    ///
    /// # Errors
    ///
    /// Returns `OperatorError::InvalidConfig` if the column list is empty or
    /// a name does not exist in the schema.
    pub fn try_new(schema: &Schema, columns: Vec<SortColumn>) -> Result<Self, OperatorError> {
        if columns.is_empty() {
            return Err(OperatorError::InvalidConfig(
                "sort column list is empty".to_string(),
            ));
        }
        let mut resolved = Vec::with_capacity(columns.len());
        for col in columns {
            let index = schema.index_of(&col.column_name).map_err(|_| {
                OperatorError::InvalidConfig(format!(
                    "sort column not in input schema: {}",
                    col.column_name
                ))
            })?;
            resolved.push((index, col));
        }
        Ok(Self { columns: resolved })
    }
}

impl RowComparator for ColumnComparator {
    fn compare(&self, a: &Row, b: &Row) -> Ordering {
        for (index, col) in &self.columns {
            let da = a.field(*index);
            let db = b.field(*index);

            let ord = match (da.is_null(), db.is_null()) {
                (true, true) => Ordering::Equal,
                (true, false) => {
                    if col.nulls_first {
                        Ordering::Less
                    } else {
                        Ordering::Greater
                    }
                }
                (false, true) => {
                    if col.nulls_first {
                        Ordering::Greater
                    } else {
                        Ordering::Less
                    }
                }
                (false, false) => {
                    let natural = cmp_datum(da, db);
                    if col.descending {
                        natural.reverse()
                    } else {
                        natural
                    }
                }
            };

            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }
}
