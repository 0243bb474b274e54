//! Exec batches: immutable horizontal slices of a columnar relation.
//!
//! A batch column is either a fully materialized array or a scalar logically
//! broadcast to the batch length. Batches carry no schema; the owning plan
//! edge does.

use arrow::array::{Array, ArrayRef, BooleanArray};
use arrow::compute::filter;
use arrow_schema::DataType;
use brook_common::{BrookError, Result};

use crate::scalar::ScalarValue;

/// A batch column: a materialized array or a broadcast scalar.
#[derive(Debug, Clone)]
pub enum Datum {
    /// Fully materialized column.
    Array(ArrayRef),
    /// Scalar broadcast to the batch length.
    Scalar(ScalarValue),
}

impl PartialEq for Datum {
    /// Arrays compare structurally; a scalar never equals an array, so tests
    /// can distinguish broadcast from materialized outputs.
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Array(a), Self::Array(b)) => a.to_data() == b.to_data(),
            (Self::Scalar(a), Self::Scalar(b)) => a == b,
            _ => false,
        }
    }
}

impl Datum {
    /// Data type of the column, `None` for an untyped null scalar.
    pub fn data_type(&self) -> Option<DataType> {
        match self {
            Self::Array(a) => Some(a.data_type().clone()),
            Self::Scalar(s) => s.data_type(),
        }
    }

    /// True if this datum is a broadcast scalar.
    pub fn is_scalar(&self) -> bool {
        matches!(self, Self::Scalar(_))
    }

    /// Borrow the array payload, if materialized.
    pub fn as_array(&self) -> Option<&ArrayRef> {
        match self {
            Self::Array(a) => Some(a),
            Self::Scalar(_) => None,
        }
    }

    /// Materialize the column as an array of `len` rows.
    pub fn to_array(&self, len: usize) -> Result<ArrayRef> {
        match self {
            Self::Array(a) => {
                if a.len() != len {
                    return Err(BrookError::Execution(format!(
                        "array length {} does not match batch length {len}",
                        a.len()
                    )));
                }
                Ok(a.clone())
            }
            Self::Scalar(s) => s.to_array(len),
        }
    }
}

impl From<ArrayRef> for Datum {
    fn from(a: ArrayRef) -> Self {
        Self::Array(a)
    }
}

impl From<ScalarValue> for Datum {
    fn from(s: ScalarValue) -> Self {
        Self::Scalar(s)
    }
}

/// An immutable horizontal slice of a relation.
///
/// Invariant: every array-valued column has `length` rows; scalar columns are
/// logically broadcast `length` times.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecBatch {
    /// Ordered columns.
    pub values: Vec<Datum>,
    /// Row count.
    pub length: usize,
}

impl ExecBatch {
    /// Build a batch, checking the array-length invariant.
    pub fn try_new(values: Vec<Datum>, length: usize) -> Result<Self> {
        for (idx, value) in values.iter().enumerate() {
            if let Datum::Array(a) = value {
                if a.len() != length {
                    return Err(BrookError::Invalid(format!(
                        "column {idx} has {} rows, batch declares {length}",
                        a.len()
                    )));
                }
            }
        }
        Ok(Self { values, length })
    }

    /// Build a batch from materialized arrays; the length comes from the first.
    pub fn from_arrays(arrays: Vec<ArrayRef>) -> Result<Self> {
        let length = arrays.first().map(|a| a.len()).unwrap_or(0);
        Self::try_new(arrays.into_iter().map(Datum::Array).collect(), length)
    }

    /// Number of columns.
    pub fn num_values(&self) -> usize {
        self.values.len()
    }

    /// Borrow column `i`.
    pub fn column(&self, i: usize) -> &Datum {
        &self.values[i]
    }

    /// Keep the rows where `mask` is true (nulls drop the row).
    ///
    /// Array columns are filtered; scalar columns stay scalar at the reduced
    /// length. The selected count may be zero; empty batches are valid.
    pub fn filter_rows(&self, mask: &BooleanArray) -> Result<ExecBatch> {
        if mask.len() != self.length {
            return Err(BrookError::Execution(format!(
                "filter mask length {} does not match batch length {}",
                mask.len(),
                self.length
            )));
        }
        let selected = mask.true_count();
        let mut values = Vec::with_capacity(self.values.len());
        for value in &self.values {
            match value {
                Datum::Array(a) => {
                    let filtered = filter(a.as_ref(), mask)
                        .map_err(|e| BrookError::Execution(format!("filter batch failed: {e}")))?;
                    values.push(Datum::Array(filtered));
                }
                Datum::Scalar(s) => values.push(Datum::Scalar(s.clone())),
            }
        }
        ExecBatch::try_new(values, selected)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow::array::{BooleanArray, Int32Array};

    use super::*;

    #[test]
    fn length_invariant_is_enforced() {
        let arr: ArrayRef = Arc::new(Int32Array::from(vec![1, 2, 3]));
        let err = ExecBatch::try_new(vec![Datum::Array(arr)], 2).expect_err("bad length");
        assert!(matches!(err, BrookError::Invalid(_)));
    }

    #[test]
    fn filter_keeps_scalars_broadcast() {
        let arr: ArrayRef = Arc::new(Int32Array::from(vec![Some(1), None, Some(3)]));
        let batch = ExecBatch::try_new(
            vec![Datum::Array(arr), Datum::Scalar(ScalarValue::Utf8("tag".into()))],
            3,
        )
        .expect("batch");

        let mask = BooleanArray::from(vec![Some(true), Some(false), None]);
        let out = batch.filter_rows(&mask).expect("filtered");
        assert_eq!(out.length, 1);
        assert!(out.values[1].is_scalar());
    }

    #[test]
    fn scalar_and_array_datums_are_distinct() {
        let arr: ArrayRef = Arc::new(Int32Array::from(vec![5]));
        assert_ne!(Datum::Array(arr), Datum::Scalar(ScalarValue::Int32(5)));
    }
}
