//! Index: position of the first occurrence of a search value.

use std::any::Any;

use arrow::array::Array;
use arrow_schema::DataType;
use brook_common::{BrookError, Result};

use crate::batch::Datum;
use crate::scalar::ScalarValue;

use super::{downcast_state, scalar_representable, AggregateKernel, IndexOptions};

/// Linear-search index kernel: first match position or -1.
///
/// The state tracks how many rows it has seen, so partition merges can offset
/// a later partition's match by the earlier partitions' row counts.
#[derive(Debug)]
pub struct IndexKernel {
    target: ScalarValue,
    seen: i64,
    found: i64,
}

impl IndexKernel {
    pub(crate) fn try_new(options: IndexOptions, input_type: &DataType) -> Result<Self> {
        if options.value.is_null() {
            return Err(BrookError::Invalid(
                "index requires a non-null search value".to_string(),
            ));
        }
        if !scalar_representable(input_type) {
            return Err(BrookError::NotImplemented(format!(
                "index over {input_type:?}"
            )));
        }
        if options.value.data_type().as_ref() != Some(input_type) {
            return Err(BrookError::TypeError(format!(
                "index search value {} does not match input type {input_type:?}",
                options.value
            )));
        }
        Ok(Self {
            target: options.value,
            seen: 0,
            found: -1,
        })
    }
}

impl AggregateKernel for IndexKernel {
    fn consume(&mut self, input: &Datum, length: usize) -> Result<()> {
        match input {
            Datum::Array(a) => {
                if self.found < 0 {
                    for row in 0..a.len() {
                        if !a.is_null(row)
                            && ScalarValue::try_from_array(a, row)? == self.target
                        {
                            self.found = self.seen + row as i64;
                            break;
                        }
                    }
                }
                self.seen += a.len() as i64;
            }
            Datum::Scalar(s) => {
                if self.found < 0 && length > 0 && *s == self.target {
                    self.found = self.seen;
                }
                self.seen += length as i64;
            }
        }
        Ok(())
    }

    fn merge_from(&mut self, other: Box<dyn AggregateKernel>) -> Result<()> {
        let other = downcast_state::<Self>(other)?;
        if self.found < 0 && other.found >= 0 {
            self.found = self.seen + other.found;
        }
        self.seen += other.seen;
        Ok(())
    }

    fn finalize(&mut self) -> Result<Datum> {
        Ok(Datum::Scalar(ScalarValue::Int64(self.found)))
    }

    fn out_type(&self) -> DataType {
        DataType::Int64
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow::array::Int32Array;

    use super::*;

    fn kernel_for(value: i32) -> IndexKernel {
        IndexKernel::try_new(
            IndexOptions {
                value: ScalarValue::Int32(value),
            },
            &DataType::Int32,
        )
        .expect("kernel")
    }

    #[test]
    fn finds_first_match_across_batches() {
        let mut kernel = kernel_for(6);
        kernel
            .consume(&Datum::Array(Arc::new(Int32Array::from(vec![4, 5]))), 2)
            .expect("consume");
        kernel
            .consume(&Datum::Array(Arc::new(Int32Array::from(vec![6, 6]))), 2)
            .expect("consume");
        assert_eq!(
            kernel.finalize().expect("finalize"),
            Datum::Scalar(ScalarValue::Int64(2))
        );
    }

    #[test]
    fn missing_value_yields_minus_one() {
        let mut kernel = kernel_for(9);
        kernel
            .consume(&Datum::Array(Arc::new(Int32Array::from(vec![4, 5]))), 2)
            .expect("consume");
        assert_eq!(
            kernel.finalize().expect("finalize"),
            Datum::Scalar(ScalarValue::Int64(-1))
        );
    }

    #[test]
    fn merge_offsets_later_partitions() {
        let mut left = kernel_for(6);
        left.consume(&Datum::Array(Arc::new(Int32Array::from(vec![4, 5, 4]))), 3)
            .expect("consume");
        let mut right = kernel_for(6);
        right
            .consume(&Datum::Array(Arc::new(Int32Array::from(vec![5, 6]))), 2)
            .expect("consume");
        left.merge_from(Box::new(right)).expect("merge");
        assert_eq!(
            left.finalize().expect("finalize"),
            Datum::Scalar(ScalarValue::Int64(4))
        );
    }

    #[test]
    fn type_mismatch_is_rejected() {
        let err = IndexKernel::try_new(
            IndexOptions {
                value: ScalarValue::Int64(6),
            },
            &DataType::Int32,
        )
        .expect_err("mismatch");
        assert!(matches!(err, BrookError::TypeError(_)));
    }
}
