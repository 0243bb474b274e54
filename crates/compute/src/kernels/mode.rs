//! Mode: the top-n most common values.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use arrow::array::{Array, StructArray};
use arrow_schema::{DataType, Field, Fields};
use brook_common::{BrookError, Result};

use crate::batch::Datum;
use crate::scalar::{scalars_to_array, ScalarValue};

use super::{downcast_state, scalar_representable, AggregateKernel, ModeOptions};

/// Exact value-count mode kernel.
///
/// Output is a struct array `{ mode: T, count: Int64 }` of up to `n` rows,
/// most common value first; ties break toward the smaller value. Nulls are
/// ignored.
#[derive(Debug)]
pub struct ModeKernel {
    counts: HashMap<ScalarValue, i64>,
    n: usize,
    value_type: DataType,
}

impl ModeKernel {
    pub(crate) fn try_new(options: ModeOptions, input_type: &DataType) -> Result<Self> {
        if !scalar_representable(input_type) {
            return Err(BrookError::NotImplemented(format!(
                "mode over {input_type:?}"
            )));
        }
        if options.n < 0 {
            return Err(BrookError::Invalid(format!(
                "mode requires n >= 0, got {}",
                options.n
            )));
        }
        Ok(Self {
            counts: HashMap::new(),
            n: options.n as usize,
            value_type: input_type.clone(),
        })
    }

    fn struct_fields(&self) -> Fields {
        Fields::from(vec![
            Field::new("mode", self.value_type.clone(), true),
            Field::new("count", DataType::Int64, true),
        ])
    }
}

impl AggregateKernel for ModeKernel {
    fn consume(&mut self, input: &Datum, length: usize) -> Result<()> {
        match input {
            Datum::Array(a) => {
                for row in 0..a.len() {
                    if !a.is_null(row) {
                        let value = ScalarValue::try_from_array(a, row)?;
                        *self.counts.entry(value).or_insert(0) += 1;
                    }
                }
            }
            Datum::Scalar(s) => {
                if !s.is_null() {
                    *self.counts.entry(s.clone()).or_insert(0) += length as i64;
                }
            }
        }
        Ok(())
    }

    fn merge_from(&mut self, other: Box<dyn AggregateKernel>) -> Result<()> {
        let other = downcast_state::<Self>(other)?;
        for (value, count) in other.counts {
            *self.counts.entry(value).or_insert(0) += count;
        }
        Ok(())
    }

    fn finalize(&mut self) -> Result<Datum> {
        let mut entries: Vec<(ScalarValue, i64)> = self.counts.drain().collect();
        entries.sort_by(|a, b| {
            b.1.cmp(&a.1).then_with(|| {
                a.0.partial_cmp(&b.0)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
        });
        entries.truncate(self.n);

        let values: Vec<ScalarValue> = entries.iter().map(|(v, _)| v.clone()).collect();
        let counts: Vec<ScalarValue> = entries.iter().map(|(_, c)| ScalarValue::Int64(*c)).collect();

        let fields = self.struct_fields();
        let modes = scalars_to_array(&values, &self.value_type)?;
        let counts = scalars_to_array(&counts, &DataType::Int64)?;
        let out = StructArray::try_new(fields, vec![modes, counts], None)
            .map_err(|e| BrookError::Execution(format!("mode output build failed: {e}")))?;
        Ok(Datum::Array(Arc::new(out)))
    }

    fn out_type(&self) -> DataType {
        DataType::Struct(self.struct_fields())
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

#[cfg(test)]
mod tests {
    use arrow::array::Int32Array;

    use super::*;

    #[test]
    fn ties_break_toward_smaller_values() {
        let mut kernel =
            ModeKernel::try_new(ModeOptions { n: 2 }, &DataType::Int32).expect("kernel");
        let arr = Datum::Array(Arc::new(Int32Array::from(vec![7, 3, 7, 3, 9])));
        kernel.consume(&arr, 5).expect("consume");

        let out = match kernel.finalize().expect("finalize") {
            Datum::Array(a) => a,
            other => panic!("expected array, got {other:?}"),
        };
        let out = out.as_any().downcast_ref::<StructArray>().expect("struct");
        let modes = out
            .column(0)
            .as_any()
            .downcast_ref::<Int32Array>()
            .expect("modes");
        // 3 and 7 both occur twice; 3 wins the tie
        assert_eq!(modes.value(0), 3);
        assert_eq!(modes.value(1), 7);
    }

    #[test]
    fn merge_combines_counts() {
        let mut a = ModeKernel::try_new(ModeOptions { n: 1 }, &DataType::Int32).expect("kernel");
        a.consume(&Datum::Array(Arc::new(Int32Array::from(vec![1, 2]))), 2)
            .expect("consume");
        let mut b = ModeKernel::try_new(ModeOptions { n: 1 }, &DataType::Int32).expect("kernel");
        b.consume(&Datum::Array(Arc::new(Int32Array::from(vec![2, 3]))), 2)
            .expect("consume");
        a.merge_from(Box::new(b)).expect("merge");

        let out = match a.finalize().expect("finalize") {
            Datum::Array(arr) => arr,
            other => panic!("expected array, got {other:?}"),
        };
        let out = out.as_any().downcast_ref::<StructArray>().expect("struct");
        let modes = out
            .column(0)
            .as_any()
            .downcast_ref::<Int32Array>()
            .expect("modes");
        assert_eq!(modes.value(0), 2);
    }
}
