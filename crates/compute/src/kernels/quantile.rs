//! Exact quantiles over buffered input.

use std::any::Any;
use std::sync::Arc;

use arrow::array::{ArrayRef, Float64Builder};
use arrow_schema::DataType;
use brook_common::{BrookError, Result};

use crate::batch::Datum;
use crate::scalar::ScalarValue;

use super::{
    downcast_state, for_each_valid_f64, number_class, AggregateKernel, QuantileInterpolation,
    QuantileOptions,
};

/// Buffers every valid value and sorts at finalize.
///
/// Output is a `Float64` array with one element per requested quantile; all
/// elements are null when no values were seen.
#[derive(Debug)]
pub struct QuantileKernel {
    options: QuantileOptions,
    values: Vec<f64>,
}

impl QuantileKernel {
    pub(crate) fn try_new(options: QuantileOptions, input_type: &DataType) -> Result<Self> {
        if number_class(input_type).is_none() {
            return Err(BrookError::NotImplemented(format!(
                "quantile over {input_type:?}"
            )));
        }
        for q in &options.q {
            if !(0.0..=1.0).contains(q) {
                return Err(BrookError::Invalid(format!(
                    "quantile q must be in [0, 1], got {q}"
                )));
            }
        }
        Ok(Self {
            options,
            values: Vec::new(),
        })
    }

    fn quantile_at(&self, q: f64) -> f64 {
        let n = self.values.len();
        let exact = q * (n - 1) as f64;
        let lower = exact.floor() as usize;
        let higher = exact.ceil() as usize;
        match self.options.interpolation {
            QuantileInterpolation::Lower => self.values[lower],
            QuantileInterpolation::Higher => self.values[higher],
            QuantileInterpolation::Nearest => self.values[exact.round() as usize],
            QuantileInterpolation::Midpoint => (self.values[lower] + self.values[higher]) / 2.0,
            QuantileInterpolation::Linear => {
                let frac = exact - lower as f64;
                self.values[lower] * (1.0 - frac) + self.values[higher] * frac
            }
        }
    }
}

impl AggregateKernel for QuantileKernel {
    fn consume(&mut self, input: &Datum, length: usize) -> Result<()> {
        match input {
            Datum::Array(a) => {
                let values = &mut self.values;
                for_each_valid_f64(a, |v| values.push(v))?;
            }
            Datum::Scalar(s) => {
                if !s.is_null() {
                    let v = s.as_f64().ok_or_else(|| {
                        BrookError::TypeError(format!("scalar {s} is not numeric"))
                    })?;
                    self.values.extend(std::iter::repeat(v).take(length));
                }
            }
        }
        Ok(())
    }

    fn merge_from(&mut self, other: Box<dyn AggregateKernel>) -> Result<()> {
        let other = downcast_state::<Self>(other)?;
        self.values.extend(other.values);
        Ok(())
    }

    fn finalize(&mut self) -> Result<Datum> {
        let mut out = Float64Builder::with_capacity(self.options.q.len());
        if self.values.is_empty() {
            for _ in &self.options.q {
                out.append_null();
            }
        } else {
            self.values.sort_by(|a, b| a.total_cmp(b));
            for &q in &self.options.q {
                out.append_value(self.quantile_at(q));
            }
        }
        let arr: ArrayRef = Arc::new(out.finish());
        Ok(Datum::Array(arr))
    }

    fn out_type(&self) -> DataType {
        DataType::Float64
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}
