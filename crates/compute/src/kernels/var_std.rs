//! Variance and standard deviation.
//!
//! The accumulator is `(count, mean, m2)` with `m2 = sum((x - mean)^2)`, which
//! merges across partitions without precision loss:
//!
//! `n = n1 + n2`
//! `mean = (n1*mean1 + n2*mean2) / n`
//! `m2 = m2_1 + m2_2 + (mean1 - mean2)^2 * n1*n2 / n`
//!
//! Floats and integers wider than 4 bytes use a two-pass computation per
//! consumed array: an exact widened sum (f64 for floats, i128 for wide
//! integers) yields the mean, then a second pass accumulates m2 against it.
//! Narrow integers use a one-pass integer algorithm over slices short enough
//! that the intermediate sums cannot overflow.

use std::any::Any;

use arrow::array::{Array, ArrayRef};
use arrow_schema::DataType;
use brook_common::{BrookError, Result};

use crate::batch::Datum;
use crate::scalar::ScalarValue;

use super::{
    downcast_state, for_each_valid_float, for_each_valid_signed, for_each_valid_unsigned,
    AggregateKernel, VarianceOptions,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VarOrStd {
    Var,
    Std,
}

#[derive(Debug, Clone, Copy, Default)]
struct VarStdState {
    count: i64,
    mean: f64,
    m2: f64,
}

impl VarStdState {
    fn merge(&mut self, other: VarStdState) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = other;
            return;
        }
        let n1 = self.count as f64;
        let n2 = other.count as f64;
        let n = n1 + n2;
        let delta = self.mean - other.mean;
        let mean = (n1 * self.mean + n2 * other.mean) / n;
        self.m2 += other.m2 + delta * delta * n1 * n2 / n;
        self.mean = mean;
        self.count += other.count;
    }
}

/// Variance/stddev kernel over one numeric input type.
#[derive(Debug)]
pub struct VarStdKernel {
    state: VarStdState,
    input_type: DataType,
    ddof: i32,
    return_type: VarOrStd,
}

impl VarStdKernel {
    /// Variance kernel.
    pub fn variance(options: VarianceOptions, input_type: &DataType) -> Result<Self> {
        Self::try_new(options, input_type, VarOrStd::Var)
    }

    /// Standard deviation kernel.
    pub fn stddev(options: VarianceOptions, input_type: &DataType) -> Result<Self> {
        Self::try_new(options, input_type, VarOrStd::Std)
    }

    fn try_new(
        options: VarianceOptions,
        input_type: &DataType,
        return_type: VarOrStd,
    ) -> Result<Self> {
        match input_type {
            DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32
            | DataType::UInt64
            | DataType::Float32
            | DataType::Float64 => Ok(Self {
                state: VarStdState::default(),
                input_type: input_type.clone(),
                ddof: options.ddof,
                return_type,
            }),
            other => Err(BrookError::NotImplemented(format!(
                "no variance/stddev implemented for {other:?}"
            ))),
        }
    }

    fn consume_array(&mut self, arr: &ArrayRef) -> Result<()> {
        let chunk = match &self.input_type {
            DataType::Float32 | DataType::Float64 => two_pass_float(arr)?,
            DataType::Int64 => two_pass_wide_signed(arr)?,
            DataType::UInt64 => two_pass_wide_unsigned(arr)?,
            DataType::Int8 | DataType::Int16 | DataType::Int32 => {
                one_pass_narrow(arr, byte_width(&self.input_type), true)?
            }
            DataType::UInt8 | DataType::UInt16 | DataType::UInt32 => {
                one_pass_narrow(arr, byte_width(&self.input_type), false)?
            }
            other => {
                return Err(BrookError::NotImplemented(format!(
                    "no variance/stddev implemented for {other:?}"
                )))
            }
        };
        self.state.merge(chunk);
        Ok(())
    }

    fn consume_scalar(&mut self, scalar: &ScalarValue, length: usize) -> Result<()> {
        if scalar.is_null() || length == 0 {
            return Ok(());
        }
        let value = scalar
            .as_f64()
            .ok_or_else(|| BrookError::TypeError(format!("scalar {scalar} is not numeric")))?;
        self.state.merge(VarStdState {
            count: length as i64,
            mean: value,
            m2: 0.0,
        });
        Ok(())
    }
}

impl AggregateKernel for VarStdKernel {
    fn consume(&mut self, input: &Datum, length: usize) -> Result<()> {
        match input {
            Datum::Array(arr) => self.consume_array(arr),
            Datum::Scalar(s) => self.consume_scalar(s, length),
        }
    }

    fn merge_from(&mut self, other: Box<dyn AggregateKernel>) -> Result<()> {
        let other = downcast_state::<Self>(other)?;
        self.state.merge(other.state);
        Ok(())
    }

    fn finalize(&mut self) -> Result<Datum> {
        if self.state.count <= self.ddof as i64 {
            return Ok(Datum::Scalar(ScalarValue::Null));
        }
        let var = self.state.m2 / (self.state.count - self.ddof as i64) as f64;
        let out = match self.return_type {
            VarOrStd::Var => var,
            VarOrStd::Std => var.sqrt(),
        };
        Ok(Datum::Scalar(ScalarValue::Float64(out)))
    }

    fn out_type(&self) -> DataType {
        DataType::Float64
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

fn byte_width(dt: &DataType) -> usize {
    match dt {
        DataType::Int8 | DataType::UInt8 => 1,
        DataType::Int16 | DataType::UInt16 => 2,
        _ => 4,
    }
}

fn two_pass_float(arr: &ArrayRef) -> Result<VarStdState> {
    let count = (arr.len() - arr.null_count()) as i64;
    if count == 0 {
        return Ok(VarStdState::default());
    }
    let mut sum = 0.0_f64;
    for_each_valid_float(arr, |v| sum += v)?;
    let mean = sum / count as f64;
    let mut m2 = 0.0_f64;
    for_each_valid_float(arr, |v| m2 += (v - mean) * (v - mean))?;
    Ok(VarStdState { count, mean, m2 })
}

fn two_pass_wide_signed(arr: &ArrayRef) -> Result<VarStdState> {
    let count = (arr.len() - arr.null_count()) as i64;
    if count == 0 {
        return Ok(VarStdState::default());
    }
    let mut sum = 0_i128;
    for_each_valid_signed(arr, |v| sum += v as i128)?;
    let mean = sum as f64 / count as f64;
    let mut m2 = 0.0_f64;
    for_each_valid_signed(arr, |v| {
        let d = v as f64 - mean;
        m2 += d * d;
    })?;
    Ok(VarStdState { count, mean, m2 })
}

fn two_pass_wide_unsigned(arr: &ArrayRef) -> Result<VarStdState> {
    let count = (arr.len() - arr.null_count()) as i64;
    if count == 0 {
        return Ok(VarStdState::default());
    }
    let mut sum = 0_i128;
    for_each_valid_unsigned(arr, |v| sum += v as i128)?;
    let mean = sum as f64 / count as f64;
    let mut m2 = 0.0_f64;
    for_each_valid_unsigned(arr, |v| {
        let d = v as f64 - mean;
        m2 += d * d;
    })?;
    Ok(VarStdState { count, mean, m2 })
}

/// One-pass integer algorithm over slices short enough that the running sum
/// cannot overflow: at most `2^(63 - 8*width)` elements per slice.
fn one_pass_narrow(arr: &ArrayRef, width: usize, signed: bool) -> Result<VarStdState> {
    let max_length = 1_usize << (63 - 8 * width);

    let mut state = VarStdState::default();
    let mut offset = 0;
    while offset < arr.len() {
        let len = max_length.min(arr.len() - offset);
        let slice = arr.slice(offset, len);
        offset += len;

        let count = (slice.len() - slice.null_count()) as i64;
        if count == 0 {
            continue;
        }
        let mut sum = 0_i64;
        let mut sum_sq = 0_i128;
        if signed {
            for_each_valid_signed(&slice, |v| {
                sum += v;
                sum_sq += (v as i128) * (v as i128);
            })?;
        } else {
            for_each_valid_unsigned(&slice, |v| {
                sum += v as i64;
                sum_sq += (v as i128) * (v as i128);
            })?;
        }
        let mean = sum as f64 / count as f64;
        let m2 = sum_sq as f64 - (sum as f64) * (sum as f64) / count as f64;
        state.merge(VarStdState { count, mean, m2 });
    }
    Ok(state)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow::array::{Float64Array, Int32Array, Int64Array};

    use super::*;

    fn float_array(values: Vec<f64>) -> Datum {
        Datum::Array(Arc::new(Float64Array::from(values)))
    }

    fn finalize_f64(kernel: &mut VarStdKernel) -> f64 {
        match kernel.finalize().expect("finalize") {
            Datum::Scalar(ScalarValue::Float64(v)) => v,
            other => panic!("expected float scalar, got {other:?}"),
        }
    }

    #[test]
    fn population_variance_and_stddev() {
        let mut var = VarStdKernel::variance(VarianceOptions::default(), &DataType::Float64)
            .expect("kernel");
        var.consume(&float_array(vec![5.0, 5.0, 5.0, 5.0, 6.0, 7.0]), 6)
            .expect("consume");
        assert_eq!(finalize_f64(&mut var), 0.5833333333333334);

        let mut std =
            VarStdKernel::stddev(VarianceOptions::default(), &DataType::Float64).expect("kernel");
        std.consume(&float_array(vec![5.0, 5.0, 5.0, 5.0, 6.0, 7.0]), 6)
            .expect("consume");
        assert_eq!(finalize_f64(&mut std), 0.7637626158259734);
    }

    #[test]
    fn broadcast_scalars_carry_multiplicity() {
        // [5, 5, 5] delivered as a broadcast scalar, then [5, 6, 7] as an array
        let mut var = VarStdKernel::variance(VarianceOptions::default(), &DataType::Float64)
            .expect("kernel");
        var.consume(&Datum::Scalar(ScalarValue::Float64(5.0)), 3)
            .expect("consume");
        var.consume(&float_array(vec![5.0, 6.0, 7.0]), 3)
            .expect("consume");
        assert!((finalize_f64(&mut var) - 0.5833333333333334).abs() < 1e-12);
    }

    #[test]
    fn partition_merges_match_single_fold() {
        let values: Vec<f64> = (0..200).map(|i| (i % 17) as f64 * 0.25).collect();

        let mut whole = VarStdKernel::variance(VarianceOptions { ddof: 1 }, &DataType::Float64)
            .expect("kernel");
        whole
            .consume(&float_array(values.clone()), values.len())
            .expect("consume");
        let expected = finalize_f64(&mut whole);

        for split in [1, 7, 100, 199] {
            let (a, b) = values.split_at(split);
            let mut left = VarStdKernel::variance(VarianceOptions { ddof: 1 }, &DataType::Float64)
                .expect("kernel");
            left.consume(&float_array(a.to_vec()), a.len()).expect("consume");
            let mut right =
                VarStdKernel::variance(VarianceOptions { ddof: 1 }, &DataType::Float64)
                    .expect("kernel");
            right.consume(&float_array(b.to_vec()), b.len()).expect("consume");
            left.merge_from(Box::new(right)).expect("merge");
            assert!((finalize_f64(&mut left) - expected).abs() < 1e-9);
        }
    }

    #[test]
    fn narrow_integers_use_exact_arithmetic() {
        let mut int_var = VarStdKernel::variance(VarianceOptions::default(), &DataType::Int32)
            .expect("kernel");
        int_var
            .consume(
                &Datum::Array(Arc::new(Int32Array::from(vec![5, 5, 5, 5, 6, 7]))),
                6,
            )
            .expect("consume");
        assert_eq!(finalize_f64(&mut int_var), 0.5833333333333334);

        let mut wide_var = VarStdKernel::variance(VarianceOptions::default(), &DataType::Int64)
            .expect("kernel");
        wide_var
            .consume(
                &Datum::Array(Arc::new(Int64Array::from(vec![5_i64, 5, 5, 5, 6, 7]))),
                6,
            )
            .expect("consume");
        assert_eq!(finalize_f64(&mut wide_var), 0.5833333333333334);
    }

    #[test]
    fn nulls_are_ignored() {
        let mut var = VarStdKernel::variance(VarianceOptions::default(), &DataType::Float64)
            .expect("kernel");
        var.consume(
            &Datum::Array(Arc::new(Float64Array::from(vec![
                Some(1.0),
                None,
                Some(3.0),
            ]))),
            3,
        )
        .expect("consume");
        assert_eq!(finalize_f64(&mut var), 1.0);
    }

    #[test]
    fn insufficient_count_yields_null() {
        let mut var = VarStdKernel::variance(VarianceOptions { ddof: 2 }, &DataType::Float64)
            .expect("kernel");
        var.consume(&float_array(vec![1.0, 2.0]), 2).expect("consume");
        assert_eq!(
            var.finalize().expect("finalize"),
            Datum::Scalar(ScalarValue::Null)
        );
    }

    #[test]
    fn half_float_is_not_implemented() {
        let err = VarStdKernel::variance(VarianceOptions::default(), &DataType::Float16)
            .expect_err("unsupported");
        assert!(matches!(err, BrookError::NotImplemented(_)));
    }
}
