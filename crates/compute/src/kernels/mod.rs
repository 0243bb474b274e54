//! Scalar aggregation kernels.
//!
//! Every kernel follows the same three-phase protocol:
//! 1. `consume` folds batches into partition-local state (any number of times);
//! 2. `merge_from` combines states from other partitions (associative and
//!    commutative, with a freshly built kernel as identity);
//! 3. `finalize` projects the state to an output datum, exactly once.
//!
//! Kernels are constructed per input type through [`make_kernel`]; unsupported
//! types yield `NotImplemented`.

use std::any::Any;

use arrow::array::{
    Array, ArrayRef, Float32Array, Float64Array, Int16Array, Int32Array, Int64Array, Int8Array,
    UInt16Array, UInt32Array, UInt64Array, UInt8Array,
};
use arrow_schema::DataType;
use brook_common::{BrookError, Result};
use serde::{Deserialize, Serialize};

use crate::batch::Datum;
use crate::scalar::ScalarValue;

mod basic;
mod index;
mod mode;
mod quantile;
mod tdigest;
mod var_std;

pub use index::IndexKernel;
pub use mode::ModeKernel;
pub use quantile::QuantileKernel;
pub use tdigest::TDigestKernel;
pub use var_std::VarStdKernel;

/// Partition-local aggregation state.
///
/// Lifecycle: fresh → consuming → merged → finalized. `consume` accepts both
/// array and broadcast-scalar inputs; for scalars the effective multiplicity
/// is the batch length. After `finalize` the kernel is spent and must be
/// dropped.
pub trait AggregateKernel: Send {
    /// Fold one batch column into the state.
    fn consume(&mut self, input: &Datum, length: usize) -> Result<()>;

    /// Combine another partition's state into this one.
    fn merge_from(&mut self, other: Box<dyn AggregateKernel>) -> Result<()>;

    /// Project the state to the kernel's output datum.
    fn finalize(&mut self) -> Result<Datum>;

    /// Declared output type.
    fn out_type(&self) -> DataType;

    /// Downcast support for [`AggregateKernel::merge_from`].
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

pub(crate) fn downcast_state<T: AggregateKernel + 'static>(
    other: Box<dyn AggregateKernel>,
) -> Result<Box<T>> {
    other
        .into_any()
        .downcast::<T>()
        .map_err(|_| BrookError::Execution("mismatched kernel states in merge".to_string()))
}

// =====================
// Options
// =====================

/// Null/count policy shared by the plain scalar aggregates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarAggregateOptions {
    /// Ignore null values. When false, a single null poisons the result.
    pub skip_nulls: bool,
    /// Minimum number of valid values below which the result is null.
    pub min_count: u32,
}

impl Default for ScalarAggregateOptions {
    fn default() -> Self {
        Self {
            skip_nulls: true,
            min_count: 1,
        }
    }
}

/// Options for `mode`: how many of the most common values to return.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeOptions {
    /// Number of distinct values returned, most common first.
    pub n: i64,
}

impl Default for ModeOptions {
    fn default() -> Self {
        Self { n: 1 }
    }
}

/// Options for `variance`/`stddev`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarianceOptions {
    /// Delta degrees of freedom; the divisor is `count - ddof`.
    pub ddof: i32,
}

impl Default for VarianceOptions {
    fn default() -> Self {
        Self { ddof: 0 }
    }
}

/// Interpolation applied when a quantile lands between two data points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuantileInterpolation {
    /// Linear interpolation between the bracketing values.
    Linear,
    /// The lower bracketing value.
    Lower,
    /// The higher bracketing value.
    Higher,
    /// The nearest bracketing value.
    Nearest,
    /// Mean of the bracketing values.
    Midpoint,
}

/// Options for the exact `quantile` kernel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantileOptions {
    /// Quantiles to compute, each in `[0, 1]`.
    pub q: Vec<f64>,
    /// Interpolation mode.
    pub interpolation: QuantileInterpolation,
}

impl Default for QuantileOptions {
    fn default() -> Self {
        Self {
            q: vec![0.5],
            interpolation: QuantileInterpolation::Linear,
        }
    }
}

/// Options for the approximate `tdigest` quantile kernel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TDigestOptions {
    /// Quantiles to compute, each in `[0, 1]`.
    pub q: Vec<f64>,
    /// Compression parameter; higher is more accurate and larger.
    pub delta: u32,
    /// Input buffer size before points are folded into the sketch.
    pub buffer_size: u32,
}

impl Default for TDigestOptions {
    fn default() -> Self {
        Self {
            q: vec![0.5],
            delta: 100,
            buffer_size: 500,
        }
    }
}

/// Options for `index`: the value to search for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexOptions {
    /// Value whose first occurrence position is returned.
    pub value: ScalarValue,
}

/// Per-function option payload carried by aggregate specs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AggregateOptions {
    /// Null/count policy for count/sum/product/mean/min/max/any/all.
    Scalar(ScalarAggregateOptions),
    /// `mode` options.
    Mode(ModeOptions),
    /// `variance`/`stddev` options.
    Variance(VarianceOptions),
    /// `quantile` options.
    Quantile(QuantileOptions),
    /// `tdigest` options.
    TDigest(TDigestOptions),
    /// `index` options.
    Index(IndexOptions),
}

impl Default for AggregateOptions {
    fn default() -> Self {
        Self::Scalar(ScalarAggregateOptions::default())
    }
}

// =====================
// Factory
// =====================

/// Build a kernel for `function` over `input_type`.
///
/// `options: None` selects the function's defaults, mirroring an unset options
/// payload in a declaration. A mismatched options variant is `Invalid`;
/// an unsupported input type is `NotImplemented`.
pub fn make_kernel(
    function: &str,
    options: Option<&AggregateOptions>,
    input_type: &DataType,
) -> Result<Box<dyn AggregateKernel>> {
    match function {
        "count" => Ok(Box::new(basic::CountKernel::new(scalar_options(
            function, options,
        )?))),
        "sum" => Ok(Box::new(basic::SumKernel::try_new(
            scalar_options(function, options)?,
            input_type,
            basic::SumOrProduct::Sum,
        )?)),
        "product" => Ok(Box::new(basic::SumKernel::try_new(
            scalar_options(function, options)?,
            input_type,
            basic::SumOrProduct::Product,
        )?)),
        "mean" => Ok(Box::new(basic::MeanKernel::try_new(
            scalar_options(function, options)?,
            input_type,
        )?)),
        "min" => Ok(Box::new(basic::MinMaxKernel::try_new(
            scalar_options(function, options)?,
            input_type,
            false,
        )?)),
        "max" => Ok(Box::new(basic::MinMaxKernel::try_new(
            scalar_options(function, options)?,
            input_type,
            true,
        )?)),
        "any" => Ok(Box::new(basic::AnyAllKernel::try_new(
            scalar_options(function, options)?,
            input_type,
            false,
        )?)),
        "all" => Ok(Box::new(basic::AnyAllKernel::try_new(
            scalar_options(function, options)?,
            input_type,
            true,
        )?)),
        "mode" => {
            let opts = match options {
                None => ModeOptions::default(),
                Some(AggregateOptions::Mode(o)) => o.clone(),
                Some(_) => return Err(wrong_options(function)),
            };
            Ok(Box::new(ModeKernel::try_new(opts, input_type)?))
        }
        "quantile" => {
            let opts = match options {
                None => QuantileOptions::default(),
                Some(AggregateOptions::Quantile(o)) => o.clone(),
                Some(_) => return Err(wrong_options(function)),
            };
            Ok(Box::new(QuantileKernel::try_new(opts, input_type)?))
        }
        "tdigest" => {
            let opts = match options {
                None => TDigestOptions::default(),
                Some(AggregateOptions::TDigest(o)) => o.clone(),
                Some(_) => return Err(wrong_options(function)),
            };
            Ok(Box::new(TDigestKernel::try_new(opts, input_type)?))
        }
        "index" => {
            let opts = match options {
                Some(AggregateOptions::Index(o)) => o.clone(),
                Some(_) => return Err(wrong_options(function)),
                None => {
                    return Err(BrookError::Invalid(
                        "index requires IndexOptions with a search value".to_string(),
                    ))
                }
            };
            Ok(Box::new(IndexKernel::try_new(opts, input_type)?))
        }
        "variance" => Ok(Box::new(VarStdKernel::variance(
            variance_options(function, options)?,
            input_type,
        )?)),
        "stddev" => Ok(Box::new(VarStdKernel::stddev(
            variance_options(function, options)?,
            input_type,
        )?)),
        other => Err(BrookError::Invalid(format!(
            "unknown aggregate function '{other}'"
        ))),
    }
}

fn scalar_options(
    function: &str,
    options: Option<&AggregateOptions>,
) -> Result<ScalarAggregateOptions> {
    match options {
        None => Ok(ScalarAggregateOptions::default()),
        Some(AggregateOptions::Scalar(o)) => Ok(o.clone()),
        Some(_) => Err(wrong_options(function)),
    }
}

fn variance_options(
    function: &str,
    options: Option<&AggregateOptions>,
) -> Result<VarianceOptions> {
    match options {
        None => Ok(VarianceOptions::default()),
        Some(AggregateOptions::Variance(o)) => Ok(o.clone()),
        Some(_) => Err(wrong_options(function)),
    }
}

fn wrong_options(function: &str) -> BrookError {
    BrookError::Invalid(format!("mismatched options payload for '{function}'"))
}

// =====================
// Typed visitors
// =====================

/// Number class a kernel accumulates into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NumberClass {
    /// Signed integers, widened to `i64`.
    Signed,
    /// Unsigned integers, widened to `u64`.
    Unsigned,
    /// Floats, widened to `f64`.
    Float,
}

pub(crate) fn number_class(dt: &DataType) -> Option<NumberClass> {
    match dt {
        DataType::Int8 | DataType::Int16 | DataType::Int32 | DataType::Int64 => {
            Some(NumberClass::Signed)
        }
        DataType::UInt8 | DataType::UInt16 | DataType::UInt32 | DataType::UInt64 => {
            Some(NumberClass::Unsigned)
        }
        DataType::Float32 | DataType::Float64 => Some(NumberClass::Float),
        _ => None,
    }
}

pub(crate) fn valid_count(arr: &ArrayRef) -> usize {
    arr.len() - arr.null_count()
}

/// Types whose elements round-trip through [`ScalarValue`]; kernels that hold
/// individual values (min/max, mode, index) are limited to these.
pub(crate) fn scalar_representable(dt: &DataType) -> bool {
    matches!(
        dt,
        DataType::Boolean
            | DataType::Int32
            | DataType::Int64
            | DataType::UInt64
            | DataType::Float64
            | DataType::Utf8
    )
}

fn expected_array(name: &str) -> BrookError {
    BrookError::TypeError(format!("expected {name} array"))
}

pub(crate) fn for_each_valid_signed(arr: &ArrayRef, mut f: impl FnMut(i64)) -> Result<()> {
    match arr.data_type() {
        DataType::Int8 => {
            let a = arr
                .as_any()
                .downcast_ref::<Int8Array>()
                .ok_or_else(|| expected_array("Int8"))?;
            for v in a.iter().flatten() {
                f(v as i64);
            }
        }
        DataType::Int16 => {
            let a = arr
                .as_any()
                .downcast_ref::<Int16Array>()
                .ok_or_else(|| expected_array("Int16"))?;
            for v in a.iter().flatten() {
                f(v as i64);
            }
        }
        DataType::Int32 => {
            let a = arr
                .as_any()
                .downcast_ref::<Int32Array>()
                .ok_or_else(|| expected_array("Int32"))?;
            for v in a.iter().flatten() {
                f(v as i64);
            }
        }
        DataType::Int64 => {
            let a = arr
                .as_any()
                .downcast_ref::<Int64Array>()
                .ok_or_else(|| expected_array("Int64"))?;
            for v in a.iter().flatten() {
                f(v);
            }
        }
        other => {
            return Err(BrookError::TypeError(format!(
                "expected signed integer array, got {other:?}"
            )))
        }
    }
    Ok(())
}

pub(crate) fn for_each_valid_unsigned(arr: &ArrayRef, mut f: impl FnMut(u64)) -> Result<()> {
    match arr.data_type() {
        DataType::UInt8 => {
            let a = arr
                .as_any()
                .downcast_ref::<UInt8Array>()
                .ok_or_else(|| expected_array("UInt8"))?;
            for v in a.iter().flatten() {
                f(v as u64);
            }
        }
        DataType::UInt16 => {
            let a = arr
                .as_any()
                .downcast_ref::<UInt16Array>()
                .ok_or_else(|| expected_array("UInt16"))?;
            for v in a.iter().flatten() {
                f(v as u64);
            }
        }
        DataType::UInt32 => {
            let a = arr
                .as_any()
                .downcast_ref::<UInt32Array>()
                .ok_or_else(|| expected_array("UInt32"))?;
            for v in a.iter().flatten() {
                f(v as u64);
            }
        }
        DataType::UInt64 => {
            let a = arr
                .as_any()
                .downcast_ref::<UInt64Array>()
                .ok_or_else(|| expected_array("UInt64"))?;
            for v in a.iter().flatten() {
                f(v);
            }
        }
        other => {
            return Err(BrookError::TypeError(format!(
                "expected unsigned integer array, got {other:?}"
            )))
        }
    }
    Ok(())
}

pub(crate) fn for_each_valid_float(arr: &ArrayRef, mut f: impl FnMut(f64)) -> Result<()> {
    match arr.data_type() {
        DataType::Float32 => {
            let a = arr
                .as_any()
                .downcast_ref::<Float32Array>()
                .ok_or_else(|| expected_array("Float32"))?;
            for v in a.iter().flatten() {
                f(v as f64);
            }
        }
        DataType::Float64 => {
            let a = arr
                .as_any()
                .downcast_ref::<Float64Array>()
                .ok_or_else(|| expected_array("Float64"))?;
            for v in a.iter().flatten() {
                f(v);
            }
        }
        other => {
            return Err(BrookError::TypeError(format!(
                "expected float array, got {other:?}"
            )))
        }
    }
    Ok(())
}

/// Visit every valid element of any numeric array as `f64`.
pub(crate) fn for_each_valid_f64(arr: &ArrayRef, mut f: impl FnMut(f64)) -> Result<()> {
    match number_class(arr.data_type()) {
        Some(NumberClass::Signed) => for_each_valid_signed(arr, |v| f(v as f64)),
        Some(NumberClass::Unsigned) => for_each_valid_unsigned(arr, |v| f(v as f64)),
        Some(NumberClass::Float) => for_each_valid_float(arr, f),
        None => Err(BrookError::TypeError(format!(
            "expected numeric array, got {:?}",
            arr.data_type()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn unknown_function_is_invalid() {
        let err = match make_kernel("median", None, &DataType::Int32) {
            Err(e) => e,
            Ok(_) => panic!("unknown"),
        };
        assert!(matches!(err, BrookError::Invalid(_)));
    }

    #[test]
    fn mismatched_options_are_invalid() {
        let opts = AggregateOptions::Mode(ModeOptions::default());
        let err = match make_kernel("sum", Some(&opts), &DataType::Int32) {
            Err(e) => e,
            Ok(_) => panic!("mismatch"),
        };
        assert!(matches!(err, BrookError::Invalid(_)));
    }

    #[test]
    fn consume_then_merge_matches_single_fold() {
        // associativity: folding partitions then merging equals one fold
        let whole: ArrayRef = Arc::new(Int64Array::from(vec![1_i64, 2, 3, 4, 5, 6]));
        let left: ArrayRef = Arc::new(Int64Array::from(vec![1_i64, 2]));
        let right: ArrayRef = Arc::new(Int64Array::from(vec![3_i64, 4, 5, 6]));

        for function in ["count", "sum", "mean", "variance", "min", "max"] {
            let mut base = make_kernel(function, None, &DataType::Int64).expect("kernel");
            base.consume(&Datum::Array(left.clone()), 2).expect("consume");
            let mut other = make_kernel(function, None, &DataType::Int64).expect("kernel");
            other
                .consume(&Datum::Array(right.clone()), 4)
                .expect("consume");
            base.merge_from(other).expect("merge");

            let mut single = make_kernel(function, None, &DataType::Int64).expect("kernel");
            single.consume(&Datum::Array(whole.clone()), 6).expect("consume");

            assert_eq!(
                base.finalize().expect("finalize"),
                single.finalize().expect("finalize"),
                "partitioned fold diverged for {function}"
            );
        }
    }

    #[test]
    fn fresh_state_is_merge_identity() {
        let arr: ArrayRef = Arc::new(Int64Array::from(vec![7_i64, 9]));
        let mut consumed = make_kernel("sum", None, &DataType::Int64).expect("kernel");
        consumed.consume(&Datum::Array(arr), 2).expect("consume");
        let fresh = make_kernel("sum", None, &DataType::Int64).expect("kernel");
        consumed.merge_from(fresh).expect("merge");
        assert_eq!(
            consumed.finalize().expect("finalize"),
            Datum::Scalar(ScalarValue::Int64(16))
        );
    }
}
