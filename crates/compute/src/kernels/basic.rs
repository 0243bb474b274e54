//! Count, sum, product, mean, min/max, and any/all kernels.
//!
//! Reductions whose result widens accumulate into the widest type of their
//! class: signed integers into `i64`, unsigned into `u64`, floats into `f64`.
//! Integer accumulation wraps on overflow.

use std::any::Any;

use arrow::array::{Array, BooleanArray};
use arrow_schema::DataType;
use brook_common::{BrookError, Result};

use crate::batch::Datum;
use crate::scalar::ScalarValue;

use super::{
    downcast_state, for_each_valid_f64, for_each_valid_float, for_each_valid_signed,
    for_each_valid_unsigned, number_class, valid_count, AggregateKernel, NumberClass,
    ScalarAggregateOptions,
};

// =====================
// count
// =====================

/// Counts valid elements (or all elements when `skip_nulls` is false).
#[derive(Debug)]
pub struct CountKernel {
    opts: ScalarAggregateOptions,
    count: i64,
}

impl CountKernel {
    pub(crate) fn new(opts: ScalarAggregateOptions) -> Self {
        Self { opts, count: 0 }
    }
}

impl AggregateKernel for CountKernel {
    fn consume(&mut self, input: &Datum, length: usize) -> Result<()> {
        match input {
            Datum::Array(a) => {
                self.count += if self.opts.skip_nulls {
                    valid_count(a) as i64
                } else {
                    a.len() as i64
                };
            }
            Datum::Scalar(s) => {
                if !s.is_null() || !self.opts.skip_nulls {
                    self.count += length as i64;
                }
            }
        }
        Ok(())
    }

    fn merge_from(&mut self, other: Box<dyn AggregateKernel>) -> Result<()> {
        let other = downcast_state::<Self>(other)?;
        self.count += other.count;
        Ok(())
    }

    fn finalize(&mut self) -> Result<Datum> {
        Ok(Datum::Scalar(ScalarValue::Int64(self.count)))
    }

    fn out_type(&self) -> DataType {
        DataType::Int64
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

// =====================
// sum / product
// =====================

/// Which reduction a [`SumKernel`] performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SumOrProduct {
    /// Additive fold starting at 0.
    Sum,
    /// Multiplicative fold starting at 1.
    Product,
}

#[derive(Debug, Clone, Copy)]
enum NumericAcc {
    Signed(i64),
    Unsigned(u64),
    Float(f64),
}

/// Widening sum/product over any numeric input.
#[derive(Debug)]
pub struct SumKernel {
    opts: ScalarAggregateOptions,
    op: SumOrProduct,
    acc: NumericAcc,
    valid: u64,
    nulls_seen: bool,
}

impl SumKernel {
    pub(crate) fn try_new(
        opts: ScalarAggregateOptions,
        input_type: &DataType,
        op: SumOrProduct,
    ) -> Result<Self> {
        let identity = |v: i64| match op {
            SumOrProduct::Sum => 0,
            SumOrProduct::Product => v,
        };
        let acc = match number_class(input_type) {
            Some(NumberClass::Signed) => NumericAcc::Signed(identity(1)),
            Some(NumberClass::Unsigned) => NumericAcc::Unsigned(identity(1) as u64),
            Some(NumberClass::Float) => NumericAcc::Float(identity(1) as f64),
            None => {
                return Err(BrookError::NotImplemented(format!(
                    "{} over {input_type:?}",
                    name_of(op)
                )))
            }
        };
        Ok(Self {
            opts,
            op,
            acc,
            valid: 0,
            nulls_seen: false,
        })
    }

    fn fold_signed(&mut self, v: i64) {
        if let NumericAcc::Signed(acc) = &mut self.acc {
            *acc = match self.op {
                SumOrProduct::Sum => acc.wrapping_add(v),
                SumOrProduct::Product => acc.wrapping_mul(v),
            };
        }
    }

    fn fold_unsigned(&mut self, v: u64) {
        if let NumericAcc::Unsigned(acc) = &mut self.acc {
            *acc = match self.op {
                SumOrProduct::Sum => acc.wrapping_add(v),
                SumOrProduct::Product => acc.wrapping_mul(v),
            };
        }
    }

    fn fold_float(&mut self, v: f64) {
        if let NumericAcc::Float(acc) = &mut self.acc {
            *acc = match self.op {
                SumOrProduct::Sum => *acc + v,
                SumOrProduct::Product => *acc * v,
            };
        }
    }
}

fn name_of(op: SumOrProduct) -> &'static str {
    match op {
        SumOrProduct::Sum => "sum",
        SumOrProduct::Product => "product",
    }
}

impl AggregateKernel for SumKernel {
    fn consume(&mut self, input: &Datum, length: usize) -> Result<()> {
        match input {
            Datum::Array(a) => {
                self.nulls_seen |= a.null_count() > 0;
                self.valid += valid_count(a) as u64;
                match self.acc {
                    NumericAcc::Signed(_) => for_each_valid_signed(a, |v| self.fold_signed(v))?,
                    NumericAcc::Unsigned(_) => {
                        for_each_valid_unsigned(a, |v| self.fold_unsigned(v))?
                    }
                    NumericAcc::Float(_) => for_each_valid_float(a, |v| self.fold_float(v))?,
                }
            }
            Datum::Scalar(s) => {
                if s.is_null() {
                    self.nulls_seen = true;
                    return Ok(());
                }
                self.valid += length as u64;
                match (self.acc, s) {
                    (NumericAcc::Signed(_), ScalarValue::Int32(v)) => {
                        self.fold_scalar_signed(*v as i64, length)
                    }
                    (NumericAcc::Signed(_), ScalarValue::Int64(v)) => {
                        self.fold_scalar_signed(*v, length)
                    }
                    (NumericAcc::Unsigned(_), ScalarValue::UInt64(v)) => {
                        self.fold_scalar_unsigned(*v, length)
                    }
                    (NumericAcc::Float(_), v) => {
                        let v = v.as_f64().ok_or_else(|| scalar_type_error(v))?;
                        self.fold_scalar_float(v, length);
                    }
                    (_, v) => return Err(scalar_type_error(v)),
                }
            }
        }
        Ok(())
    }

    fn merge_from(&mut self, other: Box<dyn AggregateKernel>) -> Result<()> {
        let other = downcast_state::<Self>(other)?;
        self.valid += other.valid;
        self.nulls_seen |= other.nulls_seen;
        match (&mut self.acc, other.acc) {
            (NumericAcc::Signed(a), NumericAcc::Signed(b)) => {
                *a = match self.op {
                    SumOrProduct::Sum => a.wrapping_add(b),
                    SumOrProduct::Product => a.wrapping_mul(b),
                }
            }
            (NumericAcc::Unsigned(a), NumericAcc::Unsigned(b)) => {
                *a = match self.op {
                    SumOrProduct::Sum => a.wrapping_add(b),
                    SumOrProduct::Product => a.wrapping_mul(b),
                }
            }
            (NumericAcc::Float(a), NumericAcc::Float(b)) => {
                *a = match self.op {
                    SumOrProduct::Sum => *a + b,
                    SumOrProduct::Product => *a * b,
                }
            }
            _ => {
                return Err(BrookError::Execution(
                    "mismatched accumulator classes in merge".to_string(),
                ))
            }
        }
        Ok(())
    }

    fn finalize(&mut self) -> Result<Datum> {
        if self.valid < self.opts.min_count as u64
            || (!self.opts.skip_nulls && self.nulls_seen)
        {
            return Ok(Datum::Scalar(ScalarValue::Null));
        }
        Ok(Datum::Scalar(match self.acc {
            NumericAcc::Signed(v) => ScalarValue::Int64(v),
            NumericAcc::Unsigned(v) => ScalarValue::UInt64(v),
            NumericAcc::Float(v) => ScalarValue::Float64(v),
        }))
    }

    fn out_type(&self) -> DataType {
        match self.acc {
            NumericAcc::Signed(_) => DataType::Int64,
            NumericAcc::Unsigned(_) => DataType::UInt64,
            NumericAcc::Float(_) => DataType::Float64,
        }
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

impl SumKernel {
    fn fold_scalar_signed(&mut self, v: i64, length: usize) {
        match self.op {
            SumOrProduct::Sum => self.fold_signed(v.wrapping_mul(length as i64)),
            SumOrProduct::Product => {
                for _ in 0..length {
                    self.fold_signed(v);
                }
            }
        }
    }

    fn fold_scalar_unsigned(&mut self, v: u64, length: usize) {
        match self.op {
            SumOrProduct::Sum => self.fold_unsigned(v.wrapping_mul(length as u64)),
            SumOrProduct::Product => {
                for _ in 0..length {
                    self.fold_unsigned(v);
                }
            }
        }
    }

    fn fold_scalar_float(&mut self, v: f64, length: usize) {
        match self.op {
            SumOrProduct::Sum => self.fold_float(v * length as f64),
            SumOrProduct::Product => self.fold_float(v.powi(length as i32)),
        }
    }
}

fn scalar_type_error(v: &ScalarValue) -> BrookError {
    BrookError::TypeError(format!("scalar {v} does not match accumulator type"))
}

// =====================
// mean
// =====================

/// Arithmetic mean over any numeric input, accumulated in `f64`.
#[derive(Debug)]
pub struct MeanKernel {
    opts: ScalarAggregateOptions,
    sum: f64,
    valid: u64,
    nulls_seen: bool,
}

impl MeanKernel {
    pub(crate) fn try_new(opts: ScalarAggregateOptions, input_type: &DataType) -> Result<Self> {
        if number_class(input_type).is_none() {
            return Err(BrookError::NotImplemented(format!(
                "mean over {input_type:?}"
            )));
        }
        Ok(Self {
            opts,
            sum: 0.0,
            valid: 0,
            nulls_seen: false,
        })
    }
}

impl AggregateKernel for MeanKernel {
    fn consume(&mut self, input: &Datum, length: usize) -> Result<()> {
        match input {
            Datum::Array(a) => {
                self.nulls_seen |= a.null_count() > 0;
                self.valid += valid_count(a) as u64;
                let sum = &mut self.sum;
                for_each_valid_f64(a, |v| *sum += v)?;
            }
            Datum::Scalar(s) => {
                if s.is_null() {
                    self.nulls_seen = true;
                } else {
                    let v = s.as_f64().ok_or_else(|| scalar_type_error(s))?;
                    self.sum += v * length as f64;
                    self.valid += length as u64;
                }
            }
        }
        Ok(())
    }

    fn merge_from(&mut self, other: Box<dyn AggregateKernel>) -> Result<()> {
        let other = downcast_state::<Self>(other)?;
        self.sum += other.sum;
        self.valid += other.valid;
        self.nulls_seen |= other.nulls_seen;
        Ok(())
    }

    fn finalize(&mut self) -> Result<Datum> {
        if self.valid < self.opts.min_count as u64
            || (!self.opts.skip_nulls && self.nulls_seen)
        {
            return Ok(Datum::Scalar(ScalarValue::Null));
        }
        Ok(Datum::Scalar(ScalarValue::Float64(
            self.sum / self.valid as f64,
        )))
    }

    fn out_type(&self) -> DataType {
        DataType::Float64
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

// =====================
// min / max
// =====================

/// Input-typed extremum over numeric or utf8 input.
#[derive(Debug)]
pub struct MinMaxKernel {
    opts: ScalarAggregateOptions,
    want_max: bool,
    input_type: DataType,
    current: Option<ScalarValue>,
    valid: u64,
    nulls_seen: bool,
}

impl MinMaxKernel {
    pub(crate) fn try_new(
        opts: ScalarAggregateOptions,
        input_type: &DataType,
        want_max: bool,
    ) -> Result<Self> {
        let supported = super::scalar_representable(input_type) && *input_type != DataType::Boolean;
        if !supported {
            return Err(BrookError::NotImplemented(format!(
                "{} over {input_type:?}",
                if want_max { "max" } else { "min" }
            )));
        }
        Ok(Self {
            opts,
            want_max,
            input_type: input_type.clone(),
            current: None,
            valid: 0,
            nulls_seen: false,
        })
    }

    fn update(&mut self, value: ScalarValue) {
        match &self.current {
            None => self.current = Some(value),
            Some(existing) => {
                let replace = match value.partial_cmp(existing) {
                    Some(ord) => {
                        if self.want_max {
                            ord.is_gt()
                        } else {
                            ord.is_lt()
                        }
                    }
                    None => false,
                };
                if replace {
                    self.current = Some(value);
                }
            }
        }
    }
}

impl AggregateKernel for MinMaxKernel {
    fn consume(&mut self, input: &Datum, length: usize) -> Result<()> {
        match input {
            Datum::Array(a) => {
                self.nulls_seen |= a.null_count() > 0;
                self.valid += valid_count(a) as u64;
                for row in 0..a.len() {
                    if !a.is_null(row) {
                        let value = ScalarValue::try_from_array(a, row)?;
                        self.update(value);
                    }
                }
            }
            Datum::Scalar(s) => {
                if s.is_null() {
                    self.nulls_seen = true;
                } else {
                    self.valid += length as u64;
                    self.update(s.clone());
                }
            }
        }
        Ok(())
    }

    fn merge_from(&mut self, other: Box<dyn AggregateKernel>) -> Result<()> {
        let other = downcast_state::<Self>(other)?;
        self.valid += other.valid;
        self.nulls_seen |= other.nulls_seen;
        if let Some(value) = other.current {
            self.update(value);
        }
        Ok(())
    }

    fn finalize(&mut self) -> Result<Datum> {
        if self.valid < self.opts.min_count as u64
            || (!self.opts.skip_nulls && self.nulls_seen)
        {
            return Ok(Datum::Scalar(ScalarValue::Null));
        }
        Ok(Datum::Scalar(
            self.current.take().unwrap_or(ScalarValue::Null),
        ))
    }

    fn out_type(&self) -> DataType {
        self.input_type.clone()
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

// =====================
// any / all
// =====================

/// Boolean disjunction/conjunction with Kleene semantics when nulls count.
#[derive(Debug)]
pub struct AnyAllKernel {
    opts: ScalarAggregateOptions,
    want_all: bool,
    seen_true: bool,
    seen_false: bool,
    valid: u64,
    nulls_seen: bool,
}

impl AnyAllKernel {
    pub(crate) fn try_new(
        opts: ScalarAggregateOptions,
        input_type: &DataType,
        want_all: bool,
    ) -> Result<Self> {
        if *input_type != DataType::Boolean {
            return Err(BrookError::NotImplemented(format!(
                "{} over {input_type:?}",
                if want_all { "all" } else { "any" }
            )));
        }
        Ok(Self {
            opts,
            want_all,
            seen_true: false,
            seen_false: false,
            valid: 0,
            nulls_seen: false,
        })
    }
}

impl AggregateKernel for AnyAllKernel {
    fn consume(&mut self, input: &Datum, length: usize) -> Result<()> {
        match input {
            Datum::Array(a) => {
                let a = a
                    .as_any()
                    .downcast_ref::<BooleanArray>()
                    .ok_or_else(|| BrookError::TypeError("expected boolean array".to_string()))?;
                self.valid += (a.len() - a.null_count()) as u64;
                self.nulls_seen |= a.null_count() > 0;
                self.seen_true |= a.true_count() > 0;
                self.seen_false |= a.false_count() > 0;
            }
            Datum::Scalar(s) => match s {
                ScalarValue::Null => self.nulls_seen = true,
                ScalarValue::Boolean(v) => {
                    self.valid += length as u64;
                    self.seen_true |= *v;
                    self.seen_false |= !*v;
                }
                other => return Err(scalar_type_error(other)),
            },
        }
        Ok(())
    }

    fn merge_from(&mut self, other: Box<dyn AggregateKernel>) -> Result<()> {
        let other = downcast_state::<Self>(other)?;
        self.seen_true |= other.seen_true;
        self.seen_false |= other.seen_false;
        self.valid += other.valid;
        self.nulls_seen |= other.nulls_seen;
        Ok(())
    }

    fn finalize(&mut self) -> Result<Datum> {
        if self.valid < self.opts.min_count as u64 {
            return Ok(Datum::Scalar(ScalarValue::Null));
        }
        let keep_nulls = !self.opts.skip_nulls && self.nulls_seen;
        let value = if self.want_all {
            // Kleene: false dominates, then null, then true
            if self.seen_false {
                ScalarValue::Boolean(false)
            } else if keep_nulls {
                ScalarValue::Null
            } else {
                ScalarValue::Boolean(true)
            }
        } else {
            // Kleene: true dominates, then null, then false
            if self.seen_true {
                ScalarValue::Boolean(true)
            } else if keep_nulls {
                ScalarValue::Null
            } else {
                ScalarValue::Boolean(false)
            }
        };
        Ok(Datum::Scalar(value))
    }

    fn out_type(&self) -> DataType {
        DataType::Boolean
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}
