//! Scalar values: group keys, literals, and broadcast batch columns.

use std::cmp::Ordering;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use arrow::array::{
    new_null_array, Array, ArrayRef, BooleanArray, BooleanBuilder, Float64Array, Float64Builder,
    Int32Array, Int32Builder, Int64Array, Int64Builder, StringArray, StringBuilder, UInt64Array,
    UInt64Builder,
};
use arrow_schema::DataType;
use brook_common::{BrookError, Result};
use serde::{Deserialize, Serialize};

/// A single columnar value.
///
/// Used as a group key element, an expression literal, and as the broadcast
/// form of a batch column. Floats compare and hash by bit pattern so scalar
/// values can key hash maps; `Null` is untyped (the surrounding schema carries
/// the field type).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ScalarValue {
    /// Untyped null.
    Null,
    /// Boolean value.
    Boolean(bool),
    /// 32-bit signed integer.
    Int32(i32),
    /// 64-bit signed integer.
    Int64(i64),
    /// 64-bit unsigned integer.
    UInt64(u64),
    /// 64-bit float.
    Float64(f64),
    /// UTF-8 string.
    Utf8(String),
}

impl PartialEq for ScalarValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Boolean(a), Self::Boolean(b)) => a == b,
            (Self::Int32(a), Self::Int32(b)) => a == b,
            (Self::Int64(a), Self::Int64(b)) => a == b,
            (Self::UInt64(a), Self::UInt64(b)) => a == b,
            (Self::Float64(a), Self::Float64(b)) => a.to_bits() == b.to_bits(),
            (Self::Utf8(a), Self::Utf8(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for ScalarValue {}

impl Hash for ScalarValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Self::Null => 0_u8.hash(state),
            Self::Boolean(v) => {
                1_u8.hash(state);
                v.hash(state);
            }
            Self::Int32(v) => {
                2_u8.hash(state);
                v.hash(state);
            }
            Self::Int64(v) => {
                3_u8.hash(state);
                v.hash(state);
            }
            Self::UInt64(v) => {
                4_u8.hash(state);
                v.hash(state);
            }
            Self::Float64(v) => {
                5_u8.hash(state);
                v.to_bits().hash(state);
            }
            Self::Utf8(v) => {
                6_u8.hash(state);
                v.hash(state);
            }
        }
    }
}

impl PartialOrd for ScalarValue {
    /// Orders same-typed values; mixed types and nulls are unordered.
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Boolean(a), Self::Boolean(b)) => a.partial_cmp(b),
            (Self::Int32(a), Self::Int32(b)) => a.partial_cmp(b),
            (Self::Int64(a), Self::Int64(b)) => a.partial_cmp(b),
            (Self::UInt64(a), Self::UInt64(b)) => a.partial_cmp(b),
            (Self::Float64(a), Self::Float64(b)) => Some(a.total_cmp(b)),
            (Self::Utf8(a), Self::Utf8(b)) => a.partial_cmp(b),
            _ => None,
        }
    }
}

impl std::fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Boolean(v) => write!(f, "{v}"),
            Self::Int32(v) => write!(f, "{v}"),
            Self::Int64(v) => write!(f, "{v}"),
            Self::UInt64(v) => write!(f, "{v}"),
            Self::Float64(v) => write!(f, "{v}"),
            Self::Utf8(v) => write!(f, "\"{v}\""),
        }
    }
}

impl From<bool> for ScalarValue {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl From<i32> for ScalarValue {
    fn from(v: i32) -> Self {
        Self::Int32(v)
    }
}

impl From<i64> for ScalarValue {
    fn from(v: i64) -> Self {
        Self::Int64(v)
    }
}

impl From<u64> for ScalarValue {
    fn from(v: u64) -> Self {
        Self::UInt64(v)
    }
}

impl From<f64> for ScalarValue {
    fn from(v: f64) -> Self {
        Self::Float64(v)
    }
}

impl From<&str> for ScalarValue {
    fn from(v: &str) -> Self {
        Self::Utf8(v.to_string())
    }
}

impl ScalarValue {
    /// Data type of the value, `None` for untyped null.
    pub fn data_type(&self) -> Option<DataType> {
        match self {
            Self::Null => None,
            Self::Boolean(_) => Some(DataType::Boolean),
            Self::Int32(_) => Some(DataType::Int32),
            Self::Int64(_) => Some(DataType::Int64),
            Self::UInt64(_) => Some(DataType::UInt64),
            Self::Float64(_) => Some(DataType::Float64),
            Self::Utf8(_) => Some(DataType::Utf8),
        }
    }

    /// Returns true for [`ScalarValue::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Numeric view of the value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int32(v) => Some(*v as f64),
            Self::Int64(v) => Some(*v as f64),
            Self::UInt64(v) => Some(*v as f64),
            Self::Float64(v) => Some(*v),
            _ => None,
        }
    }

    /// Extract the value at `row` of `arr`.
    pub fn try_from_array(arr: &ArrayRef, row: usize) -> Result<ScalarValue> {
        if arr.is_null(row) {
            return Ok(Self::Null);
        }
        match arr.data_type() {
            DataType::Boolean => {
                let a = arr
                    .as_any()
                    .downcast_ref::<BooleanArray>()
                    .ok_or_else(|| expected_array("Boolean"))?;
                Ok(Self::Boolean(a.value(row)))
            }
            DataType::Int32 => {
                let a = arr
                    .as_any()
                    .downcast_ref::<Int32Array>()
                    .ok_or_else(|| expected_array("Int32"))?;
                Ok(Self::Int32(a.value(row)))
            }
            DataType::Int64 => {
                let a = arr
                    .as_any()
                    .downcast_ref::<Int64Array>()
                    .ok_or_else(|| expected_array("Int64"))?;
                Ok(Self::Int64(a.value(row)))
            }
            DataType::UInt64 => {
                let a = arr
                    .as_any()
                    .downcast_ref::<UInt64Array>()
                    .ok_or_else(|| expected_array("UInt64"))?;
                Ok(Self::UInt64(a.value(row)))
            }
            DataType::Float64 => {
                let a = arr
                    .as_any()
                    .downcast_ref::<Float64Array>()
                    .ok_or_else(|| expected_array("Float64"))?;
                Ok(Self::Float64(a.value(row)))
            }
            DataType::Utf8 => {
                let a = arr
                    .as_any()
                    .downcast_ref::<StringArray>()
                    .ok_or_else(|| expected_array("Utf8"))?;
                Ok(Self::Utf8(a.value(row).to_string()))
            }
            other => Err(BrookError::NotImplemented(format!(
                "scalar extraction from {other:?} array"
            ))),
        }
    }

    /// Materialize the value as an array of `len` repeats.
    pub fn to_array(&self, len: usize) -> Result<ArrayRef> {
        match self {
            Self::Null => Ok(new_null_array(&DataType::Null, len)),
            Self::Boolean(x) => {
                let mut b = BooleanBuilder::with_capacity(len);
                for _ in 0..len {
                    b.append_value(*x);
                }
                Ok(Arc::new(b.finish()))
            }
            Self::Int32(x) => {
                let mut b = Int32Builder::with_capacity(len);
                for _ in 0..len {
                    b.append_value(*x);
                }
                Ok(Arc::new(b.finish()))
            }
            Self::Int64(x) => {
                let mut b = Int64Builder::with_capacity(len);
                for _ in 0..len {
                    b.append_value(*x);
                }
                Ok(Arc::new(b.finish()))
            }
            Self::UInt64(x) => {
                let mut b = UInt64Builder::with_capacity(len);
                for _ in 0..len {
                    b.append_value(*x);
                }
                Ok(Arc::new(b.finish()))
            }
            Self::Float64(x) => {
                let mut b = Float64Builder::with_capacity(len);
                for _ in 0..len {
                    b.append_value(*x);
                }
                Ok(Arc::new(b.finish()))
            }
            Self::Utf8(s) => {
                let mut b = StringBuilder::with_capacity(len, s.len() * len);
                for _ in 0..len {
                    b.append_value(s);
                }
                Ok(Arc::new(b.finish()))
            }
        }
    }
}

/// Build a typed array out of scalar values; `Null` entries become nulls.
pub fn scalars_to_array(values: &[ScalarValue], dt: &DataType) -> Result<ArrayRef> {
    match dt {
        DataType::Boolean => {
            let mut b = BooleanBuilder::with_capacity(values.len());
            for v in values {
                match v {
                    ScalarValue::Boolean(x) => b.append_value(*x),
                    ScalarValue::Null => b.append_null(),
                    other => return Err(type_mismatch(other, dt)),
                }
            }
            Ok(Arc::new(b.finish()))
        }
        DataType::Int32 => {
            let mut b = Int32Builder::with_capacity(values.len());
            for v in values {
                match v {
                    ScalarValue::Int32(x) => b.append_value(*x),
                    ScalarValue::Null => b.append_null(),
                    other => return Err(type_mismatch(other, dt)),
                }
            }
            Ok(Arc::new(b.finish()))
        }
        DataType::Int64 => {
            let mut b = Int64Builder::with_capacity(values.len());
            for v in values {
                match v {
                    ScalarValue::Int64(x) => b.append_value(*x),
                    ScalarValue::Null => b.append_null(),
                    other => return Err(type_mismatch(other, dt)),
                }
            }
            Ok(Arc::new(b.finish()))
        }
        DataType::UInt64 => {
            let mut b = UInt64Builder::with_capacity(values.len());
            for v in values {
                match v {
                    ScalarValue::UInt64(x) => b.append_value(*x),
                    ScalarValue::Null => b.append_null(),
                    other => return Err(type_mismatch(other, dt)),
                }
            }
            Ok(Arc::new(b.finish()))
        }
        DataType::Float64 => {
            let mut b = Float64Builder::with_capacity(values.len());
            for v in values {
                match v {
                    ScalarValue::Float64(x) => b.append_value(*x),
                    ScalarValue::Null => b.append_null(),
                    other => return Err(type_mismatch(other, dt)),
                }
            }
            Ok(Arc::new(b.finish()))
        }
        DataType::Utf8 => {
            let mut b = StringBuilder::with_capacity(values.len(), values.len() * 8);
            for v in values {
                match v {
                    ScalarValue::Utf8(s) => b.append_value(s),
                    ScalarValue::Null => b.append_null(),
                    other => return Err(type_mismatch(other, dt)),
                }
            }
            Ok(Arc::new(b.finish()))
        }
        other => Err(BrookError::NotImplemented(format!(
            "array construction for {other:?}"
        ))),
    }
}

fn type_mismatch(v: &ScalarValue, dt: &DataType) -> BrookError {
    BrookError::TypeError(format!("scalar {v} does not fit {dt:?} array"))
}

fn expected_array(name: &str) -> BrookError {
    BrookError::TypeError(format!("expected {name} array"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_arrays() {
        let arr = scalars_to_array(
            &[ScalarValue::Int32(4), ScalarValue::Null, ScalarValue::Int32(-7)],
            &DataType::Int32,
        )
        .expect("array");
        assert_eq!(arr.len(), 3);
        assert_eq!(
            ScalarValue::try_from_array(&arr, 0).expect("value"),
            ScalarValue::Int32(4)
        );
        assert_eq!(
            ScalarValue::try_from_array(&arr, 1).expect("value"),
            ScalarValue::Null
        );
    }

    #[test]
    fn float_equality_is_bitwise() {
        assert_eq!(ScalarValue::Float64(0.5), ScalarValue::Float64(0.5));
        assert_ne!(ScalarValue::Float64(0.5), ScalarValue::Float64(-0.5));
        assert_eq!(
            ScalarValue::Float64(f64::NAN),
            ScalarValue::Float64(f64::NAN)
        );
    }

    #[test]
    fn mixed_types_are_unordered() {
        assert!(ScalarValue::Int32(1)
            .partial_cmp(&ScalarValue::Int64(1))
            .is_none());
        assert_eq!(
            ScalarValue::Utf8("alfa".into()).partial_cmp(&ScalarValue::Utf8("beta".into())),
            Some(Ordering::Less)
        );
    }
}
