//! Expression compilation and evaluation for execution operators.
//!
//! Input contract:
//! - expressions reference input columns by name against the edge schema;
//! - numeric literals are coerced to the opposite operand's type at compile
//!   time (there is no analyzer in front of this layer).
//!
//! Output contract:
//! - each evaluation returns a [`Datum`]: an array aligned to the input batch
//!   row count, or a scalar when the inputs were scalar.

use std::fmt;
use std::sync::Arc;

use arrow::array::{ArrayRef, BooleanArray, Float64Array, Int32Array, Int64Array, StringArray};
use arrow::compute::kernels::{
    boolean::{and_kleene, not, or_kleene},
    cast::cast,
    cmp::{eq, gt, gt_eq, lt, lt_eq, neq},
    numeric::{add, div, mul, sub},
};
use arrow_schema::{DataType, SchemaRef};
use brook_common::{BrookError, Result};
use serde::{Deserialize, Serialize};

use crate::batch::{Datum, ExecBatch};
use crate::scalar::ScalarValue;

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmpOp {
    /// `=`
    Eq,
    /// `!=`
    NotEq,
    /// `<`
    Lt,
    /// `<=`
    LtEq,
    /// `>`
    Gt,
    /// `>=`
    GtEq,
}

/// Arithmetic operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArithOp {
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`
    Div,
}

/// Row expression tree evaluated by filter/project operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    /// Input column reference by name.
    Column(String),
    /// Literal value.
    Literal(ScalarValue),
    /// Boolean negation.
    Not(Box<Expr>),
    /// Kleene conjunction.
    And(Box<Expr>, Box<Expr>),
    /// Kleene disjunction.
    Or(Box<Expr>, Box<Expr>),
    /// Comparison producing a boolean column.
    Cmp {
        /// Left operand.
        left: Box<Expr>,
        /// Operator.
        op: CmpOp,
        /// Right operand.
        right: Box<Expr>,
    },
    /// Arithmetic preserving the operand type.
    Arith {
        /// Left operand.
        left: Box<Expr>,
        /// Operator.
        op: ArithOp,
        /// Right operand.
        right: Box<Expr>,
    },
    /// Explicit cast.
    Cast {
        /// Operand.
        expr: Box<Expr>,
        /// Target type.
        to_type: DataType,
    },
}

/// Column reference shorthand.
pub fn col(name: impl Into<String>) -> Expr {
    Expr::Column(name.into())
}

/// Literal shorthand.
pub fn lit(value: impl Into<ScalarValue>) -> Expr {
    Expr::Literal(value.into())
}

impl Expr {
    /// Boolean negation of this expression.
    pub fn not(self) -> Expr {
        Expr::Not(Box::new(self))
    }

    /// Comparison with another expression.
    pub fn cmp(self, op: CmpOp, other: Expr) -> Expr {
        Expr::Cmp {
            left: Box::new(self),
            op,
            right: Box::new(other),
        }
    }

    /// `self = other`.
    pub fn eq(self, other: Expr) -> Expr {
        self.cmp(CmpOp::Eq, other)
    }

    /// `self > other`.
    pub fn gt(self, other: Expr) -> Expr {
        self.cmp(CmpOp::Gt, other)
    }

    /// `self >= other`.
    pub fn gt_eq(self, other: Expr) -> Expr {
        self.cmp(CmpOp::GtEq, other)
    }

    /// Arithmetic with another expression.
    pub fn arith(self, op: ArithOp, other: Expr) -> Expr {
        Expr::Arith {
            left: Box::new(self),
            op,
            right: Box::new(other),
        }
    }

    /// `self + other`.
    pub fn add(self, other: Expr) -> Expr {
        self.arith(ArithOp::Add, other)
    }

    /// `self * other`.
    pub fn mul(self, other: Expr) -> Expr {
        self.arith(ArithOp::Mul, other)
    }
}

impl fmt::Display for Expr {
    /// Renders expression text; project uses it to synthesize output names.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Column(name) => write!(f, "{name}"),
            Expr::Literal(v) => write!(f, "{v}"),
            Expr::Not(e) => write!(f, "!{e}"),
            Expr::And(a, b) => write!(f, "({a} and {b})"),
            Expr::Or(a, b) => write!(f, "({a} or {b})"),
            Expr::Cmp { left, op, right } => {
                let op = match op {
                    CmpOp::Eq => "==",
                    CmpOp::NotEq => "!=",
                    CmpOp::Lt => "<",
                    CmpOp::LtEq => "<=",
                    CmpOp::Gt => ">",
                    CmpOp::GtEq => ">=",
                };
                write!(f, "{left} {op} {right}")
            }
            Expr::Arith { left, op, right } => {
                let op = match op {
                    ArithOp::Add => "+",
                    ArithOp::Sub => "-",
                    ArithOp::Mul => "*",
                    ArithOp::Div => "/",
                };
                write!(f, "{left} {op} {right}")
            }
            Expr::Cast { expr, to_type } => write!(f, "cast({expr} as {to_type:?})"),
        }
    }
}

/// Executable expression.
///
/// Compilation resolves columns and types once; evaluation is per batch.
pub trait PhysicalExpr: Send + Sync {
    /// Static output data type of this expression.
    fn data_type(&self) -> DataType;
    /// Evaluate the expression for every row in `batch`.
    fn evaluate(&self, batch: &ExecBatch) -> Result<Datum>;
}

/// Compile an expression against the input schema.
pub fn compile_expr(expr: &Expr, input_schema: &SchemaRef) -> Result<Arc<dyn PhysicalExpr>> {
    match expr {
        Expr::Column(name) => {
            let idx = input_schema
                .fields()
                .iter()
                .position(|f| f.name() == name)
                .ok_or_else(|| {
                    BrookError::TypeError(format!("unknown column in expression: {name}"))
                })?;
            let dt = input_schema.field(idx).data_type().clone();
            Ok(Arc::new(ColumnExpr { index: idx, dt }))
        }

        Expr::Literal(v) => {
            let dt = v.data_type().unwrap_or(DataType::Null);
            Ok(Arc::new(LiteralExpr { v: v.clone(), dt }))
        }

        Expr::Cast { expr, to_type } => {
            let inner = compile_expr(expr, input_schema)?;
            Ok(Arc::new(CastExpr {
                inner,
                to_type: to_type.clone(),
            }))
        }

        Expr::Not(e) => {
            let inner = compile_expr(e, input_schema)?;
            if inner.data_type() != DataType::Boolean {
                return Err(BrookError::TypeError("NOT expects boolean".to_string()));
            }
            Ok(Arc::new(NotExpr { inner }))
        }

        Expr::And(a, b) => {
            let (left, right) = compile_bool_pair(a, b, input_schema)?;
            Ok(Arc::new(BoolBinaryExpr {
                left,
                right,
                op: BoolOp::And,
            }))
        }

        Expr::Or(a, b) => {
            let (left, right) = compile_bool_pair(a, b, input_schema)?;
            Ok(Arc::new(BoolBinaryExpr {
                left,
                right,
                op: BoolOp::Or,
            }))
        }

        Expr::Cmp { left, op, right } => {
            let (l, r) = compile_coerced(left, right, input_schema)?;
            Ok(Arc::new(CmpExpr {
                left: l,
                right: r,
                op: *op,
            }))
        }

        Expr::Arith { left, op, right } => {
            let (l, r) = compile_coerced(left, right, input_schema)?;
            let out = l.data_type();
            if !matches!(out, DataType::Int32 | DataType::Int64 | DataType::Float64) {
                return Err(BrookError::NotImplemented(format!(
                    "arithmetic over {out:?}"
                )));
            }
            Ok(Arc::new(ArithExpr {
                left: l,
                right: r,
                op: *op,
                out,
            }))
        }
    }
}

fn compile_bool_pair(
    a: &Expr,
    b: &Expr,
    schema: &SchemaRef,
) -> Result<(Arc<dyn PhysicalExpr>, Arc<dyn PhysicalExpr>)> {
    let left = compile_expr(a, schema)?;
    let right = compile_expr(b, schema)?;
    if left.data_type() != DataType::Boolean || right.data_type() != DataType::Boolean {
        return Err(BrookError::TypeError("AND/OR expects boolean".to_string()));
    }
    Ok((left, right))
}

/// Compile both operands, bending a numeric literal to the other side's type.
fn compile_coerced(
    a: &Expr,
    b: &Expr,
    schema: &SchemaRef,
) -> Result<(Arc<dyn PhysicalExpr>, Arc<dyn PhysicalExpr>)> {
    let ca = compile_expr(a, schema)?;
    let cb = compile_expr(b, schema)?;
    if ca.data_type() == cb.data_type() {
        return Ok((ca, cb));
    }
    if matches!(b, Expr::Literal(_)) && numeric_coercible(&cb.data_type(), &ca.data_type()) {
        let to_type = ca.data_type();
        return Ok((ca, Arc::new(CastExpr { inner: cb, to_type })));
    }
    if matches!(a, Expr::Literal(_)) && numeric_coercible(&ca.data_type(), &cb.data_type()) {
        let to_type = cb.data_type();
        return Ok((Arc::new(CastExpr { inner: ca, to_type }), cb));
    }
    Err(BrookError::TypeError(format!(
        "mismatched operand types {:?} vs {:?}",
        ca.data_type(),
        cb.data_type()
    )))
}

fn numeric_coercible(from: &DataType, to: &DataType) -> bool {
    let numeric = |dt: &DataType| {
        matches!(
            dt,
            DataType::Int32 | DataType::Int64 | DataType::UInt64 | DataType::Float64
        )
    };
    numeric(from) && numeric(to)
}

// =====================
// Standard expressions
// =====================

struct ColumnExpr {
    index: usize,
    dt: DataType,
}

impl PhysicalExpr for ColumnExpr {
    fn data_type(&self) -> DataType {
        self.dt.clone()
    }

    fn evaluate(&self, batch: &ExecBatch) -> Result<Datum> {
        Ok(batch.column(self.index).clone())
    }
}

struct LiteralExpr {
    v: ScalarValue,
    dt: DataType,
}

impl PhysicalExpr for LiteralExpr {
    fn data_type(&self) -> DataType {
        self.dt.clone()
    }

    fn evaluate(&self, _batch: &ExecBatch) -> Result<Datum> {
        Ok(Datum::Scalar(self.v.clone()))
    }
}

struct CastExpr {
    inner: Arc<dyn PhysicalExpr>,
    to_type: DataType,
}

impl PhysicalExpr for CastExpr {
    fn data_type(&self) -> DataType {
        self.to_type.clone()
    }

    fn evaluate(&self, batch: &ExecBatch) -> Result<Datum> {
        match self.inner.evaluate(batch)? {
            Datum::Scalar(s) => {
                let arr = s.to_array(1)?;
                let out = cast(&arr, &self.to_type)
                    .map_err(|e| BrookError::Execution(format!("cast failed: {e}")))?;
                Ok(Datum::Scalar(ScalarValue::try_from_array(&out, 0)?))
            }
            Datum::Array(arr) => {
                let out = cast(&arr, &self.to_type)
                    .map_err(|e| BrookError::Execution(format!("cast failed: {e}")))?;
                Ok(Datum::Array(out))
            }
        }
    }
}

struct NotExpr {
    inner: Arc<dyn PhysicalExpr>,
}

impl PhysicalExpr for NotExpr {
    fn data_type(&self) -> DataType {
        DataType::Boolean
    }

    fn evaluate(&self, batch: &ExecBatch) -> Result<Datum> {
        let arr = self.inner.evaluate(batch)?.to_array(batch.length)?;
        let b = arr
            .as_any()
            .downcast_ref::<BooleanArray>()
            .ok_or_else(|| BrookError::TypeError("NOT expects boolean".to_string()))?;
        let out = not(b).map_err(|e| BrookError::Execution(format!("not failed: {e}")))?;
        Ok(Datum::Array(Arc::new(out)))
    }
}

#[derive(Clone, Copy)]
enum BoolOp {
    And,
    Or,
}

struct BoolBinaryExpr {
    left: Arc<dyn PhysicalExpr>,
    right: Arc<dyn PhysicalExpr>,
    op: BoolOp,
}

impl PhysicalExpr for BoolBinaryExpr {
    fn data_type(&self) -> DataType {
        DataType::Boolean
    }

    fn evaluate(&self, batch: &ExecBatch) -> Result<Datum> {
        let l = self.left.evaluate(batch)?.to_array(batch.length)?;
        let r = self.right.evaluate(batch)?.to_array(batch.length)?;

        let lb = l
            .as_any()
            .downcast_ref::<BooleanArray>()
            .ok_or_else(|| BrookError::TypeError("AND/OR expects boolean".to_string()))?;
        let rb = r
            .as_any()
            .downcast_ref::<BooleanArray>()
            .ok_or_else(|| BrookError::TypeError("AND/OR expects boolean".to_string()))?;

        let out = match self.op {
            BoolOp::And => and_kleene(lb, rb),
            BoolOp::Or => or_kleene(lb, rb),
        }
        .map_err(|e| BrookError::Execution(format!("boolean kernel failed: {e}")))?;

        Ok(Datum::Array(Arc::new(out)))
    }
}

struct CmpExpr {
    left: Arc<dyn PhysicalExpr>,
    right: Arc<dyn PhysicalExpr>,
    op: CmpOp,
}

impl PhysicalExpr for CmpExpr {
    fn data_type(&self) -> DataType {
        DataType::Boolean
    }

    fn evaluate(&self, batch: &ExecBatch) -> Result<Datum> {
        let l = self.left.evaluate(batch)?.to_array(batch.length)?;
        let r = self.right.evaluate(batch)?.to_array(batch.length)?;
        Ok(Datum::Array(Arc::new(eval_cmp(self.op, &l, &r)?)))
    }
}

struct ArithExpr {
    left: Arc<dyn PhysicalExpr>,
    right: Arc<dyn PhysicalExpr>,
    op: ArithOp,
    out: DataType,
}

impl PhysicalExpr for ArithExpr {
    fn data_type(&self) -> DataType {
        self.out.clone()
    }

    fn evaluate(&self, batch: &ExecBatch) -> Result<Datum> {
        let l = self.left.evaluate(batch)?.to_array(batch.length)?;
        let r = self.right.evaluate(batch)?.to_array(batch.length)?;
        Ok(Datum::Array(eval_arith(self.op, &l, &r, &self.out)?))
    }
}

// ------------------ helpers ------------------

fn eval_arith(op: ArithOp, l: &ArrayRef, r: &ArrayRef, out: &DataType) -> Result<ArrayRef> {
    match out {
        DataType::Int32 => {
            let la = l
                .as_any()
                .downcast_ref::<Int32Array>()
                .ok_or_else(|| BrookError::TypeError("expected Int32 array".to_string()))?;
            let ra = r
                .as_any()
                .downcast_ref::<Int32Array>()
                .ok_or_else(|| BrookError::TypeError("expected Int32 array".to_string()))?;
            apply_arith(op, la, ra)
        }
        DataType::Int64 => {
            let la = l
                .as_any()
                .downcast_ref::<Int64Array>()
                .ok_or_else(|| BrookError::TypeError("expected Int64 array".to_string()))?;
            let ra = r
                .as_any()
                .downcast_ref::<Int64Array>()
                .ok_or_else(|| BrookError::TypeError("expected Int64 array".to_string()))?;
            apply_arith(op, la, ra)
        }
        DataType::Float64 => {
            let la = l
                .as_any()
                .downcast_ref::<Float64Array>()
                .ok_or_else(|| BrookError::TypeError("expected Float64 array".to_string()))?;
            let ra = r
                .as_any()
                .downcast_ref::<Float64Array>()
                .ok_or_else(|| BrookError::TypeError("expected Float64 array".to_string()))?;
            apply_arith(op, la, ra)
        }
        _ => Err(BrookError::NotImplemented(format!(
            "arithmetic over {out:?}"
        ))),
    }
}

fn apply_arith<A: arrow::array::Datum>(op: ArithOp, la: &A, ra: &A) -> Result<ArrayRef> {
    match op {
        ArithOp::Add => add(la, ra),
        ArithOp::Sub => sub(la, ra),
        ArithOp::Mul => mul(la, ra),
        ArithOp::Div => div(la, ra),
    }
    .map_err(|e| BrookError::Execution(format!("arith kernel failed: {e}")))
}

fn eval_cmp(op: CmpOp, l: &ArrayRef, r: &ArrayRef) -> Result<BooleanArray> {
    let expected = |name: &str| BrookError::TypeError(format!("expected {name} array"));
    match l.data_type() {
        DataType::Int32 => {
            let la = l
                .as_any()
                .downcast_ref::<Int32Array>()
                .ok_or_else(|| expected("Int32"))?;
            let ra = r
                .as_any()
                .downcast_ref::<Int32Array>()
                .ok_or_else(|| expected("Int32"))?;
            apply_cmp(op, la, ra)
        }
        DataType::Int64 => {
            let la = l
                .as_any()
                .downcast_ref::<Int64Array>()
                .ok_or_else(|| expected("Int64"))?;
            let ra = r
                .as_any()
                .downcast_ref::<Int64Array>()
                .ok_or_else(|| expected("Int64"))?;
            apply_cmp(op, la, ra)
        }
        DataType::Float64 => {
            let la = l
                .as_any()
                .downcast_ref::<Float64Array>()
                .ok_or_else(|| expected("Float64"))?;
            let ra = r
                .as_any()
                .downcast_ref::<Float64Array>()
                .ok_or_else(|| expected("Float64"))?;
            apply_cmp(op, la, ra)
        }
        DataType::Utf8 => {
            let la = l
                .as_any()
                .downcast_ref::<StringArray>()
                .ok_or_else(|| expected("Utf8"))?;
            let ra = r
                .as_any()
                .downcast_ref::<StringArray>()
                .ok_or_else(|| expected("Utf8"))?;
            apply_cmp(op, la, ra)
        }
        DataType::Boolean => {
            let la = l
                .as_any()
                .downcast_ref::<BooleanArray>()
                .ok_or_else(|| expected("Boolean"))?;
            let ra = r
                .as_any()
                .downcast_ref::<BooleanArray>()
                .ok_or_else(|| expected("Boolean"))?;
            match op {
                CmpOp::Eq | CmpOp::NotEq => apply_cmp(op, la, ra),
                _ => Err(BrookError::NotImplemented(
                    "ordering comparisons for boolean".to_string(),
                )),
            }
        }
        other => Err(BrookError::NotImplemented(format!(
            "comparison over {other:?}"
        ))),
    }
}

fn apply_cmp<A: arrow::array::Datum>(op: CmpOp, la: &A, ra: &A) -> Result<BooleanArray> {
    match op {
        CmpOp::Eq => eq(la, ra),
        CmpOp::NotEq => neq(la, ra),
        CmpOp::Lt => lt(la, ra),
        CmpOp::LtEq => lt_eq(la, ra),
        CmpOp::Gt => gt(la, ra),
        CmpOp::GtEq => gt_eq(la, ra),
    }
    .map_err(|e| BrookError::Execution(format!("cmp kernel failed: {e}")))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow::array::{Array, BooleanArray, Int32Array};
    use arrow_schema::{Field, Schema};

    use super::*;

    fn test_schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("i32", DataType::Int32, true),
            Field::new("bool", DataType::Boolean, true),
        ]))
    }

    fn test_batch() -> ExecBatch {
        let i: ArrayRef = Arc::new(Int32Array::from(vec![None, Some(4), Some(6)]));
        let b: ArrayRef = Arc::new(BooleanArray::from(vec![Some(true), None, Some(false)]));
        ExecBatch::from_arrays(vec![i, b]).expect("batch")
    }

    #[test]
    fn literal_is_coerced_to_column_type() {
        let expr = col("i32").eq(lit(6_i64));
        let compiled = compile_expr(&expr, &test_schema()).expect("compile");
        let out = compiled
            .evaluate(&test_batch())
            .expect("evaluate")
            .to_array(3)
            .expect("array");
        let mask = out.as_any().downcast_ref::<BooleanArray>().expect("bool");
        assert!(mask.is_null(0));
        assert_eq!(mask.value(1), false);
        assert_eq!(mask.value(2), true);
    }

    #[test]
    fn arithmetic_preserves_input_type() {
        let expr = col("i32").add(lit(1_i64));
        let compiled = compile_expr(&expr, &test_schema()).expect("compile");
        assert_eq!(compiled.data_type(), DataType::Int32);
        let out = compiled
            .evaluate(&test_batch())
            .expect("evaluate")
            .to_array(3)
            .expect("array");
        let ints = out.as_any().downcast_ref::<Int32Array>().expect("int32");
        assert!(ints.is_null(0));
        assert_eq!(ints.value(1), 5);
        assert_eq!(ints.value(2), 7);
    }

    #[test]
    fn not_propagates_nulls() {
        let expr = col("bool").not();
        let compiled = compile_expr(&expr, &test_schema()).expect("compile");
        let out = compiled
            .evaluate(&test_batch())
            .expect("evaluate")
            .to_array(3)
            .expect("array");
        let b = out.as_any().downcast_ref::<BooleanArray>().expect("bool");
        assert_eq!(b.value(0), false);
        assert!(b.is_null(1));
        assert_eq!(b.value(2), true);
    }

    #[test]
    fn unknown_column_is_a_type_error() {
        let err = match compile_expr(&col("missing"), &test_schema()) {
            Err(e) => e,
            Ok(_) => panic!("unknown"),
        };
        assert!(matches!(err, BrookError::TypeError(_)));
    }

    #[test]
    fn scalar_inputs_stay_scalar_through_column_refs() {
        let batch = ExecBatch::try_new(
            vec![
                Datum::Scalar(ScalarValue::Int32(5)),
                Datum::Scalar(ScalarValue::Boolean(false)),
            ],
            3,
        )
        .expect("batch");
        let compiled = compile_expr(&col("i32"), &test_schema()).expect("compile");
        let out = compiled.evaluate(&batch).expect("evaluate");
        assert!(out.is_scalar());
    }

    #[test]
    fn display_renders_expression_text() {
        let expr = col("i32").add(lit(1_i32));
        assert_eq!(expr.to_string(), "i32 + 1");
        assert_eq!(col("bool").not().to_string(), "!bool");
    }
}
