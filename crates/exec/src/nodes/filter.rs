//! Filter node: keeps the rows where a boolean predicate holds.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use arrow::array::BooleanArray;
use arrow_schema::{DataType, SchemaRef};
use brook_common::{BrookError, Result};
use brook_compute::{compile_expr, Datum, ExecBatch, Expr, PhysicalExpr, ScalarValue};

use crate::node::{ExecNode, NodeCtx};

/// Applies a boolean predicate to each batch.
///
/// The predicate may evaluate to a mask or to a broadcast scalar; a false or
/// null scalar drops the whole batch. Empty batches are emitted rather than
/// swallowed, and the schema passes through unchanged.
pub struct FilterNode {
    label: String,
    schema: SchemaRef,
    predicate: Arc<dyn PhysicalExpr>,
    emitted: AtomicUsize,
}

impl FilterNode {
    /// Compile `predicate` against the input schema.
    pub fn try_new(input_schema: SchemaRef, predicate: &Expr) -> Result<Self> {
        let compiled = compile_expr(predicate, &input_schema)?;
        if compiled.data_type() != DataType::Boolean {
            return Err(BrookError::TypeError(format!(
                "filter predicate must be boolean, got {:?}",
                compiled.data_type()
            )));
        }
        Ok(Self {
            label: "filter".to_string(),
            schema: input_schema,
            predicate: compiled,
            emitted: AtomicUsize::new(0),
        })
    }

    fn apply(&self, batch: &ExecBatch) -> Result<ExecBatch> {
        match self.predicate.evaluate(batch)? {
            Datum::Array(mask) => {
                let mask = mask.as_any().downcast_ref::<BooleanArray>().ok_or_else(|| {
                    BrookError::TypeError("filter predicate must evaluate to boolean".to_string())
                })?;
                batch.filter_rows(mask)
            }
            Datum::Scalar(ScalarValue::Boolean(true)) => Ok(batch.clone()),
            Datum::Scalar(ScalarValue::Boolean(false)) | Datum::Scalar(ScalarValue::Null) => {
                let mask = BooleanArray::from(vec![false; batch.length]);
                batch.filter_rows(&mask)
            }
            Datum::Scalar(other) => Err(BrookError::TypeError(format!(
                "filter predicate must evaluate to boolean, got {other}"
            ))),
        }
    }
}

impl ExecNode for FilterNode {
    fn label(&self) -> &str {
        &self.label
    }

    fn num_outputs(&self) -> usize {
        1
    }

    fn output_schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    fn start_producing(&self, _ctx: &NodeCtx) -> Result<()> {
        Ok(())
    }

    fn stop_producing(&self, _ctx: &NodeCtx) {}

    fn input_received(&self, ctx: &NodeCtx, _input: usize, batch: ExecBatch) -> Result<()> {
        let out = self.apply(&batch)?;
        self.emitted.fetch_add(1, Ordering::SeqCst);
        ctx.emit(out)
    }

    fn input_finished(&self, ctx: &NodeCtx, _input: usize, _total_batches: usize) -> Result<()> {
        ctx.finish_output(self.emitted.load(Ordering::SeqCst));
        Ok(())
    }
}
