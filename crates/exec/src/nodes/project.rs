//! Project node: computes an ordered list of expressions per batch.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use arrow_schema::{Field, Schema, SchemaRef};
use brook_common::Result;
use brook_compute::{compile_expr, ExecBatch, Expr, PhysicalExpr};

use crate::node::{ExecNode, NodeCtx};

/// Applies expressions column-wise; output length equals input length.
///
/// The output schema is derived once at construction from the compiled
/// expression types. Output names are supplied, or synthesized from the
/// expression text when absent.
pub struct ProjectNode {
    label: String,
    schema: SchemaRef,
    exprs: Vec<Arc<dyn PhysicalExpr>>,
    emitted: AtomicUsize,
}

impl ProjectNode {
    /// Compile `exprs` against the input schema.
    pub fn try_new(
        input_schema: SchemaRef,
        exprs: &[Expr],
        names: Option<&[String]>,
    ) -> Result<Self> {
        if let Some(names) = names {
            if names.len() != exprs.len() {
                return Err(brook_common::BrookError::Invalid(format!(
                    "project has {} expressions but {} names",
                    exprs.len(),
                    names.len()
                )));
            }
        }
        let mut compiled = Vec::with_capacity(exprs.len());
        let mut fields = Vec::with_capacity(exprs.len());
        for (idx, expr) in exprs.iter().enumerate() {
            let physical = compile_expr(expr, &input_schema)?;
            let name = match names {
                Some(names) => names[idx].clone(),
                None => expr.to_string(),
            };
            fields.push(Field::new(&name, physical.data_type(), true));
            compiled.push(physical);
        }
        Ok(Self {
            label: "project".to_string(),
            schema: Arc::new(Schema::new(fields)),
            exprs: compiled,
            emitted: AtomicUsize::new(0),
        })
    }
}

impl ExecNode for ProjectNode {
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
        let values = self
            .exprs
            .iter()
            .map(|e| e.evaluate(&batch))
            .collect::<Result<Vec<_>>>()?;
        let out = ExecBatch::try_new(values, batch.length)?;
        self.emitted.fetch_add(1, Ordering::SeqCst);
        ctx.emit(out)
    }

    fn input_finished(&self, ctx: &NodeCtx, _input: usize, _total_batches: usize) -> Result<()> {
        ctx.finish_output(self.emitted.load(Ordering::SeqCst));
        Ok(())
    }
}
