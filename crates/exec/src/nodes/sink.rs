//! Sink node: exposes delivered batches as an async stream to the caller.

use std::sync::{Arc, Mutex};

use arrow_schema::SchemaRef;
use brook_common::{BrookError, Result};
use brook_compute::ExecBatch;
use futures::channel::mpsc;
use futures::StreamExt;

use crate::node::{ExecNode, NodeCtx};
use crate::plan::lock;
use crate::stream::BatchStream;

/// Shared slot a sink writes its output stream into at construction time.
///
/// Callers keep a clone, build the plan, then `take` the stream and pull it
/// while the plan runs.
#[derive(Clone, Default)]
pub struct SinkStreamSlot(Arc<Mutex<Option<BatchStream>>>);

impl SinkStreamSlot {
    /// Create an empty slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the sink's stream; `None` if no sink filled the slot yet or it
    /// was already taken.
    pub fn take(&self) -> Option<BatchStream> {
        lock(&self.0).take()
    }

    fn put(&self, stream: BatchStream) {
        *lock(&self.0) = Some(stream);
    }
}

/// Terminal node buffering batches in arrival order.
///
/// The exposed stream yields buffered batches, suspends while none are
/// pending, ends at `input_finished`, and yields the error on failure.
/// Stop unblocks any suspended reader with the terminator.
pub struct SinkNode {
    label: String,
    schema: SchemaRef,
    tx: Mutex<Option<mpsc::UnboundedSender<Result<ExecBatch>>>>,
}

impl SinkNode {
    /// Create a sink for `input_schema`, writing its stream into `out`.
    pub fn new(input_schema: SchemaRef, out: &SinkStreamSlot) -> Self {
        let (tx, rx) = mpsc::unbounded();
        out.put(rx.boxed());
        Self {
            label: "sink".to_string(),
            schema: input_schema,
            tx: Mutex::new(Some(tx)),
        }
    }

    fn close(&self) {
        lock(&self.tx).take();
    }
}

impl ExecNode for SinkNode {
    fn label(&self) -> &str {
        &self.label
    }

    fn num_outputs(&self) -> usize {
        0
    }

    fn output_schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    fn start_producing(&self, _ctx: &NodeCtx) -> Result<()> {
        Ok(())
    }

    fn stop_producing(&self, ctx: &NodeCtx) {
        self.close();
        ctx.node_finished();
    }

    fn input_received(&self, _ctx: &NodeCtx, _input: usize, batch: ExecBatch) -> Result<()> {
        if let Some(tx) = lock(&self.tx).as_ref() {
            // the reader dropping its stream is not a plan error
            let _ = tx.unbounded_send(Ok(batch));
        }
        Ok(())
    }

    fn input_finished(&self, ctx: &NodeCtx, _input: usize, _total_batches: usize) -> Result<()> {
        self.close();
        ctx.node_finished();
        Ok(())
    }

    fn error_received(&self, ctx: &NodeCtx, _input: usize, error: BrookError) {
        if let Some(tx) = lock(&self.tx).as_ref() {
            let _ = tx.unbounded_send(Err(error));
        }
        self.close();
        ctx.node_finished();
    }
}
