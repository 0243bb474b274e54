//! Source node: drives an async batch stream into the plan.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use arrow_schema::SchemaRef;
use brook_common::{BrookError, Result};
use brook_compute::ExecBatch;
use futures::StreamExt;

use crate::node::{ExecNode, NodeCtx};
use crate::plan::lock;
use crate::stream::BatchStream;

/// Leaf node wrapping an async batch stream.
///
/// On start it spawns a driver task that pulls the stream and pushes each
/// batch downstream; on the terminator it signals `input_finished` with the
/// emitted count. Stop ceases further pulls even if the stream has more
/// items, dropping pending output.
pub struct SourceNode {
    label: String,
    schema: SchemaRef,
    stream: Mutex<Option<BatchStream>>,
    stopped: Arc<AtomicBool>,
}

impl SourceNode {
    /// Wrap `stream`, which must yield batches matching `schema`.
    pub fn new(schema: SchemaRef, stream: BatchStream) -> Self {
        Self {
            label: "source".to_string(),
            schema,
            stream: Mutex::new(Some(stream)),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl ExecNode for SourceNode {
    fn label(&self) -> &str {
        &self.label
    }

    fn num_outputs(&self) -> usize {
        1
    }

    fn output_schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    fn start_producing(&self, ctx: &NodeCtx) -> Result<()> {
        let mut stream = lock(&self.stream).take().ok_or_else(|| {
            BrookError::Invalid("source has already been started".to_string())
        })?;
        let stopped = Arc::clone(&self.stopped);
        let ctx = ctx.clone();
        ctx.clone().spawn(async move {
            let mut emitted = 0usize;
            loop {
                if stopped.load(Ordering::SeqCst) {
                    return;
                }
                match stream.next().await {
                    Some(Ok(batch)) => {
                        emitted += 1;
                        if ctx.emit(batch).is_err() {
                            return;
                        }
                    }
                    Some(Err(e)) => {
                        ctx.forward_error(e);
                        return;
                    }
                    None => break,
                }
            }
            if !stopped.load(Ordering::SeqCst) {
                ctx.finish_output(emitted);
            }
        })
    }

    fn stop_producing(&self, _ctx: &NodeCtx) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn input_received(&self, _ctx: &NodeCtx, _input: usize, _batch: ExecBatch) -> Result<()> {
        Err(BrookError::Invalid("source nodes have no inputs".to_string()))
    }

    fn input_finished(&self, _ctx: &NodeCtx, _input: usize, _total_batches: usize) -> Result<()> {
        Err(BrookError::Invalid("source nodes have no inputs".to_string()))
    }
}
