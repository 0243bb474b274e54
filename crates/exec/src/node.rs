//! The exec-node contract and the per-node plan handle.

use std::future::Future;
use std::sync::Arc;

use arrow_schema::SchemaRef;
use brook_common::{BrookError, EngineConfig, NodeId, Result};
use brook_compute::ExecBatch;

use crate::plan::PlanCore;

/// A vertex in the execution DAG.
///
/// Nodes are push-based: upstream delivers batches through `input_received`
/// and signals end-of-stream through `input_finished`. Callbacks take `&self`;
/// implementations use interior mutability, and the plan guarantees that one
/// node's callbacks are never invoked concurrently with each other.
pub trait ExecNode: Send + Sync {
    /// Stable node label for logging and tests.
    fn label(&self) -> &str;

    /// Number of output edges this node exposes. Zero for sinks.
    fn num_outputs(&self) -> usize;

    /// Schema of every batch emitted by this node.
    fn output_schema(&self) -> SchemaRef;

    /// Begin emitting (sources) or prepare internal state.
    ///
    /// Called by the plan in reverse topological order; an error here aborts
    /// the start and unwinds already started peers.
    fn start_producing(&self, ctx: &NodeCtx) -> Result<()>;

    /// Stop promptly and release resources. Must be idempotent.
    fn stop_producing(&self, ctx: &NodeCtx);

    /// Delivery of a batch from the `input`-th input.
    fn input_received(&self, ctx: &NodeCtx, input: usize, batch: ExecBatch) -> Result<()>;

    /// Input `input` will deliver no more batches; `total_batches` is the
    /// count it delivered.
    fn input_finished(&self, ctx: &NodeCtx, input: usize, total_batches: usize) -> Result<()>;

    /// A fatal error observed by input `input`.
    ///
    /// Default policy: forward downstream and request plan stop.
    fn error_received(&self, ctx: &NodeCtx, input: usize, error: BrookError) {
        let _ = input;
        ctx.forward_error(error);
    }
}

/// Per-node handle back to the owning plan.
///
/// Nodes use it to route batches to their consumers, report errors, spawn
/// driver tasks, and signal terminal states. Cheap to clone.
#[derive(Clone)]
pub struct NodeCtx {
    pub(crate) core: Arc<PlanCore>,
    pub(crate) id: NodeId,
}

impl NodeCtx {
    /// Id of the node this context belongs to.
    pub fn node_id(&self) -> NodeId {
        self.id
    }

    /// Engine configuration the plan was built with.
    pub fn config(&self) -> &EngineConfig {
        self.core.config()
    }

    /// Deliver a batch to the consumer bound to output 0.
    ///
    /// An error means the downstream rejected the batch and the plan is
    /// stopping; producers should cease work.
    pub fn emit(&self, batch: ExecBatch) -> Result<()> {
        self.core.deliver_batch(self.id, 0, batch)
    }

    /// Signal end-of-stream on output 0 with the emitted batch count.
    pub fn finish_output(&self, total_batches: usize) {
        self.core.deliver_finish(self.id, 0, total_batches);
    }

    /// Record `error` as the plan's first error (if none yet), forward it to
    /// the consumer on output 0, and request cooperative plan stop.
    pub fn forward_error(&self, error: BrookError) {
        self.core.forward_error(self.id, error);
    }

    /// Request cooperative shutdown of the whole plan.
    pub fn stop_plan(&self) {
        self.core.stop_producing();
    }

    /// Mark this node terminal; the plan finishes once every sink is terminal
    /// and all spawned tasks have drained.
    pub fn node_finished(&self) {
        self.core.mark_node_finished(self.id);
    }

    /// Spawn a plan-tracked task on the executor.
    pub fn spawn(&self, fut: impl Future<Output = ()> + Send + 'static) -> Result<()> {
        self.core.spawn_tracked(fut)
    }
}
