//! The execution plan: an arena-owned DAG of exec nodes with lifecycle control.
//!
//! The plan owns every node; edges are id pairs, so the graph carries no
//! cyclic strong references. Start callbacks run in reverse topological order
//! (sinks first), stop callbacks in forward topological order (sources
//! first). The first error observed anywhere wins and triggers cooperative
//! shutdown; `finished` resolves once every sink is terminal and all spawned
//! tasks have drained.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use arrow_schema::SchemaRef;
use brook_common::{BrookError, EngineConfig, NodeId, NodeMetrics, Result};
use brook_compute::ExecBatch;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::node::{ExecNode, NodeCtx};

/// Poison-tolerant mutex lock.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy)]
struct Edge {
    consumer: NodeId,
    input: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeState {
    Built,
    Started,
    /// Stop has been requested; the node's `stop_producing` has not returned.
    Stopping,
    Stopped,
}

pub(crate) struct NodeSlot {
    node: Arc<dyn ExecNode>,
    inputs: Vec<NodeId>,
    input_schemas: Vec<SchemaRef>,
    outputs: Vec<Option<Edge>>,
    state: Mutex<NodeState>,
    finished: AtomicBool,
    metrics: NodeMetrics,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PlanState {
    Built,
    Started,
}

/// Shared plan state reachable from node contexts.
pub(crate) struct PlanCore {
    config: EngineConfig,
    topo: Mutex<Vec<NodeSlot>>,
    state: Mutex<PlanState>,
    stop_requested: AtomicBool,
    first_error: Mutex<Option<BrookError>>,
    inflight: AtomicUsize,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

impl PlanCore {
    pub(crate) fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn ctx(self: &Arc<Self>, id: NodeId) -> NodeCtx {
        NodeCtx {
            core: Arc::clone(self),
            id,
        }
    }

    /// Route a batch along `(from, output)` to its bound consumer.
    pub(crate) fn deliver_batch(
        self: &Arc<Self>,
        from: NodeId,
        output: usize,
        batch: ExecBatch,
    ) -> Result<()> {
        let (consumer, edge) = {
            let topo = lock(&self.topo);
            let slot = &topo[from.0];
            let edge = slot
                .outputs
                .get(output)
                .copied()
                .flatten()
                .ok_or_else(|| {
                    BrookError::Execution(format!(
                        "node '{}' emitted on unbound output {output}",
                        slot.node.label()
                    ))
                })?;
            slot.metrics.record_batch(batch.length as u64);
            (topo[edge.consumer.0].node.clone(), edge)
        };
        let ctx = self.ctx(edge.consumer);
        if let Err(e) = consumer.input_received(&ctx, edge.input, batch) {
            self.record_error(e.clone());
            self.stop_producing();
            return Err(e);
        }
        Ok(())
    }

    /// Signal end-of-stream along `(from, output)`.
    pub(crate) fn deliver_finish(self: &Arc<Self>, from: NodeId, output: usize, total: usize) {
        let target = {
            let topo = lock(&self.topo);
            topo[from.0]
                .outputs
                .get(output)
                .copied()
                .flatten()
                .map(|edge| (topo[edge.consumer.0].node.clone(), edge))
        };
        if let Some((consumer, edge)) = target {
            let ctx = self.ctx(edge.consumer);
            if let Err(e) = consumer.input_finished(&ctx, edge.input, total) {
                self.record_error(e);
                self.stop_producing();
            }
        }
    }

    /// Record the error, forward it along output 0, and stop the plan.
    pub(crate) fn forward_error(self: &Arc<Self>, from: NodeId, error: BrookError) {
        self.record_error(error.clone());
        let target = {
            let topo = lock(&self.topo);
            topo[from.0]
                .outputs
                .first()
                .copied()
                .flatten()
                .map(|edge| (topo[edge.consumer.0].node.clone(), edge))
        };
        if let Some((consumer, edge)) = target {
            let ctx = self.ctx(edge.consumer);
            consumer.error_received(&ctx, edge.input, error);
        }
        self.stop_producing();
    }

    fn record_error(&self, error: BrookError) {
        let mut first = lock(&self.first_error);
        if first.is_none() {
            warn!(error = %error, "execution plan captured error");
            *first = Some(error);
        }
    }

    pub(crate) fn mark_node_finished(self: &Arc<Self>, id: NodeId) {
        {
            let topo = lock(&self.topo);
            let slot = &topo[id.0];
            if slot.finished.swap(true, Ordering::SeqCst) {
                return;
            }
            debug!(
                node = slot.node.label(),
                batches = slot.metrics.batches(),
                rows = slot.metrics.rows(),
                "node finished"
            );
        }
        self.maybe_finish();
    }

    pub(crate) fn spawn_tracked(
        self: &Arc<Self>,
        fut: impl Future<Output = ()> + Send + 'static,
    ) -> Result<()> {
        let handle = tokio::runtime::Handle::try_current().map_err(|_| {
            BrookError::Invalid("plan execution requires a tokio runtime".to_string())
        })?;
        self.inflight.fetch_add(1, Ordering::SeqCst);
        let core = Arc::clone(self);
        handle.spawn(async move {
            fut.await;
            if core.inflight.fetch_sub(1, Ordering::SeqCst) == 1 {
                core.maybe_finish();
            }
        });
        Ok(())
    }

    fn maybe_finish(self: &Arc<Self>) {
        if self.inflight.load(Ordering::SeqCst) != 0 {
            return;
        }
        let sinks_done = {
            let topo = lock(&self.topo);
            topo.iter()
                .filter(|s| s.outputs.is_empty())
                .all(|s| s.finished.load(Ordering::SeqCst))
        };
        if sinks_done {
            let _ = self.done_tx.send(true);
        }
    }

    /// Cooperative shutdown: stop callbacks in forward topological order.
    pub(crate) fn stop_producing(self: &Arc<Self>) {
        if self.stop_requested.swap(true, Ordering::SeqCst) {
            return;
        }
        let order = self
            .topo_order()
            .unwrap_or_else(|_| (0..lock(&self.topo).len()).map(NodeId).collect());
        info!(nodes = order.len(), "stopping execution plan");

        let to_stop: Vec<(NodeId, Arc<dyn ExecNode>)> = {
            let topo = lock(&self.topo);
            order
                .iter()
                .filter_map(|&id| {
                    let mut state = lock(&topo[id.0].state);
                    if *state != NodeState::Started {
                        return None;
                    }
                    *state = NodeState::Stopping;
                    Some((id, topo[id.0].node.clone()))
                })
                .collect()
        };
        for (id, node) in &to_stop {
            node.stop_producing(&self.ctx(*id));
            let topo = lock(&self.topo);
            *lock(&topo[id.0].state) = NodeState::Stopped;
        }

        // a stopped node is finished by definition
        let all: Vec<NodeId> = {
            let topo = lock(&self.topo);
            (0..topo.len()).map(NodeId).collect()
        };
        for id in all {
            self.mark_node_finished(id);
        }
        self.maybe_finish();
    }

    /// Forward topological order (sources first) via Kahn's algorithm.
    fn topo_order(&self) -> Result<Vec<NodeId>> {
        let topo = lock(&self.topo);
        let n = topo.len();
        let mut indegree: Vec<usize> = topo.iter().map(|s| s.inputs.len()).collect();
        let mut queue: VecDeque<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
        let mut order = Vec::with_capacity(n);
        while let Some(i) = queue.pop_front() {
            order.push(NodeId(i));
            for edge in topo[i].outputs.iter().copied().flatten() {
                indegree[edge.consumer.0] -= 1;
                if indegree[edge.consumer.0] == 0 {
                    queue.push_back(edge.consumer.0);
                }
            }
        }
        if order.len() != n {
            return Err(BrookError::Invalid(
                "plan topology contains a cycle".to_string(),
            ));
        }
        Ok(order)
    }
}

/// Owner and lifecycle controller of an execution DAG.
pub struct ExecPlan {
    core: Arc<PlanCore>,
}

impl ExecPlan {
    /// Produce an empty plan with default configuration.
    pub fn make() -> Self {
        Self::with_config(EngineConfig::default())
    }

    /// Produce an empty plan with explicit configuration.
    pub fn with_config(config: EngineConfig) -> Self {
        let (done_tx, done_rx) = watch::channel(false);
        Self {
            core: Arc::new(PlanCore {
                config,
                topo: Mutex::new(Vec::new()),
                state: Mutex::new(PlanState::Built),
                stop_requested: AtomicBool::new(false),
                first_error: Mutex::new(None),
                inflight: AtomicUsize::new(0),
                done_tx,
                done_rx,
            }),
        }
    }

    /// Engine configuration this plan was built with.
    pub fn config(&self) -> &EngineConfig {
        self.core.config()
    }

    /// Attach a node, binding it as the consumer of each listed input.
    ///
    /// Each input's next free output slot binds to the new node, in input
    /// order. Inputs must already be part of the plan, which also makes
    /// cycles unrepresentable.
    pub fn add_node(&self, node: Arc<dyn ExecNode>, inputs: Vec<NodeId>) -> Result<NodeId> {
        if *lock(&self.core.state) != PlanState::Built {
            return Err(BrookError::Invalid(
                "cannot add nodes to a plan that has started".to_string(),
            ));
        }
        let mut topo = lock(&self.core.topo);
        let id = NodeId(topo.len());
        let mut input_schemas = Vec::with_capacity(inputs.len());
        for (input_idx, input) in inputs.iter().enumerate() {
            let slot = topo.get_mut(input.0).ok_or_else(|| {
                BrookError::Invalid(format!("input node {input} is not part of this plan"))
            })?;
            let free = slot.outputs.iter().position(|o| o.is_none()).ok_or_else(|| {
                BrookError::Invalid(format!(
                    "node '{}' has no free output for consumer '{}'",
                    slot.node.label(),
                    node.label()
                ))
            })?;
            slot.outputs[free] = Some(Edge {
                consumer: id,
                input: input_idx,
            });
            input_schemas.push(slot.node.output_schema());
        }
        debug!(node = node.label(), id = %id, "node added to plan");
        let num_outputs = node.num_outputs();
        topo.push(NodeSlot {
            node,
            inputs,
            input_schemas,
            outputs: vec![None; num_outputs],
            state: Mutex::new(NodeState::Built),
            finished: AtomicBool::new(false),
            metrics: NodeMetrics::default(),
        });
        Ok(id)
    }

    /// Check non-emptiness, output binding, schema agreement, and acyclicity.
    pub fn validate(&self) -> Result<()> {
        {
            let topo = lock(&self.core.topo);
            if topo.is_empty() {
                return Err(BrookError::Invalid("plan has no nodes".to_string()));
            }
            for slot in topo.iter() {
                if slot.outputs.iter().any(|o| o.is_none()) {
                    return Err(BrookError::Invalid(format!(
                        "node '{}' has unbound outputs",
                        slot.node.label()
                    )));
                }
                for (input, recorded) in slot.inputs.iter().zip(&slot.input_schemas) {
                    let upstream = topo[input.0].node.output_schema();
                    if upstream.as_ref() != recorded.as_ref() {
                        return Err(BrookError::TypeError(format!(
                            "schema mismatch on edge into '{}'",
                            slot.node.label()
                        )));
                    }
                }
            }
        }
        self.core.topo_order().map(|_| ())
    }

    /// Nodes with no inputs.
    pub fn sources(&self) -> Vec<NodeId> {
        let topo = lock(&self.core.topo);
        (0..topo.len())
            .filter(|&i| topo[i].inputs.is_empty())
            .map(NodeId)
            .collect()
    }

    /// Nodes with no outputs.
    pub fn sinks(&self) -> Vec<NodeId> {
        let topo = lock(&self.core.topo);
        (0..topo.len())
            .filter(|&i| topo[i].outputs.is_empty())
            .map(NodeId)
            .collect()
    }

    /// Output schema of a node.
    pub fn output_schema(&self, id: NodeId) -> Result<SchemaRef> {
        let topo = lock(&self.core.topo);
        topo.get(id.0)
            .map(|s| s.node.output_schema())
            .ok_or_else(|| BrookError::Invalid(format!("unknown node {id}")))
    }

    /// Label of a node.
    pub fn label(&self, id: NodeId) -> Result<String> {
        let topo = lock(&self.core.topo);
        topo.get(id.0)
            .map(|s| s.node.label().to_string())
            .ok_or_else(|| BrookError::Invalid(format!("unknown node {id}")))
    }

    /// Start every node in reverse topological order (sinks first).
    ///
    /// If a node's start fails, peers that already started are stopped in
    /// reverse-start order and the error is returned. A plan starts at most
    /// once; later attempts are `Invalid`.
    pub fn start_producing(&self) -> Result<()> {
        {
            let mut state = lock(&self.core.state);
            if *state != PlanState::Built {
                return Err(BrookError::Invalid(
                    "plan has already run; it cannot be restarted".to_string(),
                ));
            }
            *state = PlanState::Started;
        }
        let order = self.core.topo_order()?;
        info!(nodes = order.len(), "starting execution plan");

        let mut started: Vec<NodeId> = Vec::new();
        for &id in order.iter().rev() {
            let node = lock(&self.core.topo)[id.0].node.clone();
            let ctx = NodeCtx {
                core: Arc::clone(&self.core),
                id,
            };
            match node.start_producing(&ctx) {
                Ok(()) => {
                    let topo = lock(&self.core.topo);
                    *lock(&topo[id.0].state) = NodeState::Started;
                    started.push(id);
                }
                Err(e) => {
                    warn!(node = node.label(), error = %e, "node failed to start");
                    for &sid in started.iter().rev() {
                        let (peer, ctx) = {
                            let topo = lock(&self.core.topo);
                            *lock(&topo[sid.0].state) = NodeState::Stopping;
                            (topo[sid.0].node.clone(), self.core.ctx(sid))
                        };
                        peer.stop_producing(&ctx);
                        let topo = lock(&self.core.topo);
                        *lock(&topo[sid.0].state) = NodeState::Stopped;
                    }
                    self.core.record_error(e.clone());
                    let _ = self.core.done_tx.send(true);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Request cooperative shutdown; stop callbacks run in forward
    /// topological order (sources first). Idempotent.
    pub fn stop_producing(&self) {
        self.core.stop_producing();
    }

    /// Resolves when all nodes have stopped and in-flight work has drained,
    /// yielding the first captured error, or `Ok` for clean and cancelled
    /// runs alike.
    pub async fn finished(&self) -> Result<()> {
        let mut rx = self.core.done_rx.clone();
        // wait_for only fails if the sender is dropped, and the core owns it
        let _ = rx.wait_for(|done| *done).await;
        match lock(&self.core.first_error).clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
