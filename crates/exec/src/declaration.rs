//! Declarative plan construction.
//!
//! A [`Declaration`] names a node kind plus its options; [`Declaration::sequence`]
//! wires a linear pipeline and [`Declaration::add_to_plan`] instantiates the
//! nodes through the process-wide factory registry. The registry is seeded
//! with the built-in kinds and accepts new factories at startup; it is
//! read-only during execution.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use arrow_schema::SchemaRef;
use brook_common::{BrookError, NodeId, Result};
use brook_compute::{AggregateOptions, Expr};

use crate::nodes::{AggregateNode, FilterNode, ProjectNode, SinkNode, SinkStreamSlot, SourceNode};
use crate::plan::ExecPlan;
use crate::stream::BatchStream;

/// Options for a source node.
pub struct SourceNodeOptions {
    /// Schema of every batch the stream yields.
    pub schema: SchemaRef,
    /// The async batch stream the source drives.
    pub stream: BatchStream,
}

/// Options for a filter node.
#[derive(Debug, Clone)]
pub struct FilterNodeOptions {
    /// Boolean predicate applied per row.
    pub predicate: Expr,
}

/// Options for a project node.
#[derive(Debug, Clone)]
pub struct ProjectNodeOptions {
    /// Expressions producing the output columns, in order.
    pub exprs: Vec<Expr>,
    /// Output field names; synthesized from expression text when `None`.
    pub names: Option<Vec<String>>,
}

/// Options for an aggregate node.
#[derive(Debug, Clone)]
pub struct AggregateNodeOptions {
    /// `(function name, options)` pairs; `None` options select defaults.
    /// Grouped functions carry the `hash_` prefix.
    pub aggregates: Vec<(String, Option<AggregateOptions>)>,
    /// Target column name per aggregate.
    pub targets: Vec<String>,
    /// Output field name per aggregate.
    pub names: Vec<String>,
    /// Key column names; empty for scalar aggregation.
    pub keys: Vec<String>,
}

/// Options for a sink node.
pub struct SinkNodeOptions {
    /// Slot the sink writes its output stream into.
    pub out: SinkStreamSlot,
}

/// Option payload dispatched to a node factory.
pub enum NodeOptions {
    /// Source options.
    Source(SourceNodeOptions),
    /// Filter options.
    Filter(FilterNodeOptions),
    /// Project options.
    Project(ProjectNodeOptions),
    /// Aggregate options.
    Aggregate(AggregateNodeOptions),
    /// Sink options.
    Sink(SinkNodeOptions),
}

/// A node kind plus options, with child declarations feeding its inputs.
pub struct Declaration {
    /// Registered node kind name.
    pub kind: String,
    /// Factory payload.
    pub options: NodeOptions,
    /// Declarations producing this node's inputs, in input order.
    pub inputs: Vec<Declaration>,
}

impl Declaration {
    /// A declaration with no inputs yet.
    pub fn new(kind: impl Into<String>, options: NodeOptions) -> Self {
        Self {
            kind: kind.into(),
            options,
            inputs: Vec::new(),
        }
    }

    /// Wire declarations into a linear pipeline: each declaration's single
    /// output feeds the next declaration's single input.
    pub fn sequence(decls: Vec<Declaration>) -> Result<Declaration> {
        let mut iter = decls.into_iter();
        let mut current = iter
            .next()
            .ok_or_else(|| BrookError::Invalid("empty declaration sequence".to_string()))?;
        for mut next in iter {
            next.inputs = vec![current];
            current = next;
        }
        Ok(current)
    }

    /// Instantiate this declaration (and its inputs, recursively) in `plan`.
    pub fn add_to_plan(self, plan: &ExecPlan) -> Result<NodeId> {
        let Declaration {
            kind,
            options,
            inputs,
        } = self;
        let input_ids = inputs
            .into_iter()
            .map(|d| d.add_to_plan(plan))
            .collect::<Result<Vec<_>>>()?;
        let factory = {
            let registry = registry().read().unwrap_or_else(|e| e.into_inner());
            *registry.get(kind.as_str()).ok_or_else(|| {
                BrookError::Invalid(format!("unknown node kind '{kind}'"))
            })?
        };
        factory(plan, input_ids, options)
    }
}

/// Constructor for one node kind.
pub type NodeFactory = fn(&ExecPlan, Vec<NodeId>, NodeOptions) -> Result<NodeId>;

static REGISTRY: OnceLock<RwLock<HashMap<String, NodeFactory>>> = OnceLock::new();

fn registry() -> &'static RwLock<HashMap<String, NodeFactory>> {
    REGISTRY.get_or_init(|| {
        let mut map: HashMap<String, NodeFactory> = HashMap::new();
        map.insert("source".to_string(), source_factory);
        map.insert("filter".to_string(), filter_factory);
        map.insert("project".to_string(), project_factory);
        map.insert("aggregate".to_string(), aggregate_factory);
        map.insert("sink".to_string(), sink_factory);
        RwLock::new(map)
    })
}

/// Register a node factory under a new kind name.
///
/// Intended for startup; built-in kinds cannot be replaced.
pub fn register_node_factory(name: &str, factory: NodeFactory) -> Result<()> {
    let mut map = registry().write().unwrap_or_else(|e| e.into_inner());
    if map.contains_key(name) {
        return Err(BrookError::Invalid(format!(
            "node kind '{name}' is already registered"
        )));
    }
    map.insert(name.to_string(), factory);
    Ok(())
}

fn single_input(kind: &str, inputs: &[NodeId]) -> Result<NodeId> {
    match inputs {
        [input] => Ok(*input),
        _ => Err(BrookError::Invalid(format!(
            "{kind} nodes take exactly one input, got {}",
            inputs.len()
        ))),
    }
}

fn source_factory(plan: &ExecPlan, inputs: Vec<NodeId>, options: NodeOptions) -> Result<NodeId> {
    let NodeOptions::Source(opts) = options else {
        return Err(BrookError::Invalid(
            "source requires SourceNodeOptions".to_string(),
        ));
    };
    if !inputs.is_empty() {
        return Err(BrookError::Invalid(
            "source nodes cannot have inputs".to_string(),
        ));
    }
    plan.add_node(Arc::new(SourceNode::new(opts.schema, opts.stream)), vec![])
}

fn filter_factory(plan: &ExecPlan, inputs: Vec<NodeId>, options: NodeOptions) -> Result<NodeId> {
    let NodeOptions::Filter(opts) = options else {
        return Err(BrookError::Invalid(
            "filter requires FilterNodeOptions".to_string(),
        ));
    };
    let input = single_input("filter", &inputs)?;
    let node = FilterNode::try_new(plan.output_schema(input)?, &opts.predicate)?;
    plan.add_node(Arc::new(node), inputs)
}

fn project_factory(plan: &ExecPlan, inputs: Vec<NodeId>, options: NodeOptions) -> Result<NodeId> {
    let NodeOptions::Project(opts) = options else {
        return Err(BrookError::Invalid(
            "project requires ProjectNodeOptions".to_string(),
        ));
    };
    let input = single_input("project", &inputs)?;
    let node = ProjectNode::try_new(
        plan.output_schema(input)?,
        &opts.exprs,
        opts.names.as_deref(),
    )?;
    plan.add_node(Arc::new(node), inputs)
}

fn aggregate_factory(plan: &ExecPlan, inputs: Vec<NodeId>, options: NodeOptions) -> Result<NodeId> {
    let NodeOptions::Aggregate(opts) = options else {
        return Err(BrookError::Invalid(
            "aggregate requires AggregateNodeOptions".to_string(),
        ));
    };
    let input = single_input("aggregate", &inputs)?;
    let node = AggregateNode::try_new(plan.output_schema(input)?, &opts)?;
    plan.add_node(Arc::new(node), inputs)
}

fn sink_factory(plan: &ExecPlan, inputs: Vec<NodeId>, options: NodeOptions) -> Result<NodeId> {
    let NodeOptions::Sink(opts) = options else {
        return Err(BrookError::Invalid(
            "sink requires SinkNodeOptions".to_string(),
        ));
    };
    let input = single_input("sink", &inputs)?;
    let node = SinkNode::new(plan.output_schema(input)?, &opts.out);
    plan.add_node(Arc::new(node), inputs)
}
