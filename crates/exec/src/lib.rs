//! Streaming execution plan for columnar batches.
//!
//! Architecture role:
//! - owns the exec-node DAG and its lifecycle (validate, start, stop, finish)
//! - implements the built-in source/filter/project/aggregate/sink nodes
//! - provides async batch stream adapters and declarative plan construction
//!
//! Data flows push-based: sources drive async batch streams into the graph,
//! interior nodes transform per batch, aggregate nodes fold into mergeable
//! kernel states, and sinks expose the results as a stream the caller pulls.

pub mod declaration;
pub mod node;
pub mod nodes;
pub mod plan;
pub mod stream;

// Re-export only what you want at the crate root (no globs).
pub use declaration::{
    register_node_factory, AggregateNodeOptions, Declaration, FilterNodeOptions, NodeFactory,
    NodeOptions, ProjectNodeOptions, SinkNodeOptions, SourceNodeOptions,
};
pub use node::{ExecNode, NodeCtx};
pub use nodes::{AggregateNode, FilterNode, ProjectNode, SinkNode, SinkStreamSlot, SourceNode};
pub use plan::ExecPlan;
pub use stream::{
    background_stream, batch_channel, transferred_stream, vector_stream, BatchSender, BatchStream,
};
