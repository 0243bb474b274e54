//! Built-in exec node implementations.

pub mod aggregate;
pub mod filter;
pub mod project;
pub mod sink;
pub mod source;

pub use aggregate::AggregateNode;
pub use filter::FilterNode;
pub use project::ProjectNode;
pub use sink::{SinkNode, SinkStreamSlot};
pub use source::SourceNode;
