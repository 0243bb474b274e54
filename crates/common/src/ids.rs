//! Typed identifiers shared across plan components.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable node identifier within an execution plan.
///
/// Node ids are arena indices: the plan owns a vector of nodes and edges are
/// expressed as id pairs, so the graph carries no cyclic strong references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(
    /// Raw index into the owning plan's node arena.
    pub usize,
);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
