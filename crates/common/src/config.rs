use serde::{Deserialize, Serialize};

/// Engine/session configuration shared across execution layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Buffered batch count in channel-backed stream adapters.
    ///
    /// Bounds how far a background producer can run ahead of its consumer
    /// before `send` suspends.
    pub stream_channel_capacity: usize,

    /// Local accumulator partition count per aggregate node.
    ///
    /// Each partition owns independent kernel states; partitions are merged
    /// pairwise at end-of-stream.
    pub aggregate_partitions: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stream_channel_capacity: 8,
            aggregate_partitions: default_aggregate_partitions(),
        }
    }
}

fn default_aggregate_partitions() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .min(8)
}
