//! Error types for the cluster crate.

use tide_types::{DiskId, NodeId};

/// Errors produced by the membership view.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// The node is not part of the configured topology.
    #[error("node not found: {0}")]
    NodeNotFound(NodeId),

    /// The disk is not part of the configured topology.
    #[error("disk not found: {0}")]
    DiskNotFound(DiskId),
}
