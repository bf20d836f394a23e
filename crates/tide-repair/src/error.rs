//! Error types for repair operations.

use tide_types::{NodeId, ObjectIdentifier, PartitionId};

/// Errors that can occur during repair operations.
#[derive(Debug, thiserror::Error)]
pub enum RepairError {
    /// Failed to access fragment storage.
    #[error("store error: {0}")]
    Store(#[from] tide_store::StoreError),

    /// Failed to access a metadata cache.
    #[error("metadata error: {0}")]
    Meta(#[from] tide_meta::MetaError),

    /// Failed to query membership.
    #[error("cluster error: {0}")]
    Cluster(#[from] tide_cluster::ClusterError),

    /// The step was asked to stop. Never counted as a fault.
    #[error("step aborted")]
    Aborted,

    /// Directory listings for a partition did not all finish in time.
    #[error("listing timed out for {partition}: {pending} of {total} outstanding")]
    ListingTimeout {
        /// The partition being recovered.
        partition: PartitionId,
        /// Listings still running at the deadline.
        pending: usize,
        /// Listings issued.
        total: usize,
    },

    /// Fragment counts contradict the redundancy scheme or the layout.
    #[error("inconsistent state for {object}: {detail}")]
    Inconsistent {
        /// The object being processed.
        object: ObjectIdentifier,
        /// What did not add up.
        detail: String,
    },

    /// A peer could not serve a remote operation.
    #[error("peer {node} unavailable: {reason}")]
    PeerUnavailable {
        /// The peer asked.
        node: NodeId,
        /// Why it failed.
        reason: String,
    },

    /// Snapshot encoding or decoding failed.
    #[error("snapshot codec error: {0}")]
    Codec(#[from] postcard::Error),

    /// Configuration is invalid.
    #[error("invalid config: {0}")]
    Config(String),
}

impl RepairError {
    /// Whether this is a cooperative abort rather than a failure.
    pub fn is_abort(&self) -> bool {
        matches!(self, RepairError::Aborted)
    }
}
