//! Operations nodes serve to each other.
//!
//! The transport is a collaborator: whatever carries the calls implements
//! [`PeerClient`] on the calling side and forwards to a [`LocalService`] on
//! the serving side.

use std::sync::Arc;

use tide_store::{FragmentLister, StoreError};
use tide_types::{DiskId, FragmentRef, NodeId, PartitionId, TempEntry};
use tracing::debug;

use crate::error::RepairError;
use crate::snapshot::{NodeSnapshot, SnapshotPublisher};

/// Calls a node makes on its peers.
#[async_trait::async_trait]
pub trait PeerClient: Send + Sync {
    /// The peer's latest published snapshot.
    async fn fetch_snapshot(&self, node: NodeId) -> Result<Arc<NodeSnapshot>, RepairError>;

    /// Committed fragments of `partition` on the peer's `disk`.
    async fn list_partition(
        &self,
        disk: DiskId,
        partition: PartitionId,
    ) -> Result<Vec<FragmentRef>, RepairError>;

    /// The peer's `disk` temp directory.
    async fn list_temp(&self, disk: DiskId) -> Result<Vec<TempEntry>, RepairError>;

    /// Every temp fragment on every disk of `node`.
    async fn list_node_temps(&self, node: NodeId) -> Result<Vec<(DiskId, TempEntry)>, RepairError>;
}

/// Server side of [`PeerClient`] for one node.
#[derive(Clone)]
pub struct LocalService {
    node: NodeId,
    disks: Vec<DiskId>,
    lister: Arc<dyn FragmentLister>,
    publisher: Arc<SnapshotPublisher>,
}

impl LocalService {
    /// Serve `disks` of `node` from `lister`, and snapshots from `publisher`.
    pub fn new(
        node: NodeId,
        disks: Vec<DiskId>,
        lister: Arc<dyn FragmentLister>,
        publisher: Arc<SnapshotPublisher>,
    ) -> Self {
        Self {
            node,
            disks,
            lister,
            publisher,
        }
    }

    /// The node this service answers for.
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Latest snapshot.
    pub fn snapshot(&self) -> Arc<NodeSnapshot> {
        self.publisher.latest()
    }

    /// Latest snapshot in wire form.
    pub fn snapshot_bytes(&self) -> Result<Vec<u8>, RepairError> {
        self.snapshot().encode()
    }

    fn check_local(&self, disk: DiskId) -> Result<(), RepairError> {
        if self.disks.contains(&disk) {
            Ok(())
        } else {
            Err(RepairError::PeerUnavailable {
                node: self.node,
                reason: format!("disk {disk} is not served here"),
            })
        }
    }

    /// List a partition directory of a local disk.
    pub async fn list_partition(
        &self,
        disk: DiskId,
        partition: PartitionId,
    ) -> Result<Vec<FragmentRef>, RepairError> {
        self.check_local(disk)?;
        Ok(self.lister.list_partition(disk, partition).await?)
    }

    /// List the temp directory of a local disk.
    pub async fn list_temp(&self, disk: DiskId) -> Result<Vec<TempEntry>, RepairError> {
        self.check_local(disk)?;
        Ok(self.lister.list_temp(disk).await?)
    }

    /// List the temp directories of every local disk.
    pub async fn list_node_temps(&self) -> Result<Vec<(DiskId, TempEntry)>, RepairError> {
        let mut out = Vec::new();
        for disk in &self.disks {
            let entries = self.lister.list_temp(*disk).await?;
            out.extend(entries.into_iter().map(|e| (*disk, e)));
        }
        debug!(node = %self.node, temps = out.len(), "listed node temps");
        Ok(out)
    }
}

impl std::fmt::Debug for LocalService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalService")
            .field("node", &self.node)
            .field("disks", &self.disks)
            .finish_non_exhaustive()
    }
}

/// A [`FragmentLister`] that reaches every disk of the cell: local disks
/// directly, remote disks through the peer client.
pub struct RoutedLister {
    node: NodeId,
    local: Arc<dyn FragmentLister>,
    peers: Arc<dyn PeerClient>,
}

impl RoutedLister {
    /// Route `node`'s own disks to `local` and everything else to `peers`.
    pub fn new(node: NodeId, local: Arc<dyn FragmentLister>, peers: Arc<dyn PeerClient>) -> Self {
        Self { node, local, peers }
    }
}

fn remote_error(err: RepairError) -> StoreError {
    match err {
        RepairError::Store(e) => e,
        other => StoreError::Remote(other.to_string()),
    }
}

#[async_trait::async_trait]
impl FragmentLister for RoutedLister {
    async fn list_partition(
        &self,
        disk: DiskId,
        partition: PartitionId,
    ) -> Result<Vec<FragmentRef>, StoreError> {
        if disk.node == self.node {
            return self.local.list_partition(disk, partition).await;
        }
        self.peers
            .list_partition(disk, partition)
            .await
            .map_err(remote_error)
    }

    async fn list_temp(&self, disk: DiskId) -> Result<Vec<TempEntry>, StoreError> {
        if disk.node == self.node {
            return self.local.list_temp(disk).await;
        }
        self.peers.list_temp(disk).await.map_err(remote_error)
    }
}
