//! Cell membership state: online disk mask and provisioned nodes.
//!
//! [`ClusterState`] is the shared, read-mostly structure the repair engine
//! consults for the authoritative disk mask. Every node of an in-process cell
//! holds its own view (its own `local_node`) over the same underlying cell.

use std::collections::BTreeSet;
use std::sync::Arc;

use tide_types::{DiskId, DiskMask, NodeId, Topology};
use tokio::sync::{RwLock, broadcast};
use tracing::info;

use crate::error::ClusterError;

/// Membership changes broadcast to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    /// A disk came online.
    DiskOnline(DiskId),
    /// A disk went offline.
    DiskOffline(DiskId),
    /// A node joined the provisioned set.
    NodeProvisioned(NodeId),
    /// A node left the provisioned set.
    NodeUnprovisioned(NodeId),
}

/// What the repair engine needs to know about the cell.
#[async_trait::async_trait]
pub trait Membership: Send + Sync {
    /// This node.
    fn local_node(&self) -> NodeId;

    /// Configured cell shape.
    fn topology(&self) -> Topology;

    /// The authoritative online-disk mask.
    async fn current_disk_mask(&self) -> DiskMask;

    /// Nodes that have been provisioned into the cell.
    async fn provisioned_nodes(&self) -> BTreeSet<NodeId>;

    /// Subscribe to membership changes.
    fn subscribe(&self) -> broadcast::Receiver<ClusterEvent>;

    /// Whether `node` has been provisioned.
    async fn is_provisioned(&self, node: NodeId) -> bool {
        self.provisioned_nodes().await.contains(&node)
    }

    /// Disks owned by this node.
    fn local_disks(&self) -> Vec<DiskId> {
        self.topology().disks_of(self.local_node()).collect()
    }
}

struct Cell {
    topology: Topology,
    online: RwLock<DiskMask>,
    provisioned: RwLock<BTreeSet<NodeId>>,
    event_tx: broadcast::Sender<ClusterEvent>,
}

/// One node's view of the shared cell membership.
#[derive(Clone)]
pub struct ClusterState {
    local_node: NodeId,
    cell: Arc<Cell>,
}

impl ClusterState {
    /// Create a cell with every node provisioned and every disk online,
    /// viewed from `local_node`.
    pub fn new(local_node: NodeId, topology: Topology) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(256);
        Arc::new(Self {
            local_node,
            cell: Arc::new(Cell {
                topology,
                online: RwLock::new(DiskMask::full(topology)),
                provisioned: RwLock::new(topology.nodes().collect()),
                event_tx,
            }),
        })
    }

    /// The same cell seen from `node`.
    pub fn view_as(&self, node: NodeId) -> Arc<Self> {
        Arc::new(Self {
            local_node: node,
            cell: self.cell.clone(),
        })
    }

    fn check_disk(&self, disk: DiskId) -> Result<(), ClusterError> {
        match self.cell.topology.index_of(disk) {
            Some(_) => Ok(()),
            None => Err(ClusterError::DiskNotFound(disk)),
        }
    }

    fn check_node(&self, node: NodeId) -> Result<(), ClusterError> {
        if node.0 < self.cell.topology.node_count {
            Ok(())
        } else {
            Err(ClusterError::NodeNotFound(node))
        }
    }

    /// Mark `disk` online.
    pub async fn set_disk_online(&self, disk: DiskId) -> Result<(), ClusterError> {
        self.check_disk(disk)?;
        if self.cell.online.write().await.insert(disk) {
            info!(%disk, "disk online");
            let _ = self.cell.event_tx.send(ClusterEvent::DiskOnline(disk));
        }
        Ok(())
    }

    /// Mark `disk` offline.
    pub async fn set_disk_offline(&self, disk: DiskId) -> Result<(), ClusterError> {
        self.check_disk(disk)?;
        if self.cell.online.write().await.remove(disk) {
            info!(%disk, "disk offline");
            let _ = self.cell.event_tx.send(ClusterEvent::DiskOffline(disk));
        }
        Ok(())
    }

    /// Mark every disk of `node` online.
    pub async fn set_node_online(&self, node: NodeId) -> Result<(), ClusterError> {
        self.check_node(node)?;
        for disk in self.cell.topology.disks_of(node) {
            self.set_disk_online(disk).await?;
        }
        Ok(())
    }

    /// Mark every disk of `node` offline.
    pub async fn set_node_offline(&self, node: NodeId) -> Result<(), ClusterError> {
        self.check_node(node)?;
        for disk in self.cell.topology.disks_of(node) {
            self.set_disk_offline(disk).await?;
        }
        Ok(())
    }

    /// Add `node` to or remove it from the provisioned set.
    ///
    /// Unprovisioning also takes the node's disks offline.
    pub async fn set_provisioned(&self, node: NodeId, provisioned: bool) -> Result<(), ClusterError> {
        self.check_node(node)?;
        let changed = {
            let mut set = self.cell.provisioned.write().await;
            if provisioned {
                set.insert(node)
            } else {
                set.remove(&node)
            }
        };
        if !provisioned {
            self.set_node_offline(node).await?;
        }
        if changed {
            info!(%node, provisioned, "node provisioning changed");
            let event = if provisioned {
                ClusterEvent::NodeProvisioned(node)
            } else {
                ClusterEvent::NodeUnprovisioned(node)
            };
            let _ = self.cell.event_tx.send(event);
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Membership for ClusterState {
    fn local_node(&self) -> NodeId {
        self.local_node
    }

    fn topology(&self) -> Topology {
        self.cell.topology
    }

    async fn current_disk_mask(&self) -> DiskMask {
        self.cell.online.read().await.clone()
    }

    async fn provisioned_nodes(&self) -> BTreeSet<NodeId> {
        self.cell.provisioned.read().await.clone()
    }

    fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.cell.event_tx.subscribe()
    }
}

impl std::fmt::Debug for ClusterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterState")
            .field("local_node", &self.local_node)
            .field("topology", &self.cell.topology)
            .finish_non_exhaustive()
    }
}
