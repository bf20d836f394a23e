//! The per-node context every repair component shares.

use std::sync::{Arc, RwLock};

use tide_cluster::Membership;
use tide_meta::MetaCache;
use tide_placement::{Layout, Placement};
use tide_store::{FragmentEngine, FragmentLister};
use tide_types::events::EventBus;
use tide_types::{DiskMask, NodeId, PartitionId, RedundancyScheme, Topology};
use tokio::sync::Semaphore;

use crate::config::ConfigHandle;
use crate::remote::{LocalService, PeerClient, RoutedLister};
use crate::snapshot::{NodeSnapshot, SnapshotPublisher};

/// Disk mask in effect the last time recovery converged cluster-wide.
///
/// Its layout (the "healed row") is the first place recovery copies a
/// missing fragment from.
#[derive(Debug, Default)]
pub struct HealedRow {
    mask: RwLock<Option<DiskMask>>,
}

impl HealedRow {
    /// The recorded mask, `None` until recovery has converged once.
    pub fn get(&self) -> Option<DiskMask> {
        self.mask.read().expect("lock poisoned").clone()
    }

    /// Record a new healed mask.
    pub fn set(&self, mask: DiskMask) {
        *self.mask.write().expect("lock poisoned") = Some(mask);
    }
}

/// Everything a node's repair engine needs, built once at startup.
pub struct RepairContext {
    /// This node.
    pub node: NodeId,
    /// Cell shape.
    pub topology: Topology,
    /// Redundancy scheme of stored objects.
    pub scheme: RedundancyScheme,
    /// Membership service.
    pub membership: Arc<dyn Membership>,
    /// Layout function.
    pub placement: Arc<dyn Placement>,
    /// Storage engine.
    pub engine: Arc<dyn FragmentEngine>,
    /// Lister for this node's own disks.
    pub local_lister: Arc<dyn FragmentLister>,
    /// Lister for any disk of the cell.
    pub lister: Arc<dyn FragmentLister>,
    /// System metadata cache.
    pub sys_cache: Arc<dyn MetaCache>,
    /// External metadata cache.
    pub ext_cache: Arc<dyn MetaCache>,
    /// Calls into other nodes.
    pub peers: Arc<dyn PeerClient>,
    /// Live configuration.
    pub config: ConfigHandle,
    /// Bounds concurrent recovery listings across the node.
    pub listing_pool: Arc<Semaphore>,
    /// Last cluster-wide recovery mask.
    pub healed: HealedRow,
    /// This node's published snapshot.
    pub publisher: Arc<SnapshotPublisher>,
    /// Repair notifications.
    pub events: EventBus,
}

impl RepairContext {
    /// Assemble a context from its collaborators.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        membership: Arc<dyn Membership>,
        placement: Arc<dyn Placement>,
        engine: Arc<dyn FragmentEngine>,
        local_lister: Arc<dyn FragmentLister>,
        sys_cache: Arc<dyn MetaCache>,
        ext_cache: Arc<dyn MetaCache>,
        peers: Arc<dyn PeerClient>,
        config: ConfigHandle,
    ) -> Arc<Self> {
        let node = membership.local_node();
        let topology = membership.topology();
        let current = config.current();
        let lister: Arc<dyn FragmentLister> =
            Arc::new(RoutedLister::new(node, local_lister.clone(), peers.clone()));
        Arc::new(Self {
            node,
            topology,
            scheme: current.scheme(),
            membership,
            placement,
            engine,
            local_lister,
            lister,
            sys_cache,
            ext_cache,
            peers,
            listing_pool: Arc::new(Semaphore::new(current.recovery.listing_concurrency.max(1))),
            config,
            healed: HealedRow::default(),
            publisher: Arc::new(SnapshotPublisher::new(NodeSnapshot::empty(node, topology))),
            events: EventBus::new(),
        })
    }

    /// Number of partitions (steps of a per-partition task).
    pub fn partitions(&self) -> u32 {
        self.placement.partition_count()
    }

    /// Layout of `partition` under `mask`.
    pub fn layout(&self, partition: PartitionId, mask: &DiskMask) -> Layout {
        self.placement.layout(partition, mask)
    }

    /// Layout of `partition` under the healed mask, if one is recorded.
    pub fn healed_layout(&self, partition: PartitionId) -> Option<Layout> {
        self.healed
            .get()
            .map(|mask| self.placement.layout(partition, &mask))
    }

    /// Serve this node's disks to peers.
    pub fn local_service(&self) -> LocalService {
        LocalService::new(
            self.node,
            self.membership.local_disks(),
            self.local_lister.clone(),
            self.publisher.clone(),
        )
    }
}

impl std::fmt::Debug for RepairContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepairContext")
            .field("node", &self.node)
            .field("topology", &self.topology)
            .field("scheme", &self.scheme)
            .finish_non_exhaustive()
    }
}
