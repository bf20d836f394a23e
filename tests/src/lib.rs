//! Shared test harness for Tide repair integration tests.
//!
//! Provides [`IntegrationCell`]: an N-node cell in one process. Every node
//! gets its own membership view, metadata store, repair context and
//! [`Coordinator`]; all nodes share one [`MemoryStore`] holding every disk,
//! and peer calls are routed in-process by [`LoopbackPeers`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tide_cluster::{ClusterState, Membership};
use tide_meta::{CacheKind, MetaStore};
use tide_placement::{HashPlacement, Layout, Placement};
use tide_repair::tasks::task_info;
use tide_repair::{
    ConfigHandle, Coordinator, CycleGoal, LocalService, NodeSnapshot, PeerClient, RepairConfig,
    RepairContext, RepairError,
};
use tide_store::{FragmentEngine, FragmentLister, MemoryStore, SlowStore};
use tide_types::{
    DiskId, DiskMask, FragmentRef, NodeId, ObjectIdentifier, ObjectKind, PartitionId,
    RedundancyScheme, TaskLabel, TempEntry, Topology,
};

/// Partitions of every test cell.
pub const PARTITIONS: u32 = 16;

/// Checksum block size of the shared store.
const BLOCK_SIZE: usize = 64;

/// How long a test waits for the cell to settle.
pub const SETTLE_TIMEOUT: Duration = Duration::from_secs(20);

// =========================================================================
// Loopback peers
// =========================================================================

/// Routes peer calls straight to each node's [`LocalService`].
///
/// Supports failure injection: nodes in the down set are unreachable.
#[derive(Default)]
pub struct LoopbackPeers {
    services: RwLock<BTreeMap<NodeId, LocalService>>,
    down: RwLock<BTreeSet<NodeId>>,
}

impl LoopbackPeers {
    fn register(&self, service: LocalService) {
        self.services
            .write()
            .unwrap()
            .insert(service.node(), service);
    }

    /// Make `node` unreachable (or reachable again).
    pub fn set_down(&self, node: NodeId, down: bool) {
        let mut set = self.down.write().unwrap();
        if down {
            set.insert(node);
        } else {
            set.remove(&node);
        }
    }

    fn service(&self, node: NodeId) -> Result<LocalService, RepairError> {
        if self.down.read().unwrap().contains(&node) {
            return Err(RepairError::PeerUnavailable {
                node,
                reason: "node is down".to_string(),
            });
        }
        self.services
            .read()
            .unwrap()
            .get(&node)
            .cloned()
            .ok_or_else(|| RepairError::PeerUnavailable {
                node,
                reason: "unknown node".to_string(),
            })
    }
}

#[async_trait::async_trait]
impl PeerClient for LoopbackPeers {
    async fn fetch_snapshot(&self, node: NodeId) -> Result<Arc<NodeSnapshot>, RepairError> {
        // Go through the wire form, as a real transport would.
        let bytes = self.service(node)?.snapshot_bytes()?;
        Ok(Arc::new(NodeSnapshot::decode(&bytes)?))
    }

    async fn list_partition(
        &self,
        disk: DiskId,
        partition: PartitionId,
    ) -> Result<Vec<FragmentRef>, RepairError> {
        self.service(disk.node)?.list_partition(disk, partition).await
    }

    async fn list_temp(&self, disk: DiskId) -> Result<Vec<TempEntry>, RepairError> {
        self.service(disk.node)?.list_temp(disk).await
    }

    async fn list_node_temps(&self, node: NodeId) -> Result<Vec<(DiskId, TempEntry)>, RepairError> {
        self.service(node)?.list_node_temps().await
    }
}

// =========================================================================
// Cell
// =========================================================================

/// Knobs for building an [`IntegrationCell`].
#[derive(Debug, Clone)]
pub struct CellOptions {
    /// Configured nodes.
    pub nodes: u16,
    /// Disks per node.
    pub disks_per_node: u16,
    /// Redundancy scheme.
    pub scheme: RedundancyScheme,
    /// Nodes taking part in placement; the rest join through expansion.
    pub active_nodes: Option<u16>,
    /// Latency range of every partition listing, in milliseconds.
    pub list_latency_ms: Option<(u64, u64)>,
}

impl CellOptions {
    /// `nodes` single-disk nodes storing objects with `scheme`.
    pub fn new(nodes: u16, scheme: RedundancyScheme) -> Self {
        Self {
            nodes,
            disks_per_node: 1,
            scheme,
            active_nodes: None,
            list_latency_ms: None,
        }
    }
}

/// An in-process cell with one repair coordinator per node.
pub struct IntegrationCell {
    pub topology: Topology,
    pub scheme: RedundancyScheme,
    pub store: Arc<MemoryStore>,
    pub cluster: Arc<ClusterState>,
    pub placement: Arc<HashPlacement>,
    pub config: ConfigHandle,
    pub peers: Arc<LoopbackPeers>,
    contexts: Vec<Arc<RepairContext>>,
    coordinators: Vec<Coordinator>,
    down: BTreeSet<NodeId>,
    metas: Vec<Arc<MetaStore>>,
}

impl IntegrationCell {
    /// Build a cell with every task disabled.
    pub fn new(options: CellOptions) -> Self {
        tide_repair::telemetry::init("warn");

        let topology = Topology::new(options.nodes, options.disks_per_node);
        let scheme = options.scheme;
        let mut config = RepairConfig::default();
        config.cell.node_count = options.nodes;
        config.cell.disks_per_node = options.disks_per_node;
        config.cell.partitions = PARTITIONS;
        config.scheme.data = scheme.data;
        config.scheme.parity = scheme.parity;
        config.tasks.set_all(CycleGoal::Disabled);
        config.temp.min_age_secs = 0;
        config.coordinator.interval_ms = 10;
        config.validate().unwrap();
        let config = ConfigHandle::new(config);

        let store = Arc::new(MemoryStore::new(scheme).with_block_size(BLOCK_SIZE));
        let engine: Arc<dyn FragmentEngine>;
        let lister: Arc<dyn FragmentLister>;
        if let Some((min, max)) = options.list_latency_ms {
            let slow = Arc::new(SlowStore::new(store.clone()).list_latency(min, max).seed(7));
            engine = slow.clone();
            lister = slow;
        } else {
            engine = store.clone();
            lister = store.clone();
        }

        let cluster = ClusterState::new(NodeId(0), topology);
        let placement = Arc::new(HashPlacement::with_active_nodes(
            topology,
            scheme,
            PARTITIONS,
            options.active_nodes.unwrap_or(options.nodes),
        ));
        let peers = Arc::new(LoopbackPeers::default());

        let mut contexts = Vec::new();
        let mut coordinators = Vec::new();
        let mut metas = Vec::new();
        for node in topology.nodes() {
            let meta = Arc::new(MetaStore::open_temporary().unwrap());
            let ctx = RepairContext::new(
                cluster.view_as(node),
                placement.clone(),
                engine.clone(),
                lister.clone(),
                Arc::new(meta.cache(CacheKind::System)),
                Arc::new(meta.cache(CacheKind::External)),
                peers.clone(),
                config.clone(),
            );
            peers.register(ctx.local_service());
            coordinators.push(Coordinator::new(ctx.clone()));
            contexts.push(ctx);
            metas.push(meta);
        }

        Self {
            topology,
            scheme,
            store,
            cluster,
            placement,
            config,
            peers,
            contexts,
            coordinators,
            down: BTreeSet::new(),
            metas,
        }
    }

    /// Context of `node`.
    pub fn ctx(&self, node: NodeId) -> Arc<RepairContext> {
        self.contexts[node.0 as usize].clone()
    }

    /// Metadata store of `node`.
    pub fn meta(&self, node: NodeId) -> Arc<MetaStore> {
        self.metas[node.0 as usize].clone()
    }

    /// Coordinator of `node`.
    pub fn coordinator(&self, node: NodeId) -> &Coordinator {
        &self.coordinators[node.0 as usize]
    }

    /// Every disk of the cell.
    pub fn full_mask(&self) -> DiskMask {
        DiskMask::full(self.topology)
    }

    /// Layout of `partition` under the current disk mask.
    pub async fn layout(&self, partition: PartitionId) -> Layout {
        let mask = self.cluster.current_disk_mask().await;
        self.placement.layout(partition, &mask)
    }

    /// Set the cycle goal of `tasks`.
    pub fn enable(&self, tasks: &[TaskLabel], goal: CycleGoal) {
        self.config.update(|c| {
            for task in tasks {
                c.tasks.set_goal(task_info(*task).cycle_goal_key, goal);
            }
        });
    }

    /// Crash `node`: its repair stops, its disks go offline and become
    /// unreachable, and peers can't call it.
    pub async fn kill_node(&mut self, node: NodeId) {
        self.coordinators[node.0 as usize].stop_tasks().await;
        for disk in self.topology.disks_of(node) {
            self.store.set_reachable(disk, false);
        }
        self.cluster.set_node_offline(node).await.unwrap();
        self.peers.set_down(node, true);
        self.down.insert(node);
    }

    /// Restart `node` with a fresh coordinator. Its disks keep their contents.
    pub async fn revive_node(&mut self, node: NodeId) {
        for disk in self.topology.disks_of(node) {
            self.store.set_reachable(disk, true);
        }
        self.peers.set_down(node, false);
        self.cluster.set_node_online(node).await.unwrap();
        self.coordinators[node.0 as usize] = Coordinator::new(self.ctx(node));
        self.down.remove(&node);
    }

    /// One iteration of every live node's coordinator.
    pub async fn tick(&mut self) {
        for (n, coordinator) in self.coordinators.iter_mut().enumerate() {
            if !self.down.contains(&NodeId(n as u16)) {
                coordinator.tick().await;
            }
        }
    }

    /// Tick until `done` holds, failing after [`SETTLE_TIMEOUT`].
    pub async fn settle(&mut self, mut done: impl FnMut(&Self) -> bool) {
        let result = tokio::time::timeout(SETTLE_TIMEOUT, async {
            loop {
                self.tick().await;
                if done(&*self) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(result.is_ok(), "cell did not settle within {SETTLE_TIMEOUT:?}");
    }

    /// Tick until every live coordinator sees `task` done cluster-wide.
    pub async fn converge(&mut self, task: TaskLabel) {
        self.settle(|cell| {
            cell.live_nodes()
                .all(|n| cell.coordinator(n).is_cluster_done(task))
        })
        .await;
    }

    /// Nodes not killed by the test.
    pub fn live_nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.topology.nodes().filter(|n| !self.down.contains(n))
    }

    /// Stop every node's steppers.
    pub async fn shutdown(&mut self) {
        for coordinator in &mut self.coordinators {
            coordinator.stop_tasks().await;
        }
    }

    /// Whether every fragment of `object` sits committed on its layout disk
    /// with the expected contents.
    pub async fn is_intact(&self, object: ObjectIdentifier, shards: &[bytes::Bytes]) -> bool {
        let layout = self.layout(object.partition).await;
        shards.iter().enumerate().all(|(index, shard)| {
            let fragment = FragmentRef::new(object, index as u8);
            layout
                .disk_for(index)
                .and_then(|disk| self.store.peek(disk, fragment))
                .is_some_and(|stored| !stored.deleted && stored.data == *shard)
        })
    }
}

// =========================================================================
// Data helpers
// =========================================================================

/// Head chunk of data object `uid`.
pub fn object(uid: u64) -> ObjectIdentifier {
    ObjectIdentifier::new(uid, ObjectKind::Data, 0, 0, PARTITIONS)
}

/// Deterministic test payload of `len` bytes.
pub fn test_data_seeded(len: usize, seed: u32) -> Vec<u8> {
    let mut state = seed.wrapping_mul(2_654_435_761).max(1);
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state as u8
        })
        .collect()
}
