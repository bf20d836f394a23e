//! Per-node published repair state.
//!
//! A [`NodeSnapshot`] is written only by its node's coordinator and handed
//! out as an `Arc` to peers and monitoring; readers never mutate it.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tide_types::{CycleState, DiskId, DiskMask, NodeId, TaskLabel, Topology, unix_millis};

use crate::error::RepairError;

/// Cycle statistics of one (task, disk) stepper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCycle {
    /// The task.
    pub task: TaskLabel,
    /// The local disk it runs on.
    pub disk: DiskId,
    /// Progress and fault counters.
    pub state: CycleState,
}

/// The last cluster-wide-done transition of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterDoneEvent {
    /// When the transition was observed, unix milliseconds.
    pub at_ms: u64,
    /// Online disk mask at that moment.
    pub mask: DiskMask,
}

/// Everything a node publishes about its repair progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    /// The publishing node.
    pub node: NodeId,
    /// Publish counter, bumped on every publish.
    pub version: u64,
    /// When this version was published, unix milliseconds.
    pub published_ms: u64,
    /// Per task: local disks that just completed their cycles.
    pub local_done: BTreeMap<TaskLabel, DiskMask>,
    /// Per task: union of every reachable node's `local_done`.
    pub cluster_done: BTreeMap<TaskLabel, DiskMask>,
    /// Per task: the last cluster-wide-done transition.
    pub cluster_done_events: BTreeMap<TaskLabel, ClusterDoneEvent>,
    /// Disk failures not yet healed by recovery.
    pub unhealed: usize,
    /// Unhealed failures collapsed by owning node.
    pub unique_unhealed_nodes: usize,
    /// Published failure tolerance.
    pub tolerant: bool,
    /// Per-(task, disk) statistics.
    pub cycles: Vec<TaskCycle>,
}

impl NodeSnapshot {
    /// A snapshot with nothing done yet.
    pub fn empty(node: NodeId, topology: Topology) -> Self {
        let masks: BTreeMap<TaskLabel, DiskMask> = TaskLabel::ALL
            .into_iter()
            .map(|t| (t, DiskMask::empty(topology)))
            .collect();
        Self {
            node,
            version: 0,
            published_ms: 0,
            local_done: masks.clone(),
            cluster_done: masks,
            cluster_done_events: BTreeMap::new(),
            unhealed: 0,
            unique_unhealed_nodes: 0,
            tolerant: true,
            cycles: Vec::new(),
        }
    }

    /// Wire form.
    pub fn encode(&self) -> Result<Vec<u8>, RepairError> {
        Ok(postcard::to_allocvec(self)?)
    }

    /// Parse the wire form.
    pub fn decode(bytes: &[u8]) -> Result<Self, RepairError> {
        Ok(postcard::from_bytes(bytes)?)
    }

    /// Local done mask of `task`, empty if unknown.
    pub fn local_done(&self, task: TaskLabel, topology: Topology) -> DiskMask {
        self.local_done
            .get(&task)
            .cloned()
            .unwrap_or_else(|| DiskMask::empty(topology))
    }

    /// Whether `task` is done cluster-wide for every disk of `mask`.
    pub fn is_cluster_done(&self, task: TaskLabel, mask: &DiskMask) -> bool {
        self.cluster_done
            .get(&task)
            .is_some_and(|done| done.is_superset(mask))
    }

    /// Statistics of `task` on `disk`.
    pub fn cycle(&self, task: TaskLabel, disk: DiskId) -> Option<&CycleState> {
        self.cycles
            .iter()
            .find(|c| c.task == task && c.disk == disk)
            .map(|c| &c.state)
    }
}

/// Holder of a node's latest snapshot.
///
/// Readers get the current `Arc` and keep it as long as they like; the
/// coordinator swaps in a new one on every publish.
pub struct SnapshotPublisher {
    latest: RwLock<Arc<NodeSnapshot>>,
}

impl SnapshotPublisher {
    /// Start from `initial`.
    pub fn new(initial: NodeSnapshot) -> Self {
        Self {
            latest: RwLock::new(Arc::new(initial)),
        }
    }

    /// Publish `snapshot` under the next version number.
    pub fn publish(&self, mut snapshot: NodeSnapshot) -> Arc<NodeSnapshot> {
        let mut latest = self.latest.write().expect("lock poisoned");
        snapshot.version = latest.version + 1;
        snapshot.published_ms = unix_millis();
        let published = Arc::new(snapshot);
        *latest = published.clone();
        published
    }

    /// The most recently published snapshot.
    pub fn latest(&self) -> Arc<NodeSnapshot> {
        self.latest.read().expect("lock poisoned").clone()
    }
}

impl std::fmt::Debug for SnapshotPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotPublisher")
            .field("version", &self.latest().version)
            .finish()
    }
}
