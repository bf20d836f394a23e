//! Rendezvous-hash placement with expansion support.

use std::collections::BTreeSet;
use std::sync::RwLock;

use tide_types::{DiskId, DiskMask, NodeId, PartitionId, RedundancyScheme, Topology};
use tracing::info;

use crate::layout::{Layout, Placement};

#[derive(Debug, Clone, Copy)]
struct NodeSpan {
    /// Nodes currently taking part in placement (`0..active`).
    active: u16,
    /// Participating node count before an expansion in progress.
    previous: Option<u16>,
}

/// Deterministic placement over the first `active` nodes of the topology.
#[derive(Debug)]
pub struct HashPlacement {
    topology: Topology,
    scheme: RedundancyScheme,
    partitions: u32,
    span: RwLock<NodeSpan>,
}

impl HashPlacement {
    /// Place over every node of `topology`.
    pub fn new(topology: Topology, scheme: RedundancyScheme, partitions: u32) -> Self {
        Self::with_active_nodes(topology, scheme, partitions, topology.node_count)
    }

    /// Place over the first `active` nodes only; the rest are not provisioned yet.
    pub fn with_active_nodes(
        topology: Topology,
        scheme: RedundancyScheme,
        partitions: u32,
        active: u16,
    ) -> Self {
        Self {
            topology,
            scheme,
            partitions,
            span: RwLock::new(NodeSpan {
                active: active.min(topology.node_count),
                previous: None,
            }),
        }
    }

    /// Start an expansion to `nodes` participating nodes.
    ///
    /// The node count in effect before the first call is kept for
    /// [`Placement::pre_expansion_layout`] until [`finish_expansion`](Self::finish_expansion).
    pub fn expand_to(&self, nodes: u16) {
        let mut span = self.span.write().expect("lock poisoned");
        let nodes = nodes.min(self.topology.node_count);
        if nodes == span.active {
            return;
        }
        if span.previous.is_none() {
            span.previous = Some(span.active);
        }
        info!(from = span.active, to = nodes, "placement expansion started");
        span.active = nodes;
    }

    /// Forget the pre-expansion node count.
    pub fn finish_expansion(&self) {
        let mut span = self.span.write().expect("lock poisoned");
        if span.previous.take().is_some() {
            info!(nodes = span.active, "placement expansion finished");
        }
    }

    /// Whether an expansion is in progress.
    pub fn is_expanding(&self) -> bool {
        self.span.read().expect("lock poisoned").previous.is_some()
    }

    /// Nodes currently taking part in placement.
    pub fn active_nodes(&self) -> u16 {
        self.span.read().expect("lock poisoned").active
    }

    fn compute(&self, partition: PartitionId, mask: &DiskMask, nodes: u16) -> Layout {
        let total = self.scheme.total();
        let ranked = ranked_disks(&self.topology, partition, nodes);

        // Base layout ignores the mask so slot indices stay put across failures.
        let mut slots: Vec<DiskId> = Vec::with_capacity(total);
        let mut used_nodes = BTreeSet::new();
        for disk in &ranked {
            if slots.len() == total {
                break;
            }
            if used_nodes.insert(disk.node) {
                slots.push(*disk);
            }
        }
        for disk in &ranked {
            if slots.len() == total {
                break;
            }
            if !slots.contains(disk) {
                slots.push(*disk);
            }
        }

        for i in 0..slots.len() {
            if mask.contains(slots[i]) {
                continue;
            }
            if let Some(substitute) = substitute_for(&ranked, &slots, mask) {
                slots[i] = substitute;
            }
        }

        Layout::new(slots)
    }
}

impl Placement for HashPlacement {
    fn partition_count(&self) -> u32 {
        self.partitions
    }

    fn layout(&self, partition: PartitionId, mask: &DiskMask) -> Layout {
        let active = self.active_nodes();
        self.compute(partition, mask, active)
    }

    fn pre_expansion_layout(&self, partition: PartitionId, mask: &DiskMask) -> Option<Layout> {
        let previous = self.span.read().expect("lock poisoned").previous?;
        Some(self.compute(partition, mask, previous))
    }
}

/// Best-ranked online disk not already in `slots`, preferring nodes the
/// online part of the layout does not use yet.
fn substitute_for(ranked: &[DiskId], slots: &[DiskId], mask: &DiskMask) -> Option<DiskId> {
    let online_nodes: BTreeSet<NodeId> = slots
        .iter()
        .filter(|d| mask.contains(**d))
        .map(|d| d.node)
        .collect();
    let mut candidates = ranked
        .iter()
        .filter(|d| mask.contains(**d) && !slots.contains(*d));
    let fallback = candidates.clone().next().copied();
    candidates
        .find(|d| !online_nodes.contains(&d.node))
        .copied()
        .or(fallback)
}

/// Disks of the first `nodes` nodes, highest score first.
fn ranked_disks(topology: &Topology, partition: PartitionId, nodes: u16) -> Vec<DiskId> {
    let mut scored: Vec<(u64, DiskId)> = topology
        .disks()
        .filter(|d| d.node.0 < nodes)
        .map(|d| (score(partition, d), d))
        .collect();
    scored.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
    scored.into_iter().map(|(_, d)| d).collect()
}

/// `blake3(partition ++ node ++ disk)` truncated to u64.
fn score(partition: PartitionId, disk: DiskId) -> u64 {
    let mut input = [0u8; 8];
    input[..4].copy_from_slice(&partition.0.to_le_bytes());
    input[4..6].copy_from_slice(&disk.node.0.to_le_bytes());
    input[6..].copy_from_slice(&disk.disk.to_le_bytes());
    let hash = blake3::hash(&input);
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash.as_bytes()[..8]);
    u64::from_le_bytes(bytes)
}
