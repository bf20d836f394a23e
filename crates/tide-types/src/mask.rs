//! Cell topology and disk bitsets.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{DiskId, NodeId};

/// Shape of the cell: how many nodes are configured and how many disks each has.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Topology {
    /// Configured node count (including nodes not provisioned yet).
    pub node_count: u16,
    /// Disk slots per node.
    pub disks_per_node: u16,
}

impl Topology {
    /// Create a topology of `node_count` nodes with `disks_per_node` disks each.
    pub const fn new(node_count: u16, disks_per_node: u16) -> Self {
        Self {
            node_count,
            disks_per_node,
        }
    }

    /// Total disk slots in the cell.
    pub const fn total_disks(&self) -> usize {
        self.node_count as usize * self.disks_per_node as usize
    }

    /// Position of `disk` in a cell-wide bitset, if the disk exists.
    pub fn index_of(&self, disk: DiskId) -> Option<usize> {
        if disk.node.0 >= self.node_count || disk.disk >= self.disks_per_node {
            return None;
        }
        Some(disk.node.0 as usize * self.disks_per_node as usize + disk.disk as usize)
    }

    /// The disk at cell-wide position `index`.
    pub fn disk_at(&self, index: usize) -> DiskId {
        let per = self.disks_per_node.max(1) as usize;
        DiskId::new((index / per) as u16, (index % per) as u16)
    }

    /// All node ids.
    pub fn nodes(&self) -> impl Iterator<Item = NodeId> + use<> {
        (0..self.node_count).map(NodeId)
    }

    /// All disks of the cell in bitset order.
    pub fn disks(&self) -> impl Iterator<Item = DiskId> + use<> {
        let per = self.disks_per_node;
        (0..self.node_count).flat_map(move |n| (0..per).map(move |d| DiskId::new(n, d)))
    }

    /// Disks owned by `node`.
    pub fn disks_of(&self, node: NodeId) -> impl Iterator<Item = DiskId> + use<> {
        let per = self.disks_per_node;
        (0..per).map(move |d| DiskId {
            node,
            disk: d,
        })
    }
}

/// Bitset over every disk of the cell.
///
/// Used both for the online-disk mask published by the membership service and
/// for per-task "done" masks. Disks outside the topology are never members.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DiskMask {
    topology: Topology,
    words: Vec<u64>,
}

impl DiskMask {
    /// A mask with no disk set.
    pub fn empty(topology: Topology) -> Self {
        Self {
            topology,
            words: vec![0; topology.total_disks().div_ceil(64)],
        }
    }

    /// A mask with every disk of the topology set.
    pub fn full(topology: Topology) -> Self {
        let mut mask = Self::empty(topology);
        for disk in topology.disks() {
            mask.insert(disk);
        }
        mask
    }

    /// Build a mask from an iterator of disks.
    pub fn from_disks(topology: Topology, disks: impl IntoIterator<Item = DiskId>) -> Self {
        let mut mask = Self::empty(topology);
        for disk in disks {
            mask.insert(disk);
        }
        mask
    }

    /// The topology this mask is sized for.
    pub fn topology(&self) -> Topology {
        self.topology
    }

    /// Whether `disk` is set.
    pub fn contains(&self, disk: DiskId) -> bool {
        match self.topology.index_of(disk) {
            Some(i) => self.words[i / 64] & (1 << (i % 64)) != 0,
            None => false,
        }
    }

    /// Set `disk`. Returns `true` if it was not already set.
    pub fn insert(&mut self, disk: DiskId) -> bool {
        let Some(i) = self.topology.index_of(disk) else {
            return false;
        };
        let bit = 1u64 << (i % 64);
        let was_set = self.words[i / 64] & bit != 0;
        self.words[i / 64] |= bit;
        !was_set
    }

    /// Clear `disk`. Returns `true` if it was set.
    pub fn remove(&mut self, disk: DiskId) -> bool {
        let Some(i) = self.topology.index_of(disk) else {
            return false;
        };
        let bit = 1u64 << (i % 64);
        let was_set = self.words[i / 64] & bit != 0;
        self.words[i / 64] &= !bit;
        was_set
    }

    /// Number of disks set.
    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Whether no disk is set.
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    /// Iterate over the disks that are set, in cell order.
    pub fn iter(&self) -> impl Iterator<Item = DiskId> + '_ {
        self.topology.disks().filter(move |d| self.contains(*d))
    }

    /// Set every disk that is set in `other`.
    pub fn union_with(&mut self, other: &DiskMask) {
        for disk in other.iter() {
            self.insert(disk);
        }
    }

    /// Disks set in `self` but not in `other`.
    pub fn difference(&self, other: &DiskMask) -> DiskMask {
        DiskMask::from_disks(self.topology, self.iter().filter(|d| !other.contains(*d)))
    }

    /// Whether every disk set in `other` is also set in `self`.
    pub fn is_superset(&self, other: &DiskMask) -> bool {
        other.iter().all(|d| self.contains(d))
    }

    /// Distinct nodes owning at least one set disk.
    pub fn nodes(&self) -> BTreeSet<NodeId> {
        self.iter().map(|d| d.node).collect()
    }
}

impl fmt::Display for DiskMask {
    /// One digit per disk, nodes separated by `|`, e.g. `11|10|01`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for node in self.topology.nodes() {
            if node.0 > 0 {
                f.write_str("|")?;
            }
            for disk in self.topology.disks_of(node) {
                f.write_str(if self.contains(disk) { "1" } else { "0" })?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for DiskMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DiskMask({self})")
    }
}
