//! Layout type and the placement seam.

use tide_types::{DiskId, DiskMask, PartitionId};

/// Ordered disks of one partition; position = fragment index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    disks: Vec<DiskId>,
}

impl Layout {
    /// Wrap an ordered disk list.
    pub fn new(disks: Vec<DiskId>) -> Self {
        Self { disks }
    }

    /// The fragment index `disk` holds, if it is part of the layout.
    pub fn fragment_index_for(&self, disk: DiskId) -> Option<usize> {
        self.disks.iter().position(|d| *d == disk)
    }

    /// The disk holding fragment `index`.
    pub fn disk_for(&self, index: usize) -> Option<DiskId> {
        self.disks.get(index).copied()
    }

    /// Number of slots (always the scheme's total fragment count).
    pub fn len(&self) -> usize {
        self.disks.len()
    }

    /// Whether the layout has no slots.
    pub fn is_empty(&self) -> bool {
        self.disks.is_empty()
    }

    /// Whether `disk` holds any fragment of the partition.
    pub fn contains(&self, disk: DiskId) -> bool {
        self.disks.contains(&disk)
    }

    /// The disks in fragment-index order.
    pub fn disks(&self) -> &[DiskId] {
        &self.disks
    }
}

/// Maps a partition and a disk mask to the partition's layout.
///
/// Implementations must be deterministic: every node asking with the same
/// arguments gets the same layout.
pub trait Placement: Send + Sync {
    /// Number of partitions objects hash into.
    fn partition_count(&self) -> u32;

    /// Layout of `partition` under the online mask `mask`.
    fn layout(&self, partition: PartitionId, mask: &DiskMask) -> Layout;

    /// Layout `partition` had before the expansion in progress, if any.
    fn pre_expansion_layout(&self, partition: PartitionId, mask: &DiskMask) -> Option<Layout>;
}
