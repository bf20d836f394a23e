//! Core traits and types for fragment storage.

use bytes::Bytes;
use tide_placement::Layout;
use tide_types::{DiskId, DiskMask, FragmentRef, PartitionId, TempEntry};

use crate::error::StoreError;

/// Fragment contents as read from or written to a disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFragment {
    /// The erasure-coded shard bytes (empty for a delete-marker).
    pub data: Bytes,
    /// Length of the chunk the shard was cut from, needed to rebuild it.
    pub object_len: u64,
    /// Whether this is a delete-marker rather than live data.
    pub deleted: bool,
}

impl StoredFragment {
    /// A live fragment.
    pub fn live(data: Bytes, object_len: u64) -> Self {
        Self {
            data,
            object_len,
            deleted: false,
        }
    }

    /// A delete-marker.
    pub fn delete_marker() -> Self {
        Self {
            data: Bytes::new(),
            object_len: 0,
            deleted: true,
        }
    }
}

/// Cheap metadata about a committed fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentStat {
    /// Shard length in bytes.
    pub len: usize,
    /// Whether the fragment is a delete-marker.
    pub deleted: bool,
}

/// Reads, writes, verifies and rebuilds single fragments.
///
/// Every operation addresses one fragment on one disk. Implementations must
/// return [`StoreError::Unreachable`] for disks they cannot reach, so callers
/// can tell "absent" from "unknown".
#[async_trait::async_trait]
pub trait FragmentEngine: Send + Sync {
    /// Metadata of a committed fragment, `None` if absent.
    async fn stat(&self, disk: DiskId, fragment: FragmentRef)
    -> Result<Option<FragmentStat>, StoreError>;

    /// Whether the disk's temp directory holds `fragment`.
    async fn stat_temp(&self, disk: DiskId, fragment: FragmentRef) -> Result<bool, StoreError>;

    /// Read and fully verify a committed fragment.
    async fn read(&self, disk: DiskId, fragment: FragmentRef)
    -> Result<StoredFragment, StoreError>;

    /// Commit `contents` as `fragment` on `disk`, replacing any previous copy.
    async fn write(
        &self,
        disk: DiskId,
        fragment: FragmentRef,
        contents: StoredFragment,
    ) -> Result<(), StoreError>;

    /// Remove a committed fragment. Absent fragments are not an error.
    async fn delete(&self, disk: DiskId, fragment: FragmentRef) -> Result<(), StoreError>;

    /// Replace the committed fragment with a delete-marker.
    async fn mark_deleted(&self, disk: DiskId, fragment: FragmentRef) -> Result<(), StoreError>;

    /// Rebuild `fragment` from the other fragments of its object found on
    /// the online disks of `layout`.
    async fn reconstruct(
        &self,
        fragment: FragmentRef,
        layout: &Layout,
        mask: &DiskMask,
    ) -> Result<StoredFragment, StoreError>;

    /// Verify the footer and return the number of checksummed blocks.
    async fn verify_footer(&self, disk: DiskId, fragment: FragmentRef)
    -> Result<usize, StoreError>;

    /// Verify one checksummed block.
    async fn verify_block(
        &self,
        disk: DiskId,
        fragment: FragmentRef,
        block: usize,
    ) -> Result<(), StoreError>;

    /// Move a committed fragment back into the temp directory.
    async fn rollback_to_temp(&self, disk: DiskId, fragment: FragmentRef)
    -> Result<(), StoreError>;

    /// Remove a temp fragment. Absent fragments are not an error.
    async fn delete_temp(&self, disk: DiskId, fragment: FragmentRef) -> Result<(), StoreError>;
}

/// Lists a disk's fragment directories.
#[async_trait::async_trait]
pub trait FragmentLister: Send + Sync {
    /// Committed fragments of `partition` on `disk`, sorted.
    async fn list_partition(
        &self,
        disk: DiskId,
        partition: PartitionId,
    ) -> Result<Vec<FragmentRef>, StoreError>;

    /// Everything in `disk`'s temp directory, sorted.
    async fn list_temp(&self, disk: DiskId) -> Result<Vec<TempEntry>, StoreError>;
}
