//! Shared types and identifiers for Tide.
//!
//! This crate defines the data model used across the Tide workspace:
//! cell addressing ([`NodeId`], [`DiskId`], [`Topology`], [`DiskMask`]),
//! object addressing ([`PartitionId`], [`ObjectIdentifier`], [`FragmentRef`],
//! [`TempEntry`]), the [`RedundancyScheme`], and the repair task model
//! ([`TaskLabel`], [`Cycles`], [`CycleState`]).

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

pub mod events;
mod mask;
mod task;

pub use mask::{DiskMask, Topology};
pub use task::{CycleState, Cycles, ParseTaskLabelError, TaskLabel};

// ---------------------------------------------------------------------------
// Cell addressing
// ---------------------------------------------------------------------------

/// Identifier for a node of the cell (its position in the configured node list).
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct NodeId(pub u16);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

/// A single disk, addressed by its owning node and its slot on that node.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct DiskId {
    /// The node that owns the disk.
    pub node: NodeId,
    /// Disk slot on the node, `0..disks_per_node`.
    pub disk: u16,
}

impl DiskId {
    /// Address disk `disk` on node `node`.
    pub const fn new(node: u16, disk: u16) -> Self {
        Self {
            node: NodeId(node),
            disk,
        }
    }
}

impl fmt::Display for DiskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.node.0, self.disk)
    }
}

// ---------------------------------------------------------------------------
// Object addressing
// ---------------------------------------------------------------------------

/// A hash bucket of object identifiers ("map id").
///
/// Placement of every fragment in the partition is decided by the layout
/// function from the partition id and the current disk mask.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct PartitionId(pub u32);

impl PartitionId {
    /// Hash an object chunk into one of `partitions` buckets.
    pub fn for_chunk(uid: u64, kind: ObjectKind, chunk: u32, partitions: u32) -> Self {
        let mut input = [0u8; 13];
        input[..8].copy_from_slice(&uid.to_le_bytes());
        input[8] = kind as u8;
        input[9..].copy_from_slice(&chunk.to_le_bytes());
        let hash = blake3::hash(&input);
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&hash.as_bytes()[..4]);
        Self(u32::from_le_bytes(bytes) % partitions.max(1))
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{:05}", self.0)
    }
}

/// What an object holds.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum ObjectKind {
    /// User payload.
    Data = 0,
    /// Object metadata (attributes, chunk maps).
    Metadata = 1,
}

/// Unique identity of one stored chunk.
///
/// Large objects are split into chunks that chain by `chunk` number; every
/// chunk is placed independently, so chunks of one object usually live in
/// different partitions.
///
/// Ordering is partition first, which keeps per-partition listings sorted.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectIdentifier {
    /// Partition the chunk hashes into.
    pub partition: PartitionId,
    /// Unique object id.
    pub uid: u64,
    /// Data or metadata.
    pub kind: ObjectKind,
    /// Position in the chunk chain, starting at 0.
    pub chunk: u32,
    /// Redundancy rule the chunk was stored under.
    pub rule: u8,
}

impl ObjectIdentifier {
    /// Build an identifier, hashing it into one of `partitions` partitions.
    pub fn new(uid: u64, kind: ObjectKind, chunk: u32, rule: u8, partitions: u32) -> Self {
        Self {
            partition: PartitionId::for_chunk(uid, kind, chunk, partitions),
            uid,
            kind,
            chunk,
            rule,
        }
    }

    /// The chunk preceding this one in the chain, if any.
    pub fn previous_chunk(&self, partitions: u32) -> Option<Self> {
        let chunk = self.chunk.checked_sub(1)?;
        Some(Self::new(self.uid, self.kind, chunk, self.rule, partitions))
    }

    /// Whether this is the first chunk of a data object (the user-visible entry).
    pub fn is_head(&self) -> bool {
        self.kind == ObjectKind::Data && self.chunk == 0
    }
}

impl fmt::Display for ObjectIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            ObjectKind::Data => 'd',
            ObjectKind::Metadata => 'm',
        };
        write!(
            f,
            "{:016x}{kind}{:06x}r{:02x}@{}",
            self.uid, self.chunk, self.rule, self.partition
        )
    }
}

impl fmt::Debug for ObjectIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectIdentifier({self})")
    }
}

/// One fragment of an object: the object plus its fragment index.
///
/// Fragment index `i` belongs on the disk at position `i` of the partition's
/// layout.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FragmentRef {
    /// The chunk the fragment belongs to.
    pub object: ObjectIdentifier,
    /// Fragment index, `0..scheme.total()`.
    pub index: u8,
}

impl FragmentRef {
    /// Fragment `index` of `object`.
    pub const fn new(object: ObjectIdentifier, index: u8) -> Self {
        Self { object, index }
    }
}

impl fmt::Display for FragmentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.object, self.index)
    }
}

impl fmt::Debug for FragmentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FragmentRef({self})")
    }
}

/// A listing entry from a disk's temp directory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TempEntry {
    /// The fragment written by an in-progress store.
    pub fragment: FragmentRef,
    /// Last modification time, unix milliseconds.
    pub modified_ms: u64,
}

// ---------------------------------------------------------------------------
// Redundancy
// ---------------------------------------------------------------------------

/// Erasure-coding parameters: `data` fragments rebuild an object, `parity`
/// fragments may be lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RedundancyScheme {
    /// Fragments required to rebuild (k).
    pub data: u8,
    /// Fragments that may be lost (m).
    pub parity: u8,
}

impl RedundancyScheme {
    /// Create a scheme with `data` required and `parity` redundant fragments.
    pub const fn new(data: u8, parity: u8) -> Self {
        Self { data, parity }
    }

    /// Total fragments per object (k + m).
    pub const fn total(&self) -> usize {
        self.data as usize + self.parity as usize
    }

    /// Fragments required to rebuild an object.
    pub const fn required(&self) -> usize {
        self.data as usize
    }

    /// Fragments that may be lost without data loss.
    pub const fn tolerance(&self) -> usize {
        self.parity as usize
    }
}

impl Default for RedundancyScheme {
    fn default() -> Self {
        Self { data: 4, parity: 2 }
    }
}

/// Current wall-clock time in unix milliseconds.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_is_deterministic_and_bounded() {
        for uid in 0..200u64 {
            let a = PartitionId::for_chunk(uid, ObjectKind::Data, 0, 16);
            let b = PartitionId::for_chunk(uid, ObjectKind::Data, 0, 16);
            assert_eq!(a, b);
            assert!(a.0 < 16);
        }
    }

    #[test]
    fn test_partition_spreads_chunks() {
        let partitions: std::collections::HashSet<_> = (0..64u32)
            .map(|chunk| PartitionId::for_chunk(7, ObjectKind::Data, chunk, 16))
            .collect();
        assert!(partitions.len() > 4, "chunks should spread across partitions");
    }

    #[test]
    fn test_previous_chunk_chain() {
        let third = ObjectIdentifier::new(42, ObjectKind::Data, 2, 1, 32);
        let second = third.previous_chunk(32).unwrap();
        assert_eq!(second.chunk, 1);
        assert_eq!(second.uid, 42);
        assert_eq!(
            second.partition,
            PartitionId::for_chunk(42, ObjectKind::Data, 1, 32)
        );
        let first = second.previous_chunk(32).unwrap();
        assert!(first.is_head());
        assert!(first.previous_chunk(32).is_none());
    }

    #[test]
    fn test_object_ordering_groups_by_partition() {
        let mut ids: Vec<_> = (0..50u64)
            .map(|uid| ObjectIdentifier::new(uid, ObjectKind::Data, 0, 0, 8))
            .collect();
        ids.sort();
        for pair in ids.windows(2) {
            assert!(pair[0].partition <= pair[1].partition);
        }
    }

    #[test]
    fn test_display_formats() {
        let id = ObjectIdentifier {
            partition: PartitionId(3),
            uid: 0xabc,
            kind: ObjectKind::Metadata,
            chunk: 2,
            rule: 1,
        };
        assert_eq!(id.to_string(), "0000000000000abcm000002r01@p00003");
        assert_eq!(FragmentRef::new(id, 4).to_string(), format!("{id}#4"));
        assert_eq!(DiskId::new(2, 5).to_string(), "2:5");
        assert_eq!(NodeId(7).to_string(), "node-7");
    }

    #[test]
    fn test_scheme_counts() {
        let scheme = RedundancyScheme::new(6, 2);
        assert_eq!(scheme.total(), 8);
        assert_eq!(scheme.required(), 6);
        assert_eq!(scheme.tolerance(), 2);
    }

    #[test]
    fn test_fragment_roundtrip_postcard() {
        let entry = TempEntry {
            fragment: FragmentRef::new(ObjectIdentifier::new(9, ObjectKind::Data, 0, 0, 4), 1),
            modified_ms: 1_700_000_000_000,
        };
        let bytes = postcard::to_allocvec(&entry).unwrap();
        let decoded: TempEntry = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(entry, decoded);
    }
}
