//! Fragment layout for a Tide cell.
//!
//! A partition's layout is the ordered list of disks that hold its fragments:
//! the disk at position `i` holds fragment index `i` of every object hashed
//! into the partition. Layouts are a pure function of the partition, the
//! participating nodes and the online disk mask, so every node computes the
//! same answer without coordination.
//!
//! [`HashPlacement`] ranks disks by `blake3(partition ++ disk)` (rendezvous
//! hashing). An offline disk keeps its slot index; only that slot is handed to
//! the next-ranked online disk, so a single failure moves a single fragment.

mod hash;
mod layout;

pub use hash::HashPlacement;
pub use layout::{Layout, Placement};
