//! Cell membership for Tide.
//!
//! This crate provides:
//!
//! - [`Membership`]: the seam the repair engine uses to learn which disks
//!   are online and which nodes are provisioned.
//! - [`ClusterState`]: the in-process implementation shared by every node
//!   view of one cell.
//! - [`ClusterEvent`]: membership changes broadcast to subscribers.

mod error;
mod state;

#[cfg(test)]
mod tests;

pub use error::ClusterError;
pub use state::{ClusterEvent, ClusterState, Membership};
