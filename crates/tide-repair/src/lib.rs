//! Background repair for Tide.
//!
//! This crate provides:
//!
//! - [`TaskStepper`]: paced, interruptible cyclic executor for one
//!   (algorithm, disk) pair.
//! - [`TaskList`]: one stepper per local disk for every registered
//!   algorithm, reacting to disk-mask and config changes.
//! - [`Coordinator`]: per-node driver: propagates changes, aggregates
//!   cluster-wide completion from peer snapshots, tracks failure tolerance.
//! - [`NodeSnapshot`]: the per-node state peers and monitoring read.
//! - [`tasks`]: the six repair algorithms and their registry.
//! - [`merge`]: k-way merge of sorted listings with occurrence counts.
//! - [`LocalService`] / [`PeerClient`]: the remote operations peers use.

pub mod config;
mod context;
pub mod coordinator;
pub mod error;
pub mod merge;
pub mod remote;
pub mod snapshot;
pub mod stepper;
pub mod task_list;
pub mod tasks;
pub mod telemetry;

pub use config::{ConfigHandle, CycleGoal, RepairConfig};
pub use context::{HealedRow, RepairContext};
pub use coordinator::Coordinator;
pub use error::RepairError;
pub use remote::{LocalService, PeerClient, RoutedLister};
pub use snapshot::{ClusterDoneEvent, NodeSnapshot, SnapshotPublisher, TaskCycle};
pub use stepper::TaskStepper;
pub use task_list::{TaskList, TaskListElem};
pub use tasks::{REGISTRY, Steppable, TaskInfo};
