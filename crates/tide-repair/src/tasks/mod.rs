//! The repair algorithms and their registry.
//!
//! Every algorithm is a [`Steppable`]: the stepper drives it one step at a
//! time (one partition for most, the whole temp directory for
//! `RemoveTempFrags`) and cancels the step's token to abort it.
//!
//! The registry is a fixed table mapping each [`TaskLabel`] to its static
//! description and constructor.

use std::sync::Arc;

use tide_types::{Cycles, DiskId, DiskMask, TaskLabel};
use tokio_util::sync::CancellationToken;

use crate::context::RepairContext;
use crate::error::RepairError;

mod base;
pub mod populate_cache;
pub mod recover_lost;
pub mod remove_dup;
pub mod remove_temp;
pub mod scan;

pub use populate_cache::{CacheVariant, PopulateCache};
pub use recover_lost::RecoverLostFrags;
pub use remove_dup::RemoveDupFrags;
pub use remove_temp::{FragmentCounts, RemoveTempFrags, TempAction, classify};
pub use scan::ScanFrags;

/// One repair algorithm as seen by its stepper.
#[async_trait::async_trait]
pub trait Steppable: Send {
    /// Bind the algorithm to a task name and a local disk.
    fn init(&mut self, name: &str, disk: DiskId);

    /// Steps in one cycle.
    fn num_steps(&self) -> usize;

    /// Run step `index`, returning [`RepairError::Aborted`] once `cancel`
    /// fires.
    ///
    /// Recoverable per-object failures are counted, not returned; an `Err`
    /// means the whole step failed.
    async fn step(&mut self, index: usize, cancel: &CancellationToken) -> Result<(), RepairError>;

    /// Faults counted since the last reset.
    fn error_count(&self) -> u64;

    /// Zero the fault counter.
    fn reset_error_count(&mut self);

    /// Use `mask` as the online disk mask from now on.
    fn new_disk_mask(&mut self, mask: &DiskMask);
}

/// Static description of one algorithm.
#[derive(Clone, Copy, Debug)]
pub struct TaskInfo {
    /// Task label.
    pub label: TaskLabel,
    /// Cycles before the task stops on its own.
    pub cycles: Cycles,
    /// Whether a disk-mask change abandons the current cycle.
    pub mask_change_restarts_cycle: bool,
    /// Key of the task's cycle goal under `[tasks]`.
    pub cycle_goal_key: &'static str,
    /// Build an uninitialised instance.
    pub build: fn(Arc<RepairContext>) -> Box<dyn Steppable>,
}

/// Every algorithm, in [`TaskLabel::ALL`] order.
pub static REGISTRY: [TaskInfo; 6] = [
    TaskInfo {
        label: TaskLabel::RemoveDupFrags,
        cycles: Cycles::Infinite,
        mask_change_restarts_cycle: true,
        cycle_goal_key: "remove_dup_frags",
        build: RemoveDupFrags::boxed,
    },
    TaskInfo {
        label: TaskLabel::RemoveTempFrags,
        cycles: Cycles::Infinite,
        mask_change_restarts_cycle: true,
        cycle_goal_key: "remove_temp_frags",
        build: RemoveTempFrags::boxed,
    },
    TaskInfo {
        label: TaskLabel::PopulateSysCache,
        cycles: Cycles::Infinite,
        mask_change_restarts_cycle: true,
        cycle_goal_key: "populate_sys_cache",
        build: populate_cache::system,
    },
    TaskInfo {
        label: TaskLabel::PopulateExtCache,
        cycles: Cycles::Infinite,
        mask_change_restarts_cycle: true,
        cycle_goal_key: "populate_ext_cache",
        build: populate_cache::external,
    },
    TaskInfo {
        label: TaskLabel::RecoverLostFrags,
        cycles: Cycles::Infinite,
        mask_change_restarts_cycle: true,
        cycle_goal_key: "recover_lost_frags",
        build: RecoverLostFrags::boxed,
    },
    TaskInfo {
        label: TaskLabel::ScanFrags,
        cycles: Cycles::Infinite,
        mask_change_restarts_cycle: false,
        cycle_goal_key: "scan_frags",
        build: ScanFrags::boxed,
    },
];

/// The registry entry for `label`.
pub fn task_info(label: TaskLabel) -> &'static TaskInfo {
    &REGISTRY[label as usize]
}

/// Fail with [`RepairError::Aborted`] once `cancel` has fired.
pub(crate) fn check_cancel(cancel: &CancellationToken) -> Result<(), RepairError> {
    if cancel.is_cancelled() {
        Err(RepairError::Aborted)
    } else {
        Ok(())
    }
}
