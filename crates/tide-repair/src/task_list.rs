//! One stepper per (algorithm, local disk), kept in step with the disk mask
//! and the configuration.

use std::collections::BTreeMap;
use std::sync::Arc;

use tide_types::{DiskId, DiskMask, TaskLabel, Topology};
use tracing::{debug, info};

use crate::config::RepairConfig;
use crate::context::RepairContext;
use crate::snapshot::TaskCycle;
use crate::stepper::TaskStepper;
use crate::tasks::{REGISTRY, TaskInfo};

/// The steppers of one algorithm.
#[derive(Debug)]
pub struct TaskListElem {
    /// Registry entry.
    pub info: TaskInfo,
    /// One stepper per local disk.
    pub steppers: BTreeMap<DiskId, TaskStepper>,
}

impl TaskListElem {
    /// Disks whose stepper has just completed its cycles.
    pub fn done_mask(&self, topology: Topology) -> DiskMask {
        DiskMask::from_disks(
            topology,
            self.steppers
                .iter()
                .filter(|(_, s)| s.is_done())
                .map(|(disk, _)| *disk),
        )
    }
}

/// Every algorithm's steppers for this node.
#[derive(Debug)]
pub struct TaskList {
    topology: Topology,
    elems: Vec<TaskListElem>,
}

impl TaskList {
    /// Steppers for every registered algorithm on every local disk.
    pub fn new(ctx: &Arc<RepairContext>) -> Self {
        Self::with_registry(ctx, &REGISTRY)
    }

    /// Steppers for the algorithms in `registry` only.
    pub fn with_registry(ctx: &Arc<RepairContext>, registry: &[TaskInfo]) -> Self {
        let disks = ctx.membership.local_disks();
        let elems = registry
            .iter()
            .map(|info| TaskListElem {
                info: *info,
                steppers: disks
                    .iter()
                    .map(|disk| (*disk, TaskStepper::new(*info, ctx, *disk)))
                    .collect(),
            })
            .collect();
        Self {
            topology: ctx.topology,
            elems,
        }
    }

    /// Start, stop or update every stepper for `mask` and `config`.
    ///
    /// A stepper runs while its disk is online, not administratively
    /// disabled, and its task's cycle goal is not "don't run".
    pub async fn apply(&mut self, mask: &DiskMask, config: &RepairConfig) {
        for elem in &mut self.elems {
            let goal = config.cycle_goal(elem.info.label);
            for (disk, stepper) in &mut elem.steppers {
                let wanted = goal.is_enabled() && mask.contains(*disk) && !config.is_disabled(*disk);
                match (wanted, stepper.is_running()) {
                    (true, false) => {
                        info!(task = %elem.info.label, %disk, ?goal, "starting task");
                        stepper.start(goal, mask.clone());
                    }
                    (false, true) => {
                        info!(task = %elem.info.label, %disk, "stopping task");
                        stepper.stop().await;
                    }
                    (true, true) => {
                        stepper.set_cycle_goal(goal);
                        stepper.set_disk_mask(mask);
                    }
                    (false, false) => {}
                }
            }
        }
        debug!(%mask, "task list updated");
    }

    /// Per task, the local disks that just completed their cycles.
    pub fn compute_task_done_masks(&self) -> BTreeMap<TaskLabel, DiskMask> {
        self.elems
            .iter()
            .map(|e| (e.info.label, e.done_mask(self.topology)))
            .collect()
    }

    /// Statistics of every stepper.
    pub fn cycle_states(&self) -> Vec<TaskCycle> {
        self.elems
            .iter()
            .flat_map(|e| {
                e.steppers.iter().map(|(disk, s)| TaskCycle {
                    task: e.info.label,
                    disk: *disk,
                    state: s.cycle_state(),
                })
            })
            .collect()
    }

    /// The stepper of `task` on `disk`.
    pub fn stepper(&self, task: TaskLabel, disk: DiskId) -> Option<&TaskStepper> {
        self.elems
            .iter()
            .find(|e| e.info.label == task)?
            .steppers
            .get(&disk)
    }

    /// Every algorithm's steppers.
    pub fn elems(&self) -> &[TaskListElem] {
        &self.elems
    }

    /// Stop every stepper.
    pub async fn stop_all(&mut self) {
        for elem in &mut self.elems {
            for stepper in elem.steppers.values_mut() {
                stepper.stop().await;
            }
        }
    }
}
