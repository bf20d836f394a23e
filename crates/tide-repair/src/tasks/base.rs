//! State and plumbing shared by every algorithm.

use std::fmt::Display;
use std::sync::Arc;

use tide_placement::Layout;
use tide_types::{DiskId, DiskMask, PartitionId};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::Steppable;
use crate::context::RepairContext;
use crate::error::RepairError;

/// Fields every algorithm carries.
pub struct TaskBase {
    pub ctx: Arc<RepairContext>,
    pub name: String,
    pub disk: DiskId,
    pub mask: DiskMask,
    errors: u64,
}

impl TaskBase {
    pub fn new(ctx: Arc<RepairContext>) -> Self {
        let mask = DiskMask::empty(ctx.topology);
        Self {
            ctx,
            name: String::new(),
            disk: DiskId::default(),
            mask,
            errors: 0,
        }
    }

    /// Count a fault and log it.
    pub fn fault(&mut self, what: impl Display, err: &RepairError) {
        self.errors += 1;
        warn!(task = %self.name, disk = %self.disk, %what, error = %err, "repair fault");
    }

    /// Layout of `partition` under the current mask.
    pub fn layout(&self, partition: PartitionId) -> Layout {
        self.ctx.layout(partition, &self.mask)
    }

    /// Steps of a per-partition task.
    pub fn partition_steps(&self) -> usize {
        self.ctx.partitions() as usize
    }
}

/// The part of an algorithm that differs between algorithms.
#[async_trait::async_trait]
pub trait RepairTask: Send {
    fn base(&self) -> &TaskBase;

    fn base_mut(&mut self) -> &mut TaskBase;

    fn num_steps(&self) -> usize {
        self.base().partition_steps()
    }

    async fn run_step(&mut self, index: usize, cancel: &CancellationToken)
    -> Result<(), RepairError>;
}

#[async_trait::async_trait]
impl<T: RepairTask> Steppable for T {
    fn init(&mut self, name: &str, disk: DiskId) {
        let base = self.base_mut();
        base.name = name.to_string();
        base.disk = disk;
    }

    fn num_steps(&self) -> usize {
        RepairTask::num_steps(self).max(1)
    }

    async fn step(&mut self, index: usize, cancel: &CancellationToken) -> Result<(), RepairError> {
        self.run_step(index, cancel).await
    }

    fn error_count(&self) -> u64 {
        self.base().errors
    }

    fn reset_error_count(&mut self) {
        self.base_mut().errors = 0;
    }

    fn new_disk_mask(&mut self, mask: &DiskMask) {
        self.base_mut().mask = mask.clone();
    }
}
