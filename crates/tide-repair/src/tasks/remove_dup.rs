//! Delete fragments held by a disk the layout no longer assigns them to.
//!
//! A fragment whose rightful holder is another disk is only removed once
//! that holder is online and has its own copy. If the holder lacks it the
//! duplicate stays where it is; recovery will place the fragment correctly
//! and a later pass removes the duplicate.

use std::sync::Arc;

use tide_types::events::{DiscardReason, FragmentDiscarded};
use tide_types::{DiskId, FragmentRef, ObjectIdentifier, PartitionId};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::base::{RepairTask, TaskBase};
use super::{Steppable, check_cancel};
use crate::context::RepairContext;
use crate::error::RepairError;

/// Per-partition duplicate removal.
pub struct RemoveDupFrags {
    base: TaskBase,
}

impl RemoveDupFrags {
    /// Create an uninitialised instance.
    pub fn new(ctx: Arc<RepairContext>) -> Self {
        Self {
            base: TaskBase::new(ctx),
        }
    }

    /// Registry constructor.
    pub fn boxed(ctx: Arc<RepairContext>) -> Box<dyn Steppable> {
        Box::new(Self::new(ctx))
    }

    /// Resolve one misplaced fragment. Returns whether it was removed.
    async fn resolve(&self, fragment: FragmentRef, holder: DiskId) -> Result<bool, RepairError> {
        let ctx = &self.base.ctx;
        let local = self.base.disk;

        let Some(remote) = ctx.engine.stat(holder, fragment).await? else {
            debug!(%fragment, %holder, "holder lacks fragment, leaving duplicate for recovery");
            return Ok(false);
        };

        let Some(here) = ctx.engine.stat(local, fragment).await? else {
            return Ok(false);
        };

        if here.deleted && !remote.deleted {
            // The delete reached the wrong disk; replay it on the holder first.
            ctx.engine.mark_deleted(holder, fragment).await?;
            info!(%fragment, %holder, "replayed delete onto rightful holder");
        }

        ctx.engine.delete(local, fragment).await?;
        ctx.events.emit(FragmentDiscarded {
            fragment,
            disk: local,
            reason: DiscardReason::Duplicate,
        });
        info!(%fragment, disk = %local, %holder, "removed duplicate fragment");
        Ok(true)
    }
}

#[async_trait::async_trait]
impl RepairTask for RemoveDupFrags {
    fn base(&self) -> &TaskBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut TaskBase {
        &mut self.base
    }

    async fn run_step(
        &mut self,
        index: usize,
        cancel: &CancellationToken,
    ) -> Result<(), RepairError> {
        let partition = PartitionId(index as u32);
        let layout = self.base.layout(partition);
        let local = self.base.disk;
        let fragments = self
            .base
            .ctx
            .local_lister
            .list_partition(local, partition)
            .await?;

        let mut removed = 0usize;
        for fragment in fragments {
            check_cancel(cancel)?;

            let Some(holder) = layout.disk_for(fragment.index as usize) else {
                let err = inconsistent(fragment.object, "fragment index beyond layout");
                error!(%fragment, disk = %local, "fragment index beyond layout");
                self.base.fault(fragment, &err);
                continue;
            };
            if holder == local {
                continue;
            }
            if !self.base.mask.contains(holder) {
                debug!(%fragment, %holder, "holder offline, cannot verify duplicate");
                continue;
            }

            match self.resolve(fragment, holder).await {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => self.base.fault(fragment, &e),
            }
        }

        debug!(%partition, disk = %local, removed, "duplicate scan done");
        Ok(())
    }
}

fn inconsistent(object: ObjectIdentifier, detail: &str) -> RepairError {
    RepairError::Inconsistent {
        object,
        detail: detail.to_string(),
    }
}
