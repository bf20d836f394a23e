//! Checksum scrubbing.
//!
//! Every local fragment is opened, its footer verified, then each block.
//! A corrupt fragment is deleted outright; recovery rebuilds it from the
//! other holders on a later pass.

use std::sync::Arc;

use tide_store::StoreError;
use tide_types::events::{DiscardReason, FragmentDiscarded};
use tide_types::{FragmentRef, PartitionId};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::base::{RepairTask, TaskBase};
use super::{Steppable, check_cancel};
use crate::context::RepairContext;
use crate::error::RepairError;

/// Per-partition checksum scrubber.
pub struct ScanFrags {
    base: TaskBase,
}

enum Verdict {
    Healthy,
    Gone,
    Corrupt(String),
}

impl ScanFrags {
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

    async fn verify(
        &self,
        fragment: FragmentRef,
        cancel: &CancellationToken,
    ) -> Result<Verdict, RepairError> {
        let engine = &self.base.ctx.engine;
        let disk = self.base.disk;

        let blocks = match engine.verify_footer(disk, fragment).await {
            Ok(n) => n,
            Err(StoreError::NotFound(_)) => return Ok(Verdict::Gone),
            Err(e @ StoreError::Corrupted { .. }) => return Ok(Verdict::Corrupt(e.to_string())),
            Err(e) => return Err(e.into()),
        };

        for block in 0..blocks {
            check_cancel(cancel)?;
            match engine.verify_block(disk, fragment, block).await {
                Ok(()) => {}
                Err(StoreError::NotFound(_)) => return Ok(Verdict::Gone),
                Err(e @ StoreError::Corrupted { .. }) => {
                    return Ok(Verdict::Corrupt(e.to_string()));
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(Verdict::Healthy)
    }
}

#[async_trait::async_trait]
impl RepairTask for ScanFrags {
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
        let disk = self.base.disk;
        let fragments = self
            .base
            .ctx
            .local_lister
            .list_partition(disk, partition)
            .await?;

        let mut dropped = 0usize;
        for fragment in &fragments {
            check_cancel(cancel)?;
            match self.verify(*fragment, cancel).await {
                Ok(Verdict::Healthy) | Ok(Verdict::Gone) => {}
                Ok(Verdict::Corrupt(detail)) => {
                    warn!(%fragment, %disk, %detail, "corrupt fragment, deleting");
                    match self.base.ctx.engine.delete(disk, *fragment).await {
                        Ok(()) => {
                            dropped += 1;
                            self.base.ctx.events.emit(FragmentDiscarded {
                                fragment: *fragment,
                                disk,
                                reason: DiscardReason::Corrupt,
                            });
                        }
                        Err(e) => self.base.fault(fragment, &RepairError::from(e)),
                    }
                }
                Err(e) if e.is_abort() => return Err(e),
                Err(e) => self.base.fault(fragment, &e),
            }
        }

        debug!(%partition, %disk, scanned = fragments.len(), dropped, "scrub done");
        Ok(())
    }
}
