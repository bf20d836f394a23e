//! Re-create fragments the layout expects on this disk.
//!
//! Each step lists the partition on every other holder (and the
//! pre-expansion holders while the cell is expanding), merges the listings
//! and recovers each object missing locally at this disk's fragment index.
//! Sources are tried in order: the healed-row holder, the pre-expansion
//! holder, then reconstruction by the storage engine.
//!
//! A listing that fails or misses the deadline aborts the whole step; a
//! partial merge would look like missing objects.

use std::collections::BTreeSet;
use std::sync::Arc;

use tide_placement::Layout;
use tide_store::{StoreError, StoredFragment};
use tide_types::events::{FragmentRepaired, RepairSource};
use tide_types::{DiskId, DiskMask, FragmentRef, ObjectIdentifier, PartitionId};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::base::{RepairTask, TaskBase};
use super::{Steppable, check_cancel};
use crate::context::RepairContext;
use crate::error::RepairError;
use crate::merge::merge;

/// Per-partition recovery of missing fragments.
pub struct RecoverLostFrags {
    base: TaskBase,
}

/// Layouts one step works against.
struct Rows {
    current: Layout,
    pre_expansion: Option<Layout>,
    healed: Option<Layout>,
}

impl RecoverLostFrags {
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

    /// Disks whose listings make up the cluster-visible view of `partition`.
    fn sources(&self, rows: &Rows, expected: usize) -> BTreeSet<DiskId> {
        let local = self.base.disk;
        let mask = &self.base.mask;
        let usable = |d: &DiskId| *d != local && mask.contains(*d);

        let mut sources: BTreeSet<DiskId> =
            rows.current.disks().iter().copied().filter(usable).collect();
        if let Some(pre) = &rows.pre_expansion {
            sources.extend(pre.disks().iter().copied().filter(usable));
        }
        if let Some(disk) = rows.healed.as_ref().and_then(|h| h.disk_for(expected)) {
            if usable(&disk) {
                sources.insert(disk);
            }
        }
        sources
    }

    /// List `partition` on every source concurrently and return one sorted
    /// object list per source.
    async fn list_all(
        &self,
        partition: PartitionId,
        sources: BTreeSet<DiskId>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Vec<ObjectIdentifier>>, RepairError> {
        let ctx = &self.base.ctx;
        let total = sources.len();
        let mut listings = JoinSet::new();

        for disk in sources {
            let lister = ctx.lister.clone();
            let pool = ctx.listing_pool.clone();
            listings.spawn(async move {
                let result = match pool.acquire_owned().await {
                    Ok(_permit) => lister.list_partition(disk, partition).await,
                    Err(_) => Err(StoreError::Remote("listing pool closed".to_string())),
                };
                (disk, result)
            });
        }

        let deadline = Instant::now() + ctx.config.current().listing_timeout();
        let mut lists = Vec::with_capacity(total);
        loop {
            let joined = tokio::select! {
                _ = cancel.cancelled() => {
                    listings.abort_all();
                    return Err(RepairError::Aborted);
                }
                joined = tokio::time::timeout_at(deadline, listings.join_next()) => joined,
            };
            let Ok(joined) = joined else {
                let pending = listings.len();
                listings.abort_all();
                warn!(%partition, pending, total, "partition listing timed out");
                return Err(RepairError::ListingTimeout {
                    partition,
                    pending,
                    total,
                });
            };
            let Some(joined) = joined else {
                break;
            };

            let (disk, result) =
                joined.map_err(|e| StoreError::Remote(format!("listing task failed: {e}")))?;
            let fragments = result.inspect_err(|e| {
                warn!(%partition, %disk, error = %e, "partition listing failed");
            })?;
            let mut objects: Vec<ObjectIdentifier> =
                fragments.into_iter().map(|f| f.object).collect();
            objects.dedup();
            lists.push(objects);
        }
        Ok(lists)
    }

    /// Copy `fragment` from `source`, if it has a usable copy.
    async fn copy_from(
        &self,
        source: DiskId,
        fragment: FragmentRef,
        allow_deleted: bool,
    ) -> Option<StoredFragment> {
        if source == self.base.disk || !self.base.mask.contains(source) {
            return None;
        }
        match self.base.ctx.engine.read(source, fragment).await {
            Ok(contents) if contents.deleted && !allow_deleted => {
                debug!(%fragment, %source, "skipping delete-marker");
                None
            }
            Ok(contents) => Some(contents),
            Err(e) => {
                debug!(%fragment, %source, error = %e, "copy source unusable");
                None
            }
        }
    }

    /// Obtain and write one missing fragment.
    async fn recover(
        &self,
        fragment: FragmentRef,
        rows: &Rows,
        mask: &DiskMask,
    ) -> Result<RepairSource, RepairError> {
        let ctx = &self.base.ctx;
        let expected = fragment.index as usize;
        let allow_deleted = ctx.config.current().recovery.allow_deleted_copy;

        let mut found = None;
        if let Some(disk) = rows.healed.as_ref().and_then(|h| h.disk_for(expected)) {
            found = self
                .copy_from(disk, fragment, allow_deleted)
                .await
                .map(|c| (c, RepairSource::HealedRow));
        }
        if found.is_none() {
            if let Some(disk) = rows.pre_expansion.as_ref().and_then(|p| p.disk_for(expected)) {
                found = self
                    .copy_from(disk, fragment, true)
                    .await
                    .map(|c| (c, RepairSource::PreExpansion));
            }
        }
        let (contents, source) = match found {
            Some(found) => found,
            None => (
                ctx.engine.reconstruct(fragment, &rows.current, mask).await?,
                RepairSource::Reconstructed,
            ),
        };

        ctx.engine.write(self.base.disk, fragment, contents).await?;
        Ok(source)
    }
}

#[async_trait::async_trait]
impl RepairTask for RecoverLostFrags {
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
        let local = self.base.disk;
        let mask = self.base.mask.clone();
        let ctx = self.base.ctx.clone();

        let rows = Rows {
            current: ctx.layout(partition, &mask),
            pre_expansion: ctx.placement.pre_expansion_layout(partition, &mask),
            healed: ctx.healed_layout(partition),
        };
        let Some(expected) = rows.current.fragment_index_for(local) else {
            return Ok(());
        };

        let sources = self.sources(&rows, expected);
        if sources.is_empty() {
            return Ok(());
        }
        let lists = self.list_all(partition, sources, cancel).await?;
        let objects = merge(&lists);

        let mut recovered = 0usize;
        for (object, _) in objects {
            check_cancel(cancel)?;
            let fragment = FragmentRef::new(object, expected as u8);
            match ctx.engine.stat(local, fragment).await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => {
                    self.base.fault(fragment, &RepairError::from(e));
                    continue;
                }
            }

            match self.recover(fragment, &rows, &mask).await {
                Ok(source) => {
                    recovered += 1;
                    ctx.events.emit(FragmentRepaired {
                        fragment,
                        disk: local,
                        source,
                    });
                    info!(%fragment, disk = %local, ?source, "recovered lost fragment");
                }
                Err(e) => self.base.fault(fragment, &e),
            }
        }

        debug!(%partition, disk = %local, recovered, "recovery step done");
        Ok(())
    }
}
