//! Resolve leftovers of interrupted stores.
//!
//! A store writes every fragment into its disk's temp directory and then
//! commits them one by one. A crash in between leaves temp fragments behind,
//! sometimes next to committed ones. This task looks at every temp fragment
//! older than `[temp] min_age_secs`, counts the object's committed and temp
//! fragments, and decides with [`classify`]:
//!
//! | committed | temp | crawled | action |
//! |-----------|------|---------|--------|
//! | ≥ data | any | any | [`Complete`](TempAction::Complete) |
//! | any | 0 | any | [`Nothing`](TempAction::Nothing) |
//! | 0 | ≥ total | any | [`DeleteAll`](TempAction::DeleteAll) |
//! | > 0 | > parity | any | [`Rollback`](TempAction::Rollback) |
//! | 0 | > parity | no | [`CrawlData`](TempAction::CrawlData) |
//! | < data | ≤ parity | no | [`CrawlTemp`](TempAction::CrawlTemp) |
//! | < data | > 0 | yes | [`DeleteAll`](TempAction::DeleteAll) |
//!
//! Crawling lists every disk of the cell and only happens while every
//! provisioned node is fully online; otherwise the object waits for the
//! next cycle. A crawl listing that fails ends the step.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use tide_types::events::{DiscardReason, FragmentDiscarded};
use tide_types::{
    DiskId, DiskMask, FragmentRef, ObjectIdentifier, PartitionId, RedundancyScheme, TempEntry,
    unix_millis,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::base::{RepairTask, TaskBase};
use super::{Steppable, check_cancel};
use crate::context::RepairContext;
use crate::error::RepairError;

/// Classification rounds per object before giving up.
const MAX_ROUNDS: usize = 4;

/// Distinct fragment indices of one object by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FragmentCounts {
    /// Indices with a committed copy somewhere.
    pub committed: usize,
    /// Indices with only temp copies.
    pub temp: usize,
}

/// What to do with an object that has temp fragments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TempAction {
    /// No temp fragments; leave it alone.
    Nothing,
    /// The store finished; delete leftover temp copies.
    Complete,
    /// The store never finished; delete every fragment.
    DeleteAll,
    /// Move committed fragments back to temp and classify again.
    Rollback,
    /// Look for committed fragments on every disk before deciding.
    CrawlData,
    /// Look for temp fragments on every disk before deciding.
    CrawlTemp,
}

/// Decide what to do with an object given its fragment counts.
///
/// `crawled` says the counts already include a full-cell crawl.
pub fn classify(counts: FragmentCounts, scheme: RedundancyScheme, crawled: bool) -> TempAction {
    let FragmentCounts { committed, temp } = counts;
    if committed >= scheme.required() {
        return TempAction::Complete;
    }
    if temp == 0 {
        return TempAction::Nothing;
    }
    if committed == 0 && temp >= scheme.total() {
        return TempAction::DeleteAll;
    }
    if temp > scheme.tolerance() {
        if committed > 0 {
            TempAction::Rollback
        } else if crawled {
            TempAction::DeleteAll
        } else {
            TempAction::CrawlData
        }
    } else if crawled {
        TempAction::DeleteAll
    } else {
        TempAction::CrawlTemp
    }
}

// ---------------------------------------------------------------------------
// Census
// ---------------------------------------------------------------------------

/// Where the fragments of one object were found.
#[derive(Debug, Clone, Default)]
pub(crate) struct Census {
    committed: BTreeMap<u8, BTreeSet<DiskId>>,
    temp: BTreeMap<u8, BTreeSet<DiskId>>,
}

impl Census {
    /// Count the online layout holders of `object` under `mask`.
    pub(crate) async fn take(
        ctx: &RepairContext,
        object: ObjectIdentifier,
        mask: &DiskMask,
    ) -> Result<Self, RepairError> {
        let layout = ctx.layout(object.partition, mask);
        let mut census = Census::default();
        for (index, disk) in layout.disks().iter().enumerate() {
            if !mask.contains(*disk) {
                continue;
            }
            let fragment = FragmentRef::new(object, index as u8);
            if ctx.engine.stat(*disk, fragment).await?.is_some() {
                census.add_committed(fragment.index, *disk);
            }
            if ctx.engine.stat_temp(*disk, fragment).await? {
                census.add_temp(fragment.index, *disk);
            }
        }
        Ok(census)
    }

    fn add_committed(&mut self, index: u8, disk: DiskId) {
        self.committed.entry(index).or_default().insert(disk);
    }

    fn add_temp(&mut self, index: u8, disk: DiskId) {
        self.temp.entry(index).or_default().insert(disk);
    }

    pub(crate) fn counts(&self) -> FragmentCounts {
        FragmentCounts {
            committed: self.committed.len(),
            temp: self
                .temp
                .keys()
                .filter(|i| !self.committed.contains_key(i))
                .count(),
        }
    }

    /// Committed copies become temp copies.
    fn rolled_back(&mut self) {
        for (index, disks) in std::mem::take(&mut self.committed) {
            self.temp.entry(index).or_default().extend(disks);
        }
    }

    fn committed_locations(&self) -> impl Iterator<Item = (u8, DiskId)> + '_ {
        self.committed
            .iter()
            .flat_map(|(i, disks)| disks.iter().map(move |d| (*i, *d)))
    }

    fn temp_locations(&self) -> impl Iterator<Item = (u8, DiskId)> + '_ {
        self.temp
            .iter()
            .flat_map(|(i, disks)| disks.iter().map(move |d| (*i, *d)))
    }
}

/// Whether `object` looks like a store still in flight.
pub(crate) async fn is_partial_store(
    ctx: &RepairContext,
    object: ObjectIdentifier,
    mask: &DiskMask,
) -> Result<bool, RepairError> {
    let census = Census::take(ctx, object, mask).await?;
    Ok(!matches!(
        classify(census.counts(), ctx.scheme, false),
        TempAction::Nothing | TempAction::Complete
    ))
}

// ---------------------------------------------------------------------------
// Crawl
// ---------------------------------------------------------------------------

/// Listings of every disk of the cell, gathered once per step.
struct Crawl {
    disks: Vec<DiskId>,
    temps: Vec<(DiskId, TempEntry)>,
    partitions: HashMap<PartitionId, Vec<(DiskId, FragmentRef)>>,
}

enum CrawlState {
    NotTried,
    Unreachable,
    /// A listing failed; the rest of the step is abandoned.
    Failed,
    Ready(Crawl),
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// Single-step temp directory cleanup.
pub struct RemoveTempFrags {
    base: TaskBase,
}

impl RemoveTempFrags {
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

    /// List every temp directory of the cell, or `None` if any disk of a
    /// provisioned node is offline.
    async fn crawl(&self) -> Result<Option<Crawl>, RepairError> {
        let ctx = &self.base.ctx;
        let mask = ctx.membership.current_disk_mask().await;
        let nodes = ctx.membership.provisioned_nodes().await;
        let disks: Vec<DiskId> = nodes
            .iter()
            .flat_map(|n| ctx.topology.disks_of(*n))
            .collect();
        if let Some(offline) = disks.iter().find(|d| !mask.contains(**d)) {
            info!(disk = %self.base.disk, %offline, "cell not fully reachable, deferring crawl");
            return Ok(None);
        }

        let mut temps = Vec::new();
        for node in nodes {
            if node == ctx.node {
                for disk in ctx.membership.local_disks() {
                    let entries = ctx.local_lister.list_temp(disk).await?;
                    temps.extend(entries.into_iter().map(|e| (disk, e)));
                }
            } else {
                temps.extend(ctx.peers.list_node_temps(node).await?);
            }
        }
        debug!(disk = %self.base.disk, disks = disks.len(), temps = temps.len(), "crawled cell");
        Ok(Some(Crawl {
            disks,
            temps,
            partitions: HashMap::new(),
        }))
    }

    /// Fold every crawled location of `object` into `census`.
    async fn apply_crawl(
        &self,
        crawl: &mut Crawl,
        object: ObjectIdentifier,
        census: &mut Census,
    ) -> Result<(), RepairError> {
        if !crawl.partitions.contains_key(&object.partition) {
            let mut listed = Vec::new();
            for disk in &crawl.disks {
                let fragments = self
                    .base
                    .ctx
                    .lister
                    .list_partition(*disk, object.partition)
                    .await?;
                listed.extend(fragments.into_iter().map(|f| (*disk, f)));
            }
            crawl.partitions.insert(object.partition, listed);
        }

        for (disk, fragment) in crawl.partitions.get(&object.partition).into_iter().flatten() {
            if fragment.object == object {
                census.add_committed(fragment.index, *disk);
            }
        }
        for (disk, entry) in &crawl.temps {
            if entry.fragment.object == object {
                census.add_temp(entry.fragment.index, *disk);
            }
        }
        Ok(())
    }

    /// Classify and act on one object. Returns the previous chunk when a
    /// delete should cascade to it.
    async fn resolve(
        &self,
        object: ObjectIdentifier,
        local_temps: &BTreeMap<ObjectIdentifier, Vec<u8>>,
        crawl: &mut CrawlState,
    ) -> Result<Option<ObjectIdentifier>, RepairError> {
        let ctx = &self.base.ctx;
        let local = self.base.disk;
        let mut census = Census::take(ctx, object, &self.base.mask).await?;
        for index in local_temps.get(&object).into_iter().flatten() {
            census.add_temp(*index, local);
        }

        let mut crawled = false;
        for _ in 0..MAX_ROUNDS {
            let counts = census.counts();
            let action = classify(counts, ctx.scheme, crawled);
            debug!(%object, ?counts, ?action, crawled, "classified temp object");

            match action {
                TempAction::Nothing => return Ok(None),
                TempAction::Complete => {
                    self.complete(object, &census).await?;
                    return Ok(None);
                }
                TempAction::DeleteAll => {
                    self.delete_all(object, &census).await?;
                    return Ok(object.previous_chunk(ctx.partitions()));
                }
                TempAction::Rollback => {
                    for (index, disk) in census.committed_locations() {
                        ctx.engine
                            .rollback_to_temp(disk, FragmentRef::new(object, index))
                            .await?;
                    }
                    info!(%object, ?counts, "rolled committed fragments back to temp");
                    census.rolled_back();
                }
                TempAction::CrawlData | TempAction::CrawlTemp => {
                    if crawled {
                        break;
                    }
                    if matches!(crawl, CrawlState::NotTried) {
                        *crawl = match self.crawl().await {
                            Ok(Some(c)) => CrawlState::Ready(c),
                            Ok(None) => CrawlState::Unreachable,
                            Err(e) => {
                                *crawl = CrawlState::Failed;
                                return Err(e);
                            }
                        };
                    }
                    let CrawlState::Ready(c) = crawl else {
                        debug!(%object, "deferring until the cell is fully reachable");
                        return Ok(None);
                    };
                    if let Err(e) = self.apply_crawl(c, object, &mut census).await {
                        *crawl = CrawlState::Failed;
                        return Err(e);
                    }
                    crawled = true;
                }
            }
        }

        Err(RepairError::Inconsistent {
            object,
            detail: format!("classification did not settle: {:?}", census.counts()),
        })
    }

    /// Drop the leftover temp copies on this disk.
    async fn complete(&self, object: ObjectIdentifier, census: &Census) -> Result<(), RepairError> {
        let local = self.base.disk;
        for (index, disk) in census.temp_locations() {
            if disk != local {
                continue;
            }
            let fragment = FragmentRef::new(object, index);
            self.base.ctx.engine.delete_temp(disk, fragment).await?;
            self.discarded(fragment, disk);
            debug!(%fragment, %disk, "removed leftover temp copy of complete object");
        }
        Ok(())
    }

    /// Remove every known copy of an object that never finished storing.
    async fn delete_all(&self, object: ObjectIdentifier, census: &Census) -> Result<(), RepairError> {
        let engine = &self.base.ctx.engine;
        let counts = census.counts();
        for (index, disk) in census.committed_locations() {
            let fragment = FragmentRef::new(object, index);
            engine.delete(disk, fragment).await?;
            self.discarded(fragment, disk);
        }
        for (index, disk) in census.temp_locations() {
            let fragment = FragmentRef::new(object, index);
            engine.delete_temp(disk, fragment).await?;
            self.discarded(fragment, disk);
        }
        info!(%object, ?counts, "deleted incomplete store");
        Ok(())
    }

    fn discarded(&self, fragment: FragmentRef, disk: DiskId) {
        self.base.ctx.events.emit(FragmentDiscarded {
            fragment,
            disk,
            reason: DiscardReason::Temp,
        });
    }
}

#[async_trait::async_trait]
impl RepairTask for RemoveTempFrags {
    fn base(&self) -> &TaskBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut TaskBase {
        &mut self.base
    }

    fn num_steps(&self) -> usize {
        1
    }

    async fn run_step(
        &mut self,
        _index: usize,
        cancel: &CancellationToken,
    ) -> Result<(), RepairError> {
        let local = self.base.disk;
        let min_age_ms = self.base.ctx.config.current().temp_min_age_ms();
        let now = unix_millis();

        let entries = self.base.ctx.local_lister.list_temp(local).await?;
        let mut local_temps: BTreeMap<ObjectIdentifier, Vec<u8>> = BTreeMap::new();
        for entry in &entries {
            local_temps
                .entry(entry.fragment.object)
                .or_default()
                .push(entry.fragment.index);
        }

        let mut queued: BTreeSet<ObjectIdentifier> = entries
            .iter()
            .filter(|e| now.saturating_sub(e.modified_ms) >= min_age_ms)
            .map(|e| e.fragment.object)
            .collect();
        let mut queue: VecDeque<ObjectIdentifier> = queued.iter().copied().collect();
        debug!(disk = %local, temps = entries.len(), old = queue.len(), "temp scan");

        let mut crawl = CrawlState::NotTried;
        while let Some(object) = queue.pop_front() {
            check_cancel(cancel)?;
            match self.resolve(object, &local_temps, &mut crawl).await {
                Ok(Some(previous)) => {
                    if queued.insert(previous) {
                        debug!(%object, %previous, "cascading to previous chunk");
                        queue.push_back(previous);
                    }
                }
                Ok(None) => {}
                Err(e) if e.is_abort() => return Err(e),
                Err(e) if matches!(crawl, CrawlState::Failed) => {
                    warn!(%object, disk = %local, error = %e, "cell crawl failed, abandoning step");
                    return Err(e);
                }
                Err(e @ RepairError::Inconsistent { .. }) => {
                    tracing::error!(%object, disk = %local, error = %e, "inconsistent temp object");
                    self.base.fault(object, &e);
                }
                Err(e) => {
                    warn!(%object, disk = %local, error = %e, "temp object not resolved");
                    self.base.fault(object, &e);
                }
            }
        }
        Ok(())
    }
}
