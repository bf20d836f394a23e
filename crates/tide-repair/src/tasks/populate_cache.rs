//! Reconcile a metadata cache with the fragments on disk.
//!
//! The system cache indexes every object chunk; the external cache only
//! first chunks of data objects. Missing entries are inserted unless the
//! object looks like a store still in flight. An entry is only removed once
//! every holder of its partition is online and none has a live fragment.

use std::collections::BTreeSet;
use std::sync::Arc;

use tide_meta::{CacheRecord, MetaCache, MetaError};
use tide_placement::Layout;
use tide_types::{FragmentRef, ObjectIdentifier, PartitionId, unix_millis};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::base::{RepairTask, TaskBase};
use super::remove_temp::is_partial_store;
use super::{Steppable, check_cancel};
use crate::context::RepairContext;
use crate::error::RepairError;

const PAGE_SIZE: usize = 256;

/// Which cache a [`PopulateCache`] maintains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheVariant {
    /// Every object chunk.
    System,
    /// User-visible objects.
    External,
}

impl CacheVariant {
    fn indexes(self, object: &ObjectIdentifier) -> bool {
        match self {
            CacheVariant::System => true,
            CacheVariant::External => object.is_head(),
        }
    }
}

/// Registry constructor for the system cache task.
pub fn system(ctx: Arc<RepairContext>) -> Box<dyn Steppable> {
    Box::new(PopulateCache::new(ctx, CacheVariant::System))
}

/// Registry constructor for the external cache task.
pub fn external(ctx: Arc<RepairContext>) -> Box<dyn Steppable> {
    Box::new(PopulateCache::new(ctx, CacheVariant::External))
}

/// Per-partition cache reconciliation.
pub struct PopulateCache {
    base: TaskBase,
    variant: CacheVariant,
}

impl PopulateCache {
    /// Create an uninitialised instance for `variant`.
    pub fn new(ctx: Arc<RepairContext>, variant: CacheVariant) -> Self {
        Self {
            base: TaskBase::new(ctx),
            variant,
        }
    }

    fn cache(&self) -> Arc<dyn MetaCache> {
        match self.variant {
            CacheVariant::System => self.base.ctx.sys_cache.clone(),
            CacheVariant::External => self.base.ctx.ext_cache.clone(),
        }
    }

    /// Live objects of `partition` on this disk that the cache should hold.
    async fn on_disk(
        &self,
        partition: PartitionId,
        cancel: &CancellationToken,
    ) -> Result<BTreeSet<ObjectIdentifier>, RepairError> {
        let ctx = &self.base.ctx;
        let disk = self.base.disk;
        let mut objects = BTreeSet::new();
        for fragment in ctx.local_lister.list_partition(disk, partition).await? {
            check_cancel(cancel)?;
            if !self.variant.indexes(&fragment.object) || objects.contains(&fragment.object) {
                continue;
            }
            if ctx
                .engine
                .stat(disk, fragment)
                .await?
                .is_some_and(|s| !s.deleted)
            {
                objects.insert(fragment.object);
            }
        }
        Ok(objects)
    }

    /// Every cached object of `partition`.
    fn cached(
        &self,
        cache: &dyn MetaCache,
        partition: PartitionId,
        cancel: &CancellationToken,
    ) -> Result<BTreeSet<ObjectIdentifier>, RepairError> {
        let mut objects = BTreeSet::new();
        let mut cookie = None;
        loop {
            check_cancel(cancel)?;
            let page = cache.query_partition(partition, cookie.as_ref(), PAGE_SIZE)?;
            objects.extend(page.records.iter().map(|r| r.object));
            match page.next {
                Some(next) => cookie = Some(next),
                None => return Ok(objects),
            }
        }
    }

    /// Whether every holder is online and none has a live fragment.
    async fn confirmed_absent(
        &self,
        object: ObjectIdentifier,
        layout: &Layout,
    ) -> Result<bool, RepairError> {
        let engine = &self.base.ctx.engine;
        for (index, disk) in layout.disks().iter().enumerate() {
            if !self.base.mask.contains(*disk) {
                debug!(%object, %disk, "holder offline, keeping cache entry");
                return Ok(false);
            }
            let fragment = FragmentRef::new(object, index as u8);
            if engine.stat(*disk, fragment).await?.is_some_and(|s| !s.deleted) {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[async_trait::async_trait]
impl RepairTask for PopulateCache {
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
        let cache = self.cache();
        if !cache.is_ready() {
            return Err(MetaError::NotReady(cache.name()).into());
        }

        let partition = PartitionId(index as u32);
        let layout = self.base.layout(partition);
        let disk = self.base.disk;
        if !layout.contains(disk) {
            return Ok(());
        }

        let on_disk = self.on_disk(partition, cancel).await?;
        let cached = self.cached(cache.as_ref(), partition, cancel)?;

        let (mut inserted, mut removed) = (0usize, 0usize);
        for object in on_disk.difference(&cached) {
            check_cancel(cancel)?;
            let result = match is_partial_store(&self.base.ctx, *object, &self.base.mask).await {
                Ok(true) => {
                    debug!(%object, "store in flight, not caching yet");
                    continue;
                }
                Ok(false) => cache
                    .set(&CacheRecord {
                        object: *object,
                        indexed_ms: unix_millis(),
                    })
                    .map_err(RepairError::from),
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => inserted += 1,
                Err(e) if e.is_abort() => return Err(e),
                Err(e) => self.base.fault(object, &e),
            }
        }

        for object in cached.difference(&on_disk) {
            check_cancel(cancel)?;
            let result = match self.confirmed_absent(*object, &layout).await {
                Ok(true) => cache.remove(object).map(|()| true).map_err(RepairError::from),
                other => other,
            };
            match result {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => self.base.fault(object, &e),
            }
        }

        if inserted + removed > 0 {
            info!(cache = cache.name(), %partition, %disk, inserted, removed, "cache reconciled");
        }
        Ok(())
    }
}
