//! A storage wrapper that adds configurable random latency.
//!
//! `SlowStore` wraps any backend implementing both [`FragmentEngine`] and
//! [`FragmentLister`] and sleeps for a random duration before each
//! operation. The RNG is seeded for deterministic, reproducible behaviour
//! across test runs.
//!
//! # Example
//!
//! ```ignore
//! let slow = SlowStore::new(inner)
//!     .read_latency(5, 20)     // 5–20 ms per read
//!     .list_latency(100, 100)  // 100 ms per directory listing
//!     .seed(42);
//! ```

use std::sync::{Arc, Mutex};

use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tide_placement::Layout;
use tide_types::{DiskId, DiskMask, FragmentRef, PartitionId, TempEntry};

use crate::error::StoreError;
use crate::traits::{FragmentEngine, FragmentLister, FragmentStat, StoredFragment};

/// Wrapper that injects random latency before storage operations.
///
/// Useful for surfacing timeouts and races that an instant in-memory store
/// never shows, such as a recovery listing that outlives its deadline.
pub struct SlowStore<S> {
    inner: Arc<S>,
    read_latency_ms: (u64, u64),
    write_latency_ms: (u64, u64),
    list_latency_ms: (u64, u64),
    rng: Mutex<StdRng>,
}

impl<S> SlowStore<S> {
    /// Wrap an existing store with zero latency (pass-through) by default.
    pub fn new(inner: Arc<S>) -> Self {
        Self {
            inner,
            read_latency_ms: (0, 0),
            write_latency_ms: (0, 0),
            list_latency_ms: (0, 0),
            rng: Mutex::new(StdRng::seed_from_u64(0)),
        }
    }

    /// Set the read latency range in milliseconds (uniform random).
    pub fn read_latency(mut self, min_ms: u64, max_ms: u64) -> Self {
        self.read_latency_ms = (min_ms, max_ms);
        self
    }

    /// Set the write latency range in milliseconds (uniform random).
    pub fn write_latency(mut self, min_ms: u64, max_ms: u64) -> Self {
        self.write_latency_ms = (min_ms, max_ms);
        self
    }

    /// Set the directory listing latency range in milliseconds.
    pub fn list_latency(mut self, min_ms: u64, max_ms: u64) -> Self {
        self.list_latency_ms = (min_ms, max_ms);
        self
    }

    /// Set the RNG seed for deterministic behaviour.
    pub fn seed(self, seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            ..self
        }
    }

    /// The wrapped store.
    pub fn inner(&self) -> &Arc<S> {
        &self.inner
    }

    /// Sleep for a random duration in `[min, max]` milliseconds.
    async fn delay(&self, range: (u64, u64)) {
        let (min, max) = range;

        if max == 0 {
            return;
        }

        let ms = if min >= max {
            max
        } else {
            self.rng
                .lock()
                .expect("lock poisoned")
                .random_range(min..=max)
        };

        if ms > 0 {
            tokio::time::sleep(tokio::time::Duration::from_millis(ms)).await;
        }
    }
}

#[async_trait::async_trait]
impl<S: FragmentEngine> FragmentEngine for SlowStore<S> {
    async fn stat(
        &self,
        disk: DiskId,
        fragment: FragmentRef,
    ) -> Result<Option<FragmentStat>, StoreError> {
        self.delay(self.read_latency_ms).await;
        self.inner.stat(disk, fragment).await
    }

    async fn stat_temp(&self, disk: DiskId, fragment: FragmentRef) -> Result<bool, StoreError> {
        self.delay(self.read_latency_ms).await;
        self.inner.stat_temp(disk, fragment).await
    }

    async fn read(
        &self,
        disk: DiskId,
        fragment: FragmentRef,
    ) -> Result<StoredFragment, StoreError> {
        self.delay(self.read_latency_ms).await;
        self.inner.read(disk, fragment).await
    }

    async fn write(
        &self,
        disk: DiskId,
        fragment: FragmentRef,
        contents: StoredFragment,
    ) -> Result<(), StoreError> {
        self.delay(self.write_latency_ms).await;
        self.inner.write(disk, fragment, contents).await
    }

    async fn delete(&self, disk: DiskId, fragment: FragmentRef) -> Result<(), StoreError> {
        self.delay(self.write_latency_ms).await;
        self.inner.delete(disk, fragment).await
    }

    async fn mark_deleted(&self, disk: DiskId, fragment: FragmentRef) -> Result<(), StoreError> {
        self.delay(self.write_latency_ms).await;
        self.inner.mark_deleted(disk, fragment).await
    }

    async fn reconstruct(
        &self,
        fragment: FragmentRef,
        layout: &Layout,
        mask: &DiskMask,
    ) -> Result<StoredFragment, StoreError> {
        self.delay(self.read_latency_ms).await;
        self.inner.reconstruct(fragment, layout, mask).await
    }

    async fn verify_footer(
        &self,
        disk: DiskId,
        fragment: FragmentRef,
    ) -> Result<usize, StoreError> {
        self.delay(self.read_latency_ms).await;
        self.inner.verify_footer(disk, fragment).await
    }

    async fn verify_block(
        &self,
        disk: DiskId,
        fragment: FragmentRef,
        block: usize,
    ) -> Result<(), StoreError> {
        self.inner.verify_block(disk, fragment, block).await
    }

    async fn rollback_to_temp(
        &self,
        disk: DiskId,
        fragment: FragmentRef,
    ) -> Result<(), StoreError> {
        self.delay(self.write_latency_ms).await;
        self.inner.rollback_to_temp(disk, fragment).await
    }

    async fn delete_temp(&self, disk: DiskId, fragment: FragmentRef) -> Result<(), StoreError> {
        self.delay(self.write_latency_ms).await;
        self.inner.delete_temp(disk, fragment).await
    }
}

#[async_trait::async_trait]
impl<S: FragmentLister> FragmentLister for SlowStore<S> {
    async fn list_partition(
        &self,
        disk: DiskId,
        partition: PartitionId,
    ) -> Result<Vec<FragmentRef>, StoreError> {
        self.delay(self.list_latency_ms).await;
        self.inner.list_partition(disk, partition).await
    }

    async fn list_temp(&self, disk: DiskId) -> Result<Vec<TempEntry>, StoreError> {
        self.delay(self.list_latency_ms).await;
        self.inner.list_temp(disk).await
    }
}
