//! [`MetaStore`] implementation wrapping Fjall keyspaces.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use fjall::{Database, Keyspace, KeyspaceCreateOptions};
use serde::{Deserialize, Serialize};
use tide_types::{ObjectIdentifier, PartitionId};
use tracing::debug;

use crate::MetaError;

type Result<T> = std::result::Result<T, MetaError>;

/// One cache entry: an object known to live on this node's disks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRecord {
    /// The indexed object chunk.
    pub object: ObjectIdentifier,
    /// When the record was written, unix milliseconds.
    pub indexed_ms: u64,
}

/// Opaque resumption point for [`MetaCache::query_partition`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie(Vec<u8>);

/// One page of a partition query.
#[derive(Debug, Clone, Default)]
pub struct Page {
    /// Records in key order.
    pub records: Vec<CacheRecord>,
    /// Where to resume, `None` once the partition is exhausted.
    pub next: Option<Cookie>,
}

/// A metadata cache as seen by the repair engine.
pub trait MetaCache: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Whether the cache is loaded and may be queried.
    fn is_ready(&self) -> bool;

    /// Up to `limit` records of `partition`, resuming after `cookie`.
    fn query_partition(
        &self,
        partition: PartitionId,
        cookie: Option<&Cookie>,
        limit: usize,
    ) -> Result<Page>;

    /// Whether `object` has a record.
    fn exists(&self, object: &ObjectIdentifier) -> Result<bool>;

    /// Insert or replace a record.
    fn set(&self, record: &CacheRecord) -> Result<()>;

    /// Remove the record for `object`, if any.
    fn remove(&self, object: &ObjectIdentifier) -> Result<()>;
}

/// Which of the two caches a [`CacheHandle`] addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKind {
    /// Every object chunk.
    System,
    /// User-visible objects only.
    External,
}

impl CacheKind {
    fn name(self) -> &'static str {
        match self {
            CacheKind::System => "sys",
            CacheKind::External => "ext",
        }
    }
}

/// Metadata caches backed by Fjall.
///
/// Everything stored here is a local cache reconstructible from the
/// fragments on disk.
pub struct MetaStore {
    /// The underlying Fjall database handle.
    #[allow(dead_code)]
    db: Database,
    /// Partition ++ object id → system record.
    sys: Keyspace,
    /// Partition ++ object id → external record.
    ext: Keyspace,
    sys_ready: AtomicBool,
    ext_ready: AtomicBool,
    /// Keeps the directory of a temporary store alive.
    _tmp: Option<tempfile::TempDir>,
}

impl MetaStore {
    /// Open a persistent MetaStore at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::builder(path).open()?;
        Self::init_keyspaces(db, None)
    }

    /// Open a temporary MetaStore that is cleaned up on drop.
    ///
    /// Useful for tests.
    pub fn open_temporary() -> Result<Self> {
        let tmp = tempfile::tempdir()?;
        let db = Database::builder(tmp.path()).temporary(true).open()?;
        Self::init_keyspaces(db, Some(tmp))
    }

    fn init_keyspaces(db: Database, tmp: Option<tempfile::TempDir>) -> Result<Self> {
        let sys = db.keyspace("sys_cache", KeyspaceCreateOptions::default)?;
        let ext = db.keyspace("ext_cache", KeyspaceCreateOptions::default)?;
        Ok(Self {
            db,
            sys,
            ext,
            sys_ready: AtomicBool::new(true),
            ext_ready: AtomicBool::new(true),
            _tmp: tmp,
        })
    }

    /// A [`MetaCache`] over one of the two keyspaces.
    pub fn cache(self: &Arc<Self>, kind: CacheKind) -> CacheHandle {
        CacheHandle {
            store: self.clone(),
            kind,
        }
    }

    /// Mark a cache loaded or not.
    pub fn set_ready(&self, kind: CacheKind, ready: bool) {
        self.ready_flag(kind).store(ready, Ordering::Release);
    }

    fn ready_flag(&self, kind: CacheKind) -> &AtomicBool {
        match kind {
            CacheKind::System => &self.sys_ready,
            CacheKind::External => &self.ext_ready,
        }
    }

    fn keyspace(&self, kind: CacheKind) -> &Keyspace {
        match kind {
            CacheKind::System => &self.sys,
            CacheKind::External => &self.ext,
        }
    }

    /// Number of records in a cache.
    ///
    /// Note: this is an O(n) scan.
    pub fn len(&self, kind: CacheKind) -> Result<usize> {
        let mut count = 0;
        for guard in self.keyspace(kind).iter() {
            let _ = guard.key()?;
            count += 1;
        }
        Ok(count)
    }

    /// Whether a cache holds no records.
    pub fn is_empty(&self, kind: CacheKind) -> Result<bool> {
        Ok(self.len(kind)? == 0)
    }
}

/// One cache of a shared [`MetaStore`].
#[derive(Clone)]
pub struct CacheHandle {
    store: Arc<MetaStore>,
    kind: CacheKind,
}

impl CacheHandle {
    fn keyspace(&self) -> &Keyspace {
        self.store.keyspace(self.kind)
    }
}

impl MetaCache for CacheHandle {
    fn name(&self) -> &'static str {
        self.kind.name()
    }

    fn is_ready(&self) -> bool {
        self.store.ready_flag(self.kind).load(Ordering::Acquire)
    }

    fn query_partition(
        &self,
        partition: PartitionId,
        cookie: Option<&Cookie>,
        limit: usize,
    ) -> Result<Page> {
        if !self.is_ready() {
            return Err(MetaError::NotReady(self.name()));
        }

        let mut page = Page::default();
        let mut last_key: Option<Vec<u8>> = None;
        for guard in self.keyspace().prefix(partition.0.to_be_bytes()) {
            let (key, value) = guard.into_inner()?;
            if cookie.is_some_and(|c| key.as_ref() <= c.0.as_slice()) {
                continue;
            }
            if page.records.len() == limit {
                page.next = last_key.map(Cookie);
                return Ok(page);
            }
            page.records.push(postcard::from_bytes(&value)?);
            last_key = Some(key.to_vec());
        }
        Ok(page)
    }

    fn exists(&self, object: &ObjectIdentifier) -> Result<bool> {
        if !self.is_ready() {
            return Err(MetaError::NotReady(self.name()));
        }
        Ok(self.keyspace().get(object_key(object))?.is_some())
    }

    fn set(&self, record: &CacheRecord) -> Result<()> {
        if !self.is_ready() {
            return Err(MetaError::NotReady(self.name()));
        }
        let value = postcard::to_allocvec(record)?;
        self.keyspace()
            .insert(object_key(&record.object), value.as_slice())?;
        debug!(cache = self.name(), object = %record.object, "cached object");
        Ok(())
    }

    fn remove(&self, object: &ObjectIdentifier) -> Result<()> {
        if !self.is_ready() {
            return Err(MetaError::NotReady(self.name()));
        }
        self.keyspace().remove(object_key(object))?;
        debug!(cache = self.name(), %object, "uncached object");
        Ok(())
    }
}

/// Build a record key: `partition (BE) ++ uid (BE) ++ kind ++ chunk (BE) ++ rule`.
///
/// Big-endian keeps each partition contiguous and sorted like the listings.
fn object_key(object: &ObjectIdentifier) -> [u8; 18] {
    let mut key = [0u8; 18];
    key[..4].copy_from_slice(&object.partition.0.to_be_bytes());
    key[4..12].copy_from_slice(&object.uid.to_be_bytes());
    key[12] = object.kind as u8;
    key[13..17].copy_from_slice(&object.chunk.to_be_bytes());
    key[17] = object.rule;
    key
}
