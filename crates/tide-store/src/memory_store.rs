//! In-memory fragment backend for a whole cell.
//!
//! Every disk of the cell lives in one [`MemoryStore`], which is what lets a
//! single process host a multi-node cell in tests. Each committed fragment is
//! kept with per-block blake3 checksums and a footer hash over them, so the
//! scrubber has something real to verify.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::RwLock;

use bytes::Bytes;
use tide_placement::Layout;
use tide_types::{
    DiskId, DiskMask, FragmentRef, ObjectIdentifier, PartitionId, RedundancyScheme, TempEntry,
    unix_millis,
};
use tracing::debug;

use crate::codec;
use crate::error::StoreError;
use crate::traits::{FragmentEngine, FragmentLister, FragmentStat, StoredFragment};

const DEFAULT_BLOCK_SIZE: usize = 64;

#[derive(Clone)]
struct Blob {
    contents: StoredFragment,
    checksums: Vec<blake3::Hash>,
    footer: blake3::Hash,
}

impl Blob {
    fn seal(contents: StoredFragment, block_size: usize) -> Self {
        let checksums: Vec<blake3::Hash> = contents
            .data
            .chunks(block_size)
            .map(blake3::hash)
            .collect();
        let footer = footer_hash(&checksums, &contents);
        Self {
            contents,
            checksums,
            footer,
        }
    }
}

fn footer_hash(checksums: &[blake3::Hash], contents: &StoredFragment) -> blake3::Hash {
    let mut hasher = blake3::Hasher::new();
    for sum in checksums {
        hasher.update(sum.as_bytes());
    }
    hasher.update(&contents.object_len.to_le_bytes());
    hasher.update(&[contents.deleted as u8]);
    hasher.finalize()
}

#[derive(Default)]
struct DiskContents {
    committed: BTreeMap<FragmentRef, Blob>,
    temp: BTreeMap<FragmentRef, (Blob, u64)>,
}

/// In-memory store holding every disk of a cell.
pub struct MemoryStore {
    scheme: RedundancyScheme,
    block_size: usize,
    disks: RwLock<HashMap<DiskId, DiskContents>>,
    offline: RwLock<HashSet<DiskId>>,
}

impl MemoryStore {
    /// Create an empty store for objects coded with `scheme`.
    pub fn new(scheme: RedundancyScheme) -> Self {
        Self {
            scheme,
            block_size: DEFAULT_BLOCK_SIZE,
            disks: RwLock::new(HashMap::new()),
            offline: RwLock::new(HashSet::new()),
        }
    }

    /// Use `block_size`-byte checksum blocks.
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size.max(1);
        self
    }

    /// Make `disk` unreachable (or reachable again). Its contents survive.
    pub fn set_reachable(&self, disk: DiskId, reachable: bool) {
        let mut offline = self.offline.write().expect("lock poisoned");
        if reachable {
            offline.remove(&disk);
        } else {
            offline.insert(disk);
        }
    }

    fn reachable(&self, disk: DiskId) -> Result<(), StoreError> {
        if self.offline.read().expect("lock poisoned").contains(&disk) {
            Err(StoreError::Unreachable(disk))
        } else {
            Ok(())
        }
    }

    /// Encode `chunk` and commit fragment `i` onto `layout.disk_for(i)`.
    pub fn put_object(
        &self,
        object: ObjectIdentifier,
        chunk: &[u8],
        layout: &Layout,
    ) -> Result<Vec<Bytes>, StoreError> {
        let shards = codec::encode(self.scheme, chunk)?;
        for (index, shard) in shards.iter().enumerate() {
            if let Some(disk) = layout.disk_for(index) {
                let fragment = FragmentRef::new(object, index as u8);
                self.put_fragment(
                    disk,
                    fragment,
                    StoredFragment::live(shard.clone(), chunk.len() as u64),
                );
            }
        }
        Ok(shards)
    }

    /// Commit `contents` without reachability checks.
    pub fn put_fragment(&self, disk: DiskId, fragment: FragmentRef, contents: StoredFragment) {
        let blob = Blob::seal(contents, self.block_size);
        let mut disks = self.disks.write().expect("lock poisoned");
        disks.entry(disk).or_default().committed.insert(fragment, blob);
    }

    /// Place `contents` in `disk`'s temp directory, last modified at `modified_ms`.
    pub fn put_temp(
        &self,
        disk: DiskId,
        fragment: FragmentRef,
        contents: StoredFragment,
        modified_ms: u64,
    ) {
        let blob = Blob::seal(contents, self.block_size);
        let mut disks = self.disks.write().expect("lock poisoned");
        disks
            .entry(disk)
            .or_default()
            .temp
            .insert(fragment, (blob, modified_ms));
    }

    /// Whether `disk` holds `fragment` committed.
    pub fn has_fragment(&self, disk: DiskId, fragment: FragmentRef) -> bool {
        let disks = self.disks.read().expect("lock poisoned");
        disks
            .get(&disk)
            .is_some_and(|d| d.committed.contains_key(&fragment))
    }

    /// Whether `disk` holds `fragment` in its temp directory.
    pub fn has_temp(&self, disk: DiskId, fragment: FragmentRef) -> bool {
        let disks = self.disks.read().expect("lock poisoned");
        disks
            .get(&disk)
            .is_some_and(|d| d.temp.contains_key(&fragment))
    }

    /// Committed contents of `fragment`, unverified.
    pub fn peek(&self, disk: DiskId, fragment: FragmentRef) -> Option<StoredFragment> {
        let disks = self.disks.read().expect("lock poisoned");
        disks
            .get(&disk)?
            .committed
            .get(&fragment)
            .map(|b| b.contents.clone())
    }

    /// Every committed fragment on `disk`.
    pub fn fragments_on(&self, disk: DiskId) -> Vec<FragmentRef> {
        let disks = self.disks.read().expect("lock poisoned");
        disks
            .get(&disk)
            .map(|d| d.committed.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Every temp fragment on `disk`.
    pub fn temps_on(&self, disk: DiskId) -> Vec<FragmentRef> {
        let disks = self.disks.read().expect("lock poisoned");
        disks
            .get(&disk)
            .map(|d| d.temp.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Flip a byte of `block` without updating its checksum.
    pub fn corrupt_block(&self, disk: DiskId, fragment: FragmentRef, block: usize) -> bool {
        let mut disks = self.disks.write().expect("lock poisoned");
        let Some(blob) = disks
            .get_mut(&disk)
            .and_then(|d| d.committed.get_mut(&fragment))
        else {
            return false;
        };
        let offset = block * self.block_size;
        if offset >= blob.contents.data.len() {
            return false;
        }
        let mut data = blob.contents.data.to_vec();
        data[offset] ^= 0xFF;
        blob.contents.data = Bytes::from(data);
        true
    }

    /// Damage the footer hash.
    pub fn corrupt_footer(&self, disk: DiskId, fragment: FragmentRef) -> bool {
        let mut disks = self.disks.write().expect("lock poisoned");
        let Some(blob) = disks
            .get_mut(&disk)
            .and_then(|d| d.committed.get_mut(&fragment))
        else {
            return false;
        };
        let mut bytes = *blob.footer.as_bytes();
        bytes[0] ^= 0xFF;
        blob.footer = blake3::Hash::from_bytes(bytes);
        true
    }

    fn with_blob<T>(
        &self,
        disk: DiskId,
        fragment: FragmentRef,
        f: impl FnOnce(&Blob) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        self.reachable(disk)?;
        let disks = self.disks.read().expect("lock poisoned");
        let blob = disks
            .get(&disk)
            .and_then(|d| d.committed.get(&fragment))
            .ok_or(StoreError::NotFound(fragment))?;
        f(blob)
    }

    fn check_footer(blob: &Blob, disk: DiskId, fragment: FragmentRef) -> Result<(), StoreError> {
        if footer_hash(&blob.checksums, &blob.contents) != blob.footer {
            return Err(StoreError::Corrupted {
                fragment,
                disk,
                detail: "footer mismatch".to_string(),
            });
        }
        Ok(())
    }

    fn check_block(
        &self,
        blob: &Blob,
        disk: DiskId,
        fragment: FragmentRef,
        block: usize,
    ) -> Result<(), StoreError> {
        let data = blob
            .contents
            .data
            .chunks(self.block_size)
            .nth(block)
            .unwrap_or_default();
        match blob.checksums.get(block) {
            Some(expected) if blake3::hash(data) == *expected => Ok(()),
            Some(_) => Err(StoreError::Corrupted {
                fragment,
                disk,
                detail: format!("block {block} checksum mismatch"),
            }),
            None => Err(StoreError::Corrupted {
                fragment,
                disk,
                detail: format!("block {block} out of range"),
            }),
        }
    }
}

#[async_trait::async_trait]
impl FragmentEngine for MemoryStore {
    async fn stat(
        &self,
        disk: DiskId,
        fragment: FragmentRef,
    ) -> Result<Option<FragmentStat>, StoreError> {
        match self.with_blob(disk, fragment, |blob| {
            Ok(FragmentStat {
                len: blob.contents.data.len(),
                deleted: blob.contents.deleted,
            })
        }) {
            Ok(stat) => Ok(Some(stat)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn stat_temp(&self, disk: DiskId, fragment: FragmentRef) -> Result<bool, StoreError> {
        self.reachable(disk)?;
        Ok(self.has_temp(disk, fragment))
    }

    async fn read(
        &self,
        disk: DiskId,
        fragment: FragmentRef,
    ) -> Result<StoredFragment, StoreError> {
        self.with_blob(disk, fragment, |blob| {
            Self::check_footer(blob, disk, fragment)?;
            for block in 0..blob.checksums.len() {
                self.check_block(blob, disk, fragment, block)?;
            }
            Ok(blob.contents.clone())
        })
    }

    async fn write(
        &self,
        disk: DiskId,
        fragment: FragmentRef,
        contents: StoredFragment,
    ) -> Result<(), StoreError> {
        self.reachable(disk)?;
        debug!(%disk, %fragment, len = contents.data.len(), "writing fragment");
        self.put_fragment(disk, fragment, contents);
        Ok(())
    }

    async fn delete(&self, disk: DiskId, fragment: FragmentRef) -> Result<(), StoreError> {
        self.reachable(disk)?;
        let mut disks = self.disks.write().expect("lock poisoned");
        if let Some(contents) = disks.get_mut(&disk) {
            contents.committed.remove(&fragment);
        }
        debug!(%disk, %fragment, "deleted fragment");
        Ok(())
    }

    async fn mark_deleted(&self, disk: DiskId, fragment: FragmentRef) -> Result<(), StoreError> {
        self.reachable(disk)?;
        self.put_fragment(disk, fragment, StoredFragment::delete_marker());
        debug!(%disk, %fragment, "wrote delete-marker");
        Ok(())
    }

    async fn reconstruct(
        &self,
        fragment: FragmentRef,
        layout: &Layout,
        mask: &DiskMask,
    ) -> Result<StoredFragment, StoreError> {
        let target = fragment.index as usize;
        let mut available = Vec::new();
        let mut object_len = 0;

        for (index, disk) in layout.disks().iter().enumerate() {
            if index == target || !mask.contains(*disk) {
                continue;
            }
            let source = FragmentRef::new(fragment.object, index as u8);
            match self.read(*disk, source).await {
                Ok(contents) if contents.deleted => return Ok(StoredFragment::delete_marker()),
                Ok(contents) => {
                    object_len = contents.object_len;
                    available.push((index, contents.data));
                }
                Err(e) => debug!(%disk, fragment = %source, error = %e, "skipping source"),
            }
        }

        let data = codec::rebuild(self.scheme, &available, target)?;
        Ok(StoredFragment::live(data, object_len))
    }

    async fn verify_footer(
        &self,
        disk: DiskId,
        fragment: FragmentRef,
    ) -> Result<usize, StoreError> {
        self.with_blob(disk, fragment, |blob| {
            Self::check_footer(blob, disk, fragment)?;
            Ok(blob.checksums.len())
        })
    }

    async fn verify_block(
        &self,
        disk: DiskId,
        fragment: FragmentRef,
        block: usize,
    ) -> Result<(), StoreError> {
        self.with_blob(disk, fragment, |blob| {
            self.check_block(blob, disk, fragment, block)
        })
    }

    async fn rollback_to_temp(
        &self,
        disk: DiskId,
        fragment: FragmentRef,
    ) -> Result<(), StoreError> {
        self.reachable(disk)?;
        let mut disks = self.disks.write().expect("lock poisoned");
        let contents = disks.entry(disk).or_default();
        let blob = contents
            .committed
            .remove(&fragment)
            .ok_or(StoreError::NotFound(fragment))?;
        contents.temp.insert(fragment, (blob, unix_millis()));
        debug!(%disk, %fragment, "rolled fragment back to temp");
        Ok(())
    }

    async fn delete_temp(&self, disk: DiskId, fragment: FragmentRef) -> Result<(), StoreError> {
        self.reachable(disk)?;
        let mut disks = self.disks.write().expect("lock poisoned");
        if let Some(contents) = disks.get_mut(&disk) {
            contents.temp.remove(&fragment);
        }
        debug!(%disk, %fragment, "deleted temp fragment");
        Ok(())
    }
}

#[async_trait::async_trait]
impl FragmentLister for MemoryStore {
    async fn list_partition(
        &self,
        disk: DiskId,
        partition: PartitionId,
    ) -> Result<Vec<FragmentRef>, StoreError> {
        self.reachable(disk)?;
        let disks = self.disks.read().expect("lock poisoned");
        Ok(disks
            .get(&disk)
            .map(|d| {
                d.committed
                    .keys()
                    .filter(|f| f.object.partition == partition)
                    .copied()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn list_temp(&self, disk: DiskId) -> Result<Vec<TempEntry>, StoreError> {
        self.reachable(disk)?;
        let disks = self.disks.read().expect("lock poisoned");
        Ok(disks
            .get(&disk)
            .map(|d| {
                d.temp
                    .iter()
                    .map(|(fragment, (_, modified_ms))| TempEntry {
                        fragment: *fragment,
                        modified_ms: *modified_ms,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }
}
