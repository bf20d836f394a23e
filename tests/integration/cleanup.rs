//! Integration test: cleanup tasks.
//!
//! Abandoned temp fragments, corrupt fragments, duplicates left behind by a
//! returning node, and metadata caches, each handled by the tasks running on
//! every node of the cell.

use tide_integration_tests::{CellOptions, IntegrationCell, PARTITIONS, object, test_data_seeded};
use tide_meta::{CacheKind, CacheRecord, MetaCache};
use tide_placement::Placement;
use tide_repair::CycleGoal;
use tide_store::{FragmentEngine, StoredFragment};
use tide_types::events::{DiscardReason, FragmentDiscarded};
use tide_types::{
    DiskId, FragmentRef, NodeId, ObjectIdentifier, ObjectKind, RedundancyScheme, TaskLabel,
};

/// k=3 m=2: three committed fragments and one in temp is a complete store.
/// The temp fragment goes, the committed ones stay.
#[tokio::test]
async fn test_complete_store_temp_leftover_removed() {
    let mut cell = IntegrationCell::new(CellOptions::new(5, RedundancyScheme::new(3, 2)));
    let x = object(3);
    let layout = cell.layout(x.partition).await;
    let shards = cell.store.put_object(x, &test_data_seeded(900, 3), &layout).unwrap();

    let temp_disk = layout.disk_for(3).unwrap();
    let f3 = FragmentRef::new(x, 3);
    let c3 = cell.store.peek(temp_disk, f3).unwrap();
    cell.store.delete(temp_disk, f3).await.unwrap();
    cell.store.put_temp(temp_disk, f3, c3, 0);
    let f4 = FragmentRef::new(x, 4);
    cell.store.delete(layout.disk_for(4).unwrap(), f4).await.unwrap();

    cell.enable(&[TaskLabel::RemoveTempFrags], CycleGoal::FullSpeed);
    cell.settle(|cell| !cell.store.has_temp(temp_disk, f3)).await;
    cell.converge(TaskLabel::RemoveTempFrags).await;

    for index in 0..3 {
        let disk = layout.disk_for(index).unwrap();
        let stored = cell.store.peek(disk, FragmentRef::new(x, index as u8)).unwrap();
        assert_eq!(stored.data, shards[index]);
    }
    assert!(!cell.store.has_fragment(temp_disk, f3));
    cell.shutdown().await;
}

/// k=6 m=2: an object with only two fragments, both in temp, can never be
/// finished. Once every disk has been searched, both are deleted.
#[tokio::test]
async fn test_abandoned_store_deleted_everywhere() {
    let scheme = RedundancyScheme::new(6, 2);
    let mut cell = IntegrationCell::new(CellOptions::new(8, scheme));
    let y = object(11);
    let layout = cell.layout(y.partition).await;
    let shards = tide_store::codec::encode(scheme, &test_data_seeded(1_200, 11)).unwrap();
    let mut temps = Vec::new();
    for index in 0..2usize {
        let disk = layout.disk_for(index).unwrap();
        let fragment = FragmentRef::new(y, index as u8);
        cell.store
            .put_temp(disk, fragment, StoredFragment::live(shards[index].clone(), 1_200), 0);
        temps.push((disk, fragment));
    }

    // A finished object on the same disks is left alone.
    let z = object(12);
    let z_layout = cell.layout(z.partition).await;
    let z_shards = cell.store.put_object(z, &test_data_seeded(700, 12), &z_layout).unwrap();

    cell.enable(&[TaskLabel::RemoveTempFrags], CycleGoal::FullSpeed);
    cell.settle(|cell| {
        temps
            .iter()
            .all(|(disk, fragment)| !cell.store.has_temp(*disk, *fragment))
    })
    .await;

    for disk in cell.topology.disks() {
        assert!(cell.store.fragments_on(disk).iter().all(|f| f.object != y));
        assert!(cell.store.temps_on(disk).is_empty());
    }
    assert!(cell.is_intact(z, &z_shards).await);
    cell.shutdown().await;
}

/// A fragment with a bad checksum block is discarded by the scan and rebuilt
/// by recovery.
#[tokio::test]
async fn test_corrupt_fragment_scrubbed_then_rebuilt() {
    let mut cell = IntegrationCell::new(CellOptions::new(5, RedundancyScheme::new(3, 2)));
    let x = object(21);
    let layout = cell.layout(x.partition).await;
    let shards = cell.store.put_object(x, &test_data_seeded(2_000, 21), &layout).unwrap();

    let disk = layout.disk_for(1).unwrap();
    let fragment = FragmentRef::new(x, 1);
    assert!(cell.store.corrupt_block(disk, fragment, 1));
    assert!(!cell.is_intact(x, &shards).await);

    let mut discarded = cell.ctx(disk.node).events.subscribe::<FragmentDiscarded>();
    cell.enable(
        &[TaskLabel::ScanFrags, TaskLabel::RecoverLostFrags],
        CycleGoal::FullSpeed,
    );

    let mut reason = None;
    cell.settle(|_| {
        if let Some(event) = discarded.try_recv() {
            reason = Some((event.fragment, event.reason));
        }
        reason.is_some()
    })
    .await;
    assert_eq!(reason, Some((fragment, DiscardReason::Corrupt)));

    cell.settle(|cell| {
        cell.store
            .peek(disk, fragment)
            .is_some_and(|stored| stored.data == shards[1])
    })
    .await;
    assert!(cell.is_intact(x, &shards).await);
    cell.shutdown().await;
}

/// While a node was down its fragments were rebuilt on substitutes. Once it
/// is back the substitutes' copies are duplicates and get removed.
#[tokio::test]
async fn test_duplicates_removed_after_node_returns() {
    let mut cell = IntegrationCell::new(CellOptions::new(6, RedundancyScheme::new(3, 2)));
    let returning = NodeId(4);
    let returning_disk = DiskId::new(4, 0);

    let mut objects = Vec::new();
    for uid in 1..=16 {
        let x = object(uid);
        let layout = cell.layout(x.partition).await;
        let shards = cell
            .store
            .put_object(x, &test_data_seeded(800, uid as u32), &layout)
            .unwrap();
        objects.push((x, shards));
    }

    cell.kill_node(returning).await;
    cell.enable(&[TaskLabel::RecoverLostFrags], CycleGoal::FullSpeed);
    cell.converge(TaskLabel::RecoverLostFrags).await;

    // Where each displaced fragment was rebuilt.
    let full = cell.full_mask();
    let degraded = {
        let mut mask = full.clone();
        mask.remove(returning_disk);
        mask
    };
    let mut substitutes: Vec<(DiskId, FragmentRef)> = Vec::new();
    for (x, _) in &objects {
        let base = cell.placement.layout(x.partition, &full);
        let Some(index) = base.fragment_index_for(returning_disk) else {
            continue;
        };
        let substitute = cell
            .placement
            .layout(x.partition, &degraded)
            .disk_for(index)
            .unwrap();
        let fragment = FragmentRef::new(*x, index as u8);
        assert!(cell.store.has_fragment(substitute, fragment));
        substitutes.push((substitute, fragment));
    }
    assert!(!substitutes.is_empty());

    cell.revive_node(returning).await;
    cell.enable(&[TaskLabel::RemoveDupFrags], CycleGoal::FullSpeed);
    cell.settle(|cell| {
        substitutes
            .iter()
            .all(|(disk, fragment)| !cell.store.has_fragment(*disk, *fragment))
    })
    .await;

    for (x, shards) in &objects {
        assert!(cell.is_intact(*x, shards).await);
    }
    cell.shutdown().await;
}

/// Both caches end up indexing what the disks hold: every chunk in the
/// system cache, first chunks of data objects in the external cache.
#[tokio::test]
async fn test_caches_populated_on_every_holder() {
    let mut cell = IntegrationCell::new(CellOptions::new(5, RedundancyScheme::new(3, 2)));

    let mut written: Vec<ObjectIdentifier> = Vec::new();
    for uid in 1..=6u64 {
        written.push(object(uid));
        written.push(ObjectIdentifier::new(uid, ObjectKind::Data, 1, 0, PARTITIONS));
        written.push(ObjectIdentifier::new(uid, ObjectKind::Metadata, 0, 0, PARTITIONS));
    }
    for (i, x) in written.iter().enumerate() {
        let layout = cell.layout(x.partition).await;
        cell.store
            .put_object(*x, &test_data_seeded(300, i as u32), &layout)
            .unwrap();
    }

    cell.enable(
        &[TaskLabel::PopulateSysCache, TaskLabel::PopulateExtCache],
        CycleGoal::FullSpeed,
    );
    cell.converge(TaskLabel::PopulateSysCache).await;
    cell.converge(TaskLabel::PopulateExtCache).await;

    for x in &written {
        let layout = cell.layout(x.partition).await;
        for disk in layout.disks() {
            let meta = cell.meta(disk.node);
            let sys = meta.cache(CacheKind::System);
            let ext = meta.cache(CacheKind::External);
            assert!(sys.exists(x).unwrap(), "{x} missing from system cache on {disk}");
            assert_eq!(ext.exists(x).unwrap(), x.is_head(), "{x} on {disk}");
        }
    }

    // An entry for an object no disk holds is dropped on the next pass.
    let ghost = object(99);
    let holder = cell.layout(ghost.partition).await.disk_for(0).unwrap();
    let sys = cell.meta(holder.node).cache(CacheKind::System);
    sys.set(&CacheRecord {
        object: ghost,
        indexed_ms: 1,
    })
    .unwrap();
    cell.settle(|_| !sys.exists(&ghost).unwrap()).await;
    cell.shutdown().await;
}
