//! Integration test: lost-fragment recovery.
//!
//! Cells lose fragments (deleted, on a crashed node, or left behind by an
//! expansion) and the recovery task running on every node puts them back.

use std::collections::BTreeMap;

use bytes::Bytes;
use tide_cluster::Membership;
use tide_integration_tests::{CellOptions, IntegrationCell, object, test_data_seeded};
use tide_placement::Placement;
use tide_repair::CycleGoal;
use tide_store::FragmentEngine;
use tide_types::events::{ClusterTaskDone, FragmentRepaired, RepairSource};
use tide_types::{DiskId, FragmentRef, NodeId, ObjectIdentifier, RedundancyScheme, TaskLabel};

/// Write `count` objects under the current layout.
async fn write_objects(cell: &IntegrationCell, count: u64) -> BTreeMap<ObjectIdentifier, Vec<Bytes>> {
    let mut objects = BTreeMap::new();
    for uid in 1..=count {
        let x = object(uid);
        let layout = cell.layout(x.partition).await;
        let data = test_data_seeded(1_500 + uid as usize * 37, uid as u32);
        let shards = cell.store.put_object(x, &data, &layout).unwrap();
        objects.insert(x, shards);
    }
    objects
}

/// 5 nodes, k=3 m=2: delete up to two fragments per object, every one comes back.
#[tokio::test]
async fn test_deleted_fragments_rebuilt_everywhere() {
    let mut cell = IntegrationCell::new(CellOptions::new(5, RedundancyScheme::new(3, 2)));
    let objects = write_objects(&cell, 30).await;

    let mut lost = Vec::new();
    for (x, _) in &objects {
        let layout = cell.layout(x.partition).await;
        let first = (x.uid % 5) as usize;
        let mut indices = vec![first];
        if x.uid % 3 == 0 {
            indices.push((first + 2) % 5);
        }
        for index in indices {
            let disk = layout.disk_for(index).unwrap();
            let fragment = FragmentRef::new(*x, index as u8);
            assert!(cell.store.fragments_on(disk).contains(&fragment));
            cell.store.delete(disk, fragment).await.unwrap();
            lost.push((disk, fragment));
        }
    }
    for (disk, fragment) in &lost {
        assert!(!cell.store.has_fragment(*disk, *fragment));
    }

    let mut done = cell.ctx(NodeId(0)).events.subscribe::<ClusterTaskDone>();
    cell.enable(&[TaskLabel::RecoverLostFrags], CycleGoal::FullSpeed);
    cell.converge(TaskLabel::RecoverLostFrags).await;

    for (x, shards) in &objects {
        assert!(cell.is_intact(*x, shards).await, "object {x} not intact");
    }
    for (disk, fragment) in &lost {
        let restored = cell.store.peek(*disk, *fragment).unwrap();
        let shards = &objects[&fragment.object];
        assert_eq!(restored.data.len(), shards[fragment.index as usize].len());
    }

    let event = done.try_recv().unwrap();
    assert_eq!(event.task, TaskLabel::RecoverLostFrags);
    assert_eq!(event.mask, cell.full_mask());
    for node in cell.topology.nodes() {
        assert_eq!(cell.ctx(node).healed.get(), Some(cell.full_mask()));
    }
    cell.shutdown().await;
}

/// A crashed node's fragments are rebuilt on the disks that take over its
/// layout slots, and the failure no longer counts once recovery converged.
#[tokio::test]
async fn test_crashed_node_rebuilt_on_substitutes() {
    let mut cell = IntegrationCell::new(CellOptions::new(6, RedundancyScheme::new(3, 2)));
    let objects = write_objects(&cell, 24).await;

    let crashed = NodeId(2);
    let crashed_disk = DiskId::new(2, 0);
    cell.tick().await;
    cell.kill_node(crashed).await;

    let moved: Vec<ObjectIdentifier> = objects
        .keys()
        .filter(|x| {
            cell.placement
                .layout(x.partition, &cell.full_mask())
                .contains(crashed_disk)
        })
        .copied()
        .collect();
    assert!(!moved.is_empty());

    cell.enable(&[TaskLabel::RecoverLostFrags], CycleGoal::FullSpeed);
    cell.converge(TaskLabel::RecoverLostFrags).await;

    for (x, shards) in &objects {
        assert!(cell.is_intact(*x, shards).await, "object {x} not intact");
    }
    for x in &moved {
        let layout = cell.layout(x.partition).await;
        assert!(!layout.contains(crashed_disk));
    }

    // The healed row now excludes the crashed node, so nothing is unhealed.
    let mask = cell.cluster.current_disk_mask().await;
    assert!(!mask.contains(crashed_disk));
    let snapshot = cell.ctx(NodeId(0)).publisher.latest();
    assert_eq!(cell.ctx(NodeId(0)).healed.get(), Some(mask));
    assert_eq!(snapshot.unhealed, 0);
    assert!(snapshot.tolerant);
    cell.shutdown().await;
}

/// After an expansion, fragments whose slot moved are copied from where the
/// pre-expansion layout put them.
#[tokio::test]
async fn test_expansion_copies_from_previous_layout() {
    let mut options = CellOptions::new(6, RedundancyScheme::new(3, 2));
    options.active_nodes = Some(5);
    let mut cell = IntegrationCell::new(options);
    let objects = write_objects(&cell, 24).await;

    let joined = DiskId::new(5, 0);
    for (x, _) in &objects {
        assert!(!cell.layout(x.partition).await.contains(joined));
    }

    let mut repaired = cell.ctx(NodeId(5)).events.subscribe::<FragmentRepaired>();
    cell.placement.expand_to(6);
    assert!(cell.placement.is_expanding());

    let mut landing = 0;
    for x in objects.keys() {
        let layout = cell.layout(x.partition).await;
        if layout.contains(joined) {
            landing += 1;
        }
    }
    assert!(landing > 0);

    cell.enable(&[TaskLabel::RecoverLostFrags], CycleGoal::FullSpeed);
    cell.converge(TaskLabel::RecoverLostFrags).await;

    for (x, shards) in &objects {
        assert!(cell.is_intact(*x, shards).await, "object {x} not intact after expansion");
    }
    let mut copied = 0;
    while let Some(event) = repaired.try_recv() {
        assert_eq!(event.disk, joined);
        assert_eq!(event.source, RepairSource::PreExpansion);
        copied += 1;
    }
    assert_eq!(copied, landing);

    cell.placement.finish_expansion();
    assert!(!cell.placement.is_expanding());
    cell.shutdown().await;
}

/// Listings that take real time still converge.
#[tokio::test]
async fn test_recovery_converges_with_slow_listings() {
    let mut options = CellOptions::new(5, RedundancyScheme::new(3, 2));
    options.list_latency_ms = Some((1, 5));
    let mut cell = IntegrationCell::new(options);
    let objects = write_objects(&cell, 10).await;

    for (x, _) in &objects {
        let layout = cell.layout(x.partition).await;
        let index = (x.uid % 5) as usize;
        let fragment = FragmentRef::new(*x, index as u8);
        cell.store
            .delete(layout.disk_for(index).unwrap(), fragment)
            .await
            .unwrap();
    }

    cell.enable(&[TaskLabel::RecoverLostFrags], CycleGoal::FullSpeed);
    cell.converge(TaskLabel::RecoverLostFrags).await;
    for (x, shards) in &objects {
        assert!(cell.is_intact(*x, shards).await);
    }
    cell.shutdown().await;
}
