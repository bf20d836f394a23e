//! Integration test: coordinators across the cell.
//!
//! Cluster-wide completion, failure tolerance and the coordinator run loop,
//! with several coordinators talking to each other through their snapshots.

use std::time::Duration;

use tide_integration_tests::{CellOptions, IntegrationCell, SETTLE_TIMEOUT, object, test_data_seeded};
use tide_repair::{Coordinator, CycleGoal};
use tide_store::FragmentEngine;
use tide_types::events::{ClusterTaskDone, ToleranceChanged};
use tide_types::{DiskId, FragmentRef, NodeId, RedundancyScheme, TaskLabel};
use tokio_util::sync::CancellationToken;

/// k=3 m=2 tolerates two failed nodes, not three.
#[tokio::test]
async fn test_tolerance_follows_node_failures() {
    let mut cell = IntegrationCell::new(CellOptions::new(6, RedundancyScheme::new(3, 2)));
    cell.tick().await;
    let node0 = cell.ctx(NodeId(0));
    assert!(cell.coordinator(NodeId(0)).is_tolerant());
    assert_eq!(node0.publisher.latest().unhealed, 0);

    let mut changes = node0.events.subscribe::<ToleranceChanged>();
    cell.kill_node(NodeId(4)).await;
    cell.kill_node(NodeId(5)).await;
    cell.tick().await;
    let snapshot = node0.publisher.latest();
    assert!(snapshot.tolerant);
    assert_eq!(snapshot.unhealed, 2);
    assert_eq!(snapshot.unique_unhealed_nodes, 2);
    assert!(changes.try_recv().is_none());

    cell.kill_node(NodeId(3)).await;
    cell.tick().await;
    for node in cell.live_nodes() {
        assert!(!cell.coordinator(node).is_tolerant());
    }
    let lost = changes.try_recv().unwrap();
    assert!(!lost.tolerant);
    assert_eq!(lost.unique_nodes, 3);

    cell.revive_node(NodeId(3)).await;
    cell.tick().await;
    assert!(cell.coordinator(NodeId(0)).is_tolerant());
    // The restarted node comes up tolerant too.
    assert!(cell.coordinator(NodeId(3)).is_tolerant());
    let restored = changes.try_recv().unwrap();
    assert!(restored.tolerant);
    assert_eq!(restored.unique_nodes, 2);
}

/// A cell that starts with too many failures reports tolerant until it has
/// been tolerant once.
#[tokio::test]
async fn test_startup_grace_ends_at_first_tolerant_state() {
    let mut cell = IntegrationCell::new(CellOptions::new(6, RedundancyScheme::new(3, 2)));
    for node in [3, 4, 5] {
        cell.kill_node(NodeId(node)).await;
    }
    cell.tick().await;
    let snapshot = cell.ctx(NodeId(0)).publisher.latest();
    assert!(snapshot.tolerant);
    assert_eq!(snapshot.unique_unhealed_nodes, 3);

    cell.revive_node(NodeId(5)).await;
    cell.tick().await;
    assert!(cell.coordinator(NodeId(0)).is_tolerant());

    cell.kill_node(NodeId(5)).await;
    cell.tick().await;
    assert!(!cell.coordinator(NodeId(0)).is_tolerant());
}

/// A node whose snapshot can't be fetched holds back everyone else's
/// cluster-wide completion, while it still sees the others' reports.
#[tokio::test]
async fn test_cluster_done_waits_for_unreachable_peer() {
    let mut cell = IntegrationCell::new(CellOptions::new(4, RedundancyScheme::new(2, 1)));
    let isolated = NodeId(3);
    cell.peers.set_down(isolated, true);
    cell.enable(&[TaskLabel::ScanFrags], CycleGoal::FullSpeed);

    let topology = cell.topology;
    cell.settle(|cell| {
        cell.live_nodes().all(|n| {
            let snapshot = cell.ctx(n).publisher.latest();
            snapshot
                .local_done(TaskLabel::ScanFrags, topology)
                .contains(DiskId::new(n.0, 0))
        })
    })
    .await;
    cell.tick().await;

    assert!(cell.coordinator(isolated).is_cluster_done(TaskLabel::ScanFrags));
    for node in [0, 1, 2] {
        assert!(!cell.coordinator(NodeId(node)).is_cluster_done(TaskLabel::ScanFrags));
    }

    let mut done = cell.ctx(NodeId(0)).events.subscribe::<ClusterTaskDone>();
    cell.peers.set_down(isolated, false);
    cell.converge(TaskLabel::ScanFrags).await;
    let event = done.try_recv().unwrap();
    assert_eq!(event.task, TaskLabel::ScanFrags);
    assert_eq!(event.mask, cell.full_mask());

    // Only recovery records a healed row.
    for node in cell.topology.nodes() {
        assert!(cell.ctx(node).healed.get().is_none());
    }
    cell.shutdown().await;
}

/// Coordinators running on their own loops heal the cell and stop when
/// asked.
#[tokio::test]
async fn test_running_coordinators_heal_and_shut_down() {
    let cell = IntegrationCell::new(CellOptions::new(5, RedundancyScheme::new(3, 2)));
    let mut objects = Vec::new();
    for uid in 1..=12u64 {
        let x = object(uid);
        let layout = cell.layout(x.partition).await;
        let shards = cell
            .store
            .put_object(x, &test_data_seeded(1_000, uid as u32), &layout)
            .unwrap();
        let index = (uid % 5) as usize;
        cell.store
            .delete(layout.disk_for(index).unwrap(), FragmentRef::new(x, index as u8))
            .await
            .unwrap();
        objects.push((x, shards));
    }
    cell.enable(&[TaskLabel::RecoverLostFrags], CycleGoal::FullSpeed);

    let mut done = cell.ctx(NodeId(0)).events.subscribe::<ClusterTaskDone>();
    let shutdown = CancellationToken::new();
    let handles: Vec<_> = cell
        .topology
        .nodes()
        .map(|n| tokio::spawn(Coordinator::new(cell.ctx(n)).run(shutdown.clone())))
        .collect();

    let event = tokio::time::timeout(SETTLE_TIMEOUT, done.recv())
        .await
        .expect("recovery did not converge")
        .unwrap();
    assert_eq!(event.task, TaskLabel::RecoverLostFrags);
    for (x, shards) in &objects {
        assert!(cell.is_intact(*x, shards).await);
    }
    assert_eq!(cell.ctx(NodeId(0)).healed.get(), Some(cell.full_mask()));

    shutdown.cancel();
    for handle in handles {
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("coordinator did not stop")
            .unwrap();
    }
}
