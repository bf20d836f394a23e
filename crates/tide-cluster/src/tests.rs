//! Tests for the tide-cluster crate.

use tide_types::{DiskId, NodeId, Topology};

use crate::{ClusterError, ClusterEvent, ClusterState, Membership};

fn cell() -> std::sync::Arc<ClusterState> {
    ClusterState::new(NodeId(0), Topology::new(3, 2))
}

#[tokio::test]
async fn test_new_cell_is_fully_online() {
    let state = cell();
    let mask = state.current_disk_mask().await;
    assert_eq!(mask.count(), 6);
    assert_eq!(state.provisioned_nodes().await.len(), 3);
    assert_eq!(
        state.local_disks(),
        vec![DiskId::new(0, 0), DiskId::new(0, 1)]
    );
}

#[tokio::test]
async fn test_views_share_the_cell() {
    let state = cell();
    let other = state.view_as(NodeId(2));
    assert_eq!(other.local_node(), NodeId(2));

    state.set_disk_offline(DiskId::new(1, 1)).await.unwrap();
    assert!(!other.current_disk_mask().await.contains(DiskId::new(1, 1)));
}

#[tokio::test]
async fn test_disk_events_only_on_change() {
    let state = cell();
    let mut rx = state.subscribe();

    state.set_disk_offline(DiskId::new(2, 0)).await.unwrap();
    state.set_disk_offline(DiskId::new(2, 0)).await.unwrap();
    state.set_disk_online(DiskId::new(2, 0)).await.unwrap();

    assert_eq!(
        rx.recv().await.unwrap(),
        ClusterEvent::DiskOffline(DiskId::new(2, 0))
    );
    assert_eq!(
        rx.recv().await.unwrap(),
        ClusterEvent::DiskOnline(DiskId::new(2, 0))
    );
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_unprovision_takes_disks_offline() {
    let state = cell();
    state.set_provisioned(NodeId(2), false).await.unwrap();

    assert!(!state.is_provisioned(NodeId(2)).await);
    let mask = state.current_disk_mask().await;
    assert!(!mask.contains(DiskId::new(2, 0)));
    assert!(!mask.contains(DiskId::new(2, 1)));
    assert_eq!(mask.count(), 4);
}

#[tokio::test]
async fn test_unknown_disk_rejected() {
    let state = cell();
    let err = state.set_disk_offline(DiskId::new(0, 5)).await.unwrap_err();
    assert!(matches!(err, ClusterError::DiskNotFound(_)));
    let err = state.set_node_offline(NodeId(9)).await.unwrap_err();
    assert!(matches!(err, ClusterError::NodeNotFound(_)));
}
