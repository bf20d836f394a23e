//! Per-node repair driver.
//!
//! The coordinator is the only writer of the node's snapshot. Each
//! iteration it:
//!
//! 1. re-reads the disk mask and any pending config change and pushes them
//!    into the [`TaskList`];
//! 2. collects the local done masks;
//! 3. unions them with the local done masks of every reachable peer to get
//!    the cluster-wide done masks, recording cluster-wide-done transitions;
//! 4. recomputes unhealed failures and failure tolerance;
//! 5. republishes the snapshot if anything changed.
//!
//! Peers are polled concurrently. Unreachable peers, and peers that don't
//! answer within `[coordinator] peer_timeout_ms`, are left out of that
//! round's union. A task only counts as done cluster-wide once every online,
//! enabled disk's node has reported it, so a missing peer can delay
//! convergence but never fake it.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tide_types::events::{ClusterTaskDone, ToleranceChanged};
use tide_types::{DiskMask, TaskLabel, unix_millis};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RepairConfig;
use crate::context::RepairContext;
use crate::snapshot::{ClusterDoneEvent, NodeSnapshot, TaskCycle};
use crate::task_list::TaskList;

/// Failure accounting of one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Tolerance {
    unhealed: usize,
    unique_nodes: usize,
    tolerant: bool,
}

/// Drives one node's repair tasks and publishes its state.
pub struct Coordinator {
    ctx: Arc<RepairContext>,
    tasks: TaskList,
    config_rx: watch::Receiver<Arc<RepairConfig>>,
    config: Arc<RepairConfig>,
    mask: Option<DiskMask>,
    local_done: BTreeMap<TaskLabel, DiskMask>,
    cluster_done: BTreeMap<TaskLabel, DiskMask>,
    converged: BTreeMap<TaskLabel, bool>,
    done_events: BTreeMap<TaskLabel, ClusterDoneEvent>,
    /// Cleared the first time the cell is tolerant; never set again.
    initial_tolerance: bool,
    tolerance: Tolerance,
    cycles: Vec<TaskCycle>,
    dirty: bool,
}

impl Coordinator {
    /// Coordinator over every registered algorithm.
    pub fn new(ctx: Arc<RepairContext>) -> Self {
        let tasks = TaskList::new(&ctx);
        Self::with_task_list(ctx, tasks)
    }

    /// Coordinator over a prepared task list.
    pub fn with_task_list(ctx: Arc<RepairContext>, tasks: TaskList) -> Self {
        let mut config_rx = ctx.config.subscribe();
        let config = config_rx.borrow_and_update().clone();
        let empty: BTreeMap<TaskLabel, DiskMask> = TaskLabel::ALL
            .into_iter()
            .map(|t| (t, DiskMask::empty(ctx.topology)))
            .collect();
        Self {
            ctx,
            tasks,
            config_rx,
            config,
            mask: None,
            local_done: empty.clone(),
            cluster_done: empty,
            converged: BTreeMap::new(),
            done_events: BTreeMap::new(),
            initial_tolerance: true,
            tolerance: Tolerance {
                unhealed: 0,
                unique_nodes: 0,
                tolerant: true,
            },
            cycles: Vec::new(),
            dirty: true,
        }
    }

    /// The node's steppers.
    pub fn tasks(&self) -> &TaskList {
        &self.tasks
    }

    /// The published failure-tolerance flag.
    pub fn is_tolerant(&self) -> bool {
        self.tolerance.tolerant
    }

    /// Whether `task` is currently done on every online disk.
    pub fn is_cluster_done(&self, task: TaskLabel) -> bool {
        self.converged.get(&task).copied().unwrap_or(false)
    }

    /// Stop every stepper.
    pub async fn stop_tasks(&mut self) {
        self.tasks.stop_all().await;
    }

    /// Run one iteration.
    pub async fn tick(&mut self) {
        let mask = self.ctx.membership.current_disk_mask().await;

        let mut reconfigure = false;
        if self.mask.as_ref() != Some(&mask) {
            info!(node = %self.ctx.node, %mask, "disk mask changed");
            self.mask = Some(mask.clone());
            reconfigure = true;
        }
        if self.config_rx.has_changed().unwrap_or(false) {
            self.config = self.config_rx.borrow_and_update().clone();
            info!(node = %self.ctx.node, "configuration changed");
            reconfigure = true;
        }
        if reconfigure {
            self.tasks.apply(&mask, &self.config).await;
            self.dirty = true;
        }

        let local_done = self.tasks.compute_task_done_masks();
        if local_done != self.local_done {
            self.local_done = local_done;
            self.dirty = true;
        }

        let cluster_done =
            aggregate(&self.ctx, &self.local_done, self.config.peer_timeout()).await;
        let target = self.convergence_mask(&mask);
        self.record_transitions(&cluster_done, &target);
        if cluster_done != self.cluster_done {
            self.cluster_done = cluster_done;
            self.dirty = true;
        }

        self.update_tolerance(&mask).await;

        let cycles = self.tasks.cycle_states();
        if cycles != self.cycles {
            self.cycles = cycles;
            self.dirty = true;
        }

        if self.dirty {
            self.publish();
        }
    }

    /// Online disks expected to report. Administratively disabled disks run
    /// no steppers.
    fn convergence_mask(&self, mask: &DiskMask) -> DiskMask {
        let mut target = mask.clone();
        for disk in &self.config.admin.disabled_disks {
            target.remove(*disk);
        }
        target
    }

    fn record_transitions(&mut self, cluster_done: &BTreeMap<TaskLabel, DiskMask>, mask: &DiskMask) {
        for task in TaskLabel::ALL {
            let converged = !mask.is_empty()
                && cluster_done
                    .get(&task)
                    .is_some_and(|done| done.is_superset(mask));
            let was = self.converged.insert(task, converged).unwrap_or(false);
            if !converged || was {
                continue;
            }

            info!(node = %self.ctx.node, %task, %mask, "task done cluster-wide");
            if task == TaskLabel::RecoverLostFrags {
                self.ctx.healed.set(mask.clone());
            }
            self.done_events.insert(
                task,
                ClusterDoneEvent {
                    at_ms: unix_millis(),
                    mask: mask.clone(),
                },
            );
            self.ctx.events.emit(ClusterTaskDone {
                task,
                mask: mask.clone(),
            });
            self.dirty = true;
        }
    }

    async fn update_tolerance(&mut self, mask: &DiskMask) {
        let topology = self.ctx.topology;
        let failed = match self.ctx.healed.get() {
            Some(healed) => healed.difference(mask),
            None => {
                let provisioned = self.ctx.membership.provisioned_nodes().await;
                DiskMask::from_disks(
                    topology,
                    provisioned
                        .into_iter()
                        .flat_map(|n| topology.disks_of(n))
                        .filter(|d| !mask.contains(*d)),
                )
            }
        };

        let unhealed = failed.count();
        let unique_nodes = failed.nodes().len();
        let current = unique_nodes <= self.config.scheme().tolerance();
        if current && self.initial_tolerance {
            self.initial_tolerance = false;
            debug!(node = %self.ctx.node, "initial tolerance grace ended");
        }

        let next = Tolerance {
            unhealed,
            unique_nodes,
            tolerant: self.initial_tolerance || current,
        };
        if next == self.tolerance {
            return;
        }
        if next.tolerant != self.tolerance.tolerant {
            if next.tolerant {
                info!(node = %self.ctx.node, unhealed, unique_nodes, "failure tolerance restored");
            } else {
                warn!(node = %self.ctx.node, unhealed, unique_nodes, "failure tolerance lost");
            }
            self.ctx.events.emit(ToleranceChanged {
                tolerant: next.tolerant,
                unhealed,
                unique_nodes,
            });
        }
        self.tolerance = next;
        self.dirty = true;
    }

    fn publish(&mut self) {
        let snapshot = NodeSnapshot {
            node: self.ctx.node,
            version: 0,
            published_ms: 0,
            local_done: self.local_done.clone(),
            cluster_done: self.cluster_done.clone(),
            cluster_done_events: self.done_events.clone(),
            unhealed: self.tolerance.unhealed,
            unique_unhealed_nodes: self.tolerance.unique_nodes,
            tolerant: self.tolerance.tolerant,
            cycles: self.cycles.clone(),
        };
        let published = self.ctx.publisher.publish(snapshot);
        debug!(node = %self.ctx.node, version = published.version, "published snapshot");
        self.dirty = false;
    }

    /// Loop until `shutdown` fires, then stop every task.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(node = %self.ctx.node, "repair coordinator started");
        let mut membership = Some(self.ctx.membership.subscribe());

        loop {
            self.tick().await;
            let interval = self.config.coordinator_interval();

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
                event = recv_membership(&mut membership) => match event {
                    Ok(event) => debug!(node = %self.ctx.node, ?event, "membership changed"),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!(node = %self.ctx.node, skipped = n, "membership events lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => membership = None,
                },
            }
        }

        self.stop_tasks().await;
        info!(node = %self.ctx.node, "repair coordinator stopped");
    }
}

/// Union of `local_done` and the local done masks of every peer that
/// answers within `timeout`.
async fn aggregate(
    ctx: &RepairContext,
    local_done: &BTreeMap<TaskLabel, DiskMask>,
    timeout: Duration,
) -> BTreeMap<TaskLabel, DiskMask> {
    let mut fetches = JoinSet::new();
    for node in ctx.membership.provisioned_nodes().await {
        if node == ctx.node {
            continue;
        }
        let peers = ctx.peers.clone();
        fetches.spawn(async move {
            let fetched = tokio::time::timeout(timeout, peers.fetch_snapshot(node)).await;
            (node, fetched)
        });
    }

    let mut union = local_done.clone();
    while let Some(joined) = fetches.join_next().await {
        match joined {
            Ok((_, Ok(Ok(snapshot)))) => {
                for (task, done) in &snapshot.local_done {
                    union
                        .entry(*task)
                        .or_insert_with(|| DiskMask::empty(ctx.topology))
                        .union_with(done);
                }
            }
            Ok((node, Ok(Err(e)))) => {
                debug!(%node, error = %e, "peer snapshot unavailable, skipping");
            }
            Ok((node, Err(_))) => {
                warn!(%node, ?timeout, "peer snapshot timed out, skipping");
            }
            Err(e) => warn!(error = %e, "snapshot fetch task failed"),
        }
    }
    union
}

async fn recv_membership(
    rx: &mut Option<broadcast::Receiver<tide_cluster::ClusterEvent>>,
) -> Result<tide_cluster::ClusterEvent, broadcast::error::RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
