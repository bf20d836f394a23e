//! TOML configuration for the repair engine.
//!
//! Every section is optional; missing keys take the defaults below. The live
//! configuration is shared through a [`ConfigHandle`], which the coordinator
//! watches for changes.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tide_types::{DiskId, RedundancyScheme, TaskLabel, Topology};
use tokio::sync::watch;

use crate::error::RepairError;
use crate::tasks;

/// Wall-clock budget for one cycle of a task.
///
/// Written in TOML as integer seconds: `0` disables the task, any negative
/// value runs it at full speed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub enum CycleGoal {
    /// Don't run.
    Disabled,
    /// Run steps back to back without pacing.
    FullSpeed,
    /// Spread one cycle over this many seconds.
    Seconds(u64),
}

impl CycleGoal {
    /// Whether the task should run at all.
    pub fn is_enabled(&self) -> bool {
        !matches!(self, CycleGoal::Disabled)
    }

    /// Time budget of one of `num_steps` steps, `None` when unpaced.
    pub fn step_goal(&self, num_steps: usize) -> Option<Duration> {
        match self {
            CycleGoal::Seconds(secs) => Some(Duration::from_millis(
                secs.saturating_mul(1000) / num_steps.max(1) as u64,
            )),
            _ => None,
        }
    }

    /// Active time as a percentage of the cycle budget.
    pub fn load_percent(&self, active: Duration) -> u32 {
        match self {
            CycleGoal::Seconds(secs) if *secs > 0 => {
                (active.as_millis() * 100 / (*secs as u128 * 1000)).min(u32::MAX as u128) as u32
            }
            CycleGoal::FullSpeed => 100,
            _ => 0,
        }
    }
}

impl From<i64> for CycleGoal {
    fn from(secs: i64) -> Self {
        match secs {
            0 => CycleGoal::Disabled,
            s if s < 0 => CycleGoal::FullSpeed,
            s => CycleGoal::Seconds(s as u64),
        }
    }
}

impl From<CycleGoal> for i64 {
    fn from(goal: CycleGoal) -> Self {
        match goal {
            CycleGoal::Disabled => 0,
            CycleGoal::FullSpeed => -1,
            CycleGoal::Seconds(s) => s as i64,
        }
    }
}

/// Top-level configuration, parsed from TOML.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepairConfig {
    /// Cell shape.
    pub cell: CellSection,
    /// Erasure coding parameters.
    pub scheme: SchemeSection,
    /// Per-task cycle goals.
    pub tasks: TasksSection,
    /// Lost-fragment recovery tuning.
    pub recovery: RecoverySection,
    /// Temp-fragment cleanup tuning.
    pub temp: TempSection,
    /// Coordinator loop tuning.
    pub coordinator: CoordinatorSection,
    /// Administrative overrides.
    pub admin: AdminSection,
    /// Logging configuration.
    pub log: LogSection,
}

/// `[cell]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CellSection {
    /// Configured nodes, including those not provisioned yet.
    pub node_count: u16,
    /// Disks per node.
    pub disks_per_node: u16,
    /// Partitions objects hash into.
    pub partitions: u32,
}

impl Default for CellSection {
    fn default() -> Self {
        Self {
            node_count: 6,
            disks_per_node: 1,
            partitions: 64,
        }
    }
}

/// `[scheme]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemeSection {
    /// Fragments required to rebuild an object.
    pub data: u8,
    /// Fragments that may be lost.
    pub parity: u8,
}

impl Default for SchemeSection {
    fn default() -> Self {
        let scheme = RedundancyScheme::default();
        Self {
            data: scheme.data,
            parity: scheme.parity,
        }
    }
}

/// `[tasks]` section: one cycle goal per task, keyed by its cycle-goal key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TasksSection {
    /// `remove_dup_frags`
    pub remove_dup_frags: CycleGoal,
    /// `remove_temp_frags`
    pub remove_temp_frags: CycleGoal,
    /// `populate_sys_cache`
    pub populate_sys_cache: CycleGoal,
    /// `populate_ext_cache`
    pub populate_ext_cache: CycleGoal,
    /// `recover_lost_frags`
    pub recover_lost_frags: CycleGoal,
    /// `scan_frags`
    pub scan_frags: CycleGoal,
}

impl Default for TasksSection {
    fn default() -> Self {
        Self {
            remove_dup_frags: CycleGoal::Seconds(3_600),
            remove_temp_frags: CycleGoal::Seconds(3_600),
            populate_sys_cache: CycleGoal::Seconds(3_600),
            populate_ext_cache: CycleGoal::Seconds(3_600),
            recover_lost_frags: CycleGoal::Seconds(1_800),
            scan_frags: CycleGoal::Seconds(86_400),
        }
    }
}

impl TasksSection {
    /// The goal stored under `key`.
    pub fn goal(&self, key: &str) -> Option<CycleGoal> {
        Some(match key {
            "remove_dup_frags" => self.remove_dup_frags,
            "remove_temp_frags" => self.remove_temp_frags,
            "populate_sys_cache" => self.populate_sys_cache,
            "populate_ext_cache" => self.populate_ext_cache,
            "recover_lost_frags" => self.recover_lost_frags,
            "scan_frags" => self.scan_frags,
            _ => return None,
        })
    }

    /// Store `goal` under `key`. Returns `false` for an unknown key.
    pub fn set_goal(&mut self, key: &str, goal: CycleGoal) -> bool {
        let slot = match key {
            "remove_dup_frags" => &mut self.remove_dup_frags,
            "remove_temp_frags" => &mut self.remove_temp_frags,
            "populate_sys_cache" => &mut self.populate_sys_cache,
            "populate_ext_cache" => &mut self.populate_ext_cache,
            "recover_lost_frags" => &mut self.recover_lost_frags,
            "scan_frags" => &mut self.scan_frags,
            _ => return false,
        };
        *slot = goal;
        true
    }

    /// Apply `goal` to every task.
    pub fn set_all(&mut self, goal: CycleGoal) {
        for info in tasks::REGISTRY.iter() {
            self.set_goal(info.cycle_goal_key, goal);
        }
    }
}

/// `[recovery]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoverySection {
    /// Deadline for all listings of one recovery step.
    pub listing_timeout_secs: u64,
    /// Listings in flight at once across the node.
    pub listing_concurrency: usize,
    /// Copy delete-markers from the healed row instead of skipping them.
    pub allow_deleted_copy: bool,
}

impl Default for RecoverySection {
    fn default() -> Self {
        Self {
            listing_timeout_secs: 600,
            listing_concurrency: 16,
            allow_deleted_copy: false,
        }
    }
}

/// `[temp]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TempSection {
    /// Temp fragments younger than this are left alone.
    pub min_age_secs: u64,
}

impl Default for TempSection {
    fn default() -> Self {
        Self {
            min_age_secs: 12 * 3600,
        }
    }
}

/// `[coordinator]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorSection {
    /// Pause between coordinator iterations.
    pub interval_ms: u64,
    /// How long one iteration waits for a peer's snapshot.
    pub peer_timeout_ms: u64,
}

impl Default for CoordinatorSection {
    fn default() -> Self {
        Self {
            interval_ms: 2_000,
            peer_timeout_ms: 5_000,
        }
    }
}

/// `[admin]` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminSection {
    /// Disks whose repair tasks stay stopped, as `{ node = 1, disk = 0 }`.
    pub disabled_disks: Vec<DiskId>,
}

/// `[log]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSection {
    /// Log level filter (e.g. `"info"`, `"debug"`, `"warn"`).
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl RepairConfig {
    /// Load and validate a TOML file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate a TOML string.
    pub fn from_toml(s: &str) -> anyhow::Result<Self> {
        let config: RepairConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<(), RepairError> {
        if self.scheme.data == 0 || self.scheme.parity == 0 {
            return Err(RepairError::Config(
                "scheme needs at least one data and one parity fragment".to_string(),
            ));
        }
        let total = self.scheme.data as usize + self.scheme.parity as usize;
        if total > self.topology().total_disks() {
            return Err(RepairError::Config(format!(
                "scheme needs {total} disks, cell has {}",
                self.topology().total_disks()
            )));
        }
        if self.cell.partitions == 0 {
            return Err(RepairError::Config("partitions must be positive".to_string()));
        }
        if self.recovery.listing_concurrency == 0 {
            return Err(RepairError::Config(
                "listing_concurrency must be positive".to_string(),
            ));
        }
        if self.coordinator.peer_timeout_ms == 0 {
            return Err(RepairError::Config(
                "peer_timeout_ms must be positive".to_string(),
            ));
        }
        if let Some(disk) = self
            .admin
            .disabled_disks
            .iter()
            .find(|d| self.topology().index_of(**d).is_none())
        {
            return Err(RepairError::Config(format!(
                "disabled disk {disk} is not part of the cell"
            )));
        }
        Ok(())
    }

    /// Cell shape.
    pub fn topology(&self) -> Topology {
        Topology::new(self.cell.node_count, self.cell.disks_per_node)
    }

    /// Redundancy scheme.
    pub fn scheme(&self) -> RedundancyScheme {
        RedundancyScheme::new(self.scheme.data, self.scheme.parity)
    }

    /// Cycle goal configured for `label`.
    pub fn cycle_goal(&self, label: TaskLabel) -> CycleGoal {
        self.tasks
            .goal(tasks::task_info(label).cycle_goal_key)
            .unwrap_or(CycleGoal::Disabled)
    }

    /// Whether `disk` is administratively disabled.
    pub fn is_disabled(&self, disk: DiskId) -> bool {
        self.admin.disabled_disks.contains(&disk)
    }

    /// Listing deadline for recovery steps.
    pub fn listing_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery.listing_timeout_secs)
    }

    /// Coordinator pause between iterations.
    pub fn coordinator_interval(&self) -> Duration {
        Duration::from_millis(self.coordinator.interval_ms)
    }

    /// Deadline for one peer snapshot fetch.
    pub fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.coordinator.peer_timeout_ms)
    }

    /// Minimum age of a temp fragment before cleanup looks at it.
    pub fn temp_min_age_ms(&self) -> u64 {
        self.temp.min_age_secs.saturating_mul(1000)
    }
}

/// Shared, observable configuration.
///
/// Constructed once per node; readers take cheap snapshots with
/// [`current`](Self::current), writers publish with [`update`](Self::update),
/// and the coordinator learns about changes through [`subscribe`](Self::subscribe).
#[derive(Clone)]
pub struct ConfigHandle {
    tx: Arc<watch::Sender<Arc<RepairConfig>>>,
}

impl ConfigHandle {
    /// Wrap an initial configuration.
    pub fn new(config: RepairConfig) -> Self {
        let (tx, _) = watch::channel(Arc::new(config));
        Self { tx: Arc::new(tx) }
    }

    /// The configuration in effect.
    pub fn current(&self) -> Arc<RepairConfig> {
        self.tx.borrow().clone()
    }

    /// Edit the configuration and notify subscribers.
    pub fn update(&self, edit: impl FnOnce(&mut RepairConfig)) {
        self.tx.send_modify(|current| {
            let mut next = RepairConfig::clone(current);
            edit(&mut next);
            *current = Arc::new(next);
        });
    }

    /// Receive change notifications.
    pub fn subscribe(&self) -> watch::Receiver<Arc<RepairConfig>> {
        self.tx.subscribe()
    }
}

impl std::fmt::Debug for ConfigHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigHandle")
            .field("current", &self.current())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
[cell]
node_count = 8
disks_per_node = 4
partitions = 256

[scheme]
data = 6
parity = 2

[tasks]
remove_dup_frags = 7200
remove_temp_frags = 0
scan_frags = -1

[recovery]
listing_timeout_secs = 30
listing_concurrency = 4
allow_deleted_copy = true

[temp]
min_age_secs = 60

[coordinator]
interval_ms = 500
peer_timeout_ms = 250

[admin]
disabled_disks = [{ node = 3, disk = 1 }]

[log]
level = "debug"
"#;

        let config = RepairConfig::from_toml(toml).unwrap();
        assert_eq!(config.topology(), Topology::new(8, 4));
        assert_eq!(config.cell.partitions, 256);
        assert_eq!(config.scheme(), RedundancyScheme::new(6, 2));
        assert_eq!(config.tasks.remove_dup_frags, CycleGoal::Seconds(7200));
        assert_eq!(config.tasks.remove_temp_frags, CycleGoal::Disabled);
        assert_eq!(config.tasks.scan_frags, CycleGoal::FullSpeed);
        assert_eq!(
            config.cycle_goal(TaskLabel::ScanFrags),
            CycleGoal::FullSpeed
        );
        assert_eq!(config.listing_timeout(), Duration::from_secs(30));
        assert_eq!(config.recovery.listing_concurrency, 4);
        assert!(config.recovery.allow_deleted_copy);
        assert_eq!(config.temp.min_age_secs, 60);
        assert_eq!(config.coordinator_interval(), Duration::from_millis(500));
        assert_eq!(config.peer_timeout(), Duration::from_millis(250));
        assert!(config.is_disabled(DiskId::new(3, 1)));
        assert_eq!(config.log.level, "debug");
    }

    #[test]
    fn test_parse_minimal_config() {
        let config = RepairConfig::from_toml("").unwrap();
        assert_eq!(config, RepairConfig::default());
        assert_eq!(config.temp.min_age_secs, 43_200);
        assert_eq!(config.recovery.listing_timeout_secs, 600);
        assert!(!config.recovery.allow_deleted_copy);
        assert_eq!(config.peer_timeout(), Duration::from_secs(5));
        for label in TaskLabel::ALL {
            assert!(config.cycle_goal(label).is_enabled());
        }
    }

    #[test]
    fn test_validate_rejects_oversized_scheme() {
        let toml = r#"
[cell]
node_count = 2
disks_per_node = 1

[scheme]
data = 2
parity = 1
"#;
        assert!(RepairConfig::from_toml(toml).is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_disabled_disk() {
        let mut config = RepairConfig::default();
        config.admin.disabled_disks.push(DiskId::new(99, 0));
        assert!(matches!(config.validate(), Err(RepairError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_peer_timeout() {
        let mut config = RepairConfig::default();
        config.coordinator.peer_timeout_ms = 0;
        assert!(matches!(config.validate(), Err(RepairError::Config(_))));
    }

    #[test]
    fn test_huge_temp_age_saturates() {
        let mut config = RepairConfig::default();
        config.temp.min_age_secs = u64::MAX;
        assert_eq!(config.temp_min_age_ms(), u64::MAX);
        config.temp.min_age_secs = 60;
        assert_eq!(config.temp_min_age_ms(), 60_000);
    }

    #[test]
    fn test_cycle_goal_conversions() {
        assert_eq!(CycleGoal::from(0), CycleGoal::Disabled);
        assert_eq!(CycleGoal::from(-5), CycleGoal::FullSpeed);
        assert_eq!(i64::from(CycleGoal::Seconds(9)), 9);
        assert_eq!(
            CycleGoal::Seconds(10).step_goal(4),
            Some(Duration::from_millis(2_500))
        );
        assert_eq!(CycleGoal::FullSpeed.step_goal(4), None);
        assert_eq!(
            CycleGoal::Seconds(10).load_percent(Duration::from_secs(5)),
            50
        );
    }

    #[tokio::test]
    async fn test_handle_notifies_subscribers() {
        let handle = ConfigHandle::new(RepairConfig::default());
        let mut rx = handle.subscribe();
        assert!(!rx.has_changed().unwrap());

        handle.update(|c| {
            c.tasks.set_goal("scan_frags", CycleGoal::Disabled);
        });

        assert!(rx.has_changed().unwrap());
        let seen = rx.borrow_and_update().clone();
        assert_eq!(seen.tasks.scan_frags, CycleGoal::Disabled);
        assert_eq!(handle.current().tasks.scan_frags, CycleGoal::Disabled);
    }
}
