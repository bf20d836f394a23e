//! Repair task labels and per-(task, disk) cycle statistics.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The six background repair algorithms.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TaskLabel {
    /// Delete fragments held by a disk the layout no longer assigns them to.
    RemoveDupFrags,
    /// Resolve leftovers of interrupted stores in the temp directory.
    RemoveTempFrags,
    /// Reconcile the system metadata cache with on-disk fragments.
    PopulateSysCache,
    /// Reconcile the external metadata cache with on-disk fragments.
    PopulateExtCache,
    /// Re-create fragments the layout expects on this disk.
    RecoverLostFrags,
    /// Verify fragment checksums and drop corrupt fragments.
    ScanFrags,
}

impl TaskLabel {
    /// Every task, in registry order.
    pub const ALL: [TaskLabel; 6] = [
        TaskLabel::RemoveDupFrags,
        TaskLabel::RemoveTempFrags,
        TaskLabel::PopulateSysCache,
        TaskLabel::PopulateExtCache,
        TaskLabel::RecoverLostFrags,
        TaskLabel::ScanFrags,
    ];

    /// Stable name used in logs and snapshots.
    pub const fn as_str(&self) -> &'static str {
        match self {
            TaskLabel::RemoveDupFrags => "RemoveDupFrags",
            TaskLabel::RemoveTempFrags => "RemoveTempFrags",
            TaskLabel::PopulateSysCache => "PopulateSysCache",
            TaskLabel::PopulateExtCache => "PopulateExtCache",
            TaskLabel::RecoverLostFrags => "RecoverLostFrags",
            TaskLabel::ScanFrags => "ScanFrags",
        }
    }
}

impl fmt::Display for TaskLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a string names no known task.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown repair task: {0}")]
pub struct ParseTaskLabelError(pub String);

impl FromStr for TaskLabel {
    type Err = ParseTaskLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskLabel::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ParseTaskLabelError(s.to_string()))
    }
}

/// How many cycles a task runs before it stops on its own.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Cycles {
    /// Stop after this many complete cycles.
    Finite(u32),
    /// Run forever; "done" is re-derived every cycle.
    Infinite,
}

/// Progress and fault statistics for one (task, disk) stepper.
///
/// Timestamps are unix milliseconds.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleState {
    /// Progress through the current cycle, 0..=100.
    pub percent_complete: u8,
    /// Cycles completed since the stepper was created.
    pub cycles_completed: u64,
    /// Faults counted so far in the current cycle.
    pub faults: u64,
    /// When the current cycle started.
    pub cycle_started_ms: Option<u64>,
    /// Start of the current fault-free run; `None` right after a faulting step.
    pub run_started_ms: Option<u64>,
    /// Start of the oldest step still inside the rolling one-cycle window.
    pub window_started_ms: Option<u64>,
    /// Active step time over the window as a percentage of the cycle goal.
    pub load_percent: u32,
}
