//! Paced, interruptible cyclic executor for one (algorithm, disk) pair.
//!
//! A [`TaskStepper`] owns a background worker that calls the algorithm's
//! `step` for each index in turn, wrapping around forever. With a cycle goal
//! of `G` seconds over `N` steps, steps are scheduled `G / N` apart; the
//! full-speed goal runs them back to back.
//!
//! Reconfiguration (a new cycle goal, or a new disk mask for tasks whose
//! cycle depends on the layout) cancels the step in flight and wakes a
//! sleeping worker. The interrupted step is discarded and the cycle starts
//! over from the current cursor with fresh counters, so a cycle spanning a
//! reconfiguration is never reported complete.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tide_types::events::{CycleCompleted, EventBus};
use tide_types::{CycleState, Cycles, DiskId, DiskMask, TaskLabel, unix_millis};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::CycleGoal;
use crate::context::RepairContext;
use crate::tasks::{Steppable, TaskInfo};

/// Builds fresh algorithm instances for a stepper.
pub type Factory = Box<dyn Fn() -> Box<dyn Steppable> + Send + Sync>;

/// Parameters the coordinator writes and the worker reads.
struct Params {
    running: bool,
    goal: CycleGoal,
    mask: DiskMask,
    /// Bumped by every reconfiguration that restarts the cycle.
    generation: u64,
    /// Mask the algorithm has not been told about yet.
    pending_mask: Option<DiskMask>,
    /// Cancelled to abort the step in flight.
    step_token: CancellationToken,
    /// Cycles completed since the last start or restart.
    done_cycles: u64,
}

impl Params {
    fn restart(&mut self) {
        self.generation += 1;
        self.done_cycles = 0;
        self.step_token.cancel();
        self.step_token = CancellationToken::new();
    }
}

struct Shared {
    label: TaskLabel,
    disk: DiskId,
    cycles: Cycles,
    params: Mutex<Params>,
    wake: Notify,
    state: Mutex<CycleState>,
    events: EventBus,
}

impl Shared {
    fn params(&self) -> std::sync::MutexGuard<'_, Params> {
        self.params.lock().expect("lock poisoned")
    }

    fn state(&self) -> std::sync::MutexGuard<'_, CycleState> {
        self.state.lock().expect("lock poisoned")
    }

    fn finished(&self, done_cycles: u64) -> bool {
        match self.cycles {
            Cycles::Finite(n) => done_cycles >= u64::from(n),
            Cycles::Infinite => false,
        }
    }
}

/// Runs one algorithm on one disk.
pub struct TaskStepper {
    info: TaskInfo,
    shared: Arc<Shared>,
    factory: Factory,
    idle: Option<Box<dyn Steppable>>,
    worker: Option<JoinHandle<Box<dyn Steppable>>>,
}

impl TaskStepper {
    /// Stepper for the registry entry `info` on `disk`.
    pub fn new(info: TaskInfo, ctx: &Arc<RepairContext>, disk: DiskId) -> Self {
        let ctx = ctx.clone();
        let events = ctx.events.clone();
        let topology = ctx.topology;
        let build = info.build;
        Self::with_factory(
            info,
            disk,
            DiskMask::empty(topology),
            events,
            Box::new(move || build(ctx.clone())),
        )
    }

    /// Stepper whose algorithm instances come from `factory`.
    pub fn with_factory(
        info: TaskInfo,
        disk: DiskId,
        initial_mask: DiskMask,
        events: EventBus,
        factory: Factory,
    ) -> Self {
        let mut algo = factory();
        algo.init(info.label.as_str(), disk);
        Self {
            info,
            shared: Arc::new(Shared {
                label: info.label,
                disk,
                cycles: info.cycles,
                params: Mutex::new(Params {
                    running: false,
                    goal: CycleGoal::Disabled,
                    mask: initial_mask,
                    generation: 0,
                    pending_mask: None,
                    step_token: CancellationToken::new(),
                    done_cycles: 0,
                }),
                wake: Notify::new(),
                state: Mutex::new(CycleState::default()),
                events,
            }),
            factory,
            idle: Some(algo),
            worker: None,
        }
    }

    /// Task label.
    pub fn label(&self) -> TaskLabel {
        self.info.label
    }

    /// The disk this stepper runs on.
    pub fn disk(&self) -> DiskId {
        self.shared.disk
    }

    /// Start stepping with `goal` under `mask`. No-op if already running.
    pub fn start(&mut self, goal: CycleGoal, mask: DiskMask) {
        if self.worker.is_some() {
            return;
        }
        let mut algo = match self.idle.take() {
            Some(algo) => algo,
            None => {
                let mut algo = (self.factory)();
                algo.init(self.info.label.as_str(), self.shared.disk);
                algo
            }
        };
        algo.reset_error_count();

        {
            let mut params = self.shared.params();
            params.running = true;
            params.goal = goal;
            params.mask = mask.clone();
            params.pending_mask = Some(mask);
            params.restart();
        }
        {
            let mut state = self.shared.state();
            *state = CycleState {
                cycles_completed: state.cycles_completed,
                ..CycleState::default()
            };
        }

        debug!(task = %self.info.label, disk = %self.shared.disk, ?goal, "stepper started");
        self.worker = Some(tokio::spawn(run(self.shared.clone(), algo)));
    }

    /// Stop stepping and wait for the worker to exit.
    pub async fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        {
            let mut params = self.shared.params();
            params.running = false;
            params.done_cycles = 0;
            params.step_token.cancel();
        }
        self.shared.wake.notify_one();

        match worker.await {
            Ok(algo) => self.idle = Some(algo),
            Err(e) => {
                error!(task = %self.info.label, disk = %self.shared.disk, error = %e, "stepper worker died");
                self.idle = None;
            }
        }
        debug!(task = %self.info.label, disk = %self.shared.disk, "stepper stopped");
    }

    /// Change the cycle goal, restarting the cycle.
    pub fn set_cycle_goal(&self, goal: CycleGoal) {
        {
            let mut params = self.shared.params();
            if params.goal == goal {
                return;
            }
            params.goal = goal;
            if params.running {
                params.restart();
            }
        }
        self.shared.wake.notify_one();
    }

    /// Change the disk mask.
    ///
    /// Tasks whose cycle depends on the layout restart their cycle; the
    /// others pick the mask up before their next step.
    pub fn set_disk_mask(&self, mask: &DiskMask) {
        {
            let mut params = self.shared.params();
            if params.mask == *mask {
                return;
            }
            params.mask = mask.clone();
            params.pending_mask = Some(mask.clone());
            if params.running && self.info.mask_change_restarts_cycle {
                params.restart();
            }
        }
        self.shared.wake.notify_one();
    }

    /// Whether the worker is running.
    pub fn is_running(&self) -> bool {
        self.worker.is_some() && self.shared.params().running
    }

    /// Whether the stepper is running and has completed its configured
    /// number of cycles since it was last started or restarted.
    pub fn is_done(&self) -> bool {
        let params = self.shared.params();
        if !params.running || self.worker.is_none() {
            return false;
        }
        let needed = match self.info.cycles {
            Cycles::Finite(n) => u64::from(n),
            Cycles::Infinite => 1,
        };
        params.done_cycles >= needed
    }

    /// The current cycle goal.
    pub fn cycle_goal(&self) -> CycleGoal {
        self.shared.params().goal
    }

    /// Progress and fault statistics.
    pub fn cycle_state(&self) -> CycleState {
        self.shared.state().clone()
    }
}

impl Drop for TaskStepper {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.shared.params().step_token.cancel();
            worker.abort();
        }
    }
}

impl std::fmt::Debug for TaskStepper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskStepper")
            .field("task", &self.info.label)
            .field("disk", &self.shared.disk)
            .field("running", &self.is_running())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// Per-cycle accounting kept by the worker.
struct Cycle {
    cursor: usize,
    anchor: usize,
    faults: u64,
    /// (start ms, active time) of the last `num_steps` valid steps.
    window: VecDeque<(u64, Duration)>,
    scheduled: Instant,
}

async fn run(shared: Arc<Shared>, mut algo: Box<dyn Steppable>) -> Box<dyn Steppable> {
    let label = shared.label;
    let disk = shared.disk;
    let num_steps = algo.num_steps().max(1);
    let mut cycle = Cycle {
        cursor: 0,
        anchor: 0,
        faults: 0,
        window: VecDeque::with_capacity(num_steps),
        scheduled: Instant::now(),
    };
    let mut seen_generation = None;

    loop {
        let (goal, generation, token, pending_mask, finished) = {
            let mut params = shared.params();
            if !params.running {
                break;
            }
            (
                params.goal,
                params.generation,
                params.step_token.clone(),
                params.pending_mask.take(),
                shared.finished(params.done_cycles),
            )
        };

        if let Some(mask) = pending_mask {
            algo.new_disk_mask(&mask);
        }

        if seen_generation != Some(generation) {
            if seen_generation.is_some() {
                debug!(task = %label, %disk, cursor = cycle.cursor, "cycle restarted");
            }
            seen_generation = Some(generation);
            cycle.anchor = cycle.cursor;
            cycle.faults = 0;
            cycle.window.clear();
            cycle.scheduled = Instant::now();
            algo.reset_error_count();
            let mut state = shared.state();
            *state = CycleState {
                cycles_completed: state.cycles_completed,
                ..CycleState::default()
            };
        }

        if !goal.is_enabled() || finished {
            shared.wake.notified().await;
            continue;
        }

        let started_ms = unix_millis();
        let started = Instant::now();
        let result = algo.step(cycle.cursor, &token).await;
        let elapsed = started.elapsed();

        let mut faults = algo.error_count();
        algo.reset_error_count();
        let aborted = matches!(&result, Err(e) if e.is_abort());
        if let Err(e) = &result {
            if !aborted {
                warn!(task = %label, %disk, step = cycle.cursor, error = %e, "step failed");
                faults += 1;
            }
        }

        let still_current = shared.params().generation == generation;
        if aborted || !still_current {
            debug!(task = %label, %disk, step = cycle.cursor, "step invalidated");
            continue;
        }

        cycle.faults += faults;
        cycle.window.push_back((started_ms, elapsed));
        while cycle.window.len() > num_steps {
            cycle.window.pop_front();
        }
        cycle.cursor = (cycle.cursor + 1) % num_steps;
        let completed = cycle.cursor == cycle.anchor;

        let cycles_completed = {
            let mut state = shared.state();
            if state.cycle_started_ms.is_none() {
                state.cycle_started_ms = Some(started_ms);
            }
            if faults > 0 {
                state.run_started_ms = None;
            } else if state.run_started_ms.is_none() {
                state.run_started_ms = Some(started_ms);
            }
            state.window_started_ms = cycle.window.front().map(|(ms, _)| *ms);
            state.load_percent = goal.load_percent(cycle.window.iter().map(|(_, d)| *d).sum());
            state.faults = cycle.faults;
            if completed {
                state.cycles_completed += 1;
                state.percent_complete = 100;
            } else {
                let steps = (cycle.cursor + num_steps - cycle.anchor) % num_steps;
                state.percent_complete = (steps * 100 / num_steps) as u8;
            }
            state.cycles_completed
        };

        if completed {
            {
                let mut params = shared.params();
                if params.generation == generation {
                    params.done_cycles += 1;
                }
            }
            info!(task = %label, %disk, cycles = cycles_completed, faults = cycle.faults, "cycle complete");
            shared.events.emit(CycleCompleted {
                task: label,
                disk,
                cycles: cycles_completed,
                faults: cycle.faults,
            });
            cycle.faults = 0;
            let mut state = shared.state();
            state.faults = 0;
            state.cycle_started_ms = None;
        }

        match goal.step_goal(num_steps) {
            Some(step_goal) => {
                cycle.scheduled += step_goal;
                let now = Instant::now();
                if cycle.scheduled < now {
                    warn!(
                        task = %label,
                        %disk,
                        late_ms = (now - cycle.scheduled).as_millis() as u64,
                        "behind schedule"
                    );
                    cycle.scheduled = now;
                } else {
                    pause_until(&shared, cycle.scheduled, generation).await;
                }
            }
            None => tokio::task::yield_now().await,
        }
    }

    algo
}

/// Sleep until `deadline` unless stopped or restarted first.
async fn pause_until(shared: &Shared, deadline: Instant, generation: u64) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => return,
            _ = shared.wake.notified() => {
                let params = shared.params();
                if !params.running || params.generation != generation {
                    return;
                }
            }
        }
    }
}
