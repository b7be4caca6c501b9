//! Phase controller
//!
//! A run walks Preload → WarmUp → Measure → CoolDown → Done. Transitions are
//! driven by a monotonic clock on a dedicated thread, only ever move forward,
//! and are published to subscribers before workers can observe the new phase.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{info, warn};

use crate::config::RunConfig;
use crate::error::{Result, RunError};
use crate::signal::RunSignal;

/// Stage of the run protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum Phase {
    /// Ingest-only history load
    Preload = 0,
    /// Full workload, samples not measured
    WarmUp = 1,
    /// Full workload, samples measured
    Measure = 2,
    /// Full workload, samples not measured
    CoolDown = 3,
    /// Run finished
    Done = 4,
}

impl Phase {
    /// Every phase in protocol order
    pub const ALL: [Phase; 5] = [
        Phase::Preload,
        Phase::WarmUp,
        Phase::Measure,
        Phase::CoolDown,
        Phase::Done,
    ];

    /// The phase that follows this one
    pub fn next(self) -> Option<Phase> {
        match self {
            Phase::Preload => Some(Phase::WarmUp),
            Phase::WarmUp => Some(Phase::Measure),
            Phase::Measure => Some(Phase::CoolDown),
            Phase::CoolDown => Some(Phase::Done),
            Phase::Done => None,
        }
    }

    /// Position in [`Phase::ALL`]
    pub fn index(self) -> usize {
        self as usize
    }

    fn from_u8(value: u8) -> Phase {
        match value {
            0 => Phase::Preload,
            1 => Phase::WarmUp,
            2 => Phase::Measure,
            3 => Phase::CoolDown,
            _ => Phase::Done,
        }
    }

    /// Whether query workers run in this phase
    pub fn runs_queries(self) -> bool {
        matches!(self, Phase::WarmUp | Phase::Measure | Phase::CoolDown)
    }

    /// Lower-case label
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Preload => "preload",
            Phase::WarmUp => "warm_up",
            Phase::Measure => "measure",
            Phase::CoolDown => "cool_down",
            Phase::Done => "done",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Real-time length of each timed phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseSchedule {
    /// Preload length
    pub preload: Duration,
    /// WarmUp length
    pub warm_up: Duration,
    /// Measure length
    pub measure: Duration,
    /// CoolDown length
    pub cool_down: Duration,
}

impl PhaseSchedule {
    /// Length of `phase`; `Done` has none
    pub fn duration(&self, phase: Phase) -> Duration {
        match phase {
            Phase::Preload => self.preload,
            Phase::WarmUp => self.warm_up,
            Phase::Measure => self.measure,
            Phase::CoolDown => self.cool_down,
            Phase::Done => Duration::ZERO,
        }
    }
}

impl From<&RunConfig> for PhaseSchedule {
    fn from(config: &RunConfig) -> Self {
        Self {
            preload: config.preload,
            warm_up: config.warm_up,
            measure: config.measure,
            cool_down: config.cool_down,
        }
    }
}

/// A published phase change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseTransition {
    /// Previous phase; `None` for the initial entry into Preload
    pub from: Option<Phase>,
    /// New phase
    pub to: Phase,
    /// Monotonic time of the change
    pub at: Instant,
}

/// Wall-clock span a phase occupied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseWindow {
    /// Entry time
    pub start: Instant,
    /// Exit time, if the phase has ended
    pub end: Option<Instant>,
}

impl PhaseWindow {
    /// Length of the window; open windows are measured up to now
    pub fn duration(&self) -> Duration {
        self.end
            .unwrap_or_else(Instant::now)
            .saturating_duration_since(self.start)
    }
}

/// How the phase driver finished
#[derive(Debug)]
pub enum PhaseOutcome {
    /// Reached Done
    Completed,
    /// Cancelled while in `phase`
    Aborted {
        /// Phase at cancellation
        phase: Phase,
    },
    /// A phase gate rejected the transition
    GateFailed(RunError),
}

/// Callback invoked on every transition
pub type TransitionCallback = Box<dyn Fn(&PhaseTransition) + Send + Sync>;

/// Check run at the end of a phase; an error stops the run
pub type PhaseGate = Box<dyn FnOnce(&PhaseHandle) -> Result<()> + Send>;

struct PhaseState {
    current: AtomicU8,
    finished: AtomicBool,
    started: Instant,
    windows: RwLock<[Option<PhaseWindow>; 5]>,
    subscribers: RwLock<Vec<TransitionCallback>>,
    lock: Mutex<()>,
    changed: Condvar,
    signal: RunSignal,
}

/// Builder for a phase-driven run
pub struct PhaseController {
    schedule: PhaseSchedule,
    signal: RunSignal,
    subscribers: Vec<TransitionCallback>,
    gates: Vec<(Phase, PhaseGate)>,
}

impl PhaseController {
    /// Create a controller for `schedule`, cancellable through `signal`
    pub fn new(schedule: PhaseSchedule, signal: RunSignal) -> Self {
        Self {
            schedule,
            signal,
            subscribers: Vec::new(),
            gates: Vec::new(),
        }
    }

    /// Subscribe to transitions, including the initial entry into Preload
    pub fn on_transition<F>(&mut self, callback: F)
    where
        F: Fn(&PhaseTransition) + Send + Sync + 'static,
    {
        self.subscribers.push(Box::new(callback));
    }

    /// Run `gate` when `phase` ends, before the next phase is published
    pub fn gate<F>(&mut self, phase: Phase, gate: F)
    where
        F: FnOnce(&PhaseHandle) -> Result<()> + Send + 'static,
    {
        self.gates.push((phase, Box::new(gate)));
    }

    /// Enter Preload and start the clock
    pub fn start(self) -> Result<(PhaseHandle, PhaseDriver)> {
        let now = Instant::now();
        let state = Arc::new(PhaseState {
            current: AtomicU8::new(Phase::Preload as u8),
            finished: AtomicBool::new(false),
            started: now,
            windows: RwLock::new([None; 5]),
            subscribers: RwLock::new(self.subscribers),
            lock: Mutex::new(()),
            changed: Condvar::new(),
            signal: self.signal,
        });
        let handle = PhaseHandle { state };
        handle.publish(PhaseTransition {
            from: None,
            to: Phase::Preload,
            at: now,
        });

        let schedule = self.schedule;
        let mut gates = self.gates;
        let driver_handle = handle.clone();
        let join = thread::Builder::new()
            .name("phase-controller".to_string())
            .spawn(move || drive(driver_handle, schedule, &mut gates))
            .map_err(|source| RunError::Spawn {
                worker: "phase controller",
                source,
            })?;

        Ok((handle, PhaseDriver { join }))
    }
}

fn drive(handle: PhaseHandle, schedule: PhaseSchedule, gates: &mut Vec<(Phase, PhaseGate)>) -> PhaseOutcome {
    let signal = handle.signal().clone();
    let mut phase = Phase::Preload;
    let mut entered = handle.state.started;

    while let Some(next) = phase.next() {
        if !signal.sleep_until(entered + schedule.duration(phase)) {
            return handle.finish_aborted(phase);
        }

        if let Some(pos) = gates.iter().position(|(p, _)| *p == phase) {
            let (_, gate) = gates.remove(pos);
            if let Err(err) = gate(&handle) {
                warn!(%phase, error = %err, "phase gate rejected transition");
                handle.finish();
                return PhaseOutcome::GateFailed(err);
            }
        }
        if signal.is_cancelled() {
            return handle.finish_aborted(phase);
        }

        entered = Instant::now();
        handle.publish(PhaseTransition {
            from: Some(phase),
            to: next,
            at: entered,
        });
        info!(from = %phase, to = %next, elapsed = ?handle.elapsed(), "phase transition");
        phase = next;
    }

    handle.finish();
    PhaseOutcome::Completed
}

/// Owner of the controller thread
pub struct PhaseDriver {
    join: JoinHandle<PhaseOutcome>,
}

impl PhaseDriver {
    /// Wait for the run protocol to finish
    pub fn join(self) -> Result<PhaseOutcome> {
        self.join
            .join()
            .map_err(|_| RunError::WorkerPanicked("phase controller"))
    }
}

/// Read/subscribe view of the current phase, shared by every worker
#[derive(Clone)]
pub struct PhaseHandle {
    state: Arc<PhaseState>,
}

impl PhaseHandle {
    /// The phase in effect right now
    pub fn current_phase(&self) -> Phase {
        Phase::from_u8(self.state.current.load(Ordering::Acquire))
    }

    /// Time since the run started
    pub fn elapsed(&self) -> Duration {
        self.state.started.elapsed()
    }

    /// Monotonic start of the run
    pub fn started_at(&self) -> Instant {
        self.state.started
    }

    /// Span occupied by `phase`, if it was entered
    pub fn window(&self, phase: Phase) -> Option<PhaseWindow> {
        self.state.windows.read()[phase.index()]
    }

    /// Subscribe to transitions that happen after this call
    ///
    /// Callbacks run on the controller thread and must not subscribe again.
    pub fn on_transition<F>(&self, callback: F)
    where
        F: Fn(&PhaseTransition) + Send + Sync + 'static,
    {
        self.state.subscribers.write().push(Box::new(callback));
    }

    /// The run's cancellation signal
    pub fn signal(&self) -> &RunSignal {
        &self.state.signal
    }

    /// Request cancellation of the run
    pub fn cancel(&self) {
        self.state.signal.cancel();
        let _guard = self.state.lock.lock();
        self.state.changed.notify_all();
    }

    /// Whether the driver has stopped, for any reason
    pub fn is_finished(&self) -> bool {
        self.state.finished.load(Ordering::Acquire)
    }

    /// Whether workers must stop issuing operations
    pub fn should_stop(&self) -> bool {
        self.is_finished() || self.state.signal.is_cancelled() || self.current_phase() == Phase::Done
    }

    /// Block until `phase` (or a later one) is reached
    ///
    /// Returns `false` if the run ended or was cancelled first.
    pub fn wait_for(&self, phase: Phase) -> bool {
        let mut guard = self.state.lock.lock();
        loop {
            if self.current_phase() >= phase {
                return true;
            }
            if self.is_finished() || self.state.signal.is_cancelled() {
                return false;
            }
            self.state.changed.wait(&mut guard);
        }
    }

    fn publish(&self, transition: PhaseTransition) {
        {
            let mut windows = self.state.windows.write();
            if let Some(from) = transition.from {
                if let Some(window) = windows[from.index()].as_mut() {
                    window.end = Some(transition.at);
                }
            }
            windows[transition.to.index()] = Some(PhaseWindow {
                start: transition.at,
                end: None,
            });
        }

        for callback in self.state.subscribers.read().iter() {
            callback(&transition);
        }

        let _guard = self.state.lock.lock();
        self.state
            .current
            .store(transition.to as u8, Ordering::Release);
        self.state.changed.notify_all();
    }

    fn finish(&self) {
        let now = Instant::now();
        {
            let mut windows = self.state.windows.write();
            let current = self.current_phase().index();
            if let Some(window) = windows[current].as_mut() {
                window.end.get_or_insert(now);
            }
        }
        let _guard = self.state.lock.lock();
        self.state.finished.store(true, Ordering::Release);
        self.state.changed.notify_all();
    }

    fn finish_aborted(&self, phase: Phase) -> PhaseOutcome {
        warn!(%phase, "run cancelled");
        self.finish();
        PhaseOutcome::Aborted { phase }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule(ms: u64) -> PhaseSchedule {
        let d = Duration::from_millis(ms);
        PhaseSchedule {
            preload: d,
            warm_up: d,
            measure: d,
            cool_down: d,
        }
    }

    #[test]
    fn test_phase_order() {
        let mut phase = Phase::Preload;
        let mut seen = vec![phase];
        while let Some(next) = phase.next() {
            assert!(next > phase);
            seen.push(next);
            phase = next;
        }
        assert_eq!(seen, Phase::ALL.to_vec());
        assert!(!Phase::Preload.runs_queries());
        assert!(Phase::Measure.runs_queries());
        assert!(!Phase::Done.runs_queries());
    }

    #[test]
    fn test_transitions_are_forward_and_complete() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut controller = PhaseController::new(schedule(20), RunSignal::new());
        let sink = seen.clone();
        controller.on_transition(move |t| sink.lock().push((t.from, t.to)));

        let (handle, driver) = controller.start().unwrap();
        assert!(handle.wait_for(Phase::Measure));
        assert!(matches!(driver.join().unwrap(), PhaseOutcome::Completed));
        assert_eq!(handle.current_phase(), Phase::Done);
        assert!(handle.should_stop());

        let seen = seen.lock().clone();
        assert_eq!(
            seen,
            vec![
                (None, Phase::Preload),
                (Some(Phase::Preload), Phase::WarmUp),
                (Some(Phase::WarmUp), Phase::Measure),
                (Some(Phase::Measure), Phase::CoolDown),
                (Some(Phase::CoolDown), Phase::Done),
            ]
        );

        let measure = handle.window(Phase::Measure).unwrap();
        assert!(measure.end.is_some());
        assert!(measure.duration() >= Duration::from_millis(20));
    }

    #[test]
    fn test_subscribers_see_transition_before_workers() {
        let controller = PhaseController::new(schedule(10), RunSignal::new());
        let (handle, driver) = controller.start().unwrap();

        let observer = handle.clone();
        let violations = Arc::new(Mutex::new(0));
        let counter = violations.clone();
        handle.on_transition(move |t| {
            // The new phase is not visible yet while callbacks run
            if observer.current_phase() == t.to {
                *counter.lock() += 1;
            }
        });

        driver.join().unwrap();
        assert_eq!(*violations.lock(), 0);
    }

    #[test]
    fn test_cancel_aborts_in_current_phase() {
        let controller = PhaseController::new(schedule(5_000), RunSignal::new());
        let (handle, driver) = controller.start().unwrap();
        thread::sleep(Duration::from_millis(20));
        handle.cancel();

        match driver.join().unwrap() {
            PhaseOutcome::Aborted { phase } => assert_eq!(phase, Phase::Preload),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(handle.is_finished());
        assert!(!handle.wait_for(Phase::Measure));
        assert_eq!(handle.current_phase(), Phase::Preload);
    }

    #[test]
    fn test_gate_failure_stops_before_next_phase() {
        let mut controller = PhaseController::new(schedule(10), RunSignal::new());
        controller.gate(Phase::Preload, |_| {
            Err(RunError::PreloadFailure {
                failed: 1,
                total: 1,
                error_rate: 1.0,
                threshold: 0.0,
            })
        });
        let (handle, driver) = controller.start().unwrap();

        assert!(matches!(
            driver.join().unwrap(),
            PhaseOutcome::GateFailed(RunError::PreloadFailure { .. })
        ));
        assert_eq!(handle.current_phase(), Phase::Preload);
        assert!(handle.window(Phase::WarmUp).is_none());
    }

    #[test]
    fn test_gate_time_does_not_shorten_next_phase() {
        let mut controller = PhaseController::new(schedule(20), RunSignal::new());
        controller.gate(Phase::Preload, |_| {
            thread::sleep(Duration::from_millis(30));
            Ok(())
        });
        let (handle, driver) = controller.start().unwrap();
        driver.join().unwrap();
        assert!(handle.window(Phase::WarmUp).unwrap().duration() >= Duration::from_millis(20));
        assert!(handle.window(Phase::Preload).unwrap().duration() >= Duration::from_millis(50));
    }
}
