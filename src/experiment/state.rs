//! Run phase, run state and device fault tracking.

use crate::network::connection::ConnectionState;
use crate::network::protocol::PumpId;
use serde::Serialize;
use uuid::Uuid;

/// Method execution phase.
///
/// # State Machine
///
/// ```text
/// Idle ──run_method──> Running ──stop──> Stopping ──> Idle
///                       │   ▲
///            end action │   │ resume
///               Pause   ▼   │
///                      Paused
///
/// Error overlays Running or Paused while a pump or fraction collector fault is
/// uncleared, and returns to the overlaid phase once every fault clears.
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunPhase {
    /// No method running.
    Idle,
    /// A step is executing.
    Running,
    /// Waiting for the operator to resume.
    Paused,
    /// Stop issued, tearing down.
    Stopping,
    /// Device fault awaiting clearance.
    Error,
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunPhase::Idle => write!(f, "Idle"),
            RunPhase::Running => write!(f, "Running"),
            RunPhase::Paused => write!(f, "Paused"),
            RunPhase::Stopping => write!(f, "Stopping"),
            RunPhase::Error => write!(f, "Error"),
        }
    }
}

impl RunPhase {
    /// Check if a new method may start.
    pub fn can_begin(&self) -> bool {
        matches!(self, RunPhase::Idle)
    }

    /// Check if the phase allows pausing.
    pub fn can_pause(&self) -> bool {
        matches!(self, RunPhase::Running)
    }

    /// Check if the phase allows resuming.
    pub fn can_resume(&self) -> bool {
        matches!(self, RunPhase::Paused)
    }

    /// Whether a run is in progress (the method may not be edited).
    pub fn is_active(&self) -> bool {
        !matches!(self, RunPhase::Idle)
    }
}

/// A unit whose faults are tracked independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Subsystem {
    /// Pump A.
    PumpA,
    /// Pump B.
    PumpB,
    /// Fraction collector.
    FractionCollector,
}

impl Subsystem {
    /// Subsystem for a pump.
    pub fn pump(pump: PumpId) -> Self {
        match pump {
            PumpId::A => Subsystem::PumpA,
            PumpId::B => Subsystem::PumpB,
        }
    }
}

impl std::fmt::Display for Subsystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Subsystem::PumpA => write!(f, "Pump A"),
            Subsystem::PumpB => write!(f, "Pump B"),
            Subsystem::FractionCollector => write!(f, "Fraction collector"),
        }
    }
}

/// Uncleared device faults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FaultTracker {
    pump_a: bool,
    pump_b: bool,
    fraction_collector: bool,
}

impl FaultTracker {
    fn slot(&mut self, subsystem: Subsystem) -> &mut bool {
        match subsystem {
            Subsystem::PumpA => &mut self.pump_a,
            Subsystem::PumpB => &mut self.pump_b,
            Subsystem::FractionCollector => &mut self.fraction_collector,
        }
    }

    /// Record a fault. Returns false if it was already raised.
    pub fn raise(&mut self, subsystem: Subsystem) -> bool {
        !std::mem::replace(self.slot(subsystem), true)
    }

    /// Record a clearance. Returns false if no fault was raised.
    pub fn clear(&mut self, subsystem: Subsystem) -> bool {
        std::mem::replace(self.slot(subsystem), false)
    }

    /// Whether any fault is uncleared.
    pub fn any(&self) -> bool {
        self.pump_a || self.pump_b || self.fraction_collector
    }

    /// Uncleared faults in a fixed order.
    pub fn uncleared(&self) -> Vec<Subsystem> {
        [
            (self.pump_a, Subsystem::PumpA),
            (self.pump_b, Subsystem::PumpB),
            (self.fraction_collector, Subsystem::FractionCollector),
        ]
        .into_iter()
        .filter_map(|(raised, subsystem)| raised.then_some(subsystem))
        .collect()
    }
}

/// Snapshot of execution state. Written only by the execution engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunState {
    /// Index of the executing (or last executed) step.
    pub current_step_index: usize,
    /// Execution phase.
    pub phase: RunPhase,
    /// Phase the Error overlay is covering.
    pub overlaid_phase: Option<RunPhase>,
    /// Instrument link state.
    pub connection_state: ConnectionState,
    /// Identifier of the active run.
    pub run_id: Option<Uuid>,
    /// Progress through the current step, 0-100 %.
    pub step_progress: f64,
    /// Uncleared device faults.
    pub faults: FaultTracker,
}

impl Default for RunState {
    fn default() -> Self {
        Self {
            current_step_index: 0,
            phase: RunPhase::Idle,
            overlaid_phase: None,
            connection_state: ConnectionState::Disconnected,
            run_id: None,
            step_progress: 0.0,
            faults: FaultTracker::default(),
        }
    }
}

impl RunState {
    /// Cover the current phase with Error.
    pub fn enter_error(&mut self) {
        if self.phase != RunPhase::Error {
            self.overlaid_phase = Some(self.phase);
            self.phase = RunPhase::Error;
        }
    }

    /// Lift the Error overlay.
    pub fn leave_error(&mut self) {
        if self.phase == RunPhase::Error {
            self.phase = self.overlaid_phase.take().unwrap_or(RunPhase::Running);
        }
    }

    /// Back to Idle, keeping connection state and uncleared faults.
    pub fn reset_run(&mut self) {
        self.phase = RunPhase::Idle;
        self.overlaid_phase = None;
        self.run_id = None;
        self.step_progress = 0.0;
    }
}
