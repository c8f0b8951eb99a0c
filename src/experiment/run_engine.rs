//! Method execution engine.
//!
//! The engine turns a [`MethodSequence`] into run commands and advances through it on
//! telemetry. It never polls: every transition is triggered by an operator call, a
//! decoded [`TelemetryEvent`], or a calibrated sample.
//!
//! # Architecture
//!
//! ```text
//! run_method ─> run_next_step ─> CommandSink ─> instrument
//!                    ▲                              │
//!                    │ handle_next_step             │ VOLUME:A:<ml>
//!                    └──────── handle_telemetry <───┘
//! ```
//!
//! Hardware volume progress on pump A completes a step. The eluate volume estimated
//! from the calibrated sample stream only completes a step once it overshoots the
//! target by the configured margin, and each step completes at most once.

use super::state::{RunPhase, RunState, Subsystem};
use crate::acquisition::{AcquisitionWorker, CalibratedSample};
use crate::config::EngineConfig;
use crate::data::{LiveBuffer, RunMetadata, RunRecorder};
use crate::error::{AppResult, FplcError};
use crate::instrument::{InstrumentSettings, MonitorSettings};
use crate::method::{EndAction, MethodSequence, MethodStep};
use crate::network::connection::{CommandSink, ConnectionState};
use crate::network::protocol::{
    Command, PumpId, StopParameters, TelemetryEvent, ValvePosition,
};
use chrono::Local;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Why a run ended early.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StopReason {
    /// Operator pressed stop.
    Operator,
    /// A step's end action was `Stop`.
    EndAction,
    /// The system valve faulted.
    ValveFault,
}

/// User-visible events raised by the engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum EngineNotice {
    /// Instrument link went up or down.
    ConnectionChanged(ConnectionState),
    /// `run_method` was refused.
    RunRejected {
        /// Reason shown to the operator.
        reason: String,
    },
    /// A command could not be written.
    CommandFailed {
        /// Command tag.
        tag: String,
        /// Failure description.
        reason: String,
    },
    /// A method started.
    RunStarted {
        /// Run identifier.
        run_id: Uuid,
        /// Steps in the method.
        steps: usize,
    },
    /// A step's run command went out.
    StepStarted {
        /// Zero-based step index.
        index: usize,
        /// Steps in the method.
        total: usize,
    },
    /// Progress through the current step.
    StepProgress {
        /// Zero-based step index.
        index: usize,
        /// Clamped 0-100 %.
        percent: f64,
    },
    /// Run paused after a step or by the operator.
    RunPaused {
        /// Step the run paused on.
        index: usize,
    },
    /// Run resumed.
    RunResumed,
    /// Run stopped before reaching the end of the method.
    RunStopped(StopReason),
    /// Every step completed.
    RunCompleted,
    /// Run log written.
    RunSaved(PathBuf),
    /// Run log could not be written.
    StorageFailed(String),
    /// Device fault needing acknowledgment.
    DeviceFault(Subsystem),
    /// Device fault cleared by the instrument.
    FaultCleared(Subsystem),
    /// System valve fault; the run was forced to stop.
    ValveFault,
    /// System valve reached a position.
    ValvePosition(ValvePosition),
    /// Pump wash finished.
    WashCompleted(PumpId),
}

/// Per-step completion bookkeeping.
#[derive(Debug, Default, Clone)]
struct StepTracker {
    completed: bool,
    last_elapsed: Option<f64>,
    estimated_volume: f64,
}

/// Orchestrates method execution. Exclusively owned by the controller task.
pub struct ExecutionEngine {
    sink: Arc<dyn CommandSink>,
    recorder: Box<dyn RunRecorder>,
    acquisition: AcquisitionWorker,
    notices: broadcast::Sender<EngineNotice>,
    instrument: InstrumentSettings,
    live: LiveBuffer,
    overrun_margin: f64,

    state: RunState,
    sequence: MethodSequence,
    current_step: Option<MethodStep>,
    tracker: StepTracker,
    stop_issued: bool,
    completion_pending: bool,
    paused_after_step: bool,
    logged_samples: usize,
}

impl ExecutionEngine {
    /// Create an idle engine.
    pub fn new(
        sink: Arc<dyn CommandSink>,
        recorder: Box<dyn RunRecorder>,
        acquisition: AcquisitionWorker,
        instrument: InstrumentSettings,
        config: &EngineConfig,
    ) -> Self {
        let (notices, _) = broadcast::channel(config.notice_channel_capacity.max(1));
        let live = LiveBuffer::new(&instrument.monitor_settings().unwrap_or_default());
        let state = RunState {
            connection_state: if sink.is_connected() {
                ConnectionState::Connected
            } else {
                ConnectionState::Disconnected
            },
            ..RunState::default()
        };

        Self {
            sink,
            recorder,
            acquisition,
            notices,
            instrument,
            live,
            overrun_margin: config.volume_overrun_margin,
            state,
            sequence: MethodSequence::new(),
            current_step: None,
            tracker: StepTracker::default(),
            stop_issued: false,
            completion_pending: false,
            paused_after_step: false,
            logged_samples: 0,
        }
    }

    /// Subscribe to user-visible notices.
    pub fn subscribe_notices(&self) -> broadcast::Receiver<EngineNotice> {
        self.notices.subscribe()
    }

    /// Current run state.
    pub fn state(&self) -> &RunState {
        &self.state
    }

    /// Live display trace.
    pub fn live_buffer(&self) -> &LiveBuffer {
        &self.live
    }

    /// Instrument metadata used for new runs.
    pub fn instrument(&self) -> &InstrumentSettings {
        &self.instrument
    }

    /// Whether the acquisition gate is running.
    pub fn acquisition_active(&self) -> bool {
        self.acquisition.is_running()
    }

    /// Replace the instrument metadata. Rejected while a run is active.
    pub fn set_instrument(&mut self, instrument: InstrumentSettings) -> AppResult<()> {
        self.ensure_idle("change instrument settings")?;
        let settings = instrument.monitor_settings()?;
        self.live.reset(&settings);
        self.instrument = instrument;
        Ok(())
    }

    /// Overall method progress, 0-100 %.
    pub fn method_progress(&self) -> f64 {
        if self.sequence.is_empty() || !self.state.phase.is_active() {
            return 0.0;
        }
        let done = self.state.current_step_index as f64 + self.state.step_progress / 100.0;
        (done / self.sequence.len() as f64 * 100.0).clamp(0.0, 100.0)
    }

    fn notify(&self, notice: EngineNotice) {
        if self.notices.send(notice).is_err() {
            trace!("No notice subscribers");
        }
    }

    fn ensure_idle(&self, operation: &str) -> AppResult<()> {
        if self.state.phase.is_active() {
            return Err(FplcError::InvalidState {
                phase: self.state.phase.to_string(),
                operation: operation.to_string(),
            });
        }
        Ok(())
    }

    async fn send(&self, command: &Command) -> AppResult<()> {
        if let Err(e) = self.sink.send(command).await {
            self.notify(EngineNotice::CommandFailed {
                tag: command.tag().to_string(),
                reason: e.to_string(),
            });
            return Err(e);
        }
        Ok(())
    }

    /// Mirror the connection manager's state.
    pub fn set_connection_state(&mut self, connection: ConnectionState) {
        if self.state.connection_state != connection {
            info!(%connection, "Instrument link changed");
            self.state.connection_state = connection;
            self.notify(EngineNotice::ConnectionChanged(connection));
        }
    }

    /// Start executing a method from its first step.
    pub async fn run_method(&mut self, sequence: MethodSequence) -> AppResult<()> {
        if !self.sink.is_connected() {
            self.notify(EngineNotice::RunRejected {
                reason: "instrument not connected".to_string(),
            });
            return Err(FplcError::NotConnected);
        }
        if !self.state.phase.can_begin() {
            self.notify(EngineNotice::RunRejected {
                reason: format!("a run is already {}", self.state.phase),
            });
            return Err(FplcError::InvalidState {
                phase: self.state.phase.to_string(),
                operation: "run method".to_string(),
            });
        }
        if self.state.faults.any() {
            let err = self.uncleared_faults_error();
            self.notify(EngineNotice::RunRejected {
                reason: err.to_string(),
            });
            return Err(err);
        }

        let run_id = Uuid::new_v4();
        info!(%run_id, steps = sequence.len(), "Starting method");

        self.sequence = sequence;
        self.state.current_step_index = 0;
        self.state.phase = RunPhase::Running;
        self.state.overlaid_phase = None;
        self.state.run_id = Some(run_id);
        self.state.step_progress = 0.0;
        self.stop_issued = false;
        self.completion_pending = false;
        self.paused_after_step = false;
        self.current_step = None;
        self.live.clear();

        self.notify(EngineNotice::RunStarted {
            run_id,
            steps: self.sequence.len(),
        });
        self.run_next_step().await
    }

    /// Issue the run command for the current step, or complete the run past the end.
    pub async fn run_next_step(&mut self) -> AppResult<()> {
        let index = self.state.current_step_index;
        let Some(step) = self.sequence.get(index).cloned() else {
            info!("Method complete");
            self.teardown_run().await;
            self.notify(EngineNotice::RunCompleted);
            return Ok(());
        };

        self.tracker = StepTracker::default();
        self.state.step_progress = 0.0;
        self.current_step = Some(step.clone());

        let command = step.run_command()?;
        info!(step = index + 1, total = self.sequence.len(), %step, "Starting step");
        self.send(&command).await?;

        if let Some(settings) = step.acquisition_settings() {
            self.arm_acquisition(&step, settings).await;
        }

        self.notify(EngineNotice::StepStarted {
            index,
            total: self.sequence.len(),
        });
        Ok(())
    }

    async fn arm_acquisition(&mut self, step: &MethodStep, settings: MonitorSettings) {
        if self.acquisition.is_running() {
            debug!("Acquisition already running, keeping it across steps");
            return;
        }

        if !self.recorder.is_recording() {
            let metadata = RunMetadata {
                run_id: self.state.run_id.unwrap_or_else(Uuid::new_v4),
                started_at: Local::now(),
                column_type: self.instrument.column_type.clone(),
                aufs: settings.full_scale_setting,
                monitor_type: settings.monitor_type,
                flow_rate: step.flow_rate,
                step_count: self.sequence.len(),
            };
            match self.recorder.start_run(&metadata).await {
                Ok(()) => self.logged_samples = 0,
                Err(e) => {
                    error!(error = %e, "Could not open run log");
                    self.notify(EngineNotice::StorageFailed(e.to_string()));
                }
            }
        }

        self.live.reset(&settings);
        if let Err(e) = self.acquisition.start(settings) {
            warn!(error = %e, "Acquisition did not start");
        }
    }

    /// Route one decoded telemetry event.
    pub async fn handle_telemetry(&mut self, event: TelemetryEvent) -> AppResult<()> {
        match event {
            TelemetryEvent::VolumeProgress {
                pump,
                delivered_volume,
            } => self.handle_volume_progress(pump, delivered_volume).await?,
            TelemetryEvent::Heartbeat => trace!("Heartbeat"),
            TelemetryEvent::PumpError(pump) => self.raise_fault(Subsystem::pump(pump)),
            TelemetryEvent::PumpErrorCleared(pump) => {
                self.clear_fault(Subsystem::pump(pump)).await?
            }
            TelemetryEvent::FractionCollectorError => {
                self.raise_fault(Subsystem::FractionCollector)
            }
            TelemetryEvent::FractionCollectorErrorCleared => {
                self.clear_fault(Subsystem::FractionCollector).await?
            }
            TelemetryEvent::ValveFault => {
                error!("System valve fault");
                self.notify(EngineNotice::ValveFault);
                if self.state.phase.is_active() {
                    self.stop_with(StopReason::ValveFault).await?;
                }
            }
            TelemetryEvent::ValvePositionReached(position) => {
                debug!(%position, "Valve position reached");
                self.notify(EngineNotice::ValvePosition(position));
            }
            TelemetryEvent::WashCompleted(pump) => {
                info!(%pump, "Pump wash completed");
                self.notify(EngineNotice::WashCompleted(pump));
            }
            TelemetryEvent::RawSample(_) => {}
            TelemetryEvent::Malformed(line) => debug!(%line, "Ignoring malformed unit"),
            TelemetryEvent::Disconnected => {
                self.set_connection_state(ConnectionState::Disconnected)
            }
        }
        Ok(())
    }

    async fn handle_volume_progress(&mut self, pump: PumpId, delivered: f64) -> AppResult<()> {
        if pump != PumpId::A {
            trace!(%pump, delivered, "Ignoring progress from secondary pump");
            return Ok(());
        }
        let Some(target) = self.current_step.as_ref().map(|s| s.target_volume) else {
            return Ok(());
        };
        if !self.state.phase.is_active() || self.state.phase == RunPhase::Stopping {
            return Ok(());
        }
        if self.tracker.completed {
            return Ok(());
        }

        let percent = (delivered / target * 100.0).clamp(0.0, 100.0);
        self.state.step_progress = percent;
        self.notify(EngineNotice::StepProgress {
            index: self.state.current_step_index,
            percent,
        });

        if delivered >= target {
            debug!(delivered, target, "Step volume delivered");
            self.complete_step().await?;
        }
        Ok(())
    }

    /// Feed one calibrated sample into the log, the live trace and the volume estimate.
    pub async fn handle_sample(&mut self, sample: CalibratedSample) -> AppResult<()> {
        if self.recorder.is_recording() {
            match self.recorder.append(&sample).await {
                Ok(()) => self.logged_samples += 1,
                Err(e) => {
                    warn!(error = %e, "Dropping sample, run log write failed");
                    self.notify(EngineNotice::StorageFailed(e.to_string()));
                }
            }
        }
        self.live.push(&sample);

        if self.state.phase != RunPhase::Running || self.tracker.completed {
            return Ok(());
        }
        let Some(step) = self.current_step.as_ref() else {
            return Ok(());
        };

        if let Some(previous) = self.tracker.last_elapsed {
            let delta = sample.elapsed_time - previous;
            if delta > 0.0 {
                self.tracker.estimated_volume += delta * step.flow_rate / 60.0;
            }
        }
        self.tracker.last_elapsed = Some(sample.elapsed_time);

        let limit = step.target_volume * (1.0 + self.overrun_margin);
        if self.tracker.estimated_volume > limit {
            warn!(
                estimated = self.tracker.estimated_volume,
                target = step.target_volume,
                "No volume progress from the instrument, completing step from local estimate"
            );
            self.complete_step().await?;
        }
        Ok(())
    }

    async fn complete_step(&mut self) -> AppResult<()> {
        if self.tracker.completed {
            return Ok(());
        }
        self.tracker.completed = true;
        self.state.step_progress = 100.0;

        if self.state.phase != RunPhase::Running {
            info!(phase = %self.state.phase, "Step finished, end action deferred");
            self.completion_pending = true;
            return Ok(());
        }
        self.handle_next_step().await
    }

    /// Apply the finished step's end action.
    pub async fn handle_next_step(&mut self) -> AppResult<()> {
        let end_action = self
            .current_step
            .as_ref()
            .map(|s| s.end_action)
            .unwrap_or(EndAction::Continue);

        match end_action {
            EndAction::Continue => {
                self.state.current_step_index += 1;
                self.run_next_step().await
            }
            EndAction::Pause => {
                info!(step = self.state.current_step_index + 1, "Pausing after step");
                self.paused_after_step = true;
                self.enter_pause().await
            }
            EndAction::Stop => self.stop_with(StopReason::EndAction).await,
        }
    }

    async fn enter_pause(&mut self) -> AppResult<()> {
        self.state.phase = RunPhase::Paused;
        self.tracker.last_elapsed = None;
        if self.acquisition.is_running() {
            self.acquisition.pause();
            self.send(&Command::PauseAcquisition).await?;
        }
        self.notify(EngineNotice::RunPaused {
            index: self.state.current_step_index,
        });
        Ok(())
    }

    /// Operator pause of the running step.
    pub async fn pause(&mut self) -> AppResult<()> {
        if !self.state.phase.can_pause() {
            return Err(FplcError::InvalidState {
                phase: self.state.phase.to_string(),
                operation: "pause".to_string(),
            });
        }
        info!("Run paused by operator");
        self.paused_after_step = false;
        self.enter_pause().await
    }

    /// Leave Paused: advance past a step that ended in `Pause`, otherwise carry on.
    pub async fn resume(&mut self) -> AppResult<()> {
        if !self.state.phase.can_resume() {
            return Err(FplcError::InvalidState {
                phase: self.state.phase.to_string(),
                operation: "resume".to_string(),
            });
        }

        self.state.phase = RunPhase::Running;
        self.tracker.last_elapsed = None;
        if self.acquisition.is_running() {
            self.acquisition.resume();
            if let Err(e) = self.send(&Command::ResumeAcquisition).await {
                warn!(error = %e, "Resume acquisition command failed");
            }
        }
        self.notify(EngineNotice::RunResumed);
        info!("Run resumed");

        if std::mem::take(&mut self.paused_after_step) {
            self.state.current_step_index += 1;
            return self.run_next_step().await;
        }
        if std::mem::take(&mut self.completion_pending) {
            return self.handle_next_step().await;
        }
        Ok(())
    }

    /// Stop the method. A second stop without an intervening run is a no-op.
    pub async fn stop_method(&mut self) -> AppResult<()> {
        self.stop_with(StopReason::Operator).await
    }

    async fn stop_with(&mut self, reason: StopReason) -> AppResult<()> {
        if self.stop_issued || !self.state.phase.is_active() {
            debug!(?reason, "Stop already issued or no run active");
            return Ok(());
        }
        self.stop_issued = true;
        self.state.phase = RunPhase::Stopping;
        info!(?reason, "Stopping method");

        let acquisition = self.acquisition.is_running();
        let fraction = self
            .current_step
            .as_ref()
            .is_some_and(MethodStep::collects_fractions);
        let stop = Command::MethodStop(StopParameters::new(acquisition, fraction));
        let sent = self.send(&stop).await;

        self.teardown_run().await;
        self.notify(EngineNotice::RunStopped(reason));
        sent
    }

    async fn teardown_run(&mut self) {
        self.acquisition.stop().await;

        let closed = if self.recorder.is_recording() && self.logged_samples == 0 {
            info!("Run logged no samples, discarding its log");
            self.recorder.discard().await.map(|()| None)
        } else {
            self.recorder.finalize().await
        };
        match closed {
            Ok(Some(path)) => self.notify(EngineNotice::RunSaved(path)),
            Ok(None) => {}
            Err(e) => {
                error!(error = %e, "Run log could not be saved");
                self.notify(EngineNotice::StorageFailed(e.to_string()));
            }
        }

        self.live.clear();
        self.current_step = None;
        self.completion_pending = false;
        self.paused_after_step = false;
        self.state.reset_run();
    }

    fn raise_fault(&mut self, subsystem: Subsystem) {
        if !self.state.faults.raise(subsystem) {
            return;
        }
        warn!(%subsystem, "Device fault");
        self.notify(EngineNotice::DeviceFault(subsystem));
        if matches!(self.state.phase, RunPhase::Running | RunPhase::Paused) {
            self.state.enter_error();
            self.tracker.last_elapsed = None;
        }
    }

    async fn clear_fault(&mut self, subsystem: Subsystem) -> AppResult<()> {
        if !self.state.faults.clear(subsystem) {
            return Ok(());
        }
        info!(%subsystem, "Device fault cleared");
        self.notify(EngineNotice::FaultCleared(subsystem));

        if self.state.phase == RunPhase::Error && !self.state.faults.any() {
            self.state.leave_error();
            // Pumps delivered nothing while faulted.
            self.tracker.last_elapsed = None;
            if self.state.phase == RunPhase::Running && std::mem::take(&mut self.completion_pending)
            {
                return self.handle_next_step().await;
            }
        }
        Ok(())
    }

    /// Confirm the operator has seen every fault. Fails while any is uncleared.
    ///
    /// Faults outlive the run they were raised in; only the instrument's clear
    /// telemetry removes them.
    pub fn acknowledge_faults(&self) -> AppResult<()> {
        if self.state.faults.any() {
            return Err(self.uncleared_faults_error());
        }
        Ok(())
    }

    fn uncleared_faults_error(&self) -> FplcError {
        let names: Vec<String> = self
            .state
            .faults
            .uncleared()
            .iter()
            .map(ToString::to_string)
            .collect();
        FplcError::DeviceFault(format!("clear {} before continuing", names.join(", ")))
    }

    /// Send a manual-mode command. Pump and acquisition control is refused mid-run.
    pub async fn send_manual(&mut self, command: Command) -> AppResult<()> {
        let allowed_mid_run = matches!(command, Command::ToggleAuxiliary);
        if !allowed_mid_run {
            self.ensure_idle(command.tag())?;
        }
        self.send(&command).await
    }

    /// Stop any active run and join the acquisition task.
    pub async fn shutdown(&mut self) {
        if self.state.phase.is_active() {
            if let Err(e) = self.stop_method().await {
                warn!(error = %e, "Stop during shutdown failed");
            }
        }
        self.acquisition.stop().await;
    }
}
