//! Pausable, cancellable acquisition gate.
//!
//! The worker owns a `watch` channel holding the gate state. A background task stays
//! alive while the gate is open or paused and exits as soon as the gate closes, so
//! `stop()` is observed immediately and can be joined.
//!
//! Raw samples never pass through the worker task itself. The telemetry listener hands
//! every decoded event to [`AcquisitionTap::dispatch`]; the tap reads the current gate
//! state, calibrates raw samples synchronously and forwards everything on one queue, so
//! the consumer sees samples and telemetry in wire order.
//!
//! ```text
//! Listener ──TelemetryEvent──> AcquisitionTap ──FeedEvent (wire order)──> controller
//!                                   ▲
//!                                   │ watch<GateState>
//!                             AcquisitionWorker (start / pause / resume / stop)
//! ```

use super::calibration::{calibrate, CalibratedSample};
use crate::error::{AppResult, FplcError};
use crate::instrument::MonitorSettings;
use crate::network::protocol::{RawSample, TelemetryEvent};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, trace, warn};

/// Current state of the acquisition gate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GateState {
    /// No acquisition; samples are discarded.
    Closed,
    /// Capturing with these settings.
    Open(MonitorSettings),
    /// Run paused; samples are discarded until resumed.
    Paused(MonitorSettings),
}

/// One entry of the ordered controller feed.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    /// Decoded telemetry other than raw samples.
    Telemetry(TelemetryEvent),
    /// Raw sample accepted by the open gate, already calibrated.
    Sample(CalibratedSample),
}

/// Cloneable handle used by telemetry dispatch to feed events in.
#[derive(Debug, Clone)]
pub struct AcquisitionTap {
    gate: watch::Receiver<GateState>,
    feed: mpsc::Sender<FeedEvent>,
}

impl AcquisitionTap {
    /// Forward one decoded event, calibrating raw samples on the way.
    pub fn dispatch(&self, event: &TelemetryEvent) {
        match event {
            TelemetryEvent::RawSample(raw) => {
                self.handle_raw_sample(raw);
            }
            other => {
                self.forward(FeedEvent::Telemetry(other.clone()));
            }
        }
    }

    /// Calibrate and forward a raw sample if the gate is open.
    ///
    /// Returns the calibrated sample when it was accepted. Never blocks: a full feed
    /// drops the sample with a warning.
    pub fn handle_raw_sample(&self, raw: &RawSample) -> Option<CalibratedSample> {
        let state = *self.gate.borrow();
        let GateState::Open(settings) = state else {
            trace!(?state, "Discarding raw sample, acquisition gate not open");
            return None;
        };

        let sample = calibrate(raw, &settings);
        self.forward(FeedEvent::Sample(sample)).then_some(sample)
    }

    fn forward(&self, event: FeedEvent) -> bool {
        match self.feed.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(?event, "Controller feed full, dropping event");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Feed consumer gone, dropping event");
                false
            }
        }
    }
}

/// Background acquisition gate with pause accounting.
#[derive(Debug)]
pub struct AcquisitionWorker {
    gate: watch::Sender<GateState>,
    feed: mpsc::Sender<FeedEvent>,
    poll_interval: Duration,
    handle: Option<JoinHandle<()>>,
    pause_started: Option<Instant>,
    total_paused: Duration,
}

impl AcquisitionWorker {
    /// Create a worker and the receiver for its ordered feed.
    pub fn new(
        poll_interval: Duration,
        feed_capacity: usize,
    ) -> (Self, mpsc::Receiver<FeedEvent>) {
        let (gate, _) = watch::channel(GateState::Closed);
        let (feed, feed_rx) = mpsc::channel(feed_capacity.max(1));
        (
            Self {
                gate,
                feed,
                poll_interval,
                handle: None,
                pause_started: None,
                total_paused: Duration::ZERO,
            },
            feed_rx,
        )
    }

    /// Handle for listener dispatch.
    pub fn tap(&self) -> AcquisitionTap {
        AcquisitionTap {
            gate: self.gate.subscribe(),
            feed: self.feed.clone(),
        }
    }

    /// Whether the gate task is alive.
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Whether the gate is currently paused.
    pub fn is_paused(&self) -> bool {
        matches!(*self.gate.borrow(), GateState::Paused(_))
    }

    /// Accumulated time spent paused during the current (or last) capture.
    pub fn total_paused(&self) -> Duration {
        self.total_paused
            + self
                .pause_started
                .map(|started| started.elapsed())
                .unwrap_or_default()
    }

    /// Open the gate and spawn the liveness task.
    pub fn start(&mut self, settings: MonitorSettings) -> AppResult<()> {
        if self.is_running() {
            return Err(FplcError::InvalidState {
                phase: "acquiring".into(),
                operation: "start acquisition".into(),
            });
        }

        self.pause_started = None;
        self.total_paused = Duration::ZERO;
        self.gate.send_replace(GateState::Open(settings));

        let gate = self.gate.subscribe();
        let poll_interval = self.poll_interval;
        self.handle = Some(tokio::spawn(run_gate(gate, poll_interval)));

        info!(
            monitor = %settings.monitor_type,
            aufs = settings.full_scale_setting,
            "Acquisition started"
        );
        Ok(())
    }

    /// Close the gate to incoming samples without ending the capture.
    pub fn pause(&mut self) {
        let state = *self.gate.borrow();
        if let GateState::Open(settings) = state {
            self.pause_started = Some(Instant::now());
            self.gate.send_replace(GateState::Paused(settings));
            info!("Acquisition paused");
        }
    }

    /// Reopen a paused gate.
    pub fn resume(&mut self) {
        let state = *self.gate.borrow();
        if let GateState::Paused(settings) = state {
            if let Some(started) = self.pause_started.take() {
                self.total_paused += started.elapsed();
            }
            self.gate.send_replace(GateState::Open(settings));
            info!(paused_for = ?self.total_paused, "Acquisition resumed");
        }
    }

    /// Close the gate and wait for the task to exit. No-op when idle.
    pub async fn stop(&mut self) {
        if let Some(started) = self.pause_started.take() {
            self.total_paused += started.elapsed();
        }
        self.gate.send_replace(GateState::Closed);

        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Acquisition task ended abnormally");
            }
            info!("Acquisition stopped");
        }
    }
}

async fn run_gate(mut gate: watch::Receiver<GateState>, poll_interval: Duration) {
    loop {
        let state = *gate.borrow_and_update();
        match state {
            GateState::Closed => break,
            GateState::Paused(_) => {
                if gate.changed().await.is_err() {
                    break;
                }
            }
            GateState::Open(_) => {
                tokio::select! {
                    changed = gate.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = sleep(poll_interval) => {}
                }
            }
        }
    }
    debug!("Acquisition gate task exited");
}
