//! The orchestrating actor.
//!
//! `InstrumentController` exclusively owns the [`ExecutionEngine`] and the method being
//! edited. A single task multiplexes operator commands, the instrument feed and
//! connection changes, so engine state has exactly one writer and needs no locks.
//! Telemetry and calibrated samples share one queue and are handled in wire order.
//!
//! ```text
//!  ControllerHandle ──mpsc<ControllerCommand>──┐
//!  AcquisitionTap ───mpsc<FeedEvent>───────────┼──> InstrumentController ──> ExecutionEngine
//!  ConnectionManager ─watch<ConnectionState>───┘
//! ```

use crate::acquisition::{AcquisitionWorker, FeedEvent};
use crate::config::FplcConfig;
use crate::data::CsvRunLog;
use crate::error::{AppResult, FplcError};
use crate::experiment::{EngineNotice, ExecutionEngine};
use crate::instrument::InstrumentSettings;
use crate::messages::{ControllerCommand, ControllerStatus};
use crate::method::{EndAction, MethodDocument, MethodSequence, MethodStep};
use crate::network::connection::{ConnectionManager, ConnectionState};
use crate::network::listener::TelemetryBus;
use crate::network::protocol::Command;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Actor owning the execution engine and the editable method.
pub struct InstrumentController {
    engine: ExecutionEngine,
    method: MethodSequence,
    feed: mpsc::Receiver<FeedEvent>,
    connection: watch::Receiver<ConnectionState>,
}

impl InstrumentController {
    /// Assemble the actor from its inputs.
    pub fn new(
        engine: ExecutionEngine,
        feed: mpsc::Receiver<FeedEvent>,
        connection: watch::Receiver<ConnectionState>,
    ) -> Self {
        Self {
            engine,
            method: MethodSequence::new(),
            feed,
            connection,
        }
    }

    /// Replace the editable method before the actor starts.
    pub fn with_method(mut self, method: MethodSequence) -> Self {
        self.method = method;
        self
    }

    /// Process inputs until shutdown or until every handle is dropped.
    pub async fn run(mut self, mut command_rx: mpsc::Receiver<ControllerCommand>) {
        info!("Instrument controller started");
        let mut feed_open = true;
        let mut connection_open = true;

        let initial = *self.connection.borrow_and_update();
        self.engine.set_connection_state(initial);

        loop {
            tokio::select! {
                command = command_rx.recv() => match command {
                    Some(ControllerCommand::Shutdown { response }) => {
                        self.engine.shutdown().await;
                        let _ = response.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        debug!("All controller handles dropped");
                        self.engine.shutdown().await;
                        break;
                    }
                },

                event = self.feed.recv(), if feed_open => match event {
                    Some(FeedEvent::Telemetry(event)) => {
                        if let Err(e) = self.engine.handle_telemetry(event).await {
                            warn!(error = %e, "Telemetry handling failed");
                        }
                    }
                    Some(FeedEvent::Sample(sample)) => {
                        if let Err(e) = self.engine.handle_sample(sample).await {
                            warn!(error = %e, "Sample handling failed");
                        }
                    }
                    None => feed_open = false,
                },

                changed = self.connection.changed(), if connection_open => {
                    if changed.is_err() {
                        connection_open = false;
                    } else {
                        let state = *self.connection.borrow_and_update();
                        self.engine.set_connection_state(state);
                    }
                }
            }
        }

        info!("Instrument controller stopped");
    }

    fn ensure_editable(&self, operation: &str) -> AppResult<()> {
        let phase = self.engine.state().phase;
        if phase.is_active() {
            return Err(FplcError::InvalidState {
                phase: phase.to_string(),
                operation: operation.to_string(),
            });
        }
        Ok(())
    }

    fn status(&self) -> ControllerStatus {
        ControllerStatus {
            run: self.engine.state().clone(),
            method_progress: self.engine.method_progress(),
            step_count: self.method.len(),
            acquisition_active: self.engine.acquisition_active(),
            instrument: self.engine.instrument().clone(),
        }
    }

    async fn handle_command(&mut self, command: ControllerCommand) {
        match command {
            ControllerCommand::RunMethod { response } => {
                let result = self.engine.run_method(self.method.clone()).await;
                let _ = response.send(result);
            }
            ControllerCommand::Pause { response } => {
                let _ = response.send(self.engine.pause().await);
            }
            ControllerCommand::Resume { response } => {
                let _ = response.send(self.engine.resume().await);
            }
            ControllerCommand::Stop { response } => {
                let _ = response.send(self.engine.stop_method().await);
            }
            ControllerCommand::AcknowledgeFaults { response } => {
                let _ = response.send(self.engine.acknowledge_faults());
            }
            ControllerCommand::Manual { command, response } => {
                let _ = response.send(self.engine.send_manual(command).await);
            }
            ControllerCommand::InsertStep {
                after,
                step,
                response,
            } => {
                let result = self
                    .ensure_editable("insert step")
                    .and_then(|_| self.method.insert_after(after, step));
                let _ = response.send(result);
            }
            ControllerCommand::AppendStep { step, response } => {
                let result = self
                    .ensure_editable("append step")
                    .and_then(|_| self.method.push(step));
                let _ = response.send(result);
            }
            ControllerCommand::ReplaceStep {
                index,
                step,
                response,
            } => {
                let result = self
                    .ensure_editable("replace step")
                    .and_then(|_| self.method.replace(index, step));
                let _ = response.send(result);
            }
            ControllerCommand::DeleteStep { index, response } => {
                let result = self
                    .ensure_editable("delete step")
                    .and_then(|_| self.method.remove(index));
                let _ = response.send(result);
            }
            ControllerCommand::SetEndAction {
                index,
                end_action,
                response,
            } => {
                let result = self
                    .ensure_editable("set end action")
                    .and_then(|_| self.method.set_end_action(index, end_action));
                let _ = response.send(result);
            }
            ControllerCommand::ClearMethod { response } => {
                let result = self.ensure_editable("clear method").map(|_| self.method.clear());
                let _ = response.send(result);
            }
            ControllerCommand::LoadMethod { path, response } => {
                let _ = response.send(self.load_method(path));
            }
            ControllerCommand::SaveMethod { path, response } => {
                let document = MethodDocument::new(self.engine.instrument().clone(), &self.method);
                let _ = response.send(document.save(&path));
            }
            ControllerCommand::SetInstrument { settings, response } => {
                let _ = response.send(self.engine.set_instrument(settings));
            }
            ControllerCommand::GetMethod { response } => {
                let _ = response.send(self.method.clone());
            }
            ControllerCommand::GetStatus { response } => {
                let _ = response.send(self.status());
            }
            ControllerCommand::SubscribeNotices { response } => {
                let _ = response.send(self.engine.subscribe_notices());
            }
            ControllerCommand::Shutdown { response } => {
                let _ = response.send(());
            }
        }
    }

    fn load_method(&mut self, path: PathBuf) -> AppResult<usize> {
        self.ensure_editable("load method")?;
        let (instrument, method) = MethodDocument::load(&path)?.into_sequence()?;
        self.engine.set_instrument(instrument)?;
        self.method = method;
        info!(path = %path.display(), steps = self.method.len(), "Method loaded");
        Ok(self.method.len())
    }
}

/// Cloneable client for the controller task.
#[derive(Debug, Clone)]
pub struct ControllerHandle {
    tx: mpsc::Sender<ControllerCommand>,
}

impl ControllerHandle {
    /// Wrap a command sender.
    pub fn new(tx: mpsc::Sender<ControllerCommand>) -> Self {
        Self { tx }
    }

    async fn request<T>(&self, (command, rx): (ControllerCommand, oneshot::Receiver<T>)) -> AppResult<T> {
        self.tx
            .send(command)
            .await
            .map_err(|_| FplcError::ControllerClosed)?;
        rx.await.map_err(|_| FplcError::ControllerClosed)
    }

    /// Run the loaded method.
    pub async fn run_method(&self) -> AppResult<()> {
        self.request(ControllerCommand::run_method()).await?
    }

    /// Pause the running step.
    pub async fn pause(&self) -> AppResult<()> {
        self.request(ControllerCommand::pause()).await?
    }

    /// Resume a paused run.
    pub async fn resume(&self) -> AppResult<()> {
        self.request(ControllerCommand::resume()).await?
    }

    /// Stop the method.
    pub async fn stop_method(&self) -> AppResult<()> {
        self.request(ControllerCommand::stop_method()).await?
    }

    /// Confirm device faults are cleared.
    pub async fn acknowledge_faults(&self) -> AppResult<()> {
        self.request(ControllerCommand::acknowledge_faults()).await?
    }

    /// Send a manual-mode command.
    pub async fn manual(&self, command: Command) -> AppResult<()> {
        self.request(ControllerCommand::manual(command)).await?
    }

    /// Insert a step after `after`.
    pub async fn insert_step(&self, after: usize, step: MethodStep) -> AppResult<()> {
        self.request(ControllerCommand::insert_step(after, step)).await?
    }

    /// Append a step.
    pub async fn append_step(&self, step: MethodStep) -> AppResult<()> {
        self.request(ControllerCommand::append_step(step)).await?
    }

    /// Replace a step.
    pub async fn replace_step(&self, index: usize, step: MethodStep) -> AppResult<MethodStep> {
        self.request(ControllerCommand::replace_step(index, step)).await?
    }

    /// Delete a step.
    pub async fn delete_step(&self, index: usize) -> AppResult<MethodStep> {
        self.request(ControllerCommand::delete_step(index)).await?
    }

    /// Change a step's end action.
    pub async fn set_end_action(&self, index: usize, end_action: EndAction) -> AppResult<()> {
        self.request(ControllerCommand::set_end_action(index, end_action))
            .await?
    }

    /// Remove every step.
    pub async fn clear_method(&self) -> AppResult<()> {
        self.request(ControllerCommand::clear_method()).await?
    }

    /// Load a method document.
    pub async fn load_method(&self, path: impl Into<PathBuf>) -> AppResult<usize> {
        self.request(ControllerCommand::load_method(path.into()))
            .await?
    }

    /// Save the method.
    pub async fn save_method(&self, path: impl Into<PathBuf>) -> AppResult<()> {
        self.request(ControllerCommand::save_method(path.into()))
            .await?
    }

    /// Replace the instrument metadata.
    pub async fn set_instrument(&self, settings: InstrumentSettings) -> AppResult<()> {
        self.request(ControllerCommand::set_instrument(settings))
            .await?
    }

    /// Copy of the loaded method.
    pub async fn method(&self) -> AppResult<MethodSequence> {
        self.request(ControllerCommand::get_method()).await
    }

    /// Status snapshot.
    pub async fn status(&self) -> AppResult<ControllerStatus> {
        self.request(ControllerCommand::get_status()).await
    }

    /// Subscribe to engine notices.
    pub async fn subscribe_notices(&self) -> AppResult<broadcast::Receiver<EngineNotice>> {
        self.request(ControllerCommand::subscribe_notices()).await
    }

    /// Ask the controller to stop.
    pub async fn shutdown(&self) -> AppResult<()> {
        self.request(ControllerCommand::shutdown()).await
    }
}

/// A running controller with its connection manager.
pub struct ControllerRuntime {
    handle: ControllerHandle,
    connection: ConnectionManager,
    task: JoinHandle<()>,
}

impl ControllerRuntime {
    /// Wire every component from configuration and start the tasks.
    pub async fn start(config: &FplcConfig) -> AppResult<Self> {
        config.validate().map_err(FplcError::Configuration)?;

        let (worker, feed) = AcquisitionWorker::new(
            config.acquisition.poll_interval(),
            config.acquisition.feed_channel_capacity,
        );
        let bus = TelemetryBus::new(config.network.telemetry_channel_capacity)
            .with_acquisition_tap(worker.tap());

        let connection = ConnectionManager::start(&config.network, bus).await?;
        let engine = ExecutionEngine::new(
            Arc::new(connection.handle()),
            Box::new(CsvRunLog::new(config.storage.output_dir.clone())),
            worker,
            config.instrument.clone(),
            &config.engine,
        );

        let (tx, rx) = mpsc::channel(config.engine.command_channel_capacity);
        let controller =
            InstrumentController::new(engine, feed, connection.subscribe_state());
        let task = tokio::spawn(controller.run(rx));

        Ok(Self {
            handle: ControllerHandle::new(tx),
            connection,
            task,
        })
    }

    /// Client for the controller task.
    pub fn handle(&self) -> ControllerHandle {
        self.handle.clone()
    }

    /// Address the instrument should connect to.
    pub fn local_addr(&self) -> SocketAddr {
        self.connection.local_addr()
    }

    /// Watch the instrument link.
    pub fn subscribe_connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.subscribe_state()
    }

    /// Stop the controller, then the connection manager, joining both.
    pub async fn shutdown(self) {
        if let Err(e) = self.handle.shutdown().await {
            debug!(error = %e, "Controller already stopped");
        }
        if let Err(e) = self.task.await {
            warn!(error = %e, "Controller task ended abnormally");
        }
        self.connection.shutdown().await;
    }
}
