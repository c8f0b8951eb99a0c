//! Message types for the controller actor.
//!
//! Operator requests travel to the [`InstrumentController`](crate::controller::InstrumentController)
//! over an mpsc channel; each carries a oneshot sender for its reply.
//!
//! ```text
//! Caller                              Controller task
//! ------                              ---------------
//! 1. Create command with oneshot
//! 2. Send via mpsc channel    ------>
//!                                     3. Receive command
//!                                     4. Drive the execution engine
//!                                     5. Send response
//! 6. Await oneshot receiver   <------
//! ```
//!
//! Every variant has a helper that builds the command and returns the receiver:
//!
//! ```rust
//! use rust_fplc::messages::ControllerCommand;
//!
//! let (cmd, rx) = ControllerCommand::stop_method();
//! // cmd_tx.send(cmd).await?;
//! // rx.await??;
//! ```

use crate::error::AppResult;
use crate::experiment::{EngineNotice, RunState};
use crate::instrument::InstrumentSettings;
use crate::method::{EndAction, MethodSequence, MethodStep};
use crate::network::protocol::Command;
use serde::Serialize;
use std::path::PathBuf;
use tokio::sync::{broadcast, oneshot};

/// Point-in-time view of the controller.
#[derive(Debug, Clone, Serialize)]
pub struct ControllerStatus {
    /// Execution state.
    pub run: RunState,
    /// Overall method progress, 0-100 %.
    pub method_progress: f64,
    /// Steps in the loaded method.
    pub step_count: usize,
    /// Whether detector acquisition is running.
    pub acquisition_active: bool,
    /// Instrument metadata for new runs.
    pub instrument: InstrumentSettings,
}

/// Requests handled by the controller task.
#[derive(Debug)]
pub enum ControllerCommand {
    /// Run the loaded method from its first step.
    RunMethod {
        /// Start result
        response: oneshot::Sender<AppResult<()>>,
    },
    /// Pause the running step.
    Pause {
        /// Pause result
        response: oneshot::Sender<AppResult<()>>,
    },
    /// Resume a paused run.
    Resume {
        /// Resume result
        response: oneshot::Sender<AppResult<()>>,
    },
    /// Stop the method.
    Stop {
        /// Stop result
        response: oneshot::Sender<AppResult<()>>,
    },
    /// Confirm device faults were seen and cleared.
    AcknowledgeFaults {
        /// Fails while any fault is uncleared
        response: oneshot::Sender<AppResult<()>>,
    },
    /// Send a manual-mode command.
    Manual {
        /// Command to send
        command: Command,
        /// Send result
        response: oneshot::Sender<AppResult<()>>,
    },
    /// Insert a step after `index` (or first, in an empty method).
    InsertStep {
        /// Existing step the new one follows
        after: usize,
        /// New step
        step: MethodStep,
        /// Edit result
        response: oneshot::Sender<AppResult<()>>,
    },
    /// Append a step.
    AppendStep {
        /// New step
        step: MethodStep,
        /// Edit result
        response: oneshot::Sender<AppResult<()>>,
    },
    /// Replace the step at `index`.
    ReplaceStep {
        /// Step position
        index: usize,
        /// Replacement
        step: MethodStep,
        /// Replaced step
        response: oneshot::Sender<AppResult<MethodStep>>,
    },
    /// Delete the step at `index`.
    DeleteStep {
        /// Step position
        index: usize,
        /// Removed step
        response: oneshot::Sender<AppResult<MethodStep>>,
    },
    /// Change a step's end action.
    SetEndAction {
        /// Step position
        index: usize,
        /// New end action
        end_action: EndAction,
        /// Edit result
        response: oneshot::Sender<AppResult<()>>,
    },
    /// Remove every step.
    ClearMethod {
        /// Edit result
        response: oneshot::Sender<AppResult<()>>,
    },
    /// Load a method document, replacing the method and instrument metadata.
    LoadMethod {
        /// Document path
        path: PathBuf,
        /// Number of steps loaded
        response: oneshot::Sender<AppResult<usize>>,
    },
    /// Save the method with the current instrument metadata.
    SaveMethod {
        /// Document path
        path: PathBuf,
        /// Save result
        response: oneshot::Sender<AppResult<()>>,
    },
    /// Replace the instrument metadata.
    SetInstrument {
        /// New settings
        settings: InstrumentSettings,
        /// Update result
        response: oneshot::Sender<AppResult<()>>,
    },
    /// Snapshot the loaded method.
    GetMethod {
        /// Copy of the method
        response: oneshot::Sender<MethodSequence>,
    },
    /// Snapshot controller status.
    GetStatus {
        /// Status snapshot
        response: oneshot::Sender<ControllerStatus>,
    },
    /// Subscribe to engine notices.
    SubscribeNotices {
        /// Notice receiver
        response: oneshot::Sender<broadcast::Receiver<EngineNotice>>,
    },
    /// Stop any run and end the controller task.
    Shutdown {
        /// Acknowledged after teardown
        response: oneshot::Sender<()>,
    },
}

impl ControllerCommand {
    /// Helper to create a RunMethod command
    pub fn run_method() -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::RunMethod { response: tx }, rx)
    }

    /// Helper to create a Pause command
    pub fn pause() -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Pause { response: tx }, rx)
    }

    /// Helper to create a Resume command
    pub fn resume() -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Resume { response: tx }, rx)
    }

    /// Helper to create a Stop command
    pub fn stop_method() -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Stop { response: tx }, rx)
    }

    /// Helper to create an AcknowledgeFaults command
    pub fn acknowledge_faults() -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::AcknowledgeFaults { response: tx }, rx)
    }

    /// Helper to create a Manual command
    pub fn manual(command: Command) -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::Manual {
                command,
                response: tx,
            },
            rx,
        )
    }

    /// Helper to create an InsertStep command
    pub fn insert_step(after: usize, step: MethodStep) -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::InsertStep {
                after,
                step,
                response: tx,
            },
            rx,
        )
    }

    /// Helper to create an AppendStep command
    pub fn append_step(step: MethodStep) -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::AppendStep { step, response: tx }, rx)
    }

    /// Helper to create a ReplaceStep command
    pub fn replace_step(
        index: usize,
        step: MethodStep,
    ) -> (Self, oneshot::Receiver<AppResult<MethodStep>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::ReplaceStep {
                index,
                step,
                response: tx,
            },
            rx,
        )
    }

    /// Helper to create a DeleteStep command
    pub fn delete_step(index: usize) -> (Self, oneshot::Receiver<AppResult<MethodStep>>) {
        let (tx, rx) = oneshot::channel();
        (Self::DeleteStep { index, response: tx }, rx)
    }

    /// Helper to create a SetEndAction command
    pub fn set_end_action(
        index: usize,
        end_action: EndAction,
    ) -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::SetEndAction {
                index,
                end_action,
                response: tx,
            },
            rx,
        )
    }

    /// Helper to create a ClearMethod command
    pub fn clear_method() -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::ClearMethod { response: tx }, rx)
    }

    /// Helper to create a LoadMethod command
    pub fn load_method(path: PathBuf) -> (Self, oneshot::Receiver<AppResult<usize>>) {
        let (tx, rx) = oneshot::channel();
        (Self::LoadMethod { path, response: tx }, rx)
    }

    /// Helper to create a SaveMethod command
    pub fn save_method(path: PathBuf) -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::SaveMethod { path, response: tx }, rx)
    }

    /// Helper to create a SetInstrument command
    pub fn set_instrument(settings: InstrumentSettings) -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::SetInstrument {
                settings,
                response: tx,
            },
            rx,
        )
    }

    /// Helper to create a GetMethod command
    pub fn get_method() -> (Self, oneshot::Receiver<MethodSequence>) {
        let (tx, rx) = oneshot::channel();
        (Self::GetMethod { response: tx }, rx)
    }

    /// Helper to create a GetStatus command
    pub fn get_status() -> (Self, oneshot::Receiver<ControllerStatus>) {
        let (tx, rx) = oneshot::channel();
        (Self::GetStatus { response: tx }, rx)
    }

    /// Helper to create a SubscribeNotices command
    pub fn subscribe_notices() -> (Self, oneshot::Receiver<broadcast::Receiver<EngineNotice>>) {
        let (tx, rx) = oneshot::channel();
        (Self::SubscribeNotices { response: tx }, rx)
    }

    /// Helper to create a Shutdown command
    pub fn shutdown() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::Shutdown { response: tx }, rx)
    }
}
