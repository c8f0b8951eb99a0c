//! # Rust FPLC Core Library
//!
//! Control core for a fast protein liquid chromatography instrument. The crate runs a
//! TCP server the instrument connects to, executes methods (ordered pump, valve and
//! detector steps) against it, and turns the detector's raw counts into a calibrated,
//! logged absorbance trace.
//!
//! ## Crate Structure
//!
//! - **`network`**: line-oriented wire codec, the connection manager owning the single
//!   peer, and the telemetry listener with its heartbeat watchdog.
//! - **`acquisition`**: detector calibration and the gate that starts, pauses and stops
//!   sampling.
//! - **`method`**: method steps, the editable sequence, and the JSON method document.
//! - **`experiment`**: run phase bookkeeping and the execution engine.
//! - **`data`**: the CSV run log and the live display buffer.
//! - **`controller`**: the actor that owns the engine, plus its handle and runtime.
//! - **`messages`**: commands accepted by the controller actor.
//! - **`instrument`**: detector models and instrument metadata.
//! - **`config`**: layered configuration (defaults, TOML, environment).
//! - **`logging`**: tracing subscriber setup.
//! - **`error`**: the shared `FplcError` type.

pub mod acquisition;
pub mod config;
pub mod controller;
pub mod data;
pub mod error;
pub mod experiment;
pub mod instrument;
pub mod logging;
pub mod messages;
pub mod method;
pub mod network;

pub use controller::{ControllerHandle, ControllerRuntime, InstrumentController};
pub use error::{AppResult, FplcError};
