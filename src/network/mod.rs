//! Instrument link: wire codec, connection lifecycle and telemetry fan-out.

pub mod connection;
pub mod listener;
pub mod protocol;

pub use connection::{CommandSink, ConnectionHandle, ConnectionManager, ConnectionState};
pub use listener::{DisconnectReason, TelemetryBus, TelemetryListener};
pub use protocol::{Command, FrameDecoder, PumpId, RawSample, TelemetryEvent, ValvePosition};
