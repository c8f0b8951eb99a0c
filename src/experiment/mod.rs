//! Method execution: run phase bookkeeping and the execution engine.

pub mod run_engine;
pub mod state;

pub use run_engine::{EngineNotice, ExecutionEngine, StopReason};
pub use state::{FaultTracker, RunPhase, RunState, Subsystem};
