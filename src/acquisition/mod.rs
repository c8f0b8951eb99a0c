//! Live detector acquisition: calibration and the pausable capture gate.

pub mod calibration;
pub mod worker;

pub use calibration::{calibrate, CalibratedSample};
pub use worker::{AcquisitionTap, AcquisitionWorker, FeedEvent, GateState};
