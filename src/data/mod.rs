//! Run persistence and live display data.

pub mod live_buffer;
pub mod run_log;

pub use live_buffer::LiveBuffer;
pub use run_log::{CsvRunLog, RunMetadata};

use crate::acquisition::CalibratedSample;
use crate::error::AppResult;
use async_trait::async_trait;
use std::path::PathBuf;

/// Sink for the samples of one run.
///
/// A run is opened with [`start_run`](RunRecorder::start_run), fed samples, and ends in
/// exactly one of [`finalize`](RunRecorder::finalize) or [`discard`](RunRecorder::discard).
#[async_trait]
pub trait RunRecorder: Send + Sync {
    /// Open a new run log and write its metadata.
    async fn start_run(&mut self, metadata: &RunMetadata) -> AppResult<()>;

    /// Append one sample to the open run.
    async fn append(&mut self, sample: &CalibratedSample) -> AppResult<()>;

    /// Close and persist the open run, returning where it was saved.
    ///
    /// Returns `None` when no run was open.
    async fn finalize(&mut self) -> AppResult<Option<PathBuf>>;

    /// Close and delete the open run.
    async fn discard(&mut self) -> AppResult<()>;

    /// Whether a run is open.
    fn is_recording(&self) -> bool;
}
