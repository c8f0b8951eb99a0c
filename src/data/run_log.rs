//! CSV run log.
//!
//! Samples are appended to `data_temp.csv` inside the output directory as they arrive,
//! one flushed row each, so a crash loses at most the sample in flight. The first row
//! after the header carries the run metadata with the sample columns left blank; every
//! later row carries a sample with the metadata columns left blank.
//!
//! `finalize` renames the temp file to `<YYYY_Month_DD_HHMMSS>.csv`; `discard` deletes it.

use super::RunRecorder;
use crate::acquisition::CalibratedSample;
use crate::error::{AppResult, FplcError};
use crate::instrument::MonitorType;
use async_trait::async_trait;
use chrono::{DateTime, Local};
use serde::Serialize;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Name of the in-progress log inside the output directory.
pub const TEMP_FILE_NAME: &str = "data_temp.csv";

const SAMPLE_COLUMNS: [&str; 7] = [
    "elapsed_time",
    "eluate_volume",
    "chan1_volts",
    "chan1_absorbance_units",
    "chan2_volts",
    "fraction_mark",
    "pump_b_percent",
];

const METADATA_COLUMNS: [&str; 8] = [
    "run_id",
    "run_date_time",
    "column_type",
    "aufs",
    "monitor_type",
    "monitor_reference_fs",
    "flow_rate",
    "step_count",
];

/// Descriptive fields written once per run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunMetadata {
    /// Unique run identifier.
    pub run_id: Uuid,
    /// Wall-clock start of the run.
    pub started_at: DateTime<Local>,
    /// Installed column.
    pub column_type: String,
    /// Detector sensitivity.
    pub aufs: f64,
    /// Detector model.
    pub monitor_type: MonitorType,
    /// First step flow rate (ml/min).
    pub flow_rate: f64,
    /// Steps in the method.
    pub step_count: usize,
}

impl RunMetadata {
    fn record(&self) -> Vec<String> {
        let mut row = vec![String::new(); SAMPLE_COLUMNS.len()];
        row.extend([
            self.run_id.to_string(),
            self.started_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            self.column_type.clone(),
            self.aufs.to_string(),
            self.monitor_type.to_string(),
            self.monitor_type.reference_full_scale().to_string(),
            self.flow_rate.to_string(),
            self.step_count.to_string(),
        ]);
        row
    }
}

fn sample_record(sample: &CalibratedSample) -> Vec<String> {
    let mut row = vec![
        sample.elapsed_time.to_string(),
        sample.eluate_volume.to_string(),
        sample.chan1_volts.to_string(),
        sample.chan1_absorbance_units.to_string(),
        sample.chan2_volts.to_string(),
        u8::from(sample.fraction_mark).to_string(),
        sample.pump_b_percent.to_string(),
    ];
    row.resize(SAMPLE_COLUMNS.len() + METADATA_COLUMNS.len(), String::new());
    row
}

/// File name a run finalized at `at` is saved under.
pub fn finalized_file_name(at: DateTime<Local>) -> String {
    format!("{}.csv", at.format("%Y_%B_%d_%H%M%S"))
}

/// CSV-backed run recorder.
pub struct CsvRunLog {
    output_dir: PathBuf,
    writer: Option<csv::Writer<File>>,
    rows: usize,
}

impl CsvRunLog {
    /// Recorder writing into `output_dir` (created on first run).
    pub fn new<P: Into<PathBuf>>(output_dir: P) -> Self {
        Self {
            output_dir: output_dir.into(),
            writer: None,
            rows: 0,
        }
    }

    /// Directory holding temp and finalized logs.
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Path of the in-progress log.
    pub fn temp_path(&self) -> PathBuf {
        self.output_dir.join(TEMP_FILE_NAME)
    }

    /// Sample rows written in the current run.
    pub fn rows(&self) -> usize {
        self.rows
    }

    fn unique_destination(&self, now: DateTime<Local>) -> PathBuf {
        let name = finalized_file_name(now);
        let mut path = self.output_dir.join(&name);
        let stem = name.trim_end_matches(".csv").to_string();
        let mut suffix = 1;
        while path.exists() {
            path = self.output_dir.join(format!("{stem}_{suffix}.csv"));
            suffix += 1;
        }
        path
    }
}

#[async_trait]
impl RunRecorder for CsvRunLog {
    async fn start_run(&mut self, metadata: &RunMetadata) -> AppResult<()> {
        if self.writer.is_some() {
            warn!("Previous run log still open, discarding it");
            self.discard().await?;
        }

        fs::create_dir_all(&self.output_dir)?;
        let file = File::create(self.temp_path())
            .map_err(|e| FplcError::Storage(format!("Failed to create run log: {e}")))?;
        let mut writer = csv::Writer::from_writer(file);
        writer.write_record(SAMPLE_COLUMNS.iter().chain(METADATA_COLUMNS.iter()))?;
        writer.write_record(metadata.record())?;
        writer.flush()?;

        self.writer = Some(writer);
        self.rows = 0;
        info!(run_id = %metadata.run_id, path = %self.temp_path().display(), "Run log opened");
        Ok(())
    }

    async fn append(&mut self, sample: &CalibratedSample) -> AppResult<()> {
        let writer = self.writer.as_mut().ok_or_else(|| {
            FplcError::Storage("no run log open for sample".to_string())
        })?;
        writer.write_record(sample_record(sample))?;
        writer.flush()?;
        self.rows += 1;
        Ok(())
    }

    async fn finalize(&mut self) -> AppResult<Option<PathBuf>> {
        let Some(mut writer) = self.writer.take() else {
            debug!("No run log open, nothing to finalize");
            return Ok(None);
        };
        writer.flush()?;
        drop(writer);

        let destination = self.unique_destination(Local::now());
        fs::rename(self.temp_path(), &destination)?;
        info!(path = %destination.display(), rows = self.rows, "Run log saved");
        Ok(Some(destination))
    }

    async fn discard(&mut self) -> AppResult<()> {
        self.writer = None;
        self.rows = 0;
        let temp = self.temp_path();
        if temp.exists() {
            fs::remove_file(&temp)?;
            info!(path = %temp.display(), "Run log discarded");
        }
        Ok(())
    }

    fn is_recording(&self) -> bool {
        self.writer.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn metadata() -> RunMetadata {
        RunMetadata {
            run_id: Uuid::new_v4(),
            started_at: Local::now(),
            column_type: "Superdex-200".into(),
            aufs: 0.1,
            monitor_type: MonitorType::PharmaciaUvMii,
            flow_rate: 1.0,
            step_count: 2,
        }
    }

    fn sample(t: f64) -> CalibratedSample {
        CalibratedSample {
            elapsed_time: t,
            eluate_volume: t / 60.0,
            chan1_volts: 0.01,
            chan1_absorbance_units: 0.01,
            chan2_volts: 0.0,
            fraction_mark: t == 2.0,
            pump_b_percent: 0.0,
        }
    }

    #[tokio::test]
    async fn metadata_only_on_first_row() {
        let dir = tempdir().unwrap();
        let mut log = CsvRunLog::new(dir.path().join("logs"));
        log.start_run(&metadata()).await.unwrap();
        log.append(&sample(1.0)).await.unwrap();
        log.append(&sample(2.0)).await.unwrap();
        assert_eq!(log.rows(), 2);

        let saved = log.finalize().await.unwrap().unwrap();
        assert!(!log.temp_path().exists());
        assert!(!log.is_recording());

        let mut reader = csv::Reader::from_path(&saved).unwrap();
        let headers = reader.headers().unwrap().clone();
        assert_eq!(headers.len(), 15);
        assert_eq!(&headers[0], "elapsed_time");
        assert_eq!(&headers[14], "step_count");

        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 3);
        assert_eq!(&rows[0][0], "");
        assert_eq!(&rows[0][9], "Superdex-200");
        assert_eq!(&rows[0][11], "Pharmacia UV MII");
        assert_eq!(&rows[1][0], "1");
        assert_eq!(&rows[1][9], "");
        assert_eq!(&rows[2][5], "1");
    }

    #[tokio::test]
    async fn discard_removes_temp_file() {
        let dir = tempdir().unwrap();
        let mut log = CsvRunLog::new(dir.path());
        log.start_run(&metadata()).await.unwrap();
        assert!(log.temp_path().exists());
        log.discard().await.unwrap();
        assert!(!log.temp_path().exists());
        assert!(log.append(&sample(1.0)).await.is_err());
    }

    #[tokio::test]
    async fn finalize_without_run_is_noop() {
        let dir = tempdir().unwrap();
        let mut log = CsvRunLog::new(dir.path());
        assert!(log.finalize().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn same_second_runs_get_distinct_files() {
        let dir = tempdir().unwrap();
        let mut log = CsvRunLog::new(dir.path());
        log.start_run(&metadata()).await.unwrap();
        let first = log.finalize().await.unwrap().unwrap();
        log.start_run(&metadata()).await.unwrap();
        let second = log.finalize().await.unwrap().unwrap();
        assert_ne!(first, second);
        assert!(first.exists() && second.exists());
    }

    #[test]
    fn file_name_uses_month_name() {
        use chrono::TimeZone;
        let at = Local.with_ymd_and_hms(2024, 3, 7, 14, 5, 9).unwrap();
        assert_eq!(finalized_file_name(at), "2024_March_07_140509.csv");
    }
}
