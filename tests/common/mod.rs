//! Shared fakes for integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use rust_fplc::acquisition::{AcquisitionWorker, CalibratedSample};
use rust_fplc::config::EngineConfig;
use rust_fplc::data::{RunMetadata, RunRecorder};
use rust_fplc::experiment::ExecutionEngine;
use rust_fplc::instrument::{InstrumentSettings, MonitorSettings, MonitorType};
use rust_fplc::method::{EndAction, MethodStep};
use rust_fplc::network::{Command, CommandSink, PumpId, TelemetryEvent, ValvePosition};
use rust_fplc::{AppResult, FplcError};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Command sink that records everything it is asked to send.
#[derive(Default)]
pub struct RecordingSink {
    connected: AtomicBool,
    sent: Mutex<Vec<Command>>,
}

impl RecordingSink {
    pub fn connected() -> Arc<Self> {
        let sink = Self::default();
        sink.connected.store(true, Ordering::SeqCst);
        Arc::new(sink)
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Command> {
        self.sent.lock().unwrap().clone()
    }

    pub fn count(&self, tag: &str) -> usize {
        self.sent().iter().filter(|c| c.tag() == tag).count()
    }

    pub fn run_commands(&self) -> usize {
        self.count("RUN_ISOCRATIC") + self.count("RUN_GRADIENT")
    }
}

#[async_trait]
impl CommandSink for RecordingSink {
    async fn send(&self, command: &Command) -> AppResult<()> {
        if !self.is_connected() {
            return Err(FplcError::NotConnected);
        }
        self.sent.lock().unwrap().push(command.clone());
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// What a [`CountingRecorder`] saw.
#[derive(Debug, Default)]
pub struct RecorderLog {
    pub started: usize,
    pub samples: usize,
    pub finalized: usize,
    pub discarded: usize,
}

/// In-memory recorder counting lifecycle calls.
pub struct CountingRecorder {
    log: Arc<Mutex<RecorderLog>>,
    open: bool,
}

impl CountingRecorder {
    pub fn new() -> (Self, Arc<Mutex<RecorderLog>>) {
        let log = Arc::new(Mutex::new(RecorderLog::default()));
        (
            Self {
                log: log.clone(),
                open: false,
            },
            log,
        )
    }
}

#[async_trait]
impl RunRecorder for CountingRecorder {
    async fn start_run(&mut self, _metadata: &RunMetadata) -> AppResult<()> {
        self.open = true;
        self.log.lock().unwrap().started += 1;
        Ok(())
    }

    async fn append(&mut self, _sample: &CalibratedSample) -> AppResult<()> {
        self.log.lock().unwrap().samples += 1;
        Ok(())
    }

    async fn finalize(&mut self) -> AppResult<Option<PathBuf>> {
        if !std::mem::take(&mut self.open) {
            return Ok(None);
        }
        self.log.lock().unwrap().finalized += 1;
        Ok(Some(PathBuf::from("2024_January_01_000000.csv")))
    }

    async fn discard(&mut self) -> AppResult<()> {
        self.open = false;
        self.log.lock().unwrap().discarded += 1;
        Ok(())
    }

    fn is_recording(&self) -> bool {
        self.open
    }
}

pub struct Harness {
    pub engine: ExecutionEngine,
    pub sink: Arc<RecordingSink>,
    pub recorder: Arc<Mutex<RecorderLog>>,
}

pub fn harness() -> Harness {
    let sink = RecordingSink::connected();
    let (recorder, log) = CountingRecorder::new();
    let (worker, _feed) = AcquisitionWorker::new(Duration::from_millis(10), 64);
    let engine = ExecutionEngine::new(
        sink.clone(),
        Box::new(recorder),
        worker,
        InstrumentSettings::default(),
        &EngineConfig::default(),
    );
    Harness {
        engine,
        sink,
        recorder: log,
    }
}

pub fn uv() -> MonitorSettings {
    MonitorSettings::new(MonitorType::PharmaciaUvMii, 0.1).unwrap()
}

pub fn step(volume: f64, end_action: EndAction) -> MethodStep {
    MethodStep::isocratic(ValvePosition::Load, 1.0, volume)
        .unwrap()
        .with_end_action(end_action)
}

pub fn progress(delivered_volume: f64) -> TelemetryEvent {
    TelemetryEvent::VolumeProgress {
        pump: PumpId::A,
        delivered_volume,
    }
}

pub fn sample(elapsed_time: f64) -> CalibratedSample {
    CalibratedSample {
        elapsed_time,
        eluate_volume: 0.0,
        chan1_volts: 0.01,
        chan1_absorbance_units: 0.01,
        chan2_volts: 0.0,
        fraction_mark: false,
        pump_b_percent: 0.0,
    }
}
