//! Configuration System using Figment
//!
//! Configuration is layered:
//! 1. Built-in defaults (every field has one, so the controller runs without a file)
//! 2. `config/fplc.toml` (or an explicit path)
//! 3. Environment variables prefixed with `RUST_FPLC_`, nested with `__`
//!
//! # Example
//! ```no_run
//! use rust_fplc::config::FplcConfig;
//!
//! let config = FplcConfig::load()?;
//! println!("Listening on port {}", config.network.port);
//! # Ok::<(), figment::Error>(())
//! ```

use crate::instrument::InstrumentSettings;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/fplc.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FplcConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Instrument link settings
    pub network: NetworkConfig,
    /// Acquisition gate settings
    pub acquisition: AcquisitionConfig,
    /// Run log settings
    pub storage: StorageConfig,
    /// Method execution settings
    pub engine: EngineConfig,
    /// Installed column and detector defaults
    pub instrument: InstrumentSettings,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "Rust FPLC".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Instrument link configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the controller listens on for the instrument
    pub bind_address: String,
    /// TCP port
    pub port: u16,
    /// Listener read timeout before re-polling, in milliseconds
    pub read_timeout_ms: u64,
    /// Heartbeat watchdog, in milliseconds
    pub heartbeat_timeout_ms: u64,
    /// Upper bound on a single command write, in milliseconds
    pub write_timeout_ms: u64,
    /// Telemetry broadcast capacity per subscriber
    pub telemetry_channel_capacity: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 5000,
            read_timeout_ms: 1000,
            heartbeat_timeout_ms: 10_000,
            write_timeout_ms: 2000,
            telemetry_channel_capacity: 256,
        }
    }
}

impl NetworkConfig {
    /// `host:port` string for binding.
    pub fn socket_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }

    /// Listener read timeout.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Heartbeat watchdog.
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    /// Command write timeout.
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

/// Acquisition gate configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Gate liveness poll interval in milliseconds
    pub poll_interval_ms: u64,
    /// Ordered controller feed capacity (telemetry and calibrated samples)
    pub feed_channel_capacity: usize,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            feed_channel_capacity: 1024,
        }
    }
}

impl AcquisitionConfig {
    /// Gate poll interval.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Run log configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding the temporary and finalized run logs
    pub output_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("Scanning_log_files"),
        }
    }
}

/// Method execution configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Fraction of a step's target volume the locally estimated eluate volume may
    /// overshoot before it completes the step on its own (hardware progress is primary)
    pub volume_overrun_margin: f64,
    /// Controller command mailbox capacity
    pub command_channel_capacity: usize,
    /// User notice broadcast capacity
    pub notice_channel_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            volume_overrun_margin: 0.05,
            command_channel_capacity: 32,
            notice_channel_capacity: 64,
        }
    }
}

impl FplcConfig {
    /// Load configuration from `config/fplc.toml` and environment variables
    ///
    /// Environment variables override the file, e.g. `RUST_FPLC_NETWORK__PORT=5001`.
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::from(Serialized::defaults(FplcConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("RUST_FPLC_").split("__"))
            .extract()
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.network.read_timeout_ms == 0 {
            return Err("network.read_timeout_ms must be greater than 0".to_string());
        }

        if self.network.heartbeat_timeout_ms < self.network.read_timeout_ms {
            return Err(format!(
                "network.heartbeat_timeout_ms ({}) must not be shorter than read_timeout_ms ({})",
                self.network.heartbeat_timeout_ms, self.network.read_timeout_ms
            ));
        }

        if self.network.telemetry_channel_capacity == 0
            || self.acquisition.feed_channel_capacity == 0
            || self.engine.command_channel_capacity == 0
            || self.engine.notice_channel_capacity == 0
        {
            return Err("channel capacities must be greater than 0".to_string());
        }

        if self.acquisition.poll_interval_ms == 0 {
            return Err("acquisition.poll_interval_ms must be greater than 0".to_string());
        }

        if !(0.0..=1.0).contains(&self.engine.volume_overrun_margin) {
            return Err(format!(
                "engine.volume_overrun_margin {} must be within 0.0..=1.0",
                self.engine.volume_overrun_margin
            ));
        }

        if !(self.instrument.aufs.is_finite() && self.instrument.aufs > 0.0) {
            return Err(format!(
                "instrument.aufs must be positive, got {}",
                self.instrument.aufs
            ));
        }

        Ok(())
    }
}
