//! Persisted method documents.
//!
//! A document is a JSON object with the instrument metadata the method was written for
//! and the ordered step list:
//!
//! ```json
//! {
//!   "metadata": { "column_type": "Superdex-200", "monitor_type": "Pharmacia UV MII", "aufs": 0.1 },
//!   "steps": [ { "valve_position": "LOAD", "flow_rate": 1.0, "target_volume": 5.0, ... } ]
//! }
//! ```
//!
//! Older documents (capitalized keys, flat gradient bounds, no per-step monitor
//! settings) load transparently; they are written back in the current layout.

use super::sequence::{at_step, MethodSequence};
use super::step::{Monitor, MethodStep};
use crate::error::{AppResult, FplcError};
use crate::instrument::InstrumentSettings;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

/// On-disk method document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodDocument {
    /// Instrument the method was written for.
    #[serde(default)]
    pub metadata: InstrumentSettings,
    /// Steps in execution order.
    #[serde(default)]
    pub steps: Vec<MethodStep>,
}

impl MethodDocument {
    /// Snapshot a method for saving.
    pub fn new(metadata: InstrumentSettings, sequence: &MethodSequence) -> Self {
        Self {
            metadata,
            steps: sequence.steps().to_vec(),
        }
    }

    /// Parse a document from JSON text.
    pub fn from_json(json: &str) -> AppResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serialize as pretty JSON.
    pub fn to_json(&self) -> AppResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Save to a JSON file, creating the parent directory if needed.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> AppResult<()> {
        let path = path.as_ref();
        let json = self.to_json()?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, json)?;

        info!(path = %path.display(), steps = self.steps.len(), "Method saved");
        Ok(())
    }

    /// Load from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|e| {
            FplcError::Storage(format!("failed to read method {}: {e}", path.display()))
        })?;
        let document = Self::from_json(&json)?;
        debug!(path = %path.display(), steps = document.steps.len(), "Method loaded");
        Ok(document)
    }

    /// Validate and split into instrument settings and an executable sequence.
    ///
    /// Monitor-on steps without their own settings inherit the document's monitor and
    /// AUFS.
    pub fn into_sequence(self) -> AppResult<(InstrumentSettings, MethodSequence)> {
        let defaults = self.metadata.monitor_settings()?;
        let mut steps = self.steps;
        for (index, step) in steps.iter_mut().enumerate() {
            if step.monitor == Monitor::UvOn && step.monitor_settings.is_none() {
                step.monitor_settings = Some(defaults);
            }
            step.validate().map_err(|e| at_step(index, e))?;
        }
        Ok((self.metadata, MethodSequence::from_steps(steps)?))
    }
}
