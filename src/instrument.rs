//! Absorbance monitor models and instrument-wide settings.
//!
//! Settings are passed explicitly into calibration and command building; nothing in
//! the crate reads them from shared mutable state.

use crate::error::{AppResult, FplcError};
use serde::{Deserialize, Serialize};

/// AUFS ladder offered by the Pharmacia UV-MII front panel.
pub const UV_MII_AUFS_STEPS: [f64; 11] = [
    2.0, 1.0, 0.5, 0.2, 0.1, 0.05, 0.02, 0.01, 0.005, 0.002, 0.001,
];

/// AUFS ladder offered by the BioRad EM-1. It bottoms out at 0.01.
pub const EM1_AUFS_STEPS: [f64; 8] = [2.0, 1.0, 0.5, 0.2, 0.1, 0.05, 0.02, 0.01];

/// Supported UV absorbance monitors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MonitorType {
    /// Pharmacia UV-MII, 100 mV recorder output at full scale.
    #[serde(rename = "Pharmacia UV MII", alias = "Pharmacia UV-MII")]
    PharmaciaUvMii,
    /// BioRad Econo EM-1, 1 V recorder output at full scale.
    #[serde(rename = "BioRad EM1", alias = "BioRad EM-1")]
    BioRadEm1,
}

impl MonitorType {
    /// Recorder output (volts) corresponding to one full-scale AUFS unit.
    pub fn reference_full_scale(self) -> f64 {
        match self {
            MonitorType::PharmaciaUvMii => 0.1,
            MonitorType::BioRadEm1 => 1.0,
        }
    }

    /// ADC input range (volts) used to digitize this monitor's output.
    pub fn adc_full_scale_volts(self) -> f64 {
        match self {
            MonitorType::PharmaciaUvMii => 0.256,
            MonitorType::BioRadEm1 => 1.024,
        }
    }

    /// Lowest AUFS setting the monitor supports.
    pub fn min_aufs(self) -> f64 {
        match self {
            MonitorType::PharmaciaUvMii => 0.001,
            MonitorType::BioRadEm1 => 0.01,
        }
    }

    /// Name sent on the wire and written to logs.
    pub fn wire_name(self) -> &'static str {
        match self {
            MonitorType::PharmaciaUvMii => "Pharmacia UV MII",
            MonitorType::BioRadEm1 => "BioRad EM1",
        }
    }
}

impl std::fmt::Display for MonitorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// Detector configuration for a step or a run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MonitorSettings {
    /// Monitor model.
    pub monitor_type: MonitorType,
    /// Configured sensitivity (AUFS).
    pub full_scale_setting: f64,
}

impl MonitorSettings {
    /// Build settings, clamping the AUFS to the monitor's lowest supported range.
    ///
    /// Non-positive AUFS values are rejected rather than clamped.
    pub fn new(monitor_type: MonitorType, full_scale_setting: f64) -> AppResult<Self> {
        let settings = Self {
            monitor_type,
            full_scale_setting,
        };
        settings.validate()?;
        Ok(settings.normalized())
    }

    /// Reject settings that cannot produce a calibrated reading.
    pub fn validate(&self) -> AppResult<()> {
        if !self.full_scale_setting.is_finite() || self.full_scale_setting <= 0.0 {
            return Err(FplcError::Validation(format!(
                "full-scale setting must be positive, got {}",
                self.full_scale_setting
            )));
        }
        Ok(())
    }

    /// EM-1 has no range below 0.01 AUFS.
    pub fn normalized(self) -> Self {
        Self {
            full_scale_setting: self.full_scale_setting.max(self.monitor_type.min_aufs()),
            ..self
        }
    }

    /// Initial Y-axis ceiling for a live trace at this sensitivity.
    pub fn initial_plot_ceiling(&self) -> f64 {
        match self.monitor_type {
            MonitorType::PharmaciaUvMii => self.full_scale_setting,
            MonitorType::BioRadEm1 => 0.1 * self.full_scale_setting,
        }
    }
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            monitor_type: MonitorType::PharmaciaUvMii,
            full_scale_setting: 0.1,
        }
    }
}

/// Instrument metadata stored alongside a method and written into run logs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentSettings {
    /// Installed column, free text (e.g. "Superdex-200").
    #[serde(alias = "ColumnType")]
    pub column_type: String,
    /// Monitor model.
    #[serde(alias = "UVMonitor")]
    pub monitor_type: MonitorType,
    /// Default sensitivity.
    #[serde(alias = "AUFS")]
    pub aufs: f64,
}

impl InstrumentSettings {
    /// Monitor settings derived from the instrument defaults.
    pub fn monitor_settings(&self) -> AppResult<MonitorSettings> {
        MonitorSettings::new(self.monitor_type, self.aufs)
    }
}

impl Default for InstrumentSettings {
    fn default() -> Self {
        Self {
            column_type: "Superdex-200".to_string(),
            monitor_type: MonitorType::PharmaciaUvMii,
            aufs: 0.1,
        }
    }
}
