//! A single method step and its validation.

use crate::error::{AppResult, FplcError};
use crate::instrument::MonitorSettings;
use crate::network::protocol::{Command, RunParameters, ValvePosition};
use serde::{Deserialize, Serialize};

/// How the pumps deliver buffer during a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PumpMode {
    /// Fixed buffer composition.
    Isocratic,
    /// Linear pump B ramp between the gradient bounds.
    Gradient,
}

/// Pump B ramp bounds in percent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Gradient {
    /// Starting % B.
    #[serde(alias = "Min")]
    pub min_percent: f64,
    /// Final % B.
    #[serde(alias = "Max")]
    pub max_percent: f64,
}

impl Gradient {
    /// Full 0-100 % span, the neutral value for isocratic steps.
    pub const FULL: Gradient = Gradient {
        min_percent: 0.0,
        max_percent: 100.0,
    };

    fn validate(&self) -> AppResult<()> {
        let in_range = |v: f64| (0.0..=100.0).contains(&v);
        if !in_range(self.min_percent)
            || !in_range(self.max_percent)
            || self.min_percent > self.max_percent
        {
            return Err(FplcError::Validation(format!(
                "gradient must satisfy 0 <= min <= max <= 100, got {}..{}",
                self.min_percent, self.max_percent
            )));
        }
        Ok(())
    }
}

impl Default for Gradient {
    fn default() -> Self {
        Self::FULL
    }
}

/// Fraction collector during a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FractionCollect {
    /// Collector advances tubes.
    On,
    /// Collector idle.
    #[default]
    Off,
}

/// Detector use during a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Monitor {
    /// Acquire and log detector samples.
    #[serde(rename = "UV_ON")]
    UvOn,
    /// No acquisition.
    #[serde(rename = "UV_OFF")]
    #[default]
    UvOff,
}

/// Diverter valve during a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Diverter {
    /// Flow routed through the diverter.
    On,
    /// Diverter closed.
    #[default]
    Off,
}

/// What happens when a step has delivered its volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EndAction {
    /// Start the next step immediately.
    #[default]
    Continue,
    /// Hold until the operator resumes.
    Pause,
    /// End the method.
    Stop,
}

impl std::fmt::Display for EndAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndAction::Continue => write!(f, "Continue"),
            EndAction::Pause => write!(f, "Pause"),
            EndAction::Stop => write!(f, "Stop"),
        }
    }
}

/// One step of a chromatography method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "StepRecord")]
pub struct MethodStep {
    /// System valve position.
    pub valve_position: ValvePosition,
    /// Flow rate (ml/min).
    pub flow_rate: f64,
    /// Volume to deliver before the end action fires (ml).
    pub target_volume: f64,
    /// Isocratic or gradient delivery.
    pub pump_mode: PumpMode,
    /// Gradient bounds, meaningful for gradient steps only.
    pub gradient: Gradient,
    /// Fraction collector.
    pub fraction_collect: FractionCollect,
    /// Detector use.
    pub monitor: Monitor,
    /// Detector settings, present when the monitor is on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitor_settings: Option<MonitorSettings>,
    /// Diverter valve.
    pub diverter: Diverter,
    /// Action at the end of the step.
    pub end_action: EndAction,
}

impl MethodStep {
    /// Isocratic step with collector, monitor and diverter off and `Continue` at the end.
    pub fn isocratic(
        valve_position: ValvePosition,
        flow_rate: f64,
        target_volume: f64,
    ) -> AppResult<Self> {
        let step = Self {
            valve_position,
            flow_rate,
            target_volume,
            pump_mode: PumpMode::Isocratic,
            gradient: Gradient::FULL,
            fraction_collect: FractionCollect::Off,
            monitor: Monitor::UvOff,
            monitor_settings: None,
            diverter: Diverter::Off,
            end_action: EndAction::Continue,
        };
        step.validate()?;
        Ok(step)
    }

    /// Switch to gradient delivery.
    pub fn with_gradient(mut self, min_percent: f64, max_percent: f64) -> AppResult<Self> {
        let gradient = Gradient {
            min_percent,
            max_percent,
        };
        gradient.validate()?;
        self.pump_mode = PumpMode::Gradient;
        self.gradient = gradient;
        Ok(self)
    }

    /// Turn the monitor on with the given settings.
    pub fn with_monitor(mut self, settings: MonitorSettings) -> AppResult<Self> {
        settings.validate()?;
        self.monitor = Monitor::UvOn;
        self.monitor_settings = Some(settings.normalized());
        Ok(self)
    }

    /// Collect fractions during the step.
    pub fn with_fraction_collection(mut self) -> Self {
        self.fraction_collect = FractionCollect::On;
        self
    }

    /// Route flow through the diverter.
    pub fn with_diverter(mut self) -> Self {
        self.diverter = Diverter::On;
        self
    }

    /// Set the end action.
    pub fn with_end_action(mut self, end_action: EndAction) -> Self {
        self.end_action = end_action;
        self
    }

    /// Check every invariant the execution engine relies on.
    pub fn validate(&self) -> AppResult<()> {
        if !(self.flow_rate.is_finite() && self.flow_rate > 0.0) {
            return Err(FplcError::Validation(format!(
                "flow rate must be positive, got {}",
                self.flow_rate
            )));
        }
        if !(self.target_volume.is_finite() && self.target_volume > 0.0) {
            return Err(FplcError::Validation(format!(
                "target volume must be positive, got {}",
                self.target_volume
            )));
        }
        if self.pump_mode == PumpMode::Gradient {
            self.gradient.validate()?;
        }
        match (self.monitor, &self.monitor_settings) {
            (Monitor::UvOn, None) => Err(FplcError::Validation(
                "monitor settings are required when the monitor is on".into(),
            )),
            (Monitor::UvOn, Some(settings)) => settings.validate(),
            (Monitor::UvOff, _) => Ok(()),
        }
    }

    /// Detector settings to arm acquisition with, if the monitor is on.
    pub fn acquisition_settings(&self) -> Option<MonitorSettings> {
        match self.monitor {
            Monitor::UvOn => self.monitor_settings,
            Monitor::UvOff => None,
        }
    }

    /// Whether the fraction collector runs during this step.
    pub fn collects_fractions(&self) -> bool {
        self.fraction_collect == FractionCollect::On
    }

    /// Minutes needed to deliver the target volume.
    pub fn duration_minutes(&self) -> f64 {
        self.target_volume / self.flow_rate
    }

    /// Build the run command for this step.
    pub fn run_command(&self) -> AppResult<Command> {
        let mut params = RunParameters::isocratic(
            self.valve_position,
            self.flow_rate,
            self.target_volume,
            self.diverter == Diverter::On,
        )?;
        if let Some(settings) = self.acquisition_settings() {
            params = params.with_acquisition(settings.monitor_type);
        }
        if self.collects_fractions() {
            params = params.with_fraction_collection();
        }

        Ok(match self.pump_mode {
            PumpMode::Isocratic => Command::RunIsocratic(params),
            PumpMode::Gradient => Command::RunGradient(
                params.with_gradient(self.gradient.min_percent, self.gradient.max_percent)?,
            ),
        })
    }
}

impl std::fmt::Display for MethodStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {:.1} ml/min {:.1} ml ",
            self.valve_position, self.flow_rate, self.target_volume
        )?;
        match self.pump_mode {
            PumpMode::Isocratic => write!(f, "Isocratic")?,
            PumpMode::Gradient => write!(
                f,
                "Gradient ({:.1}->{:.1}%)",
                self.gradient.min_percent, self.gradient.max_percent
            )?,
        }
        if let Some(settings) = self.acquisition_settings() {
            write!(f, " UV {} AUFS", settings.full_scale_setting)?;
        }
        if self.collects_fractions() {
            write!(f, " frac")?;
        }
        write!(f, " -> {}", self.end_action)
    }
}

/// On-disk step shape, accepting both the current keys and the older flat layout.
#[derive(Debug, Deserialize)]
struct StepRecord {
    #[serde(alias = "System Valve")]
    valve_position: ValvePosition,
    #[serde(alias = "Flowrate (ml/min)")]
    flow_rate: f64,
    #[serde(alias = "Run Volume (ml)")]
    target_volume: f64,
    #[serde(default, alias = "Pump Mode")]
    pump_mode: Option<PumpMode>,
    #[serde(default, alias = "PumpB Gradient")]
    gradient: Option<Gradient>,
    #[serde(default, alias = "PumpB Min %")]
    pumpb_min_percent: Option<f64>,
    #[serde(default, alias = "PumpB Max %")]
    pumpb_max_percent: Option<f64>,
    #[serde(default, alias = "Frac Collect")]
    fraction_collect: FractionCollect,
    #[serde(default)]
    monitor: Monitor,
    #[serde(default)]
    monitor_settings: Option<MonitorSettings>,
    #[serde(default, alias = "Diverter")]
    diverter: Diverter,
    #[serde(default, alias = "End Action")]
    end_action: EndAction,
}

impl TryFrom<StepRecord> for MethodStep {
    type Error = String;

    fn try_from(record: StepRecord) -> Result<Self, Self::Error> {
        let (pump_mode, gradient) = match record.pump_mode {
            Some(mode) => (mode, record.gradient.unwrap_or_default()),
            None => {
                // Older documents carry only flat bounds; equal bounds meant isocratic.
                let min = record.pumpb_min_percent.unwrap_or(0.0);
                let max = record.pumpb_max_percent.unwrap_or(0.0);
                if min != max {
                    (
                        PumpMode::Gradient,
                        Gradient {
                            min_percent: min,
                            max_percent: max,
                        },
                    )
                } else {
                    (PumpMode::Isocratic, Gradient::FULL)
                }
            }
        };

        if pump_mode == PumpMode::Gradient {
            gradient.validate().map_err(|e| e.to_string())?;
        }

        Ok(MethodStep {
            valve_position: record.valve_position,
            flow_rate: record.flow_rate,
            target_volume: record.target_volume,
            pump_mode,
            gradient,
            fraction_collect: record.fraction_collect,
            monitor: record.monitor,
            monitor_settings: record.monitor_settings,
            diverter: record.diverter,
            end_action: record.end_action,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::MonitorType;

    fn uv(aufs: f64) -> MonitorSettings {
        MonitorSettings {
            monitor_type: MonitorType::PharmaciaUvMii,
            full_scale_setting: aufs,
        }
    }

    #[test]
    fn rejects_non_positive_flow_and_volume() {
        assert!(MethodStep::isocratic(ValvePosition::Load, 0.0, 5.0).is_err());
        assert!(MethodStep::isocratic(ValvePosition::Load, 1.0, -1.0).is_err());
        assert!(MethodStep::isocratic(ValvePosition::Load, f64::NAN, 1.0).is_err());
    }

    #[test]
    fn rejects_inverted_gradient() {
        let step = MethodStep::isocratic(ValvePosition::Inject, 0.5, 2.0).unwrap();
        assert!(step.clone().with_gradient(50.0, 10.0).is_err());
        assert!(step.with_gradient(0.0, 101.0).is_err());
    }

    #[test]
    fn monitor_on_requires_settings() {
        let mut step = MethodStep::isocratic(ValvePosition::Load, 1.0, 1.0).unwrap();
        step.monitor = Monitor::UvOn;
        assert!(step.validate().is_err());
        step.monitor_settings = Some(uv(0.1));
        assert!(step.validate().is_ok());
    }

    #[test]
    fn gradient_step_builds_gradient_command() {
        let step = MethodStep::isocratic(ValvePosition::Inject, 0.5, 2.0)
            .unwrap()
            .with_gradient(0.0, 50.0)
            .unwrap()
            .with_monitor(uv(0.1))
            .unwrap()
            .with_end_action(EndAction::Stop);

        match step.run_command().unwrap() {
            Command::RunGradient(params) => {
                assert_eq!(params.valve, ValvePosition::Inject);
                assert_eq!(params.flowrate, 0.5);
                assert_eq!(params.volume, 2.0);
                assert_eq!(params.min_percent, Some(0.0));
                assert_eq!(params.max_percent, Some(50.0));
                assert_eq!(params.start_adc, Some(true));
                assert_eq!(params.start_fraction, None);
            }
            other => panic!("expected gradient command, got {other:?}"),
        }
    }

    #[test]
    fn legacy_flat_bounds_are_upgraded() {
        let gradient: MethodStep = serde_json::from_str(
            r#"{"System Valve":"INJECT","Flowrate (ml/min)":0.5,"Run Volume (ml)":2.0,
                "PumpB Min %":10.0,"PumpB Max %":60.0,"Frac Collect":"ON","End Action":"Pause"}"#,
        )
        .unwrap();
        assert_eq!(gradient.pump_mode, PumpMode::Gradient);
        assert_eq!(gradient.gradient.min_percent, 10.0);
        assert_eq!(gradient.gradient.max_percent, 60.0);
        assert_eq!(gradient.fraction_collect, FractionCollect::On);
        assert_eq!(gradient.end_action, EndAction::Pause);

        let isocratic: MethodStep = serde_json::from_str(
            r#"{"valve_position":"LOAD","flow_rate":1.0,"target_volume":5.0,
                "pumpb_min_percent":20.0,"pumpb_max_percent":20.0}"#,
        )
        .unwrap();
        assert_eq!(isocratic.pump_mode, PumpMode::Isocratic);
        assert_eq!(isocratic.gradient, Gradient::FULL);
    }

    #[test]
    fn display_summarizes_gradient() {
        let step = MethodStep::isocratic(ValvePosition::Inject, 0.5, 2.0)
            .unwrap()
            .with_gradient(0.0, 50.0)
            .unwrap();
        assert_eq!(
            step.to_string(),
            "INJECT 0.5 ml/min 2.0 ml Gradient (0.0->50.0%) -> Continue"
        );
    }
}
