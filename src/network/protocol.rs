//! Line-oriented wire codec between the controller and the instrument firmware.
//!
//! Every unit is one UTF-8 line terminated by `\n`. Outbound units are a command tag,
//! optionally followed by `:` and a JSON object (`RUN_ISOCRATIC:{"valve":"LOAD",...}`).
//! Inbound units are either a tag with colon-separated arguments (`VOLUME:A:4.95`) or a
//! bare raw detector sample made of six comma-separated numbers.
//!
//! The decoder buffers partial lines across reads, so a byte stream produces the same
//! event sequence no matter where the TCP reads split it.

use crate::error::{AppResult, FplcError};
use crate::instrument::MonitorType;
use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Longest inbound line accepted before the buffer is discarded as garbage.
pub const MAX_LINE_LEN: usize = 4096;

/// Identifies one of the two solvent pumps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PumpId {
    /// Pump A (buffer A, reports the step's delivered volume).
    A,
    /// Pump B (buffer B, gradient former).
    B,
}

impl PumpId {
    fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "A" | "a" => Some(PumpId::A),
            "B" | "b" => Some(PumpId::B),
            _ => None,
        }
    }
}

impl std::fmt::Display for PumpId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PumpId::A => write!(f, "A"),
            PumpId::B => write!(f, "B"),
        }
    }
}

/// System (injection) valve position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ValvePosition {
    /// Sample loop being filled, pump flow bypasses the loop.
    Load,
    /// Loop switched into the flow path.
    Inject,
    /// Flow path routed for washing.
    Wash,
}

impl ValvePosition {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "LOAD" => Some(ValvePosition::Load),
            "INJECT" => Some(ValvePosition::Inject),
            "WASH" => Some(ValvePosition::Wash),
            _ => None,
        }
    }
}

impl std::fmt::Display for ValvePosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValvePosition::Load => write!(f, "LOAD"),
            ValvePosition::Inject => write!(f, "INJECT"),
            ValvePosition::Wash => write!(f, "WASH"),
        }
    }
}

/// Payload of `RUN_ISOCRATIC` / `RUN_GRADIENT`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunParameters {
    /// Valve position for the step.
    pub valve: ValvePosition,
    /// Flow rate in ml/min.
    pub flowrate: f64,
    /// Step volume in ml.
    pub volume: f64,
    /// Diverter valve routed to the detector/collector path.
    pub diverter: bool,
    /// Monitor model, present when the detector is in use.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitor: Option<MonitorType>,
    /// Always true for run commands.
    pub start_pumps: bool,
    /// Arm detector acquisition on the firmware.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_adc: Option<bool>,
    /// Start the fraction collector.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_fraction: Option<bool>,
    /// Gradient lower bound (% B). Gradient runs only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_percent: Option<f64>,
    /// Gradient upper bound (% B). Gradient runs only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_percent: Option<f64>,
}

impl RunParameters {
    /// Isocratic run parameters.
    pub fn isocratic(valve: ValvePosition, flowrate: f64, volume: f64, diverter: bool) -> AppResult<Self> {
        if !(flowrate.is_finite() && flowrate > 0.0) {
            return Err(FplcError::Validation(format!("flow rate must be positive, got {flowrate}")));
        }
        if !(volume.is_finite() && volume > 0.0) {
            return Err(FplcError::Validation(format!("volume must be positive, got {volume}")));
        }
        Ok(Self {
            valve,
            flowrate,
            volume,
            diverter,
            monitor: None,
            start_pumps: true,
            start_adc: None,
            start_fraction: None,
            min_percent: None,
            max_percent: None,
        })
    }

    /// Add gradient bounds, turning these into gradient run parameters.
    pub fn with_gradient(mut self, min_percent: f64, max_percent: f64) -> AppResult<Self> {
        if !(0.0..=100.0).contains(&min_percent)
            || !(0.0..=100.0).contains(&max_percent)
            || min_percent > max_percent
        {
            return Err(FplcError::Validation(format!(
                "gradient bounds must satisfy 0 <= min <= max <= 100, got {min_percent}..{max_percent}"
            )));
        }
        self.min_percent = Some(min_percent);
        self.max_percent = Some(max_percent);
        Ok(self)
    }

    /// Arm detector acquisition for the given monitor.
    pub fn with_acquisition(mut self, monitor: MonitorType) -> Self {
        self.monitor = Some(monitor);
        self.start_adc = Some(true);
        self
    }

    /// Start the fraction collector with the step.
    pub fn with_fraction_collection(mut self) -> Self {
        self.start_fraction = Some(true);
        self
    }
}

/// Payload of `METHOD_STOP`. Flow, volume and gradient are always zeroed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopParameters {
    /// Always `LOAD`.
    pub valve: ValvePosition,
    /// Always 0.
    pub flowrate: f64,
    /// Always 0.
    pub volume: f64,
    /// Always 0.
    pub min_percent: f64,
    /// Always 0.
    pub max_percent: f64,
    /// Stop detector acquisition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_adc: Option<bool>,
    /// Stop the fraction collector.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_fraction: Option<bool>,
}

impl StopParameters {
    /// Stop parameters mirroring what the last step started.
    pub fn new(stop_acquisition: bool, stop_fraction: bool) -> Self {
        Self {
            valve: ValvePosition::Load,
            flowrate: 0.0,
            volume: 0.0,
            min_percent: 0.0,
            max_percent: 0.0,
            stop_adc: stop_acquisition.then_some(true),
            stop_fraction: stop_fraction.then_some(true),
        }
    }
}

/// Payload of `WASH_PUMPS`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WashParameters {
    /// Pumps to wash, in order.
    pub pumps: Vec<PumpId>,
}

/// Outbound command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Start an isocratic step.
    RunIsocratic(RunParameters),
    /// Start a gradient step.
    RunGradient(RunParameters),
    /// Stop everything and return the valve to LOAD.
    MethodStop(StopParameters),
    /// Hold detector acquisition.
    PauseAcquisition,
    /// Release detector acquisition.
    ResumeAcquisition,
    /// Manual mode: start the detector ADC.
    StartAcquisition,
    /// Manual mode: stop the detector ADC.
    StopAcquisition,
    /// Manual mode: start both pumps at the configured flow rate.
    StartPumps,
    /// Manual mode: stop both pumps.
    StopPumps,
    /// Manual mode: set the flow rate (ml/min).
    SetFlowRate(f64),
    /// Wash a single pump.
    WashPump(PumpId),
    /// Wash several pumps.
    WashPumps(WashParameters),
    /// Toggle the auxiliary digital output.
    ToggleAuxiliary,
}

impl Command {
    /// Wire tag of the command.
    pub fn tag(&self) -> &'static str {
        match self {
            Command::RunIsocratic(_) => "RUN_ISOCRATIC",
            Command::RunGradient(_) => "RUN_GRADIENT",
            Command::MethodStop(_) => "METHOD_STOP",
            Command::PauseAcquisition => "PAUSE_ADC",
            Command::ResumeAcquisition => "RESUME_ADC",
            Command::StartAcquisition => "START_ADC",
            Command::StopAcquisition => "STOP_ADC",
            Command::StartPumps => "START_PUMPS",
            Command::StopPumps => "STOP_PUMPS",
            Command::SetFlowRate(_) => "FLOWRATE",
            Command::WashPump(PumpId::A) => "WASH_PUMP_A",
            Command::WashPump(PumpId::B) => "WASH_PUMP_B",
            Command::WashPumps(_) => "WASH_PUMPS",
            Command::ToggleAuxiliary => "TOGGLE_LED",
        }
    }

    /// Encode as one newline-terminated wire unit.
    pub fn encode(&self) -> AppResult<String> {
        let payload = match self {
            Command::RunIsocratic(params) | Command::RunGradient(params) => {
                Some(serde_json::to_string(params)?)
            }
            Command::MethodStop(params) => Some(serde_json::to_string(params)?),
            Command::WashPumps(params) => Some(serde_json::to_string(params)?),
            Command::SetFlowRate(rate) => Some(rate.to_string()),
            _ => None,
        };

        Ok(match payload {
            Some(payload) => format!("{}:{}\n", self.tag(), payload),
            None => format!("{}\n", self.tag()),
        })
    }

    /// Parse an outbound unit back into a command (used by device simulators and tests).
    pub fn parse(line: &str) -> AppResult<Self> {
        let line = line.trim();
        let (tag, payload) = match line.split_once(':') {
            Some((tag, payload)) => (tag, Some(payload)),
            None => (line, None),
        };

        fn require<'a>(tag: &str, payload: Option<&'a str>) -> AppResult<&'a str> {
            payload.ok_or_else(|| FplcError::Protocol(format!("{tag} requires a payload")))
        }

        let command = match tag {
            "RUN_ISOCRATIC" => Command::RunIsocratic(serde_json::from_str(require(tag, payload)?)?),
            "RUN_GRADIENT" => Command::RunGradient(serde_json::from_str(require(tag, payload)?)?),
            "METHOD_STOP" => Command::MethodStop(serde_json::from_str(require(tag, payload)?)?),
            "WASH_PUMPS" => Command::WashPumps(serde_json::from_str(require(tag, payload)?)?),
            "FLOWRATE" => {
                let rate = require(tag, payload)?
                    .trim()
                    .parse::<f64>()
                    .map_err(|e| FplcError::Protocol(format!("bad flow rate: {e}")))?;
                Command::SetFlowRate(rate)
            }
            "PAUSE_ADC" => Command::PauseAcquisition,
            "RESUME_ADC" => Command::ResumeAcquisition,
            "START_ADC" => Command::StartAcquisition,
            "STOP_ADC" => Command::StopAcquisition,
            "START_PUMPS" => Command::StartPumps,
            "STOP_PUMPS" => Command::StopPumps,
            "WASH_PUMP_A" => Command::WashPump(PumpId::A),
            "WASH_PUMP_B" => Command::WashPump(PumpId::B),
            "TOGGLE_LED" => Command::ToggleAuxiliary,
            other => return Err(FplcError::Protocol(format!("unknown command tag '{other}'"))),
        };
        Ok(command)
    }
}

/// One raw detector sample as reported by the firmware.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawSample {
    /// Channel 1 (UV monitor) ADC count.
    pub chan1_raw: i32,
    /// Channel 2 (auxiliary input) ADC count.
    pub chan2_raw: i32,
    /// Seconds since acquisition started.
    pub elapsed_time: f64,
    /// Eluate volume (ml) as counted by the firmware.
    pub eluate_volume: f64,
    /// Fraction collector advanced to a new tube.
    pub fraction_mark: bool,
    /// Current pump B percentage.
    pub pump_b_percent: f64,
}

impl RawSample {
    /// Parse the six-field CSV form: `chan1,chan2,elapsed,eluate,frac_mark,pump_b`.
    pub fn parse(line: &str) -> Option<Self> {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() != 6 {
            return None;
        }

        let chan1_raw = fields[0].parse::<i32>().ok()?;
        let chan2_raw = fields[1].parse::<i32>().ok()?;
        let floats = fields[2..]
            .iter()
            .map(|f| f.parse::<f64>().ok().filter(|v| v.is_finite()))
            .collect::<Option<Vec<f64>>>()?;

        let fraction_mark = match floats[2] {
            m if m == 0.0 => false,
            m if m == 1.0 => true,
            _ => return None,
        };

        Some(Self {
            chan1_raw,
            chan2_raw,
            elapsed_time: floats[0],
            eluate_volume: floats[1],
            fraction_mark,
            pump_b_percent: floats[3],
        })
    }
}

/// Decoded inbound unit.
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryEvent {
    /// Volume delivered so far in the current step on a pump channel.
    VolumeProgress {
        /// Reporting channel.
        pump: PumpId,
        /// Delivered volume (ml).
        delivered_volume: f64,
    },
    /// Firmware keep-alive.
    Heartbeat,
    /// Pump fault.
    PumpError(PumpId),
    /// Pump fault cleared.
    PumpErrorCleared(PumpId),
    /// Fraction collector fault.
    FractionCollectorError,
    /// Fraction collector fault cleared.
    FractionCollectorErrorCleared,
    /// System valve failed to reach its commanded position.
    ValveFault,
    /// System valve reached a position.
    ValvePositionReached(ValvePosition),
    /// Pump wash finished.
    WashCompleted(PumpId),
    /// Raw detector sample.
    RawSample(RawSample),
    /// Line that matched no known shape.
    Malformed(String),
    /// Peer lost. Emitted by the listener, never decoded from the wire.
    Disconnected,
}

/// Classify one complete line. Blank lines yield `None`.
pub fn parse_line(line: &str) -> Option<TelemetryEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    // Phrases emitted by older firmware builds.
    if line.contains("Fraction Collector Error has been cleared") {
        return Some(TelemetryEvent::FractionCollectorErrorCleared);
    }
    if line.starts_with("Fraction Collector error") {
        return Some(TelemetryEvent::FractionCollectorError);
    }

    let mut parts = line.split(':');
    let tag = parts.next().unwrap_or_default();
    let args: Vec<&str> = parts.collect();

    let event = match (tag, args.as_slice()) {
        ("HEARTBEAT", []) => Some(TelemetryEvent::Heartbeat),
        ("VALVE_FAULT", []) => Some(TelemetryEvent::ValveFault),
        ("FRACTION_COLLECTOR_ERROR", []) => Some(TelemetryEvent::FractionCollectorError),
        ("FRACTION_COLLECTOR_ERROR_CLEARED", []) => {
            Some(TelemetryEvent::FractionCollectorErrorCleared)
        }
        ("PUMP_A_WASH_COMPLETED", []) => Some(TelemetryEvent::WashCompleted(PumpId::A)),
        ("PUMP_B_WASH_COMPLETED", []) => Some(TelemetryEvent::WashCompleted(PumpId::B)),
        ("WASH_COMPLETED", [pump]) => PumpId::parse(pump).map(TelemetryEvent::WashCompleted),
        ("PUMP_ERROR", [pump]) => PumpId::parse(pump).map(TelemetryEvent::PumpError),
        ("PUMP_ERROR_CLEARED", [pump]) => {
            PumpId::parse(pump).map(TelemetryEvent::PumpErrorCleared)
        }
        ("VALVE_POSITION", [position]) => {
            ValvePosition::parse(position).map(TelemetryEvent::ValvePositionReached)
        }
        ("VOLUME", [pump, volume]) => match (PumpId::parse(pump), volume.trim().parse::<f64>()) {
            (Some(pump), Ok(delivered_volume)) if delivered_volume.is_finite() => {
                Some(TelemetryEvent::VolumeProgress {
                    pump,
                    delivered_volume,
                })
            }
            _ => None,
        },
        (_, []) => RawSample::parse(line).map(TelemetryEvent::RawSample),
        _ => None,
    };

    Some(event.unwrap_or_else(|| {
        warn!(line = %line, "Malformed telemetry unit");
        TelemetryEvent::Malformed(line.to_string())
    }))
}

/// Incremental decoder holding partial trailing bytes between reads.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes and return every event completed by them, in order.
    pub fn decode(&mut self, bytes: &[u8]) -> Vec<TelemetryEvent> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line = self.buffer.split_to(pos);
            self.buffer.advance(1);
            let text = String::from_utf8_lossy(&line);
            if let Some(event) = parse_line(&text) {
                events.push(event);
            }
        }

        if self.buffer.len() > MAX_LINE_LEN {
            let dropped = self.buffer.len();
            self.buffer.clear();
            warn!(bytes = dropped, "Discarding oversized unterminated telemetry line");
            events.push(TelemetryEvent::Malformed(format!(
                "<{dropped} bytes without line terminator>"
            )));
        }

        events
    }

    /// Bytes held from an incomplete trailing line.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Drop any partial line (used when a connection is replaced).
    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_bare_and_structured_commands() {
        assert_eq!(Command::PauseAcquisition.encode().unwrap(), "PAUSE_ADC\n");
        assert_eq!(Command::WashPump(PumpId::B).encode().unwrap(), "WASH_PUMP_B\n");
        assert_eq!(Command::SetFlowRate(1.5).encode().unwrap(), "FLOWRATE:1.5\n");

        let params = RunParameters::isocratic(ValvePosition::Load, 1.0, 5.0, false).unwrap();
        let unit = Command::RunIsocratic(params).encode().unwrap();
        assert!(unit.starts_with("RUN_ISOCRATIC:{"));
        assert!(unit.ends_with("}\n"));
        assert!(unit.contains("\"valve\":\"LOAD\""));
        assert!(unit.contains("\"start_pumps\":true"));
        assert!(!unit.contains("start_adc"));
        assert!(!unit.contains("min_percent"));
    }

    #[test]
    fn stop_parameters_zero_everything() {
        let stop = StopParameters::new(true, false);
        let unit = Command::MethodStop(stop).encode().unwrap();
        let payload: serde_json::Value =
            serde_json::from_str(unit.trim().trim_start_matches("METHOD_STOP:")).unwrap();
        assert_eq!(payload["valve"], "LOAD");
        assert_eq!(payload["flowrate"], 0.0);
        assert_eq!(payload["max_percent"], 0.0);
        assert_eq!(payload["stop_adc"], true);
        assert!(payload.get("stop_fraction").is_none());
    }

    #[test]
    fn command_parse_inverts_encode() {
        let params = RunParameters::isocratic(ValvePosition::Inject, 0.5, 2.0, true)
            .unwrap()
            .with_gradient(0.0, 50.0)
            .unwrap()
            .with_acquisition(MonitorType::PharmaciaUvMii);
        let command = Command::RunGradient(params);
        let parsed = Command::parse(&command.encode().unwrap()).unwrap();
        assert_eq!(parsed, command);
    }

    #[test]
    fn gradient_bounds_are_validated() {
        let base = RunParameters::isocratic(ValvePosition::Load, 1.0, 1.0, false).unwrap();
        assert!(base.clone().with_gradient(60.0, 50.0).is_err());
        assert!(base.clone().with_gradient(-1.0, 50.0).is_err());
        assert!(base.with_gradient(0.0, 100.0).is_ok());
        assert!(RunParameters::isocratic(ValvePosition::Load, 0.0, 1.0, false).is_err());
    }

    #[test]
    fn parses_inbound_vocabulary() {
        assert_eq!(parse_line("HEARTBEAT"), Some(TelemetryEvent::Heartbeat));
        assert_eq!(
            parse_line("VOLUME:A:4.95"),
            Some(TelemetryEvent::VolumeProgress {
                pump: PumpId::A,
                delivered_volume: 4.95
            })
        );
        assert_eq!(
            parse_line("PUMP_ERROR:B"),
            Some(TelemetryEvent::PumpError(PumpId::B))
        );
        assert_eq!(
            parse_line("PUMP_ERROR_CLEARED:B"),
            Some(TelemetryEvent::PumpErrorCleared(PumpId::B))
        );
        assert_eq!(
            parse_line("VALVE_POSITION:INJECT"),
            Some(TelemetryEvent::ValvePositionReached(ValvePosition::Inject))
        );
        assert_eq!(parse_line("VALVE_FAULT"), Some(TelemetryEvent::ValveFault));
        assert_eq!(
            parse_line("PUMP_A_WASH_COMPLETED"),
            Some(TelemetryEvent::WashCompleted(PumpId::A))
        );
        assert_eq!(parse_line("   "), None);
    }

    #[test]
    fn accepts_legacy_fraction_collector_phrases() {
        assert_eq!(
            parse_line("Fraction Collector error: tube jam"),
            Some(TelemetryEvent::FractionCollectorError)
        );
        assert_eq!(
            parse_line("Fraction Collector Error has been cleared"),
            Some(TelemetryEvent::FractionCollectorErrorCleared)
        );
    }

    #[test]
    fn raw_sample_needs_exactly_six_numeric_fields() {
        let event = parse_line("100,200,1.0,0.0167,0,25.0");
        match event {
            Some(TelemetryEvent::RawSample(sample)) => {
                assert_eq!(sample.chan1_raw, 100);
                assert_eq!(sample.chan2_raw, 200);
                assert_eq!(sample.elapsed_time, 1.0);
                assert!(!sample.fraction_mark);
                assert_eq!(sample.pump_b_percent, 25.0);
            }
            other => panic!("expected raw sample, got {other:?}"),
        }

        assert!(matches!(
            parse_line("100,200,1.0,0.0167,0"),
            Some(TelemetryEvent::Malformed(_))
        ));
        assert!(matches!(
            parse_line("100,abc,1.0,0.0167,0,25.0"),
            Some(TelemetryEvent::Malformed(_))
        ));
        assert!(matches!(
            parse_line("100,200,1.0,0.0167,2,25.0"),
            Some(TelemetryEvent::Malformed(_))
        ));
    }

    #[test]
    fn decoder_holds_partial_lines() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.decode(b"HEART").is_empty());
        assert_eq!(decoder.pending(), 5);

        let events = decoder.decode(b"BEAT\r\nVOLUME:A:1.0\nVAL");
        assert_eq!(
            events,
            vec![
                TelemetryEvent::Heartbeat,
                TelemetryEvent::VolumeProgress {
                    pump: PumpId::A,
                    delivered_volume: 1.0
                }
            ]
        );
        assert_eq!(decoder.pending(), 3);
    }

    #[test]
    fn malformed_unit_does_not_halt_decoding() {
        let mut decoder = FrameDecoder::new();
        let events = decoder.decode(b"garbage here\nHEARTBEAT\n1,2,3\nVALVE_FAULT\n");
        assert_eq!(events.len(), 4);
        assert!(matches!(events[0], TelemetryEvent::Malformed(_)));
        assert_eq!(events[1], TelemetryEvent::Heartbeat);
        assert!(matches!(events[2], TelemetryEvent::Malformed(_)));
        assert_eq!(events[3], TelemetryEvent::ValveFault);
    }

    #[test]
    fn oversized_line_is_discarded() {
        let mut decoder = FrameDecoder::new();
        let junk = vec![b'x'; MAX_LINE_LEN + 1];
        let events = decoder.decode(&junk);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], TelemetryEvent::Malformed(_)));
        assert_eq!(decoder.pending(), 0);
        assert_eq!(decoder.decode(b"HEARTBEAT\n"), vec![TelemetryEvent::Heartbeat]);
    }
}
