//! Raw ADC count to physical unit conversion.
//!
//! The ADC is a signed 16-bit converter: a count of 32768 corresponds to the
//! full-scale input voltage of the selected range.

use crate::instrument::MonitorSettings;
use crate::network::protocol::RawSample;
use serde::Serialize;

/// Counts per full-scale input of the 16-bit ADC.
pub const ADC_COUNTS_FULL_SCALE: f64 = 32768.0;

/// Smallest absorbance reported. Keeps the live trace off the zero line.
pub const ABSORBANCE_FLOOR: f64 = 0.001;

/// A detector sample in physical units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CalibratedSample {
    /// Seconds since acquisition started.
    pub elapsed_time: f64,
    /// Eluate volume (ml) reported by the firmware.
    pub eluate_volume: f64,
    /// Channel 1 recorder voltage.
    pub chan1_volts: f64,
    /// Channel 1 absorbance (AU).
    pub chan1_absorbance_units: f64,
    /// Channel 2 voltage.
    pub chan2_volts: f64,
    /// Fraction collector advanced on this sample.
    pub fraction_mark: bool,
    /// Pump B percentage at this sample.
    pub pump_b_percent: f64,
}

/// Convert a raw count to volts for an ADC range.
pub fn counts_to_volts(raw: i32, full_scale_voltage: f64) -> f64 {
    f64::from(raw) / ADC_COUNTS_FULL_SCALE * full_scale_voltage
}

/// Convert a recorder voltage to absorbance, rounded to 4 decimals and floored at 0.001.
pub fn volts_to_absorbance(volts: f64, aufs: f64, reference_full_scale: f64) -> f64 {
    let au = round4(volts * (aufs / reference_full_scale));
    au.max(ABSORBANCE_FLOOR)
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

/// Calibrate one raw sample against explicit monitor settings.
pub fn calibrate(raw: &RawSample, settings: &MonitorSettings) -> CalibratedSample {
    let full_scale_voltage = settings.monitor_type.adc_full_scale_volts();
    let chan1_volts = counts_to_volts(raw.chan1_raw, full_scale_voltage);
    let chan2_volts = counts_to_volts(raw.chan2_raw, full_scale_voltage);

    CalibratedSample {
        elapsed_time: raw.elapsed_time,
        eluate_volume: raw.eluate_volume,
        chan1_volts,
        chan1_absorbance_units: volts_to_absorbance(
            chan1_volts,
            settings.full_scale_setting,
            settings.monitor_type.reference_full_scale(),
        ),
        chan2_volts,
        fraction_mark: raw.fraction_mark,
        pump_b_percent: raw.pump_b_percent,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::MonitorType;

    fn raw(chan1: i32) -> RawSample {
        RawSample {
            chan1_raw: chan1,
            chan2_raw: 200,
            elapsed_time: 1.0,
            eluate_volume: 0.0167,
            fraction_mark: false,
            pump_b_percent: 25.0,
        }
    }

    #[test]
    fn reference_sample_hits_the_floor() {
        let settings = MonitorSettings {
            monitor_type: MonitorType::PharmaciaUvMii,
            full_scale_setting: 0.1,
        };
        let sample = calibrate(&raw(100), &settings);
        assert!((sample.chan1_volts - 0.000781).abs() < 1e-6);
        assert_eq!(sample.chan1_absorbance_units, 0.001);
        assert_eq!(sample.pump_b_percent, 25.0);
        assert_eq!(sample.eluate_volume, 0.0167);
    }

    #[test]
    fn full_scale_count_reads_aufs() {
        let settings = MonitorSettings {
            monitor_type: MonitorType::PharmaciaUvMii,
            full_scale_setting: 0.5,
        };
        // 0.1 V is one full scale of the UV-MII recorder output.
        let count = (0.1 / 0.256 * ADC_COUNTS_FULL_SCALE).round() as i32;
        let sample = calibrate(&raw(count), &settings);
        assert!((sample.chan1_absorbance_units - 0.5).abs() < 1e-3);
    }

    #[test]
    fn em1_uses_wide_range() {
        let settings = MonitorSettings {
            monitor_type: MonitorType::BioRadEm1,
            full_scale_setting: 1.0,
        };
        let sample = calibrate(&raw(16384), &settings);
        assert!((sample.chan1_volts - 0.512).abs() < 1e-9);
        assert_eq!(sample.chan1_absorbance_units, 0.512);
    }

    #[test]
    fn zero_count_is_floored_for_every_aufs() {
        for monitor_type in [MonitorType::PharmaciaUvMii, MonitorType::BioRadEm1] {
            for aufs in [2.0, 0.1, 0.001] {
                let settings = MonitorSettings {
                    monitor_type,
                    full_scale_setting: aufs,
                };
                assert_eq!(calibrate(&raw(0), &settings).chan1_absorbance_units, 0.001);
            }
        }
    }
}
