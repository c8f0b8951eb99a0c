//! In-memory trace for the live chromatogram display.

use crate::acquisition::CalibratedSample;
use crate::instrument::MonitorSettings;
use serde::Serialize;

/// Headroom applied when the trace outgrows the Y ceiling.
pub const CEILING_HEADROOM: f64 = 1.1;

/// Height of a fraction mark relative to the current ceiling.
pub const FRACTION_MARK_HEIGHT: f64 = 0.1;

/// Per-run trace vectors plus the auto-scaled Y ceiling.
///
/// The ceiling only grows during a run; it resets to the monitor's initial ceiling
/// when the buffer is cleared at a run boundary.
#[derive(Debug, Clone, Serialize)]
pub struct LiveBuffer {
    eluate_volume: Vec<f64>,
    absorbance: Vec<f64>,
    chan2_volts: Vec<f64>,
    fraction_marks: Vec<f64>,
    y_ceiling: f64,
    initial_ceiling: f64,
}

impl LiveBuffer {
    /// Empty buffer scaled for the given monitor settings.
    pub fn new(settings: &MonitorSettings) -> Self {
        let ceiling = settings.initial_plot_ceiling();
        Self {
            eluate_volume: Vec::new(),
            absorbance: Vec::new(),
            chan2_volts: Vec::new(),
            fraction_marks: Vec::new(),
            y_ceiling: ceiling,
            initial_ceiling: ceiling,
        }
    }

    /// Add one sample, growing the ceiling if the absorbance exceeds it.
    pub fn push(&mut self, sample: &CalibratedSample) {
        let wanted = sample.chan1_absorbance_units * CEILING_HEADROOM;
        if wanted > self.y_ceiling {
            self.y_ceiling = wanted;
        }

        self.eluate_volume.push(sample.eluate_volume);
        self.absorbance.push(sample.chan1_absorbance_units);
        self.chan2_volts.push(sample.chan2_volts);
        self.fraction_marks.push(if sample.fraction_mark {
            FRACTION_MARK_HEIGHT * self.y_ceiling
        } else {
            0.0
        });
    }

    /// Drop the trace and restore the initial ceiling.
    pub fn clear(&mut self) {
        self.eluate_volume.clear();
        self.absorbance.clear();
        self.chan2_volts.clear();
        self.fraction_marks.clear();
        self.y_ceiling = self.initial_ceiling;
    }

    /// Clear and rescale for new monitor settings.
    pub fn reset(&mut self, settings: &MonitorSettings) {
        self.initial_ceiling = settings.initial_plot_ceiling();
        self.clear();
    }

    /// Samples held.
    pub fn len(&self) -> usize {
        self.absorbance.len()
    }

    /// Whether the trace is empty.
    pub fn is_empty(&self) -> bool {
        self.absorbance.is_empty()
    }

    /// Current Y-axis ceiling.
    pub fn y_ceiling(&self) -> f64 {
        self.y_ceiling
    }

    /// X values (ml).
    pub fn eluate_volume(&self) -> &[f64] {
        &self.eluate_volume
    }

    /// Channel 1 absorbance trace.
    pub fn absorbance(&self) -> &[f64] {
        &self.absorbance
    }

    /// Channel 2 trace.
    pub fn chan2_volts(&self) -> &[f64] {
        &self.chan2_volts
    }

    /// Fraction marks scaled to the ceiling in force when each was recorded.
    pub fn fraction_marks(&self) -> &[f64] {
        &self.fraction_marks
    }
}
