//! Electrochemical impedance spectroscopy elements.
//!
//! Both kinds sweep from `start_frequency` to `end_frequency` logarithmically,
//! producing one impedance sample per frequency point.

use super::{Potential, SampleSchedule, Violations};
use serde::{Deserialize, Serialize};

/// Minimum time the device spends on one frequency point.
const MIN_POINT_SECS: f64 = 0.05;

fn frequency_points(start: f64, end: f64, steps_per_decade: u32) -> u64 {
    if !(start > 0.0 && end > 0.0) {
        return 1;
    }
    let decades = (start / end).log10().abs();
    (decades * f64::from(steps_per_decade.max(1))).round() as u64 + 1
}

fn spectrum_schedule(start: f64, end: f64, steps_per_decade: u32, cycles: u32) -> SampleSchedule {
    let points = frequency_points(start, end, steps_per_decade);
    // Pace by the slowest point so every sample fits its measurement window.
    let slowest = start.min(end).max(f64::EPSILON);
    let point_secs = (f64::from(cycles.max(1)) / slowest).max(MIN_POINT_SECS);
    SampleSchedule::paced(point_secs * points as f64, point_secs)
}

fn check_spectrum(v: &mut Violations, start: f64, end: f64, steps_per_decade: u32) {
    v.positive("start frequency", start);
    v.positive("end frequency", end);
    v.rule(start != end, "start and end frequency must differ");
    v.rule(steps_per_decade >= 1, "steps per decade must be at least 1");
}

/// Potentiostatic EIS: a voltage perturbation around a DC bias.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EisPotentiostatic {
    /// First frequency (Hz)
    pub start_frequency: f64,
    /// Last frequency (Hz)
    pub end_frequency: f64,
    /// Frequencies measured per decade
    pub steps_per_decade: u32,
    /// DC bias potential
    pub bias: Potential,
    /// AC voltage amplitude
    pub amplitude: f64,
}

impl EisPotentiostatic {
    /// Create a potentiostatic EIS record.
    pub fn new(
        start_frequency: f64,
        end_frequency: f64,
        steps_per_decade: u32,
        bias: Potential,
        amplitude: f64,
    ) -> Self {
        Self {
            start_frequency,
            end_frequency,
            steps_per_decade,
            bias,
            amplitude,
        }
    }

    /// Number of frequency points in the spectrum.
    pub fn points(&self) -> u64 {
        frequency_points(self.start_frequency, self.end_frequency, self.steps_per_decade)
    }

    pub(super) fn schedule(&self) -> SampleSchedule {
        spectrum_schedule(self.start_frequency, self.end_frequency, self.steps_per_decade, 1)
    }

    pub(super) fn check(&self, v: &mut Violations) {
        check_spectrum(v, self.start_frequency, self.end_frequency, self.steps_per_decade);
        v.finite("bias voltage", self.bias.volts);
        v.positive("amplitude", self.amplitude);
    }
}

/// Galvanostatic EIS: a current perturbation around a DC bias current.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EisGalvanostatic {
    /// First frequency (Hz)
    pub start_frequency: f64,
    /// Last frequency (Hz)
    pub end_frequency: f64,
    /// Frequencies measured per decade
    pub steps_per_decade: u32,
    /// DC bias current
    pub bias_current: f64,
    /// AC current amplitude
    pub amplitude: f64,
    /// Cycles measured at every frequency point
    pub minimum_cycles: u32,
}

impl EisGalvanostatic {
    /// Create a galvanostatic EIS record measuring one cycle per point.
    pub fn new(
        start_frequency: f64,
        end_frequency: f64,
        steps_per_decade: u32,
        bias_current: f64,
        amplitude: f64,
    ) -> Self {
        Self {
            start_frequency,
            end_frequency,
            steps_per_decade,
            bias_current,
            amplitude,
            minimum_cycles: 1,
        }
    }

    /// Number of frequency points in the spectrum.
    pub fn points(&self) -> u64 {
        frequency_points(self.start_frequency, self.end_frequency, self.steps_per_decade)
    }

    pub(super) fn schedule(&self) -> SampleSchedule {
        spectrum_schedule(
            self.start_frequency,
            self.end_frequency,
            self.steps_per_decade,
            self.minimum_cycles,
        )
    }

    pub(super) fn check(&self, v: &mut Violations) {
        check_spectrum(v, self.start_frequency, self.end_frequency, self.steps_per_decade);
        v.finite("bias current", self.bias_current);
        v.positive("amplitude", self.amplitude);
        v.rule(self.minimum_cycles >= 1, "minimum cycles must be at least 1");
    }
}
