//! Pulse voltammetry elements.

use super::{Potential, RangeSelection, SampleSchedule, Violations};
use serde::{Deserialize, Serialize};

fn pulse_count(start: &Potential, end: &Potential, step: f64) -> f64 {
    ((end.volts - start.volts).abs() / step.abs().max(f64::EPSILON)).ceil().max(1.0)
}

/// Differential pulse voltammetry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DifferentialPulse {
    /// Starting potential
    pub start: Potential,
    /// Final potential
    pub end: Potential,
    /// Potential increment between pulses
    pub step: f64,
    /// Pulse amplitude above the staircase
    pub pulse_height: f64,
    /// Pulse width
    pub pulse_width: f64,
    /// Time between pulse starts
    pub pulse_period: f64,
    /// Current range selection
    pub current_range: RangeSelection,
    /// Fraction of each pulse used for averaging
    pub alpha_factor: f64,
}

impl DifferentialPulse {
    /// Create a DPV record.
    pub fn new(
        start: Potential,
        end: Potential,
        step: f64,
        pulse_height: f64,
        pulse_width: f64,
        pulse_period: f64,
    ) -> Self {
        Self {
            start,
            end,
            step,
            pulse_height,
            pulse_width,
            pulse_period,
            current_range: RangeSelection::Auto,
            alpha_factor: 0.5,
        }
    }

    pub(super) fn schedule(&self) -> SampleSchedule {
        let pulses = pulse_count(&self.start, &self.end, self.step);
        SampleSchedule::paced(pulses * self.pulse_period, self.pulse_period)
    }

    pub(super) fn check(&self, v: &mut Violations) {
        v.positive("potential step", self.step);
        v.finite("pulse height", self.pulse_height);
        v.positive("pulse width", self.pulse_width);
        v.interval("pulse period", self.pulse_period);
        v.ordered("pulse width", self.pulse_width, "pulse period", self.pulse_period);
        v.fraction("alpha factor", self.alpha_factor);
        v.range("approximate maximum current", self.current_range);
    }
}

/// Normal pulse voltammetry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalPulse {
    /// Starting potential
    pub start: Potential,
    /// Final potential
    pub end: Potential,
    /// Potential increment between pulses
    pub step: f64,
    /// Pulse width
    pub pulse_width: f64,
    /// Time between pulse starts
    pub pulse_period: f64,
    /// Current range selection
    pub current_range: RangeSelection,
}

impl NormalPulse {
    /// Create an NPV record.
    pub fn new(start: Potential, end: Potential, step: f64, pulse_width: f64, pulse_period: f64) -> Self {
        Self {
            start,
            end,
            step,
            pulse_width,
            pulse_period,
            current_range: RangeSelection::Auto,
        }
    }

    pub(super) fn schedule(&self) -> SampleSchedule {
        let pulses = pulse_count(&self.start, &self.end, self.step);
        SampleSchedule::paced(pulses * self.pulse_period, self.pulse_period)
    }

    pub(super) fn check(&self, v: &mut Violations) {
        v.positive("potential step", self.step);
        v.positive("pulse width", self.pulse_width);
        v.interval("pulse period", self.pulse_period);
        v.ordered("pulse width", self.pulse_width, "pulse period", self.pulse_period);
        v.range("approximate maximum current", self.current_range);
    }
}

/// Square wave voltammetry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SquareWave {
    /// Starting potential
    pub start: Potential,
    /// Final potential
    pub end: Potential,
    /// Staircase increment per period
    pub step: f64,
    /// Square wave amplitude
    pub amplitude: f64,
    /// Square wave frequency
    pub frequency: f64,
    /// Current range selection
    pub current_range: RangeSelection,
}

impl SquareWave {
    /// Create an SWV record.
    pub fn new(start: Potential, end: Potential, step: f64, amplitude: f64, frequency: f64) -> Self {
        Self {
            start,
            end,
            step,
            amplitude,
            frequency,
            current_range: RangeSelection::Auto,
        }
    }

    pub(super) fn schedule(&self) -> SampleSchedule {
        let period = 1.0 / self.frequency.abs().max(f64::EPSILON);
        let pulses = pulse_count(&self.start, &self.end, self.step);
        SampleSchedule::paced(pulses * period, period)
    }

    pub(super) fn check(&self, v: &mut Violations) {
        v.positive("potential step", self.step);
        v.positive("amplitude", self.amplitude);
        v.positive("frequency", self.frequency);
        v.range("approximate maximum current", self.current_range);
    }
}
