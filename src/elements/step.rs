//! Staircase elements: the setpoint moves in fixed increments and is held
//! for a fixed time at each level.

use super::{Potential, RangeSelection, SampleSchedule, Violations};
use serde::{Deserialize, Serialize};

/// Number of levels visited from `start` to `end` in increments of `step`.
pub(crate) fn step_levels(start: f64, end: f64, step: f64) -> f64 {
    // Tolerate ratios like 0.3 / 0.1 landing just below an integer.
    ((end - start).abs() / step.abs().max(f64::EPSILON) + 1e-9).floor() + 1.0
}

/// Potential staircase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SteppedVoltage {
    /// Starting potential
    pub start: Potential,
    /// Final potential
    pub end: Potential,
    /// Potential increment between levels
    pub step: f64,
    /// Hold time at each level
    pub step_duration: f64,
    /// Time between samples
    pub sampling_interval: f64,
    /// Current range selection
    pub current_range: RangeSelection,
}

impl SteppedVoltage {
    /// Create a staircase with autoranged current.
    pub fn new(
        start: Potential,
        end: Potential,
        step: f64,
        step_duration: f64,
        sampling_interval: f64,
    ) -> Self {
        Self {
            start,
            end,
            step,
            step_duration,
            sampling_interval,
            current_range: RangeSelection::Auto,
        }
    }

    pub(super) fn schedule(&self) -> SampleSchedule {
        let levels = step_levels(self.start.volts, self.end.volts, self.step);
        SampleSchedule::paced(levels * self.step_duration.max(0.0), self.sampling_interval)
    }

    pub(super) fn check(&self, v: &mut Violations) {
        v.positive("voltage step", self.step);
        v.positive("step duration", self.step_duration);
        v.interval("sampling interval", self.sampling_interval);
        v.ordered(
            "sampling interval",
            self.sampling_interval,
            "step duration",
            self.step_duration,
        );
        v.range("approximate maximum current", self.current_range);
    }
}

/// Current staircase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SteppedCurrent {
    /// Starting current (A)
    pub start_current: f64,
    /// Final current (A)
    pub end_current: f64,
    /// Current increment between levels
    pub step: f64,
    /// Hold time at each level
    pub step_duration: f64,
    /// Time between samples
    pub sampling_interval: f64,
    /// Approximate highest voltage, used for range selection
    pub approx_max_voltage: Option<f64>,
    /// Approximate lowest voltage, used for range selection
    pub approx_min_voltage: Option<f64>,
}

impl SteppedCurrent {
    /// Create a staircase without voltage hints.
    pub fn new(
        start_current: f64,
        end_current: f64,
        step: f64,
        step_duration: f64,
        sampling_interval: f64,
    ) -> Self {
        Self {
            start_current,
            end_current,
            step,
            step_duration,
            sampling_interval,
            approx_max_voltage: None,
            approx_min_voltage: None,
        }
    }

    pub(super) fn schedule(&self) -> SampleSchedule {
        let levels = step_levels(self.start_current, self.end_current, self.step);
        SampleSchedule::paced(levels * self.step_duration.max(0.0), self.sampling_interval)
    }

    pub(super) fn check(&self, v: &mut Violations) {
        v.finite("start current", self.start_current);
        v.finite("end current", self.end_current);
        v.positive("current step", self.step);
        v.positive("step duration", self.step_duration);
        v.interval("sampling interval", self.sampling_interval);
        v.ordered(
            "sampling interval",
            self.sampling_interval,
            "step duration",
            self.step_duration,
        );
        if let (Some(min), Some(max)) = (self.approx_min_voltage, self.approx_max_voltage) {
            v.ordered("approximate minimum voltage", min, "approximate maximum voltage", max);
        }
    }
}
