//! Linear sweep elements.

use super::{Potential, RangeSelection, SampleSchedule, Violations};
use serde::{Deserialize, Serialize};

/// Cyclic voltammetry: start → first limit → second limit → … → end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CyclicVoltammetry {
    /// Starting potential
    pub start: Potential,
    /// First vertex potential
    pub first_limit: Potential,
    /// Second vertex potential
    pub second_limit: Potential,
    /// Final potential
    pub end: Potential,
    /// Scan rate (dE/dt)
    pub scan_rate: f64,
    /// Time between samples
    pub sampling_interval: f64,
    /// Cycles between the two limits
    pub cycles: u32,
    /// Quiet time at the start potential before the sweep
    pub quiet_time: f64,
    /// Time between samples during the quiet time
    pub quiet_time_sampling_interval: f64,
    /// Current range selection
    pub current_range: RangeSelection,
    /// Fraction of each sampling interval used for averaging
    pub alpha_factor: f64,
}

impl CyclicVoltammetry {
    /// Create a single-cycle CV without quiet time.
    pub fn new(
        start: Potential,
        first_limit: Potential,
        second_limit: Potential,
        end: Potential,
        scan_rate: f64,
        sampling_interval: f64,
    ) -> Self {
        Self {
            start,
            first_limit,
            second_limit,
            end,
            scan_rate,
            sampling_interval,
            cycles: 1,
            quiet_time: 0.0,
            quiet_time_sampling_interval: 0.1,
            current_range: RangeSelection::Auto,
            alpha_factor: 0.5,
        }
    }

    /// Total swept potential over all legs.
    pub fn swept_potential(&self) -> f64 {
        let lead_in = (self.first_limit.volts - self.start.volts).abs();
        let cycle = 2.0 * (self.second_limit.volts - self.first_limit.volts).abs();
        let lead_out = (self.end.volts - self.first_limit.volts).abs();
        lead_in + f64::from(self.cycles) * cycle + lead_out
    }

    pub(super) fn schedule(&self) -> SampleSchedule {
        let sweep = self.swept_potential() / self.scan_rate.abs().max(f64::EPSILON);
        SampleSchedule::paced(sweep + self.quiet_time.max(0.0), self.sampling_interval)
    }

    pub(super) fn check(&self, v: &mut Violations) {
        v.positive("scan rate", self.scan_rate);
        v.interval("sampling interval", self.sampling_interval);
        v.rule(self.cycles >= 1, "cycles must be at least 1");
        v.non_negative("quiet time", self.quiet_time);
        if self.quiet_time > 0.0 {
            v.positive(
                "quiet time sampling interval",
                self.quiet_time_sampling_interval,
            );
        }
        v.rule(
            self.first_limit.volts != self.second_limit.volts
                || self.first_limit.vs_ocp != self.second_limit.vs_ocp,
            "first and second limits must differ",
        );
        v.fraction("alpha factor", self.alpha_factor);
        v.range("approximate maximum current", self.current_range);
    }
}

/// Linear potential sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DcPotentialSweep {
    /// Starting potential
    pub start: Potential,
    /// Final potential
    pub end: Potential,
    /// Scan rate (dE/dt)
    pub scan_rate: f64,
    /// Time between samples
    pub sampling_interval: f64,
    /// Quiet time at the start potential before the sweep
    pub quiet_time: f64,
    /// Time between samples during the quiet time
    pub quiet_time_sampling_interval: f64,
    /// Stop if |I| rises above this value
    pub max_abs_current: Option<f64>,
    /// Stop if |I| falls below this value
    pub min_abs_current: Option<f64>,
    /// Current range selection
    pub current_range: RangeSelection,
    /// Fraction of each sampling interval used for averaging
    pub alpha_factor: f64,
}

impl DcPotentialSweep {
    /// Create a sweep without quiet time or stop conditions.
    pub fn new(start: Potential, end: Potential, scan_rate: f64, sampling_interval: f64) -> Self {
        Self {
            start,
            end,
            scan_rate,
            sampling_interval,
            quiet_time: 0.0,
            quiet_time_sampling_interval: 0.1,
            max_abs_current: None,
            min_abs_current: None,
            current_range: RangeSelection::Auto,
            alpha_factor: 0.5,
        }
    }

    pub(super) fn schedule(&self) -> SampleSchedule {
        let sweep = (self.end.volts - self.start.volts).abs() / self.scan_rate.abs().max(f64::EPSILON);
        SampleSchedule::paced(sweep + self.quiet_time.max(0.0), self.sampling_interval)
    }

    pub(super) fn check(&self, v: &mut Violations) {
        v.positive("scan rate", self.scan_rate);
        v.interval("sampling interval", self.sampling_interval);
        v.non_negative("quiet time", self.quiet_time);
        if let (Some(min), Some(max)) = (self.min_abs_current, self.max_abs_current) {
            v.ordered("minimum absolute current", min, "maximum absolute current", max);
        }
        v.fraction("alpha factor", self.alpha_factor);
        v.range("approximate maximum current", self.current_range);
    }
}

/// Linear current sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DcCurrentSweep {
    /// Starting current (A)
    pub start_current: f64,
    /// Final current (A)
    pub end_current: f64,
    /// Scan rate (dI/dt)
    pub scan_rate: f64,
    /// Time between samples
    pub sampling_interval: f64,
    /// Quiet time at the start current before the sweep
    pub quiet_time: f64,
    /// Time between samples during the quiet time
    pub quiet_time_sampling_interval: f64,
    /// Stop if the voltage rises above this value
    pub max_voltage: Option<f64>,
    /// Stop if the voltage falls below this value
    pub min_voltage: Option<f64>,
    /// Fraction of each sampling interval used for averaging
    pub alpha_factor: f64,
}

impl DcCurrentSweep {
    /// Create a sweep without quiet time or stop conditions.
    pub fn new(start_current: f64, end_current: f64, scan_rate: f64, sampling_interval: f64) -> Self {
        Self {
            start_current,
            end_current,
            scan_rate,
            sampling_interval,
            quiet_time: 0.0,
            quiet_time_sampling_interval: 0.1,
            max_voltage: None,
            min_voltage: None,
            alpha_factor: 0.5,
        }
    }

    pub(super) fn schedule(&self) -> SampleSchedule {
        let sweep =
            (self.end_current - self.start_current).abs() / self.scan_rate.abs().max(f64::EPSILON);
        SampleSchedule::paced(sweep + self.quiet_time.max(0.0), self.sampling_interval)
    }

    pub(super) fn check(&self, v: &mut Violations) {
        v.positive("scan rate", self.scan_rate);
        v.interval("sampling interval", self.sampling_interval);
        v.non_negative("quiet time", self.quiet_time);
        if let (Some(min), Some(max)) = (self.min_voltage, self.max_voltage) {
            v.ordered("minimum voltage", min, "maximum voltage", max);
        }
        v.fraction("alpha factor", self.alpha_factor);
    }
}
