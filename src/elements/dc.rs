//! Constant-setpoint elements: open circuit, constant current/potential,
//! constant power and constant resistance.

use super::{Potential, RangeSelection, SampleSchedule, Violations};
use serde::{Deserialize, Serialize};

/// Record the open-circuit potential.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenCircuit {
    /// Total duration
    pub duration: f64,
    /// Time between samples
    pub sampling_interval: f64,
    /// Stop if the potential rises above this value
    pub max_voltage: Option<f64>,
    /// Stop if the potential falls below this value
    pub min_voltage: Option<f64>,
    /// Stop once |dV/dt| falls below this value
    pub min_dvdt: Option<f64>,
    /// Voltage range selection
    pub voltage_range: RangeSelection,
}

impl OpenCircuit {
    /// Create an OCP record with no stop conditions.
    pub fn new(duration: f64, sampling_interval: f64) -> Self {
        Self {
            duration,
            sampling_interval,
            max_voltage: None,
            min_voltage: None,
            min_dvdt: None,
            voltage_range: RangeSelection::Auto,
        }
    }

    pub(super) fn schedule(&self) -> SampleSchedule {
        SampleSchedule::paced(self.duration, self.sampling_interval)
    }

    pub(super) fn check(&self, v: &mut Violations) {
        v.non_negative("duration", self.duration);
        v.interval("sampling interval", self.sampling_interval);
        if let (Some(min), Some(max)) = (self.min_voltage, self.max_voltage) {
            v.ordered("minimum voltage", min, "maximum voltage", max);
        }
        if let Some(dvdt) = self.min_dvdt {
            v.non_negative("minimum dV/dt", dvdt);
        }
        v.range("approximate maximum voltage", self.voltage_range);
    }
}

/// Hold a constant current.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstantCurrent {
    /// Current setpoint
    pub current: f64,
    /// Time between samples
    pub sampling_interval: f64,
    /// Total duration
    pub duration: f64,
    /// Also sample whenever the voltage moves by at least this much
    pub min_sampling_voltage_difference: Option<f64>,
    /// Stop if the voltage rises above this value
    pub max_voltage: Option<f64>,
    /// Stop if the voltage falls below this value
    pub min_voltage: Option<f64>,
    /// Hard cap on the duration
    pub max_duration: Option<f64>,
    /// Stop once this charge has passed
    pub max_capacity: Option<f64>,
    /// Current range selection
    pub current_range: RangeSelection,
    /// Voltage range selection
    pub voltage_range: RangeSelection,
}

impl ConstantCurrent {
    /// Create a constant-current record with no stop conditions.
    pub fn new(current: f64, sampling_interval: f64, duration: f64) -> Self {
        Self {
            current,
            sampling_interval,
            duration,
            min_sampling_voltage_difference: None,
            max_voltage: None,
            min_voltage: None,
            max_duration: None,
            max_capacity: None,
            current_range: RangeSelection::Auto,
            voltage_range: RangeSelection::Auto,
        }
    }

    pub(super) fn schedule(&self) -> SampleSchedule {
        let duration = match self.max_duration {
            Some(cap) => self.duration.min(cap),
            None => self.duration,
        };
        SampleSchedule::paced(duration, self.sampling_interval)
    }

    pub(super) fn check(&self, v: &mut Violations) {
        v.finite("current", self.current);
        v.interval("sampling interval", self.sampling_interval);
        v.non_negative("duration", self.duration);
        if let (Some(min), Some(max)) = (self.min_voltage, self.max_voltage) {
            v.ordered("minimum voltage", min, "maximum voltage", max);
        }
        if let Some(cap) = self.max_duration {
            v.positive("maximum duration", cap);
        }
        if let Some(capacity) = self.max_capacity {
            v.positive("maximum capacity", capacity);
        }
        v.range("approximate maximum current", self.current_range);
        v.range("approximate maximum voltage", self.voltage_range);
    }
}

/// Hold a constant potential.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstantPotential {
    /// Potential setpoint
    pub potential: Potential,
    /// Time between samples
    pub sampling_interval: f64,
    /// Total duration
    pub duration: f64,
    /// Stop if |I| rises above this value
    pub max_abs_current: Option<f64>,
    /// Stop if |I| falls below this value
    pub min_abs_current: Option<f64>,
    /// Stop once this charge has passed
    pub max_capacity: Option<f64>,
    /// Stop once |dI/dt| falls below this value
    pub min_didt: Option<f64>,
    /// Current range selection
    pub current_range: RangeSelection,
}

impl ConstantPotential {
    /// Create a constant-potential record with no stop conditions.
    pub fn new(potential: Potential, sampling_interval: f64, duration: f64) -> Self {
        Self {
            potential,
            sampling_interval,
            duration,
            max_abs_current: None,
            min_abs_current: None,
            max_capacity: None,
            min_didt: None,
            current_range: RangeSelection::Auto,
        }
    }

    /// Alias of [`max_abs_current`](Self::max_abs_current).
    #[deprecated(note = "use `max_abs_current`")]
    pub fn max_current(&self) -> Option<f64> {
        self.max_abs_current
    }

    /// Alias of setting [`max_abs_current`](Self::max_abs_current).
    #[deprecated(note = "use `max_abs_current`")]
    pub fn set_max_current(&mut self, current: f64) {
        self.max_abs_current = Some(current);
    }

    /// Alias of [`min_abs_current`](Self::min_abs_current).
    #[deprecated(note = "use `min_abs_current`")]
    pub fn min_current(&self) -> Option<f64> {
        self.min_abs_current
    }

    /// Alias of setting [`min_abs_current`](Self::min_abs_current).
    #[deprecated(note = "use `min_abs_current`")]
    pub fn set_min_current(&mut self, current: f64) {
        self.min_abs_current = Some(current);
    }

    pub(super) fn schedule(&self) -> SampleSchedule {
        SampleSchedule::paced(self.duration, self.sampling_interval)
    }

    pub(super) fn check(&self, v: &mut Violations) {
        v.finite("potential", self.potential.volts);
        v.interval("sampling interval", self.sampling_interval);
        v.non_negative("duration", self.duration);
        if let Some(max) = self.max_abs_current {
            v.positive("maximum absolute current", max);
        }
        if let Some(min) = self.min_abs_current {
            v.non_negative("minimum absolute current", min);
        }
        if let (Some(min), Some(max)) = (self.min_abs_current, self.max_abs_current) {
            v.ordered("minimum absolute current", min, "maximum absolute current", max);
        }
        if let Some(capacity) = self.max_capacity {
            v.positive("maximum capacity", capacity);
        }
        v.range("approximate maximum current", self.current_range);
    }
}

/// Charge or discharge at constant power.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstantPower {
    /// Charge when true, discharge otherwise
    pub is_charge: bool,
    /// Power magnitude
    pub power: f64,
    /// Total duration
    pub duration: f64,
    /// Time between samples
    pub sampling_interval: f64,
    /// Stop if the voltage rises above this value
    pub max_voltage: Option<f64>,
    /// Stop if the voltage falls below this value
    pub min_voltage: Option<f64>,
    /// Hard cap on the duration
    pub max_duration: Option<f64>,
    /// Stop once this charge has passed
    pub max_capacity: Option<f64>,
}

impl ConstantPower {
    /// Create a constant-power record with no stop conditions.
    pub fn new(is_charge: bool, power: f64, duration: f64, sampling_interval: f64) -> Self {
        Self {
            is_charge,
            power,
            duration,
            sampling_interval,
            max_voltage: None,
            min_voltage: None,
            max_duration: None,
            max_capacity: None,
        }
    }

    pub(super) fn schedule(&self) -> SampleSchedule {
        let duration = self
            .max_duration
            .map_or(self.duration, |cap| self.duration.min(cap));
        SampleSchedule::paced(duration, self.sampling_interval)
    }

    pub(super) fn check(&self, v: &mut Violations) {
        v.positive("power", self.power);
        v.non_negative("duration", self.duration);
        v.interval("sampling interval", self.sampling_interval);
        if let (Some(min), Some(max)) = (self.min_voltage, self.max_voltage) {
            v.ordered("minimum voltage", min, "maximum voltage", max);
        }
    }
}

/// Charge or discharge through a constant resistance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstantResistance {
    /// Load resistance
    pub resistance: f64,
    /// Total duration
    pub duration: f64,
    /// Time between samples
    pub sampling_interval: f64,
    /// Stop if the voltage rises above this value
    pub max_voltage: Option<f64>,
    /// Stop if the voltage falls below this value
    pub min_voltage: Option<f64>,
    /// Hard cap on the duration
    pub max_duration: Option<f64>,
    /// Stop once this charge has passed
    pub max_capacity: Option<f64>,
}

impl ConstantResistance {
    /// Create a constant-resistance record with no stop conditions.
    pub fn new(resistance: f64, duration: f64, sampling_interval: f64) -> Self {
        Self {
            resistance,
            duration,
            sampling_interval,
            max_voltage: None,
            min_voltage: None,
            max_duration: None,
            max_capacity: None,
        }
    }

    pub(super) fn schedule(&self) -> SampleSchedule {
        let duration = self
            .max_duration
            .map_or(self.duration, |cap| self.duration.min(cap));
        SampleSchedule::paced(duration, self.sampling_interval)
    }

    pub(super) fn check(&self, v: &mut Violations) {
        v.positive("resistance", self.resistance);
        v.non_negative("duration", self.duration);
        v.interval("sampling interval", self.sampling_interval);
        if let (Some(min), Some(max)) = (self.min_voltage, self.max_voltage) {
            v.ordered("minimum voltage", min, "maximum voltage", max);
        }
    }
}
