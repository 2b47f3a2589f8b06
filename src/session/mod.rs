//! Per-channel session state machine.
//!
//! A [`ChannelSession`] tracks one hardware channel: its [`ChannelState`],
//! uploaded program and step cursor, link group membership and configured
//! limits. Sessions are owned by an [`InstrumentHandle`](crate::handler::InstrumentHandle)
//! and reached only through `(device, channel)`.
//!
//! The `check_*` methods are pure guards that produce the error taxonomy for
//! illegal requests without touching the transport. The handle applies the
//! matching transition once the device has acknowledged the command.
//! Spontaneous transitions (completion, faults, disconnects) are applied by
//! the handle's reader task only.

mod channel;
mod link;
mod state;

pub use channel::{ChannelSession, ChannelStatus, RunOutcome, UploadedProgram};
pub(crate) use channel::SampleVerdict;
pub use link::{LinkGroup, LinkMode, LinkRole};
pub use state::ChannelState;

use crate::events::DcSample;
use serde::{Deserialize, Serialize};

/// A configurable channel safety limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitKind {
    /// Working electrode voltage ceiling (V)
    MaxVoltage,
    /// Working electrode voltage floor (V)
    MinVoltage,
    /// Current ceiling (A)
    MaxCurrent,
    /// Current floor (A)
    MinCurrent,
    /// Temperature ceiling (°C)
    MaxTemperature,
}

impl std::fmt::Display for LimitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LimitKind::MaxVoltage => write!(f, "maximum voltage"),
            LimitKind::MinVoltage => write!(f, "minimum voltage"),
            LimitKind::MaxCurrent => write!(f, "maximum current"),
            LimitKind::MinCurrent => write!(f, "minimum current"),
            LimitKind::MaxTemperature => write!(f, "maximum temperature"),
        }
    }
}

/// Limits configured on a channel. Unset limits are not enforced.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ChannelLimits {
    /// See [`LimitKind::MaxVoltage`]
    pub max_voltage: Option<f64>,
    /// See [`LimitKind::MinVoltage`]
    pub min_voltage: Option<f64>,
    /// See [`LimitKind::MaxCurrent`]
    pub max_current: Option<f64>,
    /// See [`LimitKind::MinCurrent`]
    pub min_current: Option<f64>,
    /// See [`LimitKind::MaxTemperature`]
    pub max_temperature: Option<f64>,
}

impl ChannelLimits {
    /// Set one limit.
    pub fn set(&mut self, kind: LimitKind, value: f64) {
        *self.slot(kind) = Some(value);
    }

    /// Read one limit.
    pub fn get(&self, kind: LimitKind) -> Option<f64> {
        match kind {
            LimitKind::MaxVoltage => self.max_voltage,
            LimitKind::MinVoltage => self.min_voltage,
            LimitKind::MaxCurrent => self.max_current,
            LimitKind::MinCurrent => self.min_current,
            LimitKind::MaxTemperature => self.max_temperature,
        }
    }

    /// Clear every limit.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    fn slot(&mut self, kind: LimitKind) -> &mut Option<f64> {
        match kind {
            LimitKind::MaxVoltage => &mut self.max_voltage,
            LimitKind::MinVoltage => &mut self.min_voltage,
            LimitKind::MaxCurrent => &mut self.max_current,
            LimitKind::MinCurrent => &mut self.min_current,
            LimitKind::MaxTemperature => &mut self.max_temperature,
        }
    }

    /// The first limit `sample` violates, if any.
    pub fn violated_by(&self, sample: &DcSample) -> Option<(LimitKind, f64)> {
        let v = sample.working_electrode_voltage;
        let i = sample.current;
        let checks = [
            (LimitKind::MaxVoltage, self.max_voltage.filter(|&max| v > max)),
            (LimitKind::MinVoltage, self.min_voltage.filter(|&min| v < min)),
            (LimitKind::MaxCurrent, self.max_current.filter(|&max| i > max)),
            (LimitKind::MinCurrent, self.min_current.filter(|&min| i < min)),
            (
                LimitKind::MaxTemperature,
                self.max_temperature.filter(|&max| sample.temperature > max),
            ),
        ];
        checks
            .into_iter()
            .find_map(|(kind, hit)| hit.map(|limit| (kind, limit)))
    }
}

/// IR drop compensation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IrCompensation {
    /// Uncompensated resistance (Ω)
    pub resistance: f64,
    /// Fraction compensated, 0 to 100 %
    pub percent: f64,
}

/// Control loop compensation range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompRange {
    /// Range label
    pub name: String,
    /// Bandwidth index, 0 to 10
    pub bandwidth_index: u8,
    /// Stability factor, 0 to 10
    pub stability_factor: u8,
}

/// Largest bandwidth index or stability factor a compensation range accepts.
pub const COMP_RANGE_MAX: u8 = 10;

/// Manual mode setpoint.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "value", rename_all = "snake_case")]
pub enum ManualSetpoint {
    /// Hold this potential (V)
    Voltage(f64),
    /// Hold this current (A)
    Current(f64),
    /// Float at open circuit
    OpenCircuit,
}

/// Manual mode range selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "range", content = "index", rename_all = "snake_case")]
pub enum ManualRange {
    /// Fixed current range from the device's table
    Current(u8),
    /// Current autorange
    CurrentAuto,
    /// Fixed voltage range from the device's table
    Voltage(u8),
    /// Voltage autorange
    VoltageAuto,
}
