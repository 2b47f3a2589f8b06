//! Experiment elements.
//!
//! An [`Element`] is one atomic program unit the instrument executes: hold a
//! potential, sweep a current, run an impedance spectrum. Elements are plain
//! value objects. They are cloned into an [`Experiment`](crate::experiment::Experiment)
//! when appended and serialized into the uploaded program.
//!
//! The set of kinds is closed: the instrument firmware defines a fixed
//! repertoire and the sequencer, the simulated device and the upload path all
//! match exhaustively over [`Element`].
//!
//! # Parameter validity
//!
//! Constructors and setters accept any value. Range checking happens on the
//! device at upload time, which answers
//! [`InvalidParameters`](crate::InstrumentError::InvalidParameters). The
//! domain rules the simulated device enforces are exposed through
//! [`Element::parameter_violations`].
//!
//! # Units
//!
//! Volts, amperes, watts, ohms, seconds, hertz, volts per second (or amperes
//! per second for current sweeps) and amp-hours for capacity.
//!
//! # Example
//!
//! ```
//! use echem_daq::elements::{Element, OpenCircuit};
//!
//! let ocp = Element::from(OpenCircuit::new(10.0, 1.0));
//! assert_eq!(ocp.name(), "Open Circuit Potential");
//! assert_eq!(ocp.categories(), &["Basic Experiments"]);
//! assert!(!ocp.is_impedance());
//! ```

mod dc;
mod impedance;
mod pulse;
mod step;
mod sweep;

pub use dc::{ConstantCurrent, ConstantPotential, ConstantPower, ConstantResistance, OpenCircuit};
pub use impedance::{EisGalvanostatic, EisPotentiostatic};
pub use pulse::{DifferentialPulse, NormalPulse, SquareWave};
pub(crate) use step::step_levels;
pub use step::{SteppedCurrent, SteppedVoltage};
pub use sweep::{CyclicVoltammetry, DcCurrentSweep, DcPotentialSweep};

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Shortest pacing interval the simulated device will schedule.
const MIN_INTERVAL_SECS: f64 = 0.001;

/// Longest sampling interval an instrument accepts, in seconds.
pub const MAX_SAMPLING_INTERVAL_SECS: f64 = 86_400.0;

/// Convert a sampling interval in seconds, or `None` unless it is positive
/// and at most [`MAX_SAMPLING_INTERVAL_SECS`].
pub fn sampling_interval(seconds: f64) -> Option<Duration> {
    if seconds > 0.0 && seconds <= MAX_SAMPLING_INTERVAL_SECS {
        Duration::try_from_secs_f64(seconds).ok()
    } else {
        None
    }
}

// =============================================================================
// Shared parameter types
// =============================================================================

/// A voltage setpoint, optionally referenced to the open-circuit potential.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Potential {
    /// Setpoint in volts
    pub volts: f64,
    /// When true the setpoint is relative to OCP instead of the reference terminal
    pub vs_ocp: bool,
}

impl Potential {
    /// Absolute potential against the reference terminal.
    pub fn new(volts: f64) -> Self {
        Self {
            volts,
            vs_ocp: false,
        }
    }

    /// Potential relative to the open-circuit potential.
    pub fn vs_ocp(volts: f64) -> Self {
        Self {
            volts,
            vs_ocp: true,
        }
    }
}

impl From<f64> for Potential {
    fn from(volts: f64) -> Self {
        Potential::new(volts)
    }
}

/// Current or voltage range selection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RangeSelection {
    /// Let the instrument autorange
    #[default]
    Auto,
    /// Fix the range to the one covering this approximate maximum magnitude
    Approx(f64),
}

/// Pacing of the samples an element produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleSchedule {
    /// Time between consecutive samples
    pub interval: Duration,
    /// Number of samples in one execution of the element
    pub samples: u64,
}

impl SampleSchedule {
    fn paced(duration_secs: f64, interval_secs: f64) -> Self {
        let interval_secs = if interval_secs.is_nan() {
            MIN_INTERVAL_SECS
        } else {
            interval_secs.clamp(MIN_INTERVAL_SECS, MAX_SAMPLING_INTERVAL_SECS)
        };
        let duration_secs = duration_secs.max(0.0);
        let samples = (duration_secs / interval_secs).ceil().max(1.0) as u64;
        Self {
            interval: Duration::from_secs_f64(interval_secs),
            samples,
        }
    }

    /// Total time covered by the schedule.
    pub fn duration(&self) -> Duration {
        self.interval.saturating_mul(u32::try_from(self.samples).unwrap_or(u32::MAX))
    }
}

// =============================================================================
// Element kinds
// =============================================================================

/// Discriminant of [`Element`], carrying the kind's canonical identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementKind {
    /// Rest at open circuit
    OpenCircuit,
    /// Hold a current
    ConstantCurrent,
    /// Hold a potential
    ConstantPotential,
    /// Charge or discharge at constant power
    ConstantPower,
    /// Discharge into a constant resistance
    ConstantResistance,
    /// Cyclic potential sweep between two limits
    CyclicVoltammetry,
    /// Linear potential sweep
    DcPotentialSweep,
    /// Linear current sweep
    DcCurrentSweep,
    /// Differential pulse voltammetry
    DifferentialPulse,
    /// Normal pulse voltammetry
    NormalPulse,
    /// Square wave voltammetry
    SquareWave,
    /// Potential staircase
    SteppedVoltage,
    /// Current staircase
    SteppedCurrent,
    /// Impedance sweep under a potential bias
    EisPotentiostatic,
    /// Impedance sweep under a current bias
    EisGalvanostatic,
}

impl ElementKind {
    /// Display name the instrument family uses for this kind.
    pub fn name(&self) -> &'static str {
        match self {
            ElementKind::OpenCircuit => "Open Circuit Potential",
            ElementKind::ConstantCurrent => "Constant Current, Advanced",
            ElementKind::ConstantPotential => "Constant Potential, Advanced",
            ElementKind::ConstantPower => "Constant Power Charge/Discharge",
            ElementKind::ConstantResistance => "Constant Resistance",
            ElementKind::CyclicVoltammetry => "Cyclic Voltammetry",
            ElementKind::DcPotentialSweep => "DC Potential Linear Sweep",
            ElementKind::DcCurrentSweep => "DC Current Linear Sweep",
            ElementKind::DifferentialPulse => "Differential Pulse Potential Voltammetry",
            ElementKind::NormalPulse => "Normal Pulse Potential Voltammetry",
            ElementKind::SquareWave => "Square Wave Potential Voltammetry",
            ElementKind::SteppedVoltage => "Stepped Voltage",
            ElementKind::SteppedCurrent => "SteppedCurrent",
            ElementKind::EisPotentiostatic => "Potentiostatic EIS",
            ElementKind::EisGalvanostatic => "Galvanostatic EIS",
        }
    }

    /// Category tags, most specific first.
    pub fn categories(&self) -> &'static [&'static str] {
        const POT_BASIC: &[&str] = &["Potentiostatic Control", "Basic Experiments"];
        const GAL_BASIC: &[&str] = &["Galvanostatic Control", "Basic Experiments"];
        const ENERGY: &[&str] = &["Energy Storage", "Charge/Discharge"];
        const POT_PULSE: &[&str] = &[
            "Potentiostatic Control",
            "Basic Voltammetry",
            "Pulse Voltammetry",
        ];

        match self {
            ElementKind::OpenCircuit => &["Basic Experiments"],
            ElementKind::ConstantCurrent => GAL_BASIC,
            ElementKind::ConstantPotential
            | ElementKind::CyclicVoltammetry
            | ElementKind::DcPotentialSweep => POT_BASIC,
            ElementKind::ConstantPower | ElementKind::ConstantResistance => ENERGY,
            ElementKind::DcCurrentSweep => &["Galvanostatic Control", "Basic Voltammetry"],
            ElementKind::DifferentialPulse | ElementKind::NormalPulse => POT_PULSE,
            ElementKind::SquareWave => &["Potentiostatic Control", "Pulse Voltammetry"],
            ElementKind::SteppedVoltage => &["Potentiostatic Control"],
            ElementKind::SteppedCurrent => &["Galvanostatic Control"],
            ElementKind::EisPotentiostatic => &[
                "Potentiostatic Control",
                "Impedance Methods",
                "Basic Experiments",
            ],
            ElementKind::EisGalvanostatic => &[
                "Galvanostatic Control",
                "Impedance Methods",
                "Basic Experiments",
            ],
        }
    }

    /// True for kinds that produce impedance (AC) samples.
    pub fn is_impedance(&self) -> bool {
        matches!(
            self,
            ElementKind::EisPotentiostatic | ElementKind::EisGalvanostatic
        )
    }
}

/// One executable program unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Element {
    /// Rest at open circuit
    OpenCircuit(OpenCircuit),
    /// Hold a current
    ConstantCurrent(ConstantCurrent),
    /// Hold a potential
    ConstantPotential(ConstantPotential),
    /// Charge or discharge at constant power
    ConstantPower(ConstantPower),
    /// Discharge into a constant resistance
    ConstantResistance(ConstantResistance),
    /// Cyclic potential sweep between two limits
    CyclicVoltammetry(CyclicVoltammetry),
    /// Linear potential sweep
    DcPotentialSweep(DcPotentialSweep),
    /// Linear current sweep
    DcCurrentSweep(DcCurrentSweep),
    /// Differential pulse voltammetry
    DifferentialPulse(DifferentialPulse),
    /// Normal pulse voltammetry
    NormalPulse(NormalPulse),
    /// Square wave voltammetry
    SquareWave(SquareWave),
    /// Potential staircase
    SteppedVoltage(SteppedVoltage),
    /// Current staircase
    SteppedCurrent(SteppedCurrent),
    /// Impedance sweep under a potential bias
    EisPotentiostatic(EisPotentiostatic),
    /// Impedance sweep under a current bias
    EisGalvanostatic(EisGalvanostatic),
}

impl Element {
    /// Kind discriminant.
    pub fn kind(&self) -> ElementKind {
        match self {
            Element::OpenCircuit(_) => ElementKind::OpenCircuit,
            Element::ConstantCurrent(_) => ElementKind::ConstantCurrent,
            Element::ConstantPotential(_) => ElementKind::ConstantPotential,
            Element::ConstantPower(_) => ElementKind::ConstantPower,
            Element::ConstantResistance(_) => ElementKind::ConstantResistance,
            Element::CyclicVoltammetry(_) => ElementKind::CyclicVoltammetry,
            Element::DcPotentialSweep(_) => ElementKind::DcPotentialSweep,
            Element::DcCurrentSweep(_) => ElementKind::DcCurrentSweep,
            Element::DifferentialPulse(_) => ElementKind::DifferentialPulse,
            Element::NormalPulse(_) => ElementKind::NormalPulse,
            Element::SquareWave(_) => ElementKind::SquareWave,
            Element::SteppedVoltage(_) => ElementKind::SteppedVoltage,
            Element::SteppedCurrent(_) => ElementKind::SteppedCurrent,
            Element::EisPotentiostatic(_) => ElementKind::EisPotentiostatic,
            Element::EisGalvanostatic(_) => ElementKind::EisGalvanostatic,
        }
    }

    /// Display name; a pure function of the kind.
    pub fn name(&self) -> &'static str {
        self.kind().name()
    }

    /// Category tags; a pure function of the kind.
    pub fn categories(&self) -> &'static [&'static str] {
        self.kind().categories()
    }

    /// True if this element produces impedance samples rather than DC samples.
    pub fn is_impedance(&self) -> bool {
        self.kind().is_impedance()
    }

    /// How the device paces samples while executing this element.
    pub fn schedule(&self) -> SampleSchedule {
        match self {
            Element::OpenCircuit(e) => e.schedule(),
            Element::ConstantCurrent(e) => e.schedule(),
            Element::ConstantPotential(e) => e.schedule(),
            Element::ConstantPower(e) => e.schedule(),
            Element::ConstantResistance(e) => e.schedule(),
            Element::CyclicVoltammetry(e) => e.schedule(),
            Element::DcPotentialSweep(e) => e.schedule(),
            Element::DcCurrentSweep(e) => e.schedule(),
            Element::DifferentialPulse(e) => e.schedule(),
            Element::NormalPulse(e) => e.schedule(),
            Element::SquareWave(e) => e.schedule(),
            Element::SteppedVoltage(e) => e.schedule(),
            Element::SteppedCurrent(e) => e.schedule(),
            Element::EisPotentiostatic(e) => e.schedule(),
            Element::EisGalvanostatic(e) => e.schedule(),
        }
    }

    /// Nominal execution time of one pass through this element.
    pub fn nominal_duration(&self) -> Duration {
        self.schedule().duration()
    }

    /// Domain rules this element's parameters violate. Empty when valid.
    pub fn parameter_violations(&self) -> Vec<String> {
        let mut v = Violations::default();
        match self {
            Element::OpenCircuit(e) => e.check(&mut v),
            Element::ConstantCurrent(e) => e.check(&mut v),
            Element::ConstantPotential(e) => e.check(&mut v),
            Element::ConstantPower(e) => e.check(&mut v),
            Element::ConstantResistance(e) => e.check(&mut v),
            Element::CyclicVoltammetry(e) => e.check(&mut v),
            Element::DcPotentialSweep(e) => e.check(&mut v),
            Element::DcCurrentSweep(e) => e.check(&mut v),
            Element::DifferentialPulse(e) => e.check(&mut v),
            Element::NormalPulse(e) => e.check(&mut v),
            Element::SquareWave(e) => e.check(&mut v),
            Element::SteppedVoltage(e) => e.check(&mut v),
            Element::SteppedCurrent(e) => e.check(&mut v),
            Element::EisPotentiostatic(e) => e.check(&mut v),
            Element::EisGalvanostatic(e) => e.check(&mut v),
        }
        v.into_messages(self.name())
    }
}

macro_rules! impl_from_record {
    ($($variant:ident),* $(,)?) => {
        $(
            impl From<$variant> for Element {
                fn from(value: $variant) -> Self {
                    Element::$variant(value)
                }
            }
        )*
    };
}

impl_from_record!(
    OpenCircuit,
    ConstantCurrent,
    ConstantPotential,
    ConstantPower,
    ConstantResistance,
    CyclicVoltammetry,
    DcPotentialSweep,
    DcCurrentSweep,
    DifferentialPulse,
    NormalPulse,
    SquareWave,
    SteppedVoltage,
    SteppedCurrent,
    EisPotentiostatic,
    EisGalvanostatic,
);

// =============================================================================
// Parameter checks
// =============================================================================

/// Accumulates violated parameter rules for one element.
#[derive(Debug, Default)]
pub(crate) struct Violations(Vec<String>);

impl Violations {
    pub(crate) fn positive(&mut self, field: &str, value: f64) {
        if !(value.is_finite() && value > 0.0) {
            self.0.push(format!("{field} must be positive (got {value})"));
        }
    }

    pub(crate) fn interval(&mut self, field: &str, value: f64) {
        if sampling_interval(value).is_none() {
            self.0.push(format!(
                "{field} must be positive and at most {MAX_SAMPLING_INTERVAL_SECS} s (got {value})"
            ));
        }
    }

    pub(crate) fn non_negative(&mut self, field: &str, value: f64) {
        if !(value.is_finite() && value >= 0.0) {
            self.0.push(format!("{field} must not be negative (got {value})"));
        }
    }

    pub(crate) fn finite(&mut self, field: &str, value: f64) {
        if !value.is_finite() {
            self.0.push(format!("{field} must be finite (got {value})"));
        }
    }

    pub(crate) fn fraction(&mut self, field: &str, value: f64) {
        if !(0.0..=1.0).contains(&value) {
            self.0.push(format!("{field} must be within 0..=1 (got {value})"));
        }
    }

    pub(crate) fn ordered(&mut self, low_field: &str, low: f64, high_field: &str, high: f64) {
        if low > high {
            self.0
                .push(format!("{low_field} ({low}) exceeds {high_field} ({high})"));
        }
    }

    pub(crate) fn range(&mut self, field: &str, range: RangeSelection) {
        if let RangeSelection::Approx(magnitude) = range {
            self.positive(field, magnitude);
        }
    }

    pub(crate) fn rule(&mut self, ok: bool, message: impl Into<String>) {
        if !ok {
            self.0.push(message.into());
        }
    }

    fn into_messages(self, element: &str) -> Vec<String> {
        self.0
            .into_iter()
            .map(|m| format!("{element}: {m}"))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_and_categories_are_kind_functions() {
        let a = Element::from(ConstantCurrent::new(0.001, 1.0, 60.0));
        let b = Element::from(ConstantCurrent::new(-0.5, 0.2, 3.0));
        assert_eq!(a.name(), b.name());
        assert_eq!(a.categories(), b.categories());
        assert_eq!(a.categories()[0], "Galvanostatic Control");
    }

    #[test]
    fn impedance_kinds_are_flagged() {
        let eis = Element::from(EisPotentiostatic::new(10_000.0, 1.0, 10, 0.0.into(), 0.01));
        assert!(eis.is_impedance());
        assert!(!Element::from(OpenCircuit::new(1.0, 0.1)).is_impedance());
    }

    #[test]
    fn schedule_paces_by_sampling_interval() {
        let ocp = Element::from(OpenCircuit::new(10.0, 1.0));
        let schedule = ocp.schedule();
        assert_eq!(schedule.interval, Duration::from_secs(1));
        assert_eq!(schedule.samples, 10);
        assert_eq!(ocp.nominal_duration(), Duration::from_secs(10));
    }

    #[test]
    fn out_of_range_values_are_accepted_but_reported() {
        let bad = Element::from(OpenCircuit::new(10.0, -1.0));
        let violations = bad.parameter_violations();
        assert_eq!(violations.len(), 1);
        assert!(violations[0].contains("sampling interval"));
        // Schedule stays well-defined for nonsense inputs.
        assert!(bad.schedule().samples >= 1);
    }

    #[test]
    fn oversized_intervals_are_reported_and_schedule_stays_bounded() {
        let slow = Element::from(OpenCircuit::new(10.0, 1e300));
        let violations = slow.parameter_violations();
        assert_eq!(violations.len(), 1);
        assert!(violations[0].contains("at most"));
        assert_eq!(
            slow.schedule().interval,
            Duration::from_secs_f64(MAX_SAMPLING_INTERVAL_SECS)
        );
        assert!(Element::from(OpenCircuit::new(1.0, f64::NAN)).schedule().interval > Duration::ZERO);

        assert_eq!(sampling_interval(0.5), Some(Duration::from_millis(500)));
        assert_eq!(sampling_interval(1e300), None);
        assert_eq!(sampling_interval(f64::NAN), None);
        assert_eq!(sampling_interval(0.0), None);
    }

    #[test]
    fn serde_tags_by_kind() {
        let element = Element::from(OpenCircuit::new(5.0, 0.5));
        let json = serde_json::to_value(&element).unwrap();
        assert_eq!(json["kind"], "open_circuit");
        let back: Element = serde_json::from_value(json).unwrap();
        assert_eq!(back, element);
    }
}
