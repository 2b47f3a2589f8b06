//! Dummy cell model used by the simulated instrument.
//!
//! DC behavior is a resistor in series with a fixed open-circuit potential.
//! Impedance behavior is a simplified Randles circuit: solution resistance in
//! series with a charge-transfer resistance parallel to a double-layer
//! capacitance.

use crate::elements::{step_levels, CyclicVoltammetry, Element, Potential};
use crate::events::{AcSample, DcSample, Sample};
use crate::session::ManualSetpoint;

/// Electrical model the simulator measures.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimCell {
    /// Open-circuit potential (V)
    pub open_circuit: f64,
    /// DC load resistance (Ω)
    pub resistance: f64,
    /// Reported temperature (°C)
    pub temperature: f64,
    /// Randles solution resistance (Ω)
    pub solution_resistance: f64,
    /// Randles charge-transfer resistance (Ω)
    pub charge_transfer_resistance: f64,
    /// Randles double-layer capacitance (F)
    pub double_layer_capacitance: f64,
}

impl Default for SimCell {
    fn default() -> Self {
        Self {
            open_circuit: 0.25,
            resistance: 1_000.0,
            temperature: 25.0,
            solution_resistance: 100.0,
            charge_transfer_resistance: 1_000.0,
            double_layer_capacitance: 1e-6,
        }
    }
}

fn lerp(start: f64, end: f64, progress: f64) -> f64 {
    start + (end - start) * progress
}

/// Level held during sample `index` of a staircase from `start` to `end`.
fn staircase(start: f64, end: f64, step: f64, index: u64, samples: u64) -> f64 {
    let levels = step_levels(start, end, step);
    let level = (index as f64 / samples.max(1) as f64 * levels)
        .floor()
        .min(levels - 1.0);
    let value = start + (end - start).signum() * step.abs() * level;
    if end >= start {
        value.min(end)
    } else {
        value.max(end)
    }
}

impl SimCell {
    fn resolve(&self, potential: &Potential) -> f64 {
        if potential.vs_ocp {
            potential.volts + self.open_circuit
        } else {
            potential.volts
        }
    }

    fn dc(&self, timestamp: f64, voltage: f64, current: f64) -> DcSample {
        DcSample {
            timestamp,
            working_electrode_voltage: voltage,
            counter_electrode_voltage: -voltage / 2.0,
            current,
            temperature: self.temperature,
        }
    }

    fn at_potential(&self, timestamp: f64, voltage: f64) -> DcSample {
        self.dc(timestamp, voltage, (voltage - self.open_circuit) / self.resistance)
    }

    fn at_current(&self, timestamp: f64, current: f64) -> DcSample {
        self.dc(timestamp, self.open_circuit + current * self.resistance, current)
    }

    /// Resting reading used for idle sampling.
    pub fn idle(&self, timestamp: f64) -> DcSample {
        self.dc(timestamp, self.open_circuit, 0.0)
    }

    /// Reading while holding a manual setpoint.
    pub fn manual(&self, setpoint: ManualSetpoint, timestamp: f64) -> DcSample {
        match setpoint {
            ManualSetpoint::Voltage(v) => self.at_potential(timestamp, v),
            ManualSetpoint::Current(i) => self.at_current(timestamp, i),
            ManualSetpoint::OpenCircuit => self.idle(timestamp),
        }
    }

    fn randles(&self, frequency: f64) -> (f64, f64) {
        let omega = 2.0 * std::f64::consts::PI * frequency;
        let rct = self.charge_transfer_resistance;
        let x = omega * rct * self.double_layer_capacitance;
        let denom = 1.0 + x * x;
        let real = self.solution_resistance + rct / denom;
        let imag = -rct * x / denom;
        (real, imag)
    }

    fn impedance(
        &self,
        timestamp: f64,
        frequency: f64,
        cycles: u32,
        bias_voltage: f64,
        bias_current: f64,
        excitation: Excitation,
    ) -> AcSample {
        let (real, imag) = self.randles(frequency);
        let magnitude = real.hypot(imag);
        let (voltage_amplitude, current_amplitude) = match excitation {
            Excitation::Voltage(v) => (v, v / magnitude),
            Excitation::Current(i) => (i * magnitude, i),
        };
        AcSample {
            timestamp,
            frequency,
            absolute_impedance: magnitude,
            real_impedance: real,
            imag_impedance: imag,
            phase_angle: imag.atan2(real).to_degrees(),
            total_harmonic_distortion: 0.1,
            number_of_cycles: cycles,
            working_electrode_dc_voltage: bias_voltage,
            dc_current: bias_current,
            current_amplitude,
            voltage_amplitude,
        }
    }

    /// Sample `index` of `samples` while executing `element`.
    pub fn measure(&self, element: &Element, index: u64, samples: u64, timestamp: f64) -> Sample {
        let progress = if samples == 0 {
            1.0
        } else {
            (index + 1) as f64 / samples as f64
        };
        let dc = match element {
            Element::OpenCircuit(_) => self.idle(timestamp),
            Element::ConstantCurrent(e) => self.at_current(timestamp, e.current),
            Element::ConstantPotential(e) => self.at_potential(timestamp, self.resolve(&e.potential)),
            Element::ConstantPower(e) => {
                let magnitude = (e.power.abs() * self.resistance).sqrt();
                let sign = if e.is_charge { 1.0 } else { -1.0 };
                let current = sign * magnitude / self.resistance;
                self.at_current(timestamp, current)
            }
            Element::ConstantResistance(e) => {
                let current = -self.open_circuit / (self.resistance + e.resistance.max(f64::EPSILON));
                self.at_current(timestamp, current)
            }
            Element::CyclicVoltammetry(e) => {
                self.at_potential(timestamp, self.cv_potential(e, progress))
            }
            Element::DcPotentialSweep(e) => self.at_potential(
                timestamp,
                lerp(self.resolve(&e.start), self.resolve(&e.end), progress),
            ),
            Element::DcCurrentSweep(e) => {
                self.at_current(timestamp, lerp(e.start_current, e.end_current, progress))
            }
            Element::DifferentialPulse(e) => self.at_potential(
                timestamp,
                lerp(self.resolve(&e.start), self.resolve(&e.end), progress) + e.pulse_height,
            ),
            Element::NormalPulse(e) => self.at_potential(
                timestamp,
                lerp(self.resolve(&e.start), self.resolve(&e.end), progress),
            ),
            Element::SquareWave(e) => {
                let sign = if index % 2 == 0 { 1.0 } else { -1.0 };
                self.at_potential(
                    timestamp,
                    lerp(self.resolve(&e.start), self.resolve(&e.end), progress) + sign * e.amplitude,
                )
            }
            Element::SteppedVoltage(e) => self.at_potential(
                timestamp,
                staircase(self.resolve(&e.start), self.resolve(&e.end), e.step, index, samples),
            ),
            Element::SteppedCurrent(e) => self.at_current(
                timestamp,
                staircase(e.start_current, e.end_current, e.step, index, samples),
            ),
            Element::EisPotentiostatic(e) => {
                let bias = self.resolve(&e.bias);
                let frequency = log_frequency(e.start_frequency, e.end_frequency, index, samples);
                return Sample::Ac(self.impedance(
                    timestamp,
                    frequency,
                    1,
                    bias,
                    (bias - self.open_circuit) / self.resistance,
                    Excitation::Voltage(e.amplitude),
                ));
            }
            Element::EisGalvanostatic(e) => {
                let frequency = log_frequency(e.start_frequency, e.end_frequency, index, samples);
                return Sample::Ac(self.impedance(
                    timestamp,
                    frequency,
                    e.minimum_cycles,
                    self.open_circuit + e.bias_current * self.resistance,
                    e.bias_current,
                    Excitation::Current(e.amplitude),
                ));
            }
        };
        Sample::Dc(dc)
    }

    fn cv_potential(&self, cv: &CyclicVoltammetry, progress: f64) -> f64 {
        let start = self.resolve(&cv.start);
        let first = self.resolve(&cv.first_limit);
        let second = self.resolve(&cv.second_limit);
        let end = self.resolve(&cv.end);

        let mut legs = vec![(start, first)];
        for _ in 0..cv.cycles {
            legs.push((first, second));
            legs.push((second, first));
        }
        legs.push((first, end));

        let total: f64 = legs.iter().map(|(a, b)| (b - a).abs()).sum();
        let mut remaining = total * progress.clamp(0.0, 1.0);
        for (a, b) in &legs {
            let length = (b - a).abs();
            if remaining <= length && length > 0.0 {
                return lerp(*a, *b, remaining / length);
            }
            remaining -= length;
        }
        end
    }
}

#[derive(Debug, Clone, Copy)]
enum Excitation {
    Voltage(f64),
    Current(f64),
}

fn log_frequency(start: f64, end: f64, index: u64, points: u64) -> f64 {
    if points <= 1 || start <= 0.0 || end <= 0.0 {
        return start;
    }
    let fraction = index as f64 / (points - 1) as f64;
    start * (end / start).powf(fraction)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elements::{ConstantCurrent, ConstantPotential, EisPotentiostatic, SteppedVoltage};

    #[test]
    fn ohmic_dc_response() {
        let cell = SimCell::default();
        let cc = Element::from(ConstantCurrent::new(0.001, 1.0, 10.0));
        let Sample::Dc(s) = cell.measure(&cc, 0, 10, 1.0) else {
            panic!("expected DC sample");
        };
        assert!((s.working_electrode_voltage - 1.25).abs() < 1e-9);

        let cp = Element::from(ConstantPotential::new(Potential::vs_ocp(0.1), 1.0, 10.0));
        let Sample::Dc(s) = cell.measure(&cp, 0, 10, 1.0) else {
            panic!("expected DC sample");
        };
        assert!((s.current - 1e-4).abs() < 1e-12);
    }

    #[test]
    fn staircase_holds_each_level() {
        let cell = SimCell::default();
        let steps = Element::from(SteppedVoltage::new(
            Potential::new(0.0),
            Potential::new(0.3),
            0.1,
            2.0,
            0.5,
        ));
        let voltage = |index| match cell.measure(&steps, index, 16, 0.0) {
            Sample::Dc(s) => s.working_electrode_voltage,
            Sample::Ac(_) => panic!("expected DC sample"),
        };
        assert!(voltage(0).abs() < 1e-9);
        assert!(voltage(3).abs() < 1e-9);
        assert!((voltage(4) - 0.1).abs() < 1e-9);
        assert!((voltage(15) - 0.3).abs() < 1e-9);
    }

    #[test]
    fn impedance_approaches_limits() {
        let cell = SimCell::default();
        let eis = Element::from(EisPotentiostatic::new(1e6, 0.01, 5, Potential::new(0.0), 0.01));
        let Sample::Ac(high) = cell.measure(&eis, 0, 41, 0.0) else {
            panic!("expected AC sample");
        };
        let Sample::Ac(low) = cell.measure(&eis, 40, 41, 1.0) else {
            panic!("expected AC sample");
        };
        assert!((high.frequency - 1e6).abs() < 1e-3);
        assert!((high.real_impedance - 100.0).abs() < 1.0);
        assert!((low.real_impedance - 1_100.0).abs() < 1.0);
        assert!(low.phase_angle <= 0.0);
    }
}
