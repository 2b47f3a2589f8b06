//! Telemetry and lifecycle events.
//!
//! Every event published by an [`InstrumentHandle`](crate::handler::InstrumentHandle)
//! is an [`InstrumentEvent`] attributed to a device and, for channel events,
//! a channel. Samples carry one of three [`Provenance`]s which are never
//! merged: *active* data belongs to the running experiment, *idle* data is
//! background sampling (manual mode readout), *recovery* data is replayed
//! from device-side storage after an interrupted run.
//!
//! Within one channel and one provenance, delivered sample timestamps never
//! decrease. [`OrderingGuard`] enforces this at the dispatcher.

use crate::error::{InstrumentError, InstrumentResult};
use crate::experiment::ExperimentNode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::broadcast;

// =============================================================================
// Samples
// =============================================================================

/// One DC measurement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DcSample {
    /// Seconds since the start of the run (or of idle sampling)
    pub timestamp: f64,
    /// Working electrode potential (V)
    pub working_electrode_voltage: f64,
    /// Counter electrode potential (V)
    pub counter_electrode_voltage: f64,
    /// Cell current (A)
    pub current: f64,
    /// Channel temperature (°C)
    pub temperature: f64,
}

/// One impedance measurement at a single frequency.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AcSample {
    /// Seconds since the start of the run
    pub timestamp: f64,
    /// Perturbation frequency (Hz)
    pub frequency: f64,
    /// |Z| (Ω)
    pub absolute_impedance: f64,
    /// Re(Z) (Ω)
    pub real_impedance: f64,
    /// Im(Z) (Ω)
    pub imag_impedance: f64,
    /// Phase angle (degrees)
    pub phase_angle: f64,
    /// Total harmonic distortion (%)
    pub total_harmonic_distortion: f64,
    /// Cycles averaged for this point
    pub number_of_cycles: u32,
    /// DC bias potential (V)
    pub working_electrode_dc_voltage: f64,
    /// DC bias current (A)
    pub dc_current: f64,
    /// AC current amplitude (A)
    pub current_amplitude: f64,
    /// AC voltage amplitude (V)
    pub voltage_amplitude: f64,
}

/// A DC or AC measurement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Sample {
    /// Direct-current reading
    Dc(DcSample),
    /// Impedance reading
    Ac(AcSample),
}

impl Sample {
    /// Sample timestamp in seconds.
    pub fn timestamp(&self) -> f64 {
        match self {
            Sample::Dc(s) => s.timestamp,
            Sample::Ac(s) => s.timestamp,
        }
    }
}

/// Origin of a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    /// Produced by the running experiment
    Active,
    /// Background sampling outside an experiment
    Idle,
    /// Replayed from device storage after an interruption
    Recovery,
}

impl Provenance {
    fn index(self) -> usize {
        match self {
            Provenance::Active => 0,
            Provenance::Idle => 1,
            Provenance::Recovery => 2,
        }
    }
}

// =============================================================================
// Events
// =============================================================================

/// Why a run ended. Exactly one is published per run.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "reason", content = "message", rename_all = "snake_case")]
pub enum StopReason {
    /// The program ran to the end
    #[default]
    Completed,
    /// Stopped by the host
    UserRequested,
    /// Forced stop after a device fault or limit trip
    DeviceError(String),
    /// The device went away mid-run
    Disconnected,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::Completed => write!(f, "completed"),
            StopReason::UserRequested => write!(f, "user requested"),
            StopReason::DeviceError(msg) => write!(f, "device error: {msg}"),
            StopReason::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// What happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventKind {
    /// The device started a new step of the uploaded program
    NewElementStarting {
        /// Position of the step in the experiment
        node: ExperimentNode,
    },
    /// DC data measured by the running program
    ActiveDcData {
        /// The reading
        sample: DcSample,
    },
    /// AC data measured by the running program
    ActiveAcData {
        /// The reading
        sample: AcSample,
    },
    /// DC data from idle sampling or manual mode
    IdleDcData {
        /// The reading
        sample: DcSample,
    },
    /// Recovered DC data, tagged with the step it was measured in
    RecoveryDcData {
        /// Step the reading belongs to
        node: ExperimentNode,
        /// The reading
        sample: DcSample,
    },
    /// Recovered AC data, tagged with the step it was measured in
    RecoveryAcData {
        /// Step the reading belongs to
        node: ExperimentNode,
        /// The reading
        sample: AcSample,
    },
    /// The run ended; published once per run
    ExperimentStopped {
        /// Why it ended
        reason: StopReason,
    },
    /// The device paused the program
    ExperimentPaused,
    /// The device resumed the program
    ExperimentResumed,
    /// Spontaneous device fault
    DeviceError {
        /// Device's description of the fault
        message: String,
    },
    /// Outcome of erasing the device's recovery data
    RecoveryDataErased {
        /// True if the device erased it
        success: bool,
    },
    /// Device-level; published without a channel
    GroundFloatChanged {
        /// True while the instrument ground floats
        floating: bool,
    },
    /// Device-level; the last event a handle publishes
    DeviceDisconnected,
}

impl EventKind {
    /// Provenance for sample events, `None` for lifecycle events.
    pub fn provenance(&self) -> Option<Provenance> {
        match self {
            EventKind::ActiveDcData { .. } | EventKind::ActiveAcData { .. } => {
                Some(Provenance::Active)
            }
            EventKind::IdleDcData { .. } => Some(Provenance::Idle),
            EventKind::RecoveryDcData { .. } | EventKind::RecoveryAcData { .. } => {
                Some(Provenance::Recovery)
            }
            _ => None,
        }
    }
}

/// An event attributed to a device and optionally a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentEvent {
    /// Device name
    pub device: String,
    /// Channel, for channel-scoped events
    pub channel: Option<u8>,
    /// Payload
    pub kind: EventKind,
}

impl InstrumentEvent {
    pub(crate) fn channel(device: &str, channel: u8, kind: EventKind) -> Self {
        Self {
            device: device.to_string(),
            channel: Some(channel),
            kind,
        }
    }

    pub(crate) fn device(device: &str, kind: EventKind) -> Self {
        Self {
            device: device.to_string(),
            channel: None,
            kind,
        }
    }

    /// True if this event concerns `channel` (device-level events concern all).
    pub fn concerns(&self, channel: u8) -> bool {
        self.channel.map_or(true, |c| c == channel)
    }
}

/// Firmware update progress reported by the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FirmwareStatus {
    /// The device accepted the update
    Started,
    /// Transfer progress
    Progress {
        /// 0 to 100
        percent: u8,
    },
    /// The device reported 100 %
    Completed,
    /// The update did not finish
    Failed {
        /// Reason
        message: String,
    },
}

/// Registry lifecycle events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RegistryEvent {
    /// A device has been opened and identified
    DeviceConnected {
        /// Device name
        name: String,
        /// Port it was opened on
        port: String,
    },
    /// A connected device went away
    DeviceDisconnected {
        /// Device name
        name: String,
    },
    /// Firmware update progress on a port
    FirmwareUpdate {
        /// Port being updated
        port: String,
        /// Current status
        status: FirmwareStatus,
    },
}

// =============================================================================
// Ordering guard
// =============================================================================

/// Per-provenance high-water mark of delivered sample timestamps.
#[derive(Debug, Clone, Default)]
pub struct OrderingGuard {
    last: [Option<f64>; 3],
}

impl OrderingGuard {
    /// Forget the high-water mark of one provenance.
    pub fn reset(&mut self, provenance: Provenance) {
        self.last[provenance.index()] = None;
    }

    /// Record `timestamp` if it is finite and does not regress. Returns
    /// whether to deliver.
    pub fn admit(&mut self, provenance: Provenance, timestamp: f64) -> bool {
        if !timestamp.is_finite() {
            return false;
        }
        let slot = &mut self.last[provenance.index()];
        match *slot {
            Some(previous) if timestamp < previous => false,
            _ => {
                *slot = Some(timestamp);
                true
            }
        }
    }
}

// =============================================================================
// Completion waiter
// =============================================================================

/// Awaits the `ExperimentStopped` event of one channel.
///
/// Obtain one with [`InstrumentHandle::completion_waiter`](crate::handler::InstrumentHandle::completion_waiter)
/// *before* starting the run so the stop cannot be missed.
#[derive(Debug)]
pub struct CompletionWaiter {
    device: String,
    channel: u8,
    events: broadcast::Receiver<InstrumentEvent>,
}

impl CompletionWaiter {
    pub(crate) fn new(
        device: String,
        channel: u8,
        events: broadcast::Receiver<InstrumentEvent>,
    ) -> Self {
        Self {
            device,
            channel,
            events,
        }
    }

    /// Wait for the run on this channel to stop.
    ///
    /// # Errors
    ///
    /// - [`InstrumentError::FailedRequest`] if `timeout` elapses first.
    /// - [`InstrumentError::DeviceNotFound`] if the device goes away without
    ///   a stop event for this channel.
    pub async fn wait(mut self, timeout: Duration) -> InstrumentResult<StopReason> {
        let channel = self.channel;
        let wait = async {
            loop {
                match self.events.recv().await {
                    Ok(event) if event.channel == Some(channel) => {
                        if let EventKind::ExperimentStopped { reason } = event.kind {
                            return Ok(reason);
                        }
                    }
                    Ok(event) if event.kind == EventKind::DeviceDisconnected => {
                        return Err(InstrumentError::DeviceNotFound(event.device));
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            device = %self.device,
                            channel,
                            skipped,
                            "Completion waiter lagged behind event stream"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(InstrumentError::DeviceNotFound(self.device.clone()));
                    }
                }
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(InstrumentError::FailedRequest(format!(
                "channel {channel} did not stop within {timeout:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_drops_regressions_per_provenance() {
        let mut guard = OrderingGuard::default();
        assert!(guard.admit(Provenance::Active, 1.0));
        assert!(guard.admit(Provenance::Active, 1.0));
        assert!(!guard.admit(Provenance::Active, 0.5));
        // Other provenances are independent.
        assert!(guard.admit(Provenance::Idle, 0.1));
        assert!(guard.admit(Provenance::Recovery, 0.0));

        guard.reset(Provenance::Active);
        assert!(guard.admit(Provenance::Active, 0.0));
    }

    #[test]
    fn guard_refuses_non_finite_timestamps() {
        let mut guard = OrderingGuard::default();
        assert!(guard.admit(Provenance::Active, 2.0));
        assert!(!guard.admit(Provenance::Active, f64::NAN));
        assert!(!guard.admit(Provenance::Active, f64::INFINITY));
        // The high-water mark survives the rejected values.
        assert!(!guard.admit(Provenance::Active, 1.0));
        assert!(guard.admit(Provenance::Active, 3.0));
        assert!(!guard.admit(Provenance::Idle, f64::NAN));
    }

    #[test]
    fn provenance_of_kinds() {
        let sample = DcSample {
            timestamp: 0.0,
            working_electrode_voltage: 0.0,
            counter_electrode_voltage: 0.0,
            current: 0.0,
            temperature: 25.0,
        };
        assert_eq!(
            EventKind::IdleDcData { sample }.provenance(),
            Some(Provenance::Idle)
        );
        assert_eq!(EventKind::ExperimentPaused.provenance(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_returns_stop_reason_for_its_channel() {
        let (tx, rx) = broadcast::channel(16);
        let waiter = CompletionWaiter::new("Plus1000".into(), 1, rx);

        tx.send(InstrumentEvent::channel(
            "Plus1000",
            0,
            EventKind::ExperimentStopped {
                reason: StopReason::UserRequested,
            },
        ))
        .unwrap();
        tx.send(InstrumentEvent::channel(
            "Plus1000",
            1,
            EventKind::ExperimentStopped {
                reason: StopReason::Completed,
            },
        ))
        .unwrap();

        let reason = waiter.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(reason, StopReason::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_times_out() {
        let (_tx, rx) = broadcast::channel::<InstrumentEvent>(4);
        let waiter = CompletionWaiter::new("Plus1000".into(), 0, rx);
        let err = waiter.wait(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, InstrumentError::FailedRequest(_)));
    }
}
