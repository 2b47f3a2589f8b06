//! Error types for instrument control.
//!
//! This module defines [`InstrumentError`], the error returned by every command
//! on the public surface (registry, instrument handle, experiment upload). Each
//! variant carries a stable numeric [`code`](InstrumentError::code) matching the
//! instrument family's result codes, and an [`ErrorCategory`] so host
//! applications can react by kind rather than by variant.
//!
//! ## Error Hierarchy
//!
//! - **Connectivity**: `DeviceNotFound`, `ConnectionFailed`, `FirmwareNotSupported`,
//!   firmware update outcomes.
//! - **Addressing**: `InvalidChannel`, `ChannelLinked`.
//! - **Contention**: `BusyChannel`, `ChannelNotBusy`, `ExperimentUploaded`,
//!   `ExperimentAlreadyRun`, `ExperimentAlreadyPaused`.
//! - **Program validity**: `ExperimentIsEmpty`, `InvalidParameters`.
//! - **Session state**: `ExperimentNotUploaded`, `ManualExperimentNotRunning`.
//! - **Transport**: `DeviceCommunicationFailed` and the per-operation
//!   `FailedToX` family.
//! - **Unknown**: `Unknown`, `FailedRequest`.
//!
//! Structural errors are produced locally without touching the transport.
//! Transport-dependent errors are produced once the device has answered.
//! [`TransportError`] is the narrower error type of the transport seam.

use crate::session::LimitKind;
use thiserror::Error;

/// Convenience alias for results using the instrument error type.
pub type InstrumentResult<T> = std::result::Result<T, InstrumentError>;

/// Coarse classification of an [`InstrumentError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Device presence, connection, or firmware problems
    Connectivity,
    /// The addressed channel cannot accept this request
    Addressing,
    /// The channel is in use (or not in use) in a way that conflicts
    Contention,
    /// The uploaded program or a parameter is invalid
    ProgramValidity,
    /// The session is not in the state the command requires
    SessionState,
    /// The device did not acknowledge the request
    Transport,
    /// Anything else
    Unknown,
}

/// Operations that can fail on the transport with their own result code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Upload an experiment
    Upload,
    /// Start an uploaded experiment
    Start,
    /// Pause a running experiment
    Pause,
    /// Resume a paused experiment
    Resume,
    /// Stop a running, paused, or manual experiment
    Stop,
    /// Skip the current step
    Skip,
    /// Start manual mode
    StartManual,
    /// Start idle sampling
    StartIdleSampling,
    /// Manual mode constant voltage
    ManualVoltage,
    /// Manual mode constant current
    ManualCurrent,
    /// Manual mode open circuit
    ManualOpenCircuit,
    /// Manual mode sampling interval
    ManualSamplingInterval,
    /// Manual mode current range
    ManualCurrentRange,
    /// Manual mode voltage range
    ManualVoltageRange,
    /// IR compensation
    IrCompensation,
    /// Compensation range
    CompRange,
    /// A channel limit
    Limit(LimitKind),
    /// Reset all channel limits
    ResetLimits,
    /// Link channels
    LinkChannels,
    /// Erase recovery data
    EraseRecoveryData,
    /// Firmware update
    FirmwareUpdate,
}

/// Error returned by device and channel operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InstrumentError {
    /// The port could not be opened or the device did not identify
    #[error("Failed to connect to device: {0}")]
    ConnectionFailed(String),

    /// Firmware is older than the supported floor
    #[error("Device firmware {found} is not supported (minimum {minimum}); update required")]
    FirmwareNotSupported {
        /// Firmware version reported by the device
        found: u32,
        /// Minimum version this library accepts
        minimum: u32,
    },

    /// No firmware image is available for the device
    #[error("Firmware file not found: {0}")]
    FirmwareFileNotFound(String),

    /// The device already runs the offered firmware
    #[error("Device firmware {0} is already up to date")]
    FirmwareUptodate(u32),

    /// A firmware update owns the device
    #[error("Firmware update in progress on {0}")]
    FirmwareUpdateInProgress(String),

    /// Channel number outside the device
    #[error("Invalid channel {0}")]
    InvalidChannel(u8),

    /// Request addressed to a linked slave
    #[error("Channel {channel} is linked; use master channel {master}")]
    ChannelLinked {
        /// Channel the request was addressed to
        channel: u8,
        /// Master channel of its link group
        master: u8,
    },

    /// The channel is running or another command holds it
    #[error("Channel {0} is busy")]
    BusyChannel(u8),

    /// No connected device has this name
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// The device lacks the capability
    #[error("Feature not supported by the device: {0}")]
    FeatureNotSupported(String),

    /// Manual setpoint without manual mode
    #[error("No manual experiment is running on channel {0}")]
    ManualExperimentNotRunning(u8),

    /// Start without an uploaded program
    #[error("No experiment uploaded to channel {0}")]
    ExperimentNotUploaded(u8),

    /// Upload of an experiment with no elements
    #[error("Experiment has no elements")]
    ExperimentIsEmpty,

    /// Element or setting parameters out of domain
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    /// Pause, resume, skip or stop with nothing running
    #[error("No experiment running or paused on channel {0}")]
    ChannelNotBusy(u8),

    /// A program is uploaded where none is allowed
    #[error("An experiment is already uploaded to channel {0}")]
    ExperimentUploaded(u8),

    /// Pause of a paused program
    #[error("Experiment on channel {0} is already paused")]
    ExperimentAlreadyPaused(u8),

    /// Resume or start of a running program
    #[error("Experiment on channel {0} is already running")]
    ExperimentAlreadyRun(u8),

    /// The link to the device failed
    #[error("Device communication failed: {0}")]
    DeviceCommunicationFailed(String),

    /// The device refused or did not answer an operation
    #[error("Failed to {operation}: {reason}")]
    OperationFailed {
        /// Operation that was not acknowledged
        operation: Operation,
        /// Transport or device reason
        reason: String,
    },

    /// Request rejected for an unclassified reason
    #[error("Request failed: {0}")]
    FailedRequest(String),

    /// Anything else
    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl InstrumentError {
    /// Build the per-operation transport failure.
    pub fn failed(operation: Operation, reason: impl Into<String>) -> Self {
        InstrumentError::OperationFailed {
            operation,
            reason: reason.into(),
        }
    }

    /// Stable numeric result code.
    pub fn code(&self) -> u8 {
        match self {
            InstrumentError::ConnectionFailed(_) => 1,
            InstrumentError::FirmwareNotSupported { .. } => 2,
            InstrumentError::FirmwareFileNotFound(_) => 3,
            InstrumentError::FirmwareUptodate(_) => 4,
            InstrumentError::FirmwareUpdateInProgress(_) => 5,
            InstrumentError::InvalidChannel(_) => 10,
            InstrumentError::BusyChannel(_) => 11,
            InstrumentError::ChannelLinked { .. } => 12,
            InstrumentError::DeviceNotFound(_) => 13,
            InstrumentError::FeatureNotSupported(_) => 14,
            InstrumentError::ManualExperimentNotRunning(_) => 51,
            InstrumentError::ExperimentNotUploaded(_) => 52,
            InstrumentError::ExperimentIsEmpty => 53,
            InstrumentError::InvalidParameters(_) => 54,
            InstrumentError::ChannelNotBusy(_) => 55,
            InstrumentError::ExperimentUploaded(_) => 56,
            InstrumentError::DeviceCommunicationFailed(_) => 100,
            InstrumentError::OperationFailed { operation, .. } => operation.failure_code(),
            InstrumentError::ExperimentAlreadyPaused(_) => 107,
            InstrumentError::ExperimentAlreadyRun(_) => 108,
            InstrumentError::FailedRequest(_) => 254,
            InstrumentError::Unknown(_) => 255,
        }
    }

    /// Classify the error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            InstrumentError::ConnectionFailed(_)
            | InstrumentError::FirmwareNotSupported { .. }
            | InstrumentError::FirmwareFileNotFound(_)
            | InstrumentError::FirmwareUptodate(_)
            | InstrumentError::FirmwareUpdateInProgress(_)
            | InstrumentError::DeviceNotFound(_)
            | InstrumentError::FeatureNotSupported(_) => ErrorCategory::Connectivity,
            InstrumentError::InvalidChannel(_) | InstrumentError::ChannelLinked { .. } => {
                ErrorCategory::Addressing
            }
            InstrumentError::BusyChannel(_)
            | InstrumentError::ChannelNotBusy(_)
            | InstrumentError::ExperimentUploaded(_)
            | InstrumentError::ExperimentAlreadyPaused(_)
            | InstrumentError::ExperimentAlreadyRun(_) => ErrorCategory::Contention,
            InstrumentError::ExperimentIsEmpty | InstrumentError::InvalidParameters(_) => {
                ErrorCategory::ProgramValidity
            }
            InstrumentError::ExperimentNotUploaded(_)
            | InstrumentError::ManualExperimentNotRunning(_) => ErrorCategory::SessionState,
            InstrumentError::DeviceCommunicationFailed(_)
            | InstrumentError::OperationFailed { .. } => ErrorCategory::Transport,
            InstrumentError::FailedRequest(_) | InstrumentError::Unknown(_) => {
                ErrorCategory::Unknown
            }
        }
    }
}

impl Operation {
    /// Result code reported when this operation is not acknowledged.
    pub fn failure_code(&self) -> u8 {
        match self {
            Operation::ManualCurrentRange => 101,
            Operation::ManualVoltage => 102,
            Operation::Pause => 103,
            Operation::Resume => 104,
            Operation::Stop => 105,
            Operation::Upload => 106,
            Operation::ManualVoltageRange => 109,
            Operation::ManualCurrent => 110,
            Operation::ManualOpenCircuit => 111,
            Operation::ManualSamplingInterval => 112,
            Operation::IrCompensation => 113,
            Operation::CompRange => 114,
            Operation::Limit(LimitKind::MaxVoltage) => 115,
            Operation::Limit(LimitKind::MinVoltage) => 116,
            Operation::Limit(LimitKind::MaxCurrent) => 117,
            Operation::Limit(LimitKind::MinCurrent) => 118,
            Operation::Limit(LimitKind::MaxTemperature) => 119,
            Operation::Start
            | Operation::Skip
            | Operation::StartManual
            | Operation::StartIdleSampling
            | Operation::ResetLimits
            | Operation::LinkChannels
            | Operation::EraseRecoveryData
            | Operation::FirmwareUpdate => 100,
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::Upload => write!(f, "upload experiment"),
            Operation::Start => write!(f, "start experiment"),
            Operation::Pause => write!(f, "pause experiment"),
            Operation::Resume => write!(f, "resume experiment"),
            Operation::Stop => write!(f, "stop experiment"),
            Operation::Skip => write!(f, "skip experiment step"),
            Operation::StartManual => write!(f, "start manual experiment"),
            Operation::StartIdleSampling => write!(f, "start idle sampling"),
            Operation::ManualVoltage => write!(f, "set manual mode constant voltage"),
            Operation::ManualCurrent => write!(f, "set manual mode constant current"),
            Operation::ManualOpenCircuit => write!(f, "set manual mode in OCP"),
            Operation::ManualSamplingInterval => write!(f, "set manual mode sampling interval"),
            Operation::ManualCurrentRange => write!(f, "set manual mode current range"),
            Operation::ManualVoltageRange => write!(f, "set manual mode voltage range"),
            Operation::IrCompensation => write!(f, "set IR compensation"),
            Operation::CompRange => write!(f, "set compensation range"),
            Operation::Limit(kind) => write!(f, "set channel {kind}"),
            Operation::ResetLimits => write!(f, "reset channel limits"),
            Operation::LinkChannels => write!(f, "link channels"),
            Operation::EraseRecoveryData => write!(f, "erase recovery data"),
            Operation::FirmwareUpdate => write!(f, "update firmware"),
        }
    }
}

/// Errors raised by a [`Transport`](crate::transport::Transport) implementation.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The device went away
    #[error("Device disconnected")]
    Disconnected,

    /// No reply in time
    #[error("Request timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Underlying stream error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed or unexpected frame
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The transport was shut down
    #[error("Transport closed")]
    Closed,

    /// Nothing answers on the port
    #[error("No device on port {0}")]
    PortNotFound(String),
}

impl From<serde_json::Error> for TransportError {
    fn from(value: serde_json::Error) -> Self {
        TransportError::Protocol(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_instrument_family() {
        assert_eq!(InstrumentError::BusyChannel(0).code(), 11);
        assert_eq!(InstrumentError::ExperimentIsEmpty.code(), 53);
        assert_eq!(InstrumentError::ChannelNotBusy(2).code(), 55);
        assert_eq!(
            InstrumentError::failed(Operation::Pause, "timeout").code(),
            103
        );
        assert_eq!(
            InstrumentError::failed(Operation::Limit(LimitKind::MinCurrent), "nack").code(),
            118
        );
    }

    #[test]
    fn categories_group_by_kind() {
        assert_eq!(
            InstrumentError::ExperimentAlreadyRun(0).category(),
            ErrorCategory::Contention
        );
        assert_eq!(
            InstrumentError::ChannelLinked { channel: 1, master: 0 }.category(),
            ErrorCategory::Addressing
        );
        assert_eq!(
            InstrumentError::failed(Operation::Stop, "io").category(),
            ErrorCategory::Transport
        );
        assert_eq!(
            InstrumentError::ManualExperimentNotRunning(3).category(),
            ErrorCategory::SessionState
        );
    }

    #[test]
    fn operation_failure_message_names_operation() {
        let err = InstrumentError::failed(Operation::Limit(LimitKind::MaxVoltage), "no ack");
        assert_eq!(err.to_string(), "Failed to set channel maximum voltage: no ack");
    }
}
