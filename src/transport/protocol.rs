//! Command and notification vocabulary shared by every transport.
//!
//! Commands travel host → device and are answered by exactly one
//! [`DeviceReply`]. Notifications travel device → host unsolicited.
//!
//! The line transport frames these as one JSON object per line:
//!
//! ```text
//! host   → {"id":7,"command":{"command":"start","channel":0}}
//! device → {"reply":{"id":7,"result":{"result":"ack"}}}
//! device → {"notification":{"notification":"step_started","channel":0,"ordinal":0}}
//! ```

use crate::error::InstrumentError;
use crate::events::{Provenance, Sample, StopReason};
use crate::experiment::{ExecutionPlan, ExperimentNode};
use crate::session::{CompRange, IrCompensation, LimitKind, LinkGroup, ManualRange, ManualSetpoint};
use serde::{Deserialize, Serialize};

/// Identity and capabilities reported by a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Unique device name, e.g. `"Plus1479"`
    pub name: String,
    /// Model designation
    pub model: String,
    /// Serial number
    pub serial_number: String,
    /// Firmware version
    pub firmware_version: u32,
    /// Number of channels
    pub channel_count: u8,
    /// Channels can be combined in parallel
    pub supports_linking: bool,
    /// Adjacent channel pairs can be combined as bipolar outputs
    pub supports_bipolar: bool,
    /// Manual mode current ranges (A), largest first
    pub current_ranges: Vec<f64>,
    /// Manual mode voltage ranges (V), largest first
    pub voltage_ranges: Vec<f64>,
}

/// Host → device request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
#[allow(missing_docs)] // `channel` is always the addressed channel
pub enum DeviceCommand {
    /// Ask for [`DeviceInfo`]
    Identify,
    /// Replace the channel's program
    Upload { channel: u8, plan: ExecutionPlan },
    /// Run the uploaded program
    Start { channel: u8 },
    /// Pause the running program
    Pause { channel: u8 },
    /// Resume the paused program
    Resume { channel: u8 },
    /// End the run; confirmed by a `Stopped` notification
    Stop { channel: u8 },
    /// Abandon the current step
    Skip { channel: u8 },
    /// Enter manual mode at open circuit
    StartManual { channel: u8 },
    /// Stream resting readings until a run starts
    StartIdleSampling { channel: u8 },
    /// Change the held setpoint in manual mode
    SetManualSetpoint { channel: u8, setpoint: ManualSetpoint },
    /// Change the manual sampling interval
    SetManualSamplingInterval { channel: u8, seconds: f64 },
    /// Fix or autorange the manual measurement range
    SetManualRange { channel: u8, range: ManualRange },
    /// Configure one safety limit
    SetLimit { channel: u8, kind: LimitKind, value: f64 },
    /// Clear every safety limit
    ResetLimits { channel: u8 },
    /// Configure IR compensation
    SetIrCompensation { channel: u8, compensation: IrCompensation },
    /// Configure the compensation range
    SetCompRange { channel: u8, range: CompRange },
    /// Form a link group under its master
    LinkChannels { group: LinkGroup },
    /// Drop retained recovery data
    EraseRecoveryData,
    /// Install the given firmware version
    UpdateFirmware { version: u32 },
}

impl DeviceCommand {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            DeviceCommand::Identify => "identify",
            DeviceCommand::Upload { .. } => "upload",
            DeviceCommand::Start { .. } => "start",
            DeviceCommand::Pause { .. } => "pause",
            DeviceCommand::Resume { .. } => "resume",
            DeviceCommand::Stop { .. } => "stop",
            DeviceCommand::Skip { .. } => "skip",
            DeviceCommand::StartManual { .. } => "start_manual",
            DeviceCommand::StartIdleSampling { .. } => "start_idle_sampling",
            DeviceCommand::SetManualSetpoint { .. } => "set_manual_setpoint",
            DeviceCommand::SetManualSamplingInterval { .. } => "set_manual_sampling_interval",
            DeviceCommand::SetManualRange { .. } => "set_manual_range",
            DeviceCommand::SetLimit { .. } => "set_limit",
            DeviceCommand::ResetLimits { .. } => "reset_limits",
            DeviceCommand::SetIrCompensation { .. } => "set_ir_compensation",
            DeviceCommand::SetCompRange { .. } => "set_comp_range",
            DeviceCommand::LinkChannels { .. } => "link_channels",
            DeviceCommand::EraseRecoveryData => "erase_recovery_data",
            DeviceCommand::UpdateFirmware { .. } => "update_firmware",
        }
    }
}

/// Why the device refused a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectCode {
    /// Maps to `InvalidChannel`
    InvalidChannel,
    /// Maps to `BusyChannel`
    BusyChannel,
    /// Maps to `ChannelNotBusy`
    ChannelNotBusy,
    /// Maps to `InvalidParameters`
    InvalidParameters,
    /// Maps to `FeatureNotSupported`
    FeatureNotSupported,
    /// Maps to `ExperimentNotUploaded`
    ExperimentNotUploaded,
    /// Maps to `ManualExperimentNotRunning`
    ManualExperimentNotRunning,
    /// Any other device-side failure
    Failed,
}

/// Device answer to one command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum DeviceReply {
    /// The command was accepted
    Ack,
    /// Answer to `Identify`
    Identity {
        /// Identity and capabilities
        info: DeviceInfo,
    },
    /// The command was refused
    Rejected {
        /// Reason class
        code: RejectCode,
        /// Device's explanation
        message: String,
    },
}

impl DeviceReply {
    /// Shorthand for a rejection.
    pub fn rejected(code: RejectCode, message: impl Into<String>) -> Self {
        DeviceReply::Rejected {
            code,
            message: message.into(),
        }
    }
}

/// Map a device rejection onto the host error taxonomy.
///
/// `failed` is the error used when the device gives no specific reason.
pub(crate) fn rejection_error(
    code: RejectCode,
    message: String,
    channel: u8,
    failed: InstrumentError,
) -> InstrumentError {
    match code {
        RejectCode::InvalidChannel => InstrumentError::InvalidChannel(channel),
        RejectCode::BusyChannel => InstrumentError::BusyChannel(channel),
        RejectCode::ChannelNotBusy => InstrumentError::ChannelNotBusy(channel),
        RejectCode::InvalidParameters => InstrumentError::InvalidParameters(message),
        RejectCode::FeatureNotSupported => InstrumentError::FeatureNotSupported(message),
        RejectCode::ExperimentNotUploaded => InstrumentError::ExperimentNotUploaded(channel),
        RejectCode::ManualExperimentNotRunning => {
            InstrumentError::ManualExperimentNotRunning(channel)
        }
        RejectCode::Failed => failed,
    }
}

/// Device → host unsolicited message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "notification", rename_all = "snake_case")]
#[allow(missing_docs)] // `channel` is always the reporting channel
pub enum DeviceNotification {
    /// A measurement
    Sample {
        channel: u8,
        provenance: Provenance,
        sample: Sample,
    },
    /// The program entered the step at `ordinal` of its plan
    StepStarted {
        channel: u8,
        ordinal: u32,
    },
    /// Recovered samples that follow belong to `node`
    RecoveryStepStarted {
        channel: u8,
        node: ExperimentNode,
    },
    /// The run ended
    Stopped {
        channel: u8,
        reason: StopReason,
    },
    /// The program is paused
    Paused {
        channel: u8,
    },
    /// The program resumed
    Resumed {
        channel: u8,
    },
    /// Fatal errors abort the channel's run
    Error {
        channel: u8,
        message: String,
        fatal: bool,
    },
    /// The instrument ground started or stopped floating
    GroundFloat {
        floating: bool,
    },
    /// Firmware transfer progress, 0 to 100
    FirmwareProgress {
        percent: u8,
    },
    /// Outcome of `EraseRecoveryData`
    RecoveryErased {
        success: bool,
    },
    /// The stream ended
    Disconnected,
}

/// One line written by the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostFrame {
    /// Correlation id echoed in the reply
    pub id: u64,
    /// The request
    pub command: DeviceCommand,
}

/// Reply half of a [`DeviceFrame`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyFrame {
    /// Id of the answered [`HostFrame`]
    pub id: u64,
    /// The answer
    pub result: DeviceReply,
}

/// One line written by the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceFrame {
    /// Answer to a host frame
    Reply(ReplyFrame),
    /// Unsolicited message
    Notification(DeviceNotification),
}

/// Serialize `frame` as one newline-terminated line.
pub fn encode_line<T: Serialize>(frame: &T) -> serde_json::Result<Vec<u8>> {
    let mut line = serde_json::to_vec(frame)?;
    line.push(b'\n');
    Ok(line)
}
