//! Host-side handle to one connected instrument.
//!
//! An [`InstrumentHandle`] owns the [`ChannelSession`]s of a device and a
//! dispatcher task that consumes the device's notification stream. Commands
//! are checked against the session locally, sent through the
//! [`Transport`] under the configured timeout, and applied to the session on
//! acknowledgement. Spontaneous transitions (step changes, completion,
//! faults, disconnects) happen only in the dispatcher.
//!
//! Commands on one channel are serialised by a per-channel gate; a command
//! issued while another is in flight on the same channel fails with
//! [`InstrumentError::BusyChannel`].
//!
//! # Example
//!
//! ```
//! use echem_daq::elements::{Element, OpenCircuit};
//! use echem_daq::events::StopReason;
//! use echem_daq::experiment::Experiment;
//! use echem_daq::handler::{HandleSettings, InstrumentHandle};
//! use echem_daq::sim::{SimBench, SimSpec};
//! use echem_daq::transport::Connector;
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread", start_paused = true)]
//! # async fn main() {
//! let bench = SimBench::new();
//! bench.plug("sim0", SimSpec::new("Plus1000"));
//! let connection = bench.open("sim0").await.unwrap();
//! let handle = InstrumentHandle::identify_and_spawn(connection, HandleSettings::default())
//!     .await
//!     .unwrap();
//!
//! let mut ocp = Experiment::new();
//! ocp.append_element(&Element::from(OpenCircuit::new(5.0, 1.0)), 1);
//! let reason = handle
//!     .run_to_completion(0, &ocp, Duration::from_secs(30))
//!     .await
//!     .unwrap();
//! assert_eq!(reason, StopReason::Completed);
//! # }
//! ```

use crate::elements::{sampling_interval, MAX_SAMPLING_INTERVAL_SECS};
use crate::error::{InstrumentError, InstrumentResult, Operation, TransportError};
use crate::events::{CompletionWaiter, EventKind, InstrumentEvent, Provenance, Sample, StopReason};
use crate::experiment::{flatten, Experiment};
use crate::session::{
    ChannelSession, ChannelState, ChannelStatus, CompRange, IrCompensation, LimitKind, LinkGroup,
    LinkMode, LinkRole, ManualRange, ManualSetpoint, SampleVerdict, UploadedProgram,
    COMP_RANGE_MAX,
};
use crate::transport::protocol::rejection_error;
use crate::transport::{
    Connection, DeviceCommand, DeviceInfo, DeviceNotification, DeviceReply, Transport,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Notify};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Default bound on a single transport request.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Default depth of the event broadcast channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 4096;

/// Tuning of one handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleSettings {
    /// Bound on every transport request
    pub command_timeout: Duration,
    /// Events buffered per subscriber before it lags
    pub event_capacity: usize,
}

impl Default for HandleSettings {
    fn default() -> Self {
        Self {
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

struct ChannelSlot {
    channel: u8,
    session: Mutex<ChannelSession>,
    /// Held for the duration of one command on this channel
    gate: tokio::sync::Mutex<()>,
    /// Signalled by the dispatcher whenever a run on this channel ends
    finished: Notify,
}

impl ChannelSlot {
    fn new(channel: u8) -> Self {
        Self {
            channel,
            session: Mutex::new(ChannelSession::new(channel)),
            gate: tokio::sync::Mutex::new(()),
            finished: Notify::new(),
        }
    }

    fn gate(&self) -> InstrumentResult<tokio::sync::MutexGuard<'_, ()>> {
        self.gate
            .try_lock()
            .map_err(|_| InstrumentError::BusyChannel(self.channel))
    }

    /// Resolve once the session no longer holds run `run_id`.
    async fn run_ended(&self, run_id: Uuid) {
        loop {
            let finished = self.finished.notified();
            tokio::pin!(finished);
            finished.as_mut().enable();
            let pending = self.session.lock().run_id() == Some(run_id);
            if !pending {
                return;
            }
            finished.await;
        }
    }
}

struct Shared {
    info: DeviceInfo,
    port: String,
    transport: Arc<dyn Transport>,
    channels: Vec<ChannelSlot>,
    events: broadcast::Sender<InstrumentEvent>,
    settings: HandleSettings,
    updating: AtomicBool,
    firmware_progress: Mutex<Option<mpsc::UnboundedSender<u8>>>,
    disconnected: watch::Sender<bool>,
}

/// Handle to one connected instrument. Cheap to clone.
#[derive(Clone)]
pub struct InstrumentHandle {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for InstrumentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstrumentHandle")
            .field("name", &self.shared.info.name)
            .field("port", &self.shared.port)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Ask the device on `transport` who it is.
///
/// # Errors
///
/// [`InstrumentError::ConnectionFailed`] if the device does not answer with
/// its identity within `timeout`.
pub async fn identify(transport: &dyn Transport, timeout: Duration) -> InstrumentResult<DeviceInfo> {
    match tokio::time::timeout(timeout, transport.request(DeviceCommand::Identify)).await {
        Ok(Ok(DeviceReply::Identity { info })) => Ok(info),
        Ok(Ok(other)) => Err(InstrumentError::ConnectionFailed(format!(
            "unexpected identify reply: {other:?}"
        ))),
        Ok(Err(e)) => Err(InstrumentError::ConnectionFailed(e.to_string())),
        Err(_) => Err(InstrumentError::ConnectionFailed(format!(
            "no identity within {timeout:?}"
        ))),
    }
}

impl InstrumentHandle {
    /// Take ownership of an identified connection and start its dispatcher.
    pub fn spawn(connection: Connection, info: DeviceInfo, settings: HandleSettings) -> Self {
        let Connection {
            port,
            transport,
            notifications,
        } = connection;
        let channels = (0..info.channel_count).map(ChannelSlot::new).collect();
        let (events, _) = broadcast::channel(settings.event_capacity.max(1));
        let (disconnected, _) = watch::channel(false);

        let shared = Arc::new(Shared {
            info,
            port,
            transport,
            channels,
            events,
            settings,
            updating: AtomicBool::new(false),
            firmware_progress: Mutex::new(None),
            disconnected,
        });
        info!(
            device = %shared.info.name,
            port = %shared.port,
            channels = shared.info.channel_count,
            firmware = shared.info.firmware_version,
            "Instrument handle started"
        );
        tokio::spawn(dispatch(Arc::clone(&shared), notifications));
        Self { shared }
    }

    /// Identify the device on `connection`, then [`spawn`](Self::spawn).
    ///
    /// # Errors
    ///
    /// [`InstrumentError::ConnectionFailed`] if identification fails.
    pub async fn identify_and_spawn(
        connection: Connection,
        settings: HandleSettings,
    ) -> InstrumentResult<Self> {
        let info = identify(connection.transport.as_ref(), settings.command_timeout).await?;
        Ok(Self::spawn(connection, info, settings))
    }

    // =========================================================================
    // Identity and events
    // =========================================================================

    /// Identity reported at connect.
    pub fn info(&self) -> &DeviceInfo {
        &self.shared.info
    }

    /// Device name.
    pub fn name(&self) -> &str {
        &self.shared.info.name
    }

    /// Port the device is connected on.
    pub fn port(&self) -> &str {
        &self.shared.port
    }

    /// Number of channels.
    pub fn channel_count(&self) -> u8 {
        self.shared.info.channel_count
    }

    /// False once the device has disconnected.
    pub fn is_connected(&self) -> bool {
        !*self.shared.disconnected.borrow()
    }

    /// True if both handles refer to the same connection.
    pub fn same_connection(&self, other: &InstrumentHandle) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// True while a firmware update is running.
    pub fn is_updating_firmware(&self) -> bool {
        self.shared.updating.load(Ordering::Acquire)
    }

    /// Subscribe to all events of this device.
    pub fn subscribe(&self) -> broadcast::Receiver<InstrumentEvent> {
        self.shared.events.subscribe()
    }

    /// Events as a stream, optionally restricted to one channel.
    ///
    /// Device-level events are included for every channel filter. A lagging
    /// consumer skips the events it missed.
    pub fn event_stream(
        &self,
        channel: Option<u8>,
    ) -> impl Stream<Item = InstrumentEvent> + Send + Unpin + 'static {
        let device = self.shared.info.name.clone();
        BroadcastStream::new(self.subscribe()).filter_map(move |item| match item {
            Ok(event) => match channel {
                Some(ch) if !event.concerns(ch) => None,
                _ => Some(event),
            },
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(device = %device, skipped, "Event stream lagged");
                None
            }
        })
    }

    /// Resolve once the device has disconnected.
    pub async fn wait_disconnected(&self) {
        let mut rx = self.shared.disconnected.subscribe();
        let _ = rx.wait_for(|gone| *gone).await;
    }

    /// Close the connection and wait for the dispatcher to wind down.
    pub async fn close(&self) {
        if let Err(e) = self.shared.transport.close().await {
            warn!(device = %self.name(), error = %e, "Transport close failed");
        }
        if tokio::time::timeout(self.shared.settings.command_timeout, self.wait_disconnected())
            .await
            .is_err()
        {
            warn!(device = %self.name(), "Dispatcher did not observe the close");
        }
    }

    // =========================================================================
    // Command plumbing
    // =========================================================================

    fn ready(&self) -> InstrumentResult<()> {
        if !self.is_connected() {
            return Err(InstrumentError::DeviceNotFound(self.name().to_string()));
        }
        if self.is_updating_firmware() {
            return Err(InstrumentError::FirmwareUpdateInProgress(
                self.name().to_string(),
            ));
        }
        Ok(())
    }

    fn slot(&self, channel: u8) -> InstrumentResult<&ChannelSlot> {
        self.shared
            .channels
            .get(channel as usize)
            .ok_or(InstrumentError::InvalidChannel(channel))
    }

    /// Send one command and map the outcome. `channel` attributes
    /// channel-specific rejections.
    async fn send(
        &self,
        operation: Operation,
        channel: u8,
        command: DeviceCommand,
    ) -> InstrumentResult<()> {
        let name = command.name();
        let timeout = self.shared.settings.command_timeout;
        debug!(device = %self.name(), channel, command = name, "Sending command");

        let reply = match tokio::time::timeout(timeout, self.shared.transport.request(command)).await
        {
            Err(_) => {
                warn!(device = %self.name(), command = name, ?timeout, "Command timed out");
                return Err(InstrumentError::failed(
                    operation,
                    format!("no reply within {timeout:?}"),
                ));
            }
            Ok(Err(TransportError::Disconnected | TransportError::Closed)) => {
                return Err(InstrumentError::DeviceNotFound(self.name().to_string()));
            }
            Ok(Err(e)) => {
                warn!(device = %self.name(), command = name, error = %e, "Command failed");
                return Err(InstrumentError::failed(operation, e.to_string()));
            }
            Ok(Ok(reply)) => reply,
        };

        match reply {
            DeviceReply::Ack => Ok(()),
            DeviceReply::Rejected { code, message } => {
                debug!(device = %self.name(), command = name, ?code, %message, "Command rejected");
                let failed = InstrumentError::failed(operation, message.clone());
                Err(rejection_error(code, message, channel, failed))
            }
            DeviceReply::Identity { .. } => Err(InstrumentError::failed(
                operation,
                "unexpected identity reply",
            )),
        }
    }

    /// Guard, send, then apply on acknowledgement.
    async fn command<R>(
        &self,
        channel: u8,
        operation: Operation,
        check: fn(&ChannelSession) -> InstrumentResult<()>,
        command: DeviceCommand,
        apply: impl FnOnce(&mut ChannelSession) -> R,
    ) -> InstrumentResult<R> {
        self.ready()?;
        let slot = self.slot(channel)?;
        let _gate = slot.gate()?;
        check(&*slot.session.lock())?;
        self.send(operation, channel, command).await?;
        let result = apply(&mut *slot.session.lock());
        Ok(result)
    }

    /// Apply a run-starting transition before sending, so that reports
    /// arriving ahead of the acknowledgement find the run. Rolled back if
    /// the device does not accept.
    async fn start_run(
        &self,
        channel: u8,
        operation: Operation,
        check: fn(&ChannelSession) -> InstrumentResult<()>,
        command: DeviceCommand,
        apply: fn(&mut ChannelSession, DateTime<Utc>) -> Option<Uuid>,
    ) -> InstrumentResult<()> {
        self.ready()?;
        let slot = self.slot(channel)?;
        let _gate = slot.gate()?;
        let (snapshot, run_id) = {
            let mut session = slot.session.lock();
            check(&*session)?;
            let snapshot = session.clone();
            let run_id = apply(&mut *session, Utc::now());
            (snapshot, run_id)
        };

        if let Err(e) = self.send(operation, channel, command).await {
            let mut session = slot.session.lock();
            if session.run_id() == run_id {
                *session = snapshot;
            }
            return Err(e);
        }
        if let Some(run_id) = run_id {
            info!(device = %self.name(), channel, %run_id, "Run started");
        }
        Ok(())
    }

    // =========================================================================
    // Experiment control
    // =========================================================================

    /// Upload a copy of `experiment` to `channel`, replacing any previous
    /// upload.
    ///
    /// # Errors
    ///
    /// - [`InstrumentError::ExperimentIsEmpty`] for an empty experiment.
    /// - [`InstrumentError::InvalidParameters`] if an element is invalid.
    /// - [`InstrumentError::BusyChannel`] while the channel runs.
    #[instrument(skip(self, experiment), fields(device = %self.shared.info.name, experiment = experiment.name()))]
    pub async fn upload(&self, channel: u8, experiment: &Experiment) -> InstrumentResult<()> {
        self.ready()?;
        let slot = self.slot(channel)?;
        let _gate = slot.gate()?;
        slot.session.lock().check_upload()?;

        let plan = flatten(experiment)?;
        let violations: Vec<String> = plan
            .iter()
            .flat_map(|step| step.element.parameter_violations())
            .collect();
        if !violations.is_empty() {
            return Err(InstrumentError::InvalidParameters(violations.join("; ")));
        }
        let steps = plan.len();
        let program = UploadedProgram {
            experiment: experiment.clone(),
            plan: Arc::new(plan.clone()),
        };

        self.send(Operation::Upload, channel, DeviceCommand::Upload { channel, plan })
            .await?;
        slot.session.lock().apply_upload(program);
        info!(channel, steps, "Experiment uploaded");
        Ok(())
    }

    /// Start the uploaded experiment.
    ///
    /// # Errors
    ///
    /// [`InstrumentError::ExperimentNotUploaded`] if nothing is uploaded,
    /// [`InstrumentError::BusyChannel`] if a run is active.
    #[instrument(skip(self), fields(device = %self.shared.info.name))]
    pub async fn start(&self, channel: u8) -> InstrumentResult<()> {
        self.start_run(
            channel,
            Operation::Start,
            ChannelSession::check_start,
            DeviceCommand::Start { channel },
            ChannelSession::apply_start,
        )
        .await
    }

    /// Pause the running experiment.
    #[instrument(skip(self), fields(device = %self.shared.info.name))]
    pub async fn pause(&self, channel: u8) -> InstrumentResult<()> {
        self.command(
            channel,
            Operation::Pause,
            ChannelSession::check_pause,
            DeviceCommand::Pause { channel },
            |session| {
                session.apply_pause();
            },
        )
        .await
    }

    /// Resume a paused experiment.
    #[instrument(skip(self), fields(device = %self.shared.info.name))]
    pub async fn resume(&self, channel: u8) -> InstrumentResult<()> {
        self.command(
            channel,
            Operation::Resume,
            ChannelSession::check_resume,
            DeviceCommand::Resume { channel },
            |session| {
                session.apply_resume();
            },
        )
        .await
    }

    /// Stop the running, paused or manual experiment.
    ///
    /// Returns once the device has confirmed the stop and
    /// `ExperimentStopped` has been published. The channel is then `Idle`
    /// and ready for the next upload.
    ///
    /// # Errors
    ///
    /// [`InstrumentError::ChannelNotBusy`] if nothing runs, or the
    /// `FailedToStop` error if the device does not acknowledge the stop or
    /// confirm it within the command timeout. After an unconfirmed stop the
    /// channel keeps refusing new runs with `BusyChannel` and the stop may be
    /// repeated.
    #[instrument(skip(self), fields(device = %self.shared.info.name))]
    pub async fn stop(&self, channel: u8) -> InstrumentResult<()> {
        self.ready()?;
        let slot = self.slot(channel)?;
        let _gate = slot.gate()?;
        let run_id = {
            let session = slot.session.lock();
            session.check_stop()?;
            session.run_id()
        };
        self.send(Operation::Stop, channel, DeviceCommand::Stop { channel })
            .await?;
        slot.session.lock().apply_stop_requested();

        let Some(run_id) = run_id else {
            return Ok(());
        };
        let timeout = self.shared.settings.command_timeout;
        if tokio::time::timeout(timeout, slot.run_ended(run_id))
            .await
            .is_err()
        {
            warn!(device = %self.name(), channel, %run_id, ?timeout, "Stop not confirmed");
            return Err(InstrumentError::failed(
                Operation::Stop,
                format!("stop not confirmed within {timeout:?}"),
            ));
        }
        Ok(())
    }

    /// Skip to the next step; skipping the last step completes the run.
    #[instrument(skip(self), fields(device = %self.shared.info.name))]
    pub async fn skip(&self, channel: u8) -> InstrumentResult<()> {
        self.command(
            channel,
            Operation::Skip,
            ChannelSession::check_skip,
            DeviceCommand::Skip { channel },
            |_| (),
        )
        .await
    }

    /// Enter manual mode at open circuit.
    #[instrument(skip(self), fields(device = %self.shared.info.name))]
    pub async fn start_manual(&self, channel: u8) -> InstrumentResult<()> {
        self.start_run(
            channel,
            Operation::StartManual,
            ChannelSession::check_start_manual,
            DeviceCommand::StartManual { channel },
            ChannelSession::apply_start_manual,
        )
        .await
    }

    /// Start background sampling on an idle channel.
    ///
    /// Sampling ends when a run starts on the channel.
    #[instrument(skip(self), fields(device = %self.shared.info.name))]
    pub async fn start_idle_sampling(&self, channel: u8) -> InstrumentResult<()> {
        self.command(
            channel,
            Operation::StartIdleSampling,
            ChannelSession::check_start_manual,
            DeviceCommand::StartIdleSampling { channel },
            ChannelSession::apply_start_idle_sampling,
        )
        .await
    }

    /// Upload `experiment`, start it and wait for it to stop.
    ///
    /// # Errors
    ///
    /// Any upload or start error, or [`InstrumentError::FailedRequest`] if
    /// the run does not stop within `timeout`.
    pub async fn run_to_completion(
        &self,
        channel: u8,
        experiment: &Experiment,
        timeout: Duration,
    ) -> InstrumentResult<StopReason> {
        let waiter = self.completion_waiter(channel)?;
        self.upload(channel, experiment).await?;
        self.start(channel).await?;
        waiter.wait(timeout).await
    }

    /// Waiter for the next stop on `channel`. Create it before starting.
    pub fn completion_waiter(&self, channel: u8) -> InstrumentResult<CompletionWaiter> {
        self.slot(channel)?;
        Ok(CompletionWaiter::new(
            self.name().to_string(),
            channel,
            self.subscribe(),
        ))
    }

    // =========================================================================
    // Manual mode
    // =========================================================================

    async fn manual_setpoint(
        &self,
        channel: u8,
        operation: Operation,
        setpoint: ManualSetpoint,
    ) -> InstrumentResult<()> {
        self.command(
            channel,
            operation,
            ChannelSession::check_manual_control,
            DeviceCommand::SetManualSetpoint { channel, setpoint },
            |_| (),
        )
        .await
    }

    /// Hold `volts` in manual mode.
    pub async fn set_manual_voltage(&self, channel: u8, volts: f64) -> InstrumentResult<()> {
        self.manual_setpoint(channel, Operation::ManualVoltage, ManualSetpoint::Voltage(volts))
            .await
    }

    /// Hold `amps` in manual mode.
    pub async fn set_manual_current(&self, channel: u8, amps: f64) -> InstrumentResult<()> {
        self.manual_setpoint(channel, Operation::ManualCurrent, ManualSetpoint::Current(amps))
            .await
    }

    /// Float at open circuit in manual mode.
    pub async fn set_manual_ocp(&self, channel: u8) -> InstrumentResult<()> {
        self.manual_setpoint(
            channel,
            Operation::ManualOpenCircuit,
            ManualSetpoint::OpenCircuit,
        )
        .await
    }

    /// Change the manual mode sampling interval.
    ///
    /// # Errors
    ///
    /// [`InstrumentError::InvalidParameters`] unless `seconds` is positive
    /// and at most [`MAX_SAMPLING_INTERVAL_SECS`].
    pub async fn set_manual_sampling_interval(
        &self,
        channel: u8,
        seconds: f64,
    ) -> InstrumentResult<()> {
        if sampling_interval(seconds).is_none() {
            return Err(InstrumentError::InvalidParameters(format!(
                "sampling interval must be positive and at most {MAX_SAMPLING_INTERVAL_SECS} s (got {seconds})"
            )));
        }
        self.command(
            channel,
            Operation::ManualSamplingInterval,
            ChannelSession::check_manual_control,
            DeviceCommand::SetManualSamplingInterval { channel, seconds },
            |_| (),
        )
        .await
    }

    async fn manual_range(
        &self,
        channel: u8,
        operation: Operation,
        range: ManualRange,
    ) -> InstrumentResult<()> {
        let (index, table) = match range {
            ManualRange::Current(i) => (Some(i), &self.shared.info.current_ranges),
            ManualRange::Voltage(i) => (Some(i), &self.shared.info.voltage_ranges),
            ManualRange::CurrentAuto | ManualRange::VoltageAuto => (None, &self.shared.info.current_ranges),
        };
        if let Some(index) = index {
            if index as usize >= table.len() {
                return Err(InstrumentError::InvalidParameters(format!(
                    "range index {index} outside the {} available ranges",
                    table.len()
                )));
            }
        }
        self.command(
            channel,
            operation,
            ChannelSession::check_manual_control,
            DeviceCommand::SetManualRange { channel, range },
            |_| (),
        )
        .await
    }

    /// Select current range `index` of [`manual_current_ranges`](Self::manual_current_ranges).
    pub async fn set_manual_current_range(&self, channel: u8, index: u8) -> InstrumentResult<()> {
        self.manual_range(channel, Operation::ManualCurrentRange, ManualRange::Current(index))
            .await
    }

    /// Let the device pick the current range.
    pub async fn set_manual_current_autorange(&self, channel: u8) -> InstrumentResult<()> {
        self.manual_range(channel, Operation::ManualCurrentRange, ManualRange::CurrentAuto)
            .await
    }

    /// Select voltage range `index` of [`manual_voltage_ranges`](Self::manual_voltage_ranges).
    pub async fn set_manual_voltage_range(&self, channel: u8, index: u8) -> InstrumentResult<()> {
        self.manual_range(channel, Operation::ManualVoltageRange, ManualRange::Voltage(index))
            .await
    }

    /// Let the device pick the voltage range.
    pub async fn set_manual_voltage_autorange(&self, channel: u8) -> InstrumentResult<()> {
        self.manual_range(channel, Operation::ManualVoltageRange, ManualRange::VoltageAuto)
            .await
    }

    /// Full-scale currents (A) selectable in manual mode, by index.
    pub fn manual_current_ranges(&self) -> &[f64] {
        &self.shared.info.current_ranges
    }

    /// Full-scale voltages (V) selectable in manual mode, by index.
    pub fn manual_voltage_ranges(&self) -> &[f64] {
        &self.shared.info.voltage_ranges
    }

    // =========================================================================
    // Limits and compensation
    // =========================================================================

    /// Set one channel limit. The device forces a stop when a sample
    /// violates it.
    #[instrument(skip(self), fields(device = %self.shared.info.name))]
    pub async fn set_limit(&self, channel: u8, kind: LimitKind, value: f64) -> InstrumentResult<()> {
        if !value.is_finite() {
            return Err(InstrumentError::InvalidParameters(format!(
                "{kind} limit must be finite"
            )));
        }
        self.command(
            channel,
            Operation::Limit(kind),
            ChannelSession::check_addressable,
            DeviceCommand::SetLimit {
                channel,
                kind,
                value,
            },
            |session| session.set_limit(kind, value),
        )
        .await
    }

    /// Set the maximum voltage (V).
    pub async fn set_max_voltage(&self, channel: u8, volts: f64) -> InstrumentResult<()> {
        self.set_limit(channel, LimitKind::MaxVoltage, volts).await
    }

    /// Set the minimum voltage (V).
    pub async fn set_min_voltage(&self, channel: u8, volts: f64) -> InstrumentResult<()> {
        self.set_limit(channel, LimitKind::MinVoltage, volts).await
    }

    /// Set the maximum current (A).
    pub async fn set_max_current(&self, channel: u8, amps: f64) -> InstrumentResult<()> {
        self.set_limit(channel, LimitKind::MaxCurrent, amps).await
    }

    /// Set the minimum current (A).
    pub async fn set_min_current(&self, channel: u8, amps: f64) -> InstrumentResult<()> {
        self.set_limit(channel, LimitKind::MinCurrent, amps).await
    }

    /// Set the maximum temperature (°C).
    pub async fn set_max_temperature(&self, channel: u8, celsius: f64) -> InstrumentResult<()> {
        self.set_limit(channel, LimitKind::MaxTemperature, celsius)
            .await
    }

    /// Clear every limit of `channel`.
    pub async fn reset_limits(&self, channel: u8) -> InstrumentResult<()> {
        self.command(
            channel,
            Operation::ResetLimits,
            ChannelSession::check_addressable,
            DeviceCommand::ResetLimits { channel },
            ChannelSession::reset_limits,
        )
        .await
    }

    /// Compensate `percent` of `resistance` ohms of uncompensated resistance.
    ///
    /// # Errors
    ///
    /// [`InstrumentError::InvalidParameters`] unless `percent` is in 0..=100
    /// and `resistance` is non-negative.
    pub async fn set_ir_compensation(
        &self,
        channel: u8,
        resistance: f64,
        percent: f64,
    ) -> InstrumentResult<()> {
        if !(0.0..=100.0).contains(&percent) {
            return Err(InstrumentError::InvalidParameters(format!(
                "IR compensation must be 0 to 100 % (got {percent})"
            )));
        }
        if !(resistance.is_finite() && resistance >= 0.0) {
            return Err(InstrumentError::InvalidParameters(format!(
                "uncompensated resistance must be non-negative (got {resistance})"
            )));
        }
        let compensation = IrCompensation {
            resistance,
            percent,
        };
        self.command(
            channel,
            Operation::IrCompensation,
            ChannelSession::check_addressable,
            DeviceCommand::SetIrCompensation {
                channel,
                compensation,
            },
            |session| session.set_ir_compensation(compensation),
        )
        .await
    }

    /// Select the control loop compensation range.
    pub async fn set_comp_range(&self, channel: u8, range: CompRange) -> InstrumentResult<()> {
        if range.bandwidth_index > COMP_RANGE_MAX || range.stability_factor > COMP_RANGE_MAX {
            return Err(InstrumentError::InvalidParameters(format!(
                "compensation range values must be 0 to {COMP_RANGE_MAX}"
            )));
        }
        let applied = range.clone();
        self.command(
            channel,
            Operation::CompRange,
            ChannelSession::check_addressable,
            DeviceCommand::SetCompRange { channel, range },
            move |session| session.set_comp_range(applied),
        )
        .await
    }

    // =========================================================================
    // Channel linking
    // =========================================================================

    /// Link `channels` in parallel. Returns the master channel.
    ///
    /// # Errors
    ///
    /// - [`InstrumentError::FeatureNotSupported`] if the device cannot link.
    /// - [`InstrumentError::InvalidParameters`] for fewer than two channels.
    /// - [`InstrumentError::InvalidChannel`] for invalid or repeated channels.
    /// - [`InstrumentError::BusyChannel`] if a member is not idle.
    #[instrument(skip(self), fields(device = %self.shared.info.name))]
    pub async fn set_linked_channels(&self, channels: &[u8]) -> InstrumentResult<u8> {
        self.link(channels, LinkMode::Parallel).await
    }

    /// Link an adjacent even/odd pair in bipolar mode. Returns the master.
    #[instrument(skip(self), fields(device = %self.shared.info.name))]
    pub async fn set_bipolar_linked_channels(&self, channels: &[u8]) -> InstrumentResult<u8> {
        self.link(channels, LinkMode::Bipolar).await
    }

    async fn link(&self, channels: &[u8], mode: LinkMode) -> InstrumentResult<u8> {
        self.ready()?;
        let supported = match mode {
            LinkMode::Parallel => self.shared.info.supports_linking,
            LinkMode::Bipolar => self.shared.info.supports_bipolar,
        };
        if !supported {
            return Err(InstrumentError::FeatureNotSupported(format!(
                "{mode:?} channel linking on {}",
                self.name()
            )));
        }
        let group = LinkGroup::plan(channels, self.channel_count(), mode)?;

        let mut gates = Vec::with_capacity(group.members.len());
        for &member in &group.members {
            gates.push(self.slot(member)?.gate()?);
        }
        let mut released = Vec::new();
        for &member in &group.members {
            let session = self.slot(member)?.session.lock();
            match session.link() {
                // Regrouping under a master that is also a member.
                Some(LinkRole::Slave { master }) if group.members.contains(master) => {}
                _ => session.check_addressable()?,
            }
            session.check_linkable()?;
            if let Some(LinkRole::Master(old)) = session.link() {
                released.extend(old.slaves().filter(|c| !group.members.contains(c)));
            }
        }
        // Slaves of a group being replaced are released under their gates too.
        for &channel in &released {
            gates.push(self.slot(channel)?.gate()?);
        }

        self.send(
            Operation::LinkChannels,
            group.master,
            DeviceCommand::LinkChannels {
                group: group.clone(),
            },
        )
        .await?;

        for &channel in &released {
            self.slot(channel)?.session.lock().set_link(None);
        }
        for slave in group.slaves() {
            self.slot(slave)?.session.lock().set_link(Some(LinkRole::Slave {
                master: group.master,
            }));
        }
        let master = group.master;
        info!(master, members = ?group.members, ?mode, "Channels linked");
        self.slot(master)?
            .session
            .lock()
            .set_link(Some(LinkRole::Master(group)));
        drop(gates);
        Ok(master)
    }

    fn group_of(&self, channel: u8) -> InstrumentResult<Option<LinkGroup>> {
        let link = self.slot(channel)?.session.lock().link().cloned();
        let group = match link {
            Some(LinkRole::Master(group)) => Some(group),
            Some(LinkRole::Slave { master }) => match self.slot(master)?.session.lock().link() {
                Some(LinkRole::Master(group)) => Some(group.clone()),
                _ => None,
            },
            None => None,
        };
        Ok(group)
    }

    /// Members of the group `channel` belongs to, empty if unlinked.
    pub fn linked_channels(&self, channel: u8) -> InstrumentResult<Vec<u8>> {
        Ok(self
            .group_of(channel)?
            .map(|g| g.members)
            .unwrap_or_default())
    }

    /// True if `channel` belongs to a bipolar group.
    pub fn has_bipolar_mode(&self, channel: u8) -> InstrumentResult<bool> {
        Ok(self
            .group_of(channel)?
            .is_some_and(|g| g.mode == LinkMode::Bipolar))
    }

    // =========================================================================
    // Queries and device-level commands
    // =========================================================================

    /// Snapshot of `channel`.
    pub fn channel_status(&self, channel: u8) -> InstrumentResult<ChannelStatus> {
        Ok(self.slot(channel)?.session.lock().status())
    }

    /// Current state of `channel`.
    pub fn channel_state(&self, channel: u8) -> InstrumentResult<ChannelState> {
        Ok(self.slot(channel)?.session.lock().state())
    }

    /// True while a run occupies `channel`.
    pub fn is_channel_busy(&self, channel: u8) -> InstrumentResult<bool> {
        Ok(self.channel_state(channel)?.is_busy())
    }

    /// True while the experiment on `channel` is paused.
    pub fn is_channel_paused(&self, channel: u8) -> InstrumentResult<bool> {
        Ok(self.channel_state(channel)? == ChannelState::Paused)
    }

    /// Channels available for a new run.
    pub fn free_channels(&self) -> Vec<u8> {
        self.shared
            .channels
            .iter()
            .filter(|slot| {
                let session = slot.session.lock();
                !session.state().is_busy()
                    && !session.has_run()
                    && session.check_addressable().is_ok()
            })
            .map(|slot| slot.channel)
            .collect()
    }

    /// UTC start time of the most recent run on `channel`.
    pub fn experiment_start_time(&self, channel: u8) -> InstrumentResult<Option<DateTime<Utc>>> {
        Ok(self.slot(channel)?.session.lock().started_at())
    }

    /// Ask the device to erase retained recovery data.
    ///
    /// The outcome is published as `RecoveryDataErased`.
    #[instrument(skip(self), fields(device = %self.shared.info.name))]
    pub async fn erase_recovery_data(&self) -> InstrumentResult<()> {
        self.ready()?;
        self.send(
            Operation::EraseRecoveryData,
            0,
            DeviceCommand::EraseRecoveryData,
        )
        .await
    }

    /// Begin a firmware update to `version`. Yields progress percentages
    /// until the device reboots.
    pub(crate) async fn update_firmware(
        &self,
        version: u32,
    ) -> InstrumentResult<mpsc::UnboundedReceiver<u8>> {
        self.ready()?;
        let mut gates = Vec::with_capacity(self.shared.channels.len());
        for slot in &self.shared.channels {
            gates.push(slot.gate()?);
            let session = slot.session.lock();
            if session.state().is_busy() || session.has_run() {
                return Err(InstrumentError::BusyChannel(slot.channel));
            }
        }
        if self
            .shared
            .updating
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(InstrumentError::FirmwareUpdateInProgress(
                self.name().to_string(),
            ));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *self.shared.firmware_progress.lock() = Some(tx);
        if let Err(e) = self
            .send(
                Operation::FirmwareUpdate,
                0,
                DeviceCommand::UpdateFirmware { version },
            )
            .await
        {
            self.shared.firmware_progress.lock().take();
            self.shared.updating.store(false, Ordering::Release);
            return Err(e);
        }
        info!(device = %self.name(), from = self.shared.info.firmware_version, to = version, "Firmware update started");
        drop(gates);
        Ok(rx)
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

async fn dispatch(shared: Arc<Shared>, mut notifications: mpsc::Receiver<DeviceNotification>) {
    while let Some(notification) = notifications.recv().await {
        if notification == DeviceNotification::Disconnected {
            break;
        }
        shared.handle(notification);
    }
    shared.on_disconnect();
}

impl Shared {
    fn name(&self) -> &str {
        &self.info.name
    }

    fn publish(&self, event: InstrumentEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn slot(&self, channel: u8) -> Option<&ChannelSlot> {
        let slot = self.channels.get(channel as usize);
        if slot.is_none() {
            warn!(device = %self.name(), channel, "Notification for unknown channel");
        }
        slot
    }

    fn handle(&self, notification: DeviceNotification) {
        match notification {
            DeviceNotification::Sample {
                channel,
                provenance,
                sample,
            } => self.on_sample(channel, provenance, sample),
            DeviceNotification::StepStarted { channel, ordinal } => {
                let Some(slot) = self.slot(channel) else {
                    return;
                };
                let node = slot.session.lock().on_step_started(ordinal);
                match node {
                    Some(node) => {
                        debug!(device = %self.name(), channel, ordinal, step = %node.step_name, "Step started");
                        self.publish(InstrumentEvent::channel(
                            self.name(),
                            channel,
                            EventKind::NewElementStarting { node },
                        ));
                    }
                    None => {
                        warn!(device = %self.name(), channel, ordinal, "Ignoring step report outside a run");
                    }
                }
            }
            DeviceNotification::RecoveryStepStarted { channel, node } => {
                if let Some(slot) = self.slot(channel) {
                    debug!(device = %self.name(), channel, step = %node.step_name, "Replaying recovery data");
                    slot.session.lock().on_recovery_step(node);
                }
            }
            DeviceNotification::Stopped { channel, reason } => self.finish(channel, reason),
            DeviceNotification::Paused { channel } => {
                let Some(slot) = self.slot(channel) else {
                    return;
                };
                let has_run = {
                    let mut session = slot.session.lock();
                    session.apply_pause();
                    session.has_run()
                };
                if has_run {
                    self.publish(InstrumentEvent::channel(
                        self.name(),
                        channel,
                        EventKind::ExperimentPaused,
                    ));
                }
            }
            DeviceNotification::Resumed { channel } => {
                let Some(slot) = self.slot(channel) else {
                    return;
                };
                let has_run = {
                    let mut session = slot.session.lock();
                    session.apply_resume();
                    session.has_run()
                };
                if has_run {
                    self.publish(InstrumentEvent::channel(
                        self.name(),
                        channel,
                        EventKind::ExperimentResumed,
                    ));
                }
            }
            DeviceNotification::Error {
                channel,
                message,
                fatal,
            } => {
                if self.slot(channel).is_none() {
                    return;
                }
                if fatal {
                    error!(device = %self.name(), channel, %message, "Device fault");
                } else {
                    warn!(device = %self.name(), channel, %message, "Device warning");
                }
                self.publish(InstrumentEvent::channel(
                    self.name(),
                    channel,
                    EventKind::DeviceError {
                        message: message.clone(),
                    },
                ));
                if fatal {
                    self.finish(channel, StopReason::DeviceError(message));
                }
            }
            DeviceNotification::GroundFloat { floating } => {
                info!(device = %self.name(), floating, "Ground float changed");
                self.publish(InstrumentEvent::device(
                    self.name(),
                    EventKind::GroundFloatChanged { floating },
                ));
            }
            DeviceNotification::FirmwareProgress { percent } => {
                match self.firmware_progress.lock().as_ref() {
                    Some(tx) => {
                        let _ = tx.send(percent);
                    }
                    None => warn!(device = %self.name(), percent, "Firmware progress without an update"),
                }
            }
            DeviceNotification::RecoveryErased { success } => {
                info!(device = %self.name(), success, "Recovery data erase finished");
                self.publish(InstrumentEvent::device(
                    self.name(),
                    EventKind::RecoveryDataErased { success },
                ));
            }
            DeviceNotification::Disconnected => {}
        }
    }

    fn on_sample(&self, channel: u8, provenance: Provenance, sample: Sample) {
        let Some(slot) = self.slot(channel) else {
            return;
        };
        let (verdict, node) = {
            let mut session = slot.session.lock();
            let node = session.recovery_node().cloned();
            if provenance == Provenance::Recovery && node.is_none() {
                drop(session);
                warn!(device = %self.name(), channel, "Dropping recovery sample without step context");
                return;
            }
            (session.admit_sample(provenance, sample.timestamp()), node)
        };
        match verdict {
            SampleVerdict::Deliver => {}
            SampleVerdict::Regressed => {
                warn!(
                    device = %self.name(),
                    channel,
                    ?provenance,
                    timestamp = sample.timestamp(),
                    "Dropping sample with regressing or non-finite timestamp"
                );
                return;
            }
            SampleVerdict::NoRun => {
                warn!(device = %self.name(), channel, "Dropping active sample outside a run");
                return;
            }
        }

        let kind = match (provenance, sample, node) {
            (Provenance::Active, Sample::Dc(sample), _) => EventKind::ActiveDcData { sample },
            (Provenance::Active, Sample::Ac(sample), _) => EventKind::ActiveAcData { sample },
            (Provenance::Idle, Sample::Dc(sample), _) => EventKind::IdleDcData { sample },
            (Provenance::Idle, Sample::Ac(_), _) => {
                warn!(device = %self.name(), channel, "Dropping idle AC sample");
                return;
            }
            (Provenance::Recovery, Sample::Dc(sample), Some(node)) => {
                EventKind::RecoveryDcData { node, sample }
            }
            (Provenance::Recovery, Sample::Ac(sample), Some(node)) => {
                EventKind::RecoveryAcData { node, sample }
            }
            (Provenance::Recovery, _, None) => return,
        };
        self.publish(InstrumentEvent::channel(self.name(), channel, kind));
    }

    /// End the run on `channel`, publishing its stop once.
    fn finish(&self, channel: u8, reported: StopReason) {
        let Some(slot) = self.slot(channel) else {
            return;
        };
        let outcome = slot.session.lock().finish_run(reported);
        let Some(outcome) = outcome else {
            debug!(device = %self.name(), channel, "Stop report without an active run");
            return;
        };
        if let Some(group) = &outcome.dissolved {
            for slave in group.slaves() {
                if let Some(slot) = self.channels.get(slave as usize) {
                    slot.session.lock().set_link(None);
                }
            }
            debug!(device = %self.name(), master = channel, "Link group dissolved");
        }
        info!(
            device = %self.name(),
            channel,
            run_id = %outcome.run_id,
            reason = %outcome.reason,
            "Experiment stopped"
        );
        self.publish(InstrumentEvent::channel(
            self.name(),
            channel,
            EventKind::ExperimentStopped {
                reason: outcome.reason,
            },
        ));
        slot.finished.notify_waiters();
    }

    fn on_disconnect(&self) {
        for slot in &self.channels {
            self.finish(slot.channel, StopReason::Disconnected);
        }
        self.firmware_progress.lock().take();
        self.disconnected.send_replace(true);
        info!(device = %self.name(), port = %self.port, "Instrument disconnected");
        self.publish(InstrumentEvent::device(
            self.name(),
            EventKind::DeviceDisconnected,
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elements::{Element, OpenCircuit};
    use crate::sim::{SimBench, SimInstrument, SimSpec};
    use crate::transport::Connector;

    async fn connect(spec: SimSpec, settings: HandleSettings) -> (InstrumentHandle, SimInstrument) {
        let bench = SimBench::new();
        let sim = bench.plug("sim0", spec);
        let connection = bench.open("sim0").await.unwrap();
        let handle = InstrumentHandle::identify_and_spawn(connection, settings)
            .await
            .unwrap();
        (handle, sim)
    }

    fn ocp(duration: f64) -> Experiment {
        let mut exp = Experiment::named("ocp");
        exp.append_element(&Element::from(OpenCircuit::new(duration, 1.0)), 1);
        exp
    }

    async fn next_stop(events: &mut broadcast::Receiver<InstrumentEvent>, channel: u8) -> StopReason {
        loop {
            let event = events.recv().await.unwrap();
            if event.channel == Some(channel) {
                if let EventKind::ExperimentStopped { reason } = event.kind {
                    return reason;
                }
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn program_runs_to_completion_with_events() {
        let (handle, _sim) = connect(SimSpec::new("dev"), HandleSettings::default()).await;
        let mut events = handle.subscribe();

        handle.upload(0, &ocp(3.0)).await.unwrap();
        assert_eq!(handle.channel_state(0).unwrap(), ChannelState::Uploaded);
        handle.start(0).await.unwrap();
        assert!(handle.is_channel_busy(0).unwrap());
        assert!(handle.experiment_start_time(0).unwrap().is_some());

        let mut kinds = Vec::new();
        loop {
            let event = events.recv().await.unwrap();
            let stopped = matches!(event.kind, EventKind::ExperimentStopped { .. });
            kinds.push(event.kind);
            if stopped {
                break;
            }
        }
        assert!(matches!(kinds[0], EventKind::NewElementStarting { .. }));
        let samples = kinds
            .iter()
            .filter(|k| matches!(k, EventKind::ActiveDcData { .. }))
            .count();
        assert_eq!(samples, 3);
        assert_eq!(
            kinds.last(),
            Some(&EventKind::ExperimentStopped {
                reason: StopReason::Completed
            })
        );
        assert_eq!(handle.channel_state(0).unwrap(), ChannelState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn guards_fail_without_touching_the_transport() {
        let (handle, sim) = connect(SimSpec::new("dev"), HandleSettings::default()).await;
        sim.clear_call_log();

        assert_eq!(
            handle.pause(0).await,
            Err(InstrumentError::ChannelNotBusy(0))
        );
        assert_eq!(
            handle.start(0).await,
            Err(InstrumentError::ExperimentNotUploaded(0))
        );
        assert_eq!(
            handle.set_manual_voltage(0, 0.5).await,
            Err(InstrumentError::ManualExperimentNotRunning(0))
        );
        assert_eq!(
            handle.upload(9, &ocp(1.0)).await,
            Err(InstrumentError::InvalidChannel(9))
        );
        assert_eq!(
            handle.upload(0, &Experiment::new()).await,
            Err(InstrumentError::ExperimentIsEmpty)
        );
        assert!(matches!(
            handle.set_ir_compensation(0, 10.0, 120.0).await,
            Err(InstrumentError::InvalidParameters(_))
        ));
        assert!(sim.call_log().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_command_on_one_channel_is_busy() {
        let (handle, sim) = connect(SimSpec::new("dev"), HandleSettings::default()).await;
        sim.set_latency(Duration::from_millis(500));

        let first = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.upload(0, &ocp(5.0)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(
            handle.upload(0, &ocp(5.0)).await,
            Err(InstrumentError::BusyChannel(0))
        );
        // Other channels are unaffected.
        handle.upload(1, &ocp(5.0)).await.unwrap();
        first.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_reports_the_operation_failure_code() {
        let settings = HandleSettings {
            command_timeout: Duration::from_secs(1),
            ..HandleSettings::default()
        };
        let (handle, sim) = connect(SimSpec::new("dev"), settings).await;
        sim.set_latency(Duration::from_secs(3));

        let err = handle.upload(0, &ocp(5.0)).await.unwrap_err();
        assert_eq!(err.code(), Operation::Upload.failure_code());
        assert_eq!(handle.channel_state(0).unwrap(), ChannelState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_reported_once_as_user_requested() {
        let (handle, _sim) = connect(SimSpec::new("dev"), HandleSettings::default()).await;
        let mut events = handle.subscribe();

        handle.upload(2, &ocp(60.0)).await.unwrap();
        handle.start(2).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        handle.stop(2).await.unwrap();
        assert_eq!(handle.channel_state(2).unwrap(), ChannelState::Idle);

        assert_eq!(next_stop(&mut events, 2).await, StopReason::UserRequested);
        tokio::time::sleep(Duration::from_secs(10)).await;
        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event.kind, EventKind::ExperimentStopped { .. }));
            assert!(!matches!(event.kind, EventKind::ActiveDcData { .. }));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slaves_reject_session_commands() {
        let (handle, _sim) = connect(SimSpec::new("dev"), HandleSettings::default()).await;

        assert_eq!(handle.set_linked_channels(&[2, 1]).await, Ok(1));
        assert_eq!(
            handle.upload(2, &ocp(1.0)).await,
            Err(InstrumentError::ChannelLinked {
                channel: 2,
                master: 1
            })
        );
        assert_eq!(handle.linked_channels(2).unwrap(), vec![1, 2]);
        assert!(!handle.has_bipolar_mode(1).unwrap());
        assert_eq!(handle.free_channels(), vec![0, 1, 3]);

        // The group dissolves when the master's run ends.
        let reason = handle
            .run_to_completion(1, &ocp(2.0), Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(reason, StopReason::Completed);
        assert!(handle.linked_channels(2).unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn relink_waits_for_commands_on_released_slaves() {
        let (handle, _sim) = connect(SimSpec::new("dev"), HandleSettings::default()).await;
        assert_eq!(handle.set_linked_channels(&[0, 1]).await, Ok(0));

        let held = handle.slot(1).unwrap().gate().unwrap();
        assert_eq!(
            handle.set_linked_channels(&[0, 2]).await,
            Err(InstrumentError::BusyChannel(1))
        );
        assert_eq!(handle.linked_channels(1).unwrap(), vec![0, 1]);

        drop(held);
        assert_eq!(handle.set_linked_channels(&[0, 2]).await, Ok(0));
        assert!(handle.linked_channels(1).unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unsupported_linking_is_refused() {
        let (handle, sim) =
            connect(SimSpec::new("dev").without_linking(), HandleSettings::default()).await;
        sim.clear_call_log();
        assert!(matches!(
            handle.set_bipolar_linked_channels(&[0, 1]).await,
            Err(InstrumentError::FeatureNotSupported(_))
        ));
        assert!(sim.call_log().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_error_forces_device_error_stop() {
        let (handle, sim) = connect(SimSpec::new("dev"), HandleSettings::default()).await;
        let mut events = handle.subscribe();
        handle.upload(0, &ocp(60.0)).await.unwrap();
        handle.start(0).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1_500)).await;

        sim.inject_fault(0, "overcurrent").await;
        assert_eq!(
            next_stop(&mut events, 0).await,
            StopReason::DeviceError("overcurrent".to_string())
        );
        assert_eq!(handle.channel_state(0).unwrap(), ChannelState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_stops_runs_then_reports_device_once() {
        let (handle, sim) = connect(SimSpec::new("dev"), HandleSettings::default()).await;
        let mut events = handle.subscribe();
        handle.upload(3, &ocp(60.0)).await.unwrap();
        handle.start(3).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1_500)).await;

        sim.unplug();
        handle.wait_disconnected().await;

        let mut tail = Vec::new();
        while let Ok(event) = events.try_recv() {
            if event.kind.provenance().is_none() {
                tail.push(event);
            }
        }
        let n = tail.len();
        assert!(n >= 2);
        assert_eq!(
            tail[n - 2].kind,
            EventKind::ExperimentStopped {
                reason: StopReason::Disconnected
            }
        );
        assert_eq!(tail[n - 1].kind, EventKind::DeviceDisconnected);
        assert_eq!(
            handle.start(3).await,
            Err(InstrumentError::DeviceNotFound("dev".to_string()))
        );
    }
}
