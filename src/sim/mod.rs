//! Simulated instruments.
//!
//! [`SimBench`] is a [`Connector`] over a set of simulated ports. Each port
//! holds a [`SimInstrument`] that implements the device side of the command
//! and notification vocabulary on tokio timers: it executes uploaded
//! programs against a [`SimCell`], honours pause/resume/skip/stop, runs
//! manual mode and idle sampling, trips on channel limits, retains data of
//! interrupted runs for recovery replay and performs firmware updates.
//!
//! The bench is the test double for the whole crate and backs the CLI
//! `simulate` command. Like a mock adapter it supports failure injection,
//! added latency and a command log.
//!
//! # Example
//!
//! ```
//! use echem_daq::sim::{SimBench, SimSpec};
//! use echem_daq::transport::Connector;
//!
//! # tokio_test::block_on(async {
//! let bench = SimBench::new();
//! bench.plug("sim0", SimSpec::new("Plus1000"));
//! assert_eq!(bench.available_ports().await.unwrap(), vec!["sim0".to_string()]);
//! # })
//! ```

mod cell;
mod runner;

pub use cell::SimCell;

use crate::elements::sampling_interval;
use crate::error::TransportError;
use crate::experiment::ExecutionPlan;
use crate::session::{ChannelLimits, LinkGroup, LinkMode, ManualRange};
use crate::transport::protocol::{encode_line, HostFrame, ReplyFrame};
use crate::transport::{
    Connection, Connector, DeviceCommand, DeviceFrame, DeviceInfo, DeviceNotification,
    DeviceReply, RejectCode, SerialPortIO, Transport,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use runner::{ManualSettings, RecoveryBuffer, RunControl, TaskContext};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default notification queue depth of simulated connections.
pub const DEFAULT_NOTIFICATION_CAPACITY: usize = 1024;

/// Delay between simulated firmware progress reports.
const FIRMWARE_STEP: Duration = Duration::from_millis(250);

// =============================================================================
// SimSpec
// =============================================================================

/// Identity and capabilities of a simulated instrument.
#[derive(Debug, Clone, PartialEq)]
pub struct SimSpec {
    /// Device name reported on identify
    pub name: String,
    /// Model string
    pub model: String,
    /// Serial number
    pub serial_number: String,
    /// Installed firmware version
    pub firmware_version: u32,
    /// Number of channels
    pub channel_count: u8,
    /// Accepts link groups
    pub supports_linking: bool,
    /// Accepts bipolar link groups
    pub supports_bipolar: bool,
    /// Selectable current ranges (A)
    pub current_ranges: Vec<f64>,
    /// Selectable voltage ranges (V)
    pub voltage_ranges: Vec<f64>,
    /// Electrical model every channel measures
    pub cell: SimCell,
}

impl SimSpec {
    /// A four-channel instrument with linking and bipolar support.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            serial_number: format!("SIM-{name}"),
            name,
            model: "Simulated Cycler".to_string(),
            firmware_version: 100,
            channel_count: 4,
            supports_linking: true,
            supports_bipolar: true,
            current_ranges: vec![1.0, 0.1, 0.01, 1e-3, 1e-4, 1e-5, 1e-6, 1e-7],
            voltage_ranges: vec![10.0, 2.0, 0.5],
            cell: SimCell::default(),
        }
    }

    /// Set the number of channels.
    pub fn with_channels(mut self, channel_count: u8) -> Self {
        self.channel_count = channel_count;
        self
    }

    /// Set the reported firmware version.
    pub fn with_firmware(mut self, version: u32) -> Self {
        self.firmware_version = version;
        self
    }

    /// Disable channel linking and bipolar mode.
    pub fn without_linking(mut self) -> Self {
        self.supports_linking = false;
        self.supports_bipolar = false;
        self
    }

    fn info(&self) -> DeviceInfo {
        DeviceInfo {
            name: self.name.clone(),
            model: self.model.clone(),
            serial_number: self.serial_number.clone(),
            firmware_version: self.firmware_version,
            channel_count: self.channel_count,
            supports_linking: self.supports_linking,
            supports_bipolar: self.supports_bipolar,
            current_ranges: self.current_ranges.clone(),
            voltage_ranges: self.voltage_ranges.clone(),
        }
    }
}

// =============================================================================
// Device state
// =============================================================================

enum TaskKind {
    Program,
    Manual(watch::Sender<ManualSettings>),
}

struct ChannelTask {
    kind: TaskKind,
    control: watch::Sender<RunControl>,
    handle: JoinHandle<()>,
    ended: Arc<AtomicBool>,
}

impl ChannelTask {
    fn is_live(&self) -> bool {
        !self.ended.load(Ordering::Acquire) && !self.handle.is_finished()
    }
}

#[derive(Default)]
struct SimChannel {
    plan: Option<Arc<ExecutionPlan>>,
    task: Option<ChannelTask>,
    idle: Option<JoinHandle<()>>,
    limits: ChannelLimits,
    recovery: RecoveryBuffer,
}

impl SimChannel {
    fn live_task(&self) -> Option<&ChannelTask> {
        self.task.as_ref().filter(|t| t.is_live())
    }

    fn stop_idle(&mut self) {
        if let Some(idle) = self.idle.take() {
            idle.abort();
        }
    }

    fn abort_all(&mut self) {
        self.stop_idle();
        if let Some(task) = self.task.take() {
            task.handle.abort();
        }
    }
}

struct Link {
    generation: u64,
    tx: mpsc::Sender<DeviceNotification>,
}

struct DeviceState {
    spec: SimSpec,
    channels: Vec<SimChannel>,
    link: Option<Link>,
    generation: u64,
    groups: Vec<LinkGroup>,
    updating: bool,
}

struct SimInner {
    state: Mutex<DeviceState>,
    fail_next: AtomicBool,
    latency: Mutex<Duration>,
    call_log: Mutex<Vec<String>>,
}

/// Control handle of one simulated instrument.
#[derive(Clone)]
pub struct SimInstrument {
    inner: Arc<SimInner>,
}

impl std::fmt::Debug for SimInstrument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("SimInstrument")
            .field("name", &state.spec.name)
            .field("connected", &state.link.is_some())
            .finish()
    }
}

type Outcome = (DeviceReply, Vec<DeviceNotification>);

fn ack() -> Outcome {
    (DeviceReply::Ack, Vec::new())
}

fn reject(code: RejectCode, message: impl Into<String>) -> Outcome {
    (DeviceReply::rejected(code, message), Vec::new())
}

impl SimInstrument {
    /// Create an unplugged instrument.
    pub fn new(spec: SimSpec) -> Self {
        let channels = (0..spec.channel_count).map(|_| SimChannel::default()).collect();
        Self {
            inner: Arc::new(SimInner {
                state: Mutex::new(DeviceState {
                    spec,
                    channels,
                    link: None,
                    generation: 0,
                    groups: Vec::new(),
                    updating: false,
                }),
                fail_next: AtomicBool::new(false),
                latency: Mutex::new(Duration::ZERO),
                call_log: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Device name.
    pub fn name(&self) -> String {
        self.inner.state.lock().spec.name.clone()
    }

    /// Current firmware version.
    pub fn firmware_version(&self) -> u32 {
        self.inner.state.lock().spec.firmware_version
    }

    /// True while a host connection is open.
    pub fn is_connected(&self) -> bool {
        self.inner.state.lock().link.is_some()
    }

    /// Make the next request fail at the transport level.
    pub fn trigger_failure(&self) {
        self.inner.fail_next.store(true, Ordering::SeqCst);
    }

    /// Delay every reply by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *self.inner.latency.lock() = latency;
    }

    /// Names of all commands received, in order.
    pub fn call_log(&self) -> Vec<String> {
        self.inner.call_log.lock().clone()
    }

    /// Clear the command log.
    pub fn clear_call_log(&self) {
        self.inner.call_log.lock().clear();
    }

    /// Samples retained for recovery on `channel`.
    pub fn recovery_len(&self, channel: u8) -> usize {
        let state = self.inner.state.lock();
        state
            .channels
            .get(channel as usize)
            .map_or(0, |c| c.recovery.lock().len())
    }

    fn sender(&self) -> Option<mpsc::Sender<DeviceNotification>> {
        self.inner.state.lock().link.as_ref().map(|l| l.tx.clone())
    }

    /// Report a fatal fault on `channel`, aborting whatever runs there.
    pub async fn inject_fault(&self, channel: u8, message: impl Into<String>) {
        let tx = {
            let mut state = self.inner.state.lock();
            if let Some(ch) = state.channels.get_mut(channel as usize) {
                if let Some(task) = ch.task.take() {
                    task.handle.abort();
                }
            }
            state.link.as_ref().map(|l| l.tx.clone())
        };
        if let Some(tx) = tx {
            let _ = tx
                .send(DeviceNotification::Error {
                    channel,
                    message: message.into(),
                    fatal: true,
                })
                .await;
        }
    }

    /// Report a non-fatal warning on `channel`.
    pub async fn inject_warning(&self, channel: u8, message: impl Into<String>) {
        if let Some(tx) = self.sender() {
            let _ = tx
                .send(DeviceNotification::Error {
                    channel,
                    message: message.into(),
                    fatal: false,
                })
                .await;
        }
    }

    /// Report a ground float state change.
    pub async fn set_ground_float(&self, floating: bool) {
        if let Some(tx) = self.sender() {
            let _ = tx.send(DeviceNotification::GroundFloat { floating }).await;
        }
    }

    /// Emit a raw notification, bypassing the device model.
    pub async fn emit(&self, notification: DeviceNotification) {
        if let Some(tx) = self.sender() {
            let _ = tx.send(notification).await;
        }
    }

    /// Open the device side of a connection.
    fn open(&self, port: &str, capacity: usize) -> Result<Connection, TransportError> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let mut state = self.inner.state.lock();
        if state.link.is_some() {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::AddrInUse,
                format!("port {port} is already open"),
            )));
        }
        state.generation += 1;
        let generation = state.generation;
        state.link = Some(Link {
            generation,
            tx: tx.clone(),
        });

        for (index, channel) in state.channels.iter().enumerate() {
            let retained = channel.recovery.lock().clone();
            if !retained.is_empty() {
                debug!(channel = index, samples = retained.len(), "Replaying recovery data");
                tokio::spawn(runner::replay_recovery(tx.clone(), index as u8, retained));
            }
        }
        info!(device = %state.spec.name, %port, "Simulated device opened");

        Ok(Connection {
            port: port.to_string(),
            transport: Arc::new(SimLink {
                instrument: self.clone(),
                generation,
            }),
            notifications: rx,
        })
    }

    /// Drop the connection with generation `generation`.
    ///
    /// Running programs keep their retained samples for recovery.
    fn drop_link(&self, generation: u64, announce: bool) {
        let link = {
            let mut state = self.inner.state.lock();
            match &state.link {
                Some(link) if link.generation == generation => {}
                _ => return,
            }
            for channel in &mut state.channels {
                channel.abort_all();
                channel.plan = None;
            }
            state.groups.clear();
            state.link.take()
        };
        if let (Some(link), true) = (link, announce) {
            let _ = link.tx.try_send(DeviceNotification::Disconnected);
        }
    }

    /// Simulate a cable pull.
    pub fn unplug(&self) {
        let generation = self.inner.state.lock().generation;
        self.drop_link(generation, true);
    }

    fn task_context(&self, state: &DeviceState, channel: u8, tx: mpsc::Sender<DeviceNotification>) -> TaskContext {
        let slot = &state.channels[channel as usize];
        TaskContext {
            channel,
            tx,
            limits: slot.limits,
            cell: state.spec.cell,
            recovery: Arc::clone(&slot.recovery),
            ended: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Apply one command to the device model.
    fn execute(&self, generation: u64, command: DeviceCommand) -> Result<Outcome, TransportError> {
        let mut state = self.inner.state.lock();
        let tx = match &state.link {
            Some(link) if link.generation == generation => link.tx.clone(),
            _ => return Err(TransportError::Disconnected),
        };
        if state.updating {
            return Ok(reject(RejectCode::Failed, "firmware update in progress"));
        }

        if let Some(channel) = command_channel(&command) {
            if channel >= state.spec.channel_count {
                return Ok(reject(
                    RejectCode::InvalidChannel,
                    format!("no channel {channel}"),
                ));
            }
        }

        let outcome = match command {
            DeviceCommand::Identify => (
                DeviceReply::Identity {
                    info: state.spec.info(),
                },
                Vec::new(),
            ),
            DeviceCommand::Upload { channel, plan } => {
                let slot = &mut state.channels[channel as usize];
                if slot.live_task().is_some() {
                    return Ok(reject(RejectCode::BusyChannel, "channel is running"));
                }
                let violations: Vec<String> = plan
                    .iter()
                    .flat_map(|step| step.element.parameter_violations())
                    .collect();
                if !violations.is_empty() {
                    return Ok(reject(RejectCode::InvalidParameters, violations.join("; ")));
                }
                slot.plan = Some(Arc::new(plan));
                ack()
            }
            DeviceCommand::Start { channel } => {
                if state.channels[channel as usize].live_task().is_some() {
                    return Ok(reject(RejectCode::BusyChannel, "channel is running"));
                }
                let Some(plan) = state.channels[channel as usize].plan.take() else {
                    return Ok(reject(RejectCode::ExperimentNotUploaded, "nothing uploaded"));
                };
                let ctx = self.task_context(&state, channel, tx);
                let ended = Arc::clone(&ctx.ended);
                let (control, control_rx) = watch::channel(RunControl::default());
                let handle = tokio::spawn(runner::run_program(ctx, plan, control_rx));
                let slot = &mut state.channels[channel as usize];
                slot.stop_idle();
                slot.task = Some(ChannelTask {
                    kind: TaskKind::Program,
                    control,
                    handle,
                    ended,
                });
                ack()
            }
            DeviceCommand::Pause { channel } => {
                match program_control(&state, channel) {
                    Some(control) if !control.borrow().paused => {
                        control.send_modify(|c| c.paused = true);
                        (DeviceReply::Ack, vec![DeviceNotification::Paused { channel }])
                    }
                    Some(_) => reject(RejectCode::Failed, "already paused"),
                    None => reject(RejectCode::ChannelNotBusy, "no program running"),
                }
            }
            DeviceCommand::Resume { channel } => {
                match program_control(&state, channel) {
                    Some(control) if control.borrow().paused => {
                        control.send_modify(|c| c.paused = false);
                        (DeviceReply::Ack, vec![DeviceNotification::Resumed { channel }])
                    }
                    Some(_) => reject(RejectCode::Failed, "not paused"),
                    None => reject(RejectCode::ChannelNotBusy, "no program running"),
                }
            }
            DeviceCommand::Skip { channel } => match program_control(&state, channel) {
                Some(control) => {
                    control.send_modify(|c| c.skips += 1);
                    ack()
                }
                None => reject(RejectCode::ChannelNotBusy, "no program running"),
            },
            DeviceCommand::Stop { channel } => {
                match state.channels[channel as usize].live_task() {
                    Some(task) => {
                        task.control.send_modify(|c| c.stop = true);
                        ack()
                    }
                    None => reject(RejectCode::ChannelNotBusy, "nothing running"),
                }
            }
            DeviceCommand::StartManual { channel } => {
                if state.channels[channel as usize].live_task().is_some() {
                    return Ok(reject(RejectCode::BusyChannel, "channel is running"));
                }
                let ctx = self.task_context(&state, channel, tx);
                let ended = Arc::clone(&ctx.ended);
                let (control, control_rx) = watch::channel(RunControl::default());
                let (settings, settings_rx) = watch::channel(ManualSettings::default());
                let handle = tokio::spawn(runner::run_manual(ctx, settings_rx, control_rx));
                let slot = &mut state.channels[channel as usize];
                slot.stop_idle();
                slot.plan = None;
                slot.task = Some(ChannelTask {
                    kind: TaskKind::Manual(settings),
                    control,
                    handle,
                    ended,
                });
                ack()
            }
            DeviceCommand::StartIdleSampling { channel } => {
                let busy = state.channels[channel as usize].live_task().is_some();
                if busy {
                    return Ok(reject(RejectCode::BusyChannel, "channel is running"));
                }
                let running = state.channels[channel as usize]
                    .idle
                    .as_ref()
                    .is_some_and(|h| !h.is_finished());
                if !running {
                    let ctx = self.task_context(&state, channel, tx);
                    state.channels[channel as usize].idle =
                        Some(tokio::spawn(runner::run_idle_sampling(ctx)));
                }
                ack()
            }
            DeviceCommand::SetManualSetpoint { channel, setpoint } => {
                match manual_settings(&state, channel) {
                    Some(settings) => {
                        settings.send_modify(|s| s.setpoint = setpoint);
                        ack()
                    }
                    None => reject(RejectCode::ManualExperimentNotRunning, "not in manual mode"),
                }
            }
            DeviceCommand::SetManualSamplingInterval { channel, seconds } => {
                let Some(interval) = sampling_interval(seconds) else {
                    return Ok(reject(
                        RejectCode::InvalidParameters,
                        format!("sampling interval out of range (got {seconds})"),
                    ));
                };
                match manual_settings(&state, channel) {
                    Some(settings) => {
                        settings.send_modify(|s| s.interval = interval);
                        ack()
                    }
                    None => reject(RejectCode::ManualExperimentNotRunning, "not in manual mode"),
                }
            }
            DeviceCommand::SetManualRange { channel, range } => {
                let table_len = match range {
                    ManualRange::Current(_) => state.spec.current_ranges.len(),
                    ManualRange::Voltage(_) => state.spec.voltage_ranges.len(),
                    ManualRange::CurrentAuto | ManualRange::VoltageAuto => usize::MAX,
                };
                let index = match range {
                    ManualRange::Current(i) | ManualRange::Voltage(i) => i as usize,
                    ManualRange::CurrentAuto | ManualRange::VoltageAuto => 0,
                };
                if index >= table_len {
                    return Ok(reject(
                        RejectCode::InvalidParameters,
                        format!("range index {index} out of bounds"),
                    ));
                }
                match manual_settings(&state, channel) {
                    Some(_) => ack(),
                    None => reject(RejectCode::ManualExperimentNotRunning, "not in manual mode"),
                }
            }
            DeviceCommand::SetLimit {
                channel,
                kind,
                value,
            } => {
                if !value.is_finite() {
                    return Ok(reject(RejectCode::InvalidParameters, "limit must be finite"));
                }
                state.channels[channel as usize].limits.set(kind, value);
                ack()
            }
            DeviceCommand::ResetLimits { channel } => {
                state.channels[channel as usize].limits.reset();
                ack()
            }
            DeviceCommand::SetIrCompensation { compensation, .. } => {
                if !(0.0..=100.0).contains(&compensation.percent) || compensation.resistance < 0.0
                {
                    reject(RejectCode::InvalidParameters, "invalid IR compensation")
                } else {
                    ack()
                }
            }
            DeviceCommand::SetCompRange { .. } => ack(),
            DeviceCommand::LinkChannels { group } => {
                let supported = match group.mode {
                    LinkMode::Parallel => state.spec.supports_linking,
                    LinkMode::Bipolar => state.spec.supports_bipolar,
                };
                if !supported {
                    return Ok(reject(
                        RejectCode::FeatureNotSupported,
                        format!("{:?} linking", group.mode),
                    ));
                }
                if group
                    .members
                    .iter()
                    .any(|&c| state.channels[c as usize].live_task().is_some())
                {
                    return Ok(reject(RejectCode::BusyChannel, "member channel is running"));
                }
                state
                    .groups
                    .retain(|g| !g.members.iter().any(|c| group.members.contains(c)));
                state.groups.push(group);
                ack()
            }
            DeviceCommand::EraseRecoveryData => {
                let running = state.channels.iter().any(|c| c.live_task().is_some());
                if !running {
                    for channel in &state.channels {
                        channel.recovery.lock().clear();
                    }
                }
                (
                    DeviceReply::Ack,
                    vec![DeviceNotification::RecoveryErased { success: !running }],
                )
            }
            DeviceCommand::UpdateFirmware { version } => {
                if state.channels.iter().any(|c| c.live_task().is_some()) {
                    return Ok(reject(RejectCode::BusyChannel, "a channel is running"));
                }
                state.updating = true;
                tokio::spawn(firmware_update(self.clone(), generation, version, tx));
                ack()
            }
        };
        Ok(outcome)
    }
}

fn command_channel(command: &DeviceCommand) -> Option<u8> {
    match command {
        DeviceCommand::Upload { channel, .. }
        | DeviceCommand::Start { channel }
        | DeviceCommand::Pause { channel }
        | DeviceCommand::Resume { channel }
        | DeviceCommand::Stop { channel }
        | DeviceCommand::Skip { channel }
        | DeviceCommand::StartManual { channel }
        | DeviceCommand::StartIdleSampling { channel }
        | DeviceCommand::SetManualSetpoint { channel, .. }
        | DeviceCommand::SetManualSamplingInterval { channel, .. }
        | DeviceCommand::SetManualRange { channel, .. }
        | DeviceCommand::SetLimit { channel, .. }
        | DeviceCommand::ResetLimits { channel }
        | DeviceCommand::SetIrCompensation { channel, .. }
        | DeviceCommand::SetCompRange { channel, .. } => Some(*channel),
        DeviceCommand::LinkChannels { group } => group.members.iter().copied().max(),
        DeviceCommand::Identify
        | DeviceCommand::EraseRecoveryData
        | DeviceCommand::UpdateFirmware { .. } => None,
    }
}

fn program_control(state: &DeviceState, channel: u8) -> Option<&watch::Sender<RunControl>> {
    state.channels[channel as usize]
        .live_task()
        .filter(|t| matches!(t.kind, TaskKind::Program))
        .map(|t| &t.control)
}

fn manual_settings(state: &DeviceState, channel: u8) -> Option<&watch::Sender<ManualSettings>> {
    match state.channels[channel as usize].live_task() {
        Some(ChannelTask {
            kind: TaskKind::Manual(settings),
            ..
        }) => Some(settings),
        _ => None,
    }
}

async fn firmware_update(
    instrument: SimInstrument,
    generation: u64,
    version: u32,
    tx: mpsc::Sender<DeviceNotification>,
) {
    for percent in [0u8, 25, 50, 75, 100] {
        tokio::time::sleep(FIRMWARE_STEP).await;
        if tx
            .send(DeviceNotification::FirmwareProgress { percent })
            .await
            .is_err()
        {
            break;
        }
    }
    {
        let mut state = instrument.inner.state.lock();
        state.spec.firmware_version = version;
        state.updating = false;
    }
    info!(version, "Simulated firmware update applied; rebooting");
    instrument.drop_link(generation, true);
}

// =============================================================================
// SimLink: Transport
// =============================================================================

/// Host side of a simulated connection.
struct SimLink {
    instrument: SimInstrument,
    generation: u64,
}

#[async_trait]
impl Transport for SimLink {
    async fn request(&self, command: DeviceCommand) -> Result<DeviceReply, TransportError> {
        let inner = &self.instrument.inner;
        inner.call_log.lock().push(command.name().to_string());

        let latency = *inner.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if inner.fail_next.swap(false, Ordering::SeqCst) {
            return Err(TransportError::Io(std::io::Error::other(
                "injected transport failure",
            )));
        }

        let (reply, notifications) = self.instrument.execute(self.generation, command)?;
        if !notifications.is_empty() {
            if let Some(tx) = self.instrument.sender() {
                for notification in notifications {
                    let _ = tx.send(notification).await;
                }
            }
        }
        Ok(reply)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.instrument.drop_link(self.generation, false);
        Ok(())
    }
}

// =============================================================================
// SimBench: Connector
// =============================================================================

struct BenchState {
    ports: BTreeMap<String, SimInstrument>,
    notification_capacity: usize,
}

/// A set of simulated ports.
#[derive(Clone)]
pub struct SimBench {
    inner: Arc<Mutex<BenchState>>,
}

impl Default for SimBench {
    fn default() -> Self {
        Self::new()
    }
}

impl SimBench {
    /// Create an empty bench.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_NOTIFICATION_CAPACITY)
    }

    /// Create an empty bench whose connections queue `capacity` notifications.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BenchState {
                ports: BTreeMap::new(),
                notification_capacity: capacity,
            })),
        }
    }

    /// Attach a new instrument on `port`, replacing whatever was there.
    pub fn plug(&self, port: impl Into<String>, spec: SimSpec) -> SimInstrument {
        let instrument = SimInstrument::new(spec);
        self.plug_instrument(port, instrument.clone());
        instrument
    }

    /// Attach an existing instrument on `port`.
    pub fn plug_instrument(&self, port: impl Into<String>, instrument: SimInstrument) {
        let port = port.into();
        if let Some(previous) = self.inner.lock().ports.insert(port.clone(), instrument) {
            warn!(%port, "Replacing simulated instrument");
            previous.unplug();
        }
    }

    /// Detach the instrument on `port`. Returns it if there was one.
    pub fn unplug(&self, port: &str) -> Option<SimInstrument> {
        let instrument = self.inner.lock().ports.remove(port)?;
        instrument.unplug();
        Some(instrument)
    }

    /// Instrument attached on `port`.
    pub fn instrument(&self, port: &str) -> Option<SimInstrument> {
        self.inner.lock().ports.get(port).cloned()
    }
}

#[async_trait]
impl Connector for SimBench {
    async fn available_ports(&self) -> Result<Vec<String>, TransportError> {
        Ok(self.inner.lock().ports.keys().cloned().collect())
    }

    async fn open(&self, port: &str) -> Result<Connection, TransportError> {
        let (instrument, capacity) = {
            let bench = self.inner.lock();
            match bench.ports.get(port) {
                Some(instrument) => (instrument.clone(), bench.notification_capacity),
                None => return Err(TransportError::PortNotFound(port.to_string())),
            }
        };
        instrument.open(port, capacity)
    }
}

// =============================================================================
// Line adapter
// =============================================================================

/// Serve `instrument` over a byte stream using the line framing.
///
/// Reads [`HostFrame`]s, answers each with a reply frame and forwards
/// notifications, until either side closes. Pair with
/// [`LineTransport`](crate::transport::LineTransport) on the other end of a
/// `tokio::io::duplex` to exercise the full wire path.
///
/// # Errors
///
/// Fails if the instrument is already connected or the stream fails.
pub async fn serve_line<S: SerialPortIO>(
    instrument: SimInstrument,
    port: &str,
    stream: S,
) -> Result<(), TransportError> {
    let Connection {
        transport,
        mut notifications,
        ..
    } = instrument.open(port, DEFAULT_NOTIFICATION_CAPACITY)?;
    let (read_half, write_half) = tokio::io::split(stream);
    let writer = Arc::new(tokio::sync::Mutex::new(write_half));

    let forward_writer = Arc::clone(&writer);
    let forward = tokio::spawn(async move {
        while let Some(notification) = notifications.recv().await {
            let goodbye = matches!(notification, DeviceNotification::Disconnected);
            let line = match encode_line(&DeviceFrame::Notification(notification)) {
                Ok(line) => line,
                Err(e) => {
                    warn!(error = %e, "Failed to encode notification");
                    continue;
                }
            };
            let mut w = forward_writer.lock().await;
            if w.write_all(&line).await.is_err() || goodbye {
                let _ = w.shutdown().await;
                break;
            }
        }
    });

    let mut lines = BufReader::new(read_half).lines();
    let result = loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break Ok(()),
            Err(e) => break Err(TransportError::Io(e)),
        };
        let frame: HostFrame = match serde_json::from_str(&line) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Discarding malformed host frame");
                continue;
            }
        };
        let result = match transport.request(frame.command).await {
            Ok(reply) => reply,
            Err(TransportError::Disconnected) => break Ok(()),
            Err(e) => DeviceReply::rejected(RejectCode::Failed, e.to_string()),
        };
        let line = encode_line(&DeviceFrame::Reply(ReplyFrame {
            id: frame.id,
            result,
        }))?;
        if let Err(e) = writer.lock().await.write_all(&line).await {
            break Err(TransportError::Io(e));
        }
    };

    let _ = transport.close().await;
    forward.abort();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elements::{Element, OpenCircuit};
    use crate::experiment::{flatten, Experiment};
    use crate::events::{Provenance, Sample, StopReason};

    fn plan(duration: f64) -> ExecutionPlan {
        let mut exp = Experiment::new();
        exp.append_element(&Element::from(OpenCircuit::new(duration, 1.0)), 1);
        flatten(&exp).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn program_runs_to_completion() {
        let bench = SimBench::new();
        let sim = bench.plug("sim0", SimSpec::new("Plus1000"));
        let mut conn = bench.open("sim0").await.unwrap();

        let reply = conn
            .transport
            .request(DeviceCommand::Upload {
                channel: 0,
                plan: plan(3.0),
            })
            .await
            .unwrap();
        assert_eq!(reply, DeviceReply::Ack);
        conn.transport
            .request(DeviceCommand::Start { channel: 0 })
            .await
            .unwrap();

        let mut samples = 0;
        loop {
            match conn.notifications.recv().await.unwrap() {
                DeviceNotification::StepStarted { ordinal, .. } => assert_eq!(ordinal, 0),
                DeviceNotification::Sample { sample, provenance, .. } => {
                    assert_eq!(provenance, Provenance::Active);
                    assert!(matches!(sample, Sample::Dc(_)));
                    samples += 1;
                }
                DeviceNotification::Stopped { reason, .. } => {
                    assert_eq!(reason, StopReason::Completed);
                    break;
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(samples, 3);
        assert_eq!(sim.call_log(), vec!["upload", "start"]);
    }

    #[tokio::test(start_paused = true)]
    async fn device_rejects_invalid_parameters() {
        let bench = SimBench::new();
        bench.plug("sim0", SimSpec::new("Plus1000"));
        let conn = bench.open("sim0").await.unwrap();

        let mut exp = Experiment::new();
        exp.append_element(&Element::from(OpenCircuit::new(3.0, -1.0)), 1);
        let reply = conn
            .transport
            .request(DeviceCommand::Upload {
                channel: 0,
                plan: flatten(&exp).unwrap(),
            })
            .await
            .unwrap();
        assert!(matches!(
            reply,
            DeviceReply::Rejected {
                code: RejectCode::InvalidParameters,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn failure_injection_is_one_shot() {
        let bench = SimBench::new();
        let sim = bench.plug("sim0", SimSpec::new("Plus1000"));
        let conn = bench.open("sim0").await.unwrap();

        sim.trigger_failure();
        assert!(conn.transport.request(DeviceCommand::Identify).await.is_err());
        assert!(conn.transport.request(DeviceCommand::Identify).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn port_opens_once_and_unplug_announces() {
        let bench = SimBench::new();
        bench.plug("sim0", SimSpec::new("Plus1000"));
        let mut conn = bench.open("sim0").await.unwrap();
        assert!(bench.open("sim0").await.is_err());
        assert!(matches!(
            bench.open("nope").await,
            Err(TransportError::PortNotFound(_))
        ));

        let sim = bench.unplug("sim0").unwrap();
        assert!(!sim.is_connected());
        assert_eq!(
            conn.notifications.recv().await,
            Some(DeviceNotification::Disconnected)
        );
        assert!(matches!(
            conn.transport.request(DeviceCommand::Identify).await,
            Err(TransportError::Disconnected)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn interrupted_run_is_replayed_on_reconnect() {
        let bench = SimBench::new();
        let sim = bench.plug("sim0", SimSpec::new("Plus1000"));
        let conn = bench.open("sim0").await.unwrap();
        conn.transport
            .request(DeviceCommand::Upload {
                channel: 1,
                plan: plan(10.0),
            })
            .await
            .unwrap();
        conn.transport
            .request(DeviceCommand::Start { channel: 1 })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(3_500)).await;
        sim.unplug();
        drop(conn);
        assert_eq!(sim.recovery_len(1), 3);

        bench.plug_instrument("sim0", sim.clone());
        let mut conn = bench.open("sim0").await.unwrap();
        let first = conn.notifications.recv().await.unwrap();
        assert!(matches!(
            first,
            DeviceNotification::RecoveryStepStarted { channel: 1, .. }
        ));
        for _ in 0..3 {
            assert!(matches!(
                conn.notifications.recv().await.unwrap(),
                DeviceNotification::Sample {
                    provenance: Provenance::Recovery,
                    ..
                }
            ));
        }
    }
}
