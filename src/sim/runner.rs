//! Channel tasks of the simulated instrument: program execution, manual
//! mode and idle sampling.

use super::cell::SimCell;
use crate::events::{Provenance, Sample, StopReason};
use crate::experiment::{Advance, ExecutionPlan, ExperimentNode};
use crate::session::{ChannelLimits, ManualSetpoint};
use crate::transport::DeviceNotification;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::debug;

/// Interval of background idle sampling.
pub(super) const IDLE_SAMPLING_INTERVAL: Duration = Duration::from_secs(1);

/// Host-driven control of a running channel task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(super) struct RunControl {
    pub paused: bool,
    /// Incremented by every skip request
    pub skips: u64,
    pub stop: bool,
}

/// Live manual mode settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(super) struct ManualSettings {
    pub setpoint: ManualSetpoint,
    pub interval: Duration,
}

impl Default for ManualSettings {
    fn default() -> Self {
        Self {
            setpoint: ManualSetpoint::OpenCircuit,
            interval: IDLE_SAMPLING_INTERVAL,
        }
    }
}

/// Samples retained on the device for replay after an interruption.
pub(super) type RecoveryBuffer = Arc<Mutex<Vec<(ExperimentNode, Sample)>>>;

/// Everything a channel task needs from its device.
pub(super) struct TaskContext {
    pub channel: u8,
    pub tx: mpsc::Sender<DeviceNotification>,
    pub limits: ChannelLimits,
    pub cell: SimCell,
    pub recovery: RecoveryBuffer,
    /// Set before the task reports its final notification
    pub ended: Arc<AtomicBool>,
}

impl TaskContext {
    /// Send a notification. False once the host side is gone.
    async fn notify(&self, notification: DeviceNotification) -> bool {
        self.tx.send(notification).await.is_ok()
    }

    /// Mark the run over, then send its last notification.
    async fn finish(&self, notification: DeviceNotification) {
        self.ended.store(true, Ordering::Release);
        self.notify(notification).await;
    }

    /// Report a tripped limit, if `sample` trips one. True if tripped.
    async fn check_limits(&self, sample: &Sample) -> bool {
        let Sample::Dc(dc) = sample else {
            return false;
        };
        match self.limits.violated_by(dc) {
            Some((kind, limit)) => {
                debug!(channel = self.channel, %kind, limit, "Simulated limit trip");
                self.finish(DeviceNotification::Error {
                    channel: self.channel,
                    message: format!("{kind} limit {limit} exceeded"),
                    fatal: true,
                })
                .await;
                true
            }
            None => false,
        }
    }
}

enum Tick {
    Elapsed,
    Skip,
    Stop,
}

/// Wait one sampling interval while honoring pause, skip and stop.
async fn wait_tick(
    control: &mut watch::Receiver<RunControl>,
    interval: Duration,
    skips_seen: &mut u64,
) -> Tick {
    let sleep = tokio::time::sleep(interval);
    tokio::pin!(sleep);
    loop {
        let current = *control.borrow_and_update();
        if current.stop {
            return Tick::Stop;
        }
        if current.skips != *skips_seen {
            *skips_seen = current.skips;
            return Tick::Skip;
        }
        if current.paused {
            if control.changed().await.is_err() {
                return Tick::Stop;
            }
            // A paused interval restarts in full.
            sleep.as_mut().reset(Instant::now() + interval);
            continue;
        }
        tokio::select! {
            () = &mut sleep => return Tick::Elapsed,
            changed = control.changed() => {
                if changed.is_err() {
                    return Tick::Stop;
                }
            }
        }
    }
}

/// Execute a flattened program, then report the stop.
pub(super) async fn run_program(
    ctx: TaskContext,
    plan: Arc<ExecutionPlan>,
    mut control: watch::Receiver<RunControl>,
) {
    ctx.recovery.lock().clear();
    let mut cursor = plan.cursor();
    let mut skips_seen = control.borrow().skips;
    let mut clock = 0.0_f64;

    'steps: while let Advance::Next(step) = cursor.advance(&plan) {
        if !ctx
            .notify(DeviceNotification::StepStarted {
                channel: ctx.channel,
                ordinal: step.ordinal,
            })
            .await
        {
            return;
        }

        let schedule = step.element.schedule();
        for index in 0..schedule.samples {
            match wait_tick(&mut control, schedule.interval, &mut skips_seen).await {
                Tick::Elapsed => {}
                Tick::Skip => continue 'steps,
                Tick::Stop => {
                    ctx.recovery.lock().clear();
                    ctx.finish(DeviceNotification::Stopped {
                        channel: ctx.channel,
                        reason: StopReason::UserRequested,
                    })
                    .await;
                    return;
                }
            }
            clock += schedule.interval.as_secs_f64();
            let sample = ctx.cell.measure(&step.element, index, schedule.samples, clock);
            if ctx.check_limits(&sample).await {
                return;
            }
            ctx.recovery.lock().push((step.node.clone(), sample));
            if !ctx
                .notify(DeviceNotification::Sample {
                    channel: ctx.channel,
                    provenance: Provenance::Active,
                    sample,
                })
                .await
            {
                return;
            }
        }
    }

    ctx.recovery.lock().clear();
    ctx.finish(DeviceNotification::Stopped {
        channel: ctx.channel,
        reason: StopReason::Completed,
    })
    .await;
}

/// Hold manual setpoints until stopped, streaming idle-provenance samples.
pub(super) async fn run_manual(
    ctx: TaskContext,
    settings: watch::Receiver<ManualSettings>,
    mut control: watch::Receiver<RunControl>,
) {
    let mut skips_seen = control.borrow().skips;
    let mut clock = 0.0_f64;
    loop {
        let current = *settings.borrow();
        match wait_tick(&mut control, current.interval, &mut skips_seen).await {
            Tick::Elapsed | Tick::Skip => {}
            Tick::Stop => {
                ctx.finish(DeviceNotification::Stopped {
                    channel: ctx.channel,
                    reason: StopReason::UserRequested,
                })
                .await;
                return;
            }
        }
        clock += current.interval.as_secs_f64();
        let sample = Sample::Dc(ctx.cell.manual(settings.borrow().setpoint, clock));
        if ctx.check_limits(&sample).await {
            return;
        }
        if !ctx
            .notify(DeviceNotification::Sample {
                channel: ctx.channel,
                provenance: Provenance::Idle,
                sample,
            })
            .await
        {
            return;
        }
    }
}

/// Stream resting readings until aborted.
pub(super) async fn run_idle_sampling(ctx: TaskContext) {
    let mut ticker = tokio::time::interval_at(
        Instant::now() + IDLE_SAMPLING_INTERVAL,
        IDLE_SAMPLING_INTERVAL,
    );
    let mut clock = 0.0_f64;
    loop {
        ticker.tick().await;
        clock += IDLE_SAMPLING_INTERVAL.as_secs_f64();
        let sample = Sample::Dc(ctx.cell.idle(clock));
        if !ctx
            .notify(DeviceNotification::Sample {
                channel: ctx.channel,
                provenance: Provenance::Idle,
                sample,
            })
            .await
        {
            return;
        }
    }
}

/// Replay retained samples grouped by the step they were measured in.
pub(super) async fn replay_recovery(
    tx: mpsc::Sender<DeviceNotification>,
    channel: u8,
    samples: Vec<(ExperimentNode, Sample)>,
) {
    let mut current: Option<ExperimentNode> = None;
    for (node, sample) in samples {
        if current.as_ref() != Some(&node) {
            let announce = DeviceNotification::RecoveryStepStarted {
                channel,
                node: node.clone(),
            };
            if tx.send(announce).await.is_err() {
                return;
            }
            current = Some(node);
        }
        let replay = DeviceNotification::Sample {
            channel,
            provenance: Provenance::Recovery,
            sample,
        };
        if tx.send(replay).await.is_err() {
            return;
        }
    }
}
