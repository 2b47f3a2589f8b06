use super::{ChannelLimits, ChannelState, CompRange, IrCompensation, LinkGroup, LinkRole};
use crate::error::{InstrumentError, InstrumentResult};
use crate::events::{OrderingGuard, Provenance, StopReason};
use crate::experiment::{ExecutionPlan, Experiment, ExperimentNode, StepCursor};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// The channel's private copy of an uploaded experiment and its flattening.
#[derive(Debug, Clone)]
pub struct UploadedProgram {
    /// Copy of the experiment as uploaded
    pub experiment: Experiment,
    /// Flattening computed once at upload
    pub plan: Arc<ExecutionPlan>,
}

#[derive(Debug, Clone)]
struct RunRecord {
    id: Uuid,
    manual: bool,
    stop_requested: bool,
}

/// What ended a run, returned when a session leaves it.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    /// Run identifier
    pub run_id: Uuid,
    /// Reason to publish
    pub reason: StopReason,
    /// Link group dissolved by this stop, if the channel was a master
    pub dissolved: Option<LinkGroup>,
}

/// Snapshot of a session for status queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelStatus {
    /// Zero-based channel number
    pub channel: u8,
    /// Lifecycle state
    pub state: ChannelState,
    /// Name of the uploaded experiment
    pub experiment_name: Option<String>,
    /// Step the device last reported
    pub current_step: Option<ExperimentNode>,
    /// Steps in the uploaded program
    pub plan_len: Option<usize>,
    /// Run in progress, or awaiting the device's stop report
    pub run_id: Option<Uuid>,
    /// UTC start of the most recent run
    pub started_at: Option<DateTime<Utc>>,
    /// Role in a link group, if linked
    pub link: Option<LinkRole>,
    /// Configured safety limits
    pub limits: ChannelLimits,
    /// IR compensation, if configured
    pub ir_compensation: Option<IrCompensation>,
    /// Compensation range, if configured
    pub comp_range: Option<CompRange>,
    /// Background sampling active
    pub idle_sampling: bool,
}

/// State machine for one channel.
#[derive(Debug, Clone)]
pub struct ChannelSession {
    channel: u8,
    state: ChannelState,
    program: Option<UploadedProgram>,
    cursor: StepCursor,
    link: Option<LinkRole>,
    limits: ChannelLimits,
    ir_compensation: Option<IrCompensation>,
    comp_range: Option<CompRange>,
    idle_sampling: bool,
    run: Option<RunRecord>,
    started_at: Option<DateTime<Utc>>,
    recovery_node: Option<ExperimentNode>,
    guard: OrderingGuard,
}

impl ChannelSession {
    /// Create an idle session for `channel`.
    pub fn new(channel: u8) -> Self {
        Self {
            channel,
            state: ChannelState::Idle,
            program: None,
            cursor: StepCursor::default(),
            link: None,
            limits: ChannelLimits::default(),
            ir_compensation: None,
            comp_range: None,
            idle_sampling: false,
            run: None,
            started_at: None,
            recovery_node: None,
            guard: OrderingGuard::default(),
        }
    }

    /// Channel index.
    pub fn channel(&self) -> u8 {
        self.channel
    }

    /// Current state.
    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Link group role, if any.
    pub fn link(&self) -> Option<&LinkRole> {
        self.link.as_ref()
    }

    /// Cached plan of the uploaded program.
    pub fn plan(&self) -> Option<&Arc<ExecutionPlan>> {
        self.program.as_ref().map(|p| &p.plan)
    }

    /// Configured limits.
    pub fn limits(&self) -> &ChannelLimits {
        &self.limits
    }

    /// UTC start time of the most recent run.
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// True while a run is active or awaiting its stop confirmation.
    pub fn has_run(&self) -> bool {
        self.run.is_some()
    }

    /// Identifier of the active run.
    pub fn run_id(&self) -> Option<Uuid> {
        self.run.as_ref().map(|r| r.id)
    }

    /// Status snapshot.
    pub fn status(&self) -> ChannelStatus {
        let current_step = match (&self.program, self.cursor.position()) {
            (Some(program), Some(ordinal)) => program.plan.get(ordinal).map(|s| s.node.clone()),
            _ => None,
        };
        ChannelStatus {
            channel: self.channel,
            state: self.state,
            experiment_name: self
                .program
                .as_ref()
                .map(|p| p.experiment.name().to_string()),
            current_step,
            plan_len: self.program.as_ref().map(|p| p.plan.len()),
            run_id: self.run.as_ref().map(|r| r.id),
            started_at: self.started_at,
            link: self.link.clone(),
            limits: self.limits,
            ir_compensation: self.ir_compensation,
            comp_range: self.comp_range.clone(),
            idle_sampling: self.idle_sampling,
        }
    }

    // =========================================================================
    // Guards
    // =========================================================================

    /// Fails with `ChannelLinked` if this channel is a link group slave.
    pub fn check_addressable(&self) -> InstrumentResult<()> {
        match self.link {
            Some(LinkRole::Slave { master }) => Err(InstrumentError::ChannelLinked {
                channel: self.channel,
                master,
            }),
            _ => Ok(()),
        }
    }

    /// Fails with `BusyChannel` while the device has not confirmed the end
    /// of the previous run.
    fn check_no_pending_run(&self) -> InstrumentResult<()> {
        if self.has_run() {
            Err(InstrumentError::BusyChannel(self.channel))
        } else {
            Ok(())
        }
    }

    /// Guard for `upload`.
    pub fn check_upload(&self) -> InstrumentResult<()> {
        self.check_addressable()?;
        self.check_no_pending_run()?;
        if self.state.can_upload() {
            Ok(())
        } else {
            Err(InstrumentError::BusyChannel(self.channel))
        }
    }

    /// Guard for `start`.
    pub fn check_start(&self) -> InstrumentResult<()> {
        self.check_addressable()?;
        self.check_no_pending_run()?;
        if self.state.can_start() {
            return Ok(());
        }
        match self.state {
            ChannelState::Idle => Err(InstrumentError::ExperimentNotUploaded(self.channel)),
            _ => Err(InstrumentError::BusyChannel(self.channel)),
        }
    }

    /// Guard for `pause`.
    pub fn check_pause(&self) -> InstrumentResult<()> {
        self.check_addressable()?;
        if self.state.can_pause() {
            return Ok(());
        }
        match self.state {
            ChannelState::Paused => Err(InstrumentError::ExperimentAlreadyPaused(self.channel)),
            _ => Err(InstrumentError::ChannelNotBusy(self.channel)),
        }
    }

    /// Guard for `resume`.
    pub fn check_resume(&self) -> InstrumentResult<()> {
        self.check_addressable()?;
        if self.state.can_resume() {
            return Ok(());
        }
        match self.state {
            ChannelState::Running => Err(InstrumentError::ExperimentAlreadyRun(self.channel)),
            _ => Err(InstrumentError::ChannelNotBusy(self.channel)),
        }
    }

    /// Guard for `stop`. A stop the device has not confirmed yet may be
    /// repeated.
    pub fn check_stop(&self) -> InstrumentResult<()> {
        self.check_addressable()?;
        if self.state.can_stop() || self.has_run() {
            Ok(())
        } else {
            Err(InstrumentError::ChannelNotBusy(self.channel))
        }
    }

    /// Guard for `skip`.
    pub fn check_skip(&self) -> InstrumentResult<()> {
        self.check_addressable()?;
        if self.state.can_skip() {
            return Ok(());
        }
        match self.state {
            ChannelState::Paused => Err(InstrumentError::ExperimentAlreadyPaused(self.channel)),
            _ => Err(InstrumentError::ChannelNotBusy(self.channel)),
        }
    }

    /// Guard for `start_manual` and `start_idle_sampling`.
    pub fn check_start_manual(&self) -> InstrumentResult<()> {
        self.check_addressable()?;
        self.check_no_pending_run()?;
        if self.state.can_start_manual() {
            return Ok(());
        }
        match self.state {
            ChannelState::Uploaded => Err(InstrumentError::ExperimentUploaded(self.channel)),
            _ => Err(InstrumentError::BusyChannel(self.channel)),
        }
    }

    /// Guard for manual setpoints, ranges and sampling interval.
    pub fn check_manual_control(&self) -> InstrumentResult<()> {
        self.check_addressable()?;
        if self.state == ChannelState::ManualRunning {
            Ok(())
        } else {
            Err(InstrumentError::ManualExperimentNotRunning(self.channel))
        }
    }

    /// Guard for joining a link group.
    pub fn check_linkable(&self) -> InstrumentResult<()> {
        if self.state == ChannelState::Idle && !self.has_run() {
            Ok(())
        } else {
            Err(InstrumentError::BusyChannel(self.channel))
        }
    }

    // =========================================================================
    // Acknowledged transitions
    // =========================================================================

    /// Store the uploaded program, replacing any previous one.
    pub(crate) fn apply_upload(&mut self, program: UploadedProgram) {
        self.program = Some(program);
        self.cursor = StepCursor::default();
        self.state = ChannelState::Uploaded;
    }

    /// Enter `Running`. Returns the new run id.
    pub(crate) fn apply_start(&mut self, now: DateTime<Utc>) -> Option<Uuid> {
        if !self.state.can_start() || self.has_run() {
            return None;
        }
        let id = Uuid::new_v4();
        self.run = Some(RunRecord {
            id,
            manual: false,
            stop_requested: false,
        });
        self.state = ChannelState::Running;
        self.started_at = Some(now);
        self.cursor = StepCursor::default();
        self.idle_sampling = false;
        self.guard.reset(Provenance::Active);
        Some(id)
    }

    pub(crate) fn apply_pause(&mut self) -> bool {
        if self.state == ChannelState::Running {
            self.state = ChannelState::Paused;
            true
        } else {
            false
        }
    }

    pub(crate) fn apply_resume(&mut self) -> bool {
        if self.state == ChannelState::Paused {
            self.state = ChannelState::Running;
            true
        } else {
            false
        }
    }

    /// The device accepted a stop; the run ends when it confirms.
    ///
    /// The channel reads `Idle` from here on, but run-starting guards keep
    /// failing with `BusyChannel` until [`finish_run`](Self::finish_run).
    pub(crate) fn apply_stop_requested(&mut self) -> bool {
        let Some(run) = self.run.as_mut() else {
            return false;
        };
        run.stop_requested = true;
        self.state = ChannelState::Idle;
        self.idle_sampling = false;
        true
    }

    /// Enter manual mode. Returns the new run id.
    pub(crate) fn apply_start_manual(&mut self, now: DateTime<Utc>) -> Option<Uuid> {
        if !self.state.can_start_manual() || self.has_run() {
            return None;
        }
        let id = Uuid::new_v4();
        self.run = Some(RunRecord {
            id,
            manual: true,
            stop_requested: false,
        });
        self.state = ChannelState::ManualRunning;
        self.started_at = Some(now);
        self.idle_sampling = true;
        self.guard.reset(Provenance::Idle);
        Some(id)
    }

    pub(crate) fn apply_start_idle_sampling(&mut self) {
        if !self.idle_sampling {
            self.guard.reset(Provenance::Idle);
        }
        self.idle_sampling = true;
    }

    pub(crate) fn set_limit(&mut self, kind: super::LimitKind, value: f64) {
        self.limits.set(kind, value);
    }

    pub(crate) fn reset_limits(&mut self) {
        self.limits.reset();
    }

    pub(crate) fn set_ir_compensation(&mut self, comp: IrCompensation) {
        self.ir_compensation = Some(comp);
    }

    pub(crate) fn set_comp_range(&mut self, range: CompRange) {
        self.comp_range = Some(range);
    }

    pub(crate) fn set_link(&mut self, role: Option<LinkRole>) {
        self.link = role;
    }

    // =========================================================================
    // Device-initiated transitions
    // =========================================================================

    /// The device started step `ordinal`. Returns its node for publication.
    pub(crate) fn on_step_started(&mut self, ordinal: u32) -> Option<ExperimentNode> {
        let run = self.run.as_ref()?;
        if run.manual || run.stop_requested {
            return None;
        }
        let plan = Arc::clone(&self.program.as_ref()?.plan);
        self.cursor.seek(&plan, ordinal).map(|s| s.node.clone())
    }

    /// The device replays recovered data of `node`.
    pub(crate) fn on_recovery_step(&mut self, node: ExperimentNode) {
        self.guard.reset(Provenance::Recovery);
        self.recovery_node = Some(node);
    }

    /// Step context of the recovered data currently replaying.
    pub(crate) fn recovery_node(&self) -> Option<&ExperimentNode> {
        self.recovery_node.as_ref()
    }

    /// Decide whether a sample of `provenance` is delivered.
    ///
    /// Active samples are only delivered while a program runs or is paused.
    /// Any provenance drops timestamps that regress.
    pub(crate) fn admit_sample(&mut self, provenance: Provenance, timestamp: f64) -> SampleVerdict {
        if provenance == Provenance::Active
            && !matches!(self.state, ChannelState::Running | ChannelState::Paused)
        {
            return SampleVerdict::NoRun;
        }
        if self.guard.admit(provenance, timestamp) {
            SampleVerdict::Deliver
        } else {
            SampleVerdict::Regressed
        }
    }

    /// Leave the current run, returning what to publish.
    ///
    /// Returns `None` when no run is active, so each run is reported once.
    pub(crate) fn finish_run(&mut self, reported: StopReason) -> Option<RunOutcome> {
        let run = self.run.take()?;
        let reason = match reported {
            StopReason::Completed | StopReason::UserRequested if run.stop_requested => {
                StopReason::UserRequested
            }
            other => other,
        };
        self.state = ChannelState::Idle;
        self.program = None;
        self.cursor = StepCursor::default();
        self.idle_sampling = false;

        let dissolved = match self.link.take() {
            Some(LinkRole::Master(group)) => Some(group),
            other => {
                self.link = other;
                None
            }
        };

        Some(RunOutcome {
            run_id: run.id,
            reason,
            dissolved,
        })
    }
}

/// Dispatcher decision for one sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SampleVerdict {
    Deliver,
    /// Timestamp older than the last delivered one, or not finite
    Regressed,
    /// Active data outside a run
    NoRun,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elements::{Element, OpenCircuit};
    use crate::experiment::flatten;
    use crate::session::LinkMode;

    fn program() -> UploadedProgram {
        let mut experiment = Experiment::named("ocp");
        experiment.append_element(&Element::from(OpenCircuit::new(3.0, 1.0)), 2);
        let plan = Arc::new(flatten(&experiment).unwrap());
        UploadedProgram { experiment, plan }
    }

    fn running() -> ChannelSession {
        let mut session = ChannelSession::new(0);
        session.apply_upload(program());
        session.apply_start(Utc::now()).unwrap();
        session
    }

    #[test]
    fn idle_guards() {
        let session = ChannelSession::new(2);
        assert!(session.check_upload().is_ok());
        assert_eq!(
            session.check_start(),
            Err(InstrumentError::ExperimentNotUploaded(2))
        );
        assert_eq!(session.check_pause(), Err(InstrumentError::ChannelNotBusy(2)));
        assert_eq!(session.check_resume(), Err(InstrumentError::ChannelNotBusy(2)));
        assert_eq!(session.check_stop(), Err(InstrumentError::ChannelNotBusy(2)));
        assert_eq!(session.check_skip(), Err(InstrumentError::ChannelNotBusy(2)));
        assert!(session.check_start_manual().is_ok());
        assert_eq!(
            session.check_manual_control(),
            Err(InstrumentError::ManualExperimentNotRunning(2))
        );
    }

    #[test]
    fn uploaded_guards() {
        let mut session = ChannelSession::new(0);
        session.apply_upload(program());
        assert_eq!(session.state(), ChannelState::Uploaded);
        assert!(session.check_upload().is_ok());
        assert!(session.check_start().is_ok());
        assert_eq!(session.check_stop(), Err(InstrumentError::ChannelNotBusy(0)));
        assert_eq!(
            session.check_start_manual(),
            Err(InstrumentError::ExperimentUploaded(0))
        );
    }

    #[test]
    fn running_and_paused_guards() {
        let mut session = running();
        assert_eq!(session.check_upload(), Err(InstrumentError::BusyChannel(0)));
        assert_eq!(session.check_start(), Err(InstrumentError::BusyChannel(0)));
        assert_eq!(
            session.check_resume(),
            Err(InstrumentError::ExperimentAlreadyRun(0))
        );
        assert!(session.check_skip().is_ok());
        assert_eq!(
            session.check_start_manual(),
            Err(InstrumentError::BusyChannel(0))
        );

        assert!(session.apply_pause());
        assert_eq!(
            session.check_pause(),
            Err(InstrumentError::ExperimentAlreadyPaused(0))
        );
        assert_eq!(
            session.check_skip(),
            Err(InstrumentError::ExperimentAlreadyPaused(0))
        );
        assert!(session.check_stop().is_ok());
        assert!(session.apply_resume());
        assert_eq!(session.state(), ChannelState::Running);
    }

    #[test]
    fn step_reports_follow_the_cached_plan() {
        let mut session = running();
        let node = session.on_step_started(1).unwrap();
        assert_eq!((node.step_number, node.substep_number), (1, 0));
        assert_eq!(session.on_step_started(7), None);
        assert_eq!(session.status().current_step, Some(node));
    }

    #[test]
    fn each_run_finishes_once() {
        let mut session = running();
        let outcome = session.finish_run(StopReason::Completed).unwrap();
        assert_eq!(outcome.reason, StopReason::Completed);
        assert_eq!(session.state(), ChannelState::Idle);
        assert!(session.plan().is_none());
        assert_eq!(session.finish_run(StopReason::Completed), None);
    }

    #[test]
    fn requested_stop_reports_user_requested() {
        let mut session = running();
        assert!(session.apply_stop_requested());
        assert_eq!(session.state(), ChannelState::Idle);
        assert!(session.has_run());
        assert!(session.check_linkable().is_err());
        let outcome = session.finish_run(StopReason::Completed).unwrap();
        assert_eq!(outcome.reason, StopReason::UserRequested);
        assert!(session.check_linkable().is_ok());
    }

    #[test]
    fn unconfirmed_stop_keeps_the_channel_reserved() {
        let mut session = running();
        let first = session.run_id();
        assert!(session.apply_stop_requested());

        assert_eq!(session.check_upload(), Err(InstrumentError::BusyChannel(0)));
        assert_eq!(session.check_start(), Err(InstrumentError::BusyChannel(0)));
        assert_eq!(
            session.check_start_manual(),
            Err(InstrumentError::BusyChannel(0))
        );
        assert_eq!(session.apply_start_manual(Utc::now()), None);
        assert_eq!(session.run_id(), first);
        // The stop can be repeated until the device confirms it.
        assert!(session.check_stop().is_ok());

        session.finish_run(StopReason::UserRequested).unwrap();
        assert!(session.check_upload().is_ok());
        assert!(session.check_start_manual().is_ok());
        assert_eq!(session.check_stop(), Err(InstrumentError::ChannelNotBusy(0)));
    }

    #[test]
    fn active_samples_need_a_run_and_ordered_timestamps() {
        let mut session = ChannelSession::new(0);
        assert_eq!(
            session.admit_sample(Provenance::Active, 0.0),
            SampleVerdict::NoRun
        );
        assert_eq!(
            session.admit_sample(Provenance::Idle, 1.0),
            SampleVerdict::Deliver
        );

        session.apply_upload(program());
        session.apply_start(Utc::now());
        assert_eq!(
            session.admit_sample(Provenance::Active, 2.0),
            SampleVerdict::Deliver
        );
        assert_eq!(
            session.admit_sample(Provenance::Active, 1.0),
            SampleVerdict::Regressed
        );
    }

    #[test]
    fn slave_channels_reject_session_commands() {
        let group = LinkGroup::plan(&[0, 1], 4, LinkMode::Parallel).unwrap();
        let mut master = ChannelSession::new(0);
        let mut slave = ChannelSession::new(1);
        master.set_link(Some(LinkRole::Master(group.clone())));
        slave.set_link(Some(LinkRole::Slave { master: 0 }));

        let linked = Err(InstrumentError::ChannelLinked {
            channel: 1,
            master: 0,
        });
        assert_eq!(slave.check_upload(), linked);
        assert_eq!(slave.check_start_manual(), linked);
        assert!(master.check_upload().is_ok());

        master.apply_upload(program());
        master.apply_start(Utc::now());
        let outcome = master.finish_run(StopReason::Completed).unwrap();
        assert_eq!(outcome.dissolved, Some(group));
        assert!(master.link().is_none());
    }
}
