//! Channel lifecycle against a simulated instrument
//!
//! Drives one `InstrumentHandle` through uploads, runs, pauses, skips,
//! manual mode and limit trips, checking both the state machine and the
//! events observers receive.

use echem_daq::elements::{
    ConstantPotential, EisPotentiostatic, Element, OpenCircuit, Potential,
};
use echem_daq::events::{EventKind, InstrumentEvent, StopReason};
use echem_daq::experiment::{flatten, Experiment};
use echem_daq::session::ChannelState;
use echem_daq::sim::{SimBench, SimInstrument, SimSpec};
use echem_daq::transport::Connector;
use echem_daq::{HandleSettings, InstrumentError, InstrumentHandle, Operation};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::sleep;

async fn connect(spec: SimSpec) -> (InstrumentHandle, SimInstrument) {
    connect_with(spec, HandleSettings::default()).await
}

async fn connect_with(spec: SimSpec, settings: HandleSettings) -> (InstrumentHandle, SimInstrument) {
    let bench = SimBench::new();
    let sim = bench.plug("sim0", spec);
    let connection = bench.open("sim0").await.unwrap();
    let handle = InstrumentHandle::identify_and_spawn(connection, settings)
        .await
        .unwrap();
    (handle, sim)
}

fn ocp(duration: f64) -> Element {
    Element::from(OpenCircuit::new(duration, 1.0))
}

fn single(name: &str, element: Element) -> Experiment {
    let mut exp = Experiment::named(name);
    exp.append_element(&element, 1);
    exp
}

/// Collect channel events up to and including the next stop.
async fn until_stop(
    events: &mut broadcast::Receiver<InstrumentEvent>,
    channel: u8,
) -> Vec<EventKind> {
    let mut kinds = Vec::new();
    loop {
        let event = events.recv().await.unwrap();
        if event.channel != Some(channel) {
            continue;
        }
        let stopped = matches!(event.kind, EventKind::ExperimentStopped { .. });
        kinds.push(event.kind);
        if stopped {
            return kinds;
        }
    }
}

fn active_timestamps(kinds: &[EventKind]) -> Vec<f64> {
    kinds
        .iter()
        .filter_map(|k| match k {
            EventKind::ActiveDcData { sample } => Some(sample.timestamp),
            EventKind::ActiveAcData { sample } => Some(sample.timestamp),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn ocp_run_streams_ordered_active_samples() {
    let (handle, _sim) = connect(SimSpec::new("dev")).await;
    let mut events = handle.subscribe();

    handle.upload(0, &single("rest", ocp(10.0))).await.unwrap();
    handle.start(0).await.unwrap();
    let kinds = until_stop(&mut events, 0).await;

    let timestamps = active_timestamps(&kinds);
    assert_eq!(timestamps.len(), 10);
    assert!(timestamps.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(
        kinds.last(),
        Some(&EventKind::ExperimentStopped {
            reason: StopReason::Completed
        })
    );
    assert_eq!(handle.channel_state(0).unwrap(), ChannelState::Idle);
}

#[tokio::test(start_paused = true)]
async fn steps_are_reported_in_plan_order() {
    let (handle, _sim) = connect(SimSpec::new("dev")).await;
    let mut events = handle.subscribe();

    let mut pair = Experiment::named("pair");
    pair.append_element(&ocp(2.0), 1);
    pair.append_element(
        &Element::from(ConstantPotential::new(Potential::vs_ocp(0.05), 1.0, 2.0)),
        1,
    );
    let mut exp = Experiment::named("cycled");
    exp.append_sub_experiment(&pair, 2);
    let plan = flatten(&exp).unwrap();

    handle.upload(1, &exp).await.unwrap();
    handle.start(1).await.unwrap();
    let kinds = until_stop(&mut events, 1).await;

    let reported: Vec<_> = kinds
        .into_iter()
        .filter_map(|k| match k {
            EventKind::NewElementStarting { node } => Some(node),
            _ => None,
        })
        .collect();
    let planned: Vec<_> = plan.iter().map(|s| s.node.clone()).collect();
    assert_eq!(reported, planned);
}

#[tokio::test(start_paused = true)]
async fn pause_and_resume_follow_the_state_machine() {
    let (handle, _sim) = connect(SimSpec::new("dev")).await;
    let mut events = handle.subscribe();

    assert_eq!(handle.pause(0).await, Err(InstrumentError::ChannelNotBusy(0)));

    handle.upload(0, &single("long", ocp(30.0))).await.unwrap();
    handle.start(0).await.unwrap();
    assert_eq!(
        handle.resume(0).await,
        Err(InstrumentError::ExperimentAlreadyRun(0))
    );

    sleep(Duration::from_millis(2_500)).await;
    handle.pause(0).await.unwrap();
    assert!(handle.is_channel_paused(0).unwrap());
    assert!(handle.is_channel_busy(0).unwrap());
    assert_eq!(
        handle.pause(0).await,
        Err(InstrumentError::ExperimentAlreadyPaused(0))
    );
    assert_eq!(handle.skip(0).await, Err(InstrumentError::ExperimentAlreadyPaused(0)));

    handle.resume(0).await.unwrap();
    assert_eq!(handle.channel_state(0).unwrap(), ChannelState::Running);
    handle.stop(0).await.unwrap();

    let kinds = until_stop(&mut events, 0).await;
    let paused = kinds
        .iter()
        .position(|k| *k == EventKind::ExperimentPaused)
        .unwrap();
    let resumed = kinds
        .iter()
        .position(|k| *k == EventKind::ExperimentResumed)
        .unwrap();
    assert!(paused < resumed);
    assert_eq!(
        kinds.last(),
        Some(&EventKind::ExperimentStopped {
            reason: StopReason::UserRequested
        })
    );
}

#[tokio::test(start_paused = true)]
async fn second_upload_replaces_the_first() {
    let (handle, _sim) = connect(SimSpec::new("dev")).await;

    handle.upload(0, &single("first", ocp(1.0))).await.unwrap();
    handle.upload(0, &single("second", ocp(2.0))).await.unwrap();

    let status = handle.channel_status(0).unwrap();
    assert_eq!(status.state, ChannelState::Uploaded);
    assert_eq!(status.experiment_name.as_deref(), Some("second"));
    assert_eq!(status.plan_len, Some(1));
}

#[tokio::test(start_paused = true)]
async fn running_channel_refuses_conflicting_commands() {
    let (handle, _sim) = connect(SimSpec::new("dev")).await;

    handle.upload(0, &single("rest", ocp(60.0))).await.unwrap();
    assert_eq!(
        handle.start_manual(0).await,
        Err(InstrumentError::ExperimentUploaded(0))
    );
    handle.start(0).await.unwrap();

    assert_eq!(
        handle.upload(0, &single("other", ocp(1.0))).await,
        Err(InstrumentError::BusyChannel(0))
    );
    assert_eq!(handle.start(0).await, Err(InstrumentError::BusyChannel(0)));
    assert_eq!(
        handle.start_manual(0).await,
        Err(InstrumentError::BusyChannel(0))
    );
    assert_eq!(handle.free_channels(), vec![1, 2, 3]);
}

#[tokio::test(start_paused = true)]
async fn skip_moves_on_and_skipping_the_last_step_completes() {
    let (handle, _sim) = connect(SimSpec::new("dev")).await;
    let mut events = handle.subscribe();

    let mut exp = Experiment::named("skippable");
    exp.append_element(&ocp(600.0), 1);
    exp.append_element(&ocp(600.0), 1);
    handle.upload(2, &exp).await.unwrap();
    handle.start(2).await.unwrap();

    sleep(Duration::from_millis(1_500)).await;
    handle.skip(2).await.unwrap();
    sleep(Duration::from_millis(1_500)).await;
    handle.skip(2).await.unwrap();

    let kinds = until_stop(&mut events, 2).await;
    let steps: Vec<u32> = kinds
        .iter()
        .filter_map(|k| match k {
            EventKind::NewElementStarting { node } => Some(node.step_number),
            _ => None,
        })
        .collect();
    assert_eq!(steps, vec![0, 1]);
    assert_eq!(active_timestamps(&kinds).len(), 2);
    assert_eq!(
        kinds.last(),
        Some(&EventKind::ExperimentStopped {
            reason: StopReason::Completed
        })
    );
}

#[tokio::test(start_paused = true)]
async fn manual_mode_streams_setpoint_readings() {
    let (handle, _sim) = connect(SimSpec::new("dev")).await;
    let mut events = handle.subscribe();

    handle.start_manual(1).await.unwrap();
    assert_eq!(handle.channel_state(1).unwrap(), ChannelState::ManualRunning);
    handle.set_manual_voltage(1, 0.5).await.unwrap();
    handle.set_manual_sampling_interval(1, 0.5).await.unwrap();
    handle.set_manual_current_autorange(1).await.unwrap();

    let range_count = handle.manual_current_ranges().len() as u8;
    assert!(matches!(
        handle.set_manual_current_range(1, range_count).await,
        Err(InstrumentError::InvalidParameters(_))
    ));
    assert!(matches!(
        handle.set_manual_sampling_interval(1, 0.0).await,
        Err(InstrumentError::InvalidParameters(_))
    ));

    sleep(Duration::from_secs(3)).await;
    handle.stop(1).await.unwrap();
    let kinds = until_stop(&mut events, 1).await;

    let held: Vec<f64> = kinds
        .iter()
        .filter_map(|k| match k {
            EventKind::IdleDcData { sample } => Some(sample.working_electrode_voltage),
            _ => None,
        })
        .collect();
    assert!(held.len() >= 3);
    assert!((held[held.len() - 1] - 0.5).abs() < 1e-9);
    assert!(!kinds
        .iter()
        .any(|k| matches!(k, EventKind::ActiveDcData { .. })));
    assert_eq!(
        kinds.last(),
        Some(&EventKind::ExperimentStopped {
            reason: StopReason::UserRequested
        })
    );
    assert_eq!(
        handle.set_manual_voltage(1, 0.1).await,
        Err(InstrumentError::ManualExperimentNotRunning(1))
    );
}

#[tokio::test(start_paused = true)]
async fn tripped_limit_stops_with_device_error() {
    let (handle, _sim) = connect(SimSpec::new("dev")).await;
    let mut events = handle.subscribe();

    handle.set_max_voltage(0, 0.4).await.unwrap();
    assert_eq!(handle.channel_status(0).unwrap().limits.max_voltage, Some(0.4));

    let hold = Element::from(ConstantPotential::new(Potential::new(0.5), 1.0, 30.0));
    handle.upload(0, &single("overvoltage", hold)).await.unwrap();
    handle.start(0).await.unwrap();
    let kinds = until_stop(&mut events, 0).await;

    assert!(kinds
        .iter()
        .any(|k| matches!(k, EventKind::DeviceError { .. })));
    assert!(matches!(
        kinds.last(),
        Some(EventKind::ExperimentStopped {
            reason: StopReason::DeviceError(_)
        })
    ));
    assert!(active_timestamps(&kinds).is_empty());

    handle.reset_limits(0).await.unwrap();
    assert_eq!(handle.channel_status(0).unwrap().limits.max_voltage, None);
}

#[tokio::test(start_paused = true)]
async fn impedance_spectrum_arrives_as_ac_data() {
    let (handle, _sim) = connect(SimSpec::new("dev")).await;
    let eis = Element::from(EisPotentiostatic::new(
        1e4,
        10.0,
        5,
        Potential::vs_ocp(0.0),
        0.01,
    ));
    let points = eis.schedule().samples as usize;
    let mut events = handle.subscribe();

    handle.upload(3, &single("eis", eis)).await.unwrap();
    handle.start(3).await.unwrap();
    let kinds = until_stop(&mut events, 3).await;

    let frequencies: Vec<f64> = kinds
        .iter()
        .filter_map(|k| match k {
            EventKind::ActiveAcData { sample } => Some(sample.frequency),
            _ => None,
        })
        .collect();
    assert_eq!(frequencies.len(), points);
    assert!(frequencies.windows(2).all(|w| w[0] > w[1]));
}

#[tokio::test(start_paused = true)]
async fn slow_device_times_out_with_the_operation_code() {
    let settings = HandleSettings {
        command_timeout: Duration::from_millis(200),
        ..HandleSettings::default()
    };
    let (handle, sim) = connect_with(SimSpec::new("dev"), settings).await;
    handle.upload(0, &single("rest", ocp(5.0))).await.unwrap();

    sim.set_latency(Duration::from_secs(1));
    let err = handle.start(0).await.unwrap_err();
    assert_eq!(err.code(), Operation::Start.failure_code());
    assert_eq!(handle.channel_state(0).unwrap(), ChannelState::Uploaded);
}

#[tokio::test(start_paused = true)]
async fn injected_transport_failure_reports_once() {
    let (handle, sim) = connect(SimSpec::new("dev")).await;
    sim.trigger_failure();

    let err = handle.upload(0, &single("rest", ocp(5.0))).await.unwrap_err();
    assert_eq!(err.code(), Operation::Upload.failure_code());
    assert_eq!(handle.channel_state(0).unwrap(), ChannelState::Idle);

    handle.upload(0, &single("rest", ocp(5.0))).await.unwrap();
    assert_eq!(handle.channel_state(0).unwrap(), ChannelState::Uploaded);
}

fn stop_reasons(kinds: &[EventKind]) -> Vec<StopReason> {
    kinds
        .iter()
        .filter_map(|k| match k {
            EventKind::ExperimentStopped { reason } => Some(reason.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn stopped_channel_accepts_the_next_run_at_once() {
    let (handle, _sim) = connect(SimSpec::new("dev")).await;
    let mut events = handle.subscribe();

    handle.upload(0, &single("long", ocp(60.0))).await.unwrap();
    handle.start(0).await.unwrap();
    sleep(Duration::from_millis(2_500)).await;
    handle.stop(0).await.unwrap();
    assert_eq!(handle.channel_state(0).unwrap(), ChannelState::Idle);
    assert_eq!(handle.free_channels(), vec![0, 1, 2, 3]);

    handle.upload(0, &single("short", ocp(5.0))).await.unwrap();
    handle.start(0).await.unwrap();
    assert_eq!(handle.channel_state(0).unwrap(), ChannelState::Running);

    let first = until_stop(&mut events, 0).await;
    assert_eq!(stop_reasons(&first), vec![StopReason::UserRequested]);
    let second = until_stop(&mut events, 0).await;
    assert_eq!(active_timestamps(&second).len(), 5);
    assert_eq!(stop_reasons(&second), vec![StopReason::Completed]);

    sleep(Duration::from_secs(10)).await;
    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event.kind, EventKind::ExperimentStopped { .. }));
    }
    assert_eq!(handle.channel_state(0).unwrap(), ChannelState::Idle);
}

#[tokio::test(start_paused = true)]
async fn repeated_cycles_each_complete_once() {
    let (handle, _sim) = connect(SimSpec::new("dev")).await;
    let mut events = handle.subscribe();

    for _ in 0..3 {
        handle.upload(2, &single("long", ocp(60.0))).await.unwrap();
        handle.start(2).await.unwrap();
        sleep(Duration::from_millis(1_500)).await;
        handle.pause(2).await.unwrap();
        handle.stop(2).await.unwrap();
    }
    let reason = handle
        .run_to_completion(2, &single("short", ocp(2.0)), Duration::from_secs(30))
        .await
        .unwrap();
    assert_eq!(reason, StopReason::Completed);

    let mut reasons = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let EventKind::ExperimentStopped { reason } = event.kind {
            reasons.push(reason);
        }
    }
    assert_eq!(
        reasons,
        vec![
            StopReason::UserRequested,
            StopReason::UserRequested,
            StopReason::UserRequested,
            StopReason::Completed,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn manual_mode_right_after_a_stop_keeps_its_session() {
    let (handle, _sim) = connect(SimSpec::new("dev")).await;
    let mut events = handle.subscribe();

    handle.upload(1, &single("long", ocp(60.0))).await.unwrap();
    handle.start(1).await.unwrap();
    sleep(Duration::from_millis(2_500)).await;
    handle.stop(1).await.unwrap();

    handle.start_manual(1).await.unwrap();
    let manual_run = handle.channel_status(1).unwrap().run_id;
    assert!(manual_run.is_some());
    handle.set_manual_voltage(1, 0.3).await.unwrap();

    sleep(Duration::from_secs(3)).await;
    assert_eq!(handle.channel_state(1).unwrap(), ChannelState::ManualRunning);
    assert_eq!(handle.channel_status(1).unwrap().run_id, manual_run);

    handle.stop(1).await.unwrap();
    let program = until_stop(&mut events, 1).await;
    assert_eq!(stop_reasons(&program), vec![StopReason::UserRequested]);
    let manual = until_stop(&mut events, 1).await;
    assert!(manual
        .iter()
        .any(|k| matches!(k, EventKind::IdleDcData { .. })));
    assert_eq!(stop_reasons(&manual), vec![StopReason::UserRequested]);
}

#[tokio::test(start_paused = true)]
async fn oversized_sampling_intervals_are_invalid() {
    let (handle, sim) = connect(SimSpec::new("dev")).await;
    let mut events = handle.subscribe();
    sim.clear_call_log();

    let glacial = Element::from(OpenCircuit::new(10.0, 1e300));
    assert!(matches!(
        handle.upload(0, &single("glacial", glacial)).await,
        Err(InstrumentError::InvalidParameters(_))
    ));
    assert!(sim.call_log().is_empty());

    handle.start_manual(0).await.unwrap();
    for seconds in [1e300, f64::INFINITY, f64::NAN, -1.0] {
        assert!(matches!(
            handle.set_manual_sampling_interval(0, seconds).await,
            Err(InstrumentError::InvalidParameters(_))
        ));
    }

    // The device keeps sampling at its previous pace.
    sleep(Duration::from_millis(2_500)).await;
    handle.stop(0).await.unwrap();
    let kinds = until_stop(&mut events, 0).await;
    let samples = kinds
        .iter()
        .filter(|k| matches!(k, EventKind::IdleDcData { .. }))
        .count();
    assert_eq!(samples, 2);
}
