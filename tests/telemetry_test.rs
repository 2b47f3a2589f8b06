//! Telemetry delivery: provenances, recovery replay, filtered streams and
//! device-level notifications.

use echem_daq::config::AppConfig;
use echem_daq::elements::{Element, OpenCircuit};
use echem_daq::events::{EventKind, InstrumentEvent, StopReason};
use echem_daq::experiment::Experiment;
use echem_daq::session::ChannelState;
use echem_daq::sim::{SimBench, SimInstrument, SimSpec};
use echem_daq::{DeviceRegistry, InstrumentHandle};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::sleep;
use tokio_stream::StreamExt;

fn rest(duration: f64) -> Experiment {
    let mut exp = Experiment::named("rest");
    exp.append_element(&Element::from(OpenCircuit::new(duration, 1.0)), 1);
    exp
}

async fn bench_with_device() -> (DeviceRegistry, InstrumentHandle, SimInstrument) {
    let bench = SimBench::new();
    let sim = bench.plug("sim0", SimSpec::new("dev"));
    let registry = DeviceRegistry::new(Arc::new(bench), AppConfig::default());
    let handle = registry.connect("sim0").await.unwrap();
    (registry, handle, sim)
}

fn drain(events: &mut broadcast::Receiver<InstrumentEvent>) -> Vec<InstrumentEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

#[tokio::test(start_paused = true)]
async fn interrupted_run_is_recovered_on_reconnect() {
    let (registry, handle, sim) = bench_with_device().await;
    handle.upload(0, &rest(600.0)).await.unwrap();
    handle.start(0).await.unwrap();
    sleep(Duration::from_millis(3_500)).await;

    sim.unplug();
    handle.wait_disconnected().await;
    sleep(Duration::from_millis(10)).await;
    assert_eq!(sim.recovery_len(0), 3);

    let handle = registry.connect("sim0").await.unwrap();
    let mut events = handle.subscribe();
    sleep(Duration::from_millis(100)).await;

    let recovered: Vec<_> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e.kind {
            EventKind::RecoveryDcData { node, sample } => Some((e.channel, node, sample)),
            _ => None,
        })
        .collect();
    assert_eq!(recovered.len(), 3);
    for (channel, node, _) in &recovered {
        assert_eq!(*channel, Some(0));
        assert_eq!(node.step_name, "Open Circuit Potential");
        assert_eq!((node.step_number, node.substep_number), (0, 0));
    }
    assert!(recovered
        .windows(2)
        .all(|w| w[0].2.timestamp <= w[1].2.timestamp));
    // Recovery data is never mistaken for a live run.
    assert_eq!(handle.channel_state(0).unwrap(), ChannelState::Idle);

    handle.erase_recovery_data().await.unwrap();
    sleep(Duration::from_millis(10)).await;
    assert!(drain(&mut events)
        .iter()
        .any(|e| e.kind == EventKind::RecoveryDataErased { success: true }));
    assert_eq!(sim.recovery_len(0), 0);
}

#[tokio::test(start_paused = true)]
async fn erase_is_refused_while_a_run_is_active() {
    let (_registry, handle, sim) = bench_with_device().await;
    let mut events = handle.subscribe();
    handle.upload(1, &rest(600.0)).await.unwrap();
    handle.start(1).await.unwrap();
    sleep(Duration::from_millis(2_500)).await;

    handle.erase_recovery_data().await.unwrap();
    sleep(Duration::from_millis(10)).await;
    assert!(drain(&mut events)
        .iter()
        .any(|e| e.kind == EventKind::RecoveryDataErased { success: false }));
    assert_eq!(sim.recovery_len(1), 2);
}

#[tokio::test(start_paused = true)]
async fn channel_stream_carries_only_that_channel_and_device_events() {
    let (_registry, handle, sim) = bench_with_device().await;
    let mut stream = handle.event_stream(Some(1));

    handle.upload(0, &rest(3.0)).await.unwrap();
    handle.upload(1, &rest(2.0)).await.unwrap();
    handle.start(0).await.unwrap();
    handle.start(1).await.unwrap();
    sim.set_ground_float(true).await;

    let mut seen = Vec::new();
    while let Some(event) = stream.next().await {
        assert!(event.channel.is_none() || event.channel == Some(1));
        let stopped = matches!(event.kind, EventKind::ExperimentStopped { .. });
        seen.push(event);
        if stopped {
            break;
        }
    }
    assert!(seen
        .iter()
        .any(|e| e.channel.is_none() && e.kind == EventKind::GroundFloatChanged { floating: true }));
    let samples = seen
        .iter()
        .filter(|e| matches!(e.kind, EventKind::ActiveDcData { .. }))
        .count();
    assert_eq!(samples, 2);
}

#[tokio::test(start_paused = true)]
async fn idle_sampling_ends_when_a_run_starts() {
    let (_registry, handle, _sim) = bench_with_device().await;
    let mut events = handle.subscribe();

    handle.start_idle_sampling(2).await.unwrap();
    assert!(handle.channel_status(2).unwrap().idle_sampling);
    sleep(Duration::from_millis(3_500)).await;
    let idle = drain(&mut events)
        .iter()
        .filter(|e| e.channel == Some(2) && matches!(e.kind, EventKind::IdleDcData { .. }))
        .count();
    assert_eq!(idle, 3);

    let reason = handle
        .run_to_completion(2, &rest(2.0), Duration::from_secs(30))
        .await
        .unwrap();
    assert_eq!(reason, StopReason::Completed);
    assert!(!handle.channel_status(2).unwrap().idle_sampling);

    drain(&mut events);
    sleep(Duration::from_secs(5)).await;
    assert!(drain(&mut events)
        .iter()
        .all(|e| !matches!(e.kind, EventKind::IdleDcData { .. })));
}

#[tokio::test(start_paused = true)]
async fn warning_is_reported_without_stopping_the_run() {
    let (_registry, handle, sim) = bench_with_device().await;
    let mut events = handle.subscribe();
    handle.upload(3, &rest(600.0)).await.unwrap();
    handle.start(3).await.unwrap();
    sleep(Duration::from_millis(1_500)).await;

    sim.inject_warning(3, "temperature drifting").await;
    sleep(Duration::from_millis(1_000)).await;

    let kinds: Vec<_> = drain(&mut events).into_iter().map(|e| e.kind).collect();
    assert!(kinds.contains(&EventKind::DeviceError {
        message: "temperature drifting".to_string()
    }));
    assert!(!kinds
        .iter()
        .any(|k| matches!(k, EventKind::ExperimentStopped { .. })));
    assert_eq!(handle.channel_state(3).unwrap(), ChannelState::Running);
}
