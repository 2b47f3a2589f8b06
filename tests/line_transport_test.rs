//! Full wire path: `InstrumentHandle` over `LineTransport` over an
//! in-memory duplex stream served by a simulated instrument.

use echem_daq::elements::{Element, OpenCircuit};
use echem_daq::events::{EventKind, StopReason};
use echem_daq::experiment::Experiment;
use echem_daq::sim::{serve_line, SimInstrument, SimSpec};
use echem_daq::transport::LineTransport;
use echem_daq::{HandleSettings, InstrumentError, InstrumentHandle};
use std::time::Duration;
use tokio::task::JoinHandle;

async fn wire(
    spec: SimSpec,
) -> (
    InstrumentHandle,
    SimInstrument,
    JoinHandle<Result<(), echem_daq::TransportError>>,
) {
    let (host_io, device_io) = tokio::io::duplex(64 * 1024);
    let sim = SimInstrument::new(spec);
    let server = tokio::spawn(serve_line(sim.clone(), "duplex", device_io));
    let connection = LineTransport::connect("duplex", host_io, 64);
    let handle = InstrumentHandle::identify_and_spawn(connection, HandleSettings::default())
        .await
        .unwrap();
    (handle, sim, server)
}

fn rest(duration: f64) -> Experiment {
    let mut exp = Experiment::named("rest");
    exp.append_element(&Element::from(OpenCircuit::new(duration, 1.0)), 1);
    exp
}

#[tokio::test(start_paused = true)]
async fn program_runs_over_the_line_framing() {
    let (handle, _sim, server) = wire(SimSpec::new("wired").with_channels(2)).await;
    assert_eq!(handle.name(), "wired");
    assert_eq!(handle.port(), "duplex");
    assert_eq!(handle.channel_count(), 2);

    let mut events = handle.subscribe();
    let reason = handle
        .run_to_completion(1, &rest(3.0), Duration::from_secs(30))
        .await
        .unwrap();
    assert_eq!(reason, StopReason::Completed);

    let mut samples = 0;
    let mut steps = 0;
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.channel, Some(1));
        match event.kind {
            EventKind::ActiveDcData { .. } => samples += 1,
            EventKind::NewElementStarting { .. } => steps += 1,
            _ => {}
        }
    }
    assert_eq!((steps, samples), (1, 3));

    assert_eq!(
        handle.start(5).await,
        Err(InstrumentError::InvalidChannel(5))
    );

    handle.close().await;
    assert!(!handle.is_connected());
    server.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn pause_notifications_cross_the_wire() {
    let (handle, _sim, _server) = wire(SimSpec::new("wired")).await;
    let mut events = handle.subscribe();

    handle.upload(0, &rest(60.0)).await.unwrap();
    handle.start(0).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    handle.pause(0).await.unwrap();
    handle.resume(0).await.unwrap();
    handle.stop(0).await.unwrap();

    let mut kinds = Vec::new();
    loop {
        let kind = events.recv().await.unwrap().kind;
        let stopped = matches!(kind, EventKind::ExperimentStopped { .. });
        kinds.push(kind);
        if stopped {
            break;
        }
    }
    assert!(kinds.contains(&EventKind::ExperimentPaused));
    assert!(kinds.contains(&EventKind::ExperimentResumed));
    assert_eq!(
        kinds.last(),
        Some(&EventKind::ExperimentStopped {
            reason: StopReason::UserRequested
        })
    );
}

#[tokio::test(start_paused = true)]
async fn device_side_unplug_reaches_the_host() {
    let (handle, sim, server) = wire(SimSpec::new("wired")).await;
    let mut events = handle.subscribe();
    handle.upload(0, &rest(60.0)).await.unwrap();
    handle.start(0).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1_500)).await;

    sim.unplug();
    handle.wait_disconnected().await;

    let mut tail = Vec::new();
    while let Ok(event) = events.try_recv() {
        if event.kind.provenance().is_none() {
            tail.push(event.kind);
        }
    }
    assert!(tail.ends_with(&[
        EventKind::ExperimentStopped {
            reason: StopReason::Disconnected
        },
        EventKind::DeviceDisconnected,
    ]));

    handle.close().await;
    server.await.unwrap().unwrap();
}
