//! End-to-end measurement cycles against the mock device.
//!
//! All tests run on paused time with an in-memory record store, so stage
//! durations are exact and nothing touches the disk.

mod common;

use common::{assert_within, fast_settings, start_device};
use ssr_daq::camera::capture::CameraEvent;
use ssr_daq::camera::recording::RecordingEvent;
use ssr_daq::core::{CameraId, DeviceState, RecordStatus};
use ssr_daq::hardware::mock::MockScale;
use ssr_daq::storage::video::SessionStatus;
use ssr_daq::SsrError;
use std::time::Duration;
use tokio::time::Instant;
use tokio_test::{assert_err, assert_ok};

const WAIT: Duration = Duration::from_secs(10);

#[tokio::test(start_paused = true)]
async fn test_stable_weight_is_recorded_well_inside_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let t = start_device(fast_settings(dir.path()), MockScale::scripted([12.4, 12.4])).await;
    let sequencer = t.device.sequencer().clone();

    let batch = assert_ok!(sequencer.start_cycle().await);
    assert_ok!(sequencer.wait_for_state(DeviceState::Weighing, WAIT).await);
    let entered = Instant::now();
    assert_ok!(sequencer.wait_for_state(DeviceState::Imaging, WAIT).await);
    assert!(
        entered.elapsed() < Duration::from_millis(300),
        "weighing took {:?}",
        entered.elapsed()
    );
    assert_ok!(sequencer.wait_for_state(DeviceState::Idle, WAIT).await);

    let records = t.store.records().await;
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.batch_id, batch);
    assert_eq!(record.status, RecordStatus::Completed);
    assert_eq!(record.weight_g, Some(12.4));
    assert!(!record.warning);
    assert!(record.image(CameraId(1)).is_some());
    assert!(record.image(CameraId(2)).is_some());
    for stage in DeviceState::STAGES {
        assert!(record.stage_timestamps.get(stage).is_some(), "{stage} not stamped");
    }

    t.device.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_unstable_scale_faults_with_sensor_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let t = start_device(fast_settings(dir.path()), MockScale::oscillating(12.4, 0.5)).await;
    let sequencer = t.device.sequencer().clone();
    let mut transitions = sequencer.subscribe_transitions();

    sequencer.start_cycle().await.unwrap();
    sequencer
        .wait_for_state(DeviceState::Weighing, WAIT)
        .await
        .unwrap();
    let entered = Instant::now();
    sequencer
        .wait_for_state(DeviceState::Fault, WAIT)
        .await
        .unwrap();
    assert_within(entered.elapsed(), Duration::from_millis(2000), 0.05);

    let fault = loop {
        let change = transitions.recv().await.unwrap();
        if change.to == DeviceState::Fault {
            break change;
        }
    };
    assert_eq!(fault.from, DeviceState::Weighing);
    assert!(fault.error.unwrap().contains("stable reading"));

    // the scale keeps oscillating; the fault holds until reset
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(sequencer.state(), DeviceState::Fault);

    sequencer.reset().await.unwrap();
    assert_eq!(sequencer.state(), DeviceState::Idle);

    let records = t.store.records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, RecordStatus::Faulted);
    assert_eq!(records[0].weight_g, None);
    assert!(records[0].stage_timestamps.weighing.is_some());
    assert!(records[0].stage_timestamps.imaging.is_none());

    t.device.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_silent_scale_faults_with_sensor_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let t = start_device(fast_settings(dir.path()), MockScale::silent()).await;
    let sequencer = t.device.sequencer().clone();

    sequencer.start_cycle().await.unwrap();
    sequencer
        .wait_for_state(DeviceState::Fault, WAIT)
        .await
        .unwrap();
    assert_eq!(t.scale.read_count(), 0);

    sequencer.reset().await.unwrap();
    let records = t.store.records().await;
    assert!(records[0]
        .fault_reason
        .as_deref()
        .unwrap()
        .contains("no stable reading"));

    t.device.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_transitions_only_follow_stage_order_or_fault() {
    let dir = tempfile::tempdir().unwrap();
    let t = start_device(fast_settings(dir.path()), MockScale::steady(8.0)).await;
    let sequencer = t.device.sequencer().clone();
    let mut transitions = sequencer.subscribe_transitions();

    sequencer.start_cycle().await.unwrap();
    sequencer.wait_for_state(DeviceState::Idle, WAIT).await.unwrap();

    t.actuator.fail_next_move("belt jammed").await;
    sequencer.start_cycle().await.unwrap();
    sequencer.wait_for_state(DeviceState::Fault, WAIT).await.unwrap();
    sequencer.reset().await.unwrap();

    sequencer.start_cycle().await.unwrap();
    sequencer.wait_for_state(DeviceState::Idle, WAIT).await.unwrap();

    let mut edges = Vec::new();
    while let Ok(change) = transitions.try_recv() {
        assert!(
            change.from.can_transition_to(change.to),
            "illegal edge {} -> {}",
            change.from,
            change.to
        );
        assert!(
            change.to == DeviceState::Fault
                || Some(change.to) == change.from.next_stage()
                || (change.from == DeviceState::Fault && change.to == DeviceState::Idle)
        );
        edges.push((change.from, change.to));
    }

    use DeviceState::*;
    let full_cycle = [
        (Idle, Loading),
        (Loading, Separating),
        (Separating, Weighing),
        (Weighing, Imaging),
        (Imaging, Unloading),
        (Unloading, Idle),
    ];
    let mut expected = full_cycle.to_vec();
    expected.extend([(Idle, Loading), (Loading, Fault), (Fault, Idle)]);
    expected.extend(full_cycle);
    assert_eq!(edges, expected);

    let statuses: Vec<_> = t.store.records().await.iter().map(|r| r.status).collect();
    assert_eq!(
        statuses,
        vec![
            RecordStatus::Completed,
            RecordStatus::Faulted,
            RecordStatus::Completed
        ]
    );

    t.device.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_camera_disconnect_degrades_to_null_image() {
    let dir = tempfile::tempdir().unwrap();
    let t = start_device(fast_settings(dir.path()), MockScale::steady(12.4)).await;
    let sequencer = t.device.sequencer().clone();
    let mut camera_events = t.device.capture().subscribe_events();

    sequencer.start_cycle().await.unwrap();
    sequencer
        .wait_for_state(DeviceState::Separating, WAIT)
        .await
        .unwrap();
    t.cam2.disconnect();
    sequencer.wait_for_state(DeviceState::Idle, WAIT).await.unwrap();

    let records = t.store.records().await;
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.status, RecordStatus::Completed);
    assert!(record.warning);
    assert_eq!(record.images.len(), 2);
    assert!(record.image(CameraId(1)).is_some());
    assert!(record.image(CameraId(2)).is_none());
    assert!(record.warnings.iter().any(|w| w.contains("camera 2")));

    // the camera comes back and the next cycle is clean again
    t.cam2.reconnect();
    loop {
        let event = tokio::time::timeout(WAIT, camera_events.recv())
            .await
            .unwrap()
            .unwrap();
        if event == (CameraEvent::Recovered { camera: CameraId(2) }) {
            break;
        }
    }
    sequencer.start_cycle().await.unwrap();
    sequencer.wait_for_state(DeviceState::Idle, WAIT).await.unwrap();
    let records = t.store.records().await;
    assert!(!records[1].warning);
    assert!(records[1].image(CameraId(2)).is_some());

    t.device.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_start_while_running_has_no_side_effect() {
    let dir = tempfile::tempdir().unwrap();
    let t = start_device(fast_settings(dir.path()), MockScale::steady(3.0)).await;
    let sequencer = t.device.sequencer().clone();

    let batch = sequencer.start_cycle().await.unwrap();
    let err = assert_err!(sequencer.start_cycle().await);
    assert!(matches!(err, SsrError::AlreadyRunning(_)));

    sequencer.wait_for_state(DeviceState::Idle, WAIT).await.unwrap();
    let records = t.store.records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].batch_id, batch);

    t.device.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_mid_cycle_waits_for_stage() {
    let dir = tempfile::tempdir().unwrap();
    let t = start_device(fast_settings(dir.path()), MockScale::steady(3.0)).await;
    let sequencer = t.device.sequencer().clone();

    sequencer.start_cycle().await.unwrap();
    sequencer
        .wait_for_state(DeviceState::Loading, WAIT)
        .await
        .unwrap();
    let cam1 = std::sync::Arc::clone(&t.cam1);
    t.device.shutdown().await.unwrap();

    assert!(!cam1.is_open());
    assert!(matches!(sequencer.start_cycle().await, Err(SsrError::ShutDown)));

    let records = t.store.records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, RecordStatus::Aborted);
    assert_eq!(
        records[0].fault_reason.as_deref(),
        Some("shut down during Loading")
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_tray_lifted_off_scale_stops_recordings() {
    let dir = tempfile::tempdir().unwrap();
    let t = start_device(
        fast_settings(dir.path()),
        MockScale::scripted([-200.0, 12.4, 12.4]),
    )
    .await;
    let sequencer = t.device.sequencer().clone();
    let recording = t.device.recording();

    let first = recording.start_recording(CameraId(1)).await.unwrap();
    let second = recording.start_recording(CameraId(2)).await.unwrap();
    let mut events = recording.subscribe_events();

    sequencer.start_cycle().await.unwrap();
    sequencer.wait_for_state(DeviceState::Idle, WAIT).await.unwrap();

    assert!(!recording.is_recording(CameraId(1)).await);
    assert!(!recording.is_recording(CameraId(2)).await);
    let mut stopped = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let RecordingEvent::Stopped { summary } = event {
            assert_eq!(summary.status, SessionStatus::Completed);
            stopped.push(summary.session_id);
        }
    }
    stopped.sort_by_key(|s| s.to_string());
    let mut expected = vec![first, second];
    expected.sort_by_key(|s| s.to_string());
    assert_eq!(stopped, expected);

    let records = t.store.records().await;
    assert_eq!(records[0].status, RecordStatus::Completed);
    assert_eq!(records[0].weight_g, Some(12.4));

    t.device.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_auto_stop_disabled_keeps_recording() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = fast_settings(dir.path());
    settings.recording.auto_stop_below_g = None;
    let t = start_device(settings, MockScale::scripted([-200.0, 12.4, 12.4])).await;
    let sequencer = t.device.sequencer().clone();
    let recording = t.device.recording();

    let session = recording.start_recording(CameraId(1)).await.unwrap();
    sequencer.start_cycle().await.unwrap();
    sequencer.wait_for_state(DeviceState::Idle, WAIT).await.unwrap();

    assert_eq!(recording.active_session(CameraId(1)).await, Some(session));
    recording.stop_recording(session).await.unwrap();
    t.device.shutdown().await.unwrap();
}
