//! Shared helpers for integration tests.

#![allow(dead_code)]

use ssr_daq::config::{Settings, StageTimeouts};
use ssr_daq::core::CameraId;
use ssr_daq::hardware::capabilities::{ActuatorPort, CameraPort, SensorPort};
use ssr_daq::hardware::mock::{MockActuator, MockCamera, MockScale};
use ssr_daq::storage::records::{MemoryRecordStore, SampleRecordStore};
use ssr_daq::DeviceContext;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Frame interval of the test cameras.
pub const FRAME_INTERVAL: Duration = Duration::from_millis(5);

/// Settings with short mechanical moves and the standard 2 s weighing timeout.
pub fn fast_settings(data_dir: &Path) -> Settings {
    let mut settings = Settings::default().with_dual_cameras();
    settings.application.data_dir = data_dir.to_path_buf();

    let sequencer = &mut settings.sequencer;
    sequencer.conveyor.load_duration = Duration::from_millis(20);
    sequencer.conveyor.unload_duration = Duration::from_millis(20);
    sequencer.separation.dwell = Duration::from_millis(20);
    sequencer.imaging.frame_timeout = Duration::from_millis(200);
    sequencer.imaging.save_snapshots = false;
    sequencer.timeouts = StageTimeouts {
        loading: Duration::from_millis(500),
        separating: Duration::from_millis(500),
        weighing: Duration::from_millis(2000),
        imaging: Duration::from_millis(1000),
        unloading: Duration::from_millis(500),
    };
    for camera in &mut settings.cameras {
        camera.reconnect_interval = Duration::from_millis(50);
    }
    settings
}

/// A running device plus handles to every mock behind it.
pub struct TestDevice {
    pub device: DeviceContext,
    pub actuator: Arc<MockActuator>,
    pub scale: Arc<MockScale>,
    pub cam1: Arc<MockCamera>,
    pub cam2: Arc<MockCamera>,
    pub store: Arc<MemoryRecordStore>,
}

/// Start a dual-camera mock device with an in-memory record store.
pub async fn start_device(settings: Settings, scale: MockScale) -> TestDevice {
    let actuator = Arc::new(MockActuator::new());
    let scale = Arc::new(scale);
    let cam1 = Arc::new(MockCamera::with_format(32, 24, 1, FRAME_INTERVAL));
    let cam2 = Arc::new(MockCamera::with_format(32, 24, 1, FRAME_INTERVAL));
    let store = Arc::new(MemoryRecordStore::new());

    let device = DeviceContext::builder(settings)
        .actuator(Arc::clone(&actuator) as Arc<dyn ActuatorPort>)
        .sensor(Arc::clone(&scale) as Arc<dyn SensorPort>)
        .camera(CameraId(1), Arc::clone(&cam1) as Arc<dyn CameraPort>)
        .camera(CameraId(2), Arc::clone(&cam2) as Arc<dyn CameraPort>)
        .store(Arc::clone(&store) as Arc<dyn SampleRecordStore>)
        .start()
        .await
        .expect("device should start");

    TestDevice {
        device,
        actuator,
        scale,
        cam1,
        cam2,
        store,
    }
}

/// Mean of a set of durations.
pub fn mean(samples: &[Duration]) -> Duration {
    if samples.is_empty() {
        return Duration::ZERO;
    }
    samples.iter().sum::<Duration>() / samples.len() as u32
}

/// Assert `actual` lies within `tolerance` (fraction) of `expected`.
pub fn assert_within(actual: Duration, expected: Duration, tolerance: f64) {
    let diff = actual.as_secs_f64() - expected.as_secs_f64();
    assert!(
        diff.abs() <= expected.as_secs_f64() * tolerance,
        "{actual:?} not within {:.0}% of {expected:?}",
        tolerance * 100.0
    );
}
