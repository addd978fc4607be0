//! Device context.
//!
//! `DeviceContext` owns every component of one running device. It is built
//! explicitly from a `Settings` plus the hardware ports, started once, and torn
//! down once:
//!
//! 1. capture loops start, then the sequencer control loop is spawned;
//! 2. `shutdown` stops the sequencer (after its in-flight command resolves),
//!    flushes and closes every recording, then stops the capture loops, which
//!    closes the cameras.
//!
//! ```rust,ignore
//! let device = DeviceContext::builder(settings)
//!     .actuator(Arc::new(mcu))
//!     .sensor(Arc::new(scale))
//!     .camera(CameraId(1), Arc::new(cam1))
//!     .camera(CameraId(2), Arc::new(cam2))
//!     .start()
//!     .await?;
//! device.sequencer().start_cycle().await?;
//! device.shutdown().await?;
//! ```

use crate::camera::capture::CameraCaptureService;
use crate::camera::preview::PreviewManager;
use crate::camera::recording::RecordingManager;
use crate::config::Settings;
use crate::core::CameraId;
use crate::error::{AppResult, SsrError};
use crate::hardware::capabilities::{ActuatorPort, CameraPort, SensorPort};
use crate::hardware::mock::{MockActuator, MockCamera, MockScale};
use crate::sequencer::{RecordingAutoStop, SequencerFSM, SequencerHandle, StagePorts};
use crate::storage::records::{open_store, SampleRecordStore};
use crate::storage::snapshot::SnapshotWriter;
use crate::storage::video::{FileSinkFactory, FrameSinkFactory};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Collects the ports and overrides for a `DeviceContext`.
pub struct DeviceContextBuilder {
    settings: Settings,
    actuator: Option<Arc<dyn ActuatorPort>>,
    sensor: Option<Arc<dyn SensorPort>>,
    cameras: BTreeMap<CameraId, Arc<dyn CameraPort>>,
    store: Option<Arc<dyn SampleRecordStore>>,
    sink_factory: Option<Arc<dyn FrameSinkFactory>>,
}

impl DeviceContextBuilder {
    #[must_use]
    pub fn actuator(mut self, actuator: Arc<dyn ActuatorPort>) -> Self {
        self.actuator = Some(actuator);
        self
    }

    #[must_use]
    pub fn sensor(mut self, sensor: Arc<dyn SensorPort>) -> Self {
        self.sensor = Some(sensor);
        self
    }

    #[must_use]
    pub fn camera(mut self, id: CameraId, port: Arc<dyn CameraPort>) -> Self {
        self.cameras.insert(id, port);
        self
    }

    /// Use `store` instead of the one selected by `settings.storage`.
    #[must_use]
    pub fn store(mut self, store: Arc<dyn SampleRecordStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use `factory` instead of files under the recording directory.
    #[must_use]
    pub fn sink_factory(mut self, factory: Arc<dyn FrameSinkFactory>) -> Self {
        self.sink_factory = Some(factory);
        self
    }

    /// Validate, wire every component, and start capture and the sequencer.
    pub async fn start(mut self) -> AppResult<DeviceContext> {
        let settings = self.settings;
        settings.validate()?;

        let actuator = self
            .actuator
            .ok_or_else(|| SsrError::InvalidParameter("no actuator port".to_string()))?;
        let sensor = self
            .sensor
            .ok_or_else(|| SsrError::InvalidParameter("no sensor port".to_string()))?;

        let mut capture = CameraCaptureService::new(settings.sequencer.event_channel_capacity);
        let mut hubs = Vec::with_capacity(settings.cameras.len());
        for camera in &settings.cameras {
            let port = self.cameras.remove(&camera.id).ok_or_else(|| {
                SsrError::InvalidParameter(format!("no port for camera {}", camera.id))
            })?;
            hubs.push(capture.add_camera(camera.clone(), port)?);
        }
        if let Some(extra) = self.cameras.keys().next() {
            return Err(SsrError::InvalidParameter(format!(
                "camera {extra} has a port but no configuration"
            )));
        }
        let capture = Arc::new(capture);

        let store = match self.store {
            Some(store) => store,
            None => open_store(&settings).await?,
        };
        let sink_factory = self.sink_factory.unwrap_or_else(|| {
            Arc::new(FileSinkFactory::new(
                settings.recording_dir(),
                settings.recording.mode,
                settings.recording.extract_interval,
            ))
        });

        let preview = Arc::new(PreviewManager::new(hubs.iter().cloned(), &settings.preview));
        let recording = Arc::new(RecordingManager::new(
            hubs,
            sink_factory,
            settings.recording.queue_capacity,
        ));

        capture.start_all().await?;

        let snapshots = settings
            .sequencer
            .imaging
            .save_snapshots
            .then(|| SnapshotWriter::new(settings.snapshot_dir()));
        let ports = StagePorts {
            actuator,
            sensor,
            capture: Arc::clone(&capture),
            snapshots,
            auto_stop: settings
                .recording
                .auto_stop_below_g
                .map(|below_g| RecordingAutoStop {
                    recording: Arc::clone(&recording),
                    below_g,
                }),
        };
        let (sequencer, sequencer_task) =
            SequencerFSM::spawn(settings.sequencer.clone(), ports, Arc::clone(&store));

        info!(
            name = %settings.application.name,
            cameras = settings.cameras.len(),
            "Device context started"
        );
        Ok(DeviceContext {
            settings,
            capture,
            preview,
            recording,
            sequencer,
            sequencer_task,
            store,
        })
    }
}

/// All running components of one device.
pub struct DeviceContext {
    settings: Settings,
    capture: Arc<CameraCaptureService>,
    preview: Arc<PreviewManager>,
    recording: Arc<RecordingManager>,
    sequencer: SequencerHandle,
    sequencer_task: JoinHandle<()>,
    store: Arc<dyn SampleRecordStore>,
}

impl DeviceContext {
    pub fn builder(settings: Settings) -> DeviceContextBuilder {
        DeviceContextBuilder {
            settings,
            actuator: None,
            sensor: None,
            cameras: BTreeMap::new(),
            store: None,
            sink_factory: None,
        }
    }

    /// A device backed entirely by mock hardware.
    pub async fn simulated(settings: Settings) -> AppResult<Self> {
        let mut builder = Self::builder(settings.clone())
            .actuator(Arc::new(MockActuator::new()))
            .sensor(Arc::new(MockScale::scripted([12.1, 12.4, 12.4])));
        for camera in &settings.cameras {
            builder = builder.camera(camera.id, Arc::new(MockCamera::new(320, 240)));
        }
        builder.start().await
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn sequencer(&self) -> &SequencerHandle {
        &self.sequencer
    }

    pub fn capture(&self) -> &Arc<CameraCaptureService> {
        &self.capture
    }

    pub fn preview(&self) -> &Arc<PreviewManager> {
        &self.preview
    }

    pub fn recording(&self) -> &Arc<RecordingManager> {
        &self.recording
    }

    pub fn store(&self) -> &Arc<dyn SampleRecordStore> {
        &self.store
    }

    /// Stop the sequencer, flush recordings, stop capture and close cameras.
    pub async fn shutdown(self) -> AppResult<()> {
        let mut errors = Vec::new();

        info!("Stopping sequencer");
        match self.sequencer.shutdown().await {
            Ok(()) => {
                if let Err(e) = self.sequencer_task.await {
                    error!(error = %e, "Sequencer task failed");
                }
            }
            Err(SsrError::ShutDown) => {}
            Err(e) => errors.push(e),
        }

        info!("Flushing recordings");
        for result in self.recording.stop_all().await {
            if let Err(e) = result {
                error!(error = %e, "Recording did not close cleanly");
                errors.push(e);
            }
        }

        info!("Stopping capture");
        if let Err(e) = self.capture.stop_all().await {
            errors.push(e);
        }

        if errors.is_empty() {
            info!("Device context shut down");
            Ok(())
        } else {
            Err(SsrError::ShutdownFailed(errors))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::capture::CameraStatus;
    use crate::core::DeviceState;
    use crate::storage::records::MemoryRecordStore;

    #[tokio::test]
    async fn test_missing_camera_port_rejected() {
        let settings = Settings::default().with_dual_cameras();
        let result = DeviceContext::builder(settings)
            .actuator(Arc::new(MockActuator::new()))
            .sensor(Arc::new(MockScale::steady(1.0)))
            .camera(CameraId(1), Arc::new(MockCamera::default()))
            .store(Arc::new(MemoryRecordStore::new()))
            .start()
            .await;
        assert!(matches!(result, Err(SsrError::InvalidParameter(_))));
    }

    #[tokio::test]
    async fn test_start_and_ordered_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::default().with_dual_cameras();
        settings.application.data_dir = dir.path().to_path_buf();

        let cam1 = Arc::new(MockCamera::default());
        let cam2 = Arc::new(MockCamera::default());
        let device = DeviceContext::builder(settings)
            .actuator(Arc::new(MockActuator::new()))
            .sensor(Arc::new(MockScale::steady(1.0)))
            .camera(CameraId(1), Arc::clone(&cam1) as Arc<dyn CameraPort>)
            .camera(CameraId(2), Arc::clone(&cam2) as Arc<dyn CameraPort>)
            .store(Arc::new(MemoryRecordStore::new()))
            .start()
            .await
            .unwrap();

        assert_eq!(device.sequencer().state(), DeviceState::Idle);
        let hub = device.capture().hub(CameraId(1)).unwrap();
        hub.subscribe().next().await.unwrap();

        let session = device.recording().start_recording(CameraId(1)).await.unwrap();
        assert_eq!(
            device.recording().active_session(CameraId(1)).await,
            Some(session)
        );
        let capture = Arc::clone(device.capture());
        let recording = Arc::clone(device.recording());

        device.shutdown().await.unwrap();
        assert!(!recording.is_recording(CameraId(1)).await);
        assert_eq!(capture.status(CameraId(1)).unwrap(), CameraStatus::Idle);
        assert!(!cam1.is_open());
        assert!(!cam2.is_open());
    }
}
