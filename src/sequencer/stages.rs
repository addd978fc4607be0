//! Stage bodies.
//!
//! Each stage is one async call the control loop spawns and waits for through
//! its event channel. Stages never enforce the stage timeout themselves; the
//! control loop owns the deadline.

use crate::camera::capture::CameraCaptureService;
use crate::camera::recording::RecordingManager;
use crate::config::SequencerConfig;
use crate::core::{BatchId, DeviceState, ImageRef};
use crate::error::{AppResult, SsrError};
use crate::hardware::capabilities::{ActuatorPort, ConveyorMove, PortError, SensorPort};
use crate::sequencer::messages::StageOutput;
use crate::sequencer::stability::StabilityFilter;
use crate::storage::snapshot::SnapshotWriter;
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Hardware the stages drive.
#[derive(Clone)]
pub struct StagePorts {
    pub actuator: Arc<dyn ActuatorPort>,
    pub sensor: Arc<dyn SensorPort>,
    pub capture: Arc<CameraCaptureService>,
    /// Where imaging frames are saved; `None` keeps references without files.
    pub snapshots: Option<SnapshotWriter>,
    pub auto_stop: Option<RecordingAutoStop>,
}

/// Stops every active recording when a weighing sample drops below `below_g`
/// (the tray lifted off the scale).
#[derive(Clone)]
pub struct RecordingAutoStop {
    pub recording: Arc<RecordingManager>,
    pub below_g: f64,
}

impl RecordingAutoStop {
    async fn check(&self, grams: f64) {
        if grams >= self.below_g {
            return;
        }
        let results = self.recording.stop_all().await;
        if results.is_empty() {
            return;
        }
        info!(
            grams,
            threshold = self.below_g,
            sessions = results.len(),
            "Weight below auto-stop threshold, recordings stopped"
        );
        for result in results {
            if let Err(e) = result {
                warn!(error = %e, "Auto-stop of recording failed");
            }
        }
    }
}

pub(crate) struct StageRunner {
    ports: StagePorts,
    config: SequencerConfig,
}

fn actuator_fault(stage: DeviceState, err: PortError) -> SsrError {
    SsrError::ActuatorFault {
        stage,
        reason: err.to_string(),
    }
}

impl StageRunner {
    pub(crate) fn new(ports: StagePorts, config: SequencerConfig) -> Self {
        Self { ports, config }
    }

    pub(crate) async fn run(&self, stage: DeviceState, batch: BatchId) -> AppResult<StageOutput> {
        match stage {
            DeviceState::Loading => self.load().await,
            DeviceState::Separating => self.separate().await,
            DeviceState::Weighing => self.weigh().await,
            DeviceState::Imaging => Ok(self.image(batch).await),
            DeviceState::Unloading => self.unload().await,
            DeviceState::Idle | DeviceState::Fault => Err(SsrError::InvalidTransition {
                from: stage,
                reason: "not a stage".to_string(),
            }),
        }
    }

    async fn load(&self) -> AppResult<StageOutput> {
        self.ports
            .actuator
            .move_conveyor(ConveyorMove::Duration(self.config.conveyor.load_duration))
            .await
            .map_err(|e| actuator_fault(DeviceState::Loading, e))?;
        Ok(StageOutput::Moved)
    }

    async fn separate(&self) -> AppResult<StageOutput> {
        let stage = DeviceState::Separating;
        let separation = &self.config.separation;
        let actuator = &self.ports.actuator;

        actuator
            .set_airflow_gate(separation.airflow_level)
            .await
            .map_err(|e| actuator_fault(stage, e))?;
        tokio::time::sleep(separation.dwell).await;
        actuator
            .set_airflow_gate(0)
            .await
            .map_err(|e| actuator_fault(stage, e))?;
        Ok(StageOutput::Moved)
    }

    /// Sample until two consecutive readings agree. Runs until the control loop's
    /// deadline if the scale never settles.
    async fn weigh(&self) -> AppResult<StageOutput> {
        let weighing = &self.config.weighing;
        let mut filter = StabilityFilter::new(weighing.tolerance_g);
        loop {
            match self.ports.sensor.read_weight(weighing.sample_timeout).await {
                Ok(grams) => {
                    debug!(grams, "Scale sample");
                    if let Some(auto_stop) = &self.ports.auto_stop {
                        auto_stop.check(grams).await;
                    }
                    if let Some(stable) = filter.push(grams) {
                        return Ok(StageOutput::Weighed(stable));
                    }
                }
                Err(PortError::Timeout) => {
                    debug!("Scale sample timed out");
                    filter.reset();
                }
                Err(e) => {
                    return Err(SsrError::SensorTimeout(format!("scale unavailable: {e}")));
                }
            }
            tokio::time::sleep(weighing.sample_interval).await;
        }
    }

    /// Tag the next frame of every camera. A camera that is down yields a null
    /// image and a warning; imaging itself never fails.
    async fn image(&self, batch: BatchId) -> StageOutput {
        let capture = &self.ports.capture;
        let timeout = self.config.imaging.frame_timeout;
        let tagged = join_all(capture.camera_ids().into_iter().map(|camera| async move {
            (camera, capture.tag_next_frame(camera, timeout).await)
        }))
        .await;

        let mut images = Vec::with_capacity(tagged.len());
        let mut warnings = Vec::new();
        for (camera, result) in tagged {
            let frame = match result {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(%batch, %camera, error = %e, "No image for camera");
                    warnings.push(format!("camera {camera} unavailable: {e}"));
                    images.push((camera, None));
                    continue;
                }
            };

            let path = match &self.ports.snapshots {
                Some(writer) => match writer.save(batch, &frame).await {
                    Ok(path) => Some(path),
                    Err(e) => {
                        warn!(%batch, %camera, error = %e, "Snapshot failed");
                        warnings.push(format!("camera {camera} snapshot failed: {e}"));
                        None
                    }
                },
                None => None,
            };
            images.push((
                camera,
                Some(ImageRef {
                    camera,
                    sequence: frame.sequence,
                    captured_at: frame.captured_at,
                    path,
                }),
            ));
        }
        StageOutput::Imaged { images, warnings }
    }

    async fn unload(&self) -> AppResult<StageOutput> {
        self.ports
            .actuator
            .move_conveyor(ConveyorMove::Duration(self.config.conveyor.unload_duration))
            .await
            .map_err(|e| actuator_fault(DeviceState::Unloading, e))?;
        Ok(StageOutput::Moved)
    }
}
