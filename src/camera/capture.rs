//! Camera capture loops.
//!
//! One task per camera pulls frames from its `CameraPort` at the camera's native
//! rate and publishes them to that camera's `FrameBroadcastHub`. The loops run
//! regardless of what the sequencer is doing.
//!
//! A disconnect is reported once through `CameraEvent::Disconnected`; the loop
//! then retries `open` every `reconnect_interval` and reports `Recovered` when
//! the camera is back. Sequence numbers keep counting across reconnects.

use crate::config::CameraConfig;
use crate::core::{CameraFrame, CameraId, SharedFrame};
use crate::camera::hub::FrameBroadcastHub;
use crate::error::{AppResult, SsrError};
use crate::hardware::capabilities::{CameraPort, PortError, RawFrame};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, trace, warn, Instrument};

/// Connection state of one camera as seen by its capture loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraStatus {
    /// No capture loop running.
    Idle,
    Streaming,
    /// Loop running, waiting for the camera to come back.
    Disconnected,
}

/// Notifications from the capture loops.
#[derive(Debug, Clone, PartialEq)]
pub enum CameraEvent {
    Started { camera: CameraId },
    Disconnected { camera: CameraId, reason: String },
    Recovered { camera: CameraId },
    Stopped { camera: CameraId },
}

struct CaptureTask {
    shutdown_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

struct CameraEntry {
    config: CameraConfig,
    port: Arc<dyn CameraPort>,
    hub: Arc<FrameBroadcastHub>,
    status: watch::Sender<CameraStatus>,
    sequence: AtomicU64,
    task: Mutex<Option<CaptureTask>>,
}

impl CameraEntry {
    fn next_frame(&self, raw: RawFrame) -> CameraFrame {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let captured_at = Utc::now();
        let region = self
            .config
            .roi
            .and_then(|roi| roi.clamp_to(raw.width, raw.height));
        match region {
            Some(roi) => CameraFrame {
                camera: self.config.id,
                sequence,
                captured_at,
                width: roi.width,
                height: roi.height,
                channels: raw.channels,
                pixels: roi.crop(raw.width, raw.channels, &raw.pixels),
            },
            None => CameraFrame {
                camera: self.config.id,
                sequence,
                captured_at,
                width: raw.width,
                height: raw.height,
                channels: raw.channels,
                pixels: raw.pixels,
            },
        }
    }
}

/// Owns the capture loop of every configured camera.
pub struct CameraCaptureService {
    cameras: BTreeMap<CameraId, Arc<CameraEntry>>,
    events: broadcast::Sender<CameraEvent>,
}

impl CameraCaptureService {
    pub fn new(event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            cameras: BTreeMap::new(),
            events,
        }
    }

    /// Register a camera and create its hub.
    pub fn add_camera(
        &mut self,
        config: CameraConfig,
        port: Arc<dyn CameraPort>,
    ) -> AppResult<Arc<FrameBroadcastHub>> {
        let id = config.id;
        if self.cameras.contains_key(&id) {
            return Err(SsrError::InvalidParameter(format!(
                "camera {id} registered twice"
            )));
        }
        let hub = Arc::new(FrameBroadcastHub::new(id));
        let (status, _) = watch::channel(CameraStatus::Idle);
        self.cameras.insert(
            id,
            Arc::new(CameraEntry {
                config,
                port,
                hub: Arc::clone(&hub),
                status,
                sequence: AtomicU64::new(0),
                task: Mutex::new(None),
            }),
        );
        Ok(hub)
    }

    pub fn camera_ids(&self) -> Vec<CameraId> {
        self.cameras.keys().copied().collect()
    }

    pub fn hub(&self, camera: CameraId) -> AppResult<Arc<FrameBroadcastHub>> {
        Ok(Arc::clone(&self.entry(camera)?.hub))
    }

    pub fn status(&self, camera: CameraId) -> AppResult<CameraStatus> {
        Ok(*self.entry(camera)?.status.borrow())
    }

    pub fn watch_status(&self, camera: CameraId) -> AppResult<watch::Receiver<CameraStatus>> {
        Ok(self.entry(camera)?.status.subscribe())
    }

    /// Subscribe to camera events. Dropping the receiver unsubscribes.
    pub fn subscribe_events(&self) -> broadcast::Receiver<CameraEvent> {
        self.events.subscribe()
    }

    /// Sequence number of the last captured frame (0 before the first).
    pub fn last_sequence(&self, camera: CameraId) -> AppResult<u64> {
        Ok(self.entry(camera)?.sequence.load(Ordering::SeqCst))
    }

    /// Spawn the capture loop. Starting a running camera is a no-op.
    pub async fn start_capture(&self, camera: CameraId) -> AppResult<()> {
        let entry = Arc::clone(self.entry(camera)?);
        let mut task = entry.task.lock().await;
        if task.is_some() {
            debug!(%camera, "Capture already running");
            return Ok(());
        }

        let _ = self.events.send(CameraEvent::Started { camera });
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let events = self.events.clone();
        let handle = tokio::spawn(
            capture_loop(Arc::clone(&entry), events, shutdown_rx)
                .instrument(info_span!("capture", %camera)),
        );
        *task = Some(CaptureTask {
            shutdown_tx,
            handle,
        });
        info!(%camera, "Capture started");
        Ok(())
    }

    /// Stop the capture loop and close the camera. Stopping an idle camera is a no-op.
    pub async fn stop_capture(&self, camera: CameraId) -> AppResult<()> {
        let entry = self.entry(camera)?;
        let Some(task) = entry.task.lock().await.take() else {
            return Ok(());
        };
        let _ = task.shutdown_tx.send(());
        if let Err(e) = task.handle.await {
            warn!(%camera, error = %e, "Capture task ended abnormally");
            entry.port.close().await;
            entry.status.send_replace(CameraStatus::Idle);
        }
        let _ = self.events.send(CameraEvent::Stopped { camera });
        info!(%camera, "Capture stopped");
        Ok(())
    }

    pub async fn start_all(&self) -> AppResult<()> {
        for camera in self.camera_ids() {
            self.start_capture(camera).await?;
        }
        Ok(())
    }

    pub async fn stop_all(&self) -> AppResult<()> {
        for camera in self.camera_ids() {
            self.stop_capture(camera).await?;
        }
        Ok(())
    }

    /// Wait for the next frame captured after this call.
    ///
    /// Reads the same stream the hub publishes without consuming from it. Fails
    /// with `CameraDisconnected` right away if the camera is down, as soon as it
    /// goes down while waiting, or if no frame arrives within `timeout`.
    pub async fn tag_next_frame(
        &self,
        camera: CameraId,
        timeout: Duration,
    ) -> AppResult<SharedFrame> {
        let entry = self.entry(camera)?;
        let mut status = entry.status.subscribe();
        let down = *status.borrow_and_update() == CameraStatus::Disconnected;
        if down {
            return Err(SsrError::CameraDisconnected {
                camera,
                reason: "camera unavailable".to_string(),
            });
        }

        let mut frames = entry.hub.subscribe();
        frames.latest();

        let wait = async {
            tokio::select! {
                frame = frames.next() => frame.ok_or_else(|| SsrError::CameraDisconnected {
                    camera,
                    reason: "capture stopped".to_string(),
                }),
                () = wait_for_disconnect(&mut status) => Err(SsrError::CameraDisconnected {
                    camera,
                    reason: "disconnected while waiting for frame".to_string(),
                }),
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(SsrError::CameraDisconnected {
                camera,
                reason: format!("no frame within {} ms", timeout.as_millis()),
            }),
        }
    }

    fn entry(&self, camera: CameraId) -> AppResult<&Arc<CameraEntry>> {
        self.cameras
            .get(&camera)
            .ok_or(SsrError::UnknownCamera(camera))
    }
}

async fn wait_for_disconnect(status: &mut watch::Receiver<CameraStatus>) {
    loop {
        let down = *status.borrow_and_update() == CameraStatus::Disconnected;
        if down {
            return;
        }
        if status.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

async fn capture_loop(
    entry: Arc<CameraEntry>,
    events: broadcast::Sender<CameraEvent>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let camera = entry.config.id;
    let frame_timeout = entry.config.frame_timeout;
    let reconnect_interval = entry.config.reconnect_interval;
    let mut open = false;

    loop {
        if !open {
            match entry.port.open().await {
                Ok(()) => {
                    open = true;
                    let previous = entry.status.send_replace(CameraStatus::Streaming);
                    if previous == CameraStatus::Disconnected {
                        info!("Camera recovered");
                        let _ = events.send(CameraEvent::Recovered { camera });
                    }
                }
                Err(e) => {
                    mark_disconnected(&entry, &events, e.to_string());
                    tokio::select! {
                        _ = &mut shutdown_rx => break,
                        () = tokio::time::sleep(reconnect_interval) => continue,
                    }
                }
            }
        }

        tokio::select! {
            biased;
            _ = &mut shutdown_rx => break,
            result = entry.port.next_frame(frame_timeout) => match result {
                Ok(raw) if raw.is_well_formed() => {
                    let frame = Arc::new(entry.next_frame(raw));
                    trace!(sequence = frame.sequence, "Frame captured");
                    entry.hub.publish(frame);
                }
                Ok(raw) => {
                    warn!(
                        width = raw.width,
                        height = raw.height,
                        len = raw.pixels.len(),
                        "Dropping malformed frame"
                    );
                }
                Err(PortError::Timeout) => {
                    trace!("Frame timeout");
                }
                Err(PortError::Disconnected(reason) | PortError::Failed(reason)) => {
                    open = false;
                    mark_disconnected(&entry, &events, reason);
                }
            },
        }
    }

    entry.port.close().await;
    entry.status.send_replace(CameraStatus::Idle);
    debug!("Capture loop exited");
}

fn mark_disconnected(entry: &CameraEntry, events: &broadcast::Sender<CameraEvent>, reason: String) {
    let previous = entry.status.send_replace(CameraStatus::Disconnected);
    if previous != CameraStatus::Disconnected {
        warn!(%reason, "Camera disconnected");
        let _ = events.send(CameraEvent::Disconnected {
            camera: entry.config.id,
            reason,
        });
    }
}
