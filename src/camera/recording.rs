//! Recording sessions.
//!
//! At most one session per camera. A session attaches a bounded `FrameTap` to
//! the camera's hub and a dedicated writer task drains it into a `FrameSink`.
//! When the writer falls behind, the tap drops its oldest frame and counts it;
//! the capture loop is never slowed down.
//!
//! Stopping a session detaches the tap first, then lets the writer drain what
//! is still queued before the sink is closed. A write failure aborts only that
//! session: the sink is closed with what was written, an `Aborted` event is
//! emitted and the next `stop_recording` for it returns `RecordingWrite`.

use crate::camera::hub::{FrameBroadcastHub, FrameTap};
use crate::core::{CameraId, SessionId};
use crate::error::{AppResult, SsrError};
use crate::storage::video::{
    write_sidecar, FrameSink, FrameSinkFactory, SessionMetadata, SessionStatus,
};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Final counters of a session.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingSummary {
    pub session_id: SessionId,
    pub camera: CameraId,
    pub started_at: DateTime<Utc>,
    pub stopped_at: DateTime<Utc>,
    pub output: PathBuf,
    /// Frames handed to the session by the hub.
    pub frames_received: u64,
    pub frames_written: u64,
    pub frames_dropped: u64,
    pub status: SessionStatus,
    pub error: Option<String>,
}

impl RecordingSummary {
    fn metadata(&self) -> SessionMetadata {
        SessionMetadata {
            session_id: self.session_id,
            camera: self.camera,
            started_at: self.started_at,
            stopped_at: self.stopped_at,
            output: self.output.clone(),
            frames_written: self.frames_written,
            frames_dropped: self.frames_dropped,
            status: self.status,
            error: self.error.clone(),
        }
    }
}

/// Live counters of an active session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordingStats {
    pub session_id: SessionId,
    pub frames_received: u64,
    pub frames_written: u64,
    pub frames_dropped: u64,
    pub queued: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecordingEvent {
    Started { session: SessionId, camera: CameraId },
    Stopped { summary: RecordingSummary },
    Aborted { session: SessionId, camera: CameraId, reason: String },
}

struct ActiveSession {
    id: SessionId,
    started_at: DateTime<Utc>,
    tap: Arc<FrameTap>,
    written: Arc<AtomicU64>,
    writer: JoinHandle<WriterOutcome>,
}

struct WriterOutcome {
    output: PathBuf,
    error: Option<String>,
}

type ActiveMap = Arc<Mutex<HashMap<CameraId, ActiveSession>>>;
type AbortedMap = Arc<Mutex<HashMap<SessionId, RecordingSummary>>>;

/// Everything the writer task needs to abort its own session.
struct WriterContext {
    session: SessionId,
    camera: CameraId,
    started_at: DateTime<Utc>,
    hub: Arc<FrameBroadcastHub>,
    tap: Arc<FrameTap>,
    written: Arc<AtomicU64>,
    sidecar: PathBuf,
    active: ActiveMap,
    aborted: AbortedMap,
    events: broadcast::Sender<RecordingEvent>,
}

pub struct RecordingManager {
    hubs: BTreeMap<CameraId, Arc<FrameBroadcastHub>>,
    factory: Arc<dyn FrameSinkFactory>,
    queue_capacity: usize,
    active: ActiveMap,
    aborted: AbortedMap,
    events: broadcast::Sender<RecordingEvent>,
}

impl RecordingManager {
    pub fn new(
        hubs: impl IntoIterator<Item = Arc<FrameBroadcastHub>>,
        factory: Arc<dyn FrameSinkFactory>,
        queue_capacity: usize,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            hubs: hubs.into_iter().map(|hub| (hub.camera(), hub)).collect(),
            factory,
            queue_capacity: queue_capacity.max(1),
            active: Arc::new(Mutex::new(HashMap::new())),
            aborted: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    /// Subscribe to session events. Dropping the receiver unsubscribes.
    pub fn subscribe_events(&self) -> broadcast::Receiver<RecordingEvent> {
        self.events.subscribe()
    }

    /// Open a session for `camera`.
    ///
    /// Fails with `AlreadyRecording`, leaving the running session untouched, if
    /// the camera already has one.
    pub async fn start_recording(&self, camera: CameraId) -> AppResult<SessionId> {
        let hub = self
            .hubs
            .get(&camera)
            .ok_or(SsrError::UnknownCamera(camera))?;
        let mut active = self.active.lock().await;
        if active.contains_key(&camera) {
            return Err(SsrError::AlreadyRecording(camera));
        }

        let session = SessionId::new();
        let sink = self.factory.create(camera, session).await?;
        let tap = Arc::new(hub.add_tap(self.queue_capacity));
        let written = Arc::new(AtomicU64::new(0));
        let started_at = Utc::now();

        let ctx = WriterContext {
            session,
            camera,
            started_at,
            hub: Arc::clone(hub),
            tap: Arc::clone(&tap),
            written: Arc::clone(&written),
            sidecar: self.factory.sidecar_path(camera, session),
            active: Arc::clone(&self.active),
            aborted: Arc::clone(&self.aborted),
            events: self.events.clone(),
        };
        let writer = tokio::spawn(
            run_writer(ctx, sink).instrument(info_span!("recording", %camera, %session)),
        );
        active.insert(
            camera,
            ActiveSession {
                id: session,
                started_at,
                tap,
                written,
                writer,
            },
        );
        drop(active);

        info!(%camera, %session, "Recording started");
        let _ = self.events.send(RecordingEvent::Started { session, camera });
        Ok(session)
    }

    /// Stop intake, flush every queued frame, close the output and report counts.
    pub async fn stop_recording(&self, session: SessionId) -> AppResult<RecordingSummary> {
        let removed = {
            let mut active = self.active.lock().await;
            let camera = active
                .iter()
                .find(|(_, s)| s.id == session)
                .map(|(camera, _)| *camera);
            camera.and_then(|camera| active.remove(&camera).map(|s| (camera, s)))
        };

        let Some((camera, entry)) = removed else {
            return match self.aborted.lock().await.remove(&session) {
                Some(summary) => Err(SsrError::RecordingWrite {
                    camera: summary.camera,
                    reason: summary.error.unwrap_or_else(|| "session aborted".to_string()),
                }),
                None => Err(SsrError::UnknownSession(session)),
            };
        };

        if let Some(hub) = self.hubs.get(&camera) {
            hub.remove_tap(&entry.tap);
        }
        entry.tap.close();

        let outcome = entry.writer.await.map_err(|e| SsrError::RecordingWrite {
            camera,
            reason: format!("writer task failed: {e}"),
        })?;

        let summary = RecordingSummary {
            session_id: session,
            camera,
            started_at: entry.started_at,
            stopped_at: Utc::now(),
            output: outcome.output,
            frames_received: entry.tap.accepted(),
            frames_written: entry.written.load(Ordering::SeqCst),
            frames_dropped: entry.tap.dropped(),
            status: if outcome.error.is_some() {
                SessionStatus::Aborted
            } else {
                SessionStatus::Completed
            },
            error: outcome.error.clone(),
        };

        if let Some(reason) = outcome.error {
            return Err(SsrError::RecordingWrite { camera, reason });
        }

        let sidecar = self.factory.sidecar_path(camera, session);
        write_sidecar(&sidecar, &summary.metadata()).await?;

        info!(
            %camera,
            %session,
            written = summary.frames_written,
            dropped = summary.frames_dropped,
            "Recording stopped"
        );
        let _ = self.events.send(RecordingEvent::Stopped {
            summary: summary.clone(),
        });
        Ok(summary)
    }

    /// Stop every active session, e.g. on shutdown.
    pub async fn stop_all(&self) -> Vec<AppResult<RecordingSummary>> {
        let sessions: Vec<SessionId> = self.active.lock().await.values().map(|s| s.id).collect();
        let mut results = Vec::with_capacity(sessions.len());
        for session in sessions {
            results.push(self.stop_recording(session).await);
        }
        results
    }

    pub async fn is_recording(&self, camera: CameraId) -> bool {
        self.active.lock().await.contains_key(&camera)
    }

    pub async fn active_session(&self, camera: CameraId) -> Option<SessionId> {
        self.active.lock().await.get(&camera).map(|s| s.id)
    }

    pub async fn stats(&self, camera: CameraId) -> Option<RecordingStats> {
        self.active.lock().await.get(&camera).map(|s| RecordingStats {
            session_id: s.id,
            frames_received: s.tap.accepted(),
            frames_written: s.written.load(Ordering::SeqCst),
            frames_dropped: s.tap.dropped(),
            queued: s.tap.len(),
        })
    }
}

async fn run_writer(ctx: WriterContext, mut sink: Box<dyn FrameSink>) -> WriterOutcome {
    let mut failure = None;
    while let Some(frame) = ctx.tap.recv().await {
        if let Err(e) = sink.write_frame(&frame).await {
            error!(sequence = frame.sequence, error = %e, "Frame write failed");
            failure = Some(e.to_string());
            break;
        }
        ctx.written.fetch_add(1, Ordering::SeqCst);
    }

    if failure.is_some() {
        ctx.hub.remove_tap(&ctx.tap);
        ctx.tap.close();
    }
    if let Err(e) = sink.finish().await {
        warn!(error = %e, "Closing recording output failed");
        failure.get_or_insert_with(|| e.to_string());
    }
    let output = sink.output_path().to_path_buf();

    if let Some(reason) = &failure {
        abort_session(&ctx, output.clone(), reason.clone()).await;
    } else {
        debug!("Writer drained");
    }
    WriterOutcome {
        output,
        error: failure,
    }
}

async fn abort_session(ctx: &WriterContext, output: PathBuf, reason: String) {
    let summary = RecordingSummary {
        session_id: ctx.session,
        camera: ctx.camera,
        started_at: ctx.started_at,
        stopped_at: Utc::now(),
        output,
        frames_received: ctx.tap.accepted(),
        frames_written: ctx.written.load(Ordering::SeqCst),
        frames_dropped: ctx.tap.dropped(),
        status: SessionStatus::Aborted,
        error: Some(reason.clone()),
    };
    if let Err(e) = write_sidecar(&ctx.sidecar, &summary.metadata()).await {
        warn!(error = %e, "Failed to write session metadata");
    }

    {
        let mut active = ctx.active.lock().await;
        if active.get(&ctx.camera).is_some_and(|s| s.id == ctx.session) {
            active.remove(&ctx.camera);
            // one unclaimed abort per camera; a newer one replaces it
            let mut aborted = ctx.aborted.lock().await;
            aborted.retain(|_, s| s.camera != ctx.camera);
            aborted.insert(ctx.session, summary);
        }
    }

    warn!(%reason, "Recording aborted");
    let _ = ctx.events.send(RecordingEvent::Aborted {
        session: ctx.session,
        camera: ctx.camera,
        reason,
    });
}
