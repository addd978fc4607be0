//! Shared data model for the device core.
//!
//! These types cross every module boundary: the sequencer owns `DeviceState` and
//! `Batch`, the capture service produces `CameraFrame`s, and finished batches are
//! frozen into `MeasurementRecord`s for the record store.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

/// Identifier of one physical camera (1-based, matching the panel labels).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CameraId(pub u8);

impl fmt::Display for CameraId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one batch moving through the mechanical pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(pub Uuid);

impl BatchId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one recording session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// DeviceState
// =============================================================================

/// Sequencer state. Exactly one is active at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceState {
    Idle,
    Loading,
    Separating,
    Weighing,
    Imaging,
    Unloading,
    Fault,
}

impl DeviceState {
    /// The mechanical stages of one cycle, in order.
    pub const STAGES: [DeviceState; 5] = [
        DeviceState::Loading,
        DeviceState::Separating,
        DeviceState::Weighing,
        DeviceState::Imaging,
        DeviceState::Unloading,
    ];

    /// The in-order successor; `Unloading` wraps back to `Idle`.
    #[must_use]
    pub fn next_stage(self) -> Option<DeviceState> {
        match self {
            DeviceState::Idle => Some(DeviceState::Loading),
            DeviceState::Loading => Some(DeviceState::Separating),
            DeviceState::Separating => Some(DeviceState::Weighing),
            DeviceState::Weighing => Some(DeviceState::Imaging),
            DeviceState::Imaging => Some(DeviceState::Unloading),
            DeviceState::Unloading => Some(DeviceState::Idle),
            DeviceState::Fault => None,
        }
    }

    #[must_use]
    pub fn is_stage(self) -> bool {
        !matches!(self, DeviceState::Idle | DeviceState::Fault)
    }

    /// Legal edges: the in-order successor, `Fault` from any stage, and
    /// `Fault -> Idle` through reset.
    #[must_use]
    pub fn can_transition_to(self, to: DeviceState) -> bool {
        match (self, to) {
            (DeviceState::Fault, DeviceState::Idle) => true,
            (from, DeviceState::Fault) => from.is_stage(),
            (from, to) => from.next_stage() == Some(to),
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// =============================================================================
// Frames
// =============================================================================

/// Rectangular region of interest, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roi {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Roi {
    /// Clamp to a `width` x `height` frame. Returns `None` if nothing is left.
    #[must_use]
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<Roi> {
        if width == 0 || height == 0 {
            return None;
        }
        let x = self.x.min(width - 1);
        let y = self.y.min(height - 1);
        let w = self.width.min(width - x);
        let h = self.height.min(height - y);
        (w > 0 && h > 0).then_some(Roi {
            x,
            y,
            width: w,
            height: h,
        })
    }

    /// Copy the region out of an interleaved pixel buffer.
    #[must_use]
    pub fn crop(&self, width: u32, channels: u8, pixels: &[u8]) -> Bytes {
        let bpp = channels as usize;
        let stride = width as usize * bpp;
        let row_len = self.width as usize * bpp;
        let mut out = Vec::with_capacity(row_len * self.height as usize);
        for row in self.y..self.y + self.height {
            let start = row as usize * stride + self.x as usize * bpp;
            out.extend_from_slice(&pixels[start..start + row_len]);
        }
        Bytes::from(out)
    }
}

/// One published camera frame. Never mutated after publication.
#[derive(Debug, Clone)]
pub struct CameraFrame {
    pub camera: CameraId,
    /// Strictly increasing per camera, across reconnects.
    pub sequence: u64,
    pub captured_at: DateTime<Utc>,
    pub width: u32,
    pub height: u32,
    /// Interleaved 8-bit channels (1 = mono, 3 = RGB).
    pub channels: u8,
    pub pixels: Bytes,
}

impl CameraFrame {
    #[must_use]
    pub fn byte_len(&self) -> usize {
        self.pixels.len()
    }
}

/// Frames are shared read-only between the hub and its consumers.
pub type SharedFrame = Arc<CameraFrame>;

// =============================================================================
// Batches and records
// =============================================================================

/// Reference to the frame tagged for a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRef {
    pub camera: CameraId,
    pub sequence: u64,
    pub captured_at: DateTime<Utc>,
    /// Snapshot file, if one was written.
    pub path: Option<PathBuf>,
}

/// Image slot of one camera in a record; `image` is null if the camera was unavailable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraImage {
    pub camera: CameraId,
    pub image: Option<ImageRef>,
}

/// Entry time of each stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageTimestamps {
    pub loading: Option<DateTime<Utc>>,
    pub separating: Option<DateTime<Utc>>,
    pub weighing: Option<DateTime<Utc>>,
    pub imaging: Option<DateTime<Utc>>,
    pub unloading: Option<DateTime<Utc>>,
}

impl StageTimestamps {
    pub fn mark(&mut self, stage: DeviceState, at: DateTime<Utc>) {
        if let Some(slot) = self.slot_mut(stage) {
            *slot = Some(at);
        }
    }

    #[must_use]
    pub fn get(&self, stage: DeviceState) -> Option<DateTime<Utc>> {
        match stage {
            DeviceState::Loading => self.loading,
            DeviceState::Separating => self.separating,
            DeviceState::Weighing => self.weighing,
            DeviceState::Imaging => self.imaging,
            DeviceState::Unloading => self.unloading,
            DeviceState::Idle | DeviceState::Fault => None,
        }
    }

    fn slot_mut(&mut self, stage: DeviceState) -> Option<&mut Option<DateTime<Utc>>> {
        match stage {
            DeviceState::Loading => Some(&mut self.loading),
            DeviceState::Separating => Some(&mut self.separating),
            DeviceState::Weighing => Some(&mut self.weighing),
            DeviceState::Imaging => Some(&mut self.imaging),
            DeviceState::Unloading => Some(&mut self.unloading),
            DeviceState::Idle | DeviceState::Fault => None,
        }
    }
}

/// Final status of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordStatus {
    Completed,
    /// Operator abort.
    Aborted,
    Faulted,
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A batch in progress, owned by the sequencer.
#[derive(Debug, Clone)]
pub struct Batch {
    pub id: BatchId,
    pub created_at: DateTime<Utc>,
    pub state: DeviceState,
    pub weight_g: Option<f64>,
    pub images: BTreeMap<CameraId, Option<ImageRef>>,
    pub timestamps: StageTimestamps,
    pub warnings: Vec<String>,
    pub fault: Option<String>,
    pub aborted: bool,
}

impl Batch {
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: BatchId::new(),
            created_at: Utc::now(),
            state: DeviceState::Idle,
            weight_g: None,
            images: BTreeMap::new(),
            timestamps: StageTimestamps::default(),
            warnings: Vec::new(),
            fault: None,
            aborted: false,
        }
    }

    /// Freeze the accumulated results into a record.
    #[must_use]
    pub fn into_record(self, status: RecordStatus) -> MeasurementRecord {
        MeasurementRecord {
            batch_id: self.id,
            created_at: self.created_at,
            finished_at: Utc::now(),
            weight_g: self.weight_g,
            images: self
                .images
                .into_iter()
                .map(|(camera, image)| CameraImage { camera, image })
                .collect(),
            stage_timestamps: self.timestamps,
            status,
            warning: !self.warnings.is_empty(),
            warnings: self.warnings,
            fault_reason: self.fault,
        }
    }
}

impl Default for Batch {
    fn default() -> Self {
        Self::new()
    }
}

/// Persisted outcome of one batch. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementRecord {
    pub batch_id: BatchId,
    pub created_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Grams; absent if the batch faulted before weighing.
    pub weight_g: Option<f64>,
    pub images: Vec<CameraImage>,
    pub stage_timestamps: StageTimestamps,
    pub status: RecordStatus,
    pub warning: bool,
    #[serde(default)]
    pub warnings: Vec<String>,
    pub fault_reason: Option<String>,
}

impl MeasurementRecord {
    /// Image reference for `camera`, if that camera delivered one.
    #[must_use]
    pub fn image(&self, camera: CameraId) -> Option<&ImageRef> {
        self.images
            .iter()
            .find(|slot| slot.camera == camera)
            .and_then(|slot| slot.image.as_ref())
    }
}
