//! Camera pipeline: capture loops, per-camera broadcast hubs and their two
//! consumers, live preview and recording.

pub mod capture;
pub mod hub;
pub mod preview;
pub mod recording;

pub use capture::{CameraCaptureService, CameraEvent, CameraStatus};
pub use hub::{FrameBroadcastHub, FrameSubscription, FrameTap};
pub use preview::{PreviewConfig, PreviewFrame, PreviewManager};
pub use recording::{RecordingEvent, RecordingManager, RecordingStats, RecordingSummary};
