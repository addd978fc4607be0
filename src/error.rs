//! Custom error types for the device core.
//!
//! `SsrError` is the single error type returned by the library. Each variant of the
//! fault taxonomy maps to a distinct recovery policy:
//!
//! - **`StageTimeout`**, **`SensorTimeout`**, **`ActuatorFault`**: force the sequencer
//!   into `Fault`. They are surfaced to the operator and never retried automatically,
//!   since repeating a mechanical move without supervision can damage the sample.
//! - **`CameraDisconnected`**: degrades one camera stream. The cycle continues with a
//!   null image reference for that camera.
//! - **`RecordingWrite`**: aborts one recording session. Data written so far stays on
//!   disk and other sessions are unaffected.
//! - **`AlreadyRecording`**, **`AlreadyRunning`**: idempotent rejections with no side
//!   effect.
//! - **`InvalidTransition`**: a command that is not legal in the current state.
//!
//! The remaining variants cover the ambient layers (I/O, configuration, storage).

use crate::config::ConfigError;
use crate::core::{CameraId, DeviceState, SessionId};
use thiserror::Error;

/// Convenience alias for results using the library error type.
pub type AppResult<T> = std::result::Result<T, SsrError>;

#[derive(Error, Debug)]
pub enum SsrError {
    #[error("Stage {stage:?} timed out after {timeout_ms} ms")]
    StageTimeout { stage: DeviceState, timeout_ms: u64 },

    #[error("Scale did not produce a stable reading: {0}")]
    SensorTimeout(String),

    #[error("Actuator fault during {stage:?}: {reason}")]
    ActuatorFault { stage: DeviceState, reason: String },

    #[error("Camera {camera} disconnected: {reason}")]
    CameraDisconnected { camera: CameraId, reason: String },

    #[error("Camera {0} already has an active recording session")]
    AlreadyRecording(CameraId),

    #[error("A cycle is already running (state {0:?})")]
    AlreadyRunning(DeviceState),

    #[error("Recording write failed for camera {camera}: {reason}")]
    RecordingWrite { camera: CameraId, reason: String },

    #[error("Invalid transition from {from:?}: {reason}")]
    InvalidTransition { from: DeviceState, reason: String },

    #[error("Unknown camera {0}")]
    UnknownCamera(CameraId),

    #[error("Unknown recording session {0}")]
    UnknownSession(SessionId),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Sequencer control loop is not running")]
    ShutDown,

    #[error("Shutdown failed with errors")]
    ShutdownFailed(Vec<SsrError>),
}

impl SsrError {
    /// Errors that move the sequencer into `Fault` and require an explicit reset.
    #[must_use]
    pub fn is_fault(&self) -> bool {
        matches!(
            self,
            SsrError::StageTimeout { .. }
                | SsrError::SensorTimeout(_)
                | SsrError::ActuatorFault { .. }
                | SsrError::Storage(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SsrError::ActuatorFault {
            stage: DeviceState::Loading,
            reason: "conveyor jammed".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Actuator fault during Loading: conveyor jammed"
        );
    }

    #[test]
    fn test_fault_classification() {
        assert!(SsrError::SensorTimeout("unstable".into()).is_fault());
        assert!(SsrError::StageTimeout {
            stage: DeviceState::Imaging,
            timeout_ms: 500
        }
        .is_fault());
        assert!(!SsrError::AlreadyRecording(CameraId(1)).is_fault());
        assert!(!SsrError::CameraDisconnected {
            camera: CameraId(2),
            reason: "unplugged".into()
        }
        .is_fault());
    }

    #[test]
    fn test_shutdown_failed_error() {
        let err = SsrError::ShutdownFailed(vec![
            SsrError::RecordingWrite {
                camera: CameraId(1),
                reason: "disk full".into(),
            },
            SsrError::ShutDown,
        ]);
        assert!(err.to_string().contains("Shutdown failed"));
    }
}
