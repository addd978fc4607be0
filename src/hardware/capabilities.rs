//! Atomic Hardware Capabilities
//!
//! The core only ever talks to hardware through these traits. Concrete drivers
//! (serial MCU, serial scale, cameras) and the mocks used in tests implement
//! them; the sequencer and capture service stay protocol-agnostic.
//!
//! | Trait | Device | Used by |
//! |---|---|---|
//! | `ActuatorPort` | conveyor motor + airflow gate | sequencer stages |
//! | `SensorPort` | precision scale | weighing stage |
//! | `CameraPort` | one camera | capture loop |

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use thiserror::Error;

/// Outcome of a port call that did not complete.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PortError {
    #[error("timed out")]
    Timeout,
    #[error("disconnected: {0}")]
    Disconnected(String),
    #[error("failed: {0}")]
    Failed(String),
}

/// How far to run the conveyor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConveyorMove {
    /// Run for a fixed time.
    Duration(Duration),
    /// Travel a distance in millimetres.
    Distance(f64),
}

/// Conveyor and airflow gate.
#[async_trait]
pub trait ActuatorPort: Send + Sync {
    /// Returns once the move has completed.
    async fn move_conveyor(&self, movement: ConveyorMove) -> Result<(), PortError>;

    /// Set the airflow gate opening, 0-100 %.
    async fn set_airflow_gate(&self, level: u8) -> Result<(), PortError>;
}

/// Precision scale.
#[async_trait]
pub trait SensorPort: Send + Sync {
    /// One reading in grams.
    async fn read_weight(&self, timeout: Duration) -> Result<f64, PortError>;
}

/// Frame as delivered by a camera, before sequencing and ROI.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    pub channels: u8,
    pub pixels: Bytes,
}

impl RawFrame {
    /// Whether the buffer holds exactly `width * height * channels` bytes.
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        self.width > 0
            && self.height > 0
            && self.channels > 0
            && self.pixels.len() == self.width as usize * self.height as usize * self.channels as usize
    }
}

/// One camera.
#[async_trait]
pub trait CameraPort: Send + Sync {
    async fn open(&self) -> Result<(), PortError>;

    async fn close(&self);

    /// Next frame at the camera's native rate.
    ///
    /// `PortError::Timeout` means no frame arrived in time; `Disconnected` means
    /// the device is gone until the next successful `open`.
    async fn next_frame(&self, timeout: Duration) -> Result<RawFrame, PortError>;
}
