//! Hardware capabilities and drivers.
//!
//! The device core depends only on `capabilities`. `mcu` and `scale` speak the
//! real device's serial protocols; `mock` backs tests and the simulated CLI.

pub mod capabilities;
pub mod mcu;
pub mod mock;
pub mod scale;

pub use capabilities::{ActuatorPort, CameraPort, ConveyorMove, PortError, RawFrame, SensorPort};
