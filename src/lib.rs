//! Core library for the SSR phenotyping device.
//!
//! This library contains the sequencing state machine that drives a rice batch
//! through loading, separation, weighing, imaging and unloading, and the
//! dual-camera capture pipeline that feeds live preview and recording from the
//! same frame stream. It is used by the `ssr_daq` binary and by any front end
//! that embeds a `DeviceContext`.

pub mod camera;
pub mod config;
pub mod context;
pub mod core;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod sequencer;
pub mod storage;

pub use context::{DeviceContext, DeviceContextBuilder};
pub use error::{AppResult, SsrError};
