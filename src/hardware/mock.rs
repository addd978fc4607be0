//! Mock Hardware Implementations
//!
//! Simulated devices for running the full device core without hardware.
//! All mock devices use async-safe operations (tokio::time::sleep, not std::thread::sleep).
//!
//! # Available Mocks
//!
//! - `MockActuator` - conveyor/airflow with configurable move time and fault injection
//! - `MockScale` - scripted or oscillating weight readings
//! - `MockCamera` - free-running frame source with disconnect/reconnect control
//!
//! # Performance Characteristics
//!
//! - MockActuator: moves complete after `move_time` (default 20ms)
//! - MockScale: 10ms per reading
//! - MockCamera: 64x48 mono at 30fps unless configured otherwise

use crate::hardware::capabilities::{
    ActuatorPort, CameraPort, ConveyorMove, PortError, RawFrame, SensorPort,
};
use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{sleep, Duration};

// =============================================================================
// MockActuator
// =============================================================================

/// A command received by `MockActuator`.
#[derive(Debug, Clone, PartialEq)]
pub enum ActuatorCall {
    Conveyor(ConveyorMove),
    Airflow(u8),
}

/// Mock conveyor and airflow gate.
///
/// ```rust,ignore
/// let actuator = MockActuator::new();
/// actuator.fail_next_move("belt jammed").await;
/// assert!(actuator.move_conveyor(ConveyorMove::Distance(10.0)).await.is_err());
/// ```
pub struct MockActuator {
    move_time: RwLock<Duration>,
    calls: Mutex<Vec<ActuatorCall>>,
    fail_next: Mutex<Option<String>>,
    airflow: Arc<RwLock<u8>>,
}

impl MockActuator {
    pub fn new() -> Self {
        Self::with_move_time(Duration::from_millis(20))
    }

    /// Every conveyor move and gate change takes `move_time`.
    pub fn with_move_time(move_time: Duration) -> Self {
        Self {
            move_time: RwLock::new(move_time),
            calls: Mutex::new(Vec::new()),
            fail_next: Mutex::new(None),
            airflow: Arc::new(RwLock::new(0)),
        }
    }

    /// Change the move time, e.g. to force a stage timeout.
    pub async fn set_move_time(&self, move_time: Duration) {
        *self.move_time.write().await = move_time;
    }

    /// The next command fails with `PortError::Failed(reason)`.
    pub async fn fail_next_move(&self, reason: impl Into<String>) {
        *self.fail_next.lock().await = Some(reason.into());
    }

    pub async fn calls(&self) -> Vec<ActuatorCall> {
        self.calls.lock().await.clone()
    }

    pub async fn airflow_level(&self) -> u8 {
        *self.airflow.read().await
    }

    async fn execute(&self, call: ActuatorCall) -> Result<(), PortError> {
        self.calls.lock().await.push(call.clone());
        let move_time = *self.move_time.read().await;
        sleep(move_time).await;
        if let Some(reason) = self.fail_next.lock().await.take() {
            tracing::debug!(?call, %reason, "MockActuator: injected failure");
            return Err(PortError::Failed(reason));
        }
        if let ActuatorCall::Airflow(level) = call {
            *self.airflow.write().await = level;
        }
        tracing::trace!(?call, "MockActuator: completed");
        Ok(())
    }
}

impl Default for MockActuator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ActuatorPort for MockActuator {
    async fn move_conveyor(&self, movement: ConveyorMove) -> Result<(), PortError> {
        self.execute(ActuatorCall::Conveyor(movement)).await
    }

    async fn set_airflow_gate(&self, level: u8) -> Result<(), PortError> {
        if level > 100 {
            return Err(PortError::Failed(format!("airflow level {level} out of range")));
        }
        self.execute(ActuatorCall::Airflow(level)).await
    }
}

// =============================================================================
// MockScale
// =============================================================================

/// Behaviour once a scripted sequence runs out.
#[derive(Debug, Clone, Copy)]
enum ScaleTail {
    /// Keep returning the last scripted value.
    Hold,
    /// Alternate between `center - amplitude` and `center + amplitude`.
    Oscillate { center: f64, amplitude: f64 },
    /// Never answer within the read timeout.
    Silent,
}

/// Mock precision scale.
///
/// ```rust,ignore
/// let scale = MockScale::scripted([12.4, 12.4]);
/// assert_eq!(scale.read_weight(Duration::from_millis(100)).await?, 12.4);
/// ```
pub struct MockScale {
    script: Mutex<VecDeque<f64>>,
    last: Mutex<Option<f64>>,
    tail: ScaleTail,
    read_time: Duration,
    reads: AtomicU64,
    flip: AtomicBool,
}

impl MockScale {
    /// Return `readings` in order, then hold the last one.
    pub fn scripted(readings: impl IntoIterator<Item = f64>) -> Self {
        Self::build(readings.into_iter().collect(), ScaleTail::Hold)
    }

    /// A constant weight.
    pub fn steady(grams: f64) -> Self {
        Self::scripted([grams])
    }

    /// Readings that never settle within `amplitude * 2` grams.
    pub fn oscillating(center: f64, amplitude: f64) -> Self {
        Self::build(VecDeque::new(), ScaleTail::Oscillate { center, amplitude })
    }

    /// A scale that never answers.
    pub fn silent() -> Self {
        Self::build(VecDeque::new(), ScaleTail::Silent)
    }

    fn build(script: VecDeque<f64>, tail: ScaleTail) -> Self {
        Self {
            script: Mutex::new(script),
            last: Mutex::new(None),
            tail,
            read_time: Duration::from_millis(10),
            reads: AtomicU64::new(0),
            flip: AtomicBool::new(false),
        }
    }

    /// Number of completed reads.
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl SensorPort for MockScale {
    async fn read_weight(&self, timeout: Duration) -> Result<f64, PortError> {
        if let ScaleTail::Silent = self.tail {
            sleep(timeout).await;
            return Err(PortError::Timeout);
        }
        sleep(self.read_time.min(timeout)).await;

        let scripted = self.script.lock().await.pop_front();
        let value = match (scripted, self.tail) {
            (Some(value), _) => value,
            (None, ScaleTail::Oscillate { center, amplitude }) => {
                let high = self.flip.fetch_xor(true, Ordering::Relaxed);
                if high {
                    center + amplitude
                } else {
                    center - amplitude
                }
            }
            (None, _) => match *self.last.lock().await {
                Some(last) => last,
                None => return Err(PortError::Timeout),
            },
        };
        *self.last.lock().await = Some(value);
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(value)
    }
}

// =============================================================================
// MockCamera
// =============================================================================

/// Mock free-running camera
///
/// Produces frames with a random pixel pattern at a fixed interval. `disconnect()`
/// makes the next `next_frame` fail with `Disconnected`, and `open` keeps failing
/// until `reconnect()` is called.
pub struct MockCamera {
    width: u32,
    height: u32,
    channels: u8,
    frame_interval: Duration,
    connected: AtomicBool,
    open: AtomicBool,
    produced: AtomicU64,
}

impl MockCamera {
    /// Mono camera with the given resolution at 30fps.
    pub fn new(width: u32, height: u32) -> Self {
        Self::with_format(width, height, 1, Duration::from_millis(33))
    }

    pub fn with_format(width: u32, height: u32, channels: u8, frame_interval: Duration) -> Self {
        Self {
            width,
            height,
            channels,
            frame_interval,
            connected: AtomicBool::new(true),
            open: AtomicBool::new(false),
            produced: AtomicU64::new(0),
        }
    }

    /// Simulate unplugging the camera.
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Simulate plugging it back in.
    pub fn reconnect(&self) {
        self.connected.store(true, Ordering::SeqCst);
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Total frames delivered.
    pub fn frames_produced(&self) -> u64 {
        self.produced.load(Ordering::Relaxed)
    }

    fn render(&self) -> Bytes {
        let len = self.width as usize * self.height as usize * self.channels as usize;
        let mut pixels = vec![0u8; len];
        rand::thread_rng().fill(&mut pixels[..]);
        Bytes::from(pixels)
    }
}

impl Default for MockCamera {
    fn default() -> Self {
        Self::new(64, 48)
    }
}

#[async_trait]
impl CameraPort for MockCamera {
    async fn open(&self) -> Result<(), PortError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(PortError::Disconnected("no device".to_string()));
        }
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    async fn next_frame(&self, timeout: Duration) -> Result<RawFrame, PortError> {
        if !self.connected.load(Ordering::SeqCst) {
            self.open.store(false, Ordering::SeqCst);
            return Err(PortError::Disconnected("device removed".to_string()));
        }
        if !self.open.load(Ordering::SeqCst) {
            return Err(PortError::Failed("camera not open".to_string()));
        }
        if self.frame_interval > timeout {
            sleep(timeout).await;
            return Err(PortError::Timeout);
        }
        sleep(self.frame_interval).await;
        if !self.connected.load(Ordering::SeqCst) {
            self.open.store(false, Ordering::SeqCst);
            return Err(PortError::Disconnected("device removed".to_string()));
        }
        self.produced.fetch_add(1, Ordering::Relaxed);
        Ok(RawFrame {
            width: self.width,
            height: self.height,
            channels: self.channels,
            pixels: self.render(),
        })
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
