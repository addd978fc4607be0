//! Configuration System using Figment
//!
//! Configuration is layered, later sources overriding earlier ones:
//! 1. Built-in defaults (`Settings::default()`)
//! 2. A TOML file (e.g. `config/ssr.toml`), if present
//! 3. Environment variables prefixed with `SSR_`, nested with `__`
//!
//! # Environment Variable Overrides
//!
//! ```text
//! SSR_APPLICATION__LOG_LEVEL=debug
//! SSR_SEQUENCER__WEIGHING__TOLERANCE_G=0.05
//! SSR_RECORDING__QUEUE_CAPACITY=128
//! ```
//!
//! Durations use humantime notation (`"2s"`, `"300ms"`).
//!
//! Stability tolerance and stage timeouts are device calibration values; they
//! live here and are passed into the sequencer rather than fixed in code.
//!
//! # Example
//!
//! ```no_run
//! use ssr_daq::config::Settings;
//!
//! let settings = Settings::load(Some("config/ssr.toml".as_ref()))?;
//! println!("Weighing timeout: {:?}", settings.sequencer.timeouts.weighing);
//! # Ok::<(), ssr_daq::config::ConfigError>(())
//! ```

use crate::core::{CameraId, Roi};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    LoadError(#[from] Box<figment::Error>),
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        ConfigError::LoadError(Box::new(err))
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub application: ApplicationConfig,
    pub sequencer: SequencerConfig,
    pub cameras: Vec<CameraConfig>,
    pub recording: RecordingConfig,
    pub preview: PreviewConfig,
    pub storage: StorageConfig,
    pub hardware: HardwareConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    pub log_format: LogFormat,
    /// Root for recordings, snapshots and records unless overridden.
    pub data_dir: PathBuf,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "SSR phenotyping device".to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            data_dir: default_data_dir(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Sequencer timing and stage parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SequencerConfig {
    pub timeouts: StageTimeouts,
    /// Capacity of the control loop's event queue.
    pub event_channel_capacity: usize,
    pub conveyor: ConveyorConfig,
    pub separation: SeparationConfig,
    pub weighing: WeighingConfig,
    pub imaging: ImagingConfig,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            timeouts: StageTimeouts::default(),
            event_channel_capacity: 64,
            conveyor: ConveyorConfig::default(),
            separation: SeparationConfig::default(),
            weighing: WeighingConfig::default(),
            imaging: ImagingConfig::default(),
        }
    }
}

/// Bounded wait per stage. Expiry is a Fault transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StageTimeouts {
    #[serde(with = "humantime_serde")]
    pub loading: Duration,
    #[serde(with = "humantime_serde")]
    pub separating: Duration,
    #[serde(with = "humantime_serde")]
    pub weighing: Duration,
    #[serde(with = "humantime_serde")]
    pub imaging: Duration,
    #[serde(with = "humantime_serde")]
    pub unloading: Duration,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            loading: Duration::from_secs(10),
            separating: Duration::from_secs(10),
            weighing: Duration::from_secs(2),
            imaging: Duration::from_secs(3),
            unloading: Duration::from_secs(10),
        }
    }
}

impl StageTimeouts {
    /// Timeout for a stage; `None` for `Idle`/`Fault`.
    #[must_use]
    pub fn for_stage(&self, stage: crate::core::DeviceState) -> Option<Duration> {
        use crate::core::DeviceState;
        match stage {
            DeviceState::Loading => Some(self.loading),
            DeviceState::Separating => Some(self.separating),
            DeviceState::Weighing => Some(self.weighing),
            DeviceState::Imaging => Some(self.imaging),
            DeviceState::Unloading => Some(self.unloading),
            DeviceState::Idle | DeviceState::Fault => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConveyorConfig {
    #[serde(with = "humantime_serde")]
    pub load_duration: Duration,
    #[serde(with = "humantime_serde")]
    pub unload_duration: Duration,
}

impl Default for ConveyorConfig {
    fn default() -> Self {
        Self {
            load_duration: Duration::from_secs(3),
            unload_duration: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SeparationConfig {
    /// Airflow gate opening during separation, percent.
    pub airflow_level: u8,
    #[serde(with = "humantime_serde")]
    pub dwell: Duration,
}

impl Default for SeparationConfig {
    fn default() -> Self {
        Self {
            airflow_level: 60,
            dwell: Duration::from_secs(4),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WeighingConfig {
    /// Two consecutive samples within this many grams count as stable.
    pub tolerance_g: f64,
    #[serde(with = "humantime_serde")]
    pub sample_interval: Duration,
    /// Timeout handed to each individual scale read.
    #[serde(with = "humantime_serde")]
    pub sample_timeout: Duration,
}

impl Default for WeighingConfig {
    fn default() -> Self {
        Self {
            tolerance_g: 0.02,
            sample_interval: Duration::from_millis(100),
            sample_timeout: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImagingConfig {
    /// How long to wait for the next frame of one camera before giving up on it.
    #[serde(with = "humantime_serde")]
    pub frame_timeout: Duration,
    pub save_snapshots: bool,
}

impl Default for ImagingConfig {
    fn default() -> Self {
        Self {
            frame_timeout: Duration::from_secs(1),
            save_snapshots: true,
        }
    }
}

/// One camera definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    pub id: CameraId,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub roi: Option<Roi>,
    #[serde(default = "default_frame_timeout", with = "humantime_serde")]
    pub frame_timeout: Duration,
    #[serde(default = "default_reconnect_interval", with = "humantime_serde")]
    pub reconnect_interval: Duration,
}

impl CameraConfig {
    #[must_use]
    pub fn new(id: CameraId) -> Self {
        Self {
            id,
            label: None,
            roi: None,
            frame_timeout: default_frame_timeout(),
            reconnect_interval: default_reconnect_interval(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordMode {
    /// One frame-stream container per session.
    Video,
    /// One still image every `extract_interval` frames.
    Frames,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    pub output_dir: Option<PathBuf>,
    /// Intake queue depth per session; the oldest frame is dropped when full.
    pub queue_capacity: usize,
    pub mode: RecordMode,
    pub extract_interval: u64,
    /// A weighing sample below this many grams stops every active recording.
    pub auto_stop_below_g: Option<f64>,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            output_dir: None,
            queue_capacity: 64,
            mode: RecordMode::Video,
            extract_interval: 150,
            auto_stop_below_g: Some(-150.0),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreviewConfig {
    pub default_scale_percent: u8,
    pub enabled: bool,
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            default_scale_percent: 20,
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordFormat {
    Jsonl,
    Csv,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub records_path: Option<PathBuf>,
    pub format: RecordFormat,
    pub snapshot_dir: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            records_path: None,
            format: RecordFormat::Jsonl,
            snapshot_dir: None,
        }
    }
}

/// Serial settings for the real device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    pub mcu_port: String,
    pub mcu_baud_rate: u32,
    pub scale_port: String,
    pub scale_baud_rate: u32,
    /// Sent before each weight read, if set.
    pub scale_request: Option<String>,
    /// Conveyor motor duty while moving, percent.
    pub conveyor_speed_percent: u8,
    /// Conveyor travel per second at that duty, for distance moves.
    pub conveyor_mm_per_sec: f64,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            mcu_port: "/dev/ttyUSB0".to_string(),
            mcu_baud_rate: 115_200,
            scale_port: "/dev/ttyUSB1".to_string(),
            scale_baud_rate: 9600,
            scale_request: None,
            conveyor_speed_percent: 50,
            conveyor_mm_per_sec: 40.0,
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ssr_daq")
}

fn default_frame_timeout() -> Duration {
    Duration::from_millis(500)
}

fn default_reconnect_interval() -> Duration {
    Duration::from_secs(1)
}

impl Settings {
    /// Load defaults, then `path` (if it exists), then `SSR_` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment =
            Figment::from(Serialized::defaults(Settings::default().with_dual_cameras()));
        if let Some(path) = path {
            if path.exists() {
                figment = figment.merge(Toml::file(path));
            }
        }
        let settings: Settings = figment.merge(Env::prefixed("SSR_").split("__")).extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Two cameras (1 and 2), the device's standard layout.
    #[must_use]
    pub fn with_dual_cameras(mut self) -> Self {
        self.cameras = vec![CameraConfig::new(CameraId(1)), CameraConfig::new(CameraId(2))];
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = &self.sequencer.timeouts;
        for (name, value) in [
            ("loading", t.loading),
            ("separating", t.separating),
            ("weighing", t.weighing),
            ("imaging", t.imaging),
            ("unloading", t.unloading),
        ] {
            if value.is_zero() {
                return Err(ConfigError::ValidationError(format!(
                    "sequencer.timeouts.{name} must be non-zero"
                )));
            }
        }
        if self.sequencer.imaging.frame_timeout >= t.imaging {
            return Err(ConfigError::ValidationError(format!(
                "sequencer.imaging.frame_timeout ({:?}) must be shorter than sequencer.timeouts.imaging ({:?})",
                self.sequencer.imaging.frame_timeout, t.imaging
            )));
        }
        let tolerance = self.sequencer.weighing.tolerance_g;
        if tolerance.is_nan() || tolerance < 0.0 {
            return Err(ConfigError::ValidationError(
                "sequencer.weighing.tolerance_g must be >= 0".to_string(),
            ));
        }
        if self.sequencer.separation.airflow_level > 100 {
            return Err(ConfigError::ValidationError(
                "sequencer.separation.airflow_level must be within 0-100".to_string(),
            ));
        }
        if self.sequencer.event_channel_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "sequencer.event_channel_capacity must be > 0".to_string(),
            ));
        }
        if self.preview.default_scale_percent > 100 {
            return Err(ConfigError::ValidationError(
                "preview.default_scale_percent must be within 0-100".to_string(),
            ));
        }
        if self.recording.queue_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "recording.queue_capacity must be > 0".to_string(),
            ));
        }
        if self.recording.extract_interval == 0 {
            return Err(ConfigError::ValidationError(
                "recording.extract_interval must be > 0".to_string(),
            ));
        }
        if self.recording.auto_stop_below_g.is_some_and(f64::is_nan) {
            return Err(ConfigError::ValidationError(
                "recording.auto_stop_below_g must be a number".to_string(),
            ));
        }
        if self.hardware.conveyor_speed_percent > 100 {
            return Err(ConfigError::ValidationError(
                "hardware.conveyor_speed_percent must be within 0-100".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for camera in &self.cameras {
            if !seen.insert(camera.id) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate camera id {}",
                    camera.id
                )));
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn recording_dir(&self) -> PathBuf {
        self.recording
            .output_dir
            .clone()
            .unwrap_or_else(|| self.application.data_dir.join("recordings"))
    }

    #[must_use]
    pub fn snapshot_dir(&self) -> PathBuf {
        self.storage
            .snapshot_dir
            .clone()
            .unwrap_or_else(|| self.application.data_dir.join("images"))
    }

    #[must_use]
    pub fn records_path(&self) -> PathBuf {
        self.storage.records_path.clone().unwrap_or_else(|| {
            let file = match self.storage.format {
                RecordFormat::Jsonl => "records.jsonl",
                RecordFormat::Csv => "records.csv",
            };
            self.application.data_dir.join(file)
        })
    }
}
