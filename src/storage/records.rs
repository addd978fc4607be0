//! Measurement record stores.
//!
//! Records are append-only: a batch id can be written once and is never
//! rewritten. `JsonLinesRecordStore` is the default on-disk format, one JSON
//! object per line. `CsvRecordStore` (feature `storage_csv`) writes a flat table
//! for spreadsheets. `MemoryRecordStore` backs tests and simulated runs.

use crate::config::{RecordFormat, Settings};
use crate::core::{BatchId, MeasurementRecord};
use crate::error::{AppResult, SsrError};
use async_trait::async_trait;
use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// Persists finished records.
#[async_trait]
pub trait SampleRecordStore: Send + Sync {
    /// Append one record. Fails if a record for the same batch already exists.
    async fn append(&self, record: &MeasurementRecord) -> AppResult<()>;

    async fn load_all(&self) -> AppResult<Vec<MeasurementRecord>>;
}

/// Open the store selected by `settings.storage`.
pub async fn open_store(settings: &Settings) -> AppResult<Arc<dyn SampleRecordStore>> {
    let path = settings.records_path();
    let store: Arc<dyn SampleRecordStore> = match settings.storage.format {
        RecordFormat::Jsonl => Arc::new(JsonLinesRecordStore::open(path).await?),
        RecordFormat::Csv => Arc::new(CsvRecordStore::open(path).await?),
    };
    Ok(store)
}

fn duplicate(batch: BatchId) -> SsrError {
    SsrError::Storage(format!("record for batch {batch} already written"))
}

fn ensure_parent(path: &Path) -> AppResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

// ============================================================================
// JSON lines
// ============================================================================

pub struct JsonLinesRecordStore {
    path: PathBuf,
    written: Mutex<HashSet<BatchId>>,
}

impl JsonLinesRecordStore {
    /// Open (or create on first append) the file at `path`.
    pub async fn open(path: impl Into<PathBuf>) -> AppResult<Self> {
        let path = path.into();
        let existing = read_json_lines(&path)?;
        let written = existing.iter().map(|r| r.batch_id).collect();
        info!(path = %path.display(), records = existing.len(), "JSON lines record store opened");
        Ok(Self {
            path,
            written: Mutex::new(written),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn read_json_lines(path: &Path) -> AppResult<Vec<MeasurementRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(path)?;
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .enumerate()
        .map(|(i, line)| {
            serde_json::from_str(line)
                .map_err(|e| SsrError::Storage(format!("{}:{}: {e}", path.display(), i + 1)))
        })
        .collect()
}

#[async_trait]
impl SampleRecordStore for JsonLinesRecordStore {
    async fn append(&self, record: &MeasurementRecord) -> AppResult<()> {
        let mut written = self.written.lock().await;
        if written.contains(&record.batch_id) {
            return Err(duplicate(record.batch_id));
        }

        let mut line = serde_json::to_string(record)
            .map_err(|e| SsrError::Storage(format!("serialize record: {e}")))?;
        line.push('\n');

        ensure_parent(&self.path)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.sync_data()?;

        written.insert(record.batch_id);
        Ok(())
    }

    async fn load_all(&self) -> AppResult<Vec<MeasurementRecord>> {
        let _guard = self.written.lock().await;
        read_json_lines(&self.path)
    }
}

// ============================================================================
// CSV
// ============================================================================

#[cfg(feature = "storage_csv")]
mod csv_enabled {
    use super::*;
    use crate::core::{CameraImage, RecordStatus, StageTimestamps};
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Serialize};

    /// Flat row; nested fields are JSON-encoded.
    #[derive(Debug, Serialize, Deserialize)]
    struct CsvRow {
        batch_id: BatchId,
        created_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        weight_g: Option<f64>,
        status: RecordStatus,
        warning: bool,
        fault_reason: Option<String>,
        loading_at: Option<DateTime<Utc>>,
        separating_at: Option<DateTime<Utc>>,
        weighing_at: Option<DateTime<Utc>>,
        imaging_at: Option<DateTime<Utc>>,
        unloading_at: Option<DateTime<Utc>>,
        images: String,
        warnings: String,
    }

    impl CsvRow {
        fn from_record(record: &MeasurementRecord) -> AppResult<Self> {
            let encode = |e: serde_json::Error| SsrError::Storage(format!("encode record: {e}"));
            Ok(Self {
                batch_id: record.batch_id,
                created_at: record.created_at,
                finished_at: record.finished_at,
                weight_g: record.weight_g,
                status: record.status,
                warning: record.warning,
                fault_reason: record.fault_reason.clone(),
                loading_at: record.stage_timestamps.loading,
                separating_at: record.stage_timestamps.separating,
                weighing_at: record.stage_timestamps.weighing,
                imaging_at: record.stage_timestamps.imaging,
                unloading_at: record.stage_timestamps.unloading,
                images: serde_json::to_string(&record.images).map_err(encode)?,
                warnings: serde_json::to_string(&record.warnings).map_err(encode)?,
            })
        }

        fn into_record(self) -> AppResult<MeasurementRecord> {
            let decode = |e: serde_json::Error| SsrError::Storage(format!("decode record: {e}"));
            let images: Vec<CameraImage> = serde_json::from_str(&self.images).map_err(decode)?;
            let warnings: Vec<String> = serde_json::from_str(&self.warnings).map_err(decode)?;
            Ok(MeasurementRecord {
                batch_id: self.batch_id,
                created_at: self.created_at,
                finished_at: self.finished_at,
                weight_g: self.weight_g,
                images,
                stage_timestamps: StageTimestamps {
                    loading: self.loading_at,
                    separating: self.separating_at,
                    weighing: self.weighing_at,
                    imaging: self.imaging_at,
                    unloading: self.unloading_at,
                },
                status: self.status,
                warning: self.warning,
                warnings,
                fault_reason: self.fault_reason,
            })
        }
    }

    fn read_rows(path: &Path) -> AppResult<Vec<MeasurementRecord>> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut reader = csv::Reader::from_path(path)
            .map_err(|e| SsrError::Storage(format!("open {}: {e}", path.display())))?;
        reader
            .deserialize::<CsvRow>()
            .map(|row| {
                row.map_err(|e| SsrError::Storage(format!("{}: {e}", path.display())))
                    .and_then(CsvRow::into_record)
            })
            .collect()
    }

    pub struct CsvRecordStore {
        path: PathBuf,
        written: Mutex<HashSet<BatchId>>,
    }

    impl CsvRecordStore {
        pub async fn open(path: impl Into<PathBuf>) -> AppResult<Self> {
            let path = path.into();
            let existing = read_rows(&path)?;
            let written = existing.iter().map(|r| r.batch_id).collect();
            info!(path = %path.display(), records = existing.len(), "CSV record store opened");
            Ok(Self {
                path,
                written: Mutex::new(written),
            })
        }
    }

    #[async_trait]
    impl SampleRecordStore for CsvRecordStore {
        async fn append(&self, record: &MeasurementRecord) -> AppResult<()> {
            let mut written = self.written.lock().await;
            if written.contains(&record.batch_id) {
                return Err(duplicate(record.batch_id));
            }
            let row = CsvRow::from_record(record)?;

            ensure_parent(&self.path)?;
            let needs_header = std::fs::metadata(&self.path).map_or(true, |m| m.len() == 0);
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            let mut writer = csv::WriterBuilder::new()
                .has_headers(needs_header)
                .from_writer(file);
            writer
                .serialize(&row)
                .map_err(|e| SsrError::Storage(format!("write CSV row: {e}")))?;
            writer.flush()?;

            written.insert(record.batch_id);
            Ok(())
        }

        async fn load_all(&self) -> AppResult<Vec<MeasurementRecord>> {
            let _guard = self.written.lock().await;
            read_rows(&self.path)
        }
    }
}

#[cfg(not(feature = "storage_csv"))]
mod csv_disabled {
    use super::*;

    pub struct CsvRecordStore;

    impl CsvRecordStore {
        pub async fn open(_path: impl Into<PathBuf>) -> AppResult<Self> {
            Err(SsrError::Storage(
                "CSV records require the 'storage_csv' feature".to_string(),
            ))
        }
    }

    #[async_trait]
    impl SampleRecordStore for CsvRecordStore {
        async fn append(&self, _record: &MeasurementRecord) -> AppResult<()> {
            Err(SsrError::Storage("storage_csv feature not enabled".to_string()))
        }

        async fn load_all(&self) -> AppResult<Vec<MeasurementRecord>> {
            Err(SsrError::Storage("storage_csv feature not enabled".to_string()))
        }
    }
}

#[cfg(feature = "storage_csv")]
pub use csv_enabled::CsvRecordStore;

#[cfg(not(feature = "storage_csv"))]
pub use csv_disabled::CsvRecordStore;

// ============================================================================
// In-memory
// ============================================================================

/// Keeps records in memory. Can be told to fail the next append.
#[derive(Default)]
pub struct MemoryRecordStore {
    records: Mutex<Vec<MeasurementRecord>>,
    fail_next: Mutex<Option<String>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<MeasurementRecord> {
        self.records.lock().await.clone()
    }

    pub async fn fail_next_append(&self, reason: impl Into<String>) {
        *self.fail_next.lock().await = Some(reason.into());
    }
}

#[async_trait]
impl SampleRecordStore for MemoryRecordStore {
    async fn append(&self, record: &MeasurementRecord) -> AppResult<()> {
        if let Some(reason) = self.fail_next.lock().await.take() {
            return Err(SsrError::Storage(reason));
        }
        let mut records = self.records.lock().await;
        if records.iter().any(|r| r.batch_id == record.batch_id) {
            return Err(duplicate(record.batch_id));
        }
        records.push(record.clone());
        Ok(())
    }

    async fn load_all(&self) -> AppResult<Vec<MeasurementRecord>> {
        Ok(self.records().await)
    }
}
