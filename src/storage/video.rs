//! Recording outputs.
//!
//! A recording session writes into one `FrameSink`. Two sinks are provided:
//!
//! - `ContainerWriter` ("video" mode): every frame appended to a single
//!   `.ssrv` container file.
//! - `FrameExtractWriter` ("frames" mode): one PNM image every N frames in a
//!   per-session directory.
//!
//! Either way the session's counters go into a JSON sidecar next to the output,
//! `<stem>.session.json`, where the stem is `cam<camera>_<session>`.
//!
//! # Container layout
//!
//! All integers little-endian.
//!
//! ```text
//! file header   "SSRV" | version u16 | camera u8 | reserved u8
//! frame header  sequence u64 | captured_at (unix micros) i64 | width u32 |
//!               height u32 | channels u8 | reserved [u8; 3] | len u32
//! frame body    len bytes of interleaved pixels
//! ```

use crate::config::RecordMode;
use crate::core::{CameraFrame, CameraId, SessionId};
use crate::error::{AppResult, SsrError};
use crate::storage::snapshot::{pnm_extension, write_pnm};
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info, warn};

pub const CONTAINER_MAGIC: &[u8; 4] = b"SSRV";
pub const CONTAINER_VERSION: u16 = 1;
const FILE_HEADER_LEN: usize = 8;
const FRAME_HEADER_LEN: usize = 32;

/// Destination of one recording session.
#[async_trait]
pub trait FrameSink: Send {
    async fn write_frame(&mut self, frame: &CameraFrame) -> AppResult<()>;

    /// Flush and close. Data written so far stays intact even after a failed write.
    async fn finish(&mut self) -> AppResult<()>;

    /// File or directory the frames go to.
    fn output_path(&self) -> &Path;
}

/// Creates the sink for a new session.
#[async_trait]
pub trait FrameSinkFactory: Send + Sync {
    async fn create(&self, camera: CameraId, session: SessionId) -> AppResult<Box<dyn FrameSink>>;

    /// Where the session metadata sidecar goes.
    fn sidecar_path(&self, camera: CameraId, session: SessionId) -> PathBuf;
}

fn session_stem(camera: CameraId, session: SessionId) -> String {
    format!("cam{camera}_{session}")
}

// ============================================================================
// Container ("video" mode)
// ============================================================================

/// Appends frames to a container file.
///
/// Each frame goes out as one write. If a write fails the writer refuses
/// further frames and `finish` cuts the file back to the last whole frame.
pub struct ContainerWriter {
    path: PathBuf,
    file: Option<BufWriter<tokio::fs::File>>,
    frames: u64,
    committed: u64,
    torn: bool,
}

impl ContainerWriter {
    pub async fn create(path: impl Into<PathBuf>, camera: CameraId) -> AppResult<Self> {
        let path = path.into();
        let file = tokio::fs::File::create(&path).await?;
        let mut file = BufWriter::new(file);

        let mut header = BytesMut::with_capacity(FILE_HEADER_LEN);
        header.put_slice(CONTAINER_MAGIC);
        header.put_u16_le(CONTAINER_VERSION);
        header.put_u8(camera.0);
        header.put_u8(0);
        file.write_all(&header).await?;

        debug!(path = %path.display(), "Container opened");
        Ok(Self {
            path,
            file: Some(file),
            frames: 0,
            committed: FILE_HEADER_LEN as u64,
            torn: false,
        })
    }

    #[must_use]
    pub fn frames_written(&self) -> u64 {
        self.frames
    }
}

#[async_trait]
impl FrameSink for ContainerWriter {
    async fn write_frame(&mut self, frame: &CameraFrame) -> AppResult<()> {
        if self.torn {
            return Err(SsrError::Storage(
                "container write failed earlier".to_string(),
            ));
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| SsrError::Storage("container already closed".to_string()))?;
        let len = u32::try_from(frame.pixels.len())
            .map_err(|_| SsrError::InvalidParameter("frame too large".to_string()))?;

        let mut record = BytesMut::with_capacity(FRAME_HEADER_LEN + frame.pixels.len());
        record.put_u64_le(frame.sequence);
        record.put_i64_le(frame.captured_at.timestamp_micros());
        record.put_u32_le(frame.width);
        record.put_u32_le(frame.height);
        record.put_u8(frame.channels);
        record.put_bytes(0, 3);
        record.put_u32_le(len);
        record.put_slice(&frame.pixels);

        if let Err(e) = file.write_all(&record).await {
            self.torn = true;
            return Err(e.into());
        }
        self.committed += record.len() as u64;
        self.frames += 1;
        Ok(())
    }

    async fn finish(&mut self) -> AppResult<()> {
        let Some(mut file) = self.file.take() else {
            return Ok(());
        };
        let flushed = file.flush().await;
        if self.torn || flushed.is_err() {
            // never extend: a failed flush can leave less than `committed` on disk
            let on_disk = file.get_ref().metadata().await?.len();
            let keep = self.committed.min(on_disk);
            file.get_mut().set_len(keep).await?;
            warn!(
                path = %self.path.display(),
                frames = self.frames,
                bytes = keep,
                "Container cut back to last whole frame"
            );
        }
        file.get_mut().sync_all().await?;
        flushed?;
        info!(path = %self.path.display(), frames = self.frames, "Container closed");
        Ok(())
    }

    fn output_path(&self) -> &Path {
        &self.path
    }
}

/// Parse a container produced by `ContainerWriter`.
///
/// A frame cut short at the end of the file is dropped with a warning; every
/// whole frame before it is returned.
pub fn decode_container(mut buf: Bytes) -> AppResult<(CameraId, Vec<CameraFrame>)> {
    let malformed = |what: &str| SsrError::Storage(format!("malformed container: {what}"));

    if buf.remaining() < FILE_HEADER_LEN || &buf[..4] != CONTAINER_MAGIC {
        return Err(malformed("bad header"));
    }
    buf.advance(4);
    let version = buf.get_u16_le();
    if version != CONTAINER_VERSION {
        return Err(malformed("unsupported version"));
    }
    let camera = CameraId(buf.get_u8());
    buf.advance(1);

    let mut frames = Vec::new();
    while buf.has_remaining() {
        if buf.remaining() < FRAME_HEADER_LEN {
            warn!(bytes = buf.remaining(), "Ignoring torn frame header at end of container");
            break;
        }
        let mut header = buf.slice(..FRAME_HEADER_LEN);
        let sequence = header.get_u64_le();
        let micros = header.get_i64_le();
        let width = header.get_u32_le();
        let height = header.get_u32_le();
        let channels = header.get_u8();
        header.advance(3);
        let len = header.get_u32_le() as usize;
        if buf.remaining() - FRAME_HEADER_LEN < len {
            warn!(sequence, bytes = buf.remaining(), "Ignoring torn frame body at end of container");
            break;
        }
        buf.advance(FRAME_HEADER_LEN);
        let captured_at: DateTime<Utc> = Utc
            .timestamp_micros(micros)
            .single()
            .ok_or_else(|| malformed("bad timestamp"))?;
        frames.push(CameraFrame {
            camera,
            sequence,
            captured_at,
            width,
            height,
            channels,
            pixels: buf.split_to(len),
        });
    }
    Ok((camera, frames))
}

/// Read and parse a container file.
pub async fn read_container(path: &Path) -> AppResult<(CameraId, Vec<CameraFrame>)> {
    let raw = tokio::fs::read(path).await?;
    decode_container(Bytes::from(raw))
}

// ============================================================================
// Frame extraction ("frames" mode)
// ============================================================================

/// Keeps one frame out of every `interval` as a PNM image.
pub struct FrameExtractWriter {
    dir: PathBuf,
    interval: u64,
    received: u64,
    images: u64,
}

impl FrameExtractWriter {
    pub async fn create(dir: impl Into<PathBuf>, interval: u64) -> AppResult<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            interval: interval.max(1),
            received: 0,
            images: 0,
        })
    }

    #[must_use]
    pub fn images_written(&self) -> u64 {
        self.images
    }
}

#[async_trait]
impl FrameSink for FrameExtractWriter {
    async fn write_frame(&mut self, frame: &CameraFrame) -> AppResult<()> {
        let index = self.received;
        self.received += 1;
        if index % self.interval != 0 {
            return Ok(());
        }
        let ext = pnm_extension(frame.channels)?;
        let path = self
            .dir
            .join(format!("frame_{:06}.{ext}", frame.sequence));
        write_pnm(&path, frame).await?;
        self.images += 1;
        Ok(())
    }

    async fn finish(&mut self) -> AppResult<()> {
        info!(
            dir = %self.dir.display(),
            frames = self.received,
            images = self.images,
            "Frame extraction closed"
        );
        Ok(())
    }

    fn output_path(&self) -> &Path {
        &self.dir
    }
}

// ============================================================================
// Factory and sidecar
// ============================================================================

/// Creates file-backed sinks under one output directory.
#[derive(Debug, Clone)]
pub struct FileSinkFactory {
    dir: PathBuf,
    mode: RecordMode,
    extract_interval: u64,
}

impl FileSinkFactory {
    pub fn new(dir: impl Into<PathBuf>, mode: RecordMode, extract_interval: u64) -> Self {
        Self {
            dir: dir.into(),
            mode,
            extract_interval,
        }
    }
}

#[async_trait]
impl FrameSinkFactory for FileSinkFactory {
    async fn create(&self, camera: CameraId, session: SessionId) -> AppResult<Box<dyn FrameSink>> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let stem = session_stem(camera, session);
        let sink: Box<dyn FrameSink> = match self.mode {
            RecordMode::Video => {
                let path = self.dir.join(format!("{stem}.ssrv"));
                Box::new(ContainerWriter::create(path, camera).await?)
            }
            RecordMode::Frames => {
                let dir = self.dir.join(&stem);
                Box::new(FrameExtractWriter::create(dir, self.extract_interval).await?)
            }
        };
        Ok(sink)
    }

    fn sidecar_path(&self, camera: CameraId, session: SessionId) -> PathBuf {
        self.dir
            .join(format!("{}.session.json", session_stem(camera, session)))
    }
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Completed,
    Aborted,
}

/// Session metadata written next to the recording output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub session_id: SessionId,
    pub camera: CameraId,
    pub started_at: DateTime<Utc>,
    pub stopped_at: DateTime<Utc>,
    pub output: PathBuf,
    pub frames_written: u64,
    pub frames_dropped: u64,
    pub status: SessionStatus,
    pub error: Option<String>,
}

pub async fn write_sidecar(path: &Path, metadata: &SessionMetadata) -> AppResult<()> {
    let json = serde_json::to_vec_pretty(metadata)
        .map_err(|e| SsrError::Storage(format!("session metadata: {e}")))?;
    tokio::fs::write(path, json).await?;
    Ok(())
}

pub async fn read_sidecar(path: &Path) -> AppResult<SessionMetadata> {
    let raw = tokio::fs::read(path).await?;
    serde_json::from_slice(&raw).map_err(|e| SsrError::Storage(format!("session metadata: {e}")))
}
