//! Imaging-stage snapshots as binary PNM (PGM for mono, PPM for RGB).

use crate::core::{BatchId, CameraFrame};
use crate::error::{AppResult, SsrError};
use std::path::{Path, PathBuf};
use tracing::debug;

/// File extension for a frame with `channels` interleaved channels.
pub fn pnm_extension(channels: u8) -> AppResult<&'static str> {
    match channels {
        1 => Ok("pgm"),
        3 => Ok("ppm"),
        other => Err(SsrError::InvalidParameter(format!(
            "cannot encode {other}-channel frame as PNM"
        ))),
    }
}

/// Encode `frame` as binary PNM (P5/P6, maxval 255).
pub fn encode_pnm(frame: &CameraFrame) -> AppResult<Vec<u8>> {
    let magic = match frame.channels {
        1 => "P5",
        3 => "P6",
        other => {
            return Err(SsrError::InvalidParameter(format!(
                "cannot encode {other}-channel frame as PNM"
            )))
        }
    };
    let header = format!("{magic}\n{} {}\n255\n", frame.width, frame.height);
    let mut out = Vec::with_capacity(header.len() + frame.pixels.len());
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(&frame.pixels);
    Ok(out)
}

/// Write `frame` to `path` as PNM.
pub async fn write_pnm(path: &Path, frame: &CameraFrame) -> AppResult<()> {
    let encoded = encode_pnm(frame)?;
    tokio::fs::write(path, encoded).await?;
    Ok(())
}

/// Saves the frames tagged for a batch.
#[derive(Debug, Clone)]
pub struct SnapshotWriter {
    dir: PathBuf,
}

impl SnapshotWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Save `frame` as `<batch>_cam<id>_<sequence>.<pgm|ppm>` and return its path.
    pub async fn save(&self, batch: BatchId, frame: &CameraFrame) -> AppResult<PathBuf> {
        let ext = pnm_extension(frame.channels)?;
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(format!(
            "{batch}_cam{}_{:06}.{ext}",
            frame.camera, frame.sequence
        ));
        write_pnm(&path, frame).await?;
        debug!(%batch, camera = %frame.camera, path = %path.display(), "Snapshot saved");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::CameraId;
    use bytes::Bytes;
    use chrono::Utc;

    fn frame(channels: u8) -> CameraFrame {
        CameraFrame {
            camera: CameraId(1),
            sequence: 42,
            captured_at: Utc::now(),
            width: 2,
            height: 1,
            channels,
            pixels: Bytes::from(vec![7u8; 2 * channels as usize]),
        }
    }

    #[test]
    fn test_pnm_header() {
        let encoded = encode_pnm(&frame(1)).unwrap();
        assert_eq!(&encoded[..11], b"P5\n2 1\n255\n");
        assert_eq!(&encoded[11..], &[7, 7]);

        let rgb = encode_pnm(&frame(3)).unwrap();
        assert!(rgb.starts_with(b"P6\n"));
        assert!(encode_pnm(&frame(4)).is_err());
    }

    #[tokio::test]
    async fn test_snapshot_saved_under_batch_name() {
        let dir = tempfile::tempdir().unwrap();
        let writer = SnapshotWriter::new(dir.path().join("snapshots"));
        let batch = BatchId::new();

        let path = writer.save(batch, &frame(3)).await.unwrap();
        assert!(path.exists());
        assert_eq!(
            path.file_name().unwrap().to_string_lossy(),
            format!("{batch}_cam1_000042.ppm")
        );
    }
}
