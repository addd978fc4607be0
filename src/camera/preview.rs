//! Live preview.
//!
//! Each subscribed camera has its own slot holding a hub subscription, the
//! operator's settings and the single most recent scaled frame. Scaling happens
//! lazily, when the UI polls and a newer frame exists, so the preview costs
//! nothing between polls and drops every frame the UI did not ask for.
//!
//! A scale of 0% or a disabled slot does no work at all: `poll` returns without
//! touching the hub.

use crate::camera::hub::{FrameBroadcastHub, FrameSubscription};
use crate::config::PreviewConfig as PreviewDefaults;
use crate::core::{CameraFrame, CameraId};
use crate::error::{AppResult, SsrError};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

/// Per-camera preview settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreviewConfig {
    /// 0-100 %. 0 disables consumption.
    pub scale_percent: u8,
    pub enabled: bool,
}

impl PreviewConfig {
    /// Whether this configuration consumes frames at all.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.enabled && self.scale_percent > 0
    }
}

impl From<&PreviewDefaults> for PreviewConfig {
    fn from(defaults: &PreviewDefaults) -> Self {
        Self {
            scale_percent: defaults.default_scale_percent,
            enabled: defaults.enabled,
        }
    }
}

/// A downsampled frame ready for display.
#[derive(Debug, Clone)]
pub struct PreviewFrame {
    pub camera: CameraId,
    pub sequence: u64,
    pub captured_at: DateTime<Utc>,
    pub width: u32,
    pub height: u32,
    pub channels: u8,
    pub scale_percent: u8,
    pub pixels: Bytes,
}

/// Nearest-neighbour downsample of `frame` to `scale_percent` of its size.
///
/// A frame with no pixels, or fewer bytes than its shape claims, yields an
/// empty 0x0 preview.
#[must_use]
pub fn downsample(frame: &CameraFrame, scale_percent: u8) -> PreviewFrame {
    let expected = frame.width as usize * frame.height as usize * frame.channels as usize;
    if expected == 0 || frame.pixels.len() < expected {
        return PreviewFrame {
            camera: frame.camera,
            sequence: frame.sequence,
            captured_at: frame.captured_at,
            width: 0,
            height: 0,
            channels: frame.channels,
            scale_percent: scale_percent.min(100),
            pixels: Bytes::new(),
        };
    }

    let scale = u64::from(scale_percent.min(100));
    let width = ((u64::from(frame.width) * scale / 100) as u32).max(1);
    let height = ((u64::from(frame.height) * scale / 100) as u32).max(1);

    let pixels = if width == frame.width && height == frame.height {
        frame.pixels.clone()
    } else {
        let bpp = frame.channels as usize;
        let src_stride = frame.width as usize * bpp;
        let mut out = Vec::with_capacity(width as usize * height as usize * bpp);
        for y in 0..u64::from(height) {
            let src_y = (y * u64::from(frame.height) / u64::from(height)) as usize;
            let row = src_y * src_stride;
            for x in 0..u64::from(width) {
                let src_x = (x * u64::from(frame.width) / u64::from(width)) as usize;
                let start = row + src_x * bpp;
                out.extend_from_slice(&frame.pixels[start..start + bpp]);
            }
        }
        Bytes::from(out)
    };

    PreviewFrame {
        camera: frame.camera,
        sequence: frame.sequence,
        captured_at: frame.captured_at,
        width,
        height,
        channels: frame.channels,
        scale_percent: scale_percent.min(100),
        pixels,
    }
}

struct PreviewSlot {
    subscription: FrameSubscription,
    config: PreviewConfig,
    latest: Option<Arc<PreviewFrame>>,
    rendered: u64,
}

impl PreviewSlot {
    fn render_if_newer(&mut self, scaling_calls: &AtomicU64) {
        let stale = self.latest.is_none() || self.subscription.has_new();
        if !stale {
            return;
        }
        let Some(frame) = self.subscription.latest() else {
            return;
        };
        scaling_calls.fetch_add(1, Ordering::Relaxed);
        self.rendered += 1;
        self.latest = Some(Arc::new(downsample(&frame, self.config.scale_percent)));
    }
}

/// Preview surfaces for the UI, one independent slot per camera.
pub struct PreviewManager {
    hubs: BTreeMap<CameraId, Arc<FrameBroadcastHub>>,
    slots: BTreeMap<CameraId, Mutex<Option<PreviewSlot>>>,
    defaults: PreviewConfig,
    scaling_calls: AtomicU64,
}

impl PreviewManager {
    pub fn new(
        hubs: impl IntoIterator<Item = Arc<FrameBroadcastHub>>,
        defaults: &PreviewDefaults,
    ) -> Self {
        let hubs: BTreeMap<_, _> = hubs.into_iter().map(|hub| (hub.camera(), hub)).collect();
        let slots = hubs.keys().map(|id| (*id, Mutex::new(None))).collect();
        Self {
            hubs,
            slots,
            defaults: PreviewConfig::from(defaults),
            scaling_calls: AtomicU64::new(0),
        }
    }

    /// Start previewing `camera` with the default settings. Idempotent.
    pub fn subscribe(&self, camera: CameraId) -> AppResult<()> {
        let hub = self.hubs.get(&camera).ok_or(SsrError::UnknownCamera(camera))?;
        let mut slot = self.lock(camera)?;
        if slot.is_none() {
            *slot = Some(PreviewSlot {
                subscription: hub.subscribe(),
                config: self.defaults,
                latest: None,
                rendered: 0,
            });
            debug!(%camera, "Preview subscribed");
        }
        Ok(())
    }

    /// Stop previewing `camera` and release its hub subscription.
    pub fn unsubscribe(&self, camera: CameraId) -> AppResult<()> {
        if self.lock(camera)?.take().is_some() {
            debug!(%camera, "Preview unsubscribed");
        }
        Ok(())
    }

    #[must_use]
    pub fn is_subscribed(&self, camera: CameraId) -> bool {
        self.lock(camera).map(|slot| slot.is_some()).unwrap_or(false)
    }

    /// Change one camera's settings. Never touches the hub or recording.
    pub fn configure(&self, camera: CameraId, config: PreviewConfig) -> AppResult<()> {
        if config.scale_percent > 100 {
            return Err(SsrError::InvalidParameter(format!(
                "preview scale {}% exceeds 100%",
                config.scale_percent
            )));
        }
        let mut guard = self.lock(camera)?;
        let slot = guard
            .as_mut()
            .ok_or_else(|| SsrError::InvalidParameter(format!("camera {camera} has no preview")))?;
        slot.config = config;
        slot.latest = None;
        debug!(%camera, scale = config.scale_percent, enabled = config.enabled, "Preview configured");
        Ok(())
    }

    pub fn config(&self, camera: CameraId) -> AppResult<Option<PreviewConfig>> {
        Ok(self.lock(camera)?.as_ref().map(|slot| slot.config))
    }

    /// Latest scaled frame for display.
    ///
    /// Scales only if a newer frame was published since the last poll. Returns
    /// `None` if the camera is not subscribed, inactive, or has no frame yet.
    pub fn poll(&self, camera: CameraId) -> AppResult<Option<Arc<PreviewFrame>>> {
        let mut guard = self.lock(camera)?;
        let Some(slot) = guard.as_mut() else {
            return Ok(None);
        };
        if !slot.config.is_active() {
            return Ok(None);
        }
        slot.render_if_newer(&self.scaling_calls);
        Ok(slot.latest.clone())
    }

    /// Wait for a frame newer than the last poll, then return it scaled.
    pub async fn next(&self, camera: CameraId) -> AppResult<Option<Arc<PreviewFrame>>> {
        let mut subscription = {
            let guard = self.lock(camera)?;
            match guard.as_ref() {
                Some(slot) if slot.config.is_active() => slot.subscription.clone(),
                _ => return Ok(None),
            }
        };
        if !subscription.has_new() && subscription.next().await.is_none() {
            return Ok(None);
        }
        self.poll(camera)
    }

    /// Frames scaled for `camera` since it was subscribed.
    pub fn rendered_frames(&self, camera: CameraId) -> AppResult<u64> {
        Ok(self.lock(camera)?.as_ref().map_or(0, |slot| slot.rendered))
    }

    /// Scaling operations across all cameras.
    #[must_use]
    pub fn scaling_calls(&self) -> u64 {
        self.scaling_calls.load(Ordering::Relaxed)
    }

    fn lock(
        &self,
        camera: CameraId,
    ) -> AppResult<std::sync::MutexGuard<'_, Option<PreviewSlot>>> {
        let slot = self.slots.get(&camera).ok_or(SsrError::UnknownCamera(camera))?;
        Ok(slot.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(camera: CameraId, sequence: u64, width: u32, height: u32) -> Arc<CameraFrame> {
        let pixels: Vec<u8> = (0..width * height).map(|i| (i % 251) as u8).collect();
        Arc::new(CameraFrame {
            camera,
            sequence,
            captured_at: Utc::now(),
            width,
            height,
            channels: 1,
            pixels: Bytes::from(pixels),
        })
    }

    fn manager(camera: CameraId) -> (Arc<FrameBroadcastHub>, PreviewManager) {
        let hub = Arc::new(FrameBroadcastHub::new(camera));
        let preview = PreviewManager::new([Arc::clone(&hub)], &PreviewDefaults::default());
        (hub, preview)
    }

    #[test]
    fn test_downsample_nearest_neighbour() {
        let frame = gradient(CameraId(1), 1, 10, 10);
        let scaled = downsample(&frame, 20);
        assert_eq!((scaled.width, scaled.height), (2, 2));
        // rows 0 and 5, columns 0 and 5
        assert_eq!(&scaled.pixels[..], &[0, 5, 50, 55]);
    }

    #[test]
    fn test_downsample_full_scale_shares_buffer() {
        let frame = gradient(CameraId(1), 1, 4, 4);
        let scaled = downsample(&frame, 100);
        assert_eq!((scaled.width, scaled.height), (4, 4));
        assert_eq!(scaled.pixels, frame.pixels);
    }

    #[test]
    fn test_empty_or_short_frame_renders_empty_preview() {
        let empty = gradient(CameraId(1), 1, 0, 0);
        let scaled = downsample(&empty, 20);
        assert_eq!((scaled.width, scaled.height), (0, 0));
        assert!(scaled.pixels.is_empty());

        let short = CameraFrame {
            pixels: Bytes::from_static(&[1, 2, 3]),
            ..(*gradient(CameraId(1), 2, 4, 4)).clone()
        };
        assert_eq!(downsample(&short, 50).width, 0);

        let (hub, preview) = manager(CameraId(1));
        preview.subscribe(CameraId(1)).unwrap();
        hub.publish(empty);
        let frame = preview.poll(CameraId(1)).unwrap().unwrap();
        assert_eq!(frame.sequence, 1);
        assert!(frame.pixels.is_empty());
    }

    #[test]
    fn test_poll_scales_only_new_frames() {
        let (hub, preview) = manager(CameraId(1));
        preview.subscribe(CameraId(1)).unwrap();
        assert!(preview.poll(CameraId(1)).unwrap().is_none());

        hub.publish(gradient(CameraId(1), 1, 20, 10));
        hub.publish(gradient(CameraId(1), 2, 20, 10));
        let frame = preview.poll(CameraId(1)).unwrap().unwrap();
        assert_eq!(frame.sequence, 2);
        assert_eq!((frame.width, frame.height), (4, 2));

        preview.poll(CameraId(1)).unwrap();
        preview.poll(CameraId(1)).unwrap();
        assert_eq!(preview.rendered_frames(CameraId(1)).unwrap(), 1);
        assert_eq!(preview.scaling_calls(), 1);
    }

    #[test]
    fn test_zero_scale_does_no_work() {
        let (hub, preview) = manager(CameraId(1));
        preview.subscribe(CameraId(1)).unwrap();
        preview
            .configure(
                CameraId(1),
                PreviewConfig {
                    scale_percent: 0,
                    enabled: true,
                },
            )
            .unwrap();

        for seq in 1..=10 {
            hub.publish(gradient(CameraId(1), seq, 8, 8));
            assert!(preview.poll(CameraId(1)).unwrap().is_none());
        }
        assert_eq!(preview.scaling_calls(), 0);
    }

    #[test]
    fn test_rescale_after_configure() {
        let (hub, preview) = manager(CameraId(1));
        preview.subscribe(CameraId(1)).unwrap();
        hub.publish(gradient(CameraId(1), 1, 10, 10));
        assert_eq!(preview.poll(CameraId(1)).unwrap().unwrap().width, 2);

        preview
            .configure(
                CameraId(1),
                PreviewConfig {
                    scale_percent: 50,
                    enabled: true,
                },
            )
            .unwrap();
        let frame = preview.poll(CameraId(1)).unwrap().unwrap();
        assert_eq!((frame.width, frame.scale_percent), (5, 50));
    }

    #[test]
    fn test_configure_rejects_out_of_range() {
        let (_hub, preview) = manager(CameraId(1));
        preview.subscribe(CameraId(1)).unwrap();
        let result = preview.configure(
            CameraId(1),
            PreviewConfig {
                scale_percent: 120,
                enabled: true,
            },
        );
        assert!(matches!(result, Err(SsrError::InvalidParameter(_))));
    }

    #[test]
    fn test_unsubscribe_releases_hub_receiver() {
        let (hub, preview) = manager(CameraId(1));
        preview.subscribe(CameraId(1)).unwrap();
        assert_eq!(hub.subscriber_count(), 1);
        preview.unsubscribe(CameraId(1)).unwrap();
        assert_eq!(hub.subscriber_count(), 0);
        assert!(!preview.is_subscribed(CameraId(1)));
        assert!(matches!(
            preview.subscribe(CameraId(3)),
            Err(SsrError::UnknownCamera(CameraId(3)))
        ));
    }

    #[tokio::test]
    async fn test_next_waits_for_publish() {
        let (hub, preview) = manager(CameraId(2));
        preview.subscribe(CameraId(2)).unwrap();
        let publisher = Arc::clone(&hub);
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            publisher.publish(gradient(CameraId(2), 1, 10, 10));
        });
        let frame = preview.next(CameraId(2)).await.unwrap().unwrap();
        assert_eq!(frame.sequence, 1);
    }
}
