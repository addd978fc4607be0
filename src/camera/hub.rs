//! Per-camera frame fan-out.
//!
//! `FrameBroadcastHub` holds exactly one frame: the most recent one. It is a
//! `tokio::sync::watch` slot guarded by a short internal lock. Readers only hold
//! that lock long enough to clone the frame's `Arc`, so `publish` never waits on
//! a consumer's processing. A slow subscriber simply sees gaps in the sequence
//! numbers.
//!
//! Consumers that must see *every* frame (recording) attach a `FrameTap`
//! instead: a bounded queue that drops its oldest entry when full. Backpressure
//! is therefore scoped to the one tap that is behind.
//!
//! ```rust,ignore
//! let hub = FrameBroadcastHub::new(CameraId(1));
//! let mut preview = hub.subscribe();
//! let recorder = hub.add_tap(64);
//! hub.publish(frame);
//! let latest = preview.latest();
//! let queued = recorder.recv().await;
//! ```

use crate::core::{CameraId, SharedFrame};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::{watch, Notify};
use tokio_stream::wrappers::WatchStream;
use tokio_stream::{Stream, StreamExt};
use tracing::warn;

/// Single-writer, many-reader latest-frame slot for one camera.
pub struct FrameBroadcastHub {
    camera: CameraId,
    slot: watch::Sender<Option<SharedFrame>>,
    taps: RwLock<Vec<Arc<TapQueue>>>,
    published: AtomicU64,
    stale: AtomicU64,
}

impl std::fmt::Debug for FrameBroadcastHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameBroadcastHub")
            .field("camera", &self.camera)
            .field("published", &self.published_count())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl FrameBroadcastHub {
    #[must_use]
    pub fn new(camera: CameraId) -> Self {
        let (slot, _) = watch::channel(None);
        Self {
            camera,
            slot,
            taps: RwLock::new(Vec::new()),
            published: AtomicU64::new(0),
            stale: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn camera(&self) -> CameraId {
        self.camera
    }

    /// Replace the slot with `frame` and hand it to every tap.
    ///
    /// Never blocks on consumers. A frame whose sequence number is not newer than
    /// the current one is discarded so readers can never go backwards; the return
    /// value reports whether `frame` was published.
    pub fn publish(&self, frame: SharedFrame) -> bool {
        let accepted = self.slot.send_if_modified(|current| match current {
            Some(existing) if existing.sequence >= frame.sequence => false,
            _ => {
                *current = Some(Arc::clone(&frame));
                true
            }
        });
        if !accepted {
            self.stale.fetch_add(1, Ordering::Relaxed);
            warn!(
                camera = %self.camera,
                sequence = frame.sequence,
                "Discarding out-of-order frame"
            );
            return false;
        }
        self.published.fetch_add(1, Ordering::Relaxed);

        let taps = self.taps.read().unwrap_or_else(PoisonError::into_inner);
        for tap in taps.iter() {
            tap.push(Arc::clone(&frame));
        }
        true
    }

    /// Current frame, if any has been published.
    #[must_use]
    pub fn latest(&self) -> Option<SharedFrame> {
        self.slot.borrow().clone()
    }

    pub fn subscribe(&self) -> FrameSubscription {
        FrameSubscription {
            camera: self.camera,
            rx: self.slot.subscribe(),
        }
    }

    /// Attach a bounded queue that receives every frame published from now on.
    pub fn add_tap(&self, capacity: usize) -> FrameTap {
        let shared = Arc::new(TapQueue::new(capacity));
        self.taps
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(&shared));
        FrameTap { shared }
    }

    /// Stop feeding `tap`. Frames already queued stay available to `recv`.
    pub fn remove_tap(&self, tap: &FrameTap) {
        self.taps
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|existing| !Arc::ptr_eq(existing, &tap.shared));
    }

    #[must_use]
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Frames rejected for arriving out of order.
    #[must_use]
    pub fn stale_count(&self) -> u64 {
        self.stale.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.slot.receiver_count()
    }

    #[must_use]
    pub fn tap_count(&self) -> usize {
        self.taps.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Read handle on a hub slot. Dropping it unsubscribes.
#[derive(Debug, Clone)]
pub struct FrameSubscription {
    camera: CameraId,
    rx: watch::Receiver<Option<SharedFrame>>,
}

impl FrameSubscription {
    #[must_use]
    pub fn camera(&self) -> CameraId {
        self.camera
    }

    /// Latest frame, marking it as seen.
    pub fn latest(&mut self) -> Option<SharedFrame> {
        self.rx.borrow_and_update().clone()
    }

    /// Latest frame without marking it as seen.
    #[must_use]
    pub fn peek(&self) -> Option<SharedFrame> {
        self.rx.borrow().clone()
    }

    /// Whether a frame newer than the last one seen is available.
    #[must_use]
    pub fn has_new(&self) -> bool {
        self.rx.has_changed().unwrap_or(false)
    }

    /// Wait for a frame newer than the last one seen.
    ///
    /// Returns `None` once the hub is gone.
    pub async fn next(&mut self) -> Option<SharedFrame> {
        loop {
            self.rx.changed().await.ok()?;
            if let Some(frame) = self.rx.borrow_and_update().clone() {
                return Some(frame);
            }
        }
    }

    /// Stream of frames published after this call; intermediate frames may be skipped.
    pub fn into_stream(self) -> impl Stream<Item = SharedFrame> {
        WatchStream::from_changes(self.rx).filter_map(|frame| frame)
    }
}

struct TapQueue {
    capacity: usize,
    queue: Mutex<VecDeque<SharedFrame>>,
    notify: Notify,
    closed: AtomicBool,
    accepted: AtomicU64,
    dropped: AtomicU64,
}

impl TapQueue {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            accepted: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    fn push(&self, frame: SharedFrame) {
        {
            let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
            if queue.len() >= self.capacity {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(frame);
        }
        self.accepted.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_one();
    }
}

/// Bounded drop-oldest intake queue fed by a hub. Single consumer.
pub struct FrameTap {
    shared: Arc<TapQueue>,
}

impl FrameTap {
    /// Next queued frame. Returns `None` once the tap is closed and drained.
    pub async fn recv(&self) -> Option<SharedFrame> {
        loop {
            if let Some(frame) = self.try_recv() {
                return Some(frame);
            }
            if self.shared.closed.load(Ordering::Acquire) {
                return self.try_recv();
            }
            self.shared.notify.notified().await;
        }
    }

    pub fn try_recv(&self) -> Option<SharedFrame> {
        self.shared
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    /// Mark the end of intake; `recv` drains what is left, then returns `None`.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.notify.notify_one();
    }

    /// Frames handed to this tap, including ones later dropped.
    #[must_use]
    pub fn accepted(&self) -> u64 {
        self.shared.accepted.load(Ordering::Relaxed)
    }

    /// Frames evicted because the queue was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.shared
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::CameraFrame;
    use bytes::Bytes;
    use chrono::Utc;
    use std::time::Duration;
    use tracing_test::traced_test;

    fn frame(sequence: u64) -> SharedFrame {
        Arc::new(CameraFrame {
            camera: CameraId(1),
            sequence,
            captured_at: Utc::now(),
            width: 2,
            height: 2,
            channels: 1,
            pixels: Bytes::from_static(&[0, 1, 2, 3]),
        })
    }

    #[test]
    fn test_empty_hub_has_no_frame() {
        let hub = FrameBroadcastHub::new(CameraId(1));
        let mut sub = hub.subscribe();
        assert!(hub.latest().is_none());
        assert!(sub.latest().is_none());
        assert!(!sub.has_new());
    }

    #[test]
    fn test_slow_reader_sees_only_latest() {
        let hub = FrameBroadcastHub::new(CameraId(1));
        let mut sub = hub.subscribe();
        for seq in 1..=5 {
            assert!(hub.publish(frame(seq)));
        }
        assert!(sub.has_new());
        assert_eq!(sub.latest().unwrap().sequence, 5);
        assert!(!sub.has_new());
        assert_eq!(hub.published_count(), 5);
    }

    #[test]
    fn test_held_frame_does_not_block_publish() {
        let hub = FrameBroadcastHub::new(CameraId(1));
        let mut sub = hub.subscribe();
        hub.publish(frame(1));
        let held = sub.latest().unwrap();

        for seq in 2..=4 {
            assert!(hub.publish(frame(seq)));
        }
        assert_eq!(held.sequence, 1);
        assert_eq!(sub.latest().unwrap().sequence, 4);
    }

    #[test]
    #[traced_test]
    fn test_out_of_order_frame_rejected() {
        let hub = FrameBroadcastHub::new(CameraId(1));
        assert!(hub.publish(frame(7)));
        assert!(!hub.publish(frame(7)));
        assert!(!hub.publish(frame(3)));
        assert_eq!(hub.latest().unwrap().sequence, 7);
        assert_eq!(hub.stale_count(), 2);
        assert!(logs_contain("Discarding out-of-order frame"));
    }

    #[test]
    fn test_publish_without_subscribers() {
        let hub = FrameBroadcastHub::new(CameraId(1));
        assert!(hub.publish(frame(1)));
        assert_eq!(hub.latest().unwrap().sequence, 1);
    }

    #[tokio::test]
    async fn test_next_waits_for_newer_frame() {
        let hub = Arc::new(FrameBroadcastHub::new(CameraId(1)));
        hub.publish(frame(1));
        let mut sub = hub.subscribe();
        sub.latest();

        let publisher = Arc::clone(&hub);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            publisher.publish(frame(2));
        });

        let next = tokio::time::timeout(Duration::from_secs(1), sub.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.sequence, 2);
    }

    #[test]
    fn test_tap_drops_oldest_when_full() {
        let hub = FrameBroadcastHub::new(CameraId(1));
        let tap = hub.add_tap(3);
        for seq in 1..=5 {
            hub.publish(frame(seq));
        }
        assert_eq!(tap.accepted(), 5);
        assert_eq!(tap.dropped(), 2);
        let queued: Vec<u64> = std::iter::from_fn(|| tap.try_recv())
            .map(|f| f.sequence)
            .collect();
        assert_eq!(queued, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn test_closed_tap_drains_then_ends() {
        let hub = FrameBroadcastHub::new(CameraId(1));
        let tap = hub.add_tap(8);
        hub.publish(frame(1));
        hub.publish(frame(2));
        hub.remove_tap(&tap);
        hub.publish(frame(3));
        tap.close();

        assert_eq!(tap.recv().await.unwrap().sequence, 1);
        assert_eq!(tap.recv().await.unwrap().sequence, 2);
        assert!(tap.recv().await.is_none());
        assert_eq!(hub.tap_count(), 0);
    }

    #[tokio::test]
    async fn test_recv_wakes_on_publish() {
        let hub = Arc::new(FrameBroadcastHub::new(CameraId(1)));
        let tap = hub.add_tap(4);
        let publisher = Arc::clone(&hub);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            publisher.publish(frame(1));
        });
        let received = tokio::time::timeout(Duration::from_secs(1), tap.recv())
            .await
            .unwrap();
        assert_eq!(received.unwrap().sequence, 1);
    }

    #[tokio::test]
    async fn test_stream_yields_new_frames() {
        let hub = Arc::new(FrameBroadcastHub::new(CameraId(1)));
        let stream = hub.subscribe().into_stream();
        tokio::pin!(stream);
        hub.publish(frame(1));
        let first = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.sequence, 1);
    }
}
