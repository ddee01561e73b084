//! Single-producer, latest-only frame fan-out.
//!
//! One OS thread owns the camera: it reads, encodes and publishes each frame
//! into a `watch` slot. Viewers clone the `Arc<Frame>` out of the slot and
//! never hold the lock while writing to the network, so a slow viewer can
//! neither stall the camera nor delay other viewers. A frame nobody read in
//! time is simply replaced by the next one.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use frame_feed_common::config::Config;
use frame_feed_common::frame::{now_ms, Frame};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::camera::{CameraSource, RawFrame};
use crate::encoder::FrameEncoder;
use crate::session::ClientSession;

/// Smoothing factor for the measured frame rate.
const FPS_ALPHA: f64 = 0.1;

/// Why a feed stopped for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The device could not be opened or kept failing.
    CameraUnavailable,
    /// Stop was requested.
    Shutdown,
}

/// Contents of the shared slot.
#[derive(Debug, Clone)]
pub enum FeedState {
    /// No frame published yet.
    Starting,
    Live(Arc<Frame>),
    /// Terminal.
    Closed(CloseReason),
}

impl FeedState {
    /// Sequence number of the current frame, 0 if there is none.
    pub fn sequence(&self) -> u64 {
        match self {
            FeedState::Live(frame) => frame.seq,
            _ => 0,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, FeedState::Closed(_))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("feed is closed ({0:?})")]
pub struct FeedClosed(pub CloseReason);

#[derive(Debug, Clone)]
pub struct BroadcastSettings {
    /// Consecutive failed reads before the camera is declared unavailable.
    pub max_consecutive_capture_errors: u32,
    /// Longest a waiting viewer sleeps before re-checking for shutdown.
    pub wake_interval: Duration,
    /// Close a viewer that has seen no new frame for this long.
    pub stall_timeout: Option<Duration>,
    pub boundary: String,
}

impl BroadcastSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_consecutive_capture_errors: config.broadcaster.max_consecutive_capture_errors,
            wake_interval: config.broadcaster.wake_interval(),
            stall_timeout: config.broadcaster.stall_timeout(),
            boundary: config.encoding.boundary.clone(),
        }
    }
}

/// Point-in-time counters for status reporting.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedStats {
    pub sequence: u64,
    pub frames_published: u64,
    pub capture_errors: u64,
    pub encode_errors: u64,
    pub subscribers: usize,
    pub measured_fps: f64,
}

#[derive(Default)]
struct Counters {
    frames_published: AtomicU64,
    capture_errors: AtomicU64,
    encode_errors: AtomicU64,
    last_seq: AtomicU64,
    /// `f64` bits.
    measured_fps: AtomicU64,
}

pub(crate) struct FeedInner {
    /// Written only by the broadcaster thread.
    pub(crate) slot: watch::Sender<FeedState>,
    pub(crate) stop: AtomicBool,
    pub(crate) subscribers: AtomicUsize,
    pub(crate) next_subscriber_id: AtomicU64,
    pub(crate) settings: BroadcastSettings,
    counters: Counters,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl FeedInner {
    pub(crate) fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}

/// Cloneable handle to a running broadcaster.
#[derive(Clone)]
pub struct Feed {
    pub(crate) inner: Arc<FeedInner>,
}

impl Feed {
    /// Register a new viewer. Fails fast once the feed is closed.
    pub fn subscribe(&self) -> Result<ClientSession, FeedClosed> {
        ClientSession::open(Arc::clone(&self.inner))
    }

    pub fn state(&self) -> FeedState {
        self.inner.slot.borrow().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.slot.borrow().is_closed()
    }

    pub fn boundary(&self) -> &str {
        &self.inner.settings.boundary
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> FeedStats {
        let c = &self.inner.counters;
        FeedStats {
            sequence: c.last_seq.load(Ordering::Acquire),
            frames_published: c.frames_published.load(Ordering::Relaxed),
            capture_errors: c.capture_errors.load(Ordering::Relaxed),
            encode_errors: c.encode_errors.load(Ordering::Relaxed),
            subscribers: self.subscriber_count(),
            measured_fps: f64::from_bits(c.measured_fps.load(Ordering::Relaxed)),
        }
    }

    /// Ask the broadcaster to stop. Returns immediately; waiting viewers
    /// notice within one wake interval.
    pub fn stop(&self) {
        if !self.inner.stop.swap(true, Ordering::AcqRel) {
            info!("feed stop requested");
        }
    }

    /// Wait for the broadcaster thread to exit. Blocks.
    pub fn join(&self) {
        let handle = self
            .inner
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("broadcaster thread panicked");
            }
        }
    }

    /// `stop` followed by `join`.
    pub fn shutdown(&self) {
        self.stop();
        self.join();
    }
}

/// The producer loop. Construct with [`FrameBroadcaster::spawn`].
pub struct FrameBroadcaster {
    camera: Arc<CameraSource>,
    encoder: Box<dyn FrameEncoder>,
    feed: Arc<FeedInner>,
    seq: u64,
    consecutive_capture_errors: u32,
    last_publish: Option<Instant>,
    fps: f64,
}

impl FrameBroadcaster {
    /// Start the broadcaster on its own thread and return the feed handle.
    ///
    /// The camera is acquired on that thread; if it cannot be opened the
    /// feed closes with [`CloseReason::CameraUnavailable`].
    pub fn spawn(
        camera: Arc<CameraSource>,
        encoder: impl FrameEncoder + 'static,
        settings: BroadcastSettings,
    ) -> std::io::Result<Feed> {
        let (slot, _) = watch::channel(FeedState::Starting);
        let inner = Arc::new(FeedInner {
            slot,
            stop: AtomicBool::new(false),
            subscribers: AtomicUsize::new(0),
            next_subscriber_id: AtomicU64::new(0),
            settings,
            counters: Counters::default(),
            thread: Mutex::new(None),
        });

        let broadcaster = FrameBroadcaster {
            camera,
            encoder: Box::new(encoder),
            feed: Arc::clone(&inner),
            seq: 0,
            consecutive_capture_errors: 0,
            last_publish: None,
            fps: 0.0,
        };
        let handle = std::thread::Builder::new()
            .name("frame-broadcaster".into())
            .spawn(move || broadcaster.run())?;
        *inner.thread.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        Ok(Feed { inner })
    }

    fn run(mut self) {
        if let Err(e) = self.camera.acquire() {
            error!(error = %e, "camera unavailable, closing feed");
            self.close(CloseReason::CameraUnavailable);
            return;
        }
        let camera = self.camera.settings();
        info!(
            index = camera.index,
            width = camera.width,
            height = camera.height,
            fps = camera.fps,
            encoder = self.encoder.name(),
            threshold = self.feed.settings.max_consecutive_capture_errors,
            "broadcaster running"
        );

        let reason = loop {
            if self.feed.stop_requested() {
                break CloseReason::Shutdown;
            }
            match self.camera.read_frame() {
                Ok(raw) => {
                    self.consecutive_capture_errors = 0;
                    self.publish(&raw);
                }
                Err(e) => {
                    self.consecutive_capture_errors += 1;
                    self.feed
                        .counters
                        .capture_errors
                        .fetch_add(1, Ordering::Relaxed);
                    let threshold = self.feed.settings.max_consecutive_capture_errors;
                    if self.consecutive_capture_errors >= threshold {
                        error!(
                            error = %e,
                            consecutive = self.consecutive_capture_errors,
                            threshold,
                            "too many consecutive capture errors, camera unavailable"
                        );
                        break CloseReason::CameraUnavailable;
                    }
                    warn!(
                        error = %e,
                        consecutive = self.consecutive_capture_errors,
                        threshold,
                        "frame capture failed, skipping"
                    );
                }
            }
        };

        self.close(reason);
        self.camera.release();
    }

    fn publish(&mut self, raw: &RawFrame) {
        let jpeg = match self.encoder.encode(raw) {
            Ok(jpeg) => jpeg,
            Err(e) => {
                self.feed
                    .counters
                    .encode_errors
                    .fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, seq = self.seq, "frame encoding failed, keeping previous frame");
                return;
            }
        };

        self.seq += 1;
        let (width, height) = self.encoder.output_size(raw);
        let bytes = jpeg.len();
        let frame = Frame::new(jpeg, self.seq, raw.captured_at_ms, width, height);
        let latency_ms = frame.age_ms(now_ms());
        self.feed.slot.send_replace(FeedState::Live(Arc::new(frame)));

        let counters = &self.feed.counters;
        counters.last_seq.store(self.seq, Ordering::Release);
        counters.frames_published.fetch_add(1, Ordering::Relaxed);
        self.update_fps();

        debug!(
            seq = self.seq,
            bytes,
            latency_ms,
            subscribers = self.feed.subscribers.load(Ordering::Relaxed),
            "frame published"
        );
    }

    fn update_fps(&mut self) {
        let now = Instant::now();
        if let Some(last) = self.last_publish.replace(now) {
            let secs = now.duration_since(last).as_secs_f64();
            if secs > 0.0 {
                let instant = 1.0 / secs;
                self.fps = if self.fps == 0.0 {
                    instant
                } else {
                    FPS_ALPHA * instant + (1.0 - FPS_ALPHA) * self.fps
                };
                self.feed
                    .counters
                    .measured_fps
                    .store(self.fps.to_bits(), Ordering::Relaxed);
            }
        }
    }

    fn close(&self, reason: CloseReason) {
        self.feed.slot.send_replace(FeedState::Closed(reason));
        info!(?reason, last_seq = self.seq, "feed closed");
    }
}

impl Drop for FrameBroadcaster {
    fn drop(&mut self) {
        // A panic in the loop must still release waiting viewers.
        let closed = self.feed.slot.borrow().is_closed();
        if !closed {
            error!("broadcaster exited without closing the feed");
            self.close(CloseReason::CameraUnavailable);
            self.camera.release();
        }
    }
}
