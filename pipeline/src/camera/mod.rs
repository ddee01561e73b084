//! Ownership of the single physical capture device.
//!
//! [`CameraSource`] wraps one [`CaptureBackend`] and holds at most one open
//! [`CaptureDevice`]. Opening is lazy and idempotent; reading is serialized
//! through the handle lock and is only ever done by the broadcaster thread.

pub mod synthetic;
pub mod traits;
#[cfg(feature = "webcam")]
pub mod webcam;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use frame_feed_common::config::CameraConfig;
use tracing::{debug, info, warn};

pub use synthetic::SyntheticBackend;
pub use traits::{CaptureBackend, CaptureDevice, RawFrame};
#[cfg(feature = "webcam")]
pub use webcam::WebcamBackend;

/// Device parameters applied when the camera is opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraSettings {
    pub index: u32,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub buffer_depth: u32,
}

impl From<&CameraConfig> for CameraSettings {
    fn from(config: &CameraConfig) -> Self {
        Self {
            index: config.index,
            width: config.width,
            height: config.height,
            fps: config.fps,
            buffer_depth: config.buffer_depth,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CameraError {
    #[error("camera {index} unavailable: {reason}")]
    Unavailable { index: u32, reason: String },
    #[error("unknown capture backend {0:?}")]
    UnknownBackend(String),
}

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("camera disconnected: {0}")]
    Disconnected(String),
    #[error("frame read failed: {0}")]
    Io(String),
    #[error("camera has not been acquired")]
    NotAcquired,
}

pub struct CameraSource {
    settings: CameraSettings,
    backend: Box<dyn CaptureBackend>,
    /// Fast-path flag for `acquire`; the device slot is the source of truth.
    opened: AtomicBool,
    device: Mutex<Option<Box<dyn CaptureDevice>>>,
}

impl CameraSource {
    pub fn new(settings: CameraSettings, backend: impl CaptureBackend + 'static) -> Self {
        Self {
            settings,
            backend: Box::new(backend),
            opened: AtomicBool::new(false),
            device: Mutex::new(None),
        }
    }

    /// Build a source for the backend named in the config.
    pub fn from_config(config: &CameraConfig) -> Result<Self, CameraError> {
        let settings = CameraSettings::from(config);
        match config.backend.as_str() {
            "synthetic" => Ok(Self::new(
                settings,
                SyntheticBackend::new(config.synthetic_devices),
            )),
            #[cfg(feature = "webcam")]
            "webcam" => Ok(Self::new(settings, WebcamBackend)),
            other => Err(CameraError::UnknownBackend(other.to_string())),
        }
    }

    pub fn settings(&self) -> &CameraSettings {
        &self.settings
    }

    pub fn is_open(&self) -> bool {
        self.opened.load(Ordering::Acquire)
    }

    /// Open the device if it is not open yet.
    ///
    /// Concurrent callers observe a single initialization. A failed open
    /// leaves the source closed, so a later call tries again.
    pub fn acquire(&self) -> Result<(), CameraError> {
        if self.opened.load(Ordering::Acquire) {
            return Ok(());
        }

        let mut slot = self.lock_device();
        if slot.is_some() {
            return Ok(());
        }

        info!(
            backend = self.backend.name(),
            index = self.settings.index,
            width = self.settings.width,
            height = self.settings.height,
            fps = self.settings.fps,
            buffer_depth = self.settings.buffer_depth,
            "opening camera"
        );
        let device = self.backend.open(&self.settings)?;
        *slot = Some(device);
        self.opened.store(true, Ordering::Release);
        Ok(())
    }

    /// Block until the device delivers the next frame.
    pub fn read_frame(&self) -> Result<RawFrame, CaptureError> {
        let mut slot = self.lock_device();
        match slot.as_mut() {
            Some(device) => device.read_frame(),
            None => Err(CaptureError::NotAcquired),
        }
    }

    /// Stop capture and close the device. Safe to call any number of times.
    pub fn release(&self) {
        let mut slot = self.lock_device();
        self.opened.store(false, Ordering::Release);
        match slot.take() {
            Some(mut device) => {
                device.stop();
                info!(index = self.settings.index, "camera released");
            }
            None => debug!(index = self.settings.index, "camera already released"),
        }
    }

    fn lock_device(&self) -> MutexGuard<'_, Option<Box<dyn CaptureDevice>>> {
        self.device.lock().unwrap_or_else(|poisoned| {
            warn!("camera lock poisoned, recovering");
            PoisonError::into_inner(poisoned)
        })
    }
}

impl Drop for CameraSource {
    fn drop(&mut self) {
        self.release();
    }
}
