use super::{CameraError, CameraSettings, CaptureError};

/// An un-encoded RGB8 image straight from a capture device.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    /// Row-major RGB8, `width * height * 3` bytes.
    pub rgb: Vec<u8>,
    pub captured_at_ms: i64,
}

/// An opened capture device.
///
/// `read_frame` blocks until the device delivers the next frame. Devices are
/// never read concurrently; [`super::CameraSource`] serializes access.
pub trait CaptureDevice: Send {
    fn read_frame(&mut self) -> Result<RawFrame, CaptureError>;

    /// Stop capturing. Called once when the handle is released.
    fn stop(&mut self) {}
}

/// Opens capture devices for a given set of settings.
pub trait CaptureBackend: Send + Sync {
    fn open(&self, settings: &CameraSettings) -> Result<Box<dyn CaptureDevice>, CameraError>;

    /// Human-readable name for logging.
    fn name(&self) -> &str {
        "unnamed"
    }
}
