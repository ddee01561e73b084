use frame_feed_common::frame::now_ms;
use nokhwa::pixel_format::RgbFormat;
use nokhwa::threaded::CallbackCamera;
use nokhwa::utils::{
    CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType, Resolution,
};
use tracing::{info, warn};

use super::traits::{CaptureBackend, CaptureDevice, RawFrame};
use super::{CameraError, CameraSettings, CaptureError};

/// Local capture devices through nokhwa's native backend.
pub struct WebcamBackend;

impl CaptureBackend for WebcamBackend {
    fn open(&self, settings: &CameraSettings) -> Result<Box<dyn CaptureDevice>, CameraError> {
        let unavailable = |e: nokhwa::NokhwaError| CameraError::Unavailable {
            index: settings.index,
            reason: e.to_string(),
        };

        let format = RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(
            CameraFormat::new(
                Resolution::new(settings.width, settings.height),
                FrameFormat::MJPEG,
                settings.fps,
            ),
        ));
        let mut camera =
            CallbackCamera::new(CameraIndex::Index(settings.index), format, |_| {})
                .map_err(unavailable)?;
        camera.open_stream().map_err(unavailable)?;

        // nokhwa does not expose the driver queue depth.
        if settings.buffer_depth != 1 {
            warn!(
                buffer_depth = settings.buffer_depth,
                "webcam backend ignores buffer_depth"
            );
        }
        info!(index = settings.index, "webcam stream opened");
        Ok(Box::new(WebcamDevice { camera }))
    }

    fn name(&self) -> &str {
        "webcam"
    }
}

struct WebcamDevice {
    camera: CallbackCamera,
}

impl CaptureDevice for WebcamDevice {
    fn read_frame(&mut self) -> Result<RawFrame, CaptureError> {
        let buffer = self
            .camera
            .poll_frame()
            .map_err(|e| CaptureError::Io(e.to_string()))?;
        let image = buffer
            .decode_image::<RgbFormat>()
            .map_err(|e| CaptureError::Io(e.to_string()))?;
        Ok(RawFrame {
            width: image.width(),
            height: image.height(),
            rgb: image.into_raw(),
            captured_at_ms: now_ms(),
        })
    }

    fn stop(&mut self) {
        if let Err(e) = self.camera.stop_stream() {
            warn!(error = %e, "failed to stop webcam stream");
        }
    }
}
