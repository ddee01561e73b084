use std::time::{Duration, Instant};

use frame_feed_common::frame::now_ms;
use tracing::debug;

use super::traits::{CaptureBackend, CaptureDevice, RawFrame};
use super::{CameraError, CameraSettings, CaptureError};

const BAR_WIDTH: usize = 16;
const BAR_STEP: usize = 8;

/// Test-pattern backend. Pretends to have `device_count` cameras at indices
/// `0..device_count`; any other index fails to open.
pub struct SyntheticBackend {
    device_count: u32,
}

impl SyntheticBackend {
    pub fn new(device_count: u32) -> Self {
        Self { device_count }
    }
}

impl CaptureBackend for SyntheticBackend {
    fn open(&self, settings: &CameraSettings) -> Result<Box<dyn CaptureDevice>, CameraError> {
        if settings.index >= self.device_count {
            return Err(CameraError::Unavailable {
                index: settings.index,
                reason: format!("no such device ({} synthetic devices)", self.device_count),
            });
        }
        Ok(Box::new(SyntheticDevice::new(settings)))
    }

    fn name(&self) -> &str {
        "synthetic"
    }
}

/// A gradient with a white bar sweeping left to right, delivered at the
/// configured frame rate.
pub struct SyntheticDevice {
    width: u32,
    height: u32,
    interval: Duration,
    next_deadline: Option<Instant>,
    frames: u64,
    background: Vec<u8>,
}

impl SyntheticDevice {
    pub fn new(settings: &CameraSettings) -> Self {
        let (width, height) = (settings.width as usize, settings.height as usize);
        let mut background = Vec::with_capacity(width * height * 3);
        for y in 0..height {
            for x in 0..width {
                background.push((x * 255 / width.max(1)) as u8);
                background.push((y * 255 / height.max(1)) as u8);
                background.push(96);
            }
        }
        Self {
            width: settings.width,
            height: settings.height,
            interval: Duration::from_secs_f64(1.0 / settings.fps.max(1) as f64),
            next_deadline: None,
            frames: 0,
            background,
        }
    }

    /// Sleep until the next frame is due, like a real sensor would.
    fn wait_for_tick(&mut self) {
        let now = Instant::now();
        let deadline = self.next_deadline.unwrap_or(now);
        if deadline > now {
            std::thread::sleep(deadline - now);
        }
        let next = deadline + self.interval;
        let now = Instant::now();
        // More than a frame behind: resync rather than burst.
        self.next_deadline = Some(if next < now { now + self.interval } else { next });
    }

    fn render(&self) -> Vec<u8> {
        let mut rgb = self.background.clone();
        if self.width == 0 {
            return rgb;
        }
        let width = self.width as usize;
        let bar_x = (self.frames as usize).wrapping_mul(BAR_STEP) % width;
        for y in 0..self.height as usize {
            for x in bar_x..(bar_x + BAR_WIDTH).min(width) {
                let i = (y * width + x) * 3;
                rgb[i..i + 3].copy_from_slice(&[255, 255, 255]);
            }
        }
        rgb
    }
}

impl CaptureDevice for SyntheticDevice {
    fn read_frame(&mut self) -> Result<RawFrame, CaptureError> {
        self.wait_for_tick();
        let rgb = self.render();
        self.frames += 1;
        Ok(RawFrame {
            width: self.width,
            height: self.height,
            rgb,
            captured_at_ms: now_ms(),
        })
    }

    fn stop(&mut self) {
        debug!(frames = self.frames, "synthetic capture stopped");
    }
}
