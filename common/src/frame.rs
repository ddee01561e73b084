use bytes::Bytes;

use crate::config::Config;

/// An encoded JPEG frame as published by the broadcaster.
///
/// Frames are immutable once built and are handed to viewers as
/// `Arc<Frame>`, so fan-out never copies `jpeg`.
#[derive(Debug, Clone)]
pub struct Frame {
    pub jpeg: Bytes,
    /// Starts at 1 and increases by one per published frame.
    pub seq: u64,
    pub captured_at_ms: i64,
    pub width: u32,
    pub height: u32,
}

impl Frame {
    pub fn new(jpeg: Bytes, seq: u64, captured_at_ms: i64, width: u32, height: u32) -> Self {
        Self {
            jpeg,
            seq,
            captured_at_ms,
            width,
            height,
        }
    }

    pub fn size(&self) -> usize {
        self.jpeg.len()
    }

    /// Milliseconds between capture and `now_ms`.
    pub fn age_ms(&self, now_ms: i64) -> i64 {
        (now_ms - self.captured_at_ms).max(0)
    }
}

/// Encoder settings, fixed for the lifetime of the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodingParams {
    /// JPEG quality, 0-100.
    pub quality: u8,
    pub width: u32,
    pub height: u32,
    /// Multipart boundary token, without the leading `--`.
    pub boundary: String,
}

impl EncodingParams {
    pub fn from_config(config: &Config) -> Self {
        Self {
            quality: config.encoding.jpeg_quality,
            width: config.camera.width,
            height: config.camera.height,
            boundary: config.encoding.boundary.clone(),
        }
    }
}

/// Current wall-clock time in Unix milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_shares_payload() {
        let frame = Frame::new(Bytes::from_static(&[0xFF, 0xD8, 0xFF, 0xD9]), 7, 1_000, 2, 2);
        let copy = frame.clone();
        assert_eq!(copy.jpeg.as_ptr(), frame.jpeg.as_ptr());
        assert_eq!(copy.seq, 7);
        assert_eq!(frame.size(), 4);
    }

    #[test]
    fn age_never_negative() {
        let frame = Frame::new(Bytes::new(), 1, 5_000, 0, 0);
        assert_eq!(frame.age_ms(5_250), 250);
        assert_eq!(frame.age_ms(4_000), 0);
    }

    #[test]
    fn params_follow_config() {
        let params = EncodingParams::from_config(&Config::default());
        assert_eq!(params.quality, 70);
        assert_eq!((params.width, params.height), (640, 480));
        assert_eq!(params.boundary, "frame");
    }
}
