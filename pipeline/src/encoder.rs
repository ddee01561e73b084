use bytes::Bytes;
use frame_feed_common::frame::EncodingParams;
use image::codecs::jpeg;
use image::imageops::{self, FilterType};
use image::{ImageBuffer, Rgb};
use tracing::debug;

use crate::camera::RawFrame;

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("raw frame {width}x{height} has {len} bytes, expected {expected}")]
    InvalidBuffer {
        width: u32,
        height: u32,
        len: usize,
        expected: usize,
    },
    #[error("jpeg encoding failed: {0}")]
    Jpeg(String),
}

/// Turns raw captured frames into the bytes viewers receive.
pub trait FrameEncoder: Send {
    fn encode(&mut self, raw: &RawFrame) -> Result<Bytes, EncodeError>;

    /// Dimensions of the image `encode` produces for `raw`.
    fn output_size(&self, raw: &RawFrame) -> (u32, u32) {
        (raw.width, raw.height)
    }

    /// Human-readable name for logging.
    fn name(&self) -> &str {
        "unnamed"
    }
}

/// Baseline JPEG at a fixed quality, scaled to the target resolution when
/// the device delivers something else.
pub struct JpegEncoder {
    quality: u8,
    width: u32,
    height: u32,
}

impl JpegEncoder {
    pub fn new(params: &EncodingParams) -> Self {
        // The codec's quality scale starts at 1.
        Self {
            quality: params.quality.clamp(1, 100),
            width: params.width,
            height: params.height,
        }
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }
}

impl FrameEncoder for JpegEncoder {
    fn encode(&mut self, raw: &RawFrame) -> Result<Bytes, EncodeError> {
        let expected = raw.width as usize * raw.height as usize * 3;
        let invalid = || EncodeError::InvalidBuffer {
            width: raw.width,
            height: raw.height,
            len: raw.rgb.len(),
            expected,
        };
        if expected == 0 || raw.rgb.len() != expected {
            return Err(invalid());
        }
        let image: ImageBuffer<Rgb<u8>, &[u8]> =
            ImageBuffer::from_raw(raw.width, raw.height, raw.rgb.as_slice()).ok_or_else(invalid)?;

        let mut out = Vec::with_capacity(expected / 8);
        {
            let mut encoder = jpeg::JpegEncoder::new_with_quality(&mut out, self.quality);
            let result = if (raw.width, raw.height) == (self.width, self.height) {
                encoder.encode_image(&image)
            } else {
                debug!(
                    from_width = raw.width,
                    from_height = raw.height,
                    to_width = self.width,
                    to_height = self.height,
                    "resizing frame before encoding"
                );
                let scaled =
                    imageops::resize(&image, self.width, self.height, FilterType::Triangle);
                encoder.encode_image(&scaled)
            };
            result.map_err(|e| EncodeError::Jpeg(e.to_string()))?;
        }

        Ok(Bytes::from(out))
    }

    fn output_size(&self, _raw: &RawFrame) -> (u32, u32) {
        (self.width, self.height)
    }

    fn name(&self) -> &str {
        "jpeg"
    }
}
