//! Decoded video frames as handed from a frame source to the detector.
//!
//! Frames are transient: a worker owns each frame for the duration of one
//! detect/publish step and drops it afterwards. The only way pixels leave the
//! process is the optional JPEG payload on a detection event.

use anyhow::{anyhow, Result};
use base64::Engine;

const DEFAULT_JPEG_QUALITY: u8 = 75;

/// One decoded RGB frame (3 bytes per pixel, row-major, no padding).
pub struct Frame {
    pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Wall-clock capture time in milliseconds since the Unix epoch.
    pub captured_at_ms: i64,
}

impl Frame {
    pub fn new(pixels: Vec<u8>, width: u32, height: u32) -> Result<Self> {
        let expected = (width as usize) * (height as usize) * 3;
        if pixels.len() != expected {
            return Err(anyhow!(
                "frame buffer is {} bytes, expected {} for {}x{} RGB",
                pixels.len(),
                expected,
                width,
                height
            ));
        }
        Ok(Self {
            pixels,
            width,
            height,
            captured_at_ms: crate::now_millis(),
        })
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// JPEG-encode the frame and return it base64 encoded.
    pub fn encode_jpeg_base64(&self) -> Result<String> {
        let jpeg = self.encode_jpeg(DEFAULT_JPEG_QUALITY)?;
        Ok(base64::engine::general_purpose::STANDARD.encode(jpeg))
    }

    pub fn encode_jpeg(&self, quality: u8) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        {
            let mut encoder =
                image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, quality);
            encoder
                .encode(
                    &self.pixels,
                    self.width,
                    self.height,
                    image::ExtendedColorType::Rgb8,
                )
                .map_err(|e| anyhow!("jpeg encode failed: {}", e))?;
        }
        Ok(out)
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("captured_at_ms", &self.captured_at_ms)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_mismatched_buffer() {
        assert!(Frame::new(vec![0u8; 10], 4, 4).is_err());
        assert!(Frame::new(vec![0u8; 48], 4, 4).is_ok());
    }

    #[test]
    fn encodes_jpeg_payload() -> Result<()> {
        let frame = Frame::new(vec![128u8; 16 * 8 * 3], 16, 8)?;
        let jpeg = frame.encode_jpeg(80)?;
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);

        let b64 = frame.encode_jpeg_base64()?;
        let decoded = base64::engine::general_purpose::STANDARD.decode(b64)?;
        assert_eq!(&decoded[..2], &[0xFF, 0xD8]);
        Ok(())
    }

    #[test]
    fn debug_output_omits_pixels() {
        let frame = Frame::new(vec![7u8; 12], 2, 2).unwrap();
        let text = format!("{frame:?}");
        assert!(text.contains("width: 2"));
        assert!(!text.contains("pixels"));
    }
}
