use anyhow::Result;
use sha2::{Digest, Sha256};

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{BoundingBox, Detection};
use crate::frame::Frame;

const FALLBACK_LABEL: &str = "object";
const SAMPLE_STRIDE: usize = 997;

/// Stub backend for testing. Derives a deterministic set of detections from
/// a hash of sampled pixels, so identical frames yield identical output.
pub struct StubBackend {
    labels: Vec<String>,
}

impl StubBackend {
    pub fn new(labels: Vec<String>) -> Self {
        let labels = if labels.is_empty() {
            vec![FALLBACK_LABEL.to_string()]
        } else {
            labels
        };
        Self { labels }
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let mut hasher = Sha256::new();
        for &p in frame.pixels().iter().step_by(SAMPLE_STRIDE) {
            hasher.update([p]);
        }
        hasher.update(frame.width.to_le_bytes());
        hasher.update(frame.height.to_le_bytes());
        let hash: [u8; 32] = hasher.finalize().into();

        let count = 1 + (hash[0] % 3) as usize;
        let detections = (0..count)
            .map(|i| {
                let class_id = hash[1 + i] as usize % self.labels.len();
                let x = frame.width * hash[8 + i] as u32 / 256;
                let y = frame.height * hash[12 + i] as u32 / 256;
                let width = ((frame.width - x) * hash[16 + i] as u32 / 255).max(1);
                let height = ((frame.height - y) * hash[20 + i] as u32 / 255).max(1);
                Detection {
                    class: self.labels[class_id].clone(),
                    class_id: class_id as u32,
                    confidence: hash[4 + i] as f32 / 255.0,
                    bbox: Some(BoundingBox {
                        x,
                        y,
                        width,
                        height,
                    }),
                }
            })
            .collect();
        Ok(detections)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(shade: u8) -> Frame {
        Frame::new(vec![shade; 64 * 48 * 3], 64, 48).unwrap()
    }

    #[test]
    fn stub_backend_is_deterministic() {
        let mut backend = StubBackend::new(vec!["person".into(), "car".into()]);
        let a = backend.detect(&frame(10)).unwrap();
        let b = backend.detect(&frame(10)).unwrap();
        assert_eq!(a, b);
        assert!(!a.is_empty() && a.len() <= 3);
    }

    #[test]
    fn stub_detections_stay_inside_frame() {
        let mut backend = StubBackend::default();
        for shade in 0..32u8 {
            for det in backend.detect(&frame(shade)).unwrap() {
                assert_eq!(det.class, "object");
                assert!((0.0..=1.0).contains(&det.confidence));
                let bbox = det.bbox.unwrap();
                assert!(bbox.x + bbox.width <= 64);
                assert!(bbox.y + bbox.height <= 48);
            }
        }
    }
}
