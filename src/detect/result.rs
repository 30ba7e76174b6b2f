use serde::{Deserialize, Serialize};

/// One detected object on a frame.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Detection {
    /// Class label (e.g. "person").
    pub class: String,
    pub class_id: u32,
    /// Confidence score in `[0, 1]`.
    pub confidence: f32,
    /// Pixel-space box, when the backend localises objects.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox: Option<BoundingBox>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Detection {
    pub fn passes(&self, confidence_threshold: f32) -> bool {
        self.confidence >= confidence_threshold
    }
}
