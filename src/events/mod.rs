//! Data-plane event bus.
//!
//! Each processed frame becomes one [`DetectionEvent`] published on the
//! stream-scoped topic `<prefix>.<stream_id>`. Subscribers register a topic
//! pattern and drain their own bounded queue; publishers never wait on them.

mod bus;
mod sink;
mod topic;

use serde::{Deserialize, Serialize};

use crate::detect::Detection;

pub use bus::{BusStats, Delivery, EventBus, Subscription, DEFAULT_BUFFER_CAPACITY};
pub use sink::{spawn_forwarder, EventSink, ForwarderHandle};
pub use topic::{is_valid_token, topic_matches, validate_pattern, DEFAULT_TOPIC_PREFIX};

/// One frame's worth of detector output.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DetectionEvent {
    pub stream_id: String,
    /// Capture time in milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub frame_number: u64,
    pub fps: f64,
    pub width: u32,
    pub height: u32,
    pub detections: Vec<Detection>,
    /// JPEG frame, base64 encoded. Present only when the stream opted in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_base64: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_json_matches_wire_record() {
        let event = DetectionEvent {
            stream_id: "cam1".into(),
            timestamp: 1_700_000_000_000,
            frame_number: 7,
            fps: 29.5,
            width: 1920,
            height: 1080,
            detections: vec![Detection {
                class: "person".into(),
                class_id: 0,
                confidence: 0.75,
                bbox: None,
            }],
            image_base64: None,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["stream_id"], "cam1");
        assert_eq!(value["frame_number"], 7);
        assert_eq!(value["width"], 1920);
        assert_eq!(value["detections"][0]["class"], "person");
        assert!(value.get("image_base64").is_none());

        let back: DetectionEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);
    }
}
