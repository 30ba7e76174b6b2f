//! Per-stream settings carried as an embedded JSON document in
//! `AddInference` and parsed once at registration.

use serde::{Deserialize, Serialize};

use crate::error::SettingsError;

pub const DEFAULT_WIDTH: u32 = 1920;
pub const DEFAULT_HEIGHT: u32 = 1080;
pub const DEFAULT_FPS: u32 = 30;
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.5;

const MAX_DIMENSION: i64 = 8192;
const MAX_FPS: i64 = 240;

/// Validated stream settings. Construct through [`StreamSettings::parse`] or
/// [`StreamSettings::new`]; both reject out-of-range values.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct StreamSettings {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub confidence_threshold: f32,
    pub publish_images: bool,
}

#[derive(Debug, Deserialize, Default)]
struct SettingsDocument {
    width: Option<i64>,
    height: Option<i64>,
    fps: Option<i64>,
    confidence_threshold: Option<f64>,
    publish_images: Option<bool>,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            fps: DEFAULT_FPS,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            publish_images: false,
        }
    }
}

impl StreamSettings {
    pub fn new(
        width: u32,
        height: u32,
        fps: u32,
        confidence_threshold: f32,
    ) -> Result<Self, SettingsError> {
        let settings = Self {
            width,
            height,
            fps,
            confidence_threshold,
            publish_images: false,
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn with_images(mut self, publish_images: bool) -> Self {
        self.publish_images = publish_images;
        self
    }

    /// Parse the settings document. An empty document yields the defaults.
    pub fn parse(raw: &str) -> Result<Self, SettingsError> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let doc: SettingsDocument =
            serde_json::from_str(raw).map_err(|e| SettingsError::Malformed(e.to_string()))?;

        let defaults = Self::default();
        let settings = Self {
            width: checked_int("width", doc.width, defaults.width, MAX_DIMENSION)?,
            height: checked_int("height", doc.height, defaults.height, MAX_DIMENSION)?,
            fps: checked_int("fps", doc.fps, defaults.fps, MAX_FPS)?,
            confidence_threshold: match doc.confidence_threshold {
                Some(value) => {
                    check_threshold(value)?;
                    value as f32
                }
                None => defaults.confidence_threshold,
            },
            publish_images: doc.publish_images.unwrap_or(false),
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        checked_int("width", Some(self.width as i64), 0, MAX_DIMENSION)?;
        checked_int("height", Some(self.height as i64), 0, MAX_DIMENSION)?;
        checked_int("fps", Some(self.fps as i64), 0, MAX_FPS)?;
        check_threshold(self.confidence_threshold as f64)
    }

    /// Nominal interval between frames at the configured rate.
    pub fn frame_interval(&self) -> std::time::Duration {
        std::time::Duration::from_micros(1_000_000 / self.fps.max(1) as u64)
    }
}

fn checked_int(
    field: &'static str,
    value: Option<i64>,
    default: u32,
    max: i64,
) -> Result<u32, SettingsError> {
    let Some(value) = value else {
        return Ok(default);
    };
    if !(1..=max).contains(&value) {
        return Err(SettingsError::OutOfRange {
            field,
            min: "1".to_string(),
            max: max.to_string(),
            value: value.to_string(),
        });
    }
    Ok(value as u32)
}

fn check_threshold(value: f64) -> Result<(), SettingsError> {
    if !value.is_finite() || !(0.0..=1.0).contains(&value) {
        return Err(SettingsError::OutOfRange {
            field: "confidence_threshold",
            min: "0".to_string(),
            max: "1".to_string(),
            value: value.to_string(),
        });
    }
    Ok(())
}
