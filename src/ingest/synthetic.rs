//! Synthetic frame source for `stub://` URIs.
//!
//! Produces paced RGB frames at the session's resolution and fps. Query
//! parameters inject failures so every driver path can be exercised without
//! a camera:
//! - `fail_dial`: every dial attempt is refused
//! - `drop_after=N`: the stream closes after N frames per connection
//! - `decode_error_every=N`: every Nth frame fails to decode
//! - `stall`: connects, then never delivers a frame

use std::time::{Duration, Instant};

use url::Url;

use crate::error::DriverError;
use crate::frame::Frame;
use crate::settings::StreamSettings;

use super::FrameSource;

/// Frames between simulated scene changes.
const SCENE_PERIOD: u64 = 50;
const STRIPE_STRIDE: usize = 4096;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyntheticOptions {
    pub fail_dial: bool,
    pub drop_after: Option<u64>,
    pub decode_error_every: Option<u64>,
    pub stall: bool,
}

impl SyntheticOptions {
    pub fn from_url(uri: &Url) -> Result<Self, DriverError> {
        let mut options = Self::default();
        for (key, value) in uri.query_pairs() {
            match &*key {
                "fail_dial" => options.fail_dial = parse_flag(&key, &value)?,
                "stall" => options.stall = parse_flag(&key, &value)?,
                "drop_after" => options.drop_after = Some(parse_count(&key, &value)?),
                "decode_error_every" => {
                    options.decode_error_every = Some(parse_count(&key, &value)?)
                }
                other => {
                    return Err(DriverError::Config(format!(
                        "unknown stub parameter '{}'",
                        other
                    )))
                }
            }
        }
        Ok(options)
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool, DriverError> {
    match value {
        "" | "1" | "true" => Ok(true),
        "0" | "false" => Ok(false),
        _ => Err(DriverError::Config(format!(
            "stub parameter '{}' must be a boolean, got '{}'",
            key, value
        ))),
    }
}

fn parse_count(key: &str, value: &str) -> Result<u64, DriverError> {
    match value.parse::<u64>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(DriverError::Config(format!(
            "stub parameter '{}' must be a positive integer, got '{}'",
            key, value
        ))),
    }
}

pub struct SyntheticSource {
    name: String,
    width: u32,
    height: u32,
    interval: Duration,
    options: SyntheticOptions,
    connected: bool,
    frames_this_connection: u64,
    frames_total: u64,
    /// Simulated scene state, bumped every `SCENE_PERIOD` frames.
    scene_state: u8,
    next_due: Option<Instant>,
}

impl SyntheticSource {
    pub fn from_url(uri: &Url, settings: &StreamSettings) -> Result<Self, DriverError> {
        let options = SyntheticOptions::from_url(uri)?;
        let name = uri.host_str().unwrap_or("synthetic").to_string();
        Ok(Self::new(&name, settings, options))
    }

    pub fn new(name: &str, settings: &StreamSettings, options: SyntheticOptions) -> Self {
        Self {
            name: name.to_string(),
            width: settings.width,
            height: settings.height,
            interval: settings.frame_interval(),
            options,
            connected: false,
            frames_this_connection: 0,
            frames_total: 0,
            scene_state: 0,
            next_due: None,
        }
    }

    fn generate_pixels(&mut self) -> Vec<u8> {
        if self.frames_total % SCENE_PERIOD == 0 {
            self.scene_state = self.scene_state.wrapping_add(37);
        }
        let len = (self.width as usize) * (self.height as usize) * 3;
        let mut pixels = vec![self.scene_state; len];
        let marker = (self.frames_total % 256) as u8;
        for pixel in pixels.iter_mut().step_by(STRIPE_STRIDE) {
            *pixel = marker;
        }
        pixels
    }

    /// Sleep until the next frame is due. Fails if that is beyond `timeout`.
    fn pace(&mut self, timeout: Duration) -> Result<(), DriverError> {
        let now = Instant::now();
        if let Some(due) = self.next_due {
            let wait = due.saturating_duration_since(now);
            if wait > timeout {
                std::thread::sleep(timeout);
                return Err(DriverError::Timeout(format!(
                    "no frame within {} ms",
                    timeout.as_millis()
                )));
            }
            std::thread::sleep(wait);
        }
        self.next_due = Some(self.next_due.unwrap_or(now).max(now) + self.interval);
        Ok(())
    }
}

impl FrameSource for SyntheticSource {
    fn connect(&mut self, _timeout: Duration) -> Result<(), DriverError> {
        if self.options.fail_dial {
            return Err(DriverError::Dial(format!(
                "stub://{} refused the connection",
                self.name
            )));
        }
        self.connected = true;
        self.frames_this_connection = 0;
        self.next_due = None;
        log::debug!("stub://{}: connected (synthetic)", self.name);
        Ok(())
    }

    fn next_frame(&mut self, timeout: Duration) -> Result<Frame, DriverError> {
        if !self.connected {
            return Err(DriverError::StreamClosed(format!(
                "stub://{} is not connected",
                self.name
            )));
        }
        if self.options.stall {
            std::thread::sleep(timeout);
            return Err(DriverError::Timeout(format!(
                "no frame within {} ms",
                timeout.as_millis()
            )));
        }
        if let Some(limit) = self.options.drop_after {
            if self.frames_this_connection >= limit {
                self.connected = false;
                return Err(DriverError::StreamClosed(format!(
                    "stub://{} dropped after {} frames",
                    self.name, limit
                )));
            }
        }

        self.pace(timeout)?;
        self.frames_this_connection += 1;
        self.frames_total += 1;

        if let Some(every) = self.options.decode_error_every {
            if self.frames_total % every == 0 {
                return Err(DriverError::Decode(format!(
                    "corrupt synthetic frame {}",
                    self.frames_total
                )));
            }
        }

        let pixels = self.generate_pixels();
        Frame::new(pixels, self.width, self.height).map_err(|e| DriverError::Decode(e.to_string()))
    }
}
