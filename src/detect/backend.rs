use anyhow::Result;

use crate::detect::result::Detection;
use crate::frame::Frame;

/// Detector backend trait.
///
/// One backend instance is owned by each connection driver worker, so
/// implementations may keep per-stream state between frames. Backends must
/// treat the frame as read-only and must not retain pixels past `detect`.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a frame.
    ///
    /// Implementations may return low-confidence candidates; the worker
    /// filters them against the stream's threshold.
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>>;

    /// Optional warm-up hook, called once before the first dial.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
