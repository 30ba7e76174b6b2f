//! Frame sources for connection drivers.
//!
//! A [`SourceFactory`] opens one [`FrameSource`] per connection attempt from
//! the session's URI. Sources supported by [`DefaultSourceFactory`]:
//! - `stub://name[?params]` synthetic frames (testing, demos)
//! - `rtsp://` / `rtsps://` IP cameras (feature: rtsp-gstreamer)
//!
//! Without `rtsp-gstreamer` an `rtsp://` session fails on its first attempt
//! with a configuration error and is not retried. Unreachable-camera retry
//! behaviour can then only be exercised with `stub://name?fail_dial`.
//!
//! Sources decode into RGB [`Frame`]s and hand them to the worker. They MUST
//! NOT store frames or log pixel content.

#[cfg(feature = "rtsp-gstreamer")]
pub mod rtsp;
pub mod synthetic;

use std::time::Duration;

use url::Url;

use crate::error::DriverError;
use crate::frame::Frame;
use crate::settings::StreamSettings;

#[cfg(feature = "rtsp-gstreamer")]
pub use rtsp::RtspSource;
pub use synthetic::{SyntheticOptions, SyntheticSource};

/// An open upstream media connection.
pub trait FrameSource: Send {
    /// Dial the upstream. Must give up after `timeout`.
    fn connect(&mut self, timeout: Duration) -> Result<(), DriverError>;

    /// Block for the next decoded frame, at most `timeout`.
    fn next_frame(&mut self, timeout: Duration) -> Result<Frame, DriverError>;
}

/// Opens frame sources by URI scheme.
pub trait SourceFactory: Send + Sync {
    fn open(&self, uri: &Url, settings: &StreamSettings)
        -> Result<Box<dyn FrameSource>, DriverError>;
}

/// Whether this build can open `rtsp://` sources.
pub const RTSP_SUPPORTED: bool = cfg!(feature = "rtsp-gstreamer");

/// Scheme dispatch used by the daemon.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultSourceFactory;

impl SourceFactory for DefaultSourceFactory {
    fn open(
        &self,
        uri: &Url,
        settings: &StreamSettings,
    ) -> Result<Box<dyn FrameSource>, DriverError> {
        match uri.scheme() {
            "stub" => Ok(Box::new(SyntheticSource::from_url(uri, settings)?)),
            "rtsp" | "rtsps" => open_rtsp(uri, settings),
            other => Err(DriverError::Config(format!(
                "unsupported source scheme '{}'",
                other
            ))),
        }
    }
}

#[cfg(feature = "rtsp-gstreamer")]
fn open_rtsp(uri: &Url, settings: &StreamSettings) -> Result<Box<dyn FrameSource>, DriverError> {
    Ok(Box::new(RtspSource::new(uri, settings)?))
}

#[cfg(not(feature = "rtsp-gstreamer"))]
fn open_rtsp(_uri: &Url, _settings: &StreamSettings) -> Result<Box<dyn FrameSource>, DriverError> {
    Err(DriverError::Config(
        "RTSP requires the rtsp-gstreamer feature".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_scheme_is_a_configuration_error() {
        let uri = Url::parse("http://camera.local/stream").unwrap();
        let err = DefaultSourceFactory
            .open(&uri, &StreamSettings::default())
            .err()
            .unwrap();
        assert!(err.is_terminal());
    }

    #[cfg(not(feature = "rtsp-gstreamer"))]
    #[test]
    fn rtsp_without_feature_is_terminal() {
        let uri = Url::parse("rtsp://127.0.0.1:8554/live").unwrap();
        let err = DefaultSourceFactory
            .open(&uri, &StreamSettings::default())
            .err()
            .unwrap();
        assert!(matches!(err, DriverError::Config(_)));
        assert!(err.is_terminal());
        assert!(!RTSP_SUPPORTED);
    }

    #[test]
    fn stub_scheme_opens_synthetic_source() {
        let uri = Url::parse("stub://cam1").unwrap();
        let settings = StreamSettings::new(32, 16, 240, 0.5).unwrap();
        let mut source = DefaultSourceFactory.open(&uri, &settings).unwrap();
        source.connect(Duration::from_millis(100)).unwrap();
        let frame = source.next_frame(Duration::from_millis(100)).unwrap();
        assert_eq!((frame.width, frame.height), (32, 16));
    }
}
