//! Stream Detector
//!
//! Inference session manager for a video-analytics appliance. Clients
//! register camera streams against catalogued detection applications; each
//! registered stream gets a worker that connects to the source, retries with
//! bounded backoff, runs the detector on every frame and publishes one
//! detection event per frame on the topic `stream.<stream_id>`.
//!
//! # Module Structure
//!
//! - `registry`: read-only application catalogue
//! - `session`: session store and per-session connection driver
//! - `ingest`: frame sources (`stub://` synthetic, RTSP behind a feature)
//! - `detect`: detector backends
//! - `events`: in-process event bus, sinks and forwarders
//! - `transport`: MQTT mirror of the event bus
//! - `api`: control API facade, loopback HTTP server and client
//! - `config`: daemon configuration

use std::time::{SystemTime, UNIX_EPOCH};

pub mod api;
pub mod config;
pub mod detect;
pub mod error;
pub mod events;
pub mod frame;
pub mod ingest;
pub mod registry;
pub mod session;
pub mod settings;
pub mod transport;

pub use api::{ApiConfig, ApiHandle, ApiServer, ControlApi, ControlClient};
pub use config::DetectordConfig;
pub use detect::{BackendRegistry, Detection, DetectorBackend};
pub use error::{DriverError, LookupError, RegistrationError, SettingsError};
pub use events::{DetectionEvent, EventBus, Subscription};
pub use frame::Frame;
pub use ingest::{DefaultSourceFactory, FrameSource, SourceFactory};
pub use registry::{AppRegistry, Application, Model, RegistrySettings};
pub use session::{LifecycleState, SessionSnapshot, SessionStore, SessionUpdate, StoreSettings};
pub use settings::StreamSettings;

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
