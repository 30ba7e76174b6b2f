use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use url::Url;

use crate::settings::StreamSettings;

/// Connection lifecycle of a session. Serialized as its wire number.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum LifecycleState {
    Ng = 0,
    Ready = 1,
    Connecting = 2,
    Connected = 3,
}

impl LifecycleState {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            LifecycleState::Ng => "NG",
            LifecycleState::Ready => "READY",
            LifecycleState::Connecting => "CONNECTING",
            LifecycleState::Connected => "CONNECTED",
        }
    }
}

impl TryFrom<u8> for LifecycleState {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(LifecycleState::Ng),
            1 => Ok(LifecycleState::Ready),
            2 => Ok(LifecycleState::Connecting),
            3 => Ok(LifecycleState::Connected),
            other => Err(other),
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Serialize for LifecycleState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.as_u8())
    }
}

impl<'de> Deserialize<'de> for LifecycleState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = u8::deserialize(deserializer)?;
        LifecycleState::try_from(raw)
            .map_err(|v| serde::de::Error::custom(format!("unknown lifecycle state {}", v)))
    }
}

/// Point-in-time copy of a session, safe to hand to any reader.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub stream_id: String,
    pub app_id: String,
    pub uri: String,
    pub settings: StreamSettings,
    pub state: LifecycleState,
    pub last_error: Option<String>,
    pub current_fps: f64,
    pub frame_count: u64,
    pub created_at_ms: i64,
    /// Retries are exhausted or the configuration was rejected; the session
    /// stays in `NG` until removed or replaced.
    pub terminal: bool,
    /// Total dial attempts over the session's lifetime.
    pub connect_attempts: u32,
    pub last_detection_ms: Option<i64>,
}

/// Cooperative cancellation flag with a wakeable sleep.
pub(crate) struct CancelToken {
    cancelled: Mutex<bool>,
    wake: Condvar,
}

impl CancelToken {
    pub(crate) fn new() -> Self {
        Self {
            cancelled: Mutex::new(false),
            wake: Condvar::new(),
        }
    }

    pub(crate) fn cancel(&self) {
        let mut cancelled = self.cancelled.lock().unwrap_or_else(|e| e.into_inner());
        *cancelled = true;
        self.wake.notify_all();
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        *self.cancelled.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Sleep for `timeout` or until cancelled. Returns true if cancelled.
    pub(crate) fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = self.cancelled.lock().unwrap_or_else(|e| e.into_inner());
        let (guard, _) = match self
            .wake
            .wait_timeout_while(guard, timeout, |cancelled| !*cancelled)
        {
            Ok(result) => result,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard
    }
}

const NO_DETECTION: i64 = i64::MIN;

/// State of one session shared between its worker (the only writer of the
/// runtime fields) and readers. Every field is read with a single atomic
/// load or a short lock, so status reads never wait on the worker's I/O.
pub(crate) struct SessionShared {
    pub(crate) stream_id: String,
    pub(crate) app_id: String,
    pub(crate) uri: Url,
    pub(crate) settings: StreamSettings,
    pub(crate) created_at_ms: i64,
    pub(crate) seq: u64,
    pub(crate) cancel: CancelToken,
    state: AtomicU8,
    terminal: AtomicBool,
    frame_count: AtomicU64,
    fps_bits: AtomicU64,
    connect_attempts: AtomicU32,
    last_detection_ms: AtomicI64,
    last_error: Mutex<Option<String>>,
}

impl SessionShared {
    pub(crate) fn new(
        stream_id: &str,
        app_id: &str,
        uri: Url,
        settings: StreamSettings,
        seq: u64,
    ) -> Self {
        Self {
            stream_id: stream_id.to_string(),
            app_id: app_id.to_string(),
            uri,
            settings,
            created_at_ms: crate::now_millis(),
            seq,
            cancel: CancelToken::new(),
            state: AtomicU8::new(LifecycleState::Ng.as_u8()),
            terminal: AtomicBool::new(false),
            frame_count: AtomicU64::new(0),
            fps_bits: AtomicU64::new(0f64.to_bits()),
            connect_attempts: AtomicU32::new(0),
            last_detection_ms: AtomicI64::new(NO_DETECTION),
            last_error: Mutex::new(None),
        }
    }

    pub(crate) fn state(&self) -> LifecycleState {
        LifecycleState::try_from(self.state.load(Ordering::Acquire)).unwrap_or(LifecycleState::Ng)
    }

    pub(crate) fn set_state(&self, next: LifecycleState) {
        let prev = self.state.swap(next.as_u8(), Ordering::AcqRel);
        if prev != next.as_u8() {
            log::info!(
                "{}: {} -> {}",
                self.stream_id,
                LifecycleState::try_from(prev).unwrap_or(LifecycleState::Ng),
                next
            );
        }
    }

    pub(crate) fn is_terminal(&self) -> bool {
        self.terminal.load(Ordering::Acquire)
    }

    pub(crate) fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set_error(&self, error: Option<String>) {
        *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = error;
    }

    /// Record a failure and fall back to `NG`. The error is stored before
    /// the state so a reader that sees `NG` also sees the reason.
    pub(crate) fn fail(&self, error: String) {
        self.set_error(Some(error));
        self.fps_bits.store(0f64.to_bits(), Ordering::Relaxed);
        self.set_state(LifecycleState::Ng);
    }

    /// Fail permanently. The worker exits after this. The flag is raised
    /// last so a reader that sees it also sees the final error and `NG`.
    pub(crate) fn fail_terminal(&self, error: String) {
        log::warn!("{}: giving up: {}", self.stream_id, error);
        self.fail(error);
        self.terminal.store(true, Ordering::Release);
    }

    pub(crate) fn mark_connected(&self) {
        self.set_error(None);
        self.set_state(LifecycleState::Connected);
    }

    pub(crate) fn begin_attempt(&self) -> u32 {
        self.connect_attempts.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Count one processed frame and return its frame number.
    pub(crate) fn record_frame(&self) -> u64 {
        self.frame_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn frame_count(&self) -> u64 {
        self.frame_count.load(Ordering::Acquire)
    }

    pub(crate) fn set_fps(&self, fps: f64) {
        self.fps_bits.store(fps.to_bits(), Ordering::Relaxed);
    }

    pub(crate) fn fps(&self) -> f64 {
        f64::from_bits(self.fps_bits.load(Ordering::Relaxed))
    }

    pub(crate) fn set_last_detection(&self, at_ms: i64) {
        self.last_detection_ms.store(at_ms, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> SessionSnapshot {
        let last_detection = self.last_detection_ms.load(Ordering::Relaxed);
        SessionSnapshot {
            stream_id: self.stream_id.clone(),
            app_id: self.app_id.clone(),
            uri: self.uri.to_string(),
            settings: self.settings,
            state: self.state(),
            last_error: self.last_error(),
            current_fps: self.fps(),
            frame_count: self.frame_count(),
            created_at_ms: self.created_at_ms,
            terminal: self.is_terminal(),
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
            last_detection_ms: (last_detection != NO_DETECTION).then_some(last_detection),
        }
    }
}
