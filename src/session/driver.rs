//! Per-session connection driver.
//!
//! One worker thread per session walks the lifecycle
//! `NG -> READY -> CONNECTING -> CONNECTED`, falls back to `NG` on failure and
//! retries with bounded backoff. While connected it runs the detector on
//! every frame and publishes one event per frame, in frame order.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::detect::DetectorBackend;
use crate::error::DriverError;
use crate::events::{DetectionEvent, EventBus};
use crate::frame::Frame;
use crate::ingest::{FrameSource, SourceFactory};

use super::state::{LifecycleState, SessionShared};

pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_millis(5_000);
pub const DEFAULT_FRAME_TIMEOUT: Duration = Duration::from_millis(2_000);
pub const DEFAULT_FPS_WINDOW: Duration = Duration::from_millis(1_000);
pub const DEFAULT_MAX_CONSECUTIVE_READ_ERRORS: u32 = 5;

/// Bounded linear backoff between dial attempts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Failed dials since the last successful connect before giving up.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_millis(3_000),
            max_delay: Duration::from_millis(30_000),
        }
    }
}

impl RetryPolicy {
    /// `base_delay * failures`, capped at `max_delay`.
    pub fn nominal_delay(&self, failures: u32) -> Duration {
        self.base_delay
            .saturating_mul(failures.max(1))
            .min(self.max_delay)
    }

    /// Nominal delay plus up to 10% random jitter.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let nominal = self.nominal_delay(failures);
        let jitter_ms = (nominal.as_millis() / 10) as u64;
        if jitter_ms == 0 {
            return nominal;
        }
        nominal + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

#[derive(Clone, Debug)]
pub struct DriverSettings {
    pub dial_timeout: Duration,
    pub frame_timeout: Duration,
    pub retry: RetryPolicy,
    pub fps_window: Duration,
    /// Decode errors or frame timeouts in a row tolerated while connected.
    pub max_consecutive_read_errors: u32,
    /// Detector backend name in the backend registry.
    pub backend: String,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            frame_timeout: DEFAULT_FRAME_TIMEOUT,
            retry: RetryPolicy::default(),
            fps_window: DEFAULT_FPS_WINDOW,
            max_consecutive_read_errors: DEFAULT_MAX_CONSECUTIVE_READ_ERRORS,
            backend: "stub".to_string(),
        }
    }
}

/// Rolling frame rate over a fixed window.
pub(crate) struct FpsMeter {
    window: Duration,
    stamps: VecDeque<Instant>,
}

impl FpsMeter {
    pub(crate) fn new(window: Duration) -> Self {
        Self {
            window,
            stamps: VecDeque::new(),
        }
    }

    pub(crate) fn reset(&mut self) {
        self.stamps.clear();
    }

    /// Record a frame at `now` and return the current rate.
    ///
    /// The newest stamp older than the window is kept as the lower bound of
    /// the span, so streams slower than one frame per window still report a
    /// rate.
    pub(crate) fn tick(&mut self, now: Instant) -> f64 {
        self.stamps.push_back(now);
        while self
            .stamps
            .get(1)
            .is_some_and(|&next| now.duration_since(next) >= self.window)
        {
            self.stamps.pop_front();
        }
        let Some(&oldest) = self.stamps.front() else {
            return 0.0;
        };
        let span = now.duration_since(oldest).as_secs_f64();
        if self.stamps.len() < 2 || span <= 0.0 {
            return 0.0;
        }
        (self.stamps.len() - 1) as f64 / span
    }
}

/// How a connected streaming phase ended.
enum StreamEnd {
    Cancelled,
    Failed(DriverError),
}

pub(crate) struct Worker {
    shared: Arc<SessionShared>,
    sources: Arc<dyn SourceFactory>,
    backend: Box<dyn DetectorBackend>,
    bus: EventBus,
    settings: DriverSettings,
    fps: FpsMeter,
}

impl Worker {
    pub(crate) fn new(
        shared: Arc<SessionShared>,
        sources: Arc<dyn SourceFactory>,
        backend: Box<dyn DetectorBackend>,
        bus: EventBus,
        settings: DriverSettings,
    ) -> Self {
        let fps = FpsMeter::new(settings.fps_window);
        Self {
            shared,
            sources,
            backend,
            bus,
            settings,
            fps,
        }
    }

    pub(crate) fn run(mut self) {
        let id = self.shared.stream_id.clone();
        log::info!(
            "{}: worker started ({} via {})",
            id,
            self.shared.uri,
            self.backend.name()
        );
        if let Err(err) = self.backend.warm_up() {
            self.shared
                .fail_terminal(format!("detector warm-up failed: {:#}", err));
            return;
        }

        let mut failures: u32 = 0;
        while !self.shared.cancel.is_cancelled() {
            let attempt = self.shared.begin_attempt();
            self.shared.set_state(LifecycleState::Ready);
            log::debug!("{}: dial attempt {}", id, attempt);

            let err = match self.connect() {
                Ok((source, first)) => {
                    self.shared.mark_connected();
                    match self.stream(source, first) {
                        StreamEnd::Cancelled => break,
                        StreamEnd::Failed(err) if err.is_terminal() => {
                            self.shared.fail_terminal(err.to_string());
                            break;
                        }
                        StreamEnd::Failed(err) => {
                            log::warn!("{}: stream lost: {}", id, err);
                            self.shared.fail(err.to_string());
                            // A drop starts a fresh retry cycle.
                            failures = 0;
                            continue_after_backoff(&self.shared, &self.settings.retry, 1);
                            continue;
                        }
                    }
                }
                Err(err) => err,
            };

            if err.is_terminal() {
                self.shared.fail_terminal(err.to_string());
                break;
            }
            failures += 1;
            log::warn!(
                "{}: connect failed ({}/{}): {}",
                id,
                failures,
                self.settings.retry.max_attempts,
                err
            );
            if failures >= self.settings.retry.max_attempts {
                self.shared.fail_terminal(format!(
                    "connection attempts exhausted after {} tries: {}",
                    failures, err
                ));
                break;
            }
            self.shared.fail(err.to_string());
            continue_after_backoff(&self.shared, &self.settings.retry, failures);
        }
        log::info!(
            "{}: worker stopped after {} frames",
            id,
            self.shared.frame_count()
        );
    }

    /// Open the source while `READY`, dial it while `CONNECTING`, then wait
    /// for the first decoded frame.
    fn connect(&mut self) -> Result<(Box<dyn FrameSource>, Frame), DriverError> {
        let mut source = self.sources.open(&self.shared.uri, &self.shared.settings)?;
        self.shared.set_state(LifecycleState::Connecting);
        source.connect(self.settings.dial_timeout)?;
        let first = source.next_frame(self.settings.frame_timeout)?;
        Ok((source, first))
    }

    fn stream(&mut self, mut source: Box<dyn FrameSource>, first: Frame) -> StreamEnd {
        self.fps.reset();
        let mut consecutive_errors: u32 = 0;
        let mut next = Ok(first);
        loop {
            let result = next.and_then(|frame| self.process(frame));
            match result {
                Ok(()) => consecutive_errors = 0,
                Err(err) if err.is_retryable_in_place() => {
                    consecutive_errors += 1;
                    if consecutive_errors > self.settings.max_consecutive_read_errors {
                        return StreamEnd::Failed(DriverError::StreamClosed(format!(
                            "{} consecutive read errors, last: {}",
                            consecutive_errors, err
                        )));
                    }
                    log::debug!(
                        "{}: transient read error ({} in a row): {}",
                        self.shared.stream_id,
                        consecutive_errors,
                        err
                    );
                }
                Err(err) => return StreamEnd::Failed(err),
            }
            if self.shared.cancel.is_cancelled() {
                return StreamEnd::Cancelled;
            }
            next = source.next_frame(self.settings.frame_timeout);
        }
    }

    /// Detect, count and publish one frame.
    fn process(&mut self, frame: Frame) -> Result<(), DriverError> {
        let threshold = self.shared.settings.confidence_threshold;
        let detections: Vec<_> = self
            .backend
            .detect(&frame)
            .map_err(|e| DriverError::Decode(format!("detector {}: {:#}", self.backend.name(), e)))?
            .into_iter()
            .filter(|d| d.passes(threshold))
            .collect();

        let frame_number = self.shared.record_frame();
        let fps = self.fps.tick(Instant::now());
        self.shared.set_fps(fps);
        if !detections.is_empty() {
            self.shared.set_last_detection(frame.captured_at_ms);
        }

        let image_base64 = if self.shared.settings.publish_images {
            match frame.encode_jpeg_base64() {
                Ok(image) => Some(image),
                Err(err) => {
                    log::warn!("{}: image encode failed: {:#}", self.shared.stream_id, err);
                    None
                }
            }
        } else {
            None
        };

        self.bus.publish(DetectionEvent {
            stream_id: self.shared.stream_id.clone(),
            timestamp: frame.captured_at_ms,
            frame_number,
            fps,
            width: frame.width,
            height: frame.height,
            detections,
            image_base64,
        });
        Ok(())
    }
}

fn continue_after_backoff(shared: &SessionShared, retry: &RetryPolicy, failures: u32) {
    let delay = retry.delay_for(failures);
    log::debug!(
        "{}: retrying in {} ms",
        shared.stream_id,
        delay.as_millis()
    );
    // Cancellation is re-checked by the caller's loop condition.
    shared.cancel.wait_timeout(delay);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_linearly_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(3_000),
            max_delay: Duration::from_millis(10_000),
        };
        assert_eq!(policy.nominal_delay(0), Duration::from_millis(3_000));
        assert_eq!(policy.nominal_delay(1), Duration::from_millis(3_000));
        assert_eq!(policy.nominal_delay(3), Duration::from_millis(9_000));
        assert_eq!(policy.nominal_delay(4), Duration::from_millis(10_000));
        for failures in 1..6 {
            let nominal = policy.nominal_delay(failures);
            let delay = policy.delay_for(failures);
            assert!(delay >= nominal && delay <= nominal + nominal / 10);
        }
    }

    #[test]
    fn fps_meter_measures_window() {
        let mut meter = FpsMeter::new(Duration::from_secs(1));
        let start = Instant::now();
        assert_eq!(meter.tick(start), 0.0);
        let mut fps = 0.0;
        for i in 1..=10 {
            fps = meter.tick(start + Duration::from_millis(100 * i));
        }
        assert!((fps - 10.0).abs() < 0.01, "fps was {fps}");

        // After a gap only the previous frame bounds the span.
        let later = start + Duration::from_millis(5_000);
        assert!((meter.tick(later) - 0.25).abs() < 0.001);
        meter.reset();
        assert_eq!(meter.tick(later), 0.0);
    }

    #[test]
    fn fps_meter_reports_streams_slower_than_window() {
        let mut meter = FpsMeter::new(DEFAULT_FPS_WINDOW);
        let start = Instant::now();
        let readings: Vec<f64> = (0..5u64)
            .map(|i| meter.tick(start + Duration::from_millis(1_005 * i)))
            .collect();
        assert_eq!(readings[0], 0.0);
        for fps in &readings[1..] {
            assert!((fps - 1.0 / 1.005).abs() < 0.001, "readings {readings:?}");
        }

        let mut meter = FpsMeter::new(DEFAULT_FPS_WINDOW);
        meter.tick(start);
        let fps = meter.tick(start + Duration::from_millis(2_000));
        assert!((fps - 0.5).abs() < 0.001, "fps was {fps}");
    }
}
