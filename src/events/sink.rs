use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Result};

use super::bus::EventBus;
use super::DetectionEvent;

const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// External destination for bus events (e.g. an MQTT broker).
pub trait EventSink: Send {
    fn name(&self) -> &str;

    fn send(&mut self, topic: &str, event: &DetectionEvent) -> Result<()>;

    /// Called once when the forwarder stops.
    fn close(&mut self) {}
}

/// Running forwarder thread.
pub struct ForwarderHandle {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ForwarderHandle {
    pub fn stop(mut self) -> Result<()> {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            handle
                .join()
                .map_err(|_| anyhow!("event forwarder thread panicked"))?;
        }
        Ok(())
    }
}

impl Drop for ForwarderHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

/// Drain a subscription on `pattern` into `sink` on a dedicated thread.
///
/// Sink failures are logged and the event is discarded; they never reach
/// the publishing sessions.
pub fn spawn_forwarder<S>(bus: &EventBus, pattern: &str, mut sink: S) -> Result<ForwarderHandle>
where
    S: EventSink + 'static,
{
    let subscription = bus.subscribe(pattern)?;
    let stop = Arc::new(AtomicBool::new(false));
    let thread_stop = Arc::clone(&stop);
    let handle = std::thread::Builder::new()
        .name(format!("forward-{}", sink.name()))
        .spawn(move || {
            log::info!(
                "forwarding {} to {}",
                subscription.pattern(),
                sink.name()
            );
            let mut failures: u64 = 0;
            while !thread_stop.load(Ordering::SeqCst) {
                let Some(delivery) = subscription.recv_timeout(POLL_INTERVAL) else {
                    continue;
                };
                if let Err(err) = sink.send(&delivery.topic, &delivery.event) {
                    failures += 1;
                    log::warn!(
                        "{}: failed to forward {} (failure #{}): {}",
                        sink.name(),
                        delivery.topic,
                        failures,
                        err
                    );
                }
            }
            let unsent = subscription.pending();
            sink.close();
            log::info!(
                "forwarder to {} stopped ({} events left unsent)",
                sink.name(),
                unsent
            );
        })?;
    Ok(ForwarderHandle {
        stop,
        handle: Some(handle),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingSink {
        seen: Arc<Mutex<Vec<String>>>,
        fail_every: u64,
        calls: u64,
    }

    impl EventSink for RecordingSink {
        fn name(&self) -> &str {
            "recording"
        }

        fn send(&mut self, topic: &str, event: &DetectionEvent) -> Result<()> {
            self.calls += 1;
            if self.fail_every > 0 && self.calls % self.fail_every == 0 {
                return Err(anyhow!("broker unavailable"));
            }
            self.seen
                .lock()
                .unwrap()
                .push(format!("{}#{}", topic, event.frame_number));
            Ok(())
        }
    }

    fn event(frame_number: u64) -> DetectionEvent {
        DetectionEvent {
            stream_id: "cam1".into(),
            timestamp: 0,
            frame_number,
            fps: 0.0,
            width: 8,
            height: 8,
            detections: Vec::new(),
            image_base64: None,
        }
    }

    fn wait_for(seen: &Arc<Mutex<Vec<String>>>, len: usize) {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while seen.lock().unwrap().len() < len && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn forwards_matching_events_in_order() -> Result<()> {
        let bus = EventBus::new("stream", 16)?;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let forwarder = spawn_forwarder(
            &bus,
            "stream.>",
            RecordingSink {
                seen: Arc::clone(&seen),
                fail_every: 0,
                calls: 0,
            },
        )?;
        for n in 1..=3 {
            bus.publish(event(n));
        }
        wait_for(&seen, 3);
        forwarder.stop()?;
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["stream.cam1#1", "stream.cam1#2", "stream.cam1#3"]
        );
        assert_eq!(bus.stats().subscribers, 0);
        Ok(())
    }

    #[test]
    fn sink_failures_do_not_stop_forwarding() -> Result<()> {
        let bus = EventBus::new("stream", 16)?;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let forwarder = spawn_forwarder(
            &bus,
            "stream.cam1",
            RecordingSink {
                seen: Arc::clone(&seen),
                fail_every: 2,
                calls: 0,
            },
        )?;
        for n in 1..=4 {
            bus.publish(event(n));
        }
        wait_for(&seen, 2);
        forwarder.stop()?;
        assert_eq!(*seen.lock().unwrap(), vec!["stream.cam1#1", "stream.cam1#3"]);
        Ok(())
    }
}
