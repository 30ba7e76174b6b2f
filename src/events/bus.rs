use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock, Weak};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};

use super::topic::{is_valid_token, topic_matches, validate_pattern, DEFAULT_TOPIC_PREFIX};
use super::DetectionEvent;

pub const DEFAULT_BUFFER_CAPACITY: usize = 64;

/// An event as seen by one subscriber. The event body is shared between all
/// subscribers that received it.
#[derive(Clone, Debug)]
pub struct Delivery {
    pub topic: String,
    pub event: Arc<DetectionEvent>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BusStats {
    pub published: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub subscribers: usize,
}

/// In-process fan-out of detection events to topic subscribers.
///
/// Every subscriber owns a bounded queue. When a queue is full the oldest
/// queued event is discarded, so a slow or absent reader never holds up the
/// publishing worker.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    prefix: String,
    capacity: usize,
    next_id: AtomicU64,
    subscribers: RwLock<Vec<Arc<Subscriber>>>,
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

struct Subscriber {
    id: u64,
    pattern: String,
    queue: Mutex<VecDeque<Delivery>>,
    ready: Condvar,
    dropped: AtomicU64,
}

impl Subscriber {
    fn queue(&self) -> MutexGuard<'_, VecDeque<Delivery>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl EventBus {
    pub fn new(prefix: &str, capacity: usize) -> Result<Self> {
        if !is_valid_token(prefix) {
            return Err(anyhow!("invalid topic prefix '{}'", prefix));
        }
        if capacity == 0 {
            return Err(anyhow!("event buffer capacity must be non-zero"));
        }
        Ok(Self::unchecked(prefix, capacity))
    }

    fn unchecked(prefix: &str, capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                prefix: prefix.to_string(),
                capacity,
                next_id: AtomicU64::new(1),
                subscribers: RwLock::new(Vec::new()),
                published: AtomicU64::new(0),
                delivered: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.inner.prefix
    }

    /// Topic carrying the events of one stream.
    pub fn topic_for(&self, stream_id: &str) -> String {
        format!("{}.{}", self.inner.prefix, stream_id)
    }

    /// Pattern matching every stream's topic.
    pub fn wildcard(&self) -> String {
        format!("{}.>", self.inner.prefix)
    }

    /// Publish an event on its stream topic. Returns the number of
    /// subscribers it was queued for.
    pub fn publish(&self, event: DetectionEvent) -> usize {
        let topic = self.topic_for(&event.stream_id);
        let event = Arc::new(event);
        self.inner.published.fetch_add(1, Ordering::Relaxed);

        let subscribers = self
            .inner
            .subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner());
        let mut reached = 0;
        for sub in subscribers.iter() {
            if !topic_matches(&sub.pattern, &topic) {
                continue;
            }
            {
                let mut queue = sub.queue();
                if queue.len() >= self.inner.capacity {
                    queue.pop_front();
                    sub.dropped.fetch_add(1, Ordering::Relaxed);
                    self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                }
                queue.push_back(Delivery {
                    topic: topic.clone(),
                    event: Arc::clone(&event),
                });
            }
            sub.ready.notify_one();
            reached += 1;
        }
        self.inner
            .delivered
            .fetch_add(reached as u64, Ordering::Relaxed);
        if reached == 0 {
            log::trace!("no subscribers for {}", topic);
        }
        reached
    }

    /// Subscribe to a topic pattern (`stream.cam1`, `stream.*`, `stream.>`).
    pub fn subscribe(&self, pattern: &str) -> Result<Subscription> {
        validate_pattern(pattern)?;
        let sub = Arc::new(Subscriber {
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            pattern: pattern.to_string(),
            queue: Mutex::new(VecDeque::with_capacity(self.inner.capacity)),
            ready: Condvar::new(),
            dropped: AtomicU64::new(0),
        });
        self.inner
            .subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::clone(&sub));
        log::debug!("subscriber {} registered for {}", sub.id, pattern);
        Ok(Subscription {
            bus: Arc::downgrade(&self.inner),
            sub,
        })
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            published: self.inner.published.load(Ordering::Relaxed),
            delivered: self.inner.delivered.load(Ordering::Relaxed),
            dropped: self.inner.dropped.load(Ordering::Relaxed),
            subscribers: self
                .inner
                .subscribers
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .len(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::unchecked(DEFAULT_TOPIC_PREFIX, DEFAULT_BUFFER_CAPACITY)
    }
}

/// Receiving end of a bus subscription. Dropping it unsubscribes.
pub struct Subscription {
    bus: Weak<BusInner>,
    sub: Arc<Subscriber>,
}

impl Subscription {
    pub fn pattern(&self) -> &str {
        &self.sub.pattern
    }

    pub fn try_recv(&self) -> Option<Delivery> {
        self.sub.queue().pop_front()
    }

    /// Wait up to `timeout` for the next event.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Delivery> {
        let deadline = Instant::now() + timeout;
        let mut queue = self.sub.queue();
        loop {
            if let Some(delivery) = queue.pop_front() {
                return Some(delivery);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            queue = match self.sub.ready.wait_timeout(queue, remaining) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Events discarded from this subscriber's queue on overflow.
    pub fn dropped(&self) -> u64 {
        self.sub.dropped.load(Ordering::Relaxed)
    }

    pub fn pending(&self) -> usize {
        self.sub.queue().len()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            let mut subscribers = bus.subscribers.write().unwrap_or_else(|e| e.into_inner());
            subscribers.retain(|s| s.id != self.sub.id);
        }
    }
}
