//! ---
//! certmgr_section: "02-messaging-ipc-data-model"
//! certmgr_subsection: "module"
//! certmgr_type: "source"
//! certmgr_scope: "code"
//! certmgr_description: "Message envelopes and the pub/sub bus abstraction."
//! certmgr_version: "v0.1.0"
//! certmgr_owner: "platform"
//! ---
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{MessagingError, Result};

type ReleaseFn = Box<dyn FnOnce() -> Result<()> + Send>;

/// Publish/subscribe transport used by the controller.
///
/// Delivery is at-least-once with per-topic fan-out; consumers must tolerate
/// duplicates and reordering.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish raw bytes to every current subscriber of `topic`.
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()>;
    /// Open a subscription delivering every payload published on `topic`.
    async fn subscribe(&self, topic: &str) -> Result<Subscription>;
    /// Human-readable transport name for logging/metrics.
    fn name(&self) -> &'static str;
}

/// Live subscription to a single topic.
///
/// The subscription is released exactly once: either through
/// [`Subscription::unsubscribe`] or when the value is dropped.
pub struct Subscription {
    topic: String,
    receiver: mpsc::Receiver<Bytes>,
    release: Option<ReleaseFn>,
}

impl Subscription {
    /// Wrap a delivery channel together with the hook that detaches it from the bus.
    pub fn new(
        topic: impl Into<String>,
        receiver: mpsc::Receiver<Bytes>,
        release: impl FnOnce() -> Result<()> + Send + 'static,
    ) -> Self {
        Self {
            topic: topic.into(),
            receiver,
            release: Some(Box::new(release)),
        }
    }

    /// Topic this subscription is attached to.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Wait for the next payload. Returns `None` once the bus closed the channel.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.receiver.recv().await
    }

    /// Detach from the bus, surfacing any error raised while doing so.
    pub fn unsubscribe(mut self) -> Result<()> {
        self.receiver.close();
        match self.release.take() {
            Some(release) => release(),
            None => Ok(()),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            if let Err(err) = release() {
                warn!(topic = %self.topic, error = %err, "failed to release subscription");
            }
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("released", &self.release.is_none())
            .finish()
    }
}

struct Subscriber {
    id: u64,
    sender: mpsc::Sender<Bytes>,
}

struct BusInner {
    capacity: usize,
    next_id: AtomicU64,
    topics: Mutex<HashMap<String, Vec<Subscriber>>>,
}

impl BusInner {
    fn remove(&self, topic: &str, id: u64) {
        let mut topics = self.topics.lock();
        if let Some(subscribers) = topics.get_mut(topic) {
            subscribers.retain(|sub| sub.id != id);
            if subscribers.is_empty() {
                topics.remove(topic);
            }
        }
    }
}

/// In-process bus with per-topic fan-out over bounded channels.
///
/// Publishing never blocks: a subscriber whose buffer is full misses the
/// message, as with a broker dropping a slow consumer.
#[derive(Clone)]
pub struct InMemoryBus {
    inner: Arc<BusInner>,
}

impl InMemoryBus {
    /// Default per-subscription buffer.
    pub const DEFAULT_CAPACITY: usize = 64;

    /// Create a bus with the default per-subscription buffer.
    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    /// Create a bus buffering up to `capacity` messages per subscription.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                capacity: capacity.max(1),
                next_id: AtomicU64::new(0),
                topics: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Number of live subscriptions on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner
            .topics
            .lock()
            .get(topic)
            .map_or(0, |subscribers| subscribers.len())
    }

    fn open(&self, topic: &str) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.inner.capacity);
        self.inner
            .topics
            .lock()
            .entry(topic.to_owned())
            .or_default()
            .push(Subscriber { id, sender });
        debug!(topic, subscription = id, "subscription opened");

        let weak: Weak<BusInner> = Arc::downgrade(&self.inner);
        let owned_topic = topic.to_owned();
        Subscription::new(topic, receiver, move || {
            if let Some(inner) = weak.upgrade() {
                inner.remove(&owned_topic, id);
                debug!(topic = %owned_topic, subscription = id, "subscription released");
            }
            Ok(())
        })
    }

    fn fan_out(&self, topic: &str, payload: Bytes) -> usize {
        let mut delivered = 0;
        let mut closed = Vec::new();
        {
            let topics = self.inner.topics.lock();
            let Some(subscribers) = topics.get(topic) else {
                debug!(topic, "no subscribers; message dropped");
                return 0;
            };
            for subscriber in subscribers {
                match subscriber.sender.try_send(payload.clone()) {
                    Ok(()) => delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(topic, subscription = subscriber.id, "subscriber buffer full; message dropped");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => closed.push(subscriber.id),
                }
            }
        }
        for id in closed {
            self.inner.remove(topic, id);
        }
        delivered
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for InMemoryBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let topics = self.inner.topics.lock();
        f.debug_struct("InMemoryBus")
            .field("capacity", &self.inner.capacity)
            .field("topics", &topics.len())
            .finish()
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        if topic.is_empty() {
            return Err(MessagingError::Unavailable("empty topic".into()));
        }
        let delivered = self.fan_out(topic, payload);
        debug!(topic, delivered, "message published");
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        if topic.is_empty() {
            return Err(MessagingError::Unavailable("empty topic".into()));
        }
        Ok(self.open(topic))
    }

    fn name(&self) -> &'static str {
        "in_memory"
    }
}
