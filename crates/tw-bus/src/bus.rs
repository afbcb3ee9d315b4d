//! The event bus: typed topics, per-topic FIFO, per-subscriber workers.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, Mutex};
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

use tw_types::events::{AlertKind, Event, EventPayload, SystemAlert, Topic};

use crate::queue::{LossyPush, SubscriberQueue};

/// A subscriber's event callback. Two events are never delivered concurrently
/// to the same subscriber; delivery is at-least-once, so implementations must
/// be idempotent.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: Event) -> Result<(), String>;
}

/// Forwards every delivered event into an unbounded channel. The standard
/// test collector, also handy for bridging bus topics into component inboxes.
pub struct ChannelForwarder {
    tx: mpsc::UnboundedSender<Event>,
}

impl ChannelForwarder {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EventHandler for ChannelForwarder {
    async fn handle(&self, event: Event) -> Result<(), String> {
        self.tx.send(event).map_err(|e| e.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("backpressure timeout on {topic} for subscriber {subscriber}")]
    BackpressureTimeout { topic: Topic, subscriber: String },

    #[error("subscriber {name} already registered on {topic}")]
    DuplicateSubscriber { topic: Topic, name: String },

    #[error("no subscriber named {name} on {topic}")]
    UnknownSubscriber { topic: Topic, name: String },
}

pub type BusResult<T> = Result<T, BusError>;

/// Bus tuning knobs.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Depth of each (topic, subscriber) queue.
    pub queue_depth: usize,
    /// How long a lossless publish waits for queue space before failing.
    pub backpressure_timeout: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            queue_depth: 1024,
            backpressure_timeout: Duration::from_secs(5),
        }
    }
}

/// Aggregate delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusStats {
    pub published: u64,
    pub dropped: u64,
    pub handler_failures: u64,
}

#[derive(Debug, Default)]
struct StatCells {
    published: AtomicU64,
    dropped: AtomicU64,
    handler_failures: AtomicU64,
}

struct Subscription {
    name: String,
    queue: Arc<SubscriberQueue>,
}

struct TopicState {
    sequence: AtomicU64,
    /// Serializes sequence assignment and enqueue so per-topic FIFO holds
    /// under concurrent publishers.
    publish_gate: Mutex<()>,
    subscribers: RwLock<Vec<Arc<Subscription>>>,
}

impl TopicState {
    fn new() -> Self {
        Self {
            sequence: AtomicU64::new(0),
            publish_gate: Mutex::new(()),
            subscribers: RwLock::new(Vec::new()),
        }
    }
}

struct BusInner {
    config: BusConfig,
    topics: HashMap<Topic, TopicState>,
    stats: StatCells,
}

/// Typed pub/sub bus over the closed [`Topic`] set.
///
/// Guarantees: per-topic FIFO with strictly increasing sequence numbers;
/// per-subscriber serialized delivery; `market_data` drops oldest under
/// backpressure while every other topic blocks the publisher (bounded).
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new(config: BusConfig) -> Self {
        let topics = Topic::ALL
            .iter()
            .map(|t| (*t, TopicState::new()))
            .collect();
        Self {
            inner: Arc::new(BusInner {
                config,
                topics,
                stats: StatCells::default(),
            }),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(BusConfig::default())
    }

    /// Publish a payload on its topic. Returns the assigned sequence number.
    ///
    /// At-least-once: if a lossless subscriber times out mid-fanout, earlier
    /// subscribers have already received the event and the error reports the
    /// one that did not.
    pub async fn publish(&self, payload: EventPayload) -> BusResult<u64> {
        publish_inner(&self.inner, payload).await
    }

    /// Register a handler. Events published after registration are delivered
    /// in order on a dedicated worker task.
    pub fn subscribe(
        &self,
        topic: Topic,
        name: &str,
        handler: Arc<dyn EventHandler>,
    ) -> BusResult<()> {
        let state = self.topic_state(topic);
        let mut subscribers = state.subscribers.write();
        if subscribers.iter().any(|s| s.name == name) {
            return Err(BusError::DuplicateSubscriber {
                topic,
                name: name.to_string(),
            });
        }

        let queue = Arc::new(SubscriberQueue::new(self.inner.config.queue_depth));
        subscribers.push(Arc::new(Subscription {
            name: name.to_string(),
            queue: queue.clone(),
        }));
        drop(subscribers);

        let weak = Arc::downgrade(&self.inner);
        let subscriber = name.to_string();
        tokio::spawn(async move {
            run_worker(weak, topic, subscriber, queue, handler).await;
        });

        debug!(topic = %topic, subscriber = %name, "subscribed");
        Ok(())
    }

    /// Remove a subscriber. Its in-flight delivery completes; queued events
    /// are still drained by the worker before it exits.
    pub fn unsubscribe(&self, topic: Topic, name: &str) -> BusResult<()> {
        let state = self.topic_state(topic);
        let mut subscribers = state.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|s| {
            if s.name == name {
                s.queue.close();
                false
            } else {
                true
            }
        });
        if subscribers.len() == before {
            return Err(BusError::UnknownSubscriber {
                topic,
                name: name.to_string(),
            });
        }
        debug!(topic = %topic, subscriber = %name, "unsubscribed");
        Ok(())
    }

    /// Wait until every subscriber queue is empty, bounded by `timeout`.
    /// Returns `false` if queues still held events at the deadline.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let all_empty = self.inner.topics.values().all(|state| {
                state
                    .subscribers
                    .read()
                    .iter()
                    .all(|s| s.queue.is_empty())
            });
            if all_empty {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Close every subscriber queue; workers finish queued events and exit.
    pub fn shutdown(&self) {
        for state in self.inner.topics.values() {
            for sub in state.subscribers.read().iter() {
                sub.queue.close();
            }
        }
    }

    /// Last assigned sequence number for a topic.
    pub fn sequence(&self, topic: Topic) -> u64 {
        self.topic_state(topic).sequence.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> BusStats {
        let s = &self.inner.stats;
        BusStats {
            published: s.published.load(Ordering::Relaxed),
            dropped: s.dropped.load(Ordering::Relaxed),
            handler_failures: s.handler_failures.load(Ordering::Relaxed),
        }
    }

    fn topic_state(&self, topic: Topic) -> &TopicState {
        // Every topic is inserted at construction.
        &self.inner.topics[&topic]
    }
}

async fn publish_inner(inner: &Arc<BusInner>, payload: EventPayload) -> BusResult<u64> {
    let topic = payload.topic();
    let state = &inner.topics[&topic];

    let gate = state.publish_gate.lock().await;
    let sequence = state.sequence.fetch_add(1, Ordering::Relaxed) + 1;
    let event = Event::new(sequence, payload);
    let subscribers: Vec<Arc<Subscription>> = state.subscribers.read().clone();

    let mut lossy_drops: Vec<String> = Vec::new();
    for sub in &subscribers {
        if topic.is_lossy() {
            if sub.queue.push_lossy(event.clone()) == LossyPush::DroppedOldest {
                inner.stats.dropped.fetch_add(1, Ordering::Relaxed);
                lossy_drops.push(sub.name.clone());
            }
        } else {
            let delivered = sub
                .queue
                .push_blocking(event.clone(), inner.config.backpressure_timeout)
                .await;
            if !delivered {
                inner.stats.dropped.fetch_add(1, Ordering::Relaxed);
                if topic == Topic::SystemAlert {
                    // The alert path never fails the publisher and never
                    // recurses into more alerts.
                    warn!(subscriber = %sub.name, "system_alert delivery timed out; dropped");
                    continue;
                }
                return Err(BusError::BackpressureTimeout {
                    topic,
                    subscriber: sub.name.clone(),
                });
            }
        }
    }
    drop(gate);

    inner.stats.published.fetch_add(1, Ordering::Relaxed);

    for subscriber in lossy_drops {
        warn!(topic = %topic, subscriber = %subscriber, "queue full; dropped oldest event");
        let alert = SystemAlert::warning(AlertKind::BackpressureDrop {
            topic: topic.to_string(),
            subscriber,
        });
        // Boxed to break async recursion; failures here are already counted.
        let _ = Box::pin(publish_inner(inner, EventPayload::SystemAlert(alert))).await;
    }

    Ok(sequence)
}

async fn run_worker(
    bus: Weak<BusInner>,
    topic: Topic,
    subscriber: String,
    queue: Arc<SubscriberQueue>,
    handler: Arc<dyn EventHandler>,
) {
    while let Some(event) = queue.pop().await {
        if let Err(error) = handler.handle(event).await {
            warn!(
                topic = %topic,
                subscriber = %subscriber,
                error = %error,
                "event handler failed"
            );
            if let Some(inner) = bus.upgrade() {
                inner.stats.handler_failures.fetch_add(1, Ordering::Relaxed);
                // A failure report about system_alert delivery would loop.
                if topic != Topic::SystemAlert {
                    let alert = SystemAlert::warning(AlertKind::HandlerFailure {
                        topic: topic.to_string(),
                        subscriber: subscriber.clone(),
                        error,
                    });
                    let _ =
                        Box::pin(publish_inner(&inner, EventPayload::SystemAlert(alert))).await;
                }
            }
        }
    }
    debug!(topic = %topic, subscriber = %subscriber, "worker exited");
}
