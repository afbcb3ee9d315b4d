//! Bounded per-subscriber delivery queue.
//!
//! One queue exists per (topic, subscriber) pair. A single worker task drains
//! it, which is what serializes handler execution per subscriber.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;
use tokio::time::{Duration, Instant};

use tw_types::events::Event;

/// Outcome of a lossy push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossyPush {
    Enqueued,
    /// The oldest queued event was discarded to make room.
    DroppedOldest,
}

#[derive(Debug)]
pub struct SubscriberQueue {
    items: Mutex<VecDeque<Event>>,
    capacity: usize,
    item_ready: Notify,
    space_ready: Notify,
    closed: AtomicBool,
}

impl SubscriberQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            capacity,
            item_ready: Notify::new(),
            space_ready: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Lossless push: waits for space, bounded by `timeout`. Returns `false`
    /// on timeout (event not enqueued).
    pub async fn push_blocking(&self, event: Event, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut event = Some(event);
        loop {
            {
                let mut items = self.items.lock();
                if self.closed.load(Ordering::Acquire) {
                    return false;
                }
                if items.len() < self.capacity {
                    if let Some(e) = event.take() {
                        items.push_back(e);
                    }
                    drop(items);
                    self.item_ready.notify_one();
                    return true;
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let _ = tokio::time::timeout(remaining, self.space_ready.notified()).await;
        }
    }

    /// Lossy push: never waits. When full, drops the oldest queued event.
    pub fn push_lossy(&self, event: Event) -> LossyPush {
        let dropped;
        {
            let mut items = self.items.lock();
            if self.closed.load(Ordering::Acquire) {
                return LossyPush::Enqueued;
            }
            dropped = if items.len() >= self.capacity {
                items.pop_front();
                true
            } else {
                false
            };
            items.push_back(event);
        }
        self.item_ready.notify_one();
        if dropped {
            LossyPush::DroppedOldest
        } else {
            LossyPush::Enqueued
        }
    }

    /// Worker side: next event, or `None` once the queue is closed and empty.
    pub async fn pop(&self) -> Option<Event> {
        loop {
            {
                let mut items = self.items.lock();
                if let Some(event) = items.pop_front() {
                    drop(items);
                    self.space_ready.notify_one();
                    return Some(event);
                }
                if self.closed.load(Ordering::Acquire) {
                    return None;
                }
            }
            self.item_ready.notified().await;
        }
    }

    /// Close the queue. The worker finishes what is already queued and exits.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.item_ready.notify_one();
        self.space_ready.notify_one();
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tw_types::events::{AlertKind, EventPayload, SystemAlert};

    fn event(sequence: u64) -> Event {
        Event::new(
            sequence,
            EventPayload::SystemAlert(SystemAlert::warning(AlertKind::ProviderExhausted)),
        )
    }

    #[tokio::test]
    async fn push_pop_fifo() {
        let q = SubscriberQueue::new(8);
        assert!(q.push_blocking(event(1), Duration::from_millis(10)).await);
        assert!(q.push_blocking(event(2), Duration::from_millis(10)).await);
        assert_eq!(q.pop().await.unwrap().sequence, 1);
        assert_eq!(q.pop().await.unwrap().sequence, 2);
    }

    #[tokio::test]
    async fn blocking_push_times_out_when_full() {
        let q = SubscriberQueue::new(1);
        assert!(q.push_blocking(event(1), Duration::from_millis(10)).await);
        assert!(!q.push_blocking(event(2), Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn lossy_push_drops_oldest() {
        let q = SubscriberQueue::new(2);
        assert_eq!(q.push_lossy(event(1)), LossyPush::Enqueued);
        assert_eq!(q.push_lossy(event(2)), LossyPush::Enqueued);
        assert_eq!(q.push_lossy(event(3)), LossyPush::DroppedOldest);
        // 1 was discarded; 2 and 3 remain in order.
        assert_eq!(q.pop().await.unwrap().sequence, 2);
        assert_eq!(q.pop().await.unwrap().sequence, 3);
    }

    #[tokio::test]
    async fn pop_returns_none_after_close_and_drain() {
        let q = SubscriberQueue::new(4);
        q.push_lossy(event(1));
        q.close();
        assert!(q.pop().await.is_some());
        assert!(q.pop().await.is_none());
    }

    #[tokio::test]
    async fn blocked_publisher_wakes_on_pop() {
        let q = std::sync::Arc::new(SubscriberQueue::new(1));
        q.push_lossy(event(1));

        let q2 = q.clone();
        let pusher = tokio::spawn(async move {
            q2.push_blocking(event(2), Duration::from_secs(5)).await
        });

        tokio::task::yield_now().await;
        assert_eq!(q.pop().await.unwrap().sequence, 1);
        assert!(pusher.await.unwrap());
        assert_eq!(q.pop().await.unwrap().sequence, 2);
    }
}
