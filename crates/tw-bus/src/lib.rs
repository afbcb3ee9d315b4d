//! Typed publish/subscribe event bus for the Tradewind runtime.
//!
//! Topics are a closed set, each carrying exactly one payload type. Delivery
//! is at-least-once, per-topic FIFO, with a dedicated bounded queue and worker
//! task per subscriber. `market_data` is lossy under backpressure (drop
//! oldest); every other topic blocks the publisher with a bounded timeout.

pub mod bus;
pub mod queue;

pub use bus::{BusConfig, BusError, BusResult, BusStats, ChannelForwarder, EventBus, EventHandler};
pub use queue::{LossyPush, SubscriberQueue};
