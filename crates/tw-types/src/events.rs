use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::market::Bar;
use crate::orders::{Fill, Order, OrderId, OrderStatus};
use crate::portfolio::Portfolio;
use crate::signal::Signal;

/// The closed set of bus topics. Every topic carries exactly one payload
/// variant; there is no dynamic payload typing anywhere in the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    MarketData,
    Signal,
    OrderIntent,
    OrderStatus,
    Fill,
    PortfolioUpdate,
    StrategyLifecycle,
    SystemAlert,
}

impl Topic {
    pub const ALL: [Topic; 8] = [
        Topic::MarketData,
        Topic::Signal,
        Topic::OrderIntent,
        Topic::OrderStatus,
        Topic::Fill,
        Topic::PortfolioUpdate,
        Topic::StrategyLifecycle,
        Topic::SystemAlert,
    ];

    /// Market data is a lossy stream (drop-oldest under backpressure); every
    /// other topic is lossless (publisher blocks, bounded).
    pub fn is_lossy(&self) -> bool {
        matches!(self, Topic::MarketData)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Topic::MarketData => "market_data",
            Topic::Signal => "signal",
            Topic::OrderIntent => "order_intent",
            Topic::OrderStatus => "order_status",
            Topic::Fill => "fill",
            Topic::PortfolioUpdate => "portfolio_update",
            Topic::StrategyLifecycle => "strategy_lifecycle",
            Topic::SystemAlert => "system_alert",
        };
        write!(f, "{}", s)
    }
}

/// Broker-observed change of an order's status, republished on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderStatusUpdate {
    pub order_id: OrderId,
    pub status: OrderStatus,
    pub broker_name: Option<String>,
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl OrderStatusUpdate {
    pub fn new(order_id: OrderId, status: OrderStatus) -> Self {
        Self {
            order_id,
            status,
            broker_name: None,
            reason: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_reason(mut self, reason: &str) -> Self {
        self.reason = Some(reason.to_string());
        self
    }

    pub fn from_broker(mut self, broker: &str) -> Self {
        self.broker_name = Some(broker.to_string());
        self
    }
}

/// Lifecycle states a hosted strategy moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StrategyState {
    Created,
    Running,
    Paused,
    Error,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyLifecycleEvent {
    pub strategy_id: String,
    pub state: StrategyState,
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl StrategyLifecycleEvent {
    pub fn new(strategy_id: &str, state: StrategyState) -> Self {
        Self {
            strategy_id: strategy_id.to_string(),
            state,
            reason: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_reason(mut self, reason: &str) -> Self {
        self.reason = Some(reason.to_string());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
    Fatal,
}

/// Structured operational alerts emitted on `system_alert`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AlertKind {
    EmergencyStopEngaged { reason: String },
    EmergencyStopCleared,
    BrokerStateChanged { broker: String, healthy: bool },
    BackpressureDrop { topic: String, subscriber: String },
    HandlerFailure { topic: String, subscriber: String, error: String },
    OrderTimeout { order_id: OrderId },
    ProviderFailover { from: String, to: String },
    ProviderExhausted,
    RateLimitDrop { component: String, dropped: u64 },
    StrategyFailed { strategy_id: String, error: String },
    RepositoryDegraded { error: String },
    InvariantViolation { component: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemAlert {
    pub id: Uuid,
    pub severity: AlertSeverity,
    pub kind: AlertKind,
    pub timestamp: DateTime<Utc>,
}

impl SystemAlert {
    pub fn new(severity: AlertSeverity, kind: AlertKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            severity,
            kind,
            timestamp: Utc::now(),
        }
    }

    pub fn warning(kind: AlertKind) -> Self {
        Self::new(AlertSeverity::Warning, kind)
    }

    pub fn critical(kind: AlertKind) -> Self {
        Self::new(AlertSeverity::Critical, kind)
    }

    pub fn fatal(kind: AlertKind) -> Self {
        Self::new(AlertSeverity::Fatal, kind)
    }
}

/// Event payloads, one variant per topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventPayload {
    MarketData(Bar),
    Signal(Signal),
    /// A sized, risk-approved order about to be submitted.
    OrderIntent(Order),
    OrderStatus(OrderStatusUpdate),
    Fill(Fill),
    PortfolioUpdate(Portfolio),
    StrategyLifecycle(StrategyLifecycleEvent),
    SystemAlert(SystemAlert),
}

impl EventPayload {
    pub fn topic(&self) -> Topic {
        match self {
            EventPayload::MarketData(_) => Topic::MarketData,
            EventPayload::Signal(_) => Topic::Signal,
            EventPayload::OrderIntent(_) => Topic::OrderIntent,
            EventPayload::OrderStatus(_) => Topic::OrderStatus,
            EventPayload::Fill(_) => Topic::Fill,
            EventPayload::PortfolioUpdate(_) => Topic::PortfolioUpdate,
            EventPayload::StrategyLifecycle(_) => Topic::StrategyLifecycle,
            EventPayload::SystemAlert(_) => Topic::SystemAlert,
        }
    }
}

/// Envelope delivered to subscribers. `sequence` is monotonic per topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub topic: Topic,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(sequence: u64, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: payload.topic(),
            sequence,
            timestamp: Utc::now(),
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::Symbol;
    use crate::signal::{Signal, SignalSide};
    use rust_decimal_macros::dec;

    #[test]
    fn payload_topic_mapping() {
        let signal = Signal::new(
            "s1",
            Symbol::equity("AAPL"),
            SignalSide::Buy,
            dec!(0.9),
            dec!(100),
            Utc::now(),
        );
        assert_eq!(EventPayload::Signal(signal).topic(), Topic::Signal);

        let alert = SystemAlert::warning(AlertKind::ProviderExhausted);
        assert_eq!(EventPayload::SystemAlert(alert).topic(), Topic::SystemAlert);
    }

    #[test]
    fn only_market_data_is_lossy() {
        for topic in Topic::ALL {
            assert_eq!(topic.is_lossy(), topic == Topic::MarketData);
        }
    }

    #[test]
    fn envelope_carries_payload_topic() {
        let alert = SystemAlert::critical(AlertKind::EmergencyStopEngaged {
            reason: "test".into(),
        });
        let event = Event::new(7, EventPayload::SystemAlert(alert));
        assert_eq!(event.topic, Topic::SystemAlert);
        assert_eq!(event.sequence, 7);
    }

    #[test]
    fn alert_severity_orders() {
        assert!(AlertSeverity::Info < AlertSeverity::Warning);
        assert!(AlertSeverity::Critical < AlertSeverity::Fatal);
    }

    #[test]
    fn topic_display_names() {
        assert_eq!(Topic::MarketData.to_string(), "market_data");
        assert_eq!(Topic::PortfolioUpdate.to_string(), "portfolio_update");
    }
}
