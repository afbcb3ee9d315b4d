//! Broker adapter contract.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use tw_types::events::OrderStatusUpdate;
use tw_types::market::Symbol;
use tw_types::orders::{Fill, Order, OrderId};

/// Account snapshot returned by a broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountInfo {
    pub cash: Decimal,
    pub buying_power: Decimal,
    pub equity: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Position as reported by the broker (the portfolio core remains the
/// authoritative book; these are reconciliation inputs).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub symbol: Symbol,
    pub quantity: Decimal,
    pub average_cost: Decimal,
    pub market_value: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    Reconnecting,
}

/// Errors surfaced by broker operations.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("not connected to broker")]
    NotConnected,

    #[error("order rejected by broker: {reason}")]
    OrderRejected { reason: String },

    #[error("order not found: {order_id}")]
    OrderNotFound { order_id: String },

    #[error("rate limited; retry after {retry_after_ms} ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("broker call timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    #[error("no eligible broker for submission")]
    NoBrokerAvailable,

    #[error("all brokers failed: {attempts} attempts")]
    AllBrokersFailed { attempts: u32 },

    #[error("broker internal error: {message}")]
    Internal { message: String },
}

pub type BrokerResult<T> = Result<T, BrokerError>;

/// Asynchronous updates flowing back from a broker: status changes and fills.
/// The broker manager republishes these on the bus.
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerUpdate {
    Status(OrderStatusUpdate),
    Fill(Fill),
}

/// Core broker adapter interface.
///
/// Adapters translate their vendor's status vocabulary into the canonical
/// order statuses before emitting updates. Submissions carry the runtime's
/// order id; adapters that support client ids echo it back so updates can be
/// correlated without a mapping table.
#[async_trait]
pub trait Broker: Send {
    fn name(&self) -> &str;

    async fn connect(&mut self) -> BrokerResult<()>;

    async fn disconnect(&mut self) -> BrokerResult<()>;

    fn connection_status(&self) -> ConnectionStatus;

    /// Submit a new order. Returns the broker-side order id.
    async fn submit_order(&mut self, order: &Order) -> BrokerResult<OrderId>;

    /// Cancel an open order (by the runtime's order id).
    async fn cancel_order(&mut self, order_id: OrderId) -> BrokerResult<()>;

    async fn account(&self) -> BrokerResult<AccountInfo>;

    async fn positions(&self) -> BrokerResult<Vec<BrokerPosition>>;

    /// The adapter's update stream. Called once, before `connect`.
    fn subscribe_updates(&mut self) -> mpsc::UnboundedReceiver<BrokerUpdate>;
}
