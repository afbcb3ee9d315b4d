use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use tw_types::orders::{Fill, Order, OrderId, OrderStatus};
use tw_types::portfolio::Portfolio;

/// Errors surfaced by repository operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage unavailable: {message}")]
    Unavailable { message: String },

    #[error("order not found: {order_id}")]
    OrderNotFound { order_id: String },

    #[error("storage internal error: {message}")]
    Internal { message: String },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Storage contract for the runtime's durable records.
///
/// Every operation is idempotent with respect to its natural key: recording
/// the same fill id twice, or saving the same order id twice, must succeed
/// without duplicating state.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Insert or overwrite an order keyed by its id.
    async fn save_order(&self, order: &Order) -> StoreResult<()>;

    /// Persist a status change for an existing order.
    async fn update_order_status(
        &self,
        order_id: OrderId,
        status: OrderStatus,
        timestamp: DateTime<Utc>,
    ) -> StoreResult<()>;

    /// Record a fill keyed by its fill id.
    async fn record_fill(&self, fill: &Fill) -> StoreResult<()>;

    /// Persist a point-in-time portfolio snapshot.
    async fn snapshot_portfolio(&self, portfolio: &Portfolio) -> StoreResult<()>;

    /// All orders not yet in a terminal state.
    async fn load_active_orders(&self) -> StoreResult<Vec<Order>>;

    /// The most recent portfolio snapshot, if any.
    async fn load_portfolio(&self) -> StoreResult<Option<Portfolio>>;
}
