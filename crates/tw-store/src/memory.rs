//! In-memory repository: the single-process default and test fixture.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::RwLock;
use tracing::debug;

use tw_types::orders::{Fill, FillId, Order, OrderId, OrderStatus};
use tw_types::portfolio::Portfolio;

use crate::repository::{Repository, StoreError, StoreResult};

#[derive(Debug, Default)]
struct State {
    orders: HashMap<OrderId, Order>,
    fills: HashMap<FillId, Fill>,
    portfolio: Option<Portfolio>,
}

/// Fully in-process [`Repository`] implementation.
///
/// `fail_next(n)` makes the next `n` operations fail with
/// [`StoreError::Unavailable`], which is how the durability retry paths are
/// exercised in tests.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    state: RwLock<State>,
    failures_remaining: AtomicU32,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inject `n` consecutive failures into upcoming operations.
    pub fn fail_next(&self, n: u32) {
        self.failures_remaining.store(n, Ordering::SeqCst);
    }

    fn check_injected_failure(&self) -> StoreResult<()> {
        let remaining = self.failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Unavailable {
                message: "injected failure".to_string(),
            });
        }
        Ok(())
    }

    /// Number of distinct fills recorded.
    pub async fn fill_count(&self) -> usize {
        self.state.read().await.fills.len()
    }

    /// Number of orders saved (any status).
    pub async fn order_count(&self) -> usize {
        self.state.read().await.orders.len()
    }

    pub async fn get_order(&self, order_id: OrderId) -> Option<Order> {
        self.state.read().await.orders.get(&order_id).cloned()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn save_order(&self, order: &Order) -> StoreResult<()> {
        self.check_injected_failure()?;
        self.state
            .write()
            .await
            .orders
            .insert(order.id, order.clone());
        Ok(())
    }

    async fn update_order_status(
        &self,
        order_id: OrderId,
        status: OrderStatus,
        timestamp: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.check_injected_failure()?;
        let mut state = self.state.write().await;
        let order = state
            .orders
            .get_mut(&order_id)
            .ok_or_else(|| StoreError::OrderNotFound {
                order_id: order_id.to_string(),
            })?;
        order.status = status;
        order.updated_at = timestamp;
        Ok(())
    }

    async fn record_fill(&self, fill: &Fill) -> StoreResult<()> {
        self.check_injected_failure()?;
        let mut state = self.state.write().await;
        if state.fills.contains_key(&fill.id) {
            debug!(fill_id = %fill.id, "fill already recorded; idempotent no-op");
            return Ok(());
        }
        state.fills.insert(fill.id, fill.clone());
        Ok(())
    }

    async fn snapshot_portfolio(&self, portfolio: &Portfolio) -> StoreResult<()> {
        self.check_injected_failure()?;
        self.state.write().await.portfolio = Some(portfolio.clone());
        Ok(())
    }

    async fn load_active_orders(&self) -> StoreResult<Vec<Order>> {
        self.check_injected_failure()?;
        Ok(self
            .state
            .read()
            .await
            .orders
            .values()
            .filter(|o| o.is_active())
            .cloned()
            .collect())
    }

    async fn load_portfolio(&self) -> StoreResult<Option<Portfolio>> {
        self.check_injected_failure()?;
        Ok(self.state.read().await.portfolio.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use tw_types::market::Symbol;
    use tw_types::orders::Side;
    use uuid::Uuid;

    fn order() -> Order {
        Order::market(Symbol::equity("AAPL"), Side::Buy, dec!(10))
    }

    fn fill() -> Fill {
        Fill::new(
            Uuid::new_v4(),
            Symbol::equity("AAPL"),
            Side::Buy,
            dec!(10),
            dec!(100),
            dec!(1),
            "paper",
        )
    }

    #[tokio::test]
    async fn save_order_is_idempotent() {
        let repo = MemoryRepository::new();
        let o = order();
        repo.save_order(&o).await.unwrap();
        repo.save_order(&o).await.unwrap();
        assert_eq!(repo.order_count().await, 1);
    }

    #[tokio::test]
    async fn record_fill_dedupes_on_id() {
        let repo = MemoryRepository::new();
        let f = fill();
        repo.record_fill(&f).await.unwrap();
        repo.record_fill(&f).await.unwrap();
        assert_eq!(repo.fill_count().await, 1);
    }

    #[tokio::test]
    async fn status_update_requires_existing_order() {
        let repo = MemoryRepository::new();
        let err = repo
            .update_order_status(Uuid::new_v4(), OrderStatus::Cancelled, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::OrderNotFound { .. }));
    }

    #[tokio::test]
    async fn active_orders_excludes_terminal() {
        let repo = MemoryRepository::new();
        let mut a = order();
        a.transition(OrderStatus::Submitted).unwrap();
        let mut b = order();
        b.transition(OrderStatus::Rejected).unwrap();
        repo.save_order(&a).await.unwrap();
        repo.save_order(&b).await.unwrap();

        let active = repo.load_active_orders().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, a.id);
    }

    #[tokio::test]
    async fn injected_failures_expire() {
        let repo = MemoryRepository::new();
        repo.fail_next(2);
        assert!(repo.record_fill(&fill()).await.is_err());
        assert!(repo.record_fill(&fill()).await.is_err());
        assert!(repo.record_fill(&fill()).await.is_ok());
    }

    #[tokio::test]
    async fn portfolio_snapshot_round_trip() {
        let repo = MemoryRepository::new();
        assert!(repo.load_portfolio().await.unwrap().is_none());
        let p = Portfolio::new(dec!(100000));
        repo.snapshot_portfolio(&p).await.unwrap();
        let loaded = repo.load_portfolio().await.unwrap().unwrap();
        assert_eq!(loaded.cash, dec!(100000));
    }
}
