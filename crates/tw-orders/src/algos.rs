//! Execution algorithms: TWAP, VWAP, participation rate, and implementation
//! shortfall. Each runs as its own task, carving a parent order into market
//! child orders submitted through the broker pool.

use rust_decimal::{Decimal, RoundingStrategy};
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use tw_types::events::{AlertKind, EventPayload, SystemAlert};
use tw_types::orders::{ExecutionAlgorithm, ExecutionParams, Order, OrderId, OrderStatus};

use crate::manager::OrderManager;

/// Intraday volume curve used to weight VWAP slices. The default is a static
/// U-shape (heavy open and close); a curve derived from live volume can be
/// substituted.
#[derive(Debug, Clone)]
pub struct VolumeProfile {
    weights: Vec<f64>,
}

impl VolumeProfile {
    pub fn flat(slices: usize) -> Self {
        Self {
            weights: vec![1.0; slices.max(1)],
        }
    }

    /// U-shaped curve: ends weighted 3x the midpoint.
    pub fn u_shaped(slices: usize) -> Self {
        let n = slices.max(1);
        let weights = (0..n)
            .map(|i| {
                let x = (i as f64 + 0.5) / n as f64;
                4.0 * (x - 0.5) * (x - 0.5) + 0.5
            })
            .collect();
        Self { weights }
    }

    pub fn from_weights(weights: Vec<f64>) -> Self {
        Self { weights }
    }

    pub fn slices(&self) -> usize {
        self.weights.len()
    }

    /// Split `total` across the curve. Quantities sum exactly to `total`;
    /// rounding remainders land on the final slice.
    pub fn slice_quantities(&self, total: Decimal) -> Vec<Decimal> {
        let sum: f64 = self.weights.iter().sum();
        if sum <= 0.0 || self.weights.is_empty() {
            return vec![total];
        }
        let mut quantities = Vec::with_capacity(self.weights.len());
        let mut allocated = Decimal::ZERO;
        for (i, w) in self.weights.iter().enumerate() {
            if i + 1 == self.weights.len() {
                quantities.push(total - allocated);
            } else {
                let fraction = Decimal::from_f64_retain(w / sum).unwrap_or(Decimal::ZERO);
                let q = (total * fraction)
                    .round_dp_with_strategy(8, RoundingStrategy::ToZero);
                allocated += q;
                quantities.push(q);
            }
        }
        quantities
    }
}

/// Equal split with the remainder on the last slice.
pub(crate) fn equal_slices(total: Decimal, slices: u32) -> Vec<Decimal> {
    let n = slices.max(1);
    let base = (total / Decimal::from(n)).round_dp_with_strategy(8, RoundingStrategy::ToZero);
    if base <= Decimal::ZERO {
        return vec![total];
    }
    let mut quantities = vec![base; (n - 1) as usize];
    quantities.push(total - base * Decimal::from(n - 1));
    quantities
}

impl OrderManager {
    /// Entry point from signal processing: hand the parent to the algorithm
    /// runner task.
    pub(crate) fn begin_algorithm(&self, parent_id: OrderId, params: ExecutionParams) {
        {
            let mut orders = self.orders.lock();
            let parent = match orders.get_mut(&parent_id) {
                Some(parent) => parent,
                None => return,
            };
            // The parent never goes to a broker itself; Submitted marks
            // "execution in progress".
            if let Err(error) = parent.transition(OrderStatus::Submitted) {
                warn!(order_id = %parent_id, error = %error, "parent not in a startable state");
                return;
            }
        }
        if self.algo_tx.send((parent_id, params)).is_err() {
            warn!(order_id = %parent_id, "algorithm runner not running; parent stalled");
        }
    }

    pub(crate) async fn run_algorithm(self: Arc<Self>, parent_id: OrderId, params: ExecutionParams) {
        let parent = match self.order(parent_id) {
            Some(order) => order,
            None => return,
        };
        info!(
            order_id = %parent_id,
            algorithm = ?params.algorithm,
            quantity = %parent.quantity,
            horizon_secs = params.time_horizon_secs,
            "execution algorithm started"
        );

        match params.algorithm {
            ExecutionAlgorithm::Twap => {
                let quantities = equal_slices(parent.quantity, params.slices);
                let interval = slice_interval(params.time_horizon_secs, quantities.len());
                self.run_sliced(&parent, quantities, interval).await;
            }
            ExecutionAlgorithm::Vwap => {
                let profile = VolumeProfile::u_shaped(params.slices.max(1) as usize);
                let quantities = profile.slice_quantities(parent.quantity);
                let interval = slice_interval(params.time_horizon_secs, quantities.len());
                self.run_sliced(&parent, quantities, interval).await;
            }
            ExecutionAlgorithm::ParticipationRate => {
                self.run_participation(&parent, &params).await;
            }
            ExecutionAlgorithm::ImplementationShortfall => {
                self.run_shortfall(&parent, &params).await;
            }
            ExecutionAlgorithm::Market => {
                self.submit_order(parent_id).await;
            }
        }

        debug!(order_id = %parent_id, "execution algorithm finished");
    }

    /// Submit `quantities` as market children, one per interval, stopping if
    /// the parent goes terminal, the emergency stop latches, or a child
    /// cannot be durably recorded.
    async fn run_sliced(&self, parent: &Order, quantities: Vec<Decimal>, interval: Duration) {
        let total = quantities.len();
        for (i, quantity) in quantities.into_iter().enumerate() {
            if self.parent_halted(parent.id) {
                break;
            }
            if quantity > Decimal::ZERO && self.spawn_child(parent, quantity).await.is_none() {
                break;
            }
            if i + 1 < total {
                tokio::time::sleep(interval).await;
            }
        }
    }

    async fn run_participation(&self, parent: &Order, params: &ExecutionParams) {
        let interval = slice_interval(params.time_horizon_secs, params.slices.max(1) as usize);
        let mut remaining = parent.quantity;
        while remaining > Decimal::ZERO && !self.parent_halted(parent.id) {
            let estimate = self.volume_estimate(&parent.symbol);
            let chunk = (estimate * params.participation_rate)
                .round_dp_with_strategy(8, RoundingStrategy::ToZero)
                .min(remaining);
            if chunk > Decimal::ZERO {
                if self.spawn_child(parent, chunk).await.is_none() {
                    break;
                }
                remaining -= chunk;
            }
            if remaining > Decimal::ZERO {
                tokio::time::sleep(interval).await;
            }
        }
    }

    async fn run_shortfall(&self, parent: &Order, params: &ExecutionParams) {
        let immediate = (parent.quantity * params.urgency)
            .round_dp_with_strategy(8, RoundingStrategy::ToZero);
        if immediate > Decimal::ZERO && self.spawn_child(parent, immediate).await.is_none() {
            return;
        }

        let remainder = parent.quantity - immediate;
        if remainder > Decimal::ZERO && !self.parent_halted(parent.id) {
            let quantities = equal_slices(remainder, params.slices);
            let interval = slice_interval(params.time_horizon_secs, quantities.len());
            tokio::time::sleep(interval).await;
            self.run_sliced(parent, quantities, interval).await;
        }
    }

    fn parent_halted(&self, parent_id: OrderId) -> bool {
        if self.stop.is_engaged() {
            return true;
        }
        self.order(parent_id).map(|o| o.is_terminal()).unwrap_or(true)
    }

    /// Create, persist, and submit one child slice. Children follow the same
    /// persist-first rule as top-level orders: if the store cannot record the
    /// child after retries, nothing is submitted and `None` tells the caller
    /// to halt the algorithm.
    async fn spawn_child(&self, parent: &Order, quantity: Decimal) -> Option<OrderId> {
        let mut child = Order::market(parent.symbol.clone(), parent.side, quantity);
        child.strategy_id = parent.strategy_id.clone();
        child.parent_order_id = Some(parent.id);

        if !self.save_order_with_retry(&child).await {
            warn!(
                parent = %parent.id,
                child = %child.id,
                "child order persistence failed; execution halted"
            );
            let _ = self
                .bus
                .publish(EventPayload::SystemAlert(SystemAlert::critical(
                    AlertKind::RepositoryDegraded {
                        error: "child order save failed".to_string(),
                    },
                )))
                .await;
            return None;
        }

        self.orders.lock().insert(child.id, child.clone());
        self.children
            .lock()
            .entry(parent.id)
            .or_default()
            .push(child.id);

        debug!(
            parent = %parent.id,
            child = %child.id,
            quantity = %quantity,
            "child order created"
        );
        self.submit_order(child.id).await;
        Some(child.id)
    }
}

fn slice_interval(horizon_secs: u64, slices: usize) -> Duration {
    let n = slices.max(1) as f64;
    Duration::from_secs_f64((horizon_secs as f64 / n).max(0.001))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn equal_slices_sum_exactly() {
        let slices = equal_slices(dec!(1000), 10);
        assert_eq!(slices.len(), 10);
        assert!(slices.iter().all(|q| *q == dec!(100)));

        let uneven = equal_slices(dec!(100), 3);
        assert_eq!(uneven.iter().sum::<Decimal>(), dec!(100));
        assert_eq!(uneven.len(), 3);
    }

    #[test]
    fn equal_slices_degenerate() {
        let one = equal_slices(dec!(5), 1);
        assert_eq!(one, vec![dec!(5)]);
        // More slices than units still sums correctly.
        let tiny = equal_slices(dec!(0.00000001), 100);
        assert_eq!(tiny.iter().sum::<Decimal>(), dec!(0.00000001));
    }

    #[test]
    fn u_shape_weights_ends_heavier() {
        let profile = VolumeProfile::u_shaped(10);
        let q = profile.slice_quantities(dec!(1000));
        assert_eq!(q.len(), 10);
        assert_eq!(q.iter().sum::<Decimal>(), dec!(1000));
        assert!(q[0] > q[4], "open slice should outweigh midday: {q:?}");
    }

    #[test]
    fn flat_profile_is_even() {
        let profile = VolumeProfile::flat(4);
        let q = profile.slice_quantities(dec!(100));
        assert_eq!(q.iter().sum::<Decimal>(), dec!(100));
        assert_eq!(q[0], dec!(25));
    }

    #[test]
    fn interval_divides_horizon() {
        assert_eq!(slice_interval(600, 10), Duration::from_secs(60));
        assert!(slice_interval(0, 10) > Duration::ZERO);
    }
}
