use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::OrderError;
use crate::market::Symbol;
use crate::signal::SignalId;

/// Unique order identifier.
pub type OrderId = Uuid;

/// Unique fill identifier. Globally unique; the portfolio core dedupes on it.
pub type FillId = Uuid;

/// Direction of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    pub fn sign(&self) -> Decimal {
        match self {
            Side::Buy => Decimal::ONE,
            Side::Sell => -Decimal::ONE,
        }
    }
}

/// Order types supported by the runtime. Price constraints are structural:
/// a limit order cannot exist without its limit price.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit { price: Decimal },
    Stop { stop_price: Decimal },
    StopLimit { stop_price: Decimal, limit_price: Decimal },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    Day,
    GTC,
    IOC,
    FOK,
}

/// Order lifecycle states. Transitions form a DAG; see
/// [`OrderStatus::can_transition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    Submitted,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected
        )
    }

    /// Whether moving from `self` to `next` follows a forward edge of the
    /// lifecycle DAG. Regressive broker updates are dropped by callers.
    pub fn can_transition(&self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        match (self, next) {
            (Pending, Submitted) | (Pending, Rejected) => true,
            (Submitted, PartiallyFilled)
            | (Submitted, Filled)
            | (Submitted, Cancelled)
            | (Submitted, Rejected) => true,
            (PartiallyFilled, PartiallyFilled)
            | (PartiallyFilled, Filled)
            | (PartiallyFilled, Cancelled) => true,
            _ => false,
        }
    }
}

/// Execution algorithm requested by a signal for a non-immediate order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionAlgorithm {
    Market,
    Twap,
    Vwap,
    ParticipationRate,
    ImplementationShortfall,
}

/// Parameters steering a non-immediate execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionParams {
    pub algorithm: ExecutionAlgorithm,
    /// Total execution horizon in seconds.
    pub time_horizon_secs: u64,
    /// Number of child slices (TWAP / VWAP).
    pub slices: u32,
    /// Target fraction of observed volume (participation rate).
    pub participation_rate: Decimal,
    /// 0 = patient, 1 = aggressive (implementation shortfall).
    pub urgency: Decimal,
}

impl Default for ExecutionParams {
    fn default() -> Self {
        Self {
            algorithm: ExecutionAlgorithm::Market,
            time_horizon_secs: 600,
            slices: 10,
            participation_rate: Decimal::new(1, 1), // 10%
            urgency: Decimal::new(5, 1),            // 0.5
        }
    }
}

/// An order as tracked by the order manager, which is its exclusive writer.
/// Other components observe copies carried on events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub symbol: Symbol,
    pub side: Side,
    pub quantity: Decimal,
    pub order_type: OrderType,
    pub time_in_force: TimeInForce,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub filled_quantity: Decimal,
    pub remaining_quantity: Decimal,
    pub average_fill_price: Option<Decimal>,
    pub commission_paid: Decimal,
    pub strategy_id: Option<String>,
    /// Idempotency key linking the order back to the signal that created it.
    pub signal_id: Option<SignalId>,
    /// Set once the broker manager has routed the order.
    pub broker_name: Option<String>,
    /// Present on child orders created by an execution algorithm.
    pub parent_order_id: Option<OrderId>,
}

impl Order {
    pub fn new(symbol: Symbol, side: Side, quantity: Decimal, order_type: OrderType) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            symbol,
            side,
            quantity,
            order_type,
            time_in_force: TimeInForce::GTC,
            status: OrderStatus::Pending,
            created_at: now,
            updated_at: now,
            filled_quantity: Decimal::ZERO,
            remaining_quantity: quantity,
            average_fill_price: None,
            commission_paid: Decimal::ZERO,
            strategy_id: None,
            signal_id: None,
            broker_name: None,
            parent_order_id: None,
        }
    }

    pub fn market(symbol: Symbol, side: Side, quantity: Decimal) -> Self {
        Self::new(symbol, side, quantity, OrderType::Market)
    }

    pub fn limit(symbol: Symbol, side: Side, quantity: Decimal, price: Decimal) -> Self {
        Self::new(symbol, side, quantity, OrderType::Limit { price })
    }

    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Apply a fill: updates filled/remaining quantity, the volume-weighted
    /// average fill price, commission, and the status. Quantity is clamped to
    /// what remains open.
    pub fn apply_fill(&mut self, quantity: Decimal, price: Decimal, commission: Decimal) {
        let fill_quantity = quantity.min(self.remaining_quantity);
        if fill_quantity <= Decimal::ZERO {
            return;
        }

        let total_filled = self.filled_quantity + fill_quantity;
        self.average_fill_price = Some(match self.average_fill_price {
            Some(avg) => (avg * self.filled_quantity + price * fill_quantity) / total_filled,
            None => price,
        });
        self.filled_quantity = total_filled;
        self.remaining_quantity = self.quantity - total_filled;
        self.commission_paid += commission;
        self.updated_at = Utc::now();

        self.status = if self.remaining_quantity == Decimal::ZERO {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
    }

    /// Move to a new status if the transition is a forward DAG edge.
    /// Returns [`OrderError::InvalidTransition`] (leaving the order
    /// untouched) otherwise.
    pub fn transition(&mut self, next: OrderStatus) -> Result<(), OrderError> {
        if self.status.can_transition(next) {
            self.status = next;
            self.updated_at = Utc::now();
            Ok(())
        } else {
            Err(OrderError::InvalidTransition {
                from: format!("{:?}", self.status),
                to: format!("{next:?}"),
            })
        }
    }
}

/// A confirmed execution. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub id: FillId,
    pub order_id: OrderId,
    pub symbol: Symbol,
    pub side: Side,
    pub quantity: Decimal,
    pub price: Decimal,
    pub commission: Decimal,
    pub venue: String,
    pub liquidity_flag: LiquidityFlag,
    /// Owning strategy, when the executing venue can echo it back.
    pub strategy_id: Option<String>,
    pub executed_at: DateTime<Utc>,
}

/// Whether the execution added or removed liquidity (or was routed out).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LiquidityFlag {
    Added,
    Removed,
    Routed,
}

impl Fill {
    pub fn new(
        order_id: OrderId,
        symbol: Symbol,
        side: Side,
        quantity: Decimal,
        price: Decimal,
        commission: Decimal,
        venue: &str,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            order_id,
            symbol,
            side,
            quantity,
            price,
            commission,
            venue: venue.to_string(),
            liquidity_flag: LiquidityFlag::Removed,
            strategy_id: None,
            executed_at: Utc::now(),
        }
    }

    pub fn gross_amount(&self) -> Decimal {
        self.quantity * self.price
    }

    /// Signed cash impact: negative for buys (cash out), positive for sells.
    pub fn net_amount(&self) -> Decimal {
        match self.side {
            Side::Buy => -(self.gross_amount() + self.commission),
            Side::Sell => self.gross_amount() - self.commission,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn order(quantity: Decimal) -> Order {
        Order::market(Symbol::equity("AAPL"), Side::Buy, quantity)
    }

    #[test]
    fn transition_dag_forward_edges() {
        use OrderStatus::*;
        assert!(Pending.can_transition(Submitted));
        assert!(Pending.can_transition(Rejected));
        assert!(Submitted.can_transition(PartiallyFilled));
        assert!(Submitted.can_transition(Cancelled));
        assert!(PartiallyFilled.can_transition(Filled));
        assert!(PartiallyFilled.can_transition(Cancelled));
    }

    #[test]
    fn transition_dag_rejects_backwards_and_terminal_edges() {
        use OrderStatus::*;
        assert!(!Filled.can_transition(PartiallyFilled));
        assert!(!Cancelled.can_transition(Submitted));
        assert!(!Rejected.can_transition(Pending));
        assert!(!PartiallyFilled.can_transition(Submitted));
        assert!(!Pending.can_transition(Filled)); // must pass through Submitted
    }

    #[test]
    fn fill_updates_vwap_and_status() {
        let mut o = order(dec!(100));
        o.transition(OrderStatus::Submitted).unwrap();

        o.apply_fill(dec!(40), dec!(10), dec!(0.4));
        assert_eq!(o.status, OrderStatus::PartiallyFilled);
        assert_eq!(o.average_fill_price, Some(dec!(10)));
        assert_eq!(o.remaining_quantity, dec!(60));

        o.apply_fill(dec!(60), dec!(11), dec!(0.6));
        assert_eq!(o.status, OrderStatus::Filled);
        // (40*10 + 60*11) / 100 = 10.6
        assert_eq!(o.average_fill_price, Some(dec!(10.6)));
        assert_eq!(o.commission_paid, dec!(1.0));
    }

    #[test]
    fn overfill_is_clamped() {
        let mut o = order(dec!(10));
        o.transition(OrderStatus::Submitted).unwrap();
        o.apply_fill(dec!(25), dec!(5), dec!(0));
        assert_eq!(o.filled_quantity, dec!(10));
        assert_eq!(o.status, OrderStatus::Filled);
    }

    #[test]
    fn exact_remaining_fill_completes() {
        let mut o = order(dec!(10));
        o.transition(OrderStatus::Submitted).unwrap();
        o.apply_fill(dec!(4), dec!(5), dec!(0));
        assert_eq!(o.status, OrderStatus::PartiallyFilled);
        o.apply_fill(dec!(6), dec!(5), dec!(0));
        assert_eq!(o.status, OrderStatus::Filled);
    }

    #[test]
    fn guarded_transition_leaves_terminal_orders_alone() {
        let mut o = order(dec!(10));
        o.transition(OrderStatus::Submitted).unwrap();
        assert!(o.transition(OrderStatus::Cancelled).is_ok());
        let err = o.transition(OrderStatus::Submitted).unwrap_err();
        assert!(matches!(err, OrderError::InvalidTransition { .. }));
        assert_eq!(o.status, OrderStatus::Cancelled);
    }

    #[test]
    fn fill_net_amount_sign() {
        let f = Fill::new(
            Uuid::new_v4(),
            Symbol::equity("AAPL"),
            Side::Buy,
            dec!(10),
            dec!(100),
            dec!(1),
            "paper",
        );
        assert_eq!(f.net_amount(), dec!(-1001));

        let mut s = f.clone();
        s.side = Side::Sell;
        assert_eq!(s.net_amount(), dec!(999));
    }
}
