//! Paper (simulated) broker.
//!
//! Executes orders in-process with a commission and slippage model. Market
//! orders fill against the latest seen price; limit and stop orders trigger
//! off incoming bars. The standard fixture for integration tests and the
//! sandbox adapter for dry runs.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

use tw_bus::EventHandler;
use tw_types::events::{Event, EventPayload, OrderStatusUpdate};
use tw_types::market::{Bar, Symbol};
use tw_types::orders::{Fill, Order, OrderId, OrderStatus, OrderType, Side};

use crate::broker::{
    AccountInfo, Broker, BrokerError, BrokerPosition, BrokerResult, BrokerUpdate,
    ConnectionStatus,
};

/// Paper broker tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaperBrokerConfig {
    pub initial_cash: Decimal,
    /// Commission charged per unit traded.
    pub commission_per_unit: Decimal,
    /// Slippage applied to market fills, as a price fraction.
    pub slippage: Decimal,
    /// Fill market orders at submission when a price is already known.
    pub immediate_market_fills: bool,
}

impl Default for PaperBrokerConfig {
    fn default() -> Self {
        Self {
            initial_cash: Decimal::from(100_000),
            commission_per_unit: Decimal::new(1, 2), // $0.01
            slippage: Decimal::new(5, 4),            // 0.05%
            immediate_market_fills: true,
        }
    }
}

#[derive(Debug, Clone)]
struct PaperPosition {
    quantity: Decimal,
    average_cost: Decimal,
}

/// In-process broker simulating execution. Echoes the runtime's order id as
/// its own, so updates correlate without a mapping table.
pub struct PaperBroker {
    name: String,
    config: PaperBrokerConfig,
    connected: bool,
    cash: Decimal,
    positions: HashMap<Symbol, PaperPosition>,
    open_orders: HashMap<OrderId, Order>,
    /// Shared with [`PaperPriceFeed`] so bus market data can mark prices.
    latest_prices: Arc<RwLock<HashMap<Symbol, Decimal>>>,
    updates: Option<mpsc::UnboundedSender<BrokerUpdate>>,
    /// Fail the next N submissions (failover testing).
    failures_remaining: u32,
}

/// Bus-side companion of the paper broker: subscribed to `market_data`, it
/// keeps the broker's price map current so market orders fill at the latest
/// close.
pub struct PaperPriceFeed {
    prices: Arc<RwLock<HashMap<Symbol, Decimal>>>,
}

#[async_trait]
impl EventHandler for PaperPriceFeed {
    async fn handle(&self, event: Event) -> Result<(), String> {
        if let EventPayload::MarketData(bar) = event.payload {
            self.prices.write().insert(bar.symbol, bar.close);
        }
        Ok(())
    }
}

impl PaperBroker {
    pub fn new(name: &str, config: PaperBrokerConfig) -> Self {
        let cash = config.initial_cash;
        Self {
            name: name.to_string(),
            config,
            connected: false,
            cash,
            positions: HashMap::new(),
            open_orders: HashMap::new(),
            latest_prices: Arc::new(RwLock::new(HashMap::new())),
            updates: None,
            failures_remaining: 0,
        }
    }

    pub fn with_defaults(name: &str) -> Self {
        Self::new(name, PaperBrokerConfig::default())
    }

    /// A handler that feeds bus market data into this broker's price map.
    pub fn price_feed(&self) -> PaperPriceFeed {
        PaperPriceFeed {
            prices: self.latest_prices.clone(),
        }
    }

    /// Make the next `n` submissions fail with an internal error.
    pub fn fail_submissions(&mut self, n: u32) {
        self.failures_remaining = n;
    }

    /// Seed the latest price for a symbol (tests).
    pub fn set_price(&mut self, symbol: Symbol, price: Decimal) {
        self.latest_prices.write().insert(symbol, price);
    }

    pub fn open_order_count(&self) -> usize {
        self.open_orders.len()
    }

    /// Feed a bar: refresh the mark and try to fill resting orders.
    pub fn process_bar(&mut self, bar: &Bar) {
        self.latest_prices
            .write()
            .insert(bar.symbol.clone(), bar.close);
        let candidates: Vec<OrderId> = self
            .open_orders
            .values()
            .filter(|o| o.symbol == bar.symbol)
            .map(|o| o.id)
            .collect();
        for order_id in candidates {
            self.try_fill(order_id, bar.close);
        }
    }

    fn send_update(&self, update: BrokerUpdate) {
        if let Some(tx) = &self.updates {
            let _ = tx.send(update);
        }
    }

    fn fill_price_for(&self, order: &Order, market_price: Decimal) -> Option<Decimal> {
        match &order.order_type {
            OrderType::Market => {
                let slip = market_price * self.config.slippage;
                Some(match order.side {
                    Side::Buy => market_price + slip,
                    Side::Sell => market_price - slip,
                })
            }
            OrderType::Limit { price } => match order.side {
                Side::Buy if market_price <= *price => Some(*price),
                Side::Sell if market_price >= *price => Some(*price),
                _ => None,
            },
            OrderType::Stop { stop_price } => match order.side {
                Side::Buy if market_price >= *stop_price => Some(market_price),
                Side::Sell if market_price <= *stop_price => Some(market_price),
                _ => None,
            },
            OrderType::StopLimit {
                stop_price,
                limit_price,
            } => match order.side {
                Side::Buy if market_price >= *stop_price && market_price <= *limit_price => {
                    Some(*limit_price)
                }
                Side::Sell if market_price <= *stop_price && market_price >= *limit_price => {
                    Some(*limit_price)
                }
                _ => None,
            },
        }
    }

    fn try_fill(&mut self, order_id: OrderId, market_price: Decimal) -> bool {
        let order = match self.open_orders.get(&order_id) {
            Some(o) => o.clone(),
            None => return false,
        };
        let fill_price = match self.fill_price_for(&order, market_price) {
            Some(p) => p,
            None => return false,
        };

        let quantity = order.remaining_quantity;
        let commission = quantity * self.config.commission_per_unit;

        match order.side {
            Side::Buy => {
                let cost = quantity * fill_price + commission;
                if cost > self.cash {
                    self.open_orders.remove(&order_id);
                    self.send_update(BrokerUpdate::Status(
                        OrderStatusUpdate::new(order_id, OrderStatus::Rejected)
                            .with_reason("insufficient funds")
                            .from_broker(&self.name),
                    ));
                    return false;
                }
                self.cash -= cost;
            }
            Side::Sell => {
                self.cash += quantity * fill_price - commission;
            }
        }

        let position = self
            .positions
            .entry(order.symbol.clone())
            .or_insert(PaperPosition {
                quantity: Decimal::ZERO,
                average_cost: Decimal::ZERO,
            });
        match order.side {
            Side::Buy => {
                let total_cost =
                    position.quantity * position.average_cost + quantity * fill_price;
                position.quantity += quantity;
                if position.quantity > Decimal::ZERO {
                    position.average_cost = total_cost / position.quantity;
                }
            }
            Side::Sell => {
                position.quantity -= quantity;
                if position.quantity <= Decimal::ZERO {
                    position.quantity = Decimal::ZERO;
                    position.average_cost = Decimal::ZERO;
                }
            }
        }

        let mut fill = Fill::new(
            order_id,
            order.symbol.clone(),
            order.side,
            quantity,
            fill_price,
            commission,
            &self.name,
        );
        fill.strategy_id = order.strategy_id.clone();
        fill.executed_at = Utc::now();

        self.open_orders.remove(&order_id);
        debug!(
            order_id = %order_id,
            symbol = %order.symbol,
            quantity = %quantity,
            price = %fill_price,
            "paper fill"
        );
        self.send_update(BrokerUpdate::Fill(fill));
        self.send_update(BrokerUpdate::Status(
            OrderStatusUpdate::new(order_id, OrderStatus::Filled).from_broker(&self.name),
        ));
        true
    }
}

#[async_trait]
impl Broker for PaperBroker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&mut self) -> BrokerResult<()> {
        self.connected = true;
        info!(broker = %self.name, "paper broker connected");
        Ok(())
    }

    async fn disconnect(&mut self) -> BrokerResult<()> {
        self.connected = false;
        Ok(())
    }

    fn connection_status(&self) -> ConnectionStatus {
        if self.connected {
            ConnectionStatus::Connected
        } else {
            ConnectionStatus::Disconnected
        }
    }

    async fn submit_order(&mut self, order: &Order) -> BrokerResult<OrderId> {
        if !self.connected {
            return Err(BrokerError::NotConnected);
        }
        if self.failures_remaining > 0 {
            self.failures_remaining -= 1;
            return Err(BrokerError::Internal {
                message: "injected submission failure".to_string(),
            });
        }
        if order.quantity <= Decimal::ZERO {
            return Err(BrokerError::OrderRejected {
                reason: "non-positive quantity".to_string(),
            });
        }

        self.open_orders.insert(order.id, order.clone());
        self.send_update(BrokerUpdate::Status(
            OrderStatusUpdate::new(order.id, OrderStatus::Submitted).from_broker(&self.name),
        ));

        if self.config.immediate_market_fills {
            let price = self.latest_prices.read().get(&order.symbol).copied();
            if let (OrderType::Market, Some(price)) = (&order.order_type, price) {
                self.try_fill(order.id, price);
            }
        }

        Ok(order.id)
    }

    async fn cancel_order(&mut self, order_id: OrderId) -> BrokerResult<()> {
        match self.open_orders.remove(&order_id) {
            Some(_) => {
                self.send_update(BrokerUpdate::Status(
                    OrderStatusUpdate::new(order_id, OrderStatus::Cancelled)
                        .from_broker(&self.name),
                ));
                Ok(())
            }
            None => Err(BrokerError::OrderNotFound {
                order_id: order_id.to_string(),
            }),
        }
    }

    async fn account(&self) -> BrokerResult<AccountInfo> {
        if !self.connected {
            return Err(BrokerError::NotConnected);
        }
        let prices = self.latest_prices.read();
        let position_value: Decimal = self
            .positions
            .iter()
            .map(|(symbol, p)| {
                let mark = prices.get(symbol).copied().unwrap_or(p.average_cost);
                p.quantity * mark
            })
            .sum();
        Ok(AccountInfo {
            cash: self.cash,
            buying_power: self.cash,
            equity: self.cash + position_value,
            timestamp: Utc::now(),
        })
    }

    async fn positions(&self) -> BrokerResult<Vec<BrokerPosition>> {
        let prices = self.latest_prices.read();
        Ok(self
            .positions
            .iter()
            .filter(|(_, p)| p.quantity != Decimal::ZERO)
            .map(|(symbol, p)| {
                let mark = prices.get(symbol).copied().unwrap_or(p.average_cost);
                BrokerPosition {
                    symbol: symbol.clone(),
                    quantity: p.quantity,
                    average_cost: p.average_cost,
                    market_value: p.quantity * mark,
                }
            })
            .collect())
    }

    fn subscribe_updates(&mut self) -> mpsc::UnboundedReceiver<BrokerUpdate> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.updates = Some(tx);
        rx
    }
}
