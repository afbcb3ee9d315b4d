//! The order manager: signals in, orders out, lifecycle driven by broker
//! status and fill events.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use dashmap::DashMap;
use parking_lot::Mutex as PlMutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use tw_broker::BrokerManager;
use tw_bus::{EventBus, EventHandler};
use tw_portfolio::PortfolioManager;
use tw_risk::{RiskEngine, Verdict};
use tw_store::Repository;
use tw_types::errors::OrderError;
use tw_types::events::{
    AlertKind, Event, EventPayload, OrderStatusUpdate, SystemAlert,
};
use tw_types::market::Symbol;
use tw_types::orders::{
    ExecutionAlgorithm, ExecutionParams, Fill, Order, OrderId, OrderStatus, OrderType, Side,
};
use tw_types::signal::{Signal, SignalId, SignalSide};
use tw_types::stop::EmergencyStop;

/// What happens to signals arriving over the rate limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverflowPolicy {
    /// Queue up to `depth` signals and drain them as the window opens.
    Queue { depth: usize },
    /// Drop over-limit signals.
    Drop,
}

/// Order manager tuning.
#[derive(Debug, Clone)]
pub struct OrderManagerConfig {
    pub max_orders_per_minute: u32,
    /// Hard daily cap, reset at UTC midnight.
    pub max_daily_orders: u32,
    /// Non-terminal orders older than this (from creation) are cancelled.
    pub order_timeout: Duration,
    pub overflow_policy: OverflowPolicy,
    /// Cadence of the timeout/overflow sweeper.
    pub sweep_interval: Duration,
    /// Attempts to persist a new order before giving up on it.
    pub save_attempts: u32,
}

impl Default for OrderManagerConfig {
    fn default() -> Self {
        Self {
            max_orders_per_minute: 60,
            max_daily_orders: 1000,
            order_timeout: Duration::from_secs(3600),
            overflow_policy: OverflowPolicy::Queue { depth: 256 },
            sweep_interval: Duration::from_secs(5),
            save_attempts: 3,
        }
    }
}

/// Submission counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OrderStats {
    pub created: u64,
    pub filled: u64,
    pub rejected_by_risk: u64,
    pub rejected_by_broker: u64,
    pub cancelled: u64,
    pub timed_out: u64,
    pub duplicate_signals: u64,
    pub dropped_signals: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StatCells {
    pub(crate) created: AtomicU64,
    pub(crate) filled: AtomicU64,
    pub(crate) rejected_by_risk: AtomicU64,
    pub(crate) rejected_by_broker: AtomicU64,
    pub(crate) cancelled: AtomicU64,
    pub(crate) timed_out: AtomicU64,
    pub(crate) duplicate_signals: AtomicU64,
    pub(crate) dropped_signals: AtomicU64,
}

#[derive(Debug)]
struct DailyCounter {
    date: NaiveDate,
    count: u32,
}

/// The order manager. Exclusive writer of order records; everything else
/// observes copies on events.
pub struct OrderManager {
    pub(crate) config: OrderManagerConfig,
    pub(crate) bus: EventBus,
    pub(crate) brokers: BrokerManager,
    risk: Arc<RiskEngine>,
    portfolio: Arc<PortfolioManager>,
    repository: Arc<dyn Repository>,
    pub(crate) stop: EmergencyStop,
    pub(crate) orders: PlMutex<HashMap<OrderId, Order>>,
    pub(crate) children: PlMutex<HashMap<OrderId, Vec<OrderId>>>,
    signal_index: DashMap<SignalId, OrderId>,
    recent_volume: DashMap<Symbol, Decimal>,
    submission_times: PlMutex<Vec<DateTime<Utc>>>,
    overflow: PlMutex<VecDeque<Signal>>,
    daily: PlMutex<DailyCounter>,
    pub(crate) stats: StatCells,
    pub(crate) algo_tx: mpsc::UnboundedSender<(OrderId, ExecutionParams)>,
    algo_rx: PlMutex<Option<mpsc::UnboundedReceiver<(OrderId, ExecutionParams)>>>,
    tasks: PlMutex<Vec<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

impl OrderManager {
    pub fn new(
        config: OrderManagerConfig,
        bus: EventBus,
        brokers: BrokerManager,
        risk: Arc<RiskEngine>,
        portfolio: Arc<PortfolioManager>,
        repository: Arc<dyn Repository>,
        stop: EmergencyStop,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        let (algo_tx, algo_rx) = mpsc::unbounded_channel();
        Self {
            config,
            bus,
            brokers,
            risk,
            portfolio,
            repository,
            stop,
            orders: PlMutex::new(HashMap::new()),
            children: PlMutex::new(HashMap::new()),
            signal_index: DashMap::new(),
            recent_volume: DashMap::new(),
            submission_times: PlMutex::new(Vec::new()),
            overflow: PlMutex::new(VecDeque::new()),
            daily: PlMutex::new(DailyCounter {
                date: Utc::now().date_naive(),
                count: 0,
            }),
            stats: StatCells::default(),
            algo_tx,
            algo_rx: PlMutex::new(Some(algo_rx)),
            tasks: PlMutex::new(Vec::new()),
            shutdown,
        }
    }

    /// Subscribe to the topics the manager consumes.
    pub fn attach(self: &Arc<Self>, bus: &EventBus) -> Result<(), tw_bus::BusError> {
        bus.subscribe(tw_types::events::Topic::Signal, "orders", self.clone())?;
        bus.subscribe(tw_types::events::Topic::OrderStatus, "orders", self.clone())?;
        bus.subscribe(tw_types::events::Topic::Fill, "orders", self.clone())?;
        bus.subscribe(tw_types::events::Topic::MarketData, "orders", self.clone())?;
        Ok(())
    }

    /// Spawn the timeout/overflow sweeper and the algorithm runner.
    pub fn start(self: &Arc<Self>) {
        let manager = self.clone();
        let mut shutdown_rx = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = tokio::time::sleep(manager.config.sweep_interval) => {}
                }
                manager.drain_overflow().await;
                manager.sweep_timeouts().await;
            }
        });
        self.tasks.lock().push(handle);

        if let Some(mut algo_rx) = self.algo_rx.lock().take() {
            let manager = self.clone();
            let handle = tokio::spawn(async move {
                while let Some((parent_id, params)) = algo_rx.recv().await {
                    tokio::spawn(manager.clone().run_algorithm(parent_id, params));
                }
            });
            self.tasks.lock().push(handle);
        }
        info!("order manager started");
    }

    /// Stop background work. Outstanding orders stay in the book; the
    /// supervisor decides whether to wait for them or cancel.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }

    pub fn stats(&self) -> OrderStats {
        OrderStats {
            created: self.stats.created.load(Ordering::Relaxed),
            filled: self.stats.filled.load(Ordering::Relaxed),
            rejected_by_risk: self.stats.rejected_by_risk.load(Ordering::Relaxed),
            rejected_by_broker: self.stats.rejected_by_broker.load(Ordering::Relaxed),
            cancelled: self.stats.cancelled.load(Ordering::Relaxed),
            timed_out: self.stats.timed_out.load(Ordering::Relaxed),
            duplicate_signals: self.stats.duplicate_signals.load(Ordering::Relaxed),
            dropped_signals: self.stats.dropped_signals.load(Ordering::Relaxed),
        }
    }

    pub fn order(&self, order_id: OrderId) -> Option<Order> {
        self.orders.lock().get(&order_id).cloned()
    }

    pub fn order_for_signal(&self, signal_id: SignalId) -> Option<Order> {
        let order_id = *self.signal_index.get(&signal_id)?.value();
        self.order(order_id)
    }

    pub fn active_order_count(&self) -> usize {
        self.orders.lock().values().filter(|o| o.is_active()).count()
    }

    /// Snapshot of every non-terminal order.
    pub fn active_orders(&self) -> Vec<Order> {
        self.orders
            .lock()
            .values()
            .filter(|o| o.is_active())
            .cloned()
            .collect()
    }

    /// Child orders created for a parent by an execution algorithm.
    pub fn children_of(&self, parent_id: OrderId) -> Vec<Order> {
        let ids = self
            .children
            .lock()
            .get(&parent_id)
            .cloned()
            .unwrap_or_default();
        let orders = self.orders.lock();
        ids.iter().filter_map(|id| orders.get(id).cloned()).collect()
    }

    /// Recent per-symbol volume estimate, fed by market data.
    pub(crate) fn volume_estimate(&self, symbol: &Symbol) -> Decimal {
        self.recent_volume
            .get(symbol)
            .map(|v| *v.value())
            .unwrap_or(Decimal::from(10_000))
    }

    // ---- signal intake ----

    async fn on_signal(&self, signal: Signal) {
        if !signal.is_actionable() {
            return;
        }
        match self.admit(&signal) {
            Ok(()) => self.process_signal(signal).await,
            Err(OrderError::RateLimited { .. }) => self.defer_or_drop(signal).await,
            Err(error @ OrderError::DuplicateSignal { .. }) => {
                debug!(signal_id = %signal.id, error = %error, "signal ignored");
                self.stats.duplicate_signals.fetch_add(1, Ordering::Relaxed);
            }
            Err(error @ OrderError::EmergencyStop) => {
                debug!(signal_id = %signal.id, error = %error, "signal dropped");
                self.stats.dropped_signals.fetch_add(1, Ordering::Relaxed);
            }
            Err(error) => {
                warn!(signal_id = %signal.id, error = %error, "signal dropped");
                self.stats.dropped_signals.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Admission gates, checked in order: emergency stop, duplicate
    /// suppression, daily cap, rate window. A passing signal consumes a
    /// daily and a window slot.
    fn admit(&self, signal: &Signal) -> Result<(), OrderError> {
        if self.stop.is_engaged() {
            return Err(OrderError::EmergencyStop);
        }
        if self.signal_index.contains_key(&signal.id) {
            return Err(OrderError::DuplicateSignal {
                signal_id: signal.id.to_string(),
            });
        }
        self.admit_daily()?;
        self.admit_rate()?;
        Ok(())
    }

    /// Sliding-window admission; records the slot when admitted.
    fn admit_rate(&self) -> Result<(), OrderError> {
        let window = chrono::Duration::seconds(60);
        let cutoff = Utc::now() - window;
        let mut times = self.submission_times.lock();
        times.retain(|t| *t >= cutoff);
        if times.len() >= self.config.max_orders_per_minute as usize {
            return Err(OrderError::RateLimited {
                limit: self.config.max_orders_per_minute,
                window_secs: 60,
            });
        }
        times.push(Utc::now());
        Ok(())
    }

    fn admit_daily(&self) -> Result<(), OrderError> {
        let today = Utc::now().date_naive();
        let mut daily = self.daily.lock();
        if daily.date != today {
            daily.date = today;
            daily.count = 0;
        }
        if daily.count >= self.config.max_daily_orders {
            return Err(OrderError::DailyCapReached {
                cap: self.config.max_daily_orders,
            });
        }
        daily.count += 1;
        Ok(())
    }

    async fn defer_or_drop(&self, signal: Signal) {
        match self.config.overflow_policy {
            OverflowPolicy::Queue { depth } => {
                let mut overflow = self.overflow.lock();
                if overflow.len() < depth {
                    debug!(signal_id = %signal.id, "rate limited; signal queued");
                    overflow.push_back(signal);
                    return;
                }
            }
            OverflowPolicy::Drop => {}
        }
        let dropped = self.stats.dropped_signals.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(signal_id = %signal.id, "rate limited; signal dropped");
        let _ = self
            .bus
            .publish(EventPayload::SystemAlert(SystemAlert::warning(
                AlertKind::RateLimitDrop {
                    component: "orders".to_string(),
                    dropped,
                },
            )))
            .await;
    }

    async fn drain_overflow(&self) {
        loop {
            if self.stop.is_engaged() {
                return;
            }
            let signal = {
                let mut overflow = self.overflow.lock();
                if overflow.is_empty() {
                    return;
                }
                if self.admit_rate().is_err() {
                    return;
                }
                match overflow.pop_front() {
                    Some(s) => s,
                    None => return,
                }
            };
            self.process_signal(signal).await;
        }
    }

    async fn process_signal(&self, signal: Signal) {
        let snapshot = self.portfolio.snapshot();
        let quantity = match self.risk.validate(&signal, &snapshot) {
            Verdict::Accepted { quantity } => quantity,
            Verdict::Rejected { .. } => {
                self.stats.rejected_by_risk.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        let side = match signal.side {
            SignalSide::Buy => Side::Buy,
            SignalSide::Sell => Side::Sell,
            SignalSide::Hold => return,
        };
        let mut order = Order::new(signal.symbol.clone(), side, quantity, OrderType::Market);
        order.strategy_id = Some(signal.strategy_id.clone());
        order.signal_id = Some(signal.id);

        // Idempotency binding happens before anything can fail so a retried
        // signal never double-creates.
        self.signal_index.insert(signal.id, order.id);

        if !self.save_order_with_retry(&order).await {
            warn!(order_id = %order.id, "order persistence failed; order abandoned");
            let _ = self
                .bus
                .publish(EventPayload::SystemAlert(SystemAlert::critical(
                    AlertKind::RepositoryDegraded {
                        error: "order save failed".to_string(),
                    },
                )))
                .await;
            return;
        }

        self.orders.lock().insert(order.id, order.clone());
        self.stats.created.fetch_add(1, Ordering::Relaxed);

        let _ = self
            .bus
            .publish(EventPayload::OrderIntent(order.clone()))
            .await;

        match &signal.execution {
            Some(params) if params.algorithm != ExecutionAlgorithm::Market => {
                self.begin_algorithm(order.id, params.clone());
            }
            _ => {
                self.submit_order(order.id).await;
            }
        }
    }

    pub(crate) async fn save_order_with_retry(&self, order: &Order) -> bool {
        for attempt in 1..=self.config.save_attempts {
            match self.repository.save_order(order).await {
                Ok(()) => return true,
                Err(e) => {
                    warn!(order_id = %order.id, attempt, error = %e, "order save failed")
                }
            }
            if attempt < self.config.save_attempts {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
        false
    }

    /// Submit a booked order through the broker pool.
    pub(crate) async fn submit_order(&self, order_id: OrderId) {
        // Optimistic transition: the book shows Submitted before the broker
        // call so a synchronous fill can never observe a Pending order.
        let order = {
            let mut orders = self.orders.lock();
            match orders.get_mut(&order_id) {
                Some(order) if order.status == OrderStatus::Pending => {
                    if order.transition(OrderStatus::Submitted).is_err() {
                        return;
                    }
                    order.clone()
                }
                _ => return,
            }
        };

        match self.brokers.submit(&order).await {
            Ok((_, broker_name)) => {
                {
                    let mut orders = self.orders.lock();
                    if let Some(o) = orders.get_mut(&order_id) {
                        o.broker_name = Some(broker_name.clone());
                    }
                }
                let _ = self
                    .repository
                    .update_order_status(order_id, OrderStatus::Submitted, Utc::now())
                    .await;
            }
            Err(e) => {
                warn!(order_id = %order_id, error = %e, "submission failed; order rejected");
                self.stats.rejected_by_broker.fetch_add(1, Ordering::Relaxed);
                let rejected = {
                    let mut orders = self.orders.lock();
                    orders.get_mut(&order_id).and_then(|o| {
                        o.transition(OrderStatus::Rejected).ok()?;
                        Some(o.clone())
                    })
                };
                if let Some(order) = rejected {
                    let _ = self
                        .repository
                        .update_order_status(order_id, order.status, Utc::now())
                        .await;
                    let _ = self
                        .bus
                        .publish(EventPayload::OrderStatus(
                            OrderStatusUpdate::new(order_id, OrderStatus::Rejected)
                                .with_reason("all brokers failed"),
                        ))
                        .await;
                }
            }
        }
    }

    // ---- lifecycle events ----

    async fn on_order_status(&self, update: OrderStatusUpdate) {
        // Fill-driven states come exclusively from fill events; accepting
        // them here would race the fill pipeline across topics.
        if matches!(
            update.status,
            OrderStatus::Filled | OrderStatus::PartiallyFilled
        ) {
            return;
        }

        let applied = {
            let mut orders = self.orders.lock();
            match orders.get_mut(&update.order_id) {
                None => {
                    debug!(order_id = %update.order_id, "status for unknown order dropped");
                    None
                }
                Some(order) if order.is_terminal() => {
                    debug!(
                        order_id = %update.order_id,
                        status = ?update.status,
                        "status for terminal order dropped"
                    );
                    None
                }
                Some(order) => match order.transition(update.status) {
                    Ok(()) => {
                        if let Some(broker) = &update.broker_name {
                            order.broker_name = Some(broker.clone());
                        }
                        Some(order.clone())
                    }
                    Err(error) => {
                        debug!(
                            order_id = %update.order_id,
                            error = %error,
                            "regressive status dropped"
                        );
                        None
                    }
                },
            }
        };

        if let Some(order) = applied {
            if order.status == OrderStatus::Cancelled {
                self.stats.cancelled.fetch_add(1, Ordering::Relaxed);
            }
            let _ = self
                .repository
                .update_order_status(order.id, order.status, update.timestamp)
                .await;
        }
    }

    async fn on_fill(&self, fill: Fill) {
        let (updated, parent_updated) = {
            let mut orders = self.orders.lock();
            let order = match orders.get_mut(&fill.order_id) {
                Some(order) => order,
                None => {
                    debug!(order_id = %fill.order_id, "fill for unknown order dropped");
                    return;
                }
            };
            if order.is_terminal() {
                debug!(order_id = %fill.order_id, "fill for terminal order dropped");
                return;
            }
            order.apply_fill(fill.quantity, fill.price, fill.commission);
            let updated = order.clone();
            let parent_id = order.parent_order_id;

            let parent_updated = parent_id.and_then(|pid| {
                orders.get_mut(&pid).and_then(|parent| {
                    // A late child fill must not revive a terminal parent.
                    if parent.is_terminal() {
                        return None;
                    }
                    // Parent accounting mirrors child fills; commissions are
                    // carried on the children only.
                    parent.apply_fill(fill.quantity, fill.price, Decimal::ZERO);
                    Some(parent.clone())
                })
            });
            (updated, parent_updated)
        };

        if updated.status == OrderStatus::Filled {
            self.stats.filled.fetch_add(1, Ordering::Relaxed);
        }
        let _ = self
            .repository
            .update_order_status(updated.id, updated.status, fill.executed_at)
            .await;

        if let Some(parent) = parent_updated {
            let _ = self
                .repository
                .update_order_status(parent.id, parent.status, fill.executed_at)
                .await;
            if parent.status == OrderStatus::Filled {
                self.stats.filled.fetch_add(1, Ordering::Relaxed);
                info!(order_id = %parent.id, "parent order completed");
                let _ = self
                    .bus
                    .publish(EventPayload::OrderStatus(OrderStatusUpdate::new(
                        parent.id,
                        OrderStatus::Filled,
                    )))
                    .await;
            }
        }
    }

    // ---- cancellation and timeouts ----

    /// Cancel an order and any outstanding children. A cancel of a terminal
    /// order is a no-op (`Ok(false)`); an unknown order is an error. Returns
    /// whether anything was cancelled.
    pub async fn cancel_order(&self, order_id: OrderId) -> Result<bool, OrderError> {
        let targets: Vec<OrderId> = {
            let child_ids = self
                .children
                .lock()
                .get(&order_id)
                .cloned()
                .unwrap_or_default();
            let orders = self.orders.lock();
            let mut targets: Vec<OrderId> = child_ids
                .into_iter()
                .filter(|id| orders.get(id).map(|o| o.is_active()).unwrap_or(false))
                .collect();
            match orders.get(&order_id) {
                Some(order) if order.is_active() => targets.push(order_id),
                Some(_) => {
                    debug!(order_id = %order_id, "cancel of terminal order is a no-op");
                    if targets.is_empty() {
                        return Ok(false);
                    }
                }
                None => {
                    return Err(OrderError::NotFound {
                        order_id: order_id.to_string(),
                    })
                }
            }
            targets
        };

        for id in &targets {
            // Broker-side cancel is best-effort; local state is authoritative
            // and the broker's Cancelled echo dedupes via the guard.
            if self.brokers.bound_broker(*id).is_some() {
                if let Err(e) = self.brokers.cancel(*id).await {
                    debug!(order_id = %id, error = %e, "broker cancel failed");
                }
            }
            let cancelled = {
                let mut orders = self.orders.lock();
                orders
                    .get_mut(id)
                    .map(|o| o.transition(OrderStatus::Cancelled).is_ok())
            };
            if cancelled == Some(true) {
                self.stats.cancelled.fetch_add(1, Ordering::Relaxed);
                let _ = self
                    .repository
                    .update_order_status(*id, OrderStatus::Cancelled, Utc::now())
                    .await;
            }
        }
        Ok(!targets.is_empty())
    }

    /// Cancel every non-terminal order (emergency stop, shutdown drain).
    pub async fn cancel_all_open(&self) {
        let parents: Vec<OrderId> = {
            let orders = self.orders.lock();
            orders
                .values()
                .filter(|o| o.is_active() && o.parent_order_id.is_none())
                .map(|o| o.id)
                .collect()
        };
        for id in parents {
            let _ = self.cancel_order(id).await;
        }
        // Orphaned children (parent already terminal) get swept directly.
        let stragglers: Vec<OrderId> = {
            let orders = self.orders.lock();
            orders
                .values()
                .filter(|o| o.is_active())
                .map(|o| o.id)
                .collect()
        };
        for id in stragglers {
            let _ = self.cancel_order(id).await;
        }
    }

    async fn sweep_timeouts(&self) {
        let timeout =
            chrono::Duration::from_std(self.config.order_timeout).unwrap_or_else(|_| {
                chrono::Duration::seconds(3600)
            });
        let now = Utc::now();
        let expired: Vec<OrderId> = {
            let orders = self.orders.lock();
            orders
                .values()
                .filter(|o| {
                    o.is_active()
                        && o.parent_order_id.is_none()
                        && now - o.created_at >= timeout
                })
                .map(|o| o.id)
                .collect()
        };
        for order_id in expired {
            warn!(order_id = %order_id, "order timed out; cancelling");
            if matches!(self.cancel_order(order_id).await, Ok(true)) {
                self.stats.timed_out.fetch_add(1, Ordering::Relaxed);
                let _ = self
                    .bus
                    .publish(EventPayload::SystemAlert(SystemAlert::warning(
                        AlertKind::OrderTimeout { order_id },
                    )))
                    .await;
            }
        }
    }
}

#[async_trait]
impl EventHandler for OrderManager {
    async fn handle(&self, event: Event) -> Result<(), String> {
        match event.payload {
            EventPayload::Signal(signal) => self.on_signal(signal).await,
            EventPayload::OrderStatus(update) => self.on_order_status(update).await,
            EventPayload::Fill(fill) => self.on_fill(fill).await,
            EventPayload::MarketData(bar) => {
                self.recent_volume.insert(bar.symbol, bar.volume);
            }
            _ => {}
        }
        Ok(())
    }
}
