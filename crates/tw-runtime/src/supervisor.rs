//! The supervisor: builds every component from one [`RuntimeConfig`], wires
//! them over the bus, starts them in dependency order, and quiesces them in
//! reverse on shutdown.

use async_trait::async_trait;
use parking_lot::Mutex as PlMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{info, warn};

use tw_broker::{Broker, BrokerConfig, BrokerManager, BrokerManagerConfig};
use tw_bus::{BusConfig, EventBus, EventHandler};
use tw_data::{IngressConfig, IngressHandle, MarketDataIngress, MarketDataProvider};
use tw_orders::{OrderManager, OrderManagerConfig, OverflowPolicy};
use tw_portfolio::{PortfolioConfig, PortfolioManager};
use tw_risk::{RiskConfig, RiskEngine};
use tw_store::{MemoryRepository, Repository};
use tw_strategy::{HostConfig, Strategy, StrategyConfig, StrategyHost};
use tw_types::errors::{TwError, TwResult};
use tw_types::events::{AlertKind, Event, EventPayload, SystemAlert, Topic};
use tw_types::market::Symbol;
use tw_types::orders::OrderId;
use tw_types::stop::EmergencyStop;

use crate::config::RuntimeConfig;

/// Reacts to an emergency-stop latch from anywhere in the system (e.g. a
/// fatal portfolio inconsistency) by cancelling live orders.
struct StopWatcher {
    orders: Arc<OrderManager>,
}

#[async_trait]
impl EventHandler for StopWatcher {
    async fn handle(&self, event: Event) -> Result<(), String> {
        if let EventPayload::SystemAlert(alert) = &event.payload {
            if matches!(alert.kind, AlertKind::EmergencyStopEngaged { .. }) {
                self.orders.cancel_all_open().await;
            }
        }
        Ok(())
    }
}

/// Owns the component graph. Construction wires everything; [`Supervisor::start`]
/// brings the active parts up once downstream consumers are subscribed, and
/// [`Supervisor::stop`] quiesces in reverse order.
pub struct Supervisor {
    config: RuntimeConfig,
    bus: EventBus,
    stop: EmergencyStop,
    repository: Arc<dyn Repository>,
    portfolio: Arc<PortfolioManager>,
    brokers: BrokerManager,
    orders: Arc<OrderManager>,
    strategies: StrategyHost,
    symbols: PlMutex<Vec<Symbol>>,
    providers: PlMutex<Vec<(Box<dyn MarketDataProvider>, u32)>>,
    ingress_handle: PlMutex<Option<IngressHandle>>,
    running: AtomicBool,
}

impl Supervisor {
    /// Build the runtime against an in-memory store.
    pub async fn new(config: RuntimeConfig) -> Self {
        Self::with_repository(config, Arc::new(MemoryRepository::new())).await
    }

    /// Build the runtime against a caller-provided repository.
    pub async fn with_repository(config: RuntimeConfig, repository: Arc<dyn Repository>) -> Self {
        let bus = EventBus::new(BusConfig {
            queue_depth: config.bus_queue_depth,
            backpressure_timeout: Duration::from_millis(config.bus_backpressure_timeout_ms),
        });
        let stop = EmergencyStop::new();

        let portfolio = Arc::new(
            PortfolioManager::load_or_new(
                config.initial_cash,
                repository.clone(),
                bus.clone(),
                stop.clone(),
                PortfolioConfig {
                    dedup_cache_size: config.fill_dedup_cache_size,
                    ..Default::default()
                },
            )
            .await,
        );

        let risk = Arc::new(RiskEngine::new(
            RiskConfig {
                limits: config.risk_limits.clone(),
                confidence_scaling: config.confidence_scaling,
            },
            stop.clone(),
            portfolio.snapshot().total_equity,
        ));

        let brokers = BrokerManager::new(
            BrokerManagerConfig {
                policy: config.broker_selection_policy,
                max_failover_attempts: config.max_failover_attempts,
                health_check_interval: Duration::from_secs(config.broker_health_check_secs),
                recovery_probes: config.broker_recovery_probes,
                ..Default::default()
            },
            bus.clone(),
        );

        let overflow_policy = if config.signal_overflow_queue == 0 {
            OverflowPolicy::Drop
        } else {
            OverflowPolicy::Queue {
                depth: config.signal_overflow_queue,
            }
        };
        let orders = Arc::new(OrderManager::new(
            OrderManagerConfig {
                max_orders_per_minute: config.max_orders_per_minute,
                max_daily_orders: config.max_daily_orders,
                order_timeout: Duration::from_secs(config.order_timeout_secs),
                overflow_policy,
                ..Default::default()
            },
            bus.clone(),
            brokers.clone(),
            risk,
            portfolio.clone(),
            repository.clone(),
            stop.clone(),
        ));

        let strategies = StrategyHost::new(HostConfig::default(), bus.clone(), stop.clone());

        Self {
            config,
            bus,
            stop,
            repository,
            portfolio,
            brokers,
            orders,
            strategies,
            symbols: PlMutex::new(Vec::new()),
            providers: PlMutex::new(Vec::new()),
            ingress_handle: PlMutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    /// Register a broker adapter (before `start`).
    pub fn add_broker(&self, broker: Box<dyn Broker>, config: BrokerConfig) {
        self.brokers.add_broker(broker, config);
    }

    /// Register a market-data provider (before `start`). Lower priority wins.
    pub fn add_provider(&self, provider: Box<dyn MarketDataProvider>, priority: u32) {
        self.providers.lock().push((provider, priority));
    }

    /// Register a strategy; its declared symbols join the ingress
    /// subscription set.
    pub async fn register_strategy(
        &self,
        strategy: Box<dyn Strategy>,
        config: StrategyConfig,
    ) -> TwResult<()> {
        {
            let mut symbols = self.symbols.lock();
            for symbol in &config.symbols {
                if !symbols.contains(symbol) {
                    symbols.push(symbol.clone());
                }
            }
        }
        self.strategies
            .register(strategy, config)
            .await
            .map_err(TwError::Validation)
    }

    /// Bring the runtime up. Subscriptions are wired first so no component
    /// misses events, then the active parts start: brokers, order manager,
    /// and finally the market-data pump.
    pub async fn start(&self) -> TwResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(TwError::Internal("supervisor already running".to_string()));
        }

        self.portfolio
            .attach(&self.bus)
            .map_err(|e| TwError::Config(format!("portfolio wiring failed: {e}")))?;
        self.orders
            .attach(&self.bus)
            .map_err(|e| TwError::Config(format!("order manager wiring failed: {e}")))?;
        self.strategies
            .attach(&self.bus)
            .map_err(|e| TwError::Config(format!("strategy host wiring failed: {e}")))?;
        self.bus
            .subscribe(
                Topic::SystemAlert,
                "supervisor",
                Arc::new(StopWatcher {
                    orders: self.orders.clone(),
                }),
            )
            .map_err(|e| TwError::Config(format!("supervisor wiring failed: {e}")))?;

        self.brokers
            .start()
            .await
            .map_err(|e| TwError::Config(format!("broker manager start failed: {e}")))?;
        self.orders.start();

        let mut ingress = MarketDataIngress::new(
            IngressConfig {
                heartbeat: Duration::from_millis(self.config.market_data_heartbeat_ms),
                failover_errors: self.config.provider_failover_errors,
                cooldown: Duration::from_millis(self.config.provider_cooldown_ms),
            },
            self.bus.clone(),
            self.symbols.lock().clone(),
        );
        for (provider, priority) in self.providers.lock().drain(..) {
            ingress.add_provider(provider, priority);
        }
        *self.ingress_handle.lock() = Some(ingress.start());

        info!("runtime started");
        Ok(())
    }

    /// Quiesce in reverse order: strategies stop emitting, the order manager
    /// drains (or cancels) outstanding orders, queues flush, then the data
    /// pump and broker connections come down.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let drain = Duration::from_secs(self.config.drain_timeout_secs);

        self.strategies.stop_all(drain).await;

        // No new signals past this point.
        let _ = self.bus.unsubscribe(Topic::Signal, "orders");
        let drained = self.wait_for_orders(drain).await;
        if !drained {
            warn!("open orders outlived drain timeout; cancelling");
            self.orders.cancel_all_open().await;
        }
        self.orders.shutdown();

        // Let in-flight fills and portfolio updates land.
        if !self.bus.drain(drain).await {
            warn!("bus queues still busy at drain timeout");
        }

        let handle = self.ingress_handle.lock().take();
        if let Some(handle) = handle {
            handle.stop(drain).await;
        }
        self.brokers.stop().await;
        self.bus.shutdown();

        info!("runtime stopped");
    }

    async fn wait_for_orders(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.orders.active_order_count() > 0 {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        true
    }

    /// Operator surface: cancel a single order through the manager. A cancel
    /// of a terminal order is a no-op (`Ok(false)`); an unknown order errors.
    pub async fn cancel_order(&self, order_id: OrderId) -> TwResult<bool> {
        Ok(self.orders.cancel_order(order_id).await?)
    }

    /// Operator action: latch the emergency stop, alert, and cancel all
    /// non-terminal orders.
    pub async fn trigger_emergency_stop(&self, reason: &str) {
        if self.stop.engage() {
            warn!(reason = %reason, "emergency stop engaged");
            let _ = self
                .bus
                .publish(EventPayload::SystemAlert(SystemAlert::critical(
                    AlertKind::EmergencyStopEngaged {
                        reason: reason.to_string(),
                    },
                )))
                .await;
        }
        self.orders.cancel_all_open().await;
    }

    /// Operator action: clear the latch.
    pub async fn reset_emergency_stop(&self) {
        self.stop.reset();
        info!("emergency stop cleared");
        let _ = self
            .bus
            .publish(EventPayload::SystemAlert(SystemAlert::warning(
                AlertKind::EmergencyStopCleared,
            )))
            .await;
    }

    // -- accessors ----------------------------------------------------------

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn emergency_stop(&self) -> &EmergencyStop {
        &self.stop
    }

    pub fn portfolio(&self) -> &Arc<PortfolioManager> {
        &self.portfolio
    }

    pub fn orders(&self) -> &Arc<OrderManager> {
        &self.orders
    }

    pub fn brokers(&self) -> &BrokerManager {
        &self.brokers
    }

    pub fn strategies(&self) -> &StrategyHost {
        &self.strategies
    }

    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repository
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use tw_broker::{PaperBroker, PaperBrokerConfig};
    use tw_data::ReplayProvider;
    use tw_types::market::{Bar, Resolution};
    use tw_types::portfolio::RiskLimits;
    use tw_types::signal::{Signal, SignalSide};

    fn sym() -> Symbol {
        Symbol::equity("AAPL")
    }

    fn bars(count: i64) -> Vec<Bar> {
        (0..count)
            .map(|i| {
                let close = Decimal::from(100 + i);
                Bar::new(
                    sym(),
                    chrono::DateTime::from_timestamp(1_700_000_000 + i * 60, 0).unwrap(),
                    close,
                    close + dec!(0.5),
                    close - dec!(0.5),
                    close,
                    dec!(100_000),
                    Resolution::Minute,
                )
            })
            .collect()
    }

    /// Emits exactly one buy signal, on the fifth bar it sees.
    struct OneShotBuyer {
        config: StrategyConfig,
        bars_seen: usize,
        fired: bool,
    }

    impl OneShotBuyer {
        fn new() -> Self {
            let mut config = StrategyConfig::new("one_shot", "One Shot Buyer");
            config.add_symbol(sym());
            Self {
                config,
                bars_seen: 0,
                fired: false,
            }
        }
    }

    impl Strategy for OneShotBuyer {
        fn initialize(&mut self, config: &StrategyConfig) -> Result<(), String> {
            self.config = config.clone();
            Ok(())
        }

        fn on_bar(
            &mut self,
            bar: &Bar,
            _ctx: &tw_strategy::StrategyContext,
        ) -> Result<Vec<Signal>, String> {
            self.bars_seen += 1;
            if self.bars_seen == 5 && !self.fired {
                self.fired = true;
                return Ok(vec![Signal::new(
                    &self.config.strategy_id,
                    bar.symbol.clone(),
                    SignalSide::Buy,
                    dec!(1),
                    bar.close,
                    bar.timestamp,
                )]);
            }
            Ok(vec![])
        }

        fn config(&self) -> &StrategyConfig {
            &self.config
        }
    }

    fn test_config() -> RuntimeConfig {
        RuntimeConfig {
            initial_cash: dec!(1_000_000),
            risk_limits: RiskLimits {
                max_position_fraction: dec!(0.1),
                ..Default::default()
            },
            market_data_heartbeat_ms: 60_000,
            drain_timeout_secs: 2,
            ..Default::default()
        }
    }

    async fn wait_until(label: &str, mut condition: impl FnMut() -> bool) {
        for _ in 0..600 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition never met: {label}");
    }

    #[tokio::test]
    async fn full_paper_trading_cycle() -> anyhow::Result<()> {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("warn")
            .try_init();
        let supervisor = Supervisor::new(test_config()).await;

        let paper = PaperBroker::new(
            "paper",
            PaperBrokerConfig {
                initial_cash: dec!(10_000_000),
                ..Default::default()
            },
        );
        // Bus market data keeps the paper broker's marks current.
        supervisor
            .bus()
            .subscribe(Topic::MarketData, "paper_feed", Arc::new(paper.price_feed()))
            .unwrap();
        supervisor.add_broker(Box::new(paper), BrokerConfig::default());

        supervisor.add_provider(Box::new(ReplayProvider::new("replay", bars(10))), 1);
        supervisor
            .register_strategy(Box::new(OneShotBuyer::new()), {
                let mut c = StrategyConfig::new("one_shot", "One Shot Buyer");
                c.add_symbol(sym());
                c
            })
            .await
            .unwrap();

        supervisor.start().await?;
        assert!(supervisor.is_running());

        let orders = supervisor.orders().clone();
        wait_until("an order filled", move || orders.stats().filled >= 1).await;

        let portfolio = supervisor.portfolio().clone();
        wait_until("portfolio has the position", move || {
            portfolio
                .snapshot()
                .position(&sym())
                .map(|p| p.quantity > Decimal::ZERO)
                .unwrap_or(false)
        })
        .await;

        let snapshot = supervisor.portfolio().snapshot();
        let position = snapshot.position(&sym()).unwrap();
        // 10% of 1M equity at a ~104 reference sizes to several hundred
        // shares; the exact figure depends on the marked equity at signal
        // time, so bound it instead of pinning it.
        assert!(position.quantity > dec!(500));
        assert!(position.quantity < dec!(1100));
        assert!(snapshot.cash < dec!(1_000_000));

        supervisor.stop().await;
        assert!(!supervisor.is_running());
        Ok(())
    }

    #[tokio::test]
    async fn emergency_stop_cancels_and_blocks() {
        let supervisor = Supervisor::new(test_config()).await;

        // No price feed: market orders rest at the paper broker.
        let paper = PaperBroker::new(
            "paper",
            PaperBrokerConfig {
                initial_cash: dec!(10_000_000),
                ..Default::default()
            },
        );
        supervisor.add_broker(Box::new(paper), BrokerConfig::default());
        supervisor.add_provider(Box::new(ReplayProvider::new("replay", bars(10))), 1);
        supervisor
            .register_strategy(Box::new(OneShotBuyer::new()), {
                let mut c = StrategyConfig::new("one_shot", "One Shot Buyer");
                c.add_symbol(sym());
                c
            })
            .await
            .unwrap();

        supervisor.start().await.unwrap();

        let orders = supervisor.orders().clone();
        wait_until("resting order exists", move || {
            orders.active_order_count() == 1
        })
        .await;

        // Operator cancel of one resting order: cancels once, then no-ops,
        // and an unknown id is a typed error.
        let open = supervisor.orders().active_orders();
        assert_eq!(open.len(), 1);
        assert!(supervisor.cancel_order(open[0].id).await.unwrap());
        assert!(!supervisor.cancel_order(open[0].id).await.unwrap());
        assert!(supervisor.cancel_order(OrderId::new_v4()).await.is_err());

        supervisor.trigger_emergency_stop("operator request").await;
        assert!(supervisor.emergency_stop().is_engaged());
        assert_eq!(supervisor.orders().active_order_count(), 0);

        // A direct signal is refused while the latch holds.
        let signal = Signal::new(
            "manual",
            sym(),
            SignalSide::Buy,
            dec!(1),
            dec!(100),
            chrono::Utc::now(),
        );
        supervisor
            .bus()
            .publish(EventPayload::Signal(signal.clone()))
            .await
            .unwrap();
        let orders = supervisor.orders().clone();
        wait_until("signal dropped", move || {
            orders.stats().dropped_signals >= 1
        })
        .await;

        // Clearing the latch reopens order flow.
        supervisor.reset_emergency_stop().await;
        let mut reopened = signal;
        reopened.timestamp = chrono::Utc::now() + chrono::Duration::seconds(1);
        reopened.id = Signal::deterministic_id(
            "manual",
            &sym(),
            reopened.timestamp,
            SignalSide::Buy,
        );
        supervisor
            .bus()
            .publish(EventPayload::Signal(reopened))
            .await
            .unwrap();
        let orders = supervisor.orders().clone();
        let before = orders.stats().created;
        wait_until("order created after reset", move || {
            orders.stats().created > before
        })
        .await;

        supervisor.stop().await;
    }

    #[tokio::test]
    async fn start_is_idempotent_guarded() {
        let supervisor = Supervisor::new(test_config()).await;
        supervisor.add_provider(Box::new(ReplayProvider::new("replay", bars(1))), 1);
        supervisor.start().await.unwrap();
        assert!(supervisor.start().await.is_err());
        supervisor.stop().await;
        // Stopping twice is a no-op.
        supervisor.stop().await;
    }
}
