//! The strategy host: owns strategy instances, fans out market data, and
//! publishes the signals strategies emit.
//!
//! Each strategy runs on its own task with a bounded inbox, so a slow or
//! failing strategy never touches its neighbours. A strategy whose callback
//! errors is moved to the `Error` state and receives nothing further.

use async_trait::async_trait;
use parking_lot::Mutex as PlMutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use tw_bus::{EventBus, EventHandler};
use tw_types::events::{
    AlertKind, Event, EventPayload, StrategyLifecycleEvent, StrategyState, SystemAlert, Topic,
};
use tw_types::market::Bar;
use tw_types::orders::Fill;
use tw_types::portfolio::Portfolio;
use tw_types::signal::Signal;
use tw_types::stop::EmergencyStop;

use crate::strategy::{Strategy, StrategyConfig, StrategyContext};

/// Host tuning.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Depth of each strategy's inbox.
    pub inbox_depth: usize,
    /// Bars kept per symbol in each strategy's context.
    pub buffer_capacity: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            inbox_depth: 256,
            buffer_capacity: 500,
        }
    }
}

enum StrategyInput {
    Bar(Bar),
    Fill(Fill),
    PortfolioUpdate(Portfolio),
    Shutdown,
}

struct StrategySlot {
    config: StrategyConfig,
    tx: mpsc::Sender<StrategyInput>,
    state: PlMutex<StrategyState>,
    task: PlMutex<Option<JoinHandle<()>>>,
}

impl StrategySlot {
    fn state(&self) -> StrategyState {
        *self.state.lock()
    }
}

struct HostInner {
    config: HostConfig,
    bus: EventBus,
    stop: EmergencyStop,
    slots: PlMutex<HashMap<String, Arc<StrategySlot>>>,
}

/// The strategy host.
#[derive(Clone)]
pub struct StrategyHost {
    inner: Arc<HostInner>,
}

impl StrategyHost {
    pub fn new(config: HostConfig, bus: EventBus, stop: EmergencyStop) -> Self {
        Self {
            inner: Arc::new(HostInner {
                config,
                bus,
                stop,
                slots: PlMutex::new(HashMap::new()),
            }),
        }
    }

    /// Subscribe the host to the topics it fans out.
    pub fn attach(&self, bus: &EventBus) -> Result<(), tw_bus::BusError> {
        let handler: Arc<dyn EventHandler> = Arc::new(self.clone());
        bus.subscribe(Topic::MarketData, "strategy_host", handler.clone())?;
        bus.subscribe(Topic::Fill, "strategy_host", handler.clone())?;
        bus.subscribe(Topic::PortfolioUpdate, "strategy_host", handler)?;
        Ok(())
    }

    /// Initialize and launch a strategy. Fails if the id is taken or
    /// `initialize` errors.
    pub async fn register(
        &self,
        mut strategy: Box<dyn Strategy>,
        config: StrategyConfig,
    ) -> Result<(), String> {
        let strategy_id = config.strategy_id.clone();
        if self.inner.slots.lock().contains_key(&strategy_id) {
            return Err(format!("strategy {strategy_id} already registered"));
        }
        if config.symbols.is_empty() {
            return Err(format!("strategy {strategy_id} declares no symbols"));
        }

        self.publish_lifecycle(&strategy_id, StrategyState::Created, None)
            .await;
        strategy.initialize(&config).map_err(|e| {
            format!("strategy {strategy_id} initialization failed: {e}")
        })?;

        let (tx, rx) = mpsc::channel(self.inner.config.inbox_depth);
        let slot = Arc::new(StrategySlot {
            config: config.clone(),
            tx,
            state: PlMutex::new(StrategyState::Running),
            task: PlMutex::new(None),
        });
        self.inner
            .slots
            .lock()
            .insert(strategy_id.clone(), slot.clone());

        let inner = self.inner.clone();
        let task_slot = slot.clone();
        let handle = tokio::spawn(async move {
            run_strategy(inner, task_slot, strategy, rx).await;
        });
        *slot.task.lock() = Some(handle);

        self.publish_lifecycle(&strategy_id, StrategyState::Running, None)
            .await;
        info!(strategy = %strategy_id, symbols = config.symbols.len(), "strategy registered");
        Ok(())
    }

    /// Current lifecycle state, if registered.
    pub fn state_of(&self, strategy_id: &str) -> Option<StrategyState> {
        self.inner.slots.lock().get(strategy_id).map(|s| s.state())
    }

    pub fn strategy_ids(&self) -> Vec<String> {
        self.inner.slots.lock().keys().cloned().collect()
    }

    /// Stop every strategy: deliver `Shutdown`, then wait for the tasks to
    /// drain their inboxes, bounded by `timeout`.
    pub async fn stop_all(&self, timeout: Duration) {
        let slots: Vec<Arc<StrategySlot>> =
            self.inner.slots.lock().values().cloned().collect();
        for slot in &slots {
            let _ = slot.tx.send(StrategyInput::Shutdown).await;
        }
        let deadline = Instant::now() + timeout;
        for slot in &slots {
            let handle = slot.task.lock().take();
            if let Some(handle) = handle {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if tokio::time::timeout(remaining, handle).await.is_err() {
                    warn!(strategy = %slot.config.strategy_id, "strategy did not stop in time; abandoned");
                }
            }
        }
        info!("strategy host stopped");
    }

    async fn publish_lifecycle(
        &self,
        strategy_id: &str,
        state: StrategyState,
        reason: Option<&str>,
    ) {
        let mut event = StrategyLifecycleEvent::new(strategy_id, state);
        if let Some(reason) = reason {
            event = event.with_reason(reason);
        }
        let _ = self
            .inner
            .bus
            .publish(EventPayload::StrategyLifecycle(event))
            .await;
    }

    async fn fan_out_bar(&self, bar: Bar) {
        let targets: Vec<Arc<StrategySlot>> = {
            let slots = self.inner.slots.lock();
            slots
                .values()
                .filter(|s| s.state() == StrategyState::Running && s.config.accepts(&bar))
                .cloned()
                .collect()
        };
        for slot in targets {
            // Bounded send: a full inbox backpressures the host worker, and
            // the lossy market_data topic sheds load upstream of that.
            if slot.tx.send(StrategyInput::Bar(bar.clone())).await.is_err() {
                // A closed inbox on a Running strategy means its task died
                // (panic); latch the error state so delivery stops.
                if slot.state() == StrategyState::Running {
                    fail_strategy(
                        &self.inner,
                        &slot,
                        &slot.config.strategy_id,
                        "strategy task terminated unexpectedly",
                    )
                    .await;
                } else {
                    debug!(strategy = %slot.config.strategy_id, "inbox closed; bar dropped");
                }
            }
        }
    }

    /// Fills route only to the strategy that owns them.
    async fn fan_out_fill(&self, fill: Fill) {
        let strategy_id = match &fill.strategy_id {
            Some(id) => id.clone(),
            None => return,
        };
        let slot = self.inner.slots.lock().get(&strategy_id).cloned();
        if let Some(slot) = slot {
            if slot.state() == StrategyState::Running {
                let _ = slot.tx.send(StrategyInput::Fill(fill)).await;
            }
        }
    }

    async fn fan_out_portfolio(&self, portfolio: Portfolio) {
        let targets: Vec<Arc<StrategySlot>> = {
            let slots = self.inner.slots.lock();
            slots
                .values()
                .filter(|s| s.state() == StrategyState::Running)
                .cloned()
                .collect()
        };
        for slot in targets {
            let _ = slot
                .tx
                .send(StrategyInput::PortfolioUpdate(portfolio.clone()))
                .await;
        }
    }
}

async fn run_strategy(
    inner: Arc<HostInner>,
    slot: Arc<StrategySlot>,
    mut strategy: Box<dyn Strategy>,
    mut rx: mpsc::Receiver<StrategyInput>,
) {
    let strategy_id = slot.config.strategy_id.clone();
    let mut ctx = StrategyContext::new(inner.config.buffer_capacity);

    while let Some(input) = rx.recv().await {
        match input {
            StrategyInput::Bar(bar) => {
                ctx.record_bar(&bar);
                match strategy.on_bar(&bar, &ctx) {
                    Ok(signals) => {
                        if inner.stop.is_engaged() {
                            // Paused under emergency stop: data continues to
                            // flow, nothing is emitted.
                            continue;
                        }
                        for mut signal in signals {
                            if !signal.is_actionable() {
                                continue;
                            }
                            // The host owns signal identity.
                            signal.id = Signal::deterministic_id(
                                &strategy_id,
                                &signal.symbol,
                                bar.timestamp,
                                signal.side,
                            );
                            signal.strategy_id = strategy_id.clone();
                            if let Err(e) = inner
                                .bus
                                .publish(EventPayload::Signal(signal))
                                .await
                            {
                                warn!(strategy = %strategy_id, error = %e, "signal publish failed");
                            }
                        }
                    }
                    Err(error) => {
                        fail_strategy(&inner, &slot, &strategy_id, &error).await;
                        break;
                    }
                }
            }
            StrategyInput::Fill(fill) => {
                if let Err(error) = strategy.on_fill(&fill, &ctx) {
                    fail_strategy(&inner, &slot, &strategy_id, &error).await;
                    break;
                }
            }
            StrategyInput::PortfolioUpdate(portfolio) => {
                ctx.portfolio = Arc::new(portfolio);
                if let Err(error) = strategy.on_portfolio_update(&ctx.portfolio) {
                    fail_strategy(&inner, &slot, &strategy_id, &error).await;
                    break;
                }
            }
            StrategyInput::Shutdown => {
                if let Err(e) = strategy.shutdown() {
                    warn!(strategy = %strategy_id, error = %e, "shutdown hook failed");
                }
                *slot.state.lock() = StrategyState::Stopped;
                let _ = inner
                    .bus
                    .publish(EventPayload::StrategyLifecycle(StrategyLifecycleEvent::new(
                        &strategy_id,
                        StrategyState::Stopped,
                    )))
                    .await;
                break;
            }
        }
    }
    debug!(strategy = %strategy_id, "strategy task exited");
}

async fn fail_strategy(
    inner: &Arc<HostInner>,
    slot: &Arc<StrategySlot>,
    strategy_id: &str,
    error: &str,
) {
    warn!(strategy = %strategy_id, error = %error, "strategy failed; isolating");
    *slot.state.lock() = StrategyState::Error;
    let _ = inner
        .bus
        .publish(EventPayload::StrategyLifecycle(
            StrategyLifecycleEvent::new(strategy_id, StrategyState::Error).with_reason(error),
        ))
        .await;
    let _ = inner
        .bus
        .publish(EventPayload::SystemAlert(SystemAlert::critical(
            AlertKind::StrategyFailed {
                strategy_id: strategy_id.to_string(),
                error: error.to_string(),
            },
        )))
        .await;
}

#[async_trait]
impl EventHandler for StrategyHost {
    async fn handle(&self, event: Event) -> Result<(), String> {
        match event.payload {
            EventPayload::MarketData(bar) => self.fan_out_bar(bar).await,
            EventPayload::Fill(fill) => self.fan_out_fill(fill).await,
            EventPayload::PortfolioUpdate(portfolio) => self.fan_out_portfolio(portfolio).await,
            _ => {}
        }
        Ok(())
    }
}
