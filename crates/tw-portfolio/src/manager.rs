use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

use tw_bus::{EventBus, EventHandler};
use tw_store::Repository;
use tw_types::errors::PortfolioError;
use tw_types::events::{AlertKind, Event, EventPayload, SystemAlert, Topic};
use tw_types::market::Bar;
use tw_types::orders::{Fill, FillId};
use tw_types::portfolio::Portfolio;
use tw_types::stop::EmergencyStop;

/// Tuning for the portfolio core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioConfig {
    /// How many recently applied fill ids are remembered for deduplication.
    pub dedup_cache_size: usize,
    /// Attempts to persist a fill before declaring the store degraded.
    pub persist_attempts: u32,
    /// Base backoff between persist attempts; doubles per retry.
    pub persist_backoff_ms: u64,
}

impl Default for PortfolioConfig {
    fn default() -> Self {
        Self {
            dedup_cache_size: 10_000,
            persist_attempts: 5,
            persist_backoff_ms: 100,
        }
    }
}

/// Bounded FIFO set of recently seen fill ids.
#[derive(Debug)]
struct FillDedup {
    order: VecDeque<FillId>,
    seen: HashSet<FillId>,
    capacity: usize,
}

impl FillDedup {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity.min(1024)),
            seen: HashSet::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
        }
    }

    /// Record an id; returns `false` if it was already present.
    fn insert(&mut self, id: FillId) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }

    fn contains(&self, id: &FillId) -> bool {
        self.seen.contains(id)
    }
}

/// The portfolio core. Subscribe it to the `fill` and `market_data` topics;
/// the fill subscription's serialized worker is the single writer for
/// position and cash state.
pub struct PortfolioManager {
    config: PortfolioConfig,
    repository: Arc<dyn Repository>,
    bus: EventBus,
    stop: EmergencyStop,
    state: RwLock<Arc<Portfolio>>,
    dedup: Mutex<FillDedup>,
}

impl PortfolioManager {
    pub fn new(
        initial: Portfolio,
        repository: Arc<dyn Repository>,
        bus: EventBus,
        stop: EmergencyStop,
        config: PortfolioConfig,
    ) -> Self {
        let dedup = Mutex::new(FillDedup::new(config.dedup_cache_size));
        Self {
            config,
            repository,
            bus,
            stop,
            state: RwLock::new(Arc::new(initial)),
            dedup,
        }
    }

    /// Resume from the last persisted snapshot, or start fresh with
    /// `initial_cash`.
    pub async fn load_or_new(
        initial_cash: Decimal,
        repository: Arc<dyn Repository>,
        bus: EventBus,
        stop: EmergencyStop,
        config: PortfolioConfig,
    ) -> Self {
        let initial = match repository.load_portfolio().await {
            Ok(Some(portfolio)) => {
                info!(equity = %portfolio.total_equity, "resumed portfolio from store");
                portfolio
            }
            Ok(None) => Portfolio::new(initial_cash),
            Err(e) => {
                warn!(error = %e, "portfolio load failed; starting fresh");
                Portfolio::new(initial_cash)
            }
        };
        Self::new(initial, repository, bus, stop, config)
    }

    /// Register on the bus. The fill subscription is the writer; the market
    /// data subscription only refreshes marks.
    pub fn attach(self: &Arc<Self>, bus: &EventBus) -> Result<(), tw_bus::BusError> {
        bus.subscribe(Topic::Fill, "portfolio", self.clone())?;
        bus.subscribe(Topic::MarketData, "portfolio", self.clone())?;
        Ok(())
    }

    /// Immutable snapshot of the last committed state.
    pub fn snapshot(&self) -> Arc<Portfolio> {
        self.state.read().clone()
    }

    /// Whether a fill id has already been applied (bounded memory).
    pub fn has_seen_fill(&self, id: &FillId) -> bool {
        self.dedup.lock().contains(id)
    }

    async fn on_fill(&self, fill: Fill) -> Result<(), String> {
        if self.dedup.lock().contains(&fill.id) {
            debug!(fill_id = %fill.id, "duplicate fill dropped");
            return Ok(());
        }

        // 1) Durability first: the fill must be on record before state moves.
        if let Err(error) = self.persist_with_retry(&fill).await {
            error!(fill_id = %fill.id, error = %error, "fill persistence exhausted; engaging emergency stop");
            let _ = self
                .bus
                .publish(EventPayload::SystemAlert(SystemAlert::fatal(
                    AlertKind::RepositoryDegraded {
                        error: error.to_string(),
                    },
                )))
                .await;
            self.engage_stop("repository write failure").await;
            return Ok(());
        }

        // 2) Atomic state mutation via copy-on-write swap.
        let updated = {
            let mut guard = self.state.write();
            let mut next = Portfolio::clone(&guard);
            next.apply_fill(&fill);
            let next = Arc::new(next);
            *guard = next.clone();
            next
        };
        self.dedup.lock().insert(fill.id);

        if let Err(error) = verify_accounting(&updated) {
            error!(error = %error, "portfolio accounting inconsistency");
            let _ = self
                .bus
                .publish(EventPayload::SystemAlert(SystemAlert::fatal(
                    AlertKind::InvariantViolation {
                        component: "portfolio".to_string(),
                        message: error.to_string(),
                    },
                )))
                .await;
            self.engage_stop("portfolio inconsistency").await;
            return Ok(());
        }

        // Best-effort snapshot persistence; the fill itself is already durable.
        if let Err(e) = self.repository.snapshot_portfolio(&updated).await {
            debug!(error = %e, "portfolio snapshot persistence failed");
        }

        // 3) Only now is the update visible on the bus.
        let result = self
            .bus
            .publish(EventPayload::PortfolioUpdate(Portfolio::clone(&updated)))
            .await;
        if let Err(e) = result {
            warn!(error = %e, "portfolio_update publish failed");
        }

        debug!(
            fill_id = %fill.id,
            symbol = %fill.symbol,
            cash = %updated.cash,
            equity = %updated.total_equity,
            "fill applied"
        );
        Ok(())
    }

    fn on_bar(&self, bar: Bar) {
        let mut guard = self.state.write();
        if !guard.positions.contains_key(&bar.symbol) {
            return;
        }
        let mut next = Portfolio::clone(&guard);
        let mut prices = std::collections::HashMap::new();
        prices.insert(bar.symbol.clone(), bar.close);
        next.update_market_prices(&prices);
        *guard = Arc::new(next);
    }

    async fn persist_with_retry(&self, fill: &Fill) -> Result<(), PortfolioError> {
        let mut backoff = Duration::from_millis(self.config.persist_backoff_ms);
        let mut last_error = String::new();
        for attempt in 1..=self.config.persist_attempts {
            match self.repository.record_fill(fill).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    last_error = e.to_string();
                    warn!(
                        fill_id = %fill.id,
                        attempt,
                        error = %last_error,
                        "fill persistence failed; retrying"
                    );
                }
            }
            if attempt < self.config.persist_attempts {
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
        }
        Err(PortfolioError::PersistenceExhausted {
            attempts: self.config.persist_attempts,
            message: last_error,
        })
    }

    async fn engage_stop(&self, reason: &str) {
        if self.stop.engage() {
            let _ = self
                .bus
                .publish(EventPayload::SystemAlert(SystemAlert::critical(
                    AlertKind::EmergencyStopEngaged {
                        reason: reason.to_string(),
                    },
                )))
                .await;
        }
    }
}

/// Committed state must honor the book invariants: equity equals cash plus
/// the sum of position market values, and flat positions never linger in the
/// map.
fn verify_accounting(portfolio: &Portfolio) -> Result<(), PortfolioError> {
    let market_value: Decimal = portfolio.positions.values().map(|p| p.market_value).sum();
    let expected = portfolio.cash + market_value;
    if portfolio.total_equity != expected {
        return Err(PortfolioError::StateInconsistency {
            message: format!(
                "total_equity {} != cash {} + market value {}",
                portfolio.total_equity, portfolio.cash, market_value
            ),
        });
    }
    for (symbol, position) in &portfolio.positions {
        if position.is_flat() {
            return Err(PortfolioError::StateInconsistency {
                message: format!("flat position retained for {symbol}"),
            });
        }
        if position.symbol != *symbol {
            return Err(PortfolioError::StateInconsistency {
                message: format!(
                    "position keyed under {symbol} belongs to {}",
                    position.symbol
                ),
            });
        }
    }
    Ok(())
}

#[async_trait]
impl EventHandler for PortfolioManager {
    async fn handle(&self, event: Event) -> Result<(), String> {
        match event.payload {
            EventPayload::Fill(fill) => self.on_fill(fill).await,
            EventPayload::MarketData(bar) => {
                self.on_bar(bar);
                Ok(())
            }
            _ => Ok(()),
        }
    }
}
