//! Multi-broker pool: selection policies, failover, rate limits, health
//! probes, and order-to-broker affinity.

use dashmap::DashMap;
use parking_lot::{Mutex as PlMutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use tw_bus::EventBus;
use tw_types::events::{AlertKind, EventPayload, SystemAlert};
use tw_types::orders::{Order, OrderId};

use crate::broker::{
    AccountInfo, Broker, BrokerError, BrokerPosition, BrokerResult, BrokerUpdate,
};
use crate::health::{BrokerHealth, RateWindow};

/// Per-broker pool configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Lower wins under the priority policy.
    pub priority: u32,
    pub enabled: bool,
    pub max_orders_per_minute: u32,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            priority: 100,
            enabled: true,
            max_orders_per_minute: 100,
        }
    }
}

/// Which broker gets the next order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectionPolicy {
    Priority,
    RoundRobin,
    HealthBased,
    PerformanceBased,
}

/// Pool-level configuration.
#[derive(Debug, Clone)]
pub struct BrokerManagerConfig {
    pub policy: SelectionPolicy,
    pub max_failover_attempts: u32,
    pub health_check_interval: Duration,
    /// Consecutive probe passes a critical broker needs to rejoin.
    pub recovery_probes: u32,
    /// Upper bound on any single broker call.
    pub submit_timeout: Duration,
    /// Weight of EMA latency (ms) in the health-based score.
    pub latency_penalty: f64,
}

impl Default for BrokerManagerConfig {
    fn default() -> Self {
        Self {
            policy: SelectionPolicy::Priority,
            max_failover_attempts: 3,
            health_check_interval: Duration::from_secs(30),
            recovery_probes: 2,
            submit_timeout: Duration::from_secs(10),
            latency_penalty: 0.1,
        }
    }
}

/// Pool-level counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ManagerStats {
    pub total_submissions: u64,
    pub successful_submissions: u64,
    pub failed_submissions: u64,
    pub failover_events: u64,
    pub per_broker_submissions: Vec<(String, u64)>,
}

struct BrokerSlot {
    name: String,
    config: BrokerConfig,
    broker: Mutex<Box<dyn Broker>>,
    health: PlMutex<BrokerHealth>,
    window: PlMutex<RateWindow>,
    submissions: AtomicU64,
}

struct ManagerInner {
    config: BrokerManagerConfig,
    bus: EventBus,
    slots: RwLock<Vec<Arc<BrokerSlot>>>,
    affinity: DashMap<OrderId, String>,
    round_robin: AtomicUsize,
    pending_pumps: PlMutex<Vec<(String, mpsc::UnboundedReceiver<BrokerUpdate>)>>,
    tasks: PlMutex<Vec<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
    total_submissions: AtomicU64,
    successful_submissions: AtomicU64,
    failed_submissions: AtomicU64,
    failover_events: AtomicU64,
}

/// The broker pool manager.
#[derive(Clone)]
pub struct BrokerManager {
    inner: Arc<ManagerInner>,
}

impl BrokerManager {
    pub fn new(config: BrokerManagerConfig, bus: EventBus) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(ManagerInner {
                config,
                bus,
                slots: RwLock::new(Vec::new()),
                affinity: DashMap::new(),
                round_robin: AtomicUsize::new(0),
                pending_pumps: PlMutex::new(Vec::new()),
                tasks: PlMutex::new(Vec::new()),
                shutdown,
                total_submissions: AtomicU64::new(0),
                successful_submissions: AtomicU64::new(0),
                failed_submissions: AtomicU64::new(0),
                failover_events: AtomicU64::new(0),
            }),
        }
    }

    /// Register a broker before `start`. Takes the adapter's update stream so
    /// the pump can be spawned at startup.
    pub fn add_broker(&self, mut broker: Box<dyn Broker>, config: BrokerConfig) {
        let name = broker.name().to_string();
        let updates = broker.subscribe_updates();
        let slot = Arc::new(BrokerSlot {
            name: name.clone(),
            window: PlMutex::new(RateWindow::per_minute(config.max_orders_per_minute)),
            config,
            broker: Mutex::new(broker),
            health: PlMutex::new(BrokerHealth::default()),
            submissions: AtomicU64::new(0),
        });
        self.inner.slots.write().push(slot);
        self.inner.pending_pumps.lock().push((name, updates));
    }

    /// Connect every enabled broker, spawn the update pumps and the health
    /// monitor.
    pub async fn start(&self) -> BrokerResult<()> {
        let slots: Vec<Arc<BrokerSlot>> = self.inner.slots.read().clone();
        for slot in &slots {
            if !slot.config.enabled {
                continue;
            }
            let mut broker = slot.broker.lock().await;
            match broker.connect().await {
                Ok(()) => info!(broker = %slot.name, "broker connected"),
                Err(e) => {
                    warn!(broker = %slot.name, error = %e, "broker connect failed");
                    slot.health.lock().record_failure(&e.to_string());
                }
            }
        }

        // Update pumps: adapter stream -> bus topics.
        let pumps: Vec<(String, mpsc::UnboundedReceiver<BrokerUpdate>)> =
            self.inner.pending_pumps.lock().drain(..).collect();
        for (name, mut rx) in pumps {
            let bus = self.inner.bus.clone();
            let handle = tokio::spawn(async move {
                while let Some(update) = rx.recv().await {
                    let payload = match update {
                        BrokerUpdate::Status(status) => EventPayload::OrderStatus(status),
                        BrokerUpdate::Fill(fill) => EventPayload::Fill(fill),
                    };
                    if let Err(e) = bus.publish(payload).await {
                        warn!(broker = %name, error = %e, "broker update publish failed");
                    }
                }
            });
            self.inner.tasks.lock().push(handle);
        }

        // Health monitor.
        let inner = self.inner.clone();
        let mut shutdown_rx = self.inner.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = tokio::time::sleep(inner.config.health_check_interval) => {}
                }
                run_health_checks(&inner).await;
            }
        });
        self.inner.tasks.lock().push(handle);

        Ok(())
    }

    /// Stop the monitor and pumps and disconnect every broker.
    pub async fn stop(&self) {
        let _ = self.inner.shutdown.send(true);
        for handle in self.inner.tasks.lock().drain(..) {
            handle.abort();
        }
        let slots: Vec<Arc<BrokerSlot>> = self.inner.slots.read().clone();
        for slot in &slots {
            let mut broker = slot.broker.lock().await;
            if let Err(e) = broker.disconnect().await {
                warn!(broker = %slot.name, error = %e, "disconnect failed");
            }
        }
        info!("broker manager stopped");
    }

    /// Submit through the pool with failover. Returns the broker-side order
    /// id and the broker that accepted it.
    pub async fn submit(&self, order: &Order) -> BrokerResult<(OrderId, String)> {
        self.inner.total_submissions.fetch_add(1, Ordering::Relaxed);

        let mut tried: HashSet<String> = HashSet::new();
        let mut attempts: u32 = 0;

        while attempts < self.inner.config.max_failover_attempts {
            let slot = match self.select(&tried) {
                Some(slot) => slot,
                None => break,
            };
            attempts += 1;
            tried.insert(slot.name.clone());

            let started = Instant::now();
            let submit_result = {
                let mut broker = slot.broker.lock().await;
                tokio::time::timeout(
                    self.inner.config.submit_timeout,
                    broker.submit_order(order),
                )
                .await
            };
            let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

            let error = match submit_result {
                Ok(Ok(broker_order_id)) => {
                    slot.health.lock().record_success(elapsed_ms);
                    slot.window.lock().record();
                    slot.submissions.fetch_add(1, Ordering::Relaxed);
                    self.inner.affinity.insert(order.id, slot.name.clone());
                    self.inner
                        .successful_submissions
                        .fetch_add(1, Ordering::Relaxed);
                    if attempts > 1 {
                        self.inner.failover_events.fetch_add(1, Ordering::Relaxed);
                    }
                    debug!(
                        order_id = %order.id,
                        broker = %slot.name,
                        attempts,
                        "order submitted"
                    );
                    return Ok((broker_order_id, slot.name.clone()));
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => BrokerError::Timeout {
                    timeout_ms: self.inner.config.submit_timeout.as_millis() as u64,
                }
                .to_string(),
            };

            let became_critical = {
                let mut health = slot.health.lock();
                let was_critical = health.is_critical();
                health.record_failure(&error);
                !was_critical && health.is_critical()
            };
            warn!(
                order_id = %order.id,
                broker = %slot.name,
                attempt = attempts,
                error = %error,
                "submission failed"
            );
            if became_critical {
                let _ = self
                    .inner
                    .bus
                    .publish(EventPayload::SystemAlert(SystemAlert::warning(
                        AlertKind::BrokerStateChanged {
                            broker: slot.name.clone(),
                            healthy: false,
                        },
                    )))
                    .await;
            }
        }

        self.inner.failed_submissions.fetch_add(1, Ordering::Relaxed);
        if attempts == 0 {
            Err(BrokerError::NoBrokerAvailable)
        } else {
            Err(BrokerError::AllBrokersFailed { attempts })
        }
    }

    /// Cancel through the broker the order is bound to. Live orders never
    /// migrate venues, so the binding holds even for degraded brokers.
    pub async fn cancel(&self, order_id: OrderId) -> BrokerResult<()> {
        let broker_name = self
            .inner
            .affinity
            .get(&order_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| BrokerError::OrderNotFound {
                order_id: order_id.to_string(),
            })?;
        let slot = self
            .slot_by_name(&broker_name)
            .ok_or_else(|| BrokerError::Internal {
                message: format!("bound broker {broker_name} no longer registered"),
            })?;
        let mut broker = slot.broker.lock().await;
        broker.cancel_order(order_id).await
    }

    /// Account info from the pool primary (best non-critical by priority).
    pub async fn account(&self) -> BrokerResult<AccountInfo> {
        let slot = self.primary().ok_or(BrokerError::NoBrokerAvailable)?;
        let broker = slot.broker.lock().await;
        broker.account().await
    }

    /// Positions from the pool primary.
    pub async fn positions(&self) -> BrokerResult<Vec<BrokerPosition>> {
        let slot = self.primary().ok_or(BrokerError::NoBrokerAvailable)?;
        let broker = slot.broker.lock().await;
        broker.positions().await
    }

    /// The broker an order is bound to, if any.
    pub fn bound_broker(&self, order_id: OrderId) -> Option<String> {
        self.inner
            .affinity
            .get(&order_id)
            .map(|entry| entry.value().clone())
    }

    pub fn health_of(&self, name: &str) -> Option<BrokerHealth> {
        self.slot_by_name(name).map(|s| s.health.lock().clone())
    }

    pub fn stats(&self) -> ManagerStats {
        let per_broker = self
            .inner
            .slots
            .read()
            .iter()
            .map(|s| (s.name.clone(), s.submissions.load(Ordering::Relaxed)))
            .collect();
        ManagerStats {
            total_submissions: self.inner.total_submissions.load(Ordering::Relaxed),
            successful_submissions: self.inner.successful_submissions.load(Ordering::Relaxed),
            failed_submissions: self.inner.failed_submissions.load(Ordering::Relaxed),
            failover_events: self.inner.failover_events.load(Ordering::Relaxed),
            per_broker_submissions: per_broker,
        }
    }

    fn slot_by_name(&self, name: &str) -> Option<Arc<BrokerSlot>> {
        self.inner
            .slots
            .read()
            .iter()
            .find(|s| s.name == name)
            .cloned()
    }

    fn primary(&self) -> Option<Arc<BrokerSlot>> {
        self.inner
            .slots
            .read()
            .iter()
            .filter(|s| s.config.enabled && !s.health.lock().is_critical())
            .min_by_key(|s| s.config.priority)
            .cloned()
    }

    /// Eligible = enabled, not critical, not already tried, inside its rate
    /// window. The active policy picks among them.
    fn select(&self, tried: &HashSet<String>) -> Option<Arc<BrokerSlot>> {
        let slots = self.inner.slots.read();
        let eligible: Vec<&Arc<BrokerSlot>> = slots
            .iter()
            .filter(|s| {
                s.config.enabled
                    && !tried.contains(&s.name)
                    && !s.health.lock().is_critical()
                    && s.window.lock().has_room()
            })
            .collect();
        if eligible.is_empty() {
            return None;
        }

        let chosen = match self.inner.config.policy {
            SelectionPolicy::Priority => eligible
                .iter()
                .min_by_key(|s| s.config.priority)
                .copied(),
            SelectionPolicy::RoundRobin => {
                let n = self.inner.round_robin.fetch_add(1, Ordering::Relaxed);
                eligible.get(n % eligible.len()).copied()
            }
            SelectionPolicy::HealthBased => {
                let k = self.inner.config.latency_penalty;
                eligible
                    .iter()
                    .max_by(|a, b| {
                        let score_a = broker_score(&a.health.lock(), k);
                        let score_b = broker_score(&b.health.lock(), k);
                        score_a
                            .partial_cmp(&score_b)
                            .unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .copied()
            }
            SelectionPolicy::PerformanceBased => eligible
                .iter()
                .min_by(|a, b| {
                    let la = a.health.lock().avg_response_ms;
                    let lb = b.health.lock().avg_response_ms;
                    la.partial_cmp(&lb).unwrap_or(std::cmp::Ordering::Equal)
                })
                .copied(),
        };
        chosen.cloned()
    }
}

fn broker_score(health: &BrokerHealth, latency_penalty: f64) -> f64 {
    health.success_rate() - latency_penalty * health.avg_response_ms
}

async fn run_health_checks(inner: &Arc<ManagerInner>) {
    let slots: Vec<Arc<BrokerSlot>> = inner.slots.read().clone();
    for slot in &slots {
        if !slot.config.enabled {
            continue;
        }
        let started = Instant::now();
        let probe = {
            let broker = slot.broker.lock().await;
            tokio::time::timeout(inner.config.submit_timeout, broker.account()).await
        };
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        match probe {
            Ok(Ok(_)) => {
                let recovered = slot
                    .health
                    .lock()
                    .record_probe_pass(elapsed_ms, inner.config.recovery_probes);
                if recovered {
                    info!(broker = %slot.name, "broker recovered");
                    let _ = inner
                        .bus
                        .publish(EventPayload::SystemAlert(SystemAlert::warning(
                            AlertKind::BrokerStateChanged {
                                broker: slot.name.clone(),
                                healthy: true,
                            },
                        )))
                        .await;
                }
            }
            Ok(Err(e)) => {
                record_probe_failure(inner, slot, &e.to_string()).await;
            }
            Err(_) => {
                record_probe_failure(inner, slot, "health probe timed out").await;
            }
        }
    }
}

async fn record_probe_failure(inner: &Arc<ManagerInner>, slot: &Arc<BrokerSlot>, error: &str) {
    let became_critical = {
        let mut health = slot.health.lock();
        let was = health.is_critical();
        health.record_failure(error);
        !was && health.is_critical()
    };
    warn!(broker = %slot.name, error = %error, "health probe failed");
    if became_critical {
        let _ = inner
            .bus
            .publish(EventPayload::SystemAlert(SystemAlert::warning(
                AlertKind::BrokerStateChanged {
                    broker: slot.name.clone(),
                    healthy: false,
                },
            )))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paper::{PaperBroker, PaperBrokerConfig};
    use rust_decimal_macros::dec;
    use tw_bus::ChannelForwarder;
    use tw_types::events::Topic;
    use tw_types::market::Symbol;
    use tw_types::orders::{OrderStatus, Side};

    fn sym() -> Symbol {
        Symbol::equity("AAPL")
    }

    fn priced_paper(name: &str) -> PaperBroker {
        let mut b = PaperBroker::new(name, PaperBrokerConfig::default());
        b.set_price(sym(), dec!(100));
        b
    }

    fn order() -> Order {
        Order::market(sym(), Side::Buy, dec!(10))
    }

    async fn two_broker_manager(policy: SelectionPolicy, fail_a: u32) -> BrokerManager {
        let bus = EventBus::with_defaults();
        let manager = BrokerManager::new(
            BrokerManagerConfig {
                policy,
                ..Default::default()
            },
            bus,
        );
        let mut a = priced_paper("alpha");
        if fail_a > 0 {
            a.fail_submissions(fail_a);
        }
        let b = priced_paper("beta");
        manager.add_broker(
            Box::new(a),
            BrokerConfig {
                priority: 1,
                ..Default::default()
            },
        );
        manager.add_broker(
            Box::new(b),
            BrokerConfig {
                priority: 2,
                ..Default::default()
            },
        );
        manager.start().await.unwrap();
        manager
    }

    #[tokio::test]
    async fn priority_policy_prefers_lowest_priority() {
        let manager = two_broker_manager(SelectionPolicy::Priority, 0).await;
        let (_, broker) = manager.submit(&order()).await.unwrap();
        assert_eq!(broker, "alpha");
        manager.stop().await;
    }

    #[tokio::test]
    async fn failover_reaches_second_broker_and_marks_first_critical() {
        // Three consecutive submit errors on the first-choice broker.
        let manager = two_broker_manager(SelectionPolicy::Priority, 3).await;

        let (_, b1) = manager.submit(&order()).await.unwrap();
        let (_, b2) = manager.submit(&order()).await.unwrap();
        let (_, b3) = manager.submit(&order()).await.unwrap();
        assert_eq!([b1.as_str(), b2.as_str(), b3.as_str()], ["beta"; 3]);

        let health = manager.health_of("alpha").unwrap();
        assert!(health.is_critical());
        assert_eq!(health.error_count, 3);
        assert!(health.success_rate() < 50.0);

        // Fourth order skips alpha entirely.
        let (_, b4) = manager.submit(&order()).await.unwrap();
        assert_eq!(b4, "beta");
        assert_eq!(manager.stats().failover_events, 3);
        manager.stop().await;
    }

    #[tokio::test]
    async fn all_brokers_failing_exhausts_attempts() {
        let bus = EventBus::with_defaults();
        let manager = BrokerManager::new(BrokerManagerConfig::default(), bus);
        let mut a = priced_paper("alpha");
        a.fail_submissions(10);
        let mut b = priced_paper("beta");
        b.fail_submissions(10);
        manager.add_broker(Box::new(a), BrokerConfig::default());
        manager.add_broker(Box::new(b), BrokerConfig::default());
        manager.start().await.unwrap();

        let err = manager.submit(&order()).await.unwrap_err();
        assert!(matches!(err, BrokerError::AllBrokersFailed { .. }));
        assert_eq!(manager.stats().failed_submissions, 1);
        manager.stop().await;
    }

    #[tokio::test]
    async fn round_robin_distributes() {
        let manager = two_broker_manager(SelectionPolicy::RoundRobin, 0).await;
        for _ in 0..4 {
            manager.submit(&order()).await.unwrap();
        }
        let stats = manager.stats();
        for (_, count) in &stats.per_broker_submissions {
            assert_eq!(*count, 2);
        }
        manager.stop().await;
    }

    #[tokio::test]
    async fn rate_limited_broker_is_skipped() {
        let bus = EventBus::with_defaults();
        let manager = BrokerManager::new(BrokerManagerConfig::default(), bus);
        manager.add_broker(
            Box::new(priced_paper("alpha")),
            BrokerConfig {
                priority: 1,
                max_orders_per_minute: 1,
                ..Default::default()
            },
        );
        manager.add_broker(
            Box::new(priced_paper("beta")),
            BrokerConfig {
                priority: 2,
                ..Default::default()
            },
        );
        manager.start().await.unwrap();

        let (_, first) = manager.submit(&order()).await.unwrap();
        let (_, second) = manager.submit(&order()).await.unwrap();
        assert_eq!(first, "alpha");
        assert_eq!(second, "beta");
        manager.stop().await;
    }

    #[tokio::test]
    async fn updates_are_republished_on_the_bus() {
        let bus = EventBus::with_defaults();
        let (fills, mut fill_rx) = ChannelForwarder::new();
        bus.subscribe(Topic::Fill, "t", Arc::new(fills)).unwrap();
        let (statuses, mut status_rx) = ChannelForwarder::new();
        bus.subscribe(Topic::OrderStatus, "t", Arc::new(statuses))
            .unwrap();

        let manager = BrokerManager::new(BrokerManagerConfig::default(), bus.clone());
        manager.add_broker(Box::new(priced_paper("alpha")), BrokerConfig::default());
        manager.start().await.unwrap();

        let o = order();
        manager.submit(&o).await.unwrap();

        let status = tokio::time::timeout(Duration::from_secs(1), status_rx.recv())
            .await
            .unwrap()
            .unwrap();
        match status.payload {
            EventPayload::OrderStatus(s) => {
                assert_eq!(s.order_id, o.id);
                assert_eq!(s.status, OrderStatus::Submitted);
            }
            other => panic!("expected status, got {other:?}"),
        }

        let fill = tokio::time::timeout(Duration::from_secs(1), fill_rx.recv())
            .await
            .unwrap()
            .unwrap();
        match fill.payload {
            EventPayload::Fill(f) => assert_eq!(f.order_id, o.id),
            other => panic!("expected fill, got {other:?}"),
        }
        manager.stop().await;
    }

    #[tokio::test]
    async fn cancel_routes_to_bound_broker() {
        let bus = EventBus::with_defaults();
        let (statuses, mut status_rx) = ChannelForwarder::new();
        bus.subscribe(Topic::OrderStatus, "t", Arc::new(statuses))
            .unwrap();

        let manager = BrokerManager::new(BrokerManagerConfig::default(), bus.clone());
        manager.add_broker(Box::new(priced_paper("alpha")), BrokerConfig::default());
        manager.start().await.unwrap();

        // Limit order far from the market stays open.
        let o = Order::limit(sym(), Side::Buy, dec!(10), dec!(1));
        manager.submit(&o).await.unwrap();
        assert_eq!(manager.bound_broker(o.id).as_deref(), Some("alpha"));

        manager.cancel(o.id).await.unwrap();

        let mut saw_cancelled = false;
        while let Ok(event) =
            tokio::time::timeout(Duration::from_millis(200), status_rx.recv()).await
        {
            if let Some(event) = event {
                if let EventPayload::OrderStatus(s) = event.payload {
                    if s.status == OrderStatus::Cancelled {
                        saw_cancelled = true;
                        break;
                    }
                }
            } else {
                break;
            }
        }
        assert!(saw_cancelled);
        manager.stop().await;
    }

    #[tokio::test]
    async fn cancel_unknown_order_errors() {
        let bus = EventBus::with_defaults();
        let manager = BrokerManager::new(BrokerManagerConfig::default(), bus);
        manager.add_broker(Box::new(priced_paper("alpha")), BrokerConfig::default());
        manager.start().await.unwrap();

        let err = manager.cancel(uuid::Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, BrokerError::OrderNotFound { .. }));
        manager.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn health_monitor_recovers_critical_broker() {
        let bus = EventBus::with_defaults();
        let (alerts, mut alert_rx) = ChannelForwarder::new();
        bus.subscribe(Topic::SystemAlert, "t", Arc::new(alerts))
            .unwrap();

        let manager = BrokerManager::new(
            BrokerManagerConfig {
                health_check_interval: Duration::from_millis(100),
                recovery_probes: 2,
                ..Default::default()
            },
            bus.clone(),
        );
        let mut a = priced_paper("alpha");
        a.fail_submissions(3);
        manager.add_broker(
            Box::new(a),
            BrokerConfig {
                priority: 1,
                ..Default::default()
            },
        );
        manager.add_broker(
            Box::new(priced_paper("beta")),
            BrokerConfig {
                priority: 2,
                ..Default::default()
            },
        );
        manager.start().await.unwrap();

        // Drive alpha critical.
        manager.submit(&order()).await.unwrap();
        manager.submit(&order()).await.unwrap();
        manager.submit(&order()).await.unwrap();
        assert!(manager.health_of("alpha").unwrap().is_critical());

        // Two probe rounds later it is healthy again.
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(!manager.health_of("alpha").unwrap().is_critical());

        let mut saw_recovery = false;
        while let Ok(event) = alert_rx.try_recv() {
            if let EventPayload::SystemAlert(a) = event.payload {
                if matches!(
                    a.kind,
                    AlertKind::BrokerStateChanged { healthy: true, .. }
                ) {
                    saw_recovery = true;
                }
            }
        }
        assert!(saw_recovery);

        // Priority routing returns to alpha.
        let (_, broker) = manager.submit(&order()).await.unwrap();
        assert_eq!(broker, "alpha");
        manager.stop().await;
    }
}
