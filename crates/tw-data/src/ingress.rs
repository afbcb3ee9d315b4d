//! Market-data ingress: pulls bars from the active provider, normalizes them,
//! and publishes `market_data` events. Watches heartbeats and fails over
//! across the provider pool.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use tw_bus::EventBus;
use tw_types::events::{AlertKind, EventPayload, SystemAlert};
use tw_types::market::{Bar, Symbol};

use crate::provider::MarketDataProvider;

/// Ingress tuning.
#[derive(Debug, Clone)]
pub struct IngressConfig {
    /// Expected bar cadence; three missed heartbeats trigger failover.
    pub heartbeat: Duration,
    /// Consecutive provider errors before it is marked unhealthy.
    pub failover_errors: u32,
    /// Cool-down before an unhealthy provider may be probed again.
    pub cooldown: Duration,
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            heartbeat: Duration::from_secs(5),
            failover_errors: 3,
            cooldown: Duration::from_secs(30),
        }
    }
}

struct ProviderSlot {
    provider: Box<dyn MarketDataProvider>,
    priority: u32,
    healthy: bool,
    consecutive_errors: u32,
    cooldown_until: Option<Instant>,
}

/// Running ingress task handle.
pub struct IngressHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl IngressHandle {
    /// Signal shutdown and wait for the loop to exit, bounded by `timeout`.
    pub async fn stop(self, timeout: Duration) {
        let _ = self.shutdown.send(true);
        if tokio::time::timeout(timeout, self.task).await.is_err() {
            warn!("ingress did not stop within timeout; abandoning task");
        }
    }
}

enum PollOutcome {
    Shutdown,
    Bar(Bar),
    Eos,
    Error(String),
    HeartbeatExpired,
}

/// The ingress. Build with the provider pool (priority-ordered), then
/// [`MarketDataIngress::start`] to spawn the pump task.
pub struct MarketDataIngress {
    config: IngressConfig,
    bus: EventBus,
    symbols: Vec<Symbol>,
    slots: Vec<ProviderSlot>,
    active: usize,
    watermarks: HashMap<Symbol, DateTime<Utc>>,
}

impl MarketDataIngress {
    pub fn new(config: IngressConfig, bus: EventBus, symbols: Vec<Symbol>) -> Self {
        Self {
            config,
            bus,
            symbols,
            slots: Vec::new(),
            active: 0,
            watermarks: HashMap::new(),
        }
    }

    /// Register a provider. Lower `priority` numbers are preferred.
    pub fn add_provider(&mut self, provider: Box<dyn MarketDataProvider>, priority: u32) {
        self.slots.push(ProviderSlot {
            provider,
            priority,
            healthy: true,
            consecutive_errors: 0,
            cooldown_until: None,
        });
        self.slots.sort_by_key(|s| s.priority);
    }

    /// Spawn the pump loop.
    pub fn start(mut self) -> IngressHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            self.run(shutdown_rx).await;
        });
        IngressHandle {
            shutdown: shutdown_tx,
            task,
        }
    }

    async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        if self.slots.is_empty() {
            warn!("ingress started with no providers");
            return;
        }

        if let Err(e) = self.slots[self.active]
            .provider
            .subscribe(&self.symbols)
            .await
        {
            warn!(error = %e, "initial subscription failed");
            self.mark_active_unhealthy();
        }
        info!(
            provider = %self.slots[self.active].provider.name(),
            symbols = self.symbols.len(),
            "market data ingress running"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            if !self.slots[self.active].healthy {
                if !self.failover().await {
                    let _ = self
                        .bus
                        .publish(EventPayload::SystemAlert(SystemAlert::critical(
                            AlertKind::ProviderExhausted,
                        )))
                        .await;
                    tokio::time::sleep(self.config.cooldown.min(Duration::from_secs(1))).await;
                    continue;
                }
            }

            let outcome = {
                let watchdog = self.config.heartbeat * 3;
                let slot = &mut self.slots[self.active];
                tokio::select! {
                    _ = shutdown.changed() => PollOutcome::Shutdown,
                    polled = tokio::time::timeout(watchdog, slot.provider.next_bar()) => {
                        match polled {
                            Err(_) => PollOutcome::HeartbeatExpired,
                            Ok(Ok(Some(bar))) => PollOutcome::Bar(bar),
                            Ok(Ok(None)) => PollOutcome::Eos,
                            Ok(Err(e)) => PollOutcome::Error(e.to_string()),
                        }
                    }
                }
            };

            match outcome {
                PollOutcome::Shutdown => break,
                PollOutcome::Bar(bar) => {
                    self.slots[self.active].consecutive_errors = 0;
                    self.publish_bar(bar).await;
                }
                PollOutcome::HeartbeatExpired => {
                    warn!(
                        provider = %self.slots[self.active].provider.name(),
                        "no bars within heartbeat window"
                    );
                    self.mark_active_unhealthy();
                }
                PollOutcome::Eos => {
                    warn!(
                        provider = %self.slots[self.active].provider.name(),
                        "provider stream ended"
                    );
                    self.mark_active_unhealthy();
                }
                PollOutcome::Error(message) => {
                    let slot = &mut self.slots[self.active];
                    slot.consecutive_errors += 1;
                    warn!(
                        provider = %slot.provider.name(),
                        errors = slot.consecutive_errors,
                        error = %message,
                        "provider error"
                    );
                    if slot.consecutive_errors >= self.config.failover_errors {
                        self.mark_active_unhealthy();
                    }
                }
            }
        }

        info!("market data ingress stopped");
    }

    fn mark_active_unhealthy(&mut self) {
        let cooldown = self.config.cooldown;
        let slot = &mut self.slots[self.active];
        slot.healthy = false;
        slot.consecutive_errors = 0;
        slot.cooldown_until = Some(Instant::now() + cooldown);
    }

    /// Pick the best healthy (or recovered) provider, preferring priority
    /// order. Returns `false` when every provider is down.
    async fn failover(&mut self) -> bool {
        let previous = self.slots[self.active].provider.name().to_string();
        let now = Instant::now();

        for i in 0..self.slots.len() {
            if i == self.active {
                continue;
            }

            if !self.slots[i].healthy {
                let cooled = self.slots[i]
                    .cooldown_until
                    .map(|t| now >= t)
                    .unwrap_or(true);
                if !cooled {
                    continue;
                }
                // One successful probe readmits the provider.
                if self.slots[i].provider.ping().await.is_err() {
                    continue;
                }
                self.slots[i].healthy = true;
                self.slots[i].consecutive_errors = 0;
            }

            if let Err(e) = self.slots[i].provider.subscribe(&self.symbols).await {
                warn!(provider = %self.slots[i].provider.name(), error = %e, "failover subscribe failed");
                self.slots[i].healthy = false;
                self.slots[i].cooldown_until = Some(now + self.config.cooldown);
                continue;
            }

            self.active = i;
            let name = self.slots[i].provider.name().to_string();
            info!(from = %previous, to = %name, "market data failover");
            let _ = self
                .bus
                .publish(EventPayload::SystemAlert(SystemAlert::warning(
                    AlertKind::ProviderFailover {
                        from: previous.clone(),
                        to: name,
                    },
                )))
                .await;
            return true;
        }

        false
    }

    /// Normalize and publish one bar. Malformed and stale bars are dropped;
    /// the per-symbol watermark enforces timestamp monotonicity.
    async fn publish_bar(&mut self, bar: Bar) {
        if !bar.is_well_formed() {
            warn!(symbol = %bar.symbol, timestamp = %bar.timestamp, "dropping malformed bar");
            return;
        }

        if let Some(watermark) = self.watermarks.get(&bar.symbol) {
            if bar.timestamp <= *watermark {
                debug!(
                    symbol = %bar.symbol,
                    timestamp = %bar.timestamp,
                    watermark = %watermark,
                    "dropping out-of-order bar"
                );
                return;
            }
        }
        self.watermarks.insert(bar.symbol.clone(), bar.timestamp);

        // market_data is the lossy topic: this never blocks the pump.
        if let Err(e) = self.bus.publish(EventPayload::MarketData(bar)).await {
            warn!(error = %e, "market data publish failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replay::{ReplayProvider, ScriptItem, ScriptedProvider};
    use rust_decimal_macros::dec;
    use tw_bus::ChannelForwarder;
    use tw_types::events::Topic;
    use tw_types::market::Resolution;

    fn sym() -> Symbol {
        Symbol::equity("AAPL")
    }

    fn bar_at(minutes: i64) -> Bar {
        Bar::new(
            sym(),
            chrono::DateTime::from_timestamp(1_700_000_000 + minutes * 60, 0).unwrap(),
            dec!(100),
            dec!(101),
            dec!(99),
            dec!(100),
            dec!(1000),
            Resolution::Minute,
        )
    }

    fn malformed_bar(minutes: i64) -> Bar {
        let mut b = bar_at(minutes);
        b.low = dec!(200);
        b
    }

    async fn collect_market_data(
        bus: &EventBus,
    ) -> tokio::sync::mpsc::UnboundedReceiver<tw_types::events::Event> {
        let (fwd, rx) = ChannelForwarder::new();
        bus.subscribe(Topic::MarketData, "test", std::sync::Arc::new(fwd))
            .unwrap();
        rx
    }

    #[tokio::test(start_paused = true)]
    async fn publishes_bars_in_order() {
        let bus = EventBus::with_defaults();
        let mut rx = collect_market_data(&bus).await;

        let mut ingress =
            MarketDataIngress::new(IngressConfig::default(), bus.clone(), vec![sym()]);
        ingress.add_provider(
            Box::new(ReplayProvider::new("replay", vec![bar_at(0), bar_at(1), bar_at(2)])),
            1,
        );
        let handle = ingress.start();

        for expected in 0..3 {
            let event = rx.recv().await.unwrap();
            match event.payload {
                EventPayload::MarketData(b) => {
                    assert_eq!(b.timestamp, bar_at(expected).timestamp)
                }
                other => panic!("unexpected payload {other:?}"),
            }
        }
        handle.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn drops_malformed_and_stale_bars() {
        let bus = EventBus::with_defaults();
        let mut rx = collect_market_data(&bus).await;

        let mut ingress =
            MarketDataIngress::new(IngressConfig::default(), bus.clone(), vec![sym()]);
        ingress.add_provider(
            Box::new(ReplayProvider::new(
                "replay",
                vec![bar_at(5), malformed_bar(6), bar_at(3), bar_at(7)],
            )),
            1,
        );
        let handle = ingress.start();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        handle.stop(Duration::from_secs(1)).await;

        // Only the in-order, well-formed bars made it through.
        let timestamps: Vec<_> = [first, second]
            .iter()
            .map(|e| match &e.payload {
                EventPayload::MarketData(b) => b.timestamp,
                other => panic!("unexpected payload {other:?}"),
            })
            .collect();
        assert_eq!(timestamps, vec![bar_at(5).timestamp, bar_at(7).timestamp]);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn consecutive_errors_trigger_failover() {
        let bus = EventBus::with_defaults();
        let mut rx = collect_market_data(&bus).await;
        let (alerts, mut alert_rx) = ChannelForwarder::new();
        bus.subscribe(Topic::SystemAlert, "alerts", std::sync::Arc::new(alerts))
            .unwrap();

        let primary = ScriptedProvider::new(
            "primary",
            vec![
                ScriptItem::Bar(bar_at(0)),
                ScriptItem::Error("e1".into()),
                ScriptItem::Error("e2".into()),
                ScriptItem::Error("e3".into()),
            ],
        );
        let backup = ReplayProvider::new("backup", vec![bar_at(1), bar_at(2)]);

        let mut ingress = MarketDataIngress::new(
            IngressConfig {
                failover_errors: 3,
                ..Default::default()
            },
            bus.clone(),
            vec![sym()],
        );
        ingress.add_provider(Box::new(primary), 1);
        ingress.add_provider(Box::new(backup), 2);
        let handle = ingress.start();

        // Bar from primary, then bars from backup after three errors.
        for expected in 0..3 {
            let event = rx.recv().await.unwrap();
            match event.payload {
                EventPayload::MarketData(b) => {
                    assert_eq!(b.timestamp, bar_at(expected).timestamp)
                }
                other => panic!("unexpected payload {other:?}"),
            }
        }

        let mut saw_failover = false;
        while let Ok(alert) = alert_rx.try_recv() {
            if let EventPayload::SystemAlert(a) = alert.payload {
                if matches!(a.kind, AlertKind::ProviderFailover { .. }) {
                    saw_failover = true;
                }
            }
        }
        assert!(saw_failover, "expected a failover alert");
        handle.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_triggers_immediate_failover() {
        let bus = EventBus::with_defaults();
        let mut rx = collect_market_data(&bus).await;

        let primary = ScriptedProvider::new(
            "primary",
            vec![ScriptItem::Bar(bar_at(0)), ScriptItem::Disconnect],
        );
        let backup = ReplayProvider::new("backup", vec![bar_at(1)]);

        let mut ingress =
            MarketDataIngress::new(IngressConfig::default(), bus.clone(), vec![sym()]);
        ingress.add_provider(Box::new(primary), 1);
        ingress.add_provider(Box::new(backup), 2);
        let handle = ingress.start();

        assert!(rx.recv().await.is_some());
        let event = rx.recv().await.unwrap();
        match event.payload {
            EventPayload::MarketData(b) => assert_eq!(b.timestamp, bar_at(1).timestamp),
            other => panic!("unexpected payload {other:?}"),
        }
        handle.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_expiry_triggers_failover() {
        let bus = EventBus::with_defaults();
        let mut rx = collect_market_data(&bus).await;

        let primary = ScriptedProvider::new(
            "primary",
            vec![ScriptItem::Stall(Duration::from_secs(3600))],
        );
        let backup = ReplayProvider::new("backup", vec![bar_at(1)]);

        let mut ingress = MarketDataIngress::new(
            IngressConfig {
                heartbeat: Duration::from_millis(100),
                ..Default::default()
            },
            bus.clone(),
            vec![sym()],
        );
        ingress.add_provider(Box::new(primary), 1);
        ingress.add_provider(Box::new(backup), 2);
        let handle = ingress.start();

        let event = rx.recv().await.unwrap();
        match event.payload {
            EventPayload::MarketData(b) => assert_eq!(b.timestamp, bar_at(1).timestamp),
            other => panic!("unexpected payload {other:?}"),
        }
        handle.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_probe_keeps_provider_out() {
        let bus = EventBus::with_defaults();
        let mut rx = collect_market_data(&bus).await;

        // Primary disconnects and then refuses probes, so even with no
        // cooldown it stays out; the healthy tertiary takes over instead.
        let primary =
            ScriptedProvider::new("primary", vec![ScriptItem::Disconnect]).with_failing_ping();
        let backup = ScriptedProvider::new("backup", vec![ScriptItem::Disconnect]);
        let tertiary = ReplayProvider::new("tertiary", vec![bar_at(1)]);

        let mut ingress = MarketDataIngress::new(
            IngressConfig {
                cooldown: Duration::ZERO,
                ..Default::default()
            },
            bus.clone(),
            vec![sym()],
        );
        ingress.add_provider(Box::new(primary), 1);
        ingress.add_provider(Box::new(backup), 2);
        ingress.add_provider(Box::new(tertiary), 3);
        let handle = ingress.start();

        let event = rx.recv().await.unwrap();
        match event.payload {
            EventPayload::MarketData(b) => assert_eq!(b.timestamp, bar_at(1).timestamp),
            other => panic!("unexpected payload {other:?}"),
        }
        handle.stop(Duration::from_secs(1)).await;
    }
}
