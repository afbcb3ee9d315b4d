//! Seeded random-walk provider for demos and load tests.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use std::collections::HashMap;
use tokio::time::Duration;

use tw_types::market::{Bar, Resolution, Symbol};

use crate::provider::{DataResult, MarketDataProvider};

/// Generates bars as a seeded random walk, round-robin across subscribed
/// symbols. Prices are produced as `f64` and converted to `Decimal` at the
/// boundary, the same shape a real vendor feed has.
pub struct SyntheticProvider {
    name: String,
    rng: StdRng,
    resolution: Resolution,
    /// Wall-clock pacing between bars; zero emits as fast as it is polled.
    pace: Duration,
    daily_volatility: f64,
    subscribed: Vec<Symbol>,
    state: HashMap<Symbol, WalkState>,
    next_index: usize,
    clock: DateTime<Utc>,
}

struct WalkState {
    price: f64,
}

impl SyntheticProvider {
    pub fn new(name: &str, seed: u64, resolution: Resolution) -> Self {
        Self {
            name: name.to_string(),
            rng: StdRng::seed_from_u64(seed),
            resolution,
            pace: Duration::ZERO,
            daily_volatility: 0.02,
            subscribed: Vec::new(),
            state: HashMap::new(),
            next_index: 0,
            clock: Utc::now(),
        }
    }

    pub fn with_pace(mut self, pace: Duration) -> Self {
        self.pace = pace;
        self
    }

    pub fn with_volatility(mut self, daily_volatility: f64) -> Self {
        self.daily_volatility = daily_volatility;
        self
    }

    fn generate(&mut self, symbol: Symbol) -> Bar {
        let state = self.state.entry(symbol.clone()).or_insert(WalkState {
            price: 100.0,
        });

        let step = self.daily_volatility / (86_400.0 / self.resolution.to_seconds() as f64).sqrt();
        let open = state.price;
        let drift: f64 = self.rng.gen_range(-step..step);
        let close = (open * (1.0 + drift)).max(0.01);
        let high = open.max(close) * (1.0 + self.rng.gen_range(0.0..step / 2.0));
        let low = open.min(close) * (1.0 - self.rng.gen_range(0.0..step / 2.0));
        let volume = self.rng.gen_range(10_000.0..1_000_000.0_f64);
        state.price = close;

        let timestamp = self.clock;
        self.clock += ChronoDuration::seconds(self.resolution.to_seconds() as i64);

        Bar::new(
            symbol,
            timestamp,
            decimal(open),
            decimal(high),
            decimal(low),
            decimal(close),
            decimal(volume.trunc()),
            self.resolution,
        )
    }
}

fn decimal(value: f64) -> Decimal {
    Decimal::from_f64_retain(value)
        .unwrap_or(Decimal::ZERO)
        .round_dp(8)
}

#[async_trait]
impl MarketDataProvider for SyntheticProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn subscribe(&mut self, symbols: &[Symbol]) -> DataResult<()> {
        for s in symbols {
            if !self.subscribed.contains(s) {
                self.subscribed.push(s.clone());
            }
        }
        Ok(())
    }

    async fn unsubscribe(&mut self, symbols: &[Symbol]) -> DataResult<()> {
        self.subscribed.retain(|s| !symbols.contains(s));
        Ok(())
    }

    async fn next_bar(&mut self) -> DataResult<Option<Bar>> {
        if self.subscribed.is_empty() {
            return Ok(None);
        }
        if !self.pace.is_zero() {
            tokio::time::sleep(self.pace).await;
        }
        let symbol = self.subscribed[self.next_index % self.subscribed.len()].clone();
        self.next_index += 1;
        Ok(Some(self.generate(symbol)))
    }

    async fn ping(&mut self) -> DataResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bars_are_well_formed() {
        let mut p = SyntheticProvider::new("synthetic", 42, Resolution::Minute);
        p.subscribe(&[Symbol::equity("AAPL"), Symbol::crypto("BTC-USD")])
            .await
            .unwrap();

        for _ in 0..200 {
            let bar = p.next_bar().await.unwrap().unwrap();
            assert!(bar.is_well_formed(), "malformed bar: {bar:?}");
        }
    }

    #[tokio::test]
    async fn same_seed_same_walk() {
        let mut a = SyntheticProvider::new("a", 7, Resolution::Minute);
        let mut b = SyntheticProvider::new("b", 7, Resolution::Minute);
        a.subscribe(&[Symbol::equity("AAPL")]).await.unwrap();
        b.subscribe(&[Symbol::equity("AAPL")]).await.unwrap();

        for _ in 0..20 {
            let x = a.next_bar().await.unwrap().unwrap();
            let y = b.next_bar().await.unwrap().unwrap();
            assert_eq!(x.close, y.close);
        }
    }

    #[tokio::test]
    async fn no_subscription_means_eos() {
        let mut p = SyntheticProvider::new("p", 1, Resolution::Minute);
        assert!(p.next_bar().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn round_robin_across_symbols() {
        let mut p = SyntheticProvider::new("p", 1, Resolution::Minute);
        p.subscribe(&[Symbol::equity("A"), Symbol::equity("B")])
            .await
            .unwrap();
        let first = p.next_bar().await.unwrap().unwrap();
        let second = p.next_bar().await.unwrap().unwrap();
        assert_ne!(first.symbol, second.symbol);
    }
}
