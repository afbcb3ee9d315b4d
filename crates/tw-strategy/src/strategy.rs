use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tw_types::market::{Bar, Resolution, Symbol};
use tw_types::orders::Fill;
use tw_types::portfolio::{Portfolio, Position};
use tw_types::signal::Signal;

/// Strategy configuration: identity, subscriptions, and a free-form
/// parameter map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub strategy_id: String,
    pub name: String,
    pub symbols: Vec<Symbol>,
    /// Bar resolutions the strategy accepts; empty means any.
    pub resolutions: Vec<Resolution>,
    pub parameters: HashMap<String, serde_json::Value>,
    pub enabled: bool,
}

impl StrategyConfig {
    pub fn new(strategy_id: &str, name: &str) -> Self {
        Self {
            strategy_id: strategy_id.to_string(),
            name: name.to_string(),
            symbols: Vec::new(),
            resolutions: Vec::new(),
            parameters: HashMap::new(),
            enabled: true,
        }
    }

    pub fn add_symbol(&mut self, symbol: Symbol) -> &mut Self {
        self.symbols.push(symbol);
        self
    }

    pub fn set_parameter<T: Serialize>(&mut self, key: &str, value: T) -> &mut Self {
        self.parameters.insert(
            key.to_string(),
            serde_json::to_value(value).unwrap_or(serde_json::Value::Null),
        );
        self
    }

    pub fn get_parameter<T>(&self, key: &str) -> Option<T>
    where
        T: for<'de> Deserialize<'de>,
    {
        let value = self.parameters.get(key)?;
        serde_json::from_value(value.clone()).ok()
    }

    pub fn accepts(&self, bar: &Bar) -> bool {
        self.symbols.contains(&bar.symbol)
            && (self.resolutions.is_empty() || self.resolutions.contains(&bar.resolution))
    }
}

/// Rolling window of bars for one symbol.
#[derive(Debug, Clone)]
pub struct BarBuffer {
    bars: VecDeque<Bar>,
    capacity: usize,
}

impl BarBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            bars: VecDeque::with_capacity(capacity.min(512)),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, bar: Bar) {
        self.bars.push_back(bar);
        while self.bars.len() > self.capacity {
            self.bars.pop_front();
        }
    }

    pub fn latest(&self) -> Option<&Bar> {
        self.bars.back()
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    /// The most recent `count` closes, oldest first.
    pub fn closes(&self, count: usize) -> Vec<Decimal> {
        let skip = self.bars.len().saturating_sub(count);
        self.bars.iter().skip(skip).map(|b| b.close).collect()
    }
}

/// Read-only world view handed to strategy callbacks: rolling market data and
/// the latest portfolio snapshot.
#[derive(Debug, Clone)]
pub struct StrategyContext {
    pub current_time: DateTime<Utc>,
    pub portfolio: Arc<Portfolio>,
    pub market_data: HashMap<Symbol, BarBuffer>,
    pub buffer_capacity: usize,
}

impl StrategyContext {
    pub fn new(buffer_capacity: usize) -> Self {
        Self {
            current_time: Utc::now(),
            portfolio: Arc::new(Portfolio::new(Decimal::ZERO)),
            market_data: HashMap::new(),
            buffer_capacity,
        }
    }

    pub fn record_bar(&mut self, bar: &Bar) {
        self.current_time = bar.timestamp;
        let capacity = self.buffer_capacity;
        self.market_data
            .entry(bar.symbol.clone())
            .or_insert_with(|| BarBuffer::new(capacity))
            .push(bar.clone());
    }

    pub fn position(&self, symbol: &Symbol) -> Option<&Position> {
        self.portfolio.position(symbol)
    }

    pub fn current_price(&self, symbol: &Symbol) -> Option<Decimal> {
        self.market_data.get(symbol)?.latest().map(|b| b.close)
    }

    pub fn bars(&self, symbol: &Symbol) -> Option<&BarBuffer> {
        self.market_data.get(symbol)
    }
}

/// The strategy capability set. Implementations are stateful and owned by a
/// dedicated host task; callbacks are invoked strictly sequentially.
pub trait Strategy: Send {
    /// Called once before any market data is delivered.
    fn initialize(&mut self, config: &StrategyConfig) -> Result<(), String>;

    /// React to one bar; returned signals are published by the host.
    fn on_bar(&mut self, bar: &Bar, ctx: &StrategyContext) -> Result<Vec<Signal>, String>;

    /// A fill for one of this strategy's orders.
    fn on_fill(&mut self, _fill: &Fill, _ctx: &StrategyContext) -> Result<(), String> {
        Ok(())
    }

    /// A fresh portfolio snapshot.
    fn on_portfolio_update(&mut self, _portfolio: &Portfolio) -> Result<(), String> {
        Ok(())
    }

    /// Called once at host shutdown.
    fn shutdown(&mut self) -> Result<(), String> {
        Ok(())
    }

    fn config(&self) -> &StrategyConfig;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn bar(close: Decimal, minutes: i64) -> Bar {
        Bar::new(
            Symbol::equity("AAPL"),
            Utc::now() + chrono::Duration::minutes(minutes),
            close,
            close,
            close,
            close,
            dec!(1000),
            Resolution::Minute,
        )
    }

    #[test]
    fn buffer_evicts_oldest() {
        let mut buffer = BarBuffer::new(3);
        for i in 0..5 {
            buffer.push(bar(Decimal::from(100 + i), i));
        }
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.closes(10), vec![dec!(102), dec!(103), dec!(104)]);
        assert_eq!(buffer.latest().unwrap().close, dec!(104));
    }

    #[test]
    fn closes_returns_most_recent() {
        let mut buffer = BarBuffer::new(10);
        for i in 0..5 {
            buffer.push(bar(Decimal::from(100 + i), i));
        }
        assert_eq!(buffer.closes(2), vec![dec!(103), dec!(104)]);
    }

    #[test]
    fn config_parameter_round_trip() {
        let mut config = StrategyConfig::new("s1", "Test");
        config.set_parameter("lookback", 20usize);
        config.set_parameter("threshold", 0.05f64);
        assert_eq!(config.get_parameter::<usize>("lookback"), Some(20));
        assert_eq!(config.get_parameter::<f64>("threshold"), Some(0.05));
        assert_eq!(config.get_parameter::<usize>("missing"), None);
    }

    #[test]
    fn config_accepts_filters_symbol_and_resolution() {
        let mut config = StrategyConfig::new("s1", "Test");
        config.add_symbol(Symbol::equity("AAPL"));
        assert!(config.accepts(&bar(dec!(1), 0)));

        let other = Bar::new(
            Symbol::equity("MSFT"),
            Utc::now(),
            dec!(1),
            dec!(1),
            dec!(1),
            dec!(1),
            dec!(1),
            Resolution::Minute,
        );
        assert!(!config.accepts(&other));

        config.resolutions.push(Resolution::Day);
        assert!(!config.accepts(&bar(dec!(1), 0)));
    }

    #[test]
    fn context_records_bars_per_symbol() {
        let mut ctx = StrategyContext::new(50);
        ctx.record_bar(&bar(dec!(101), 0));
        ctx.record_bar(&bar(dec!(102), 1));
        assert_eq!(ctx.current_price(&Symbol::equity("AAPL")), Some(dec!(102)));
        assert!(ctx.current_price(&Symbol::equity("MSFT")).is_none());
    }
}
