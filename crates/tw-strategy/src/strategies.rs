//! Reference strategies. Useful on their own for paper trading and as
//! fixtures for the host's tests.

use rust_decimal::Decimal;

use tw_types::market::Bar;
use tw_types::signal::{Signal, SignalSide};

use crate::strategy::{Strategy, StrategyConfig, StrategyContext};

/// Buys when the short moving average crosses above the long one, sells on
/// the opposite cross.
#[derive(Debug)]
pub struct MovingAverageCrossover {
    config: StrategyConfig,
    short_period: usize,
    long_period: usize,
    last_side: Option<SignalSide>,
    initialized: bool,
}

impl MovingAverageCrossover {
    pub fn new(short_period: usize, long_period: usize) -> Self {
        let mut config = StrategyConfig::new("ma_crossover", "Moving Average Crossover");
        config.set_parameter("short_period", short_period);
        config.set_parameter("long_period", long_period);
        Self {
            config,
            short_period,
            long_period,
            last_side: None,
            initialized: false,
        }
    }

    fn sma(closes: &[Decimal], period: usize) -> Option<Decimal> {
        if closes.len() < period || period == 0 {
            return None;
        }
        let sum: Decimal = closes.iter().rev().take(period).sum();
        Some(sum / Decimal::from(period))
    }
}

impl Strategy for MovingAverageCrossover {
    fn initialize(&mut self, config: &StrategyConfig) -> Result<(), String> {
        self.config = config.clone();
        self.short_period = self.config.get_parameter("short_period").unwrap_or(10);
        self.long_period = self.config.get_parameter("long_period").unwrap_or(20);
        if self.short_period >= self.long_period {
            return Err(format!(
                "short period {} must be below long period {}",
                self.short_period, self.long_period
            ));
        }
        self.initialized = true;
        Ok(())
    }

    fn on_bar(&mut self, bar: &Bar, ctx: &StrategyContext) -> Result<Vec<Signal>, String> {
        if !self.initialized {
            return Ok(vec![]);
        }
        let closes = match ctx.bars(&bar.symbol) {
            Some(buffer) => buffer.closes(self.long_period + 1),
            None => return Ok(vec![]),
        };

        let (short, long) =
            match (Self::sma(&closes, self.short_period), Self::sma(&closes, self.long_period)) {
                (Some(s), Some(l)) => (s, l),
                _ => return Ok(vec![]),
            };

        let side = if short > long {
            SignalSide::Buy
        } else if short < long {
            SignalSide::Sell
        } else {
            return Ok(vec![]);
        };

        // Only the cross itself is a signal, not every bar on one side of it.
        if self.last_side == Some(side) {
            return Ok(vec![]);
        }
        let had_previous = self.last_side.is_some();
        self.last_side = Some(side);
        if !had_previous {
            return Ok(vec![]);
        }

        // Confidence scales with the separation of the averages.
        let spread = ((short - long).abs() / long).min(Decimal::new(5, 2));
        let confidence = (Decimal::new(5, 1) + spread * Decimal::from(10)).min(Decimal::ONE);

        Ok(vec![Signal::new(
            &self.config.strategy_id,
            bar.symbol.clone(),
            side,
            confidence,
            bar.close,
            bar.timestamp,
        )])
    }

    fn config(&self) -> &StrategyConfig {
        &self.config
    }
}

/// Buys strong positive momentum over a lookback window, sells strong
/// negative momentum.
#[derive(Debug)]
pub struct MomentumStrategy {
    config: StrategyConfig,
    lookback: usize,
    /// Fractional move over the lookback that counts as momentum.
    threshold: Decimal,
    initialized: bool,
}

impl MomentumStrategy {
    pub fn new(lookback: usize, threshold: Decimal) -> Self {
        let mut config = StrategyConfig::new("momentum", "Momentum");
        config.set_parameter("lookback", lookback);
        Self {
            config,
            lookback,
            threshold,
            initialized: false,
        }
    }

    fn momentum(&self, closes: &[Decimal]) -> Option<Decimal> {
        if closes.len() <= self.lookback {
            return None;
        }
        let current = closes.last()?;
        let past = closes.get(closes.len() - 1 - self.lookback)?;
        if *past == Decimal::ZERO {
            return None;
        }
        Some((*current - *past) / *past)
    }
}

impl Strategy for MomentumStrategy {
    fn initialize(&mut self, config: &StrategyConfig) -> Result<(), String> {
        self.config = config.clone();
        self.lookback = self.config.get_parameter("lookback").unwrap_or(10);
        if self.lookback == 0 {
            return Err("lookback must be positive".to_string());
        }
        self.initialized = true;
        Ok(())
    }

    fn on_bar(&mut self, bar: &Bar, ctx: &StrategyContext) -> Result<Vec<Signal>, String> {
        if !self.initialized {
            return Ok(vec![]);
        }
        let closes = match ctx.bars(&bar.symbol) {
            Some(buffer) => buffer.closes(self.lookback + 1),
            None => return Ok(vec![]),
        };
        let momentum = match self.momentum(&closes) {
            Some(m) => m,
            None => return Ok(vec![]),
        };

        let side = if momentum > self.threshold {
            SignalSide::Buy
        } else if momentum < -self.threshold {
            SignalSide::Sell
        } else {
            return Ok(vec![]);
        };

        // Confidence grows with the excess over the threshold, capped at 1.
        let excess = (momentum.abs() / self.threshold).min(Decimal::from(2));
        let confidence = (excess / Decimal::from(2)).min(Decimal::ONE);

        Ok(vec![Signal::new(
            &self.config.strategy_id,
            bar.symbol.clone(),
            side,
            confidence,
            bar.close,
            bar.timestamp,
        )])
    }

    fn config(&self) -> &StrategyConfig {
        &self.config
    }
}
