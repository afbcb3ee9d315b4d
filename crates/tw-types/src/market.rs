use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Instrument identifier. The `code` is the sharding key for per-symbol
/// ordering guarantees throughout the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Symbol {
    pub code: String,
    pub asset_class: AssetClass,
}

impl Symbol {
    pub fn new(code: &str, asset_class: AssetClass) -> Self {
        Self {
            code: code.to_string(),
            asset_class,
        }
    }

    pub fn equity(code: &str) -> Self {
        Self::new(code, AssetClass::Equity)
    }

    pub fn crypto(code: &str) -> Self {
        Self::new(code, AssetClass::Crypto)
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code)
    }
}

/// Asset classes the runtime routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AssetClass {
    Equity,
    Crypto,
    Forex,
}

impl AssetClass {
    /// Whether the asset class trades around the clock (no session close).
    pub fn is_24_7(&self) -> bool {
        matches!(self, AssetClass::Crypto)
    }

    /// Whether fractional quantities are natively tradable.
    pub fn supports_fractional_quantities(&self) -> bool {
        matches!(self, AssetClass::Crypto | AssetClass::Forex)
    }
}

impl fmt::Display for AssetClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AssetClass::Equity => "Equity",
            AssetClass::Crypto => "Crypto",
            AssetClass::Forex => "Forex",
        };
        write!(f, "{}", s)
    }
}

/// Bar timeframe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Resolution {
    Second,
    Minute,
    FiveMinute,
    FifteenMinute,
    Hour,
    Day,
}

impl Resolution {
    pub fn to_seconds(&self) -> u64 {
        match self {
            Resolution::Second => 1,
            Resolution::Minute => 60,
            Resolution::FiveMinute => 300,
            Resolution::FifteenMinute => 900,
            Resolution::Hour => 3600,
            Resolution::Day => 86400,
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Resolution::Second => "1s",
            Resolution::Minute => "1m",
            Resolution::FiveMinute => "5m",
            Resolution::FifteenMinute => "15m",
            Resolution::Hour => "1h",
            Resolution::Day => "1d",
        };
        write!(f, "{}", s)
    }
}

/// Normalized OHLCV bar. Produced by the market-data ingress only; immutable
/// once published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub symbol: Symbol,
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub resolution: Resolution,
}

impl Bar {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        symbol: Symbol,
        timestamp: DateTime<Utc>,
        open: Decimal,
        high: Decimal,
        low: Decimal,
        close: Decimal,
        volume: Decimal,
        resolution: Resolution,
    ) -> Self {
        Self {
            symbol,
            timestamp,
            open,
            high,
            low,
            close,
            volume,
            resolution,
        }
    }

    /// OHLC/volume sanity: `low <= open, close <= high` and `volume >= 0`.
    /// Bars failing this are dropped at the ingress boundary.
    pub fn is_well_formed(&self) -> bool {
        self.low <= self.open
            && self.low <= self.close
            && self.open <= self.high
            && self.close <= self.high
            && self.low <= self.high
            && self.volume >= Decimal::ZERO
    }

    /// Typical price (HLC/3), used by volume-weighting heuristics.
    pub fn typical_price(&self) -> Decimal {
        (self.high + self.low + self.close) / Decimal::from(3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn bar(open: Decimal, high: Decimal, low: Decimal, close: Decimal) -> Bar {
        Bar::new(
            Symbol::equity("AAPL"),
            Utc::now(),
            open,
            high,
            low,
            close,
            dec!(1000),
            Resolution::Minute,
        )
    }

    #[test]
    fn well_formed_bar_passes() {
        assert!(bar(dec!(100), dec!(101), dec!(99), dec!(100.5)).is_well_formed());
    }

    #[test]
    fn inverted_range_fails() {
        assert!(!bar(dec!(100), dec!(99), dec!(101), dec!(100)).is_well_formed());
    }

    #[test]
    fn close_above_high_fails() {
        assert!(!bar(dec!(100), dec!(101), dec!(99), dec!(102)).is_well_formed());
    }

    #[test]
    fn negative_volume_fails() {
        let mut b = bar(dec!(100), dec!(101), dec!(99), dec!(100));
        b.volume = dec!(-1);
        assert!(!b.is_well_formed());
    }

    #[test]
    fn typical_price() {
        let b = bar(dec!(10), dec!(12), dec!(9), dec!(9));
        assert_eq!(b.typical_price(), dec!(10));
    }

    #[test]
    fn symbol_display_uses_code() {
        assert_eq!(Symbol::crypto("BTC-USD").to_string(), "BTC-USD");
    }

    #[test]
    fn asset_class_flags() {
        assert!(AssetClass::Crypto.is_24_7());
        assert!(!AssetClass::Equity.is_24_7());
        assert!(AssetClass::Forex.supports_fractional_quantities());
    }
}
