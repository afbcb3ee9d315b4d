use chrono::{DateTime, Utc};
use rust_decimal::prelude::Signed;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::market::Symbol;
use crate::orders::{Fill, Side};

/// A held position. The portfolio core is the sole writer; everything else
/// sees snapshot copies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: Symbol,
    /// Signed: positive long, negative short.
    pub quantity: Decimal,
    pub average_cost: Decimal,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub market_value: Decimal,
    pub last_updated: DateTime<Utc>,
}

impl Position {
    pub fn new(symbol: Symbol) -> Self {
        Self {
            symbol,
            quantity: Decimal::ZERO,
            average_cost: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
            market_value: Decimal::ZERO,
            last_updated: Utc::now(),
        }
    }

    pub fn is_long(&self) -> bool {
        self.quantity > Decimal::ZERO
    }

    pub fn is_short(&self) -> bool {
        self.quantity < Decimal::ZERO
    }

    pub fn is_flat(&self) -> bool {
        self.quantity == Decimal::ZERO
    }

    /// Apply a fill to the position.
    ///
    /// Accretive fills recompute the volume-weighted average cost. Reducing
    /// fills realize PnL against the old average cost. A fill crossing zero is
    /// split at the boundary: the closing portion realizes PnL, the opening
    /// portion starts a fresh position at the fill price.
    pub fn apply_fill(&mut self, fill: &Fill) {
        let delta = match fill.side {
            Side::Buy => fill.quantity,
            Side::Sell => -fill.quantity,
        };

        if self.quantity == Decimal::ZERO {
            self.quantity = delta;
            self.average_cost = fill.price;
        } else if self.quantity.signum() == delta.signum() {
            // Accretive: weighted average cost over absolute size.
            let total_cost =
                self.quantity.abs() * self.average_cost + delta.abs() * fill.price;
            let total_quantity = self.quantity.abs() + delta.abs();
            self.average_cost = total_cost / total_quantity;
            self.quantity += delta;
        } else {
            // Reducing, possibly through zero.
            let closed = delta.abs().min(self.quantity.abs());
            let pnl_per_unit = if self.quantity > Decimal::ZERO {
                fill.price - self.average_cost
            } else {
                self.average_cost - fill.price
            };
            self.realized_pnl += pnl_per_unit * closed;

            let remaining_old = self.quantity.abs() - closed;
            let residual_new = delta.abs() - closed;

            if remaining_old > Decimal::ZERO {
                self.quantity = remaining_old * self.quantity.signum();
            } else if residual_new > Decimal::ZERO {
                // Sign flip: residual opens at the fill price.
                self.quantity = residual_new * delta.signum();
                self.average_cost = fill.price;
            } else {
                self.quantity = Decimal::ZERO;
                self.average_cost = Decimal::ZERO;
            }
        }

        self.last_updated = fill.executed_at;
    }

    /// Refresh mark-dependent fields from the latest price.
    pub fn update_market_price(&mut self, price: Decimal) {
        self.market_value = self.quantity.abs() * price;
        self.unrealized_pnl = match self.quantity {
            q if q > Decimal::ZERO => (price - self.average_cost) * q,
            q if q < Decimal::ZERO => (self.average_cost - price) * q.abs(),
            _ => Decimal::ZERO,
        };
        self.last_updated = Utc::now();
    }

    pub fn total_pnl(&self) -> Decimal {
        self.realized_pnl + self.unrealized_pnl
    }
}

/// Authoritative account state. Equality of `total_equity` with
/// `cash + sum of market values` is maintained by `update_totals`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Portfolio {
    pub initial_cash: Decimal,
    pub cash: Decimal,
    pub positions: HashMap<Symbol, Position>,
    pub total_equity: Decimal,
    pub total_realized_pnl: Decimal,
    pub total_unrealized_pnl: Decimal,
    pub total_commissions: Decimal,
    pub as_of: DateTime<Utc>,
}

impl Portfolio {
    pub fn new(initial_cash: Decimal) -> Self {
        Self {
            initial_cash,
            cash: initial_cash,
            positions: HashMap::new(),
            total_equity: initial_cash,
            total_realized_pnl: Decimal::ZERO,
            total_unrealized_pnl: Decimal::ZERO,
            total_commissions: Decimal::ZERO,
            as_of: Utc::now(),
        }
    }

    /// Apply a fill: cash, position, and derived totals. Flat positions are
    /// removed from the map.
    pub fn apply_fill(&mut self, fill: &Fill) {
        self.cash += fill.net_amount();
        self.total_commissions += fill.commission;

        // Realized PnL accumulated by removed positions must survive, so it is
        // folded into the running total before the entry is dropped.
        let position = self
            .positions
            .entry(fill.symbol.clone())
            .or_insert_with(|| Position::new(fill.symbol.clone()));
        let realized_before = position.realized_pnl;
        position.apply_fill(fill);
        let realized_delta = position.realized_pnl - realized_before;

        if position.is_flat() {
            let retained = self.positions.remove(&fill.symbol);
            if let Some(p) = retained {
                // Keep the closed position's mark contribution out of totals.
                debug_assert!(p.is_flat());
            }
        }

        self.total_realized_pnl += realized_delta;
        self.as_of = fill.executed_at;
        self.update_totals();
    }

    /// Refresh marks for any symbol present in `prices`.
    pub fn update_market_prices(&mut self, prices: &HashMap<Symbol, Decimal>) {
        for (symbol, price) in prices {
            if let Some(position) = self.positions.get_mut(symbol) {
                position.update_market_price(*price);
            }
        }
        self.update_totals();
    }

    fn update_totals(&mut self) {
        self.total_unrealized_pnl = self.positions.values().map(|p| p.unrealized_pnl).sum();
        let market_value: Decimal = self.positions.values().map(|p| p.market_value).sum();
        self.total_equity = self.cash + market_value;
    }

    pub fn position(&self, symbol: &Symbol) -> Option<&Position> {
        self.positions.get(symbol)
    }

    /// Sum of absolute position market values.
    pub fn gross_exposure(&self) -> Decimal {
        self.positions.values().map(|p| p.market_value.abs()).sum()
    }

    pub fn total_return(&self) -> Decimal {
        if self.initial_cash > Decimal::ZERO {
            (self.total_equity - self.initial_cash) / self.initial_cash
        } else {
            Decimal::ZERO
        }
    }
}

/// Risk limits, fixed for the duration of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskLimits {
    /// Max single-position notional as a fraction of equity.
    pub max_position_fraction: Decimal,
    /// Max gross exposure as a fraction of equity.
    pub max_gross_exposure_fraction: Decimal,
    /// Daily loss fraction of start-of-day equity that halts new orders.
    pub max_daily_loss_fraction: Decimal,
    /// Max gross exposure / equity ratio.
    pub max_leverage: Decimal,
    /// Optional per-symbol notional caps.
    pub per_symbol_caps: HashMap<Symbol, Decimal>,
    /// Whether sells may open or extend short positions.
    pub allow_short: bool,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_position_fraction: Decimal::new(25, 2),       // 25%
            max_gross_exposure_fraction: Decimal::new(15, 1), // 150%
            max_daily_loss_fraction: Decimal::new(5, 2),      // 5%
            max_leverage: Decimal::from(2),
            per_symbol_caps: HashMap::new(),
            allow_short: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn sym() -> Symbol {
        Symbol::equity("A")
    }

    fn fill(side: Side, quantity: Decimal, price: Decimal, commission: Decimal) -> Fill {
        Fill::new(Uuid::new_v4(), sym(), side, quantity, price, commission, "test")
    }

    #[test]
    fn buy_opens_position_and_debits_cash() {
        // S1: 100 @ 150 with $1 commission from 100k cash.
        let mut p = Portfolio::new(dec!(100000));
        p.apply_fill(&fill(Side::Buy, dec!(100), dec!(150.00), dec!(1.00)));

        assert_eq!(p.cash, dec!(84999.00));
        let pos = p.position(&sym()).unwrap();
        assert_eq!(pos.quantity, dec!(100));
        assert_eq!(pos.average_cost, dec!(150.00));
        assert_eq!(pos.realized_pnl, dec!(0));
    }

    #[test]
    fn accretive_buy_reweights_average_cost() {
        // S2: add 50 @ 160 on top of 100 @ 150.
        let mut p = Portfolio::new(dec!(100000));
        p.apply_fill(&fill(Side::Buy, dec!(100), dec!(150.00), dec!(1.00)));
        p.apply_fill(&fill(Side::Buy, dec!(50), dec!(160.00), dec!(1.00)));

        assert_eq!(p.cash, dec!(76998.00));
        let pos = p.position(&sym()).unwrap();
        assert_eq!(pos.quantity, dec!(150));
        // (100*150 + 50*160) / 150 = 153.333...
        let expected = dec!(23000) / dec!(150);
        assert_eq!(pos.average_cost, expected);
    }

    #[test]
    fn partial_sell_realizes_pnl_against_average_cost() {
        // S3: sell 80 @ 170 after S2.
        let mut p = Portfolio::new(dec!(100000));
        p.apply_fill(&fill(Side::Buy, dec!(100), dec!(150.00), dec!(1.00)));
        p.apply_fill(&fill(Side::Buy, dec!(50), dec!(160.00), dec!(1.00)));
        p.apply_fill(&fill(Side::Sell, dec!(80), dec!(170.00), dec!(1.00)));

        assert_eq!(p.cash, dec!(90597.00));
        let pos = p.position(&sym()).unwrap();
        assert_eq!(pos.quantity, dec!(70));

        let avg = dec!(23000) / dec!(150);
        let expected_pnl = dec!(80) * (dec!(170.00) - avg);
        assert!((pos.realized_pnl - expected_pnl).abs() < dec!(0.0000001));
        assert!((expected_pnl - dec!(1333.3333333)).abs() < dec!(0.001));
    }

    #[test]
    fn sell_of_exact_quantity_removes_entry() {
        let mut p = Portfolio::new(dec!(100000));
        p.apply_fill(&fill(Side::Buy, dec!(100), dec!(150), dec!(0)));
        p.apply_fill(&fill(Side::Sell, dec!(100), dec!(155), dec!(0)));

        assert!(p.position(&sym()).is_none());
        assert_eq!(p.total_realized_pnl, dec!(500));
    }

    #[test]
    fn oversell_splits_at_zero_crossing() {
        let mut p = Portfolio::new(dec!(100000));
        p.apply_fill(&fill(Side::Buy, dec!(100), dec!(150), dec!(0)));
        // Sell 120: 100 closes (realizing 100 * 10), 20 opens short @ 160.
        p.apply_fill(&fill(Side::Sell, dec!(120), dec!(160), dec!(0)));

        let pos = p.position(&sym()).unwrap();
        assert_eq!(pos.quantity, dec!(-20));
        assert_eq!(pos.average_cost, dec!(160));
        assert_eq!(pos.realized_pnl, dec!(1000));
    }

    #[test]
    fn buy_to_cover_past_short_splits() {
        let mut p = Portfolio::new(dec!(100000));
        p.apply_fill(&fill(Side::Sell, dec!(50), dec!(200), dec!(0)));
        // Cover 80: 50 closes (realizing 50 * (200-190)), 30 opens long @ 190.
        p.apply_fill(&fill(Side::Buy, dec!(80), dec!(190), dec!(0)));

        let pos = p.position(&sym()).unwrap();
        assert_eq!(pos.quantity, dec!(30));
        assert_eq!(pos.average_cost, dec!(190));
        assert_eq!(pos.realized_pnl, dec!(500));
    }

    #[test]
    fn realized_pnl_survives_position_removal() {
        let mut p = Portfolio::new(dec!(100000));
        p.apply_fill(&fill(Side::Buy, dec!(10), dec!(100), dec!(0)));
        p.apply_fill(&fill(Side::Sell, dec!(10), dec!(110), dec!(0)));
        assert!(p.positions.is_empty());
        assert_eq!(p.total_realized_pnl, dec!(100));

        // Re-opening the symbol starts PnL from zero at the position level.
        p.apply_fill(&fill(Side::Buy, dec!(10), dec!(100), dec!(0)));
        assert_eq!(p.position(&sym()).unwrap().realized_pnl, dec!(0));
        assert_eq!(p.total_realized_pnl, dec!(100));
    }

    #[test]
    fn marks_drive_equity_and_unrealized() {
        let mut p = Portfolio::new(dec!(100000));
        p.apply_fill(&fill(Side::Buy, dec!(100), dec!(150), dec!(0)));

        let mut prices = HashMap::new();
        prices.insert(sym(), dec!(160));
        p.update_market_prices(&prices);

        assert_eq!(p.total_unrealized_pnl, dec!(1000));
        // 85_000 cash + 16_000 market value
        assert_eq!(p.total_equity, dec!(101000));
        assert_eq!(p.gross_exposure(), dec!(16000));
    }

    #[test]
    fn short_position_marks() {
        let mut p = Portfolio::new(dec!(100000));
        p.apply_fill(&fill(Side::Sell, dec!(10), dec!(100), dec!(0)));

        let mut prices = HashMap::new();
        prices.insert(sym(), dec!(90));
        p.update_market_prices(&prices);

        let pos = p.position(&sym()).unwrap();
        assert!(pos.is_short());
        assert_eq!(pos.unrealized_pnl, dec!(100));
    }
}
