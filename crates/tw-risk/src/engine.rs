use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::warn;

use tw_types::portfolio::{Portfolio, RiskLimits};
use tw_types::signal::{Signal, SignalSide};
use tw_types::stop::EmergencyStop;

/// Outcome of pre-trade validation: either an approved, fully sized quantity
/// or a rejection with the failing rule.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Accepted { quantity: Decimal },
    Rejected { reason: String },
}

impl Verdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Verdict::Accepted { .. })
    }

    pub fn quantity(&self) -> Option<Decimal> {
        match self {
            Verdict::Accepted { quantity } => Some(*quantity),
            Verdict::Rejected { .. } => None,
        }
    }
}

/// Risk engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskConfig {
    pub limits: RiskLimits,
    /// Scale the sized quantity linearly by signal confidence.
    pub confidence_scaling: bool,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            limits: RiskLimits::default(),
            confidence_scaling: true,
        }
    }
}

/// Stateless with respect to the portfolio (it validates against snapshots);
/// the only session state is the start-of-day equity for the daily-loss gate.
pub struct RiskEngine {
    config: RiskConfig,
    stop: EmergencyStop,
    start_of_day_equity: Mutex<Decimal>,
}

impl RiskEngine {
    pub fn new(config: RiskConfig, stop: EmergencyStop, starting_equity: Decimal) -> Self {
        Self {
            config,
            stop,
            start_of_day_equity: Mutex::new(starting_equity),
        }
    }

    /// Reset the daily-loss baseline (call at session open).
    pub fn reset_daily(&self, equity: Decimal) {
        *self.start_of_day_equity.lock() = equity;
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    /// Validate a signal against a portfolio snapshot. Checks run in order;
    /// the first failing rule rejects. Caps may size the order down rather
    /// than reject, but a quantity sized to zero is a rejection.
    pub fn validate(&self, signal: &Signal, snapshot: &Portfolio) -> Verdict {
        let verdict = self.run_checks(signal, snapshot);
        if let Verdict::Rejected { ref reason } = verdict {
            warn!(
                signal_id = %signal.id,
                strategy = %signal.strategy_id,
                symbol = %signal.symbol,
                reason = %reason,
                "signal rejected"
            );
        }
        verdict
    }

    fn run_checks(&self, signal: &Signal, snapshot: &Portfolio) -> Verdict {
        let limits = &self.config.limits;

        // 1) Emergency stop.
        if self.stop.is_engaged() {
            return Verdict::Rejected {
                reason: "emergency stop active".to_string(),
            };
        }

        // 2) Daily loss.
        let start_equity = *self.start_of_day_equity.lock();
        if start_equity > Decimal::ZERO {
            let loss = start_equity - snapshot.total_equity;
            if loss >= limits.max_daily_loss_fraction * start_equity {
                return Verdict::Rejected {
                    reason: format!(
                        "daily loss {} breaches {} of start-of-day equity {}",
                        loss, limits.max_daily_loss_fraction, start_equity
                    ),
                };
            }
        }

        let side = match signal.side {
            SignalSide::Buy => Side::Buy,
            SignalSide::Sell => Side::Sell,
            SignalSide::Hold => {
                return Verdict::Rejected {
                    reason: "hold signal carries no order intent".to_string(),
                }
            }
        };

        if signal.reference_price <= Decimal::ZERO {
            return Verdict::Rejected {
                reason: "non-positive reference price".to_string(),
            };
        }

        let equity = snapshot.total_equity;
        let price = signal.reference_price;

        // Base sizing: position fraction of equity, optionally capped per
        // symbol, optionally scaled by confidence.
        let mut symbol_budget = limits.max_position_fraction * equity;
        if let Some(cap) = limits.per_symbol_caps.get(&signal.symbol) {
            symbol_budget = symbol_budget.min(*cap);
        }
        let mut quantity = (symbol_budget / price).floor();
        if self.config.confidence_scaling {
            quantity = (quantity * signal.confidence).floor();
        }
        if quantity <= Decimal::ZERO {
            return Verdict::Rejected {
                reason: "position sized to zero".to_string(),
            };
        }

        let held = snapshot
            .position(&signal.symbol)
            .map(|p| p.quantity)
            .unwrap_or(Decimal::ZERO);

        // 6) evaluated early only to clamp: a sell without shorting closes at
        // most the held quantity. The reject branch keeps its place below.
        if side == Side::Sell && !limits.allow_short {
            quantity = quantity.min(held.max(Decimal::ZERO));
        }

        // 3) Per-symbol position cap after this order.
        let signed_delta = match side {
            Side::Buy => quantity,
            Side::Sell => -quantity,
        };
        let post_notional = ((held + signed_delta).abs()) * price;
        if post_notional > symbol_budget {
            let headroom = symbol_budget - held.abs() * price;
            let fitted = (headroom / price).floor();
            if fitted <= Decimal::ZERO {
                return Verdict::Rejected {
                    reason: format!(
                        "per-symbol cap {} already consumed by position of {}",
                        symbol_budget, held
                    ),
                };
            }
            quantity = quantity.min(fitted);
        }

        // 4) Gross exposure after this order.
        let gross = snapshot.gross_exposure();
        let gross_cap = limits.max_gross_exposure_fraction * equity;
        let new_symbol_qty = held + signal_delta_for(side, quantity);
        let exposure_delta = new_symbol_qty.abs() * price - held.abs() * price;
        if exposure_delta > Decimal::ZERO && gross + exposure_delta > gross_cap {
            let headroom = gross_cap - gross;
            let fitted = (headroom / price).floor();
            if fitted <= Decimal::ZERO {
                return Verdict::Rejected {
                    reason: format!("gross exposure {} at cap {}", gross, gross_cap),
                };
            }
            quantity = quantity.min(fitted);
        }

        // 5) Leverage after this order.
        if equity > Decimal::ZERO {
            let final_delta = signal_delta_for(side, quantity);
            let final_exposure =
                gross - held.abs() * price + (held + final_delta).abs() * price;
            let leverage = final_exposure / equity;
            if leverage > limits.max_leverage {
                return Verdict::Rejected {
                    reason: format!(
                        "leverage {} exceeds limit {}",
                        leverage, limits.max_leverage
                    ),
                };
            }
        }

        // 6) Short-sale gate.
        if side == Side::Sell && !limits.allow_short && quantity <= Decimal::ZERO {
            return Verdict::Rejected {
                reason: "sell without long position while shorting disabled".to_string(),
            };
        }
        if quantity <= Decimal::ZERO {
            return Verdict::Rejected {
                reason: "position sized to zero".to_string(),
            };
        }

        Verdict::Accepted { quantity }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Buy,
    Sell,
}

fn signal_delta_for(side: Side, quantity: Decimal) -> Decimal {
    match side {
        Side::Buy => quantity,
        Side::Sell => -quantity,
    }
}
