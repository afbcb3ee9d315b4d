use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::market::Symbol;
use crate::orders::ExecutionParams;

/// Unique signal identifier; doubles as the idempotency key for order
/// creation.
pub type SignalId = Uuid;

/// Directional intent emitted by a strategy, before sizing and validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalSide {
    Buy,
    Sell,
    Hold,
}

/// A strategy's directional intent for one symbol. Not yet sized; the risk
/// engine decides the quantity (or rejects).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub id: SignalId,
    pub strategy_id: String,
    pub symbol: Symbol,
    pub side: SignalSide,
    /// Conviction in `[0, 1]`; may scale the position size linearly.
    pub confidence: Decimal,
    /// Price the strategy observed when forming the intent; the sizing basis
    /// for market orders.
    pub reference_price: Decimal,
    pub timestamp: DateTime<Utc>,
    /// Strategy-local conventions travel here; the core never interprets it.
    pub metadata: serde_json::Value,
    /// Requested execution style; `None` means immediate market execution.
    pub execution: Option<ExecutionParams>,
}

impl Signal {
    pub fn new(
        strategy_id: &str,
        symbol: Symbol,
        side: SignalSide,
        confidence: Decimal,
        reference_price: Decimal,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let id = Self::deterministic_id(strategy_id, &symbol, timestamp, side);
        Self {
            id,
            strategy_id: strategy_id.to_string(),
            symbol,
            side,
            confidence,
            reference_price,
            timestamp,
            metadata: serde_json::Value::Null,
            execution: None,
        }
    }

    /// Deterministic id over `(strategy, symbol, bar timestamp, side)` so a
    /// strategy re-emitting the same conviction on the same bar dedupes to a
    /// single order downstream.
    pub fn deterministic_id(
        strategy_id: &str,
        symbol: &Symbol,
        timestamp: DateTime<Utc>,
        side: SignalSide,
    ) -> SignalId {
        let name = format!(
            "{}|{}|{}|{:?}",
            strategy_id,
            symbol.code,
            timestamp.timestamp_millis(),
            side
        );
        Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes())
    }

    pub fn with_execution(mut self, params: ExecutionParams) -> Self {
        self.execution = Some(params);
        self
    }

    pub fn is_actionable(&self) -> bool {
        !matches!(self.side, SignalSide::Hold)
    }
}
