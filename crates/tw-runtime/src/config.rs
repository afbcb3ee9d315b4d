use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use tw_broker::SelectionPolicy;
use tw_types::portfolio::RiskLimits;

/// Complete runtime configuration, passed in at supervisor construction.
/// The core reads no environment variables; whatever loads this struct
/// (file, flags, service config) lives outside.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Starting cash when no persisted portfolio exists.
    pub initial_cash: Decimal,

    // -- event bus ----------------------------------------------------------
    pub bus_queue_depth: usize,
    pub bus_backpressure_timeout_ms: u64,

    // -- market data --------------------------------------------------------
    pub market_data_heartbeat_ms: u64,
    /// Consecutive provider errors before failover.
    pub provider_failover_errors: u32,
    /// Cool-down before an unhealthy provider is probed again.
    pub provider_cooldown_ms: u64,

    // -- risk ---------------------------------------------------------------
    pub risk_limits: RiskLimits,
    pub confidence_scaling: bool,

    // -- orders -------------------------------------------------------------
    pub order_timeout_secs: u64,
    pub max_orders_per_minute: u32,
    pub max_daily_orders: u32,
    /// Depth of the over-rate-limit signal queue; zero means drop instead.
    pub signal_overflow_queue: usize,

    // -- brokers ------------------------------------------------------------
    pub broker_selection_policy: SelectionPolicy,
    pub broker_health_check_secs: u64,
    pub broker_recovery_probes: u32,
    pub max_failover_attempts: u32,

    // -- lifecycle ----------------------------------------------------------
    pub drain_timeout_secs: u64,
    pub fill_dedup_cache_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            initial_cash: Decimal::from(100_000),
            bus_queue_depth: 1024,
            bus_backpressure_timeout_ms: 5_000,
            market_data_heartbeat_ms: 5_000,
            provider_failover_errors: 3,
            provider_cooldown_ms: 30_000,
            risk_limits: RiskLimits::default(),
            confidence_scaling: true,
            order_timeout_secs: 3_600,
            max_orders_per_minute: 60,
            max_daily_orders: 1_000,
            signal_overflow_queue: 256,
            broker_selection_policy: SelectionPolicy::Priority,
            broker_health_check_secs: 30,
            broker_recovery_probes: 2,
            max_failover_attempts: 3,
            drain_timeout_secs: 10,
            fill_dedup_cache_size: 10_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn defaults_are_sane() {
        let config = RuntimeConfig::default();
        assert_eq!(config.bus_queue_depth, 1024);
        assert_eq!(config.max_failover_attempts, 3);
        assert!(config.confidence_scaling);
        assert_eq!(config.risk_limits.max_daily_loss_fraction, dec!(0.05));
    }

    #[test]
    fn config_serde_round_trip() {
        let config = RuntimeConfig {
            initial_cash: dec!(250_000),
            broker_selection_policy: SelectionPolicy::HealthBased,
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, back);
    }
}
