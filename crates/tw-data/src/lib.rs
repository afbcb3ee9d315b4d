//! Market-data ingress for the Tradewind runtime.
//!
//! Providers sit behind the [`MarketDataProvider`] port. The ingress pulls
//! bars from the highest-priority healthy provider, converts vendor floats to
//! decimals, drops malformed or out-of-order bars against a per-symbol
//! watermark, and publishes `market_data` events. A heartbeat watchdog and an
//! error budget drive failover; unhealthy providers rejoin after a cool-down
//! and one successful probe.

pub mod ingress;
pub mod provider;
pub mod replay;
pub mod synthetic;

pub use ingress::{IngressConfig, IngressHandle, MarketDataIngress};
pub use provider::{DataError, DataResult, MarketDataProvider};
pub use replay::{ReplayProvider, ScriptItem, ScriptedProvider};
pub use synthetic::SyntheticProvider;
