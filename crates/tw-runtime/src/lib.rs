//! Tradewind: a live algorithmic trading runtime.
//!
//! The supervisor assembles the full pipeline from a single configuration
//! struct: market data flows in through the ingress, strategies turn bars
//! into signals, the order manager validates them against risk limits and
//! routes orders through the broker pool, and fills settle into the
//! portfolio core. All components communicate over the typed event bus;
//! the emergency-stop latch halts new order flow system-wide.

pub mod config;
pub mod supervisor;

pub use config::RuntimeConfig;
pub use supervisor::Supervisor;
