//! Authoritative portfolio state for the Tradewind runtime.
//!
//! A single writer applies fills in arrival order: persist first, then mutate,
//! then publish `portfolio_update`. Readers take lock-free snapshots of the
//! last committed state. Duplicate fills are dropped via a bounded id cache;
//! a detected inconsistency latches the emergency stop.

pub mod manager;

pub use manager::{PortfolioConfig, PortfolioManager};
