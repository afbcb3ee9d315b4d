//! Strategy hosting for the Tradewind runtime.
//!
//! Strategies implement the [`Strategy`] capability set and are owned by the
//! [`StrategyHost`], which fans out market data by symbol, routes fills to
//! their owners, forwards portfolio snapshots, and publishes the resulting
//! signals with deterministic ids. Each strategy runs isolated on its own
//! task; one strategy's failure never reaches another.

pub mod host;
pub mod strategies;
pub mod strategy;

pub use host::{HostConfig, StrategyHost};
pub use strategies::{MomentumStrategy, MovingAverageCrossover};
pub use strategy::{BarBuffer, Strategy, StrategyConfig, StrategyContext};
