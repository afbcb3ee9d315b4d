//! Pre-trade risk validation for the Tradewind runtime.
//!
//! Every signal is checked against an immutable portfolio snapshot and the
//! configured limits before an order may be created. Checks run in a fixed
//! order and the first failure wins; sizing may shrink an order to fit a cap
//! instead of rejecting it outright.

pub mod engine;

pub use engine::{RiskConfig, RiskEngine, Verdict};
