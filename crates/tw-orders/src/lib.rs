//! Order management for the Tradewind runtime.
//!
//! Signals arriving on the bus are validated against a portfolio snapshot,
//! turned into orders exactly once per signal id, and routed through the
//! broker pool. Broker status and fill events drive a guarded lifecycle
//! state machine; execution algorithms carve parent orders into market
//! children; a sweeper cancels orders that outlive their timeout.

pub mod algos;
pub mod manager;

pub use algos::VolumeProfile;
pub use manager::{OrderManager, OrderManagerConfig, OrderStats, OverflowPolicy};
