use async_trait::async_trait;
use thiserror::Error;

use tw_types::market::{Bar, Symbol};

/// Errors surfaced by market-data providers.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("provider disconnected: {provider}")]
    Disconnected { provider: String },

    #[error("stream error: {message}")]
    Stream { message: String },

    #[error("subscription failed: {message}")]
    Subscription { message: String },

    #[error("probe failed: {message}")]
    Probe { message: String },
}

pub type DataResult<T> = Result<T, DataError>;

/// Upstream market-data source. One implementation per vendor; the ingress
/// normalizes whatever comes out of `next_bar` before it reaches the bus.
#[async_trait]
pub trait MarketDataProvider: Send {
    fn name(&self) -> &str;

    async fn subscribe(&mut self, symbols: &[Symbol]) -> DataResult<()>;

    async fn unsubscribe(&mut self, symbols: &[Symbol]) -> DataResult<()>;

    /// The next raw bar. `Ok(None)` means the stream ended (disconnect).
    async fn next_bar(&mut self) -> DataResult<Option<Bar>>;

    /// Cheap health probe used before a provider rejoins the healthy set.
    async fn ping(&mut self) -> DataResult<()>;
}
