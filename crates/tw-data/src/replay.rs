//! Deterministic providers: replay a fixed bar sequence, or follow a script
//! of bars, errors, and disconnects. Both are used heavily by the test suite.

use async_trait::async_trait;
use std::collections::VecDeque;
use tokio::time::Duration;

use tw_types::market::{Bar, Symbol};

use crate::provider::{DataError, DataResult, MarketDataProvider};

/// Replays a pre-built bar sequence in order, then reports end of stream.
#[derive(Debug)]
pub struct ReplayProvider {
    name: String,
    bars: VecDeque<Bar>,
    /// Optional pacing delay between bars.
    pace: Option<Duration>,
    subscribed: Vec<Symbol>,
}

impl ReplayProvider {
    pub fn new(name: &str, bars: Vec<Bar>) -> Self {
        Self {
            name: name.to_string(),
            bars: bars.into(),
            pace: None,
            subscribed: Vec::new(),
        }
    }

    pub fn with_pace(mut self, pace: Duration) -> Self {
        self.pace = Some(pace);
        self
    }
}

#[async_trait]
impl MarketDataProvider for ReplayProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn subscribe(&mut self, symbols: &[Symbol]) -> DataResult<()> {
        self.subscribed.extend_from_slice(symbols);
        Ok(())
    }

    async fn unsubscribe(&mut self, symbols: &[Symbol]) -> DataResult<()> {
        self.subscribed.retain(|s| !symbols.contains(s));
        Ok(())
    }

    async fn next_bar(&mut self) -> DataResult<Option<Bar>> {
        if let Some(pace) = self.pace {
            tokio::time::sleep(pace).await;
        }
        Ok(self.bars.pop_front())
    }

    async fn ping(&mut self) -> DataResult<()> {
        Ok(())
    }
}

/// One step of a [`ScriptedProvider`] run.
#[derive(Debug, Clone)]
pub enum ScriptItem {
    Bar(Bar),
    Error(String),
    Disconnect,
    /// Stall for the given duration before yielding the next item.
    Stall(Duration),
}

/// Follows a script of bars, transient errors, stalls, and disconnects.
/// The failover paths of the ingress are tested against this.
#[derive(Debug)]
pub struct ScriptedProvider {
    name: String,
    script: VecDeque<ScriptItem>,
    ping_ok: bool,
}

impl ScriptedProvider {
    pub fn new(name: &str, script: Vec<ScriptItem>) -> Self {
        Self {
            name: name.to_string(),
            script: script.into(),
            ping_ok: true,
        }
    }

    pub fn with_failing_ping(mut self) -> Self {
        self.ping_ok = false;
        self
    }
}

#[async_trait]
impl MarketDataProvider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn subscribe(&mut self, _symbols: &[Symbol]) -> DataResult<()> {
        Ok(())
    }

    async fn unsubscribe(&mut self, _symbols: &[Symbol]) -> DataResult<()> {
        Ok(())
    }

    async fn next_bar(&mut self) -> DataResult<Option<Bar>> {
        loop {
            match self.script.pop_front() {
                Some(ScriptItem::Bar(bar)) => return Ok(Some(bar)),
                Some(ScriptItem::Error(message)) => {
                    return Err(DataError::Stream { message })
                }
                Some(ScriptItem::Disconnect) | None => return Ok(None),
                Some(ScriptItem::Stall(duration)) => {
                    tokio::time::sleep(duration).await;
                }
            }
        }
    }

    async fn ping(&mut self) -> DataResult<()> {
        if self.ping_ok {
            Ok(())
        } else {
            Err(DataError::Probe {
                message: format!("{} probe refused", self.name),
            })
        }
    }
}
