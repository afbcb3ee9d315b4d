//! Per-broker health tracking and submission rate windows.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Exponential moving average weight for response times.
const EMA_ALPHA: f64 = 0.1;

/// Health state for one broker. Single-writer: only the submitting task and
/// the health monitor mutate it; readers may observe slightly stale values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerHealth {
    pub healthy: bool,
    pub consecutive_failures: u32,
    /// Consecutive successful probes while critical; drives recovery.
    pub consecutive_probe_passes: u32,
    pub success_count: u64,
    pub error_count: u64,
    pub avg_response_ms: f64,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
}

impl Default for BrokerHealth {
    fn default() -> Self {
        Self {
            healthy: true,
            consecutive_failures: 0,
            consecutive_probe_passes: 0,
            success_count: 0,
            error_count: 0,
            avg_response_ms: 0.0,
            last_error: None,
            last_error_at: None,
            last_success_at: None,
        }
    }
}

impl BrokerHealth {
    /// Success percentage over all recorded calls; optimistic before any data.
    pub fn success_rate(&self) -> f64 {
        let total = self.success_count + self.error_count;
        if total == 0 {
            100.0
        } else {
            self.success_count as f64 / total as f64 * 100.0
        }
    }

    /// Critical brokers are excluded from selection.
    pub fn is_critical(&self) -> bool {
        self.consecutive_failures >= 3 || self.success_rate() < 50.0 || !self.healthy
    }

    pub fn record_success(&mut self, response_ms: f64) {
        self.success_count += 1;
        self.consecutive_failures = 0;
        self.last_success_at = Some(Utc::now());
        self.avg_response_ms = if self.avg_response_ms == 0.0 {
            response_ms
        } else {
            self.avg_response_ms * (1.0 - EMA_ALPHA) + response_ms * EMA_ALPHA
        };
    }

    pub fn record_failure(&mut self, error: &str) {
        self.error_count += 1;
        self.consecutive_failures += 1;
        self.consecutive_probe_passes = 0;
        self.last_error = Some(error.to_string());
        self.last_error_at = Some(Utc::now());
        if self.consecutive_failures >= 3 {
            self.healthy = false;
        }
    }

    /// Record a passing probe. Returns `true` when the broker just recovered
    /// (it was critical and has now passed `required_passes` probes in a row).
    pub fn record_probe_pass(&mut self, response_ms: f64, required_passes: u32) -> bool {
        let was_critical = self.is_critical();
        self.avg_response_ms = if self.avg_response_ms == 0.0 {
            response_ms
        } else {
            self.avg_response_ms * (1.0 - EMA_ALPHA) + response_ms * EMA_ALPHA
        };
        if !was_critical {
            return false;
        }
        self.consecutive_probe_passes += 1;
        if self.consecutive_probe_passes >= required_passes {
            self.healthy = true;
            self.consecutive_failures = 0;
            self.consecutive_probe_passes = 0;
            // A recovered broker starts a fresh error budget but keeps its
            // lifetime counters; seed one success so the rate gate reopens.
            if self.success_rate() < 50.0 {
                self.success_count = self.error_count + 1;
            }
            return true;
        }
        false
    }
}

/// Sliding one-window submission limiter.
#[derive(Debug)]
pub struct RateWindow {
    timestamps: VecDeque<DateTime<Utc>>,
    limit: u32,
    window: ChronoDuration,
}

impl RateWindow {
    pub fn per_minute(limit: u32) -> Self {
        Self {
            timestamps: VecDeque::new(),
            limit,
            window: ChronoDuration::seconds(60),
        }
    }

    pub fn with_window(limit: u32, window_secs: i64) -> Self {
        Self {
            timestamps: VecDeque::new(),
            limit,
            window: ChronoDuration::seconds(window_secs),
        }
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - self.window;
        while let Some(front) = self.timestamps.front() {
            if *front < cutoff {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    /// Whether another submission fits in the current window.
    pub fn has_room(&mut self) -> bool {
        let now = Utc::now();
        self.prune(now);
        (self.timestamps.len() as u32) < self.limit
    }

    /// Record a submission.
    pub fn record(&mut self) {
        let now = Utc::now();
        self.prune(now);
        self.timestamps.push_back(now);
    }

    pub fn in_window(&mut self) -> u32 {
        self.prune(Utc::now());
        self.timestamps.len() as u32
    }
}
