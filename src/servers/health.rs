//! Per-server connection health.
//!
//! Mutated only by the connection manager. The latency average is a simple
//! two-point average with the previous value; the error rate is a weighted
//! recomputation over the attempt count.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionHealth {
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_attempt_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub average_latency_ms: f64,
    /// Time the current ready period started.
    #[serde(default)]
    pub uptime_marker: Option<DateTime<Utc>>,
    /// Always within `[0, 1]`.
    #[serde(default)]
    pub error_rate: f64,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub last_error_at: Option<DateTime<Utc>>,
}

impl ConnectionHealth {
    pub fn record_attempt(&mut self, now: DateTime<Utc>) {
        self.attempts = self.attempts.saturating_add(1);
        self.last_attempt_at = Some(now);
    }

    pub fn record_success(&mut self, latency_ms: f64, now: DateTime<Utc>) {
        self.average_latency_ms = if self.average_latency_ms > 0.0 {
            (self.average_latency_ms + latency_ms) / 2.0
        } else {
            latency_ms
        };
        self.uptime_marker = Some(now);
        self.error_rate = self.weighted_rate(0.0);
    }

    pub fn record_failure(&mut self, error: &str, now: DateTime<Utc>) {
        self.error_rate = self.weighted_rate(1.0);
        self.last_error = Some(error.to_string());
        self.last_error_at = Some(now);
        self.uptime_marker = None;
    }

    /// Fold one outcome (0 = success, 1 = failure) into the rate.
    fn weighted_rate(&self, outcome: f64) -> f64 {
        let n = f64::from(self.attempts.max(1));
        let rate = (self.error_rate * (n - 1.0) + outcome) / n;
        rate.clamp(0.0, 1.0)
    }
}
