//! Rate limiting over the storage contract.
//!
//! One [`RateLimitConfig`] shape drives three algorithms: fixed window,
//! sliding window and token bucket. `check` never writes; `increment`
//! consumes quota. Rules preview quota with `check` in their body and consume
//! it from an `on_allow` hook, so a request denied by another rule of the same
//! policy never spends quota (see [`rate_limit_rule`]).

mod algorithms;
mod limiter;
mod rule;

pub use algorithms::{fixed_window_key, fixed_window_start};
pub use limiter::RateLimiter;
pub use rule::rate_limit_rule;

use crate::{Error, Result};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Reason reported when a request is over its limit.
pub const RATE_LIMIT_EXCEEDED: &str = "rate_limit_exceeded";

/// Windowing algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RateLimitAlgorithm {
    /// Counter per aligned window
    FixedWindow,
    /// Timestamp log over a trailing window
    SlidingWindow,
    /// Continuously refilling bucket
    TokenBucket,
}

impl RateLimitAlgorithm {
    /// Get the wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitAlgorithm::FixedWindow => "fixed-window",
            RateLimitAlgorithm::SlidingWindow => "sliding-window",
            RateLimitAlgorithm::TokenBucket => "token-bucket",
        }
    }
}

impl fmt::Display for RateLimitAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rate limit configuration.
///
/// `cost` is only meaningful for the token bucket (default 1); the window
/// algorithms always count one request per increment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Algorithm
    #[serde(rename = "type")]
    pub algorithm: RateLimitAlgorithm,
    /// Caller-chosen key, e.g. `"login:user-42"`
    pub key: String,
    /// Requests (or tokens) allowed per period
    pub limit: u64,
    /// Period as a duration string (`"1h"`, `"5m"`, `"1d"`); bare integers
    /// are milliseconds
    pub period: String,
    /// Tokens consumed per request (token bucket only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<u64>,
}

impl RateLimitConfig {
    /// Create and validate a configuration.
    pub fn new(
        algorithm: RateLimitAlgorithm,
        key: impl Into<String>,
        limit: u64,
        period: impl Into<String>,
    ) -> Result<Self> {
        let config = Self {
            algorithm,
            key: key.into(),
            limit,
            period: period.into(),
            cost: None,
        };
        config.validate()?;
        Ok(config)
    }

    /// Fixed-window configuration.
    pub fn fixed_window(key: impl Into<String>, limit: u64, period: impl Into<String>) -> Result<Self> {
        Self::new(RateLimitAlgorithm::FixedWindow, key, limit, period)
    }

    /// Sliding-window configuration.
    pub fn sliding_window(
        key: impl Into<String>,
        limit: u64,
        period: impl Into<String>,
    ) -> Result<Self> {
        Self::new(RateLimitAlgorithm::SlidingWindow, key, limit, period)
    }

    /// Token-bucket configuration.
    pub fn token_bucket(key: impl Into<String>, limit: u64, period: impl Into<String>) -> Result<Self> {
        Self::new(RateLimitAlgorithm::TokenBucket, key, limit, period)
    }

    /// Set the per-request cost.
    pub fn with_cost(mut self, cost: u64) -> Result<Self> {
        self.cost = Some(cost);
        self.validate()?;
        Ok(self)
    }

    /// Tokens consumed per request.
    pub fn cost(&self) -> u64 {
        self.cost.unwrap_or(1)
    }

    /// Period length in milliseconds.
    pub fn window_ms(&self) -> Result<u64> {
        let period = parse_period(&self.period)?;
        Ok(period.as_millis() as u64)
    }

    /// Check the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.key.trim().is_empty() {
            return Err(Error::rate_limit_config("key cannot be empty", "key"));
        }
        if self.limit == 0 {
            return Err(Error::rate_limit_config("limit must be positive", "limit"));
        }
        self.window_ms()?;
        match self.cost {
            Some(0) => Err(Error::rate_limit_config("cost must be positive", "cost")),
            Some(cost) if cost > self.limit => Err(Error::rate_limit_config(
                format!("cost {} exceeds limit {}", cost, self.limit),
                "cost",
            )),
            _ => Ok(()),
        }
    }
}

/// Parse a period string. Bare integers are milliseconds; everything else
/// follows the short duration convention (`"500ms"`, `"30s"`, `"5m"`,
/// `"1h"`, `"1d"`, also combinations like `"1h 30m"`).
pub fn parse_period(period: &str) -> Result<Duration> {
    let trimmed = period.trim();
    let duration = if !trimmed.is_empty() && trimmed.bytes().all(|b| b.is_ascii_digit()) {
        let ms = trimmed
            .parse::<u64>()
            .map_err(|e| Error::rate_limit_config(format!("invalid period '{}': {}", period, e), "period"))?;
        Duration::from_millis(ms)
    } else {
        humantime::parse_duration(trimmed).map_err(|e| {
            Error::rate_limit_config(format!("invalid period '{}': {}", period, e), "period")
        })?
    };

    if duration.as_millis() == 0 {
        return Err(Error::rate_limit_config(
            format!("period '{}' must be at least 1ms", period),
            "period",
        ));
    }
    Ok(duration)
}

/// Persisted limiter state, one variant per algorithm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RateLimitStoreData {
    /// Requests counted in the current window
    FixedWindow {
        /// Request count
        count: u64,
    },
    /// Request timestamps (ms) inside the trailing window
    SlidingWindow {
        /// Timestamps, oldest first
        timestamps: Vec<u64>,
    },
    /// Bucket level at the last refill
    #[serde(rename_all = "camelCase")]
    TokenBucket {
        /// Tokens left after the last consumption
        remaining_tokens: f64,
        /// Time of the last refill (ms)
        last_refill_at: u64,
    },
}

impl RateLimitStoreData {
    /// Algorithm this payload belongs to.
    pub fn algorithm(&self) -> RateLimitAlgorithm {
        match self {
            RateLimitStoreData::FixedWindow { .. } => RateLimitAlgorithm::FixedWindow,
            RateLimitStoreData::SlidingWindow { .. } => RateLimitAlgorithm::SlidingWindow,
            RateLimitStoreData::TokenBucket { .. } => RateLimitAlgorithm::TokenBucket,
        }
    }
}

/// Outcome of a check or increment. Recomputed on every call, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitCheckResult {
    /// Whether a request may proceed now
    pub allowed: bool,
    /// Remaining quota
    pub remaining: u64,
    /// When the limit resets (ms since epoch)
    pub reset_at: u64,
    /// Denial reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl RateLimitCheckResult {
    pub(crate) fn new(allowed: bool, remaining: u64, reset_at: u64) -> Self {
        Self {
            allowed,
            remaining,
            reset_at,
            reason: (!allowed).then(|| RATE_LIMIT_EXCEEDED.to_string()),
        }
    }

    /// Milliseconds from `now_ms` until the reset, zero if already past.
    pub fn retry_after_ms(&self, now_ms: u64) -> u64 {
        self.reset_at.saturating_sub(now_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_period() {
        assert_eq!(parse_period("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_period("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_period("1d").unwrap(), Duration::from_secs(86_400));
        assert_eq!(parse_period("1s").unwrap(), Duration::from_secs(1));
        assert_eq!(parse_period("250").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_period(" 1h 30m ").unwrap(), Duration::from_secs(5400));
    }

    #[test]
    fn test_parse_period_rejects_garbage() {
        for bad in ["", "soon", "0", "0s", "-1h"] {
            assert!(
                matches!(parse_period(bad), Err(Error::InvalidRateLimitConfig { .. })),
                "{} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(RateLimitConfig::fixed_window("login", 5, "1h").is_ok());
        assert!(RateLimitConfig::fixed_window("", 5, "1h").is_err());
        assert!(RateLimitConfig::fixed_window("login", 0, "1h").is_err());
        assert!(RateLimitConfig::sliding_window("login", 3, "forever").is_err());

        let bucket = RateLimitConfig::token_bucket("api", 10, "1s").unwrap();
        assert_eq!(bucket.cost(), 1);
        assert_eq!(bucket.clone().with_cost(10).unwrap().cost(), 10);
        assert!(bucket.clone().with_cost(0).is_err());
        assert!(bucket.with_cost(11).is_err());
    }

    #[test]
    fn test_config_serialization() {
        let config = RateLimitConfig::token_bucket("api", 10, "1s")
            .unwrap()
            .with_cost(2)
            .unwrap();
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "token-bucket", "key": "api", "limit": 10, "period": "1s", "cost": 2})
        );
    }

    #[test]
    fn test_store_data_tagging() {
        let data = RateLimitStoreData::TokenBucket {
            remaining_tokens: 2.5,
            last_refill_at: 10,
        };
        let json = serde_json::to_value(&data).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "token-bucket", "remainingTokens": 2.5, "lastRefillAt": 10})
        );
        assert_eq!(
            serde_json::from_value::<RateLimitStoreData>(json).unwrap(),
            data
        );

        let json = serde_json::json!({"type": "fixed-window", "count": 3});
        let data: RateLimitStoreData = serde_json::from_value(json).unwrap();
        assert_eq!(data.algorithm(), RateLimitAlgorithm::FixedWindow);
    }
}
