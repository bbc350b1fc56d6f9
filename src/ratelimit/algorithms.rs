//! Window math for the three algorithms.
//!
//! Everything here is pure: given the stored state (if any) and `now`, compute
//! the check result and, for increments, the next state. The limiter wires
//! these into storage reads and atomic updates.

use super::{RateLimitCheckResult, RateLimitStoreData};

/// Start of the fixed window containing `now`.
pub fn fixed_window_start(now: u64, window_ms: u64) -> u64 {
    now / window_ms * window_ms
}

/// Storage key of the fixed window containing `now`.
pub fn fixed_window_key(key: &str, now: u64, window_ms: u64) -> String {
    format!("{}:{}", key, fixed_window_start(now, window_ms))
}

/// Parameters shared by every algorithm, already validated.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Limits {
    pub limit: u64,
    pub window_ms: u64,
    pub cost: u64,
}

pub(crate) mod fixed {
    use super::*;

    pub fn count(data: Option<&RateLimitStoreData>) -> u64 {
        match data {
            Some(RateLimitStoreData::FixedWindow { count }) => *count,
            _ => 0,
        }
    }

    pub fn check(count: u64, limits: Limits, now: u64) -> RateLimitCheckResult {
        let window_start = fixed_window_start(now, limits.window_ms);
        RateLimitCheckResult::new(
            count < limits.limit,
            limits.limit.saturating_sub(count).saturating_sub(1),
            window_start + limits.window_ms,
        )
    }

    pub fn increment(data: Option<&RateLimitStoreData>) -> RateLimitStoreData {
        RateLimitStoreData::FixedWindow {
            count: count(data) + 1,
        }
    }
}

pub(crate) mod sliding {
    use super::*;

    /// Timestamps still inside the window ending at `now`.
    pub fn live(data: Option<&RateLimitStoreData>, now: u64, window_ms: u64) -> Vec<u64> {
        match data {
            Some(RateLimitStoreData::SlidingWindow { timestamps }) => timestamps
                .iter()
                .copied()
                .filter(|&t| t.saturating_add(window_ms) > now)
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn check(timestamps: &[u64], limits: Limits, now: u64) -> RateLimitCheckResult {
        let count = timestamps.len() as u64;
        let reset_at = timestamps
            .iter()
            .min()
            .map(|oldest| oldest + limits.window_ms)
            .unwrap_or(now + limits.window_ms);
        RateLimitCheckResult::new(
            count < limits.limit,
            limits.limit.saturating_sub(count).saturating_sub(1),
            reset_at,
        )
    }

    pub fn increment(data: Option<&RateLimitStoreData>, now: u64, window_ms: u64) -> RateLimitStoreData {
        let mut timestamps = live(data, now, window_ms);
        timestamps.push(now);
        RateLimitStoreData::SlidingWindow { timestamps }
    }
}

pub(crate) mod bucket {
    use super::*;

    /// Bucket level at `now`, after continuous refill. A missing bucket is full.
    pub fn level(data: Option<&RateLimitStoreData>, limits: Limits, now: u64) -> f64 {
        let capacity = limits.limit as f64;
        match data {
            Some(RateLimitStoreData::TokenBucket {
                remaining_tokens,
                last_refill_at,
            }) => {
                let elapsed = now.saturating_sub(*last_refill_at) as f64;
                let refill = elapsed * capacity / limits.window_ms as f64;
                (remaining_tokens + refill).min(capacity)
            }
            _ => capacity,
        }
    }

    /// Time until the bucket is full again.
    fn ms_to_full(tokens: f64, limits: Limits) -> u64 {
        let missing = (limits.limit as f64 - tokens).max(0.0);
        (missing * limits.window_ms as f64 / limits.limit as f64).ceil() as u64
    }

    pub fn check(tokens: f64, limits: Limits, now: u64) -> RateLimitCheckResult {
        RateLimitCheckResult::new(
            tokens >= limits.cost as f64,
            tokens.max(0.0).floor() as u64,
            now + ms_to_full(tokens, limits),
        )
    }

    pub fn consume(data: Option<&RateLimitStoreData>, limits: Limits, now: u64) -> RateLimitStoreData {
        let tokens = level(data, limits, now);
        RateLimitStoreData::TokenBucket {
            remaining_tokens: (tokens - limits.cost as f64).max(0.0),
            last_refill_at: now,
        }
    }
}
