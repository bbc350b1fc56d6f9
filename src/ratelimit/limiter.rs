//! Storage-backed rate limiter.

use super::algorithms::{bucket, fixed, fixed_window_key, sliding, Limits};
use super::{RateLimitAlgorithm, RateLimitCheckResult, RateLimitConfig, RateLimitStoreData};
use crate::clock::{system_clock, SharedClock};
use crate::storage::{update_or_fallback, SharedStorage, StorageUpdate};
use crate::Result;

use std::time::Duration;
use tracing::debug;

/// Applies rate limit configs against a storage adapter.
///
/// Increments go through the adapter's atomic `update` when it has one; with
/// a plain adapter concurrent increments on one key may be lost.
#[derive(Clone)]
pub struct RateLimiter {
    storage: SharedStorage<RateLimitStoreData>,
    clock: SharedClock,
}

impl RateLimiter {
    /// Create a limiter using the system clock.
    pub fn new(storage: SharedStorage<RateLimitStoreData>) -> Self {
        Self::with_clock(storage, system_clock())
    }

    /// Create a limiter reading time from `clock`.
    pub fn with_clock(storage: SharedStorage<RateLimitStoreData>, clock: SharedClock) -> Self {
        Self { storage, clock }
    }

    /// The clock used for window math.
    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// Preview the quota for `config` without consuming any of it.
    pub async fn check(&self, config: &RateLimitConfig) -> Result<RateLimitCheckResult> {
        let limits = limits(config)?;
        let now = self.clock.now_ms();
        let key = storage_key(config, now, limits.window_ms);
        let data = self.storage.get(&key).await?;
        let data = matching(config, data);

        let result = match config.algorithm {
            RateLimitAlgorithm::FixedWindow => fixed::check(fixed::count(data.as_ref()), limits, now),
            RateLimitAlgorithm::SlidingWindow => {
                let live = sliding::live(data.as_ref(), now, limits.window_ms);
                sliding::check(&live, limits, now)
            }
            RateLimitAlgorithm::TokenBucket => {
                bucket::check(bucket::level(data.as_ref(), limits, now), limits, now)
            }
        };

        debug!(
            key = %key,
            algorithm = %config.algorithm,
            allowed = result.allowed,
            remaining = result.remaining,
            "Rate limit checked"
        );
        Ok(result)
    }

    /// Consume one request (or `cost` tokens) and return the state a
    /// subsequent [`RateLimiter::check`] would report.
    pub async fn increment(&self, config: &RateLimitConfig) -> Result<RateLimitCheckResult> {
        let limits = limits(config)?;
        let now = self.clock.now_ms();
        let key = storage_key(config, now, limits.window_ms);
        let ttl = Duration::from_millis(limits.window_ms);
        let algorithm = config.algorithm;

        let updater = move |current: Option<RateLimitStoreData>| {
            let current = current.filter(|data| data.algorithm() == algorithm);
            let next = match algorithm {
                RateLimitAlgorithm::FixedWindow => fixed::increment(current.as_ref()),
                RateLimitAlgorithm::SlidingWindow => {
                    sliding::increment(current.as_ref(), now, limits.window_ms)
                }
                RateLimitAlgorithm::TokenBucket => bucket::consume(current.as_ref(), limits, now),
            };
            Some(StorageUpdate::with_ttl(next, ttl))
        };
        let stored = update_or_fallback(self.storage.as_ref(), &key, &updater).await?;

        let result = match (algorithm, stored.as_ref()) {
            (RateLimitAlgorithm::FixedWindow, data) => fixed::check(fixed::count(data), limits, now),
            (RateLimitAlgorithm::SlidingWindow, data) => {
                let live = sliding::live(data, now, limits.window_ms);
                sliding::check(&live, limits, now)
            }
            (RateLimitAlgorithm::TokenBucket, data) => {
                bucket::check(bucket::level(data, limits, now), limits, now)
            }
        };

        debug!(
            key = %key,
            algorithm = %algorithm,
            remaining = result.remaining,
            "Rate limit incremented"
        );
        Ok(result)
    }

    /// Forget the state for `config` (the current window for fixed windows).
    pub async fn reset(&self, config: &RateLimitConfig) -> Result<()> {
        let limits = limits(config)?;
        let key = storage_key(config, self.clock.now_ms(), limits.window_ms);
        self.storage.delete(&key).await
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("atomic", &self.storage.supports_update())
            .finish()
    }
}

fn limits(config: &RateLimitConfig) -> Result<Limits> {
    config.validate()?;
    Ok(Limits {
        limit: config.limit,
        window_ms: config.window_ms()?,
        cost: config.cost(),
    })
}

fn storage_key(config: &RateLimitConfig, now: u64, window_ms: u64) -> String {
    match config.algorithm {
        RateLimitAlgorithm::FixedWindow => fixed_window_key(&config.key, now, window_ms),
        RateLimitAlgorithm::SlidingWindow | RateLimitAlgorithm::TokenBucket => config.key.clone(),
    }
}

/// Payloads written by a different algorithm under the same key are ignored.
fn matching(config: &RateLimitConfig, data: Option<RateLimitStoreData>) -> Option<RateLimitStoreData> {
    match data {
        Some(data) if data.algorithm() != config.algorithm => {
            debug!(
                key = %config.key,
                expected = %config.algorithm,
                found = %data.algorithm(),
                "Ignoring rate limit state written by another algorithm"
            );
            None
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::{InMemoryStorage, StorageAdapter};
    use crate::Error;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use proptest::prelude::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    const HOUR: u64 = 3_600_000;
    // An hour boundary, so the fixed window starts exactly at T0.
    const T0: u64 = 1_700_002_800_000;

    fn limiter() -> (Arc<ManualClock>, RateLimiter) {
        let clock = ManualClock::shared(T0);
        let storage = Arc::new(InMemoryStorage::with_clock(clock.clone()));
        (clock.clone(), RateLimiter::with_clock(storage, clock))
    }

    #[tokio::test]
    async fn test_fixed_window_limit_and_rollover() {
        let (clock, limiter) = limiter();
        let config = RateLimitConfig::fixed_window("login:u1", 5, "1h").unwrap();

        for _ in 0..5 {
            limiter.increment(&config).await.unwrap();
        }
        let result = limiter.check(&config).await.unwrap();
        assert!(!result.allowed);
        assert_eq!(result.remaining, 0);
        assert_eq!(result.reset_at, T0 + HOUR);

        clock.advance(HOUR);
        let result = limiter.check(&config).await.unwrap();
        assert!(result.allowed);
        assert_eq!(result.remaining, 4);
    }

    #[tokio::test]
    async fn test_sliding_window_ages_out() {
        let (clock, limiter) = limiter();
        let config = RateLimitConfig::sliding_window("otp:u1", 3, "1h").unwrap();

        limiter.increment(&config).await.unwrap();
        clock.set(T0 + 1_000);
        limiter.increment(&config).await.unwrap();
        clock.set(T0 + 2_000);
        limiter.increment(&config).await.unwrap();

        clock.set(T0 + 3_000);
        let result = limiter.check(&config).await.unwrap();
        assert!(!result.allowed);
        assert_eq!(result.reset_at, T0 + HOUR);

        clock.set(T0 + HOUR + 1_500);
        let result = limiter.check(&config).await.unwrap();
        assert!(result.allowed);
        assert_eq!(result.remaining, 1);
        assert_eq!(result.reset_at, T0 + 2_000 + HOUR);
    }

    #[tokio::test]
    async fn test_token_bucket_refills() {
        let (clock, limiter) = limiter();
        let config = RateLimitConfig::token_bucket("api:u1", 10, "1s")
            .unwrap()
            .with_cost(10)
            .unwrap();

        let drained = limiter.increment(&config).await.unwrap();
        assert_eq!(drained.remaining, 0);
        assert!(!drained.allowed);
        assert_eq!(drained.reset_at, T0 + 1_000);

        clock.advance(500);
        let single = RateLimitConfig::token_bucket("api:u1", 10, "1s").unwrap();
        let result = limiter.check(&single).await.unwrap();
        assert!(result.allowed);
        assert_eq!(result.remaining, 5);
        assert_eq!(result.reset_at, T0 + 1_000);

        // Not enough for the full cost yet.
        assert!(!limiter.check(&config).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_increment_then_check_reduces_by_one() {
        for config in [
            RateLimitConfig::fixed_window("k", 3, "1m").unwrap(),
            RateLimitConfig::sliding_window("k", 3, "1m").unwrap(),
            RateLimitConfig::token_bucket("k", 3, "1m").unwrap(),
        ] {
            let (_, limiter) = limiter();
            let before = limiter.check(&config).await.unwrap().remaining;
            limiter.increment(&config).await.unwrap();
            let after = limiter.check(&config).await.unwrap().remaining;
            assert_eq!(after, before - 1, "{}", config.algorithm);

            for _ in 0..5 {
                limiter.increment(&config).await.unwrap();
            }
            assert_eq!(limiter.check(&config).await.unwrap().remaining, 0);
        }
    }

    #[tokio::test]
    async fn test_reset_clears_state() {
        let (_, limiter) = limiter();
        let config = RateLimitConfig::fixed_window("k", 1, "1m").unwrap();
        limiter.increment(&config).await.unwrap();
        assert!(!limiter.check(&config).await.unwrap().allowed);

        limiter.reset(&config).await.unwrap();
        assert!(limiter.check(&config).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let (_, limiter) = limiter();
        let config = RateLimitConfig {
            algorithm: RateLimitAlgorithm::FixedWindow,
            key: "k".to_string(),
            limit: 1,
            period: "whenever".to_string(),
            cost: None,
        };
        assert!(matches!(
            limiter.check(&config).await,
            Err(Error::InvalidRateLimitConfig { .. })
        ));
    }

    /// Adapter without `update`, to exercise the get-then-set fallback.
    #[derive(Default)]
    struct PlainStorage {
        values: Mutex<HashMap<String, RateLimitStoreData>>,
    }

    #[async_trait]
    impl StorageAdapter<RateLimitStoreData> for PlainStorage {
        async fn get(&self, key: &str) -> Result<Option<RateLimitStoreData>> {
            Ok(self.values.lock().get(key).cloned())
        }

        async fn set(&self, key: &str, value: RateLimitStoreData, _ttl: Option<Duration>) -> Result<()> {
            self.values.lock().insert(key.to_string(), value);
            Ok(())
        }

        async fn delete(&self, key: &str) -> Result<()> {
            self.values.lock().remove(key);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_non_atomic_fallback() {
        let clock = ManualClock::shared(T0);
        let limiter = RateLimiter::with_clock(Arc::new(PlainStorage::default()), clock);
        let config = RateLimitConfig::sliding_window("k", 2, "1m").unwrap();

        limiter.increment(&config).await.unwrap();
        limiter.increment(&config).await.unwrap();
        assert!(!limiter.check(&config).await.unwrap().allowed);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        /// Checking never changes what the next check reports.
        #[test]
        fn prop_check_is_idempotent(increments in 0u64..8, offset in 0u64..120_000, algo in 0u8..3) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            runtime.block_on(async {
                let (clock, limiter) = limiter();
                let config = match algo {
                    0 => RateLimitConfig::fixed_window("p", 5, "1m"),
                    1 => RateLimitConfig::sliding_window("p", 5, "1m"),
                    _ => RateLimitConfig::token_bucket("p", 5, "1m"),
                }
                .unwrap();
                for _ in 0..increments {
                    limiter.increment(&config).await.unwrap();
                }
                clock.advance(offset);
                let first = limiter.check(&config).await.unwrap();
                let second = limiter.check(&config).await.unwrap();
                assert_eq!(first, second);
            });
        }
    }
}
