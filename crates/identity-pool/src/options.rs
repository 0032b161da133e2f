//! Pool options
//!
//! Defaults are applied once at load time by serde and `validate()` runs
//! before a pool is built. Intervals are written as (possibly fractional)
//! seconds and held as `Duration`.

use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::error::{Error, Result};

/// Upper bound for the creation retry backoff.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Per-pool configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolOptions {
    /// Deprecations that trigger removal. Negative means unlimited.
    pub max_deprecations_before_removal: i64,
    /// Cooldown between two uses of the same identity.
    #[serde(deserialize_with = "seconds")]
    pub min_interval_between_use: Duration,
    /// Debounce window between store flushes.
    #[serde(deserialize_with = "seconds")]
    pub min_interval_between_store_update: Duration,
    /// Prefer the most recently used identity instead of the least recently used.
    pub recently_used_first: bool,
    /// Age after which a lease is considered abandoned.
    #[serde(deserialize_with = "seconds")]
    pub lock_expire: Duration,
    /// Creation retries after the first trial. Negative means unlimited.
    pub max_retry_create_identities: i64,
    /// Return "no identity" instead of waiting or failing when exhausted.
    pub allow_no_identity: bool,
    /// Block on the store when the pool is empty and nothing could be created.
    pub wait_for_store_update_when_no_identity: bool,
    /// Sleep between selection rounds while every identity is busy. Zero disables polling.
    #[serde(deserialize_with = "seconds")]
    pub polling_interval_waiting_for_available: Duration,
    /// Base backoff between creation trials, doubled per trial.
    #[serde(deserialize_with = "seconds")]
    pub create_retry_delay: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_deprecations_before_removal: 3,
            min_interval_between_use: Duration::ZERO,
            min_interval_between_store_update: Duration::from_secs(10),
            recently_used_first: false,
            lock_expire: Duration::from_secs(300),
            max_retry_create_identities: 3,
            allow_no_identity: false,
            wait_for_store_update_when_no_identity: true,
            polling_interval_waiting_for_available: Duration::from_secs(1),
            create_retry_delay: Duration::from_secs(1),
        }
    }
}

impl PoolOptions {
    /// Reject option combinations the pool cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.lock_expire.is_zero() {
            return Err(Error::Config("lock_expire must be greater than 0".into()));
        }
        Ok(())
    }

    /// Deprecation count that removes an identity, if limited.
    pub fn deprecation_limit(&self) -> Option<u32> {
        limit(self.max_deprecations_before_removal)
    }

    /// Creation retry budget, if limited.
    pub fn retry_budget(&self) -> Option<u32> {
        limit(self.max_retry_create_identities)
    }

    /// Backoff before creation trial `trial + 1`.
    pub fn retry_delay(&self, trial: u32) -> Duration {
        if self.create_retry_delay.is_zero() {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(trial.saturating_sub(1));
        self.create_retry_delay
            .saturating_mul(factor)
            .min(MAX_RETRY_DELAY)
    }
}

fn limit(value: i64) -> Option<u32> {
    (value >= 0).then(|| u32::try_from(value).unwrap_or(u32::MAX))
}

fn seconds<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let secs = f64::deserialize(deserializer)?;
    Duration::try_from_secs_f64(secs).map_err(|_| {
        serde::de::Error::custom(format!(
            "invalid interval {secs}: expected a finite, non-negative number of seconds"
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_missing_fields() {
        let options: PoolOptions = toml::from_str("lock_expire = 60").unwrap();
        assert_eq!(options.lock_expire, Duration::from_secs(60));
        assert_eq!(options.max_deprecations_before_removal, 3);
        assert_eq!(
            options.polling_interval_waiting_for_available,
            Duration::from_secs(1)
        );
        assert!(!options.allow_no_identity);
    }

    #[test]
    fn fractional_seconds_are_accepted() {
        let options: PoolOptions =
            toml::from_str("min_interval_between_use = 0.25").unwrap();
        assert_eq!(options.min_interval_between_use, Duration::from_millis(250));
    }

    #[test]
    fn negative_interval_is_rejected() {
        let result: std::result::Result<PoolOptions, _> = toml::from_str("lock_expire = -1");
        let err = result.unwrap_err().to_string();
        assert!(err.contains("non-negative"), "error: {err}");
    }

    #[test]
    fn unknown_field_is_rejected() {
        let result: std::result::Result<PoolOptions, _> = toml::from_str("lock_expiry = 5");
        assert!(result.is_err());
    }

    #[test]
    fn zero_lock_expire_fails_validation() {
        let options = PoolOptions {
            lock_expire: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(options.validate(), Err(Error::Config(_))));
        assert!(PoolOptions::default().validate().is_ok());
    }

    #[test]
    fn negative_limits_mean_unlimited() {
        let options = PoolOptions {
            max_deprecations_before_removal: -1,
            max_retry_create_identities: -5,
            ..Default::default()
        };
        assert_eq!(options.deprecation_limit(), None);
        assert_eq!(options.retry_budget(), None);
        assert_eq!(PoolOptions::default().retry_budget(), Some(3));
    }

    #[test]
    fn retry_delay_doubles_and_caps() {
        let options = PoolOptions::default();
        assert_eq!(options.retry_delay(1), Duration::from_secs(1));
        assert_eq!(options.retry_delay(2), Duration::from_secs(2));
        assert_eq!(options.retry_delay(3), Duration::from_secs(4));
        assert_eq!(options.retry_delay(40), MAX_RETRY_DELAY);

        let immediate = PoolOptions {
            create_retry_delay: Duration::ZERO,
            ..Default::default()
        };
        assert_eq!(immediate.retry_delay(5), Duration::ZERO);
    }
}
