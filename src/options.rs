use std::time::Duration;

/// Delay policy between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "kind", rename_all = "snake_case"))]
pub enum Backoff {
    /// Always wait `retry_delay`
    Fixed,
    /// Wait `retry_delay * 2^(attempt - 1)`, capped at `max`
    Exponential {
        #[cfg_attr(feature = "serde", serde(rename = "max_ms", with = "duration_ms"))]
        max: Duration,
    },
}

impl Backoff {
    /// Delay before retry number `attempt` (1-based)
    pub fn delay(&self, base: Duration, attempt: u32) -> Duration {
        match self {
            Backoff::Fixed => base,
            Backoff::Exponential { max } => {
                let shift = attempt.saturating_sub(1).min(31);
                base.saturating_mul(1u32 << shift).min(*max)
            }
        }
    }
}

/// Per-namespace cache behaviour.
///
/// Durations of zero disable the related feature: no polling for `refetch_interval`,
/// no timeout for `fetch_timeout`. A `max_entries` of zero leaves the cache unbounded.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct CacheOptions {
    /// Suppress fetching entirely
    pub enabled: bool,
    #[cfg_attr(feature = "serde", serde(rename = "refetch_interval_ms", with = "duration_ms"))]
    pub refetch_interval: Duration,
    /// Age after which a value is served as stale and revalidated
    #[cfg_attr(feature = "serde", serde(rename = "stale_time_ms", with = "duration_ms"))]
    pub stale_time: Duration,
    pub retry: bool,
    /// Retries after the first failed attempt
    pub max_retries: u32,
    #[cfg_attr(feature = "serde", serde(rename = "retry_delay_ms", with = "duration_ms"))]
    pub retry_delay: Duration,
    pub backoff: Backoff,
    #[cfg_attr(feature = "serde", serde(rename = "fetch_timeout_ms", with = "duration_ms"))]
    pub fetch_timeout: Duration,
    pub max_entries: usize,
}

impl Default for CacheOptions {
    fn default() -> Self {
        CacheOptions {
            enabled: true,
            refetch_interval: Duration::ZERO,
            stale_time: Duration::from_secs(30),
            retry: true,
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            backoff: Backoff::Exponential {
                max: Duration::from_secs(30),
            },
            fetch_timeout: Duration::ZERO,
            max_entries: 1024,
        }
    }
}

impl CacheOptions {
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn refetch_interval(mut self, interval: Duration) -> Self {
        self.refetch_interval = interval;
        self
    }

    pub fn stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = stale_time;
        self
    }

    pub fn retry(mut self, retry: bool) -> Self {
        self.retry = retry;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    /// Polling interval, if polling is on
    pub fn polling(&self) -> Option<Duration> {
        (!self.refetch_interval.is_zero()).then_some(self.refetch_interval)
    }

    /// Per-attempt timeout, if one is configured
    pub fn timeout(&self) -> Option<Duration> {
        (!self.fetch_timeout.is_zero()).then_some(self.fetch_timeout)
    }

    /// Whether another attempt may follow failure number `failures` (1-based)
    pub fn should_retry(&self, failures: u32) -> bool {
        self.retry && failures <= self.max_retries
    }

    /// Delay before the retry following failure number `failures`
    pub fn retry_delay_for(&self, failures: u32) -> Duration {
        self.backoff.delay(self.retry_delay, failures)
    }
}

#[cfg(feature = "serde")]
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_backoff_ignores_attempt() {
        let base = Duration::from_millis(250);
        assert_eq!(Backoff::Fixed.delay(base, 1), base);
        assert_eq!(Backoff::Fixed.delay(base, 7), base);
    }

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let backoff = Backoff::Exponential {
            max: Duration::from_secs(1),
        };
        let base = Duration::from_millis(100);
        assert_eq!(backoff.delay(base, 1), Duration::from_millis(100));
        assert_eq!(backoff.delay(base, 2), Duration::from_millis(200));
        assert_eq!(backoff.delay(base, 3), Duration::from_millis(400));
        assert_eq!(backoff.delay(base, 5), Duration::from_secs(1));
        assert_eq!(backoff.delay(base, u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn retry_bound_counts_retries_not_attempts() {
        let options = CacheOptions::default().max_retries(3);
        assert!(options.should_retry(1));
        assert!(options.should_retry(3));
        assert!(!options.should_retry(4));
        assert!(!options.clone().retry(false).should_retry(1));
    }

    #[test]
    fn zero_durations_disable_features() {
        let options = CacheOptions::default();
        assert_eq!(options.polling(), None);
        assert_eq!(options.timeout(), None);
        let options = options
            .refetch_interval(Duration::from_secs(5))
            .fetch_timeout(Duration::from_secs(2));
        assert_eq!(options.polling(), Some(Duration::from_secs(5)));
        assert_eq!(options.timeout(), Some(Duration::from_secs(2)));
    }

    #[cfg(feature = "json")]
    #[test]
    fn options_deserialize_from_millisecond_fields() {
        let options: CacheOptions = serde_json::from_str(
            r#"{
                "refetch_interval_ms": 60000,
                "stale_time_ms": 5000,
                "retry_delay_ms": 200,
                "backoff": {"kind": "fixed"},
                "max_entries": 16
            }"#,
        )
        .unwrap();
        assert_eq!(options.refetch_interval, Duration::from_secs(60));
        assert_eq!(options.stale_time, Duration::from_secs(5));
        assert_eq!(options.retry_delay, Duration::from_millis(200));
        assert_eq!(options.backoff, Backoff::Fixed);
        assert_eq!(options.max_entries, 16);
        // untouched fields keep their defaults
        assert!(options.enabled);
        assert_eq!(options.max_retries, 3);
    }
}
