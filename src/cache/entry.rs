use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use crate::data_providers::data_provider::DataLoadResult;
use crate::error::{ErrorInfo, ProviderError};

/// Lifecycle status of a cache entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// Created, nothing fetched yet
    Idle,
    /// First fetch in progress, no value to serve
    Loading,
    /// Value confirmed by the remote source
    Ready,
    /// Last fetch exhausted its retries
    Error,
    /// Value is usable but due for revalidation
    Stale,
}

/// A single remotely sourced value and its bookkeeping.
///
/// Subscribers receive clones of this struct; the value itself is shared through an [`Arc`].
#[derive(Debug)]
pub struct CacheEntry<K, T> {
    pub key: K,
    /// Last known-good value. Survives failed refreshes.
    pub value: Option<Arc<T>>,
    /// When `value` was last confirmed remotely. Local writes never touch it.
    pub fetched_at: Option<Instant>,
    pub status: Status,
    /// Last failure, kept after a value exists
    pub error: Option<ErrorInfo>,
    /// Consecutive failures since the last success
    pub retry_count: u32,
    /// A fetch for this key is in flight
    pub fetching: bool,
    /// Freshness window advertised by the provider
    pub max_age: Option<Duration>,
    /// Stale data must not be served without a successful revalidation
    pub must_revalidate: bool,
}

impl<K: Clone, T> Clone for CacheEntry<K, T> {
    fn clone(&self) -> Self {
        CacheEntry {
            key: self.key.clone(),
            value: self.value.clone(),
            fetched_at: self.fetched_at,
            status: self.status,
            error: self.error.clone(),
            retry_count: self.retry_count,
            fetching: self.fetching,
            max_age: self.max_age,
            must_revalidate: self.must_revalidate,
        }
    }
}

impl<K, T> CacheEntry<K, T> {
    pub(crate) fn new(key: K) -> Self {
        CacheEntry {
            key,
            value: None,
            fetched_at: None,
            status: Status::Idle,
            error: None,
            retry_count: 0,
            fetching: false,
            max_age: None,
            must_revalidate: false,
        }
    }

    /// Current value, stale or not
    pub fn data(&self) -> Option<Arc<T>> {
        self.value.clone()
    }

    /// True only while the first fetch runs; refreshes of a populated entry don't flash loading
    pub fn loading(&self) -> bool {
        self.status == Status::Loading
    }

    /// Whether the value needs revalidation at `now`, given the cache-wide `stale_time`
    pub fn is_stale(&self, now: Instant, stale_time: Duration) -> bool {
        if self.status == Status::Stale {
            return true;
        }
        match self.fetched_at {
            Some(fetched_at) => now.saturating_duration_since(fetched_at) >= self.max_age.unwrap_or(stale_time),
            None => true,
        }
    }

    /// Stored status, with aged `Ready` entries reported as [`Status::Stale`]
    pub fn effective_status(&self, now: Instant, stale_time: Duration) -> Status {
        if self.status == Status::Ready && self.is_stale(now, stale_time) {
            Status::Stale
        } else {
            self.status
        }
    }

    pub(crate) fn begin_fetch(&mut self) {
        self.fetching = true;
        if self.value.is_none() {
            self.status = Status::Loading;
        }
    }

    pub(crate) fn apply_fetch(&mut self, loaded: DataLoadResult<T>, now: Instant) {
        self.value = Some(Arc::new(loaded.data));
        self.fetched_at = Some(now);
        self.max_age = loaded.max_age;
        self.must_revalidate = loaded.must_revalidate;
        self.status = Status::Ready;
        self.error = None;
        self.retry_count = 0;
    }

    pub(crate) fn record_failure(&mut self, err: &ProviderError) {
        self.retry_count = self.retry_count.saturating_add(1);
        self.error = Some(ErrorInfo::from(err));
    }

    pub(crate) fn fail(&mut self) {
        self.status = Status::Error;
    }

    /// Optimistic local write: new value, untouched `fetched_at`.
    ///
    /// A failed entry becomes `Stale`; the old fetch error no longer describes the value.
    pub(crate) fn apply_local(&mut self, value: Arc<T>) {
        self.value = Some(value);
        match self.status {
            Status::Idle | Status::Loading => self.status = Status::Ready,
            Status::Error => {
                self.status = Status::Stale;
                self.error = None;
            }
            Status::Ready | Status::Stale => {}
        }
    }

    /// Payload pushed by the remote source, which counts as a confirmation
    pub(crate) fn apply_remote(&mut self, value: Arc<T>, now: Instant) {
        self.value = Some(value);
        self.fetched_at = Some(now);
        self.status = Status::Ready;
    }

    pub(crate) fn invalidate(&mut self) {
        self.status = if self.value.is_some() {
            Status::Stale
        } else if self.fetching {
            Status::Loading
        } else {
            Status::Idle
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn ready(now: Instant) -> CacheEntry<&'static str, u32> {
        let mut entry = CacheEntry::new("k");
        entry.apply_fetch(DataLoadResult::new(7), now);
        entry
    }

    #[test]
    fn failure_keeps_value_and_counts() {
        let now = Instant::now();
        let mut entry = ready(now);
        entry.record_failure(&ProviderError::transient("offline"));
        entry.record_failure(&ProviderError::transient("offline"));
        entry.fail();
        assert_eq!(entry.data().as_deref(), Some(&7));
        assert_eq!(entry.retry_count, 2);
        assert_eq!(entry.status, Status::Error);
        assert_eq!(entry.error.as_ref().map(|e| e.kind), Some(ErrorKind::Transient));
        assert_eq!(entry.fetched_at, Some(now));
    }

    #[test]
    fn success_resets_failures() {
        let now = Instant::now();
        let mut entry = ready(now);
        entry.record_failure(&ProviderError::auth("denied"));
        entry.apply_fetch(DataLoadResult::new(8), now);
        assert_eq!(entry.retry_count, 0);
        assert!(entry.error.is_none());
    }

    #[test]
    fn local_write_leaves_fetched_at_alone() {
        let mut entry: CacheEntry<&str, u32> = CacheEntry::new("k");
        entry.apply_local(Arc::new(3));
        assert_eq!(entry.fetched_at, None);
        assert_eq!(entry.status, Status::Ready);
        assert!(entry.is_stale(Instant::now(), Duration::from_secs(60)));
    }

    #[test]
    fn local_write_clears_failed_status() {
        let now = Instant::now();
        let mut entry = ready(now);
        entry.record_failure(&ProviderError::permanent("gone"));
        entry.fail();

        entry.apply_local(Arc::new(9));
        assert_eq!(entry.status, Status::Stale);
        assert!(entry.error.is_none());
        assert_eq!(entry.data().as_deref(), Some(&9));
        assert_eq!(entry.fetched_at, Some(now));
    }

    #[test]
    fn max_age_overrides_stale_time() {
        let now = Instant::now();
        let mut entry = CacheEntry::new("k");
        entry.apply_fetch(DataLoadResult::new(1).with_max_age(Duration::from_secs(10)), now);
        assert!(!entry.is_stale(now + Duration::from_secs(5), Duration::ZERO));
        assert!(entry.is_stale(now + Duration::from_secs(10), Duration::from_secs(3600)));
        assert_eq!(entry.effective_status(now + Duration::from_secs(11), Duration::ZERO), Status::Stale);
    }

    #[test]
    fn invalidate_marks_populated_entry_stale() {
        let now = Instant::now();
        let mut entry = ready(now);
        entry.invalidate();
        assert_eq!(entry.status, Status::Stale);
        assert!(entry.is_stale(now, Duration::from_secs(3600)));

        let mut empty: CacheEntry<&str, u32> = CacheEntry::new("k");
        empty.invalidate();
        assert_eq!(empty.status, Status::Idle);
    }
}
