use std::future::Future;
use std::time::Duration;
use crate::error::ProviderError;

/// Result of successful data load
/// # What if I don't need per-response freshness?
/// Leave `max_age` as `None`; the cache then falls back to its configured `stale_time`.
#[derive(Debug)]
pub struct DataLoadResult<T> {
    /// Data in desired format
    pub data: T,
    /// If true, once the data becomes stale, it can't be used until revalidated successfully.
    pub must_revalidate: bool,
    /// How long `data` stays fresh, overriding the cache-wide `stale_time`
    pub max_age: Option<Duration>,
}

impl<T> DataLoadResult<T> {
    /// Wrap data without any freshness hints
    pub fn new(data: T) -> Self {
        DataLoadResult {
            data,
            must_revalidate: false,
            max_age: None,
        }
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    pub fn with_must_revalidate(mut self, must_revalidate: bool) -> Self {
        self.must_revalidate = must_revalidate;
        self
    }
}

impl<T> From<T> for DataLoadResult<T> {
    fn from(data: T) -> Self {
        DataLoadResult::new(data)
    }
}

/// Remote data provider trait.
/// Data provider loads the value stored under a key from an external source and returns [`DataLoadResult`]
/// # Errors
/// Implementations classify failures with [`ErrorKind`](crate::error::ErrorKind); only transient
/// failures are retried by the cache.
pub trait DataProvider<K, T>: Send + Sync + 'static {
    /// Try to load data for `key`
    fn load_data(&self, key: &K) -> impl Future<Output = Result<DataLoadResult<T>, ProviderError>> + Send;
}

/// Remote write side, used by optimistic preference updates.
pub trait DataWriter<K, T>: DataProvider<K, T> {
    /// Persist `value` under `key`
    fn write_data(&self, key: &K, value: &T) -> impl Future<Output = Result<(), ProviderError>> + Send;
}
