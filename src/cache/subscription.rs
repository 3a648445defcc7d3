use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;
use crate::cache::{CacheEntry, CacheKey, RemoteCache, Shared, Status};
use crate::data_providers::data_provider::DataProvider;
use crate::error::{CacheError, ErrorInfo};

/// Live view of one cache key.
///
/// Every subscription of a key reads the same entry, so a value applied through any path
/// (fetch, local write, pushed payload) reaches all of them at once. Dropping the subscription
/// unregisters it; once the last one is gone the key stops polling.
pub struct Subscription<K, T, P>
where
    K: CacheKey,
    T: Send + Sync + 'static,
    P: DataProvider<K, T>,
{
    cache: RemoteCache<K, T, P>,
    key: K,
    slot: u64,
    rx: watch::Receiver<CacheEntry<K, T>>,
}

impl<K, T, P> Subscription<K, T, P>
where
    K: CacheKey,
    T: Send + Sync + 'static,
    P: DataProvider<K, T>,
{
    pub(crate) fn new(cache: RemoteCache<K, T, P>, key: K, slot: u64, rx: watch::Receiver<CacheEntry<K, T>>) -> Self {
        Subscription { cache, key, slot, rx }
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    /// Snapshot of the entry
    pub fn current(&self) -> CacheEntry<K, T> {
        self.rx.borrow().clone()
    }

    pub fn data(&self) -> Option<Arc<T>> {
        self.rx.borrow().value.clone()
    }

    pub fn loading(&self) -> bool {
        self.rx.borrow().loading()
    }

    pub fn error(&self) -> Option<ErrorInfo> {
        self.rx.borrow().error.clone()
    }

    /// Status with aged values reported as [`Status::Stale`]
    pub fn status(&self) -> Status {
        let stale_time = self.cache.options().stale_time;
        self.rx.borrow().effective_status(Instant::now(), stale_time)
    }

    /// Wait for the next change to the entry.
    ///
    /// Fails with [`CacheError::Detached`] once the entry is removed or evicted.
    pub async fn changed(&mut self) -> Result<(), CacheError> {
        self.rx.changed().await.map_err(|_| CacheError::Detached)
    }

    /// Fetch now and wait for the outcome, joining a fetch already in flight
    pub async fn refetch(&self) -> Result<(), CacheError> {
        let rx = self.cache.shared.start_fetch(&self.key).ok_or(CacheError::Disabled)?;
        Shared::<K, T, P>::wait_fetch(rx).await
    }

    pub fn cache(&self) -> &RemoteCache<K, T, P> {
        &self.cache
    }

    pub fn unsubscribe(self) {}
}

impl<K, T, P> Drop for Subscription<K, T, P>
where
    K: CacheKey,
    T: Send + Sync + 'static,
    P: DataProvider<K, T>,
{
    fn drop(&mut self) {
        self.cache.shared.release(&self.key, self.slot);
    }
}
