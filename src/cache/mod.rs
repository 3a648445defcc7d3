//! Keyed stale-while-revalidate cache.
//!
//! A [`RemoteCache`] owns one [`DataProvider`] and serves every key of one namespace. Each key
//! gets a slot holding a `watch` channel; all subscribers of the key read from that channel, so
//! an update is visible to every one of them as soon as it is applied.
//!
//! Fetches run on spawned tasks. At most one fetch per key is in flight; later requests join it.
//! Every fetch, local write and pushed payload draws a number from one monotonically increasing
//! sequence, and a fetch response older than the last applied update is discarded.

mod entry;
mod lru;
mod subscription;

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::data_providers::data_provider::{DataLoadResult, DataProvider};
use crate::error::{CacheError, ErrorInfo, ProviderError};
use crate::events::{CacheEvent, EventBus, UpdateOrigin};
use crate::log::{log_debug, log_trace, log_warn};
use crate::options::CacheOptions;
use crate::preference::{PreferenceMirror, WriteJob};
use lru::LruMap;

pub use entry::{CacheEntry, Status};
pub use subscription::Subscription;

const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Bounds required of cache keys.
pub trait CacheKey: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

impl<K: Clone + Eq + Hash + Debug + Send + Sync + 'static> CacheKey for K {}

pub(crate) struct Slot<K, T> {
    /// Distinguishes this slot from earlier ones for the same key
    id: u64,
    tx: watch::Sender<CacheEntry<K, T>>,
    subscribers: usize,
    /// Invalidated while a fetch was in flight; fetch again once it completes
    rerun: bool,
    applied_seq: u64,
    poller: Option<JoinHandle<()>>,
}

impl<K, T> Slot<K, T> {
    fn new(id: u64, entry: CacheEntry<K, T>) -> Self {
        let (tx, _) = watch::channel(entry);
        Slot {
            id,
            tx,
            subscribers: 0,
            rerun: false,
            applied_seq: 0,
            poller: None,
        }
    }

    fn is_pinned(&self) -> bool {
        self.subscribers > 0 || self.tx.borrow().fetching
    }

    fn stop_polling(&mut self) {
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
    }
}

impl<K, T> Drop for Slot<K, T> {
    fn drop(&mut self) {
        self.stop_polling();
    }
}

pub(crate) struct Shared<K, T, P> {
    pub(crate) name: String,
    pub(crate) provider: P,
    options: ArcSwap<CacheOptions>,
    slots: Mutex<LruMap<K, Slot<K, T>>>,
    seq: AtomicU64,
    slot_ids: AtomicU64,
    pub(crate) events: EventBus<K>,
    pub(crate) mirror: Option<Arc<dyn PreferenceMirror<K, T>>>,
    pub(crate) writer: OnceLock<mpsc::UnboundedSender<WriteJob<K, T>>>,
}

/// Stale-while-revalidate cache for one namespace of remotely sourced values.
///
/// Cloning is cheap and every clone refers to the same entries. Operations that start background
/// work (`subscribe`, `refetch`, `load`, `set_preference`, ...) must run inside a Tokio runtime.
pub struct RemoteCache<K, T, P> {
    pub(crate) shared: Arc<Shared<K, T, P>>,
}

impl<K, T, P> Clone for RemoteCache<K, T, P> {
    fn clone(&self) -> Self {
        RemoteCache {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Builder for [`RemoteCache`]
pub struct RemoteCacheBuilder<K, T, P> {
    name: String,
    provider: P,
    options: CacheOptions,
    mirror: Option<Arc<dyn PreferenceMirror<K, T>>>,
    event_capacity: usize,
}

impl<K, T, P> RemoteCacheBuilder<K, T, P>
where
    K: CacheKey,
    T: Send + Sync + 'static,
    P: DataProvider<K, T>,
{
    /// Name used in log output
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn options(mut self, options: CacheOptions) -> Self {
        self.options = options;
        self
    }

    /// Local persistent copy used to seed new entries and to store optimistic writes
    pub fn mirror(mut self, mirror: impl PreferenceMirror<K, T> + 'static) -> Self {
        self.mirror = Some(Arc::new(mirror));
        self
    }

    /// Buffer size of the event bus; lagging receivers lose the oldest events
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn build(self) -> RemoteCache<K, T, P> {
        RemoteCache {
            shared: Arc::new(Shared {
                name: self.name,
                provider: self.provider,
                options: ArcSwap::from_pointee(self.options),
                slots: Mutex::new(LruMap::new()),
                seq: AtomicU64::new(0),
                slot_ids: AtomicU64::new(0),
                events: EventBus::new(self.event_capacity),
                mirror: self.mirror,
                writer: OnceLock::new(),
            }),
        }
    }
}

impl<K, T, P> RemoteCache<K, T, P>
where
    K: CacheKey,
    T: Send + Sync + 'static,
    P: DataProvider<K, T>,
{
    pub fn new(provider: P, options: CacheOptions) -> Self {
        Self::builder(provider).options(options).build()
    }

    pub fn builder(provider: P) -> RemoteCacheBuilder<K, T, P> {
        RemoteCacheBuilder {
            name: "remote_cache".to_string(),
            provider,
            options: CacheOptions::default(),
            mirror: None,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn provider(&self) -> &P {
        &self.shared.provider
    }

    /// Options currently in effect
    pub fn options(&self) -> Arc<CacheOptions> {
        self.shared.options.load_full()
    }

    /// Replace the options. Running pollers keep their interval; new subscriptions see the change.
    pub fn set_options(&self, options: CacheOptions) {
        self.shared.options.store(Arc::new(options));
    }

    /// Register interest in `key`.
    ///
    /// Starts a background fetch when the entry is empty or stale, and starts polling on the
    /// first subscription if `refetch_interval` is set. Dropping the returned handle unsubscribes.
    pub fn subscribe(&self, key: K) -> Subscription<K, T, P> {
        let (slot, rx) = self.shared.attach(&key);
        Subscription::new(self.clone(), key, slot, rx)
    }

    /// Fetch `key` now, ignoring freshness, and wait for the outcome.
    ///
    /// Joins the in-flight fetch if there is one. The previous value stays visible on failure.
    pub async fn refetch(&self, key: &K) -> Result<(), CacheError> {
        let rx = self.shared.start_fetch(key).ok_or(CacheError::Disabled)?;
        Shared::<K, T, P>::wait_fetch(rx).await
    }

    /// Usable data for `key`.
    ///
    /// Fresh values return immediately. Stale values also return immediately and are revalidated
    /// in the background, unless the provider marked them `must_revalidate`, in which case this
    /// waits for the revalidation just like a missing value does.
    pub async fn load(&self, key: &K) -> Result<Arc<T>, CacheError> {
        let options = self.shared.options.load_full();
        let now = Instant::now();
        let cached = self.shared.inspect(key, |entry| {
            (entry.value.clone(), entry.is_stale(now, options.stale_time), entry.must_revalidate)
        });
        match cached {
            (Some(value), false, _) => return Ok(value),
            (Some(value), true, false) => {
                self.shared.start_fetch(key);
                return Ok(value);
            }
            _ => {}
        }
        self.refetch(key).await?;
        self.get(key).ok_or(CacheError::Detached)
    }

    /// Current value of `key`, stale or not, without fetching
    pub fn get(&self, key: &K) -> Option<Arc<T>> {
        let mut slots = self.shared.slots.lock();
        let slot = slots.touch(key)?;
        let value = slot.tx.borrow().value.clone();
        value
    }

    /// Snapshot of the entry for `key`, without fetching
    pub fn entry(&self, key: &K) -> Option<CacheEntry<K, T>> {
        let slots = self.shared.slots.lock();
        slots.peek(key).map(|slot| slot.tx.borrow().clone())
    }

    /// Overwrite the cached value locally. No remote write happens and `fetched_at` is untouched.
    pub fn set(&self, key: K, value: T) -> Arc<T> {
        let value = Arc::new(value);
        self.shared.apply_value(key, Arc::clone(&value), UpdateOrigin::Local);
        value
    }

    /// Mark `key` stale. Subscribed keys are refetched right away, others on their next read.
    pub fn invalidate(&self, key: &K) {
        self.shared.invalidate(key);
    }

    /// Drop the entry for `key`. Subscribers keep their last snapshot but see no further updates.
    pub fn remove(&self, key: &K) -> bool {
        let removed = self.shared.slots.lock().remove(key).is_some();
        if removed {
            self.shared.events.publish(CacheEvent::Removed { key: key.clone() });
        }
        removed
    }

    pub fn contains(&self, key: &K) -> bool {
        self.shared.slots.lock().peek(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.shared.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys from least to most recently used
    pub fn keys(&self) -> Vec<K> {
        self.shared.slots.lock().keys().cloned().collect()
    }

    /// Live subscriptions for `key`
    pub fn subscriber_count(&self, key: &K) -> usize {
        self.shared.slots.lock().peek(key).map_or(0, |slot| slot.subscribers)
    }

    /// Receiver for entry updates, failures, invalidations and evictions
    pub fn events(&self) -> broadcast::Receiver<CacheEvent<K>> {
        self.shared.events.subscribe()
    }
}

impl<K, T, P> Shared<K, T, P>
where
    K: CacheKey,
    T: Send + Sync + 'static,
    P: DataProvider<K, T>,
{
    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Slot for `key`, created (and seeded from the mirror) if missing
    fn slot_for<'a>(&self, slots: &'a mut LruMap<K, Slot<K, T>>, key: &K) -> &'a mut Slot<K, T> {
        slots.get_or_insert_with(key.clone(), |key| {
            let mut entry = CacheEntry::new(key.clone());
            if let Some(seed) = self.mirror.as_ref().and_then(|mirror| mirror.load(key)) {
                log_debug!(cache = %self.name, key = ?key, "seeded entry from mirror");
                entry.value = Some(Arc::new(seed));
            }
            Slot::new(self.slot_ids.fetch_add(1, Ordering::Relaxed), entry)
        })
    }

    /// Trim to `max_entries`, never evicting `keep`, the key the caller is working on
    fn evict(&self, slots: &mut LruMap<K, Slot<K, T>>, keep: &K) -> Vec<K> {
        let capacity = self.options.load().max_entries;
        slots
            .evict_excess(capacity, |key, slot| key == keep || slot.is_pinned())
            .into_iter()
            .map(|(key, _)| {
                log_trace!(cache = %self.name, key = ?key, "evicted");
                key
            })
            .collect()
    }

    fn publish_evicted(&self, evicted: Vec<K>) {
        for key in evicted {
            self.events.publish(CacheEvent::Evicted { key });
        }
    }

    fn inspect<R>(&self, key: &K, f: impl FnOnce(&CacheEntry<K, T>) -> R) -> R {
        let (result, evicted) = {
            let mut slots = self.slots.lock();
            let slot = self.slot_for(&mut slots, key);
            let result = f(&slot.tx.borrow());
            (result, self.evict(&mut slots, key))
        };
        self.publish_evicted(evicted);
        result
    }

    pub(crate) fn contains(&self, key: &K) -> bool {
        self.slots.lock().peek(key).is_some()
    }

    /// Register a subscriber; returns the id of the slot it is attached to
    fn attach(self: &Arc<Self>, key: &K) -> (u64, watch::Receiver<CacheEntry<K, T>>) {
        let options = self.options.load_full();
        let now = Instant::now();
        let (id, rx, needs_fetch, evicted) = {
            let mut slots = self.slots.lock();
            let slot = self.slot_for(&mut slots, key);
            slot.subscribers += 1;
            if let (true, true, Some(every)) = (options.enabled, slot.poller.is_none(), options.polling()) {
                slot.poller = Some(self.spawn_poller(key.clone(), every));
            }
            let rx = slot.tx.subscribe();
            let needs_fetch = {
                let entry = slot.tx.borrow();
                options.enabled && !entry.fetching && entry.is_stale(now, options.stale_time)
            };
            (slot.id, rx, needs_fetch, self.evict(&mut slots, key))
        };
        self.publish_evicted(evicted);
        if needs_fetch {
            self.start_fetch(key);
        }
        (id, rx)
    }

    /// Drop one subscriber of slot `id`. A slot that was removed and recreated since is left alone.
    pub(crate) fn release(&self, key: &K, id: u64) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.peek_mut(key).filter(|slot| slot.id == id) {
            slot.subscribers = slot.subscribers.saturating_sub(1);
            if slot.subscribers == 0 {
                slot.stop_polling();
            }
        }
    }

    fn spawn_poller(self: &Arc<Self>, key: K, every: Duration) -> JoinHandle<()> {
        let shared = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(shared) = Weak::upgrade(&shared) else {
                    break;
                };
                log_trace!(cache = %shared.name, key = ?key, "poll");
                shared.start_fetch(&key);
            }
        })
    }

    /// Start a fetch for `key`, or join the one in flight.
    ///
    /// Returns a receiver to await completion on, or `None` when fetching is disabled.
    pub(crate) fn start_fetch(self: &Arc<Self>, key: &K) -> Option<watch::Receiver<CacheEntry<K, T>>> {
        if !self.options.load().enabled {
            return None;
        }
        let (rx, started, evicted) = {
            let mut slots = self.slots.lock();
            let slot = self.slot_for(&mut slots, key);
            let rx = slot.tx.subscribe();
            let in_flight = slot.tx.borrow().fetching;
            let started = (!in_flight).then(|| {
                slot.tx.send_modify(CacheEntry::begin_fetch);
                (slot.id, self.next_seq())
            });
            (rx, started, self.evict(&mut slots, key))
        };
        self.publish_evicted(evicted);
        if let Some((slot, seq)) = started {
            tokio::spawn(Arc::clone(self).run_fetch(key.clone(), slot, seq));
        } else {
            log_debug!(cache = %self.name, key = ?key, "joined in-flight fetch");
        }
        Some(rx)
    }

    pub(crate) async fn wait_fetch(mut rx: watch::Receiver<CacheEntry<K, T>>) -> Result<(), CacheError> {
        let entry = rx
            .wait_for(|entry| !entry.fetching)
            .await
            .map_err(|_| CacheError::Detached)?;
        match (entry.status, &entry.error) {
            (Status::Error, Some(error)) => Err(CacheError::Provider(error.clone())),
            _ => Ok(()),
        }
    }

    /// Fetch for slot `id` of `key`; the outcome is dropped if that slot is gone
    async fn run_fetch(self: Arc<Self>, key: K, id: u64, mut seq: u64) {
        loop {
            let options = self.options.load_full();
            log_debug!(cache = %self.name, key = ?key, seq, "fetch started");
            let outcome = self.fetch_with_retry(&key, id, &options).await;
            let failure = outcome.as_ref().err().map(ErrorInfo::from);

            let (applied, rerun) = {
                let mut slots = self.slots.lock();
                let Some(slot) = slots.peek_mut(&key).filter(|slot| slot.id == id) else {
                    log_debug!(cache = %self.name, key = ?key, "entry detached before fetch completed");
                    return;
                };
                let now = Instant::now();
                let rerun = std::mem::take(&mut slot.rerun);
                let applied = outcome.is_ok() && seq > slot.applied_seq;
                if applied {
                    slot.applied_seq = seq;
                } else if outcome.is_ok() {
                    log_debug!(
                        cache = %self.name, key = ?key, seq, applied_seq = slot.applied_seq,
                        "discarding out-of-order fetch response"
                    );
                }
                slot.tx.send_modify(|entry| {
                    match outcome {
                        Ok(loaded) if applied => entry.apply_fetch(loaded, now),
                        Ok(_) => {
                            entry.retry_count = 0;
                            entry.error = None;
                        }
                        Err(_) => entry.fail(),
                    }
                    if rerun {
                        entry.begin_fetch();
                    } else {
                        entry.fetching = false;
                    }
                });
                if rerun {
                    seq = self.next_seq();
                }
                (applied, rerun)
            };

            if applied {
                self.events.publish(CacheEvent::Updated {
                    key: key.clone(),
                    origin: UpdateOrigin::Fetch,
                });
            }
            if let Some(error) = failure {
                self.events.publish(CacheEvent::FetchFailed { key: key.clone(), error });
            }
            if !rerun {
                break;
            }
        }
    }

    async fn fetch_with_retry(&self, key: &K, id: u64, options: &CacheOptions) -> Result<DataLoadResult<T>, ProviderError> {
        let mut failures = 0u32;
        loop {
            let attempt = self.provider.load_data(key);
            let result = match options.timeout() {
                Some(limit) => tokio::time::timeout(limit, attempt)
                    .await
                    .unwrap_or_else(|_| Err(ProviderError::timeout(limit))),
                None => attempt.await,
            };
            let err = match result {
                Ok(loaded) => return Ok(loaded),
                Err(err) => err,
            };
            failures += 1;
            self.record_failure(key, id, &err);
            if !err.is_retryable() || !options.should_retry(failures) {
                log_warn!(cache = %self.name, key = ?key, attempts = failures, error = %err, "fetch failed");
                return Err(err);
            }
            let delay = options.retry_delay_for(failures);
            log_debug!(cache = %self.name, key = ?key, attempt = failures, ?delay, error = %err, "retrying fetch");
            tokio::time::sleep(delay).await;
        }
    }

    fn record_failure(&self, key: &K, id: u64, err: &ProviderError) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.peek_mut(key).filter(|slot| slot.id == id) {
            slot.tx.send_modify(|entry| entry.record_failure(err));
        }
    }

    /// Apply a value that did not come from a fetch
    pub(crate) fn apply_value(&self, key: K, value: Arc<T>, origin: UpdateOrigin) {
        let seq = self.next_seq();
        let now = Instant::now();
        let evicted = {
            let mut slots = self.slots.lock();
            let slot = self.slot_for(&mut slots, &key);
            slot.applied_seq = slot.applied_seq.max(seq);
            slot.tx.send_modify(|entry| match origin {
                UpdateOrigin::Remote => entry.apply_remote(value, now),
                UpdateOrigin::Local | UpdateOrigin::Fetch => entry.apply_local(value),
            });
            self.evict(&mut slots, &key)
        };
        self.events.publish(CacheEvent::Updated { key, origin });
        self.publish_evicted(evicted);
    }

    pub(crate) fn invalidate(self: &Arc<Self>, key: &K) {
        let refetch = {
            let mut slots = self.slots.lock();
            let Some(slot) = slots.peek_mut(key) else {
                return;
            };
            let fetching = slot.tx.borrow().fetching;
            slot.tx.send_modify(CacheEntry::invalidate);
            if fetching {
                slot.rerun = true;
                false
            } else {
                slot.subscribers > 0
            }
        };
        log_debug!(cache = %self.name, key = ?key, refetch, "invalidated");
        self.events.publish(CacheEvent::Invalidated { key: key.clone() });
        if refetch {
            self.start_fetch(key);
        }
    }
}
