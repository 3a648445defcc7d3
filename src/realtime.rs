//! Push-driven invalidation.
//!
//! A [`ChangeFeed`] delivers change notifications for a [`Topic`] (typically one table or entity
//! type). [`RemoteCache::on_remote_change`] routes matching notifications into the cache, either
//! invalidating the affected key or applying the pushed payload in place.

use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

use crate::cache::{CacheKey, RemoteCache, Shared};
use crate::data_providers::data_provider::DataProvider;
use crate::error::ProviderError;
use crate::events::UpdateOrigin;
use crate::log::{log_debug, log_warn};

/// Name of a change stream, e.g. the table whose rows the cache mirrors
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Topic(String);

impl Topic {
    pub fn new(name: impl Into<String>) -> Self {
        Topic(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Topic {
    fn from(value: &str) -> Self {
        Topic::new(value)
    }
}

impl From<String> for Topic {
    fn from(value: String) -> Self {
        Topic(value)
    }
}

impl Display for Topic {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A change reported by the remote source
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent<K, T> {
    pub topic: Topic,
    pub kind: ChangeKind,
    pub key: K,
    /// New state of the record, when the feed carries it
    pub payload: Option<T>,
}

impl<K, T> ChangeEvent<K, T> {
    pub fn new(topic: impl Into<Topic>, kind: ChangeKind, key: K) -> Self {
        ChangeEvent {
            topic: topic.into(),
            kind,
            key,
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: T) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// External push-subscription API.
///
/// Dropping the returned receiver ends the subscription.
pub trait ChangeFeed<K, T> {
    fn subscribe(&self, topic: &Topic) -> Result<mpsc::Receiver<ChangeEvent<K, T>>, ProviderError>;
}

type KeyFilter<K> = Arc<dyn Fn(&K) -> bool + Send + Sync>;

/// Selects which change events a listener reacts to
#[derive(Clone)]
pub struct EventMatcher<K> {
    topic: Topic,
    filter: Option<KeyFilter<K>>,
}

impl<K> EventMatcher<K> {
    /// Every event on `topic`
    pub fn topic(topic: impl Into<Topic>) -> Self {
        EventMatcher {
            topic: topic.into(),
            filter: None,
        }
    }

    /// Only events whose key satisfies `filter`
    pub fn with_key_filter(mut self, filter: impl Fn(&K) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }

    pub fn topic_name(&self) -> &Topic {
        &self.topic
    }

    pub fn matches<T>(&self, event: &ChangeEvent<K, T>) -> bool {
        event.topic == self.topic && self.filter.as_ref().map_or(true, |filter| filter(&event.key))
    }
}

/// What a listener does with a matching event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InvalidationPolicy {
    /// Mark the key stale and refetch it
    #[default]
    Refetch,
    /// Replace the cached value with the pushed payload, if the key is cached. Events without
    /// a payload fall back to [`InvalidationPolicy::Refetch`].
    ApplyPayload,
}

/// Running change listener. Dropping it tears the subscription down.
pub struct ListenerHandle {
    task: JoinHandle<()>,
}

impl ListenerHandle {
    pub fn close(self) {}

    /// The feed closed or the cache was dropped
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl<K, T, P> RemoteCache<K, T, P>
where
    K: CacheKey,
    T: Send + Sync + 'static,
    P: DataProvider<K, T>,
{
    /// Route matching events from `feed` into this cache until the handle is dropped
    pub fn on_remote_change<F>(
        &self,
        feed: &F,
        matcher: EventMatcher<K>,
        policy: InvalidationPolicy,
    ) -> Result<ListenerHandle, ProviderError>
    where
        F: ChangeFeed<K, T> + ?Sized,
    {
        let mut events = feed.subscribe(&matcher.topic)?;
        let shared = Arc::downgrade(&self.shared);
        log_debug!(cache = %self.shared.name, topic = %matcher.topic, ?policy, "listening for remote changes");
        let task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if !matcher.matches(&event) {
                    continue;
                }
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                shared.handle_change(event, policy);
            }
        });
        Ok(ListenerHandle { task })
    }
}

impl<K, T, P> Shared<K, T, P>
where
    K: CacheKey,
    T: Send + Sync + 'static,
    P: DataProvider<K, T>,
{
    fn handle_change(self: &Arc<Self>, event: ChangeEvent<K, T>, policy: InvalidationPolicy) {
        match (policy, event.kind, event.payload) {
            (InvalidationPolicy::ApplyPayload, ChangeKind::Insert | ChangeKind::Update, Some(payload)) => {
                if self.contains(&event.key) {
                    self.apply_value(event.key, Arc::new(payload), UpdateOrigin::Remote);
                }
            }
            _ => self.invalidate(&event.key),
        }
    }
}

/// In-process [`ChangeFeed`], for wiring tests or bridging a transport that has no topics.
pub struct LocalChangeFeed<K, T> {
    subscribers: Mutex<HashMap<Topic, Vec<mpsc::Sender<ChangeEvent<K, T>>>>>,
    buffer: usize,
}

impl<K, T> LocalChangeFeed<K, T>
where
    K: Clone,
    T: Clone,
{
    /// Each subscriber buffers up to `buffer` undelivered events; overflow is dropped
    pub fn new(buffer: usize) -> Self {
        LocalChangeFeed {
            subscribers: Mutex::new(HashMap::new()),
            buffer: buffer.max(1),
        }
    }

    /// Deliver `event` to the subscribers of its topic. Returns how many received it.
    pub fn publish(&self, event: ChangeEvent<K, T>) -> usize {
        let mut subscribers = self.subscribers.lock();
        let Some(senders) = subscribers.get_mut(&event.topic) else {
            return 0;
        };
        let mut delivered = 0;
        senders.retain(|sender| match sender.try_send(event.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                log_warn!(topic = %event.topic, "change subscriber is full; dropping event");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
        delivered
    }

    /// Open subscriptions for `topic`
    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.subscribers
            .lock()
            .get(topic)
            .map_or(0, |senders| senders.iter().filter(|sender| !sender.is_closed()).count())
    }
}

impl<K, T> ChangeFeed<K, T> for LocalChangeFeed<K, T>
where
    K: Clone,
    T: Clone,
{
    fn subscribe(&self, topic: &Topic) -> Result<mpsc::Receiver<ChangeEvent<K, T>>, ProviderError> {
        let (tx, rx) = mpsc::channel(self.buffer);
        self.subscribers.lock().entry(topic.clone()).or_default().push(tx);
        Ok(rx)
    }
}
