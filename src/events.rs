use tokio::sync::broadcast;
use crate::error::ErrorInfo;

/// Where an entry update came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOrigin {
    /// Successful fetch from the data provider
    Fetch,
    /// Optimistic local write
    Local,
    /// Payload pushed by a change feed
    Remote,
}

/// Notification published on a cache's event bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent<K> {
    Updated { key: K, origin: UpdateOrigin },
    /// Fetch failed after exhausting retries
    FetchFailed { key: K, error: ErrorInfo },
    /// Background write of an optimistic update was rejected. The local value was kept.
    WriteFailed { key: K, error: ErrorInfo },
    Invalidated { key: K },
    Removed { key: K },
    Evicted { key: K },
}

impl<K> CacheEvent<K> {
    pub fn key(&self) -> &K {
        match self {
            CacheEvent::Updated { key, .. }
            | CacheEvent::FetchFailed { key, .. }
            | CacheEvent::WriteFailed { key, .. }
            | CacheEvent::Invalidated { key }
            | CacheEvent::Removed { key }
            | CacheEvent::Evicted { key } => key,
        }
    }
}

/// Typed publish/subscribe channel for [`CacheEvent`]s.
///
/// Slow receivers lag and lose old events rather than blocking publishers.
pub(crate) struct EventBus<K> {
    sender: broadcast::Sender<CacheEvent<K>>,
}

impl<K: Clone> EventBus<K> {
    pub(crate) fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        EventBus { sender }
    }

    pub(crate) fn publish(&self, event: CacheEvent<K>) {
        // no receivers is fine
        let _ = self.sender.send(event);
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<CacheEvent<K>> {
        self.sender.subscribe()
    }
}
