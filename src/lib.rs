#![cfg_attr(docsrs, feature(doc_auto_cfg))]
//! Keyed stale-while-revalidate cache for remotely sourced values.
//!
//! One [`RemoteCache`] serves one namespace of keys backed by a
//! [`DataProvider`](data_providers::data_provider::DataProvider). It hands out the last
//! known-good value immediately, refreshes in the background (on demand, on a polling interval
//! or when a change feed reports an update), retries transient failures and keeps serving the
//! old value when a refresh fails. Preference-style values can be written optimistically with
//! [`RemoteCache::set_preference`].
//!
//! ```no_run
//! # use remote_cache::prelude::*;
//! # struct Prefs;
//! # impl DataProvider<String, bool> for Prefs {
//! #     async fn load_data(&self, _: &String) -> Result<DataLoadResult<bool>, ProviderError> { Ok(true.into()) }
//! # }
//! # async fn demo() -> Result<(), CacheError> {
//! let cache = RemoteCache::new(Prefs, CacheOptions::default());
//! let controls = cache.subscribe("pref:showControls".to_string());
//! cache.refetch(controls.key()).await?;
//! assert_eq!(controls.data().as_deref(), Some(&true));
//! # Ok(())
//! # }
//! ```

mod log;

/// The cache itself, its entries and subscriptions
pub mod cache;
/// Data providers for RemoteCache instance.
/// Public traits are included to allow easy use of custom implementations.
pub mod data_providers;
pub mod error;
/// Typed notifications about cache activity
pub mod events;
pub mod options;
/// Optimistic writes and local mirrors
pub mod preference;
/// Change feeds and push-driven invalidation
pub mod realtime;

pub use cache::{CacheEntry, RemoteCache, Status, Subscription};
pub use error::{CacheError, ErrorKind, ProviderError};
pub use options::{Backoff, CacheOptions};

/// Everything needed to define a provider and use a cache
pub mod prelude {
    pub use crate::cache::{CacheEntry, RemoteCache, Status, Subscription};
    pub use crate::data_providers::data_provider::{DataLoadResult, DataProvider, DataWriter};
    pub use crate::error::{CacheError, ErrorInfo, ErrorKind, ProviderError};
    pub use crate::events::{CacheEvent, UpdateOrigin};
    pub use crate::options::{Backoff, CacheOptions};
    pub use crate::preference::{MemoryMirror, PreferenceMirror};
    pub use crate::realtime::{ChangeEvent, ChangeFeed, ChangeKind, EventMatcher, InvalidationPolicy, Topic};
}
