//! Optimistic preference updates.
//!
//! [`RemoteCache::set_preference`] applies the new value locally, stores it in the mirror and
//! queues the remote write. The write runs later on a per-cache writer task, in submission order.
//! A rejected write is logged and published as [`CacheEvent::WriteFailed`]; the local value is
//! kept, so local and remote state may disagree until the next successful fetch.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Weak};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::cache::{CacheKey, RemoteCache, Shared};
use crate::data_providers::data_provider::DataWriter;
use crate::error::{ErrorInfo, MirrorError};
use crate::events::{CacheEvent, UpdateOrigin};
use crate::log::{log_debug, log_warn};

/// Local persistent copy of preference values, read when an entry is first created.
pub trait PreferenceMirror<K, T>: Send + Sync {
    fn load(&self, key: &K) -> Option<T>;

    fn store(&self, key: &K, value: &T) -> Result<(), MirrorError>;
}

pub(crate) enum WriteJob<K, T> {
    Write { key: K, value: Arc<T> },
    Flush(oneshot::Sender<()>),
}

impl<K, T, P> RemoteCache<K, T, P>
where
    K: CacheKey,
    T: Send + Sync + 'static,
    P: DataWriter<K, T>,
{
    /// Set `key` to `value` immediately and write it to the remote source in the background.
    ///
    /// Never fails and never reverts: write errors are only logged and published on the event bus.
    pub fn set_preference(&self, key: K, value: T) {
        let value = Arc::new(value);
        self.shared.apply_value(key.clone(), Arc::clone(&value), UpdateOrigin::Local);

        if let Some(mirror) = &self.shared.mirror {
            if let Err(err) = mirror.store(&key, &value) {
                log_warn!(cache = %self.shared.name, key = ?key, error = %err, "failed to mirror preference");
            }
        }

        if self.writer().send(WriteJob::Write { key, value }).is_err() {
            log_warn!(cache = %self.shared.name, "write queue closed; dropping remote write");
        }
    }

    /// Wait until every write queued so far has been attempted
    pub async fn flush_writes(&self) {
        let Some(writer) = self.shared.writer.get() else {
            return;
        };
        let (done, wait) = oneshot::channel();
        if writer.send(WriteJob::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }

    fn writer(&self) -> &mpsc::UnboundedSender<WriteJob<K, T>> {
        self.shared.writer.get_or_init(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(drain_writes(Arc::downgrade(&self.shared), rx));
            tx
        })
    }
}

async fn drain_writes<K, T, P>(shared: Weak<Shared<K, T, P>>, mut jobs: mpsc::UnboundedReceiver<WriteJob<K, T>>)
where
    K: CacheKey,
    T: Send + Sync + 'static,
    P: DataWriter<K, T>,
{
    while let Some(job) = jobs.recv().await {
        let (key, value) = match job {
            WriteJob::Flush(done) => {
                let _ = done.send(());
                continue;
            }
            WriteJob::Write { key, value } => (key, value),
        };
        let Some(shared) = shared.upgrade() else {
            break;
        };
        match shared.provider.write_data(&key, &value).await {
            Ok(()) => log_debug!(cache = %shared.name, key = ?key, "remote write confirmed"),
            Err(err) => {
                log_warn!(cache = %shared.name, key = ?key, error = %err, "remote write failed; keeping local value");
                shared.events.publish(CacheEvent::WriteFailed {
                    key,
                    error: ErrorInfo::from(&err),
                });
            }
        }
    }
}

/// In-memory mirror, mostly useful in tests and short-lived tools.
pub struct MemoryMirror<K, T> {
    values: Mutex<HashMap<K, T>>,
}

impl<K, T> MemoryMirror<K, T> {
    pub fn new() -> Self {
        MemoryMirror {
            values: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, T> Default for MemoryMirror<K, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash, T> FromIterator<(K, T)> for MemoryMirror<K, T> {
    fn from_iter<I: IntoIterator<Item = (K, T)>>(iter: I) -> Self {
        MemoryMirror {
            values: Mutex::new(iter.into_iter().collect()),
        }
    }
}

impl<K, T> PreferenceMirror<K, T> for MemoryMirror<K, T>
where
    K: Eq + Hash + Clone + Send + Sync,
    T: Clone + Send + Sync,
{
    fn load(&self, key: &K) -> Option<T> {
        self.values.lock().get(key).cloned()
    }

    fn store(&self, key: &K, value: &T) -> Result<(), MirrorError> {
        self.values.lock().insert(key.clone(), value.clone());
        Ok(())
    }
}

impl<K, T, M> PreferenceMirror<K, T> for Arc<M>
where
    M: PreferenceMirror<K, T> + ?Sized,
{
    fn load(&self, key: &K) -> Option<T> {
        (**self).load(key)
    }

    fn store(&self, key: &K, value: &T) -> Result<(), MirrorError> {
        (**self).store(key, value)
    }
}

#[cfg(feature = "json")]
pub use json_mirror::JsonFileMirror;

#[cfg(feature = "json")]
mod json_mirror {
    use std::fmt::Display;
    use std::path::{Path, PathBuf};
    use parking_lot::Mutex;
    use serde::de::DeserializeOwned;
    use serde::Serialize;
    use serde_json::{Map, Value};
    use crate::error::MirrorError;
    use super::PreferenceMirror;

    /// Mirror persisted as a single JSON object, keyed by the `Display` form of the cache key.
    ///
    /// The whole file is rewritten on every store.
    pub struct JsonFileMirror {
        path: PathBuf,
        values: Mutex<Map<String, Value>>,
    }

    impl JsonFileMirror {
        /// Open the mirror at `path`; a missing file starts out empty
        pub fn open(path: impl AsRef<Path>) -> Result<Self, MirrorError> {
            let path = path.as_ref().to_path_buf();
            let values = match std::fs::read(&path) {
                Ok(bytes) => serde_json::from_slice(&bytes)?,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Map::new(),
                Err(err) => return Err(err.into()),
            };
            Ok(JsonFileMirror {
                path,
                values: Mutex::new(values),
            })
        }

        pub fn path(&self) -> &Path {
            &self.path
        }
    }

    impl<K, T> PreferenceMirror<K, T> for JsonFileMirror
    where
        K: Display,
        T: Serialize + DeserializeOwned,
    {
        fn load(&self, key: &K) -> Option<T> {
            let values = self.values.lock();
            let value = values.get(&key.to_string())?;
            serde_json::from_value(value.clone()).ok()
        }

        fn store(&self, key: &K, value: &T) -> Result<(), MirrorError> {
            let value = serde_json::to_value(value)?;
            let mut values = self.values.lock();
            values.insert(key.to_string(), value);
            std::fs::write(&self.path, serde_json::to_vec_pretty(&*values)?)?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_mirror_round_trips() {
        let mirror: MemoryMirror<String, bool> = [("pref:a".to_string(), true)].into_iter().collect();
        assert_eq!(mirror.load(&"pref:a".to_string()), Some(true));
        assert_eq!(mirror.load(&"pref:b".to_string()), None);
        mirror.store(&"pref:b".to_string(), &false).unwrap();
        assert_eq!(mirror.load(&"pref:b".to_string()), Some(false));
    }

    #[cfg(feature = "json")]
    #[test]
    fn json_mirror_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prefs.json");

        let mirror = JsonFileMirror::open(&path).unwrap();
        PreferenceMirror::<&str, u32>::store(&mirror, &"volume", &7).unwrap();
        drop(mirror);

        let reopened = JsonFileMirror::open(&path).unwrap();
        assert_eq!(PreferenceMirror::<&str, u32>::load(&reopened, &"volume"), Some(7));
        assert_eq!(PreferenceMirror::<&str, u32>::load(&reopened, &"missing"), None);
    }
}
