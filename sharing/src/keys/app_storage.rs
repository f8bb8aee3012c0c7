//! User-defaults-style key-value store with JSON values
//!
//! A [`KeyValueStore`] maps names to `serde_json::Value`s, optionally
//! mirrored to a JSON file on every write. Per-name observers are called
//! synchronously after every change, whoever made it.

use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

use crate::continuation::{LoadContinuation, SaveContinuation};
use crate::defaults;
use crate::key::{LoadContext, SaveContext, SharedKey, SharedReaderKey, SharedValue};
use crate::subscriber::SharedSubscriber;
use crate::subscription::SharedSubscription;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("cannot access store file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("store file {path} is not a JSON object: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("cannot encode store: {0}")]
    Encode(#[from] serde_json::Error),
}

type Observer = Arc<dyn Fn() + Send + Sync>;

struct StoreInner {
    values: Mutex<BTreeMap<String, serde_json::Value>>,
    observers: Mutex<HashMap<String, Vec<(u64, Observer)>>>,
    next_observer: AtomicU64,
    path: Option<PathBuf>,
}

/// Shared key-value store
///
/// Clones share the same store.
#[derive(Clone)]
pub struct KeyValueStore {
    inner: Arc<StoreInner>,
}

impl KeyValueStore {
    /// Store that lives only in memory
    #[must_use]
    pub fn in_memory() -> Self {
        Self::with_values(BTreeMap::new(), None)
    }

    /// Store mirrored to the JSON file at `path`
    ///
    /// A missing file is an empty store; it is created on the first write.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or is not a
    /// JSON object.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let values = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| StoreError::Malformed {
                path: path.clone(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        debug!(path = %path.display(), "opened key-value store");
        Ok(Self::with_values(values, Some(path)))
    }

    fn with_values(values: BTreeMap<String, serde_json::Value>, path: Option<PathBuf>) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                values: Mutex::new(values),
                observers: Mutex::new(HashMap::new()),
                next_observer: AtomicU64::new(1),
                path,
            }),
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<serde_json::Value> {
        self.inner.values.lock().get(name).cloned()
    }

    /// Set `name` and notify its observers
    ///
    /// # Errors
    ///
    /// Returns an error if the backing file cannot be written. The in-memory
    /// value is updated regardless.
    pub fn set(&self, name: &str, value: serde_json::Value) -> Result<(), StoreError> {
        let persisted = {
            let mut values = self.inner.values.lock();
            values.insert(name.to_string(), value);
            self.persist(&values)
        };
        self.notify(name);
        persisted
    }

    /// Remove `name` and notify its observers
    ///
    /// # Errors
    ///
    /// Returns an error if the backing file cannot be written.
    pub fn remove(&self, name: &str) -> Result<(), StoreError> {
        let persisted = {
            let mut values = self.inner.values.lock();
            if values.remove(name).is_none() {
                return Ok(());
            }
            self.persist(&values)
        };
        self.notify(name);
        persisted
    }

    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.inner.values.lock().keys().cloned().collect()
    }

    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    /// Call `observer` after every change to `name`
    pub fn observe(&self, name: &str, observer: impl Fn() + Send + Sync + 'static) -> SharedSubscription {
        let id = self.inner.next_observer.fetch_add(1, Ordering::Relaxed);
        self.inner
            .observers
            .lock()
            .entry(name.to_string())
            .or_default()
            .push((id, Arc::new(observer)));
        let inner: Weak<StoreInner> = Arc::downgrade(&self.inner);
        let name = name.to_string();
        SharedSubscription::new(move || {
            if let Some(inner) = inner.upgrade() {
                if let Some(entries) = inner.observers.lock().get_mut(&name) {
                    entries.retain(|(entry_id, _)| *entry_id != id);
                }
            }
        })
    }

    fn downgrade(&self) -> Weak<StoreInner> {
        Arc::downgrade(&self.inner)
    }

    fn upgrade(inner: &Weak<StoreInner>) -> Option<Self> {
        inner.upgrade().map(|inner| Self { inner })
    }

    // Called with the values lock held so concurrent writers hit the file in order
    fn persist(&self, values: &BTreeMap<String, serde_json::Value>) -> Result<(), StoreError> {
        let Some(path) = &self.inner.path else {
            return Ok(());
        };
        let bytes = serde_json::to_vec_pretty(values)?;
        let staging = path.with_extension("tmp");
        fs::write(&staging, bytes)
            .and_then(|()| fs::rename(&staging, path))
            .map_err(|source| StoreError::Io {
                path: path.clone(),
                source,
            })
    }

    fn notify(&self, name: &str) {
        let snapshot: Vec<Observer> = self
            .inner
            .observers
            .lock()
            .get(name)
            .map(|entries| entries.iter().map(|(_, observer)| Arc::clone(observer)).collect())
            .unwrap_or_default();
        for observer in snapshot {
            observer();
        }
    }

    fn address(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }
}

impl fmt::Debug for KeyValueStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyValueStore")
            .field("path", &self.inner.path)
            .field("names", &self.inner.values.lock().len())
            .finish()
    }
}

/// Identity of an [`AppStorageKey`]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AppStorageKeyId {
    name: String,
    store: usize,
}

/// Key for a JSON-encoded value in a [`KeyValueStore`]
pub struct AppStorageKey<V> {
    name: String,
    store: KeyValueStore,
    _value: PhantomData<fn() -> V>,
}

impl<V> AppStorageKey<V>
where
    V: SharedValue + Serialize + DeserializeOwned,
{
    /// Key into the process-wide key-value store
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_store(name, &defaults::current().key_value_store)
    }

    pub fn with_store(name: impl Into<String>, store: &KeyValueStore) -> Self {
        Self {
            name: name.into(),
            store: store.clone(),
            _value: PhantomData,
        }
    }
}

impl<V> Clone for AppStorageKey<V> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            store: self.store.clone(),
            _value: PhantomData,
        }
    }
}

impl<V> SharedReaderKey for AppStorageKey<V>
where
    V: SharedValue + Serialize + DeserializeOwned,
{
    type Value = V;
    type Id = AppStorageKeyId;

    fn id(&self) -> AppStorageKeyId {
        AppStorageKeyId {
            name: self.name.clone(),
            store: self.store.address(),
        }
    }

    fn load(&self, context: LoadContext<V>, continuation: LoadContinuation<V>) {
        if let Some(json) = self.store.get(&self.name) {
            match serde_json::from_value::<V>(json) {
                Ok(value) => continuation.resume_returning_value(value),
                Err(e) => continuation.resume_throwing(e),
            }
            return;
        }
        if let Some(initial) = context.initial_value() {
            let written = serde_json::to_value(initial)
                .map_err(StoreError::from)
                .and_then(|json| self.store.set(&self.name, json));
            if let Err(e) = written {
                warn!(key = %self.description(), error = %e, "cannot store initial value");
            }
        }
        continuation.resume_returning_initial_value();
    }

    fn subscribe(&self, _context: LoadContext<V>, subscriber: SharedSubscriber<V>) -> SharedSubscription {
        let store = self.store.downgrade();
        let name = self.name.clone();
        self.store.observe(&self.name, move || {
            let Some(store) = KeyValueStore::upgrade(&store) else {
                return;
            };
            match store.get(&name) {
                None => subscriber.yield_initial_value(),
                Some(json) => match serde_json::from_value::<V>(json) {
                    Ok(value) => subscriber.yield_value(value),
                    Err(e) => subscriber.yield_error(e),
                },
            }
        })
    }

    fn description(&self) -> String {
        format!(".app_storage({:?})", self.name)
    }
}

impl<V> SharedKey for AppStorageKey<V>
where
    V: SharedValue + Serialize + DeserializeOwned,
{
    fn save(&self, value: &V, _context: SaveContext, continuation: SaveContinuation) {
        let saved = serde_json::to_value(value)
            .map_err(StoreError::from)
            .and_then(|json| self.store.set(&self.name, json));
        match saved {
            Ok(()) => continuation.resume(),
            Err(e) => continuation.resume_throwing(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_open_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyValueStore::open(dir.path().join("store.json")).unwrap();
        assert!(store.names().is_empty());
    }

    #[test]
    fn test_writes_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let store = KeyValueStore::open(&path).unwrap();
        store.set("count", json!(3)).unwrap();
        store.set("name", json!("Blob")).unwrap();
        store.remove("name").unwrap();

        let reopened = KeyValueStore::open(&path).unwrap();
        assert_eq!(reopened.get("count"), Some(json!(3)));
        assert_eq!(reopened.get("name"), None);
    }

    #[test]
    fn test_malformed_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        fs::write(&path, b"[1, 2, 3]").unwrap();
        assert!(matches!(KeyValueStore::open(&path), Err(StoreError::Malformed { .. })));
    }

    #[test]
    fn test_observers_see_every_set() {
        let store = KeyValueStore::in_memory();
        let calls = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&calls);
        let subscription = store.observe("count", move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        store.set("count", json!(1)).unwrap();
        store.set("other", json!(1)).unwrap();
        store.remove("count").unwrap();
        drop(subscription);
        store.set("count", json!(2)).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
