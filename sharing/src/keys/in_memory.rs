//! In-process storage keyed by name
//!
//! Values live only as long as their [`InMemoryStorage`]. The first value
//! stored for a name stays there after every handle is gone, so a later
//! handle with a different default still sees the original value.

use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::continuation::{LoadContinuation, SaveContinuation};
use crate::defaults;
use crate::key::{LoadContext, SaveContext, SharedKey, SharedReaderKey, SharedValue};
use crate::reference::short_type_name;
use crate::subscriber::SharedSubscriber;
use crate::subscription::SharedSubscription;

type StoredValue = Arc<dyn Any + Send + Sync>;
type Observer = Arc<dyn Fn(Option<StoredValue>) + Send + Sync>;

#[derive(Default)]
struct StorageInner {
    values: Mutex<HashMap<String, StoredValue>>,
    observers: Mutex<HashMap<String, Vec<(u64, Observer)>>>,
    next_observer: AtomicU64,
}

/// Named, typed, in-process values
///
/// Clones share the same storage. Two storages are equal only if they are
/// clones of each other.
#[derive(Clone, Default)]
pub struct InMemoryStorage {
    inner: Arc<StorageInner>,
}

impl InMemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The value stored under `name`, if it has type `V`
    #[must_use]
    pub fn value<V: Clone + 'static>(&self, name: &str) -> Option<V> {
        let stored = self.inner.values.lock().get(name).cloned()?;
        stored.downcast_ref::<V>().cloned()
    }

    /// Store `value` as an external change: live handles update
    pub fn set_value<V: SharedValue>(&self, name: &str, value: V) {
        let stored: StoredValue = Arc::new(value);
        self.inner.values.lock().insert(name.to_string(), Arc::clone(&stored));
        self.notify(name, Some(stored));
    }

    /// Remove `name` as an external change: live handles reset to their default
    pub fn remove_value(&self, name: &str) {
        let removed = self.inner.values.lock().remove(name);
        if removed.is_some() {
            self.notify(name, None);
        }
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.inner.values.lock().contains_key(name)
    }

    fn value_or_insert<V: SharedValue>(&self, name: &str, default: Option<&V>) -> Option<V> {
        let mut values = self.inner.values.lock();
        if let Some(stored) = values.get(name) {
            return stored.downcast_ref::<V>().cloned();
        }
        let default = default?.clone();
        values.insert(name.to_string(), Arc::new(default.clone()));
        Some(default)
    }

    fn store<V: SharedValue>(&self, name: &str, value: V) {
        self.inner.values.lock().insert(name.to_string(), Arc::new(value));
    }

    fn observe(&self, name: &str, observer: Observer) -> SharedSubscription {
        let id = self.inner.next_observer.fetch_add(1, Ordering::Relaxed);
        self.inner
            .observers
            .lock()
            .entry(name.to_string())
            .or_default()
            .push((id, observer));
        let inner: Weak<StorageInner> = Arc::downgrade(&self.inner);
        let name = name.to_string();
        SharedSubscription::new(move || {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let mut observers = inner.observers.lock();
            if let Some(entries) = observers.get_mut(&name) {
                entries.retain(|(entry_id, _)| *entry_id != id);
                if entries.is_empty() {
                    observers.remove(&name);
                }
            }
        })
    }

    fn notify(&self, name: &str, value: Option<StoredValue>) {
        let snapshot: Vec<Observer> = self
            .inner
            .observers
            .lock()
            .get(name)
            .map(|entries| entries.iter().map(|(_, observer)| Arc::clone(observer)).collect())
            .unwrap_or_default();
        for observer in snapshot {
            observer(value.clone());
        }
    }

    fn address(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }
}

impl PartialEq for InMemoryStorage {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for InMemoryStorage {}

impl fmt::Debug for InMemoryStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryStorage")
            .field("names", &self.inner.values.lock().len())
            .finish()
    }
}

/// Identity of an [`InMemoryKey`]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InMemoryKeyId {
    name: String,
    storage: usize,
}

/// Key for a named value in an [`InMemoryStorage`]
pub struct InMemoryKey<V> {
    name: String,
    storage: InMemoryStorage,
    _value: PhantomData<fn() -> V>,
}

impl<V: SharedValue> InMemoryKey<V> {
    /// Key into the process-wide in-memory storage
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_storage(name, &defaults::current().in_memory_storage)
    }

    pub fn with_storage(name: impl Into<String>, storage: &InMemoryStorage) -> Self {
        Self {
            name: name.into(),
            storage: storage.clone(),
            _value: PhantomData,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<V> Clone for InMemoryKey<V> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            storage: self.storage.clone(),
            _value: PhantomData,
        }
    }
}

impl<V: SharedValue> SharedReaderKey for InMemoryKey<V> {
    type Value = V;
    type Id = InMemoryKeyId;

    fn id(&self) -> InMemoryKeyId {
        InMemoryKeyId {
            name: self.name.clone(),
            storage: self.storage.address(),
        }
    }

    fn load(&self, context: LoadContext<V>, continuation: LoadContinuation<V>) {
        match self.storage.value_or_insert(&self.name, context.initial_value()) {
            Some(value) => continuation.resume_returning_value(value),
            None => continuation.resume_returning_initial_value(),
        }
    }

    fn subscribe(&self, _context: LoadContext<V>, subscriber: SharedSubscriber<V>) -> SharedSubscription {
        let name = self.name.clone();
        self.storage.observe(
            &self.name,
            Arc::new(move |stored: Option<StoredValue>| match stored {
                None => subscriber.yield_initial_value(),
                Some(stored) => match stored.downcast_ref::<V>() {
                    Some(value) => subscriber.yield_value(value.clone()),
                    None => subscriber.yield_error(format!(
                        "in-memory value {name:?} is not a {}",
                        short_type_name::<V>()
                    )),
                },
            }),
        )
    }

    fn description(&self) -> String {
        format!(".in_memory({:?})", self.name)
    }
}

impl<V: SharedValue> SharedKey for InMemoryKey<V> {
    fn save(&self, value: &V, _context: SaveContext, continuation: SaveContinuation) {
        self.storage.store(&self.name, value.clone());
        continuation.resume();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_default_is_kept() {
        let storage = InMemoryStorage::new();
        assert_eq!(storage.value_or_insert("count", Some(&1)), Some(1));
        assert_eq!(storage.value_or_insert("count", Some(&2)), Some(1));
        assert_eq!(storage.value_or_insert::<i32>("missing", None), None);
        assert!(!storage.contains("missing"));
    }

    #[test]
    fn test_typed_lookup() {
        let storage = InMemoryStorage::new();
        storage.set_value("name", "Blob".to_string());
        assert_eq!(storage.value::<String>("name"), Some("Blob".to_string()));
        assert_eq!(storage.value::<i32>("name"), None);
    }

    #[test]
    fn test_ids_depend_on_storage() {
        let a = InMemoryStorage::new();
        let b = InMemoryStorage::new();
        let key_a = InMemoryKey::<i32>::with_storage("count", &a);
        assert_eq!(key_a.id(), InMemoryKey::<i32>::with_storage("count", &a.clone()).id());
        assert_ne!(key_a.id(), InMemoryKey::<i32>::with_storage("count", &b).id());
        assert_eq!(key_a.description(), ".in_memory(\"count\")");
    }
}
