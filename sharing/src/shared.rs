//! Read-write handle

use std::fmt;
use std::sync::Arc;

use crate::defaults;
use crate::error::SharedError;
use crate::key::{KeyDefault, SharedKey, SharedValue};
use crate::observation::{SharedObservable, SharedStream};
use crate::persistent_references::PersistentReferences;
use crate::reference::boxed::BoxReference;
use crate::reference::erased;
use crate::reference::projection::{Lens, OptionalReference, ProjectionReference, ReadReference};
use crate::reference::{references_equal, short_type_name, MutableReference, PathSegment};
use crate::shared_reader::{load_required, SharedReader};
use crate::subscription::SharedSubscription;

/// Shared, mutable value
///
/// Handles built from keys with equal ids share one cache cell, so every
/// handle observes every other handle's writes. Cloning a handle is cheap and
/// keeps the cell alive; the cell is released with the last handle.
///
/// ```
/// use sharing::keys::in_memory::{InMemoryKey, InMemoryStorage};
/// use sharing::{PersistentReferences, Shared};
///
/// let storage = InMemoryStorage::new();
/// let cache = PersistentReferences::new();
/// let a = Shared::new_in(&cache, InMemoryKey::with_storage("count", &storage), 0);
/// let b = Shared::new_in(&cache, InMemoryKey::with_storage("count", &storage), 0);
/// a.with_lock(|count| *count += 1);
/// assert_eq!(b.get(), 1);
/// ```
pub struct Shared<V: SharedValue> {
    pub(crate) reference: Arc<dyn MutableReference<V>>,
}

impl<V: SharedValue> Shared<V> {
    /// Handle to a plain value that is not persisted anywhere
    pub fn from_value(value: V) -> Self {
        Self {
            reference: BoxReference::new(value),
        }
    }

    /// Handle to the value stored under `key`, using the process-wide cache
    ///
    /// `default` is used only if no live handle shares the key yet.
    pub fn new<K: SharedKey<Value = V>>(key: K, default: V) -> Self {
        Self::new_with(key, move || default)
    }

    /// Like [`new`](Self::new) with a default computed only when needed
    pub fn new_with<K: SharedKey<Value = V>>(key: K, default: impl FnOnce() -> V) -> Self {
        Self::new_with_in(&defaults::references(), key, default)
    }

    pub fn new_in<K: SharedKey<Value = V>>(references: &PersistentReferences, key: K, default: V) -> Self {
        Self::new_with_in(references, key, move || default)
    }

    pub fn new_with_in<K: SharedKey<Value = V>>(
        references: &PersistentReferences,
        key: K,
        default: impl FnOnce() -> V,
    ) -> Self {
        Self {
            reference: references.acquire(erased::writer(key), default, false),
        }
    }

    /// Handle to a key that carries its own default
    pub fn from_default_key<K: SharedKey<Value = V>>(key: KeyDefault<K>) -> Self {
        Self::from_default_key_in(&defaults::references(), key)
    }

    pub fn from_default_key_in<K: SharedKey<Value = V>>(references: &PersistentReferences, key: KeyDefault<K>) -> Self {
        let default = key.default_value();
        Self::new_in(references, key, default)
    }

    /// Load `key` explicitly and fail if the backend holds no value
    ///
    /// # Errors
    ///
    /// [`SharedError::NoValueAvailable`] if the backend answers with no value,
    /// [`SharedError::LoadFailed`] if it fails.
    pub async fn require<K: SharedKey<Value = V>>(key: K) -> Result<Self, SharedError> {
        Self::require_in(&defaults::references(), key).await
    }

    pub async fn require_in<K: SharedKey<Value = V>>(
        references: &PersistentReferences,
        key: K,
    ) -> Result<Self, SharedError> {
        let key = erased::writer(key);
        let value = load_required(key.as_ref()).await?;
        Ok(Self {
            reference: references.acquire_loaded(key, value),
        })
    }

    /// Snapshot of the current value
    ///
    /// Never blocks on I/O and never fails.
    #[must_use]
    pub fn get(&self) -> V {
        self.reference.value()
    }

    /// Mutate the value
    ///
    /// The change is visible to every handle before this returns. For
    /// persisted handles it is then saved in the background; a failure is
    /// latched in [`save_error`](Self::save_error).
    pub fn with_lock<R>(&self, body: impl FnOnce(&mut V) -> R) -> R {
        let mut body = Some(body);
        let mut result = None;
        self.reference.with_lock_dyn(&mut |value: &mut V| {
            if let Some(body) = body.take() {
                result = Some(body(value));
            }
        });
        match result {
            Some(result) => result,
            None => unreachable!("with_lock body was not run"),
        }
    }

    /// Reload from the backend
    ///
    /// # Errors
    ///
    /// The backend's error, also latched in [`load_error`](Self::load_error);
    /// [`SharedError::Cancelled`] if a newer load superseded this one.
    pub async fn load(&self) -> Result<(), SharedError> {
        self.reference.load().await
    }

    /// Save the current value now, bypassing any throttling
    ///
    /// # Errors
    ///
    /// The backend's error, also latched in [`save_error`](Self::save_error).
    pub async fn save(&self) -> Result<(), SharedError> {
        self.reference.save().await
    }

    #[must_use]
    pub fn load_error(&self) -> Option<SharedError> {
        self.reference.load_error()
    }

    #[must_use]
    pub fn save_error(&self) -> Option<SharedError> {
        self.reference.save_error()
    }

    #[must_use]
    pub fn is_loading(&self) -> bool {
        self.reference.is_loading()
    }

    /// Writable view of a part of the value
    ///
    /// Closures are opaque, so separately built projections compare by value.
    /// Use [`project_path`](Self::project_path) to name a view explicitly.
    pub fn project<T, G, M>(&self, get: G, get_mut: M) -> Shared<T>
    where
        T: SharedValue,
        G: Fn(&V) -> &T + Send + Sync + 'static,
        M: Fn(&mut V) -> &mut T + Send + Sync + 'static,
    {
        self.project_segment(PathSegment::closure(), Lens::new(get, get_mut))
    }

    /// Writable view identified by `label`
    pub fn project_path<T: SharedValue>(
        &self,
        label: &'static str,
        get: impl Fn(&V) -> &T + Send + Sync + 'static,
        get_mut: impl Fn(&mut V) -> &mut T + Send + Sync + 'static,
    ) -> Shared<T> {
        self.project_segment(PathSegment::Named(label), Lens::new(get, get_mut))
    }

    fn project_segment<T: SharedValue>(&self, segment: PathSegment, lens: Lens<V, T>) -> Shared<T> {
        Shared {
            reference: ProjectionReference::new(Arc::clone(&self.reference), lens, segment),
        }
    }

    /// Read-only view of a value derived from this one
    pub fn read<T, F>(&self, transform: F) -> SharedReader<T>
    where
        T: SharedValue,
        F: Fn(&V) -> T + Send + Sync + 'static,
    {
        SharedReader {
            reference: ReadReference::new(
                Arc::clone(&self.reference).as_reference(),
                transform,
                PathSegment::closure(),
            ),
        }
    }

    /// Read-only handle to the same value
    #[must_use]
    pub fn reader(&self) -> SharedReader<V> {
        SharedReader::from(self.clone())
    }
}

impl<T: SharedValue> Shared<Option<T>> {
    /// View of the `Some` value, or `None` if the value is currently `None`
    ///
    /// The view keeps its last value when the parent later becomes `None`.
    #[must_use]
    pub fn unwrapped(&self) -> Option<Shared<T>> {
        OptionalReference::new(Arc::clone(&self.reference)).map(|reference| Shared { reference })
    }
}

impl<V: SharedValue> SharedObservable<V> for Shared<V> {
    fn observe(&self, listener: impl Fn(&V) + Send + Sync + 'static) -> SharedSubscription {
        self.reference.observe(Arc::new(listener))
    }

    fn stream(&self) -> SharedStream<V> {
        SharedStream::new(self.get(), |listener| self.reference.observe(listener))
    }
}

impl<V: SharedValue> Clone for Shared<V> {
    fn clone(&self) -> Self {
        Self {
            reference: Arc::clone(&self.reference),
        }
    }
}

impl<V: SharedValue + PartialEq> PartialEq for Shared<V> {
    fn eq(&self, other: &Self) -> bool {
        references_equal::<V, _, _>(self.reference.as_ref(), other.reference.as_ref())
    }
}

impl<V: SharedValue + PartialEq> PartialEq<SharedReader<V>> for Shared<V> {
    fn eq(&self, other: &SharedReader<V>) -> bool {
        references_equal::<V, _, _>(self.reference.as_ref(), other.reference.as_ref())
    }
}

impl<V: SharedValue> fmt::Display for Shared<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Shared<{}>({})", short_type_name::<V>(), self.reference.description())
    }
}

impl<V: SharedValue> fmt::Debug for Shared<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared")
            .field("reference", &self.reference.description())
            .field("value", &self.get())
            .finish()
    }
}
