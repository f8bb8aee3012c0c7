//! Read-only handle

use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;

use crate::continuation::LoadContinuation;
use crate::defaults;
use crate::error::{Misuse, SharedError};
use crate::key::{KeyDefault, LoadContext, LoadResult, SharedReaderKey, SharedValue};
use crate::observation::{SharedObservable, SharedStream};
use crate::persistent_references::PersistentReferences;
use crate::reference::boxed::BoxReference;
use crate::reference::erased::{self, ErasedKey};
use crate::reference::projection::ReadReference;
use crate::reference::{references_equal, short_type_name, PathSegment, Reference};
use crate::shared::Shared;
use crate::subscription::SharedSubscription;

/// Shared, read-only value
///
/// Shares its cell with every [`Shared`] and `SharedReader` built from a key
/// with the same id. A reader never writes to the backend.
pub struct SharedReader<V: SharedValue> {
    pub(crate) reference: Arc<dyn Reference<V>>,
}

impl<V: SharedValue> SharedReader<V> {
    /// Reader of a constant value
    pub fn from_value(value: V) -> Self {
        Self {
            reference: BoxReference::new(value),
        }
    }

    pub fn new<K: SharedReaderKey<Value = V>>(key: K, default: V) -> Self {
        Self::new_with(key, move || default)
    }

    pub fn new_with<K: SharedReaderKey<Value = V>>(key: K, default: impl FnOnce() -> V) -> Self {
        Self::new_with_in(&defaults::references(), key, default)
    }

    pub fn new_in<K: SharedReaderKey<Value = V>>(references: &PersistentReferences, key: K, default: V) -> Self {
        Self::new_with_in(references, key, move || default)
    }

    pub fn new_with_in<K: SharedReaderKey<Value = V>>(
        references: &PersistentReferences,
        key: K,
        default: impl FnOnce() -> V,
    ) -> Self {
        Self {
            reference: references.acquire(erased::reader(key), default, false),
        }
    }

    pub fn from_default_key<K: SharedReaderKey<Value = V>>(key: KeyDefault<K>) -> Self {
        Self::from_default_key_in(&defaults::references(), key)
    }

    pub fn from_default_key_in<K: SharedReaderKey<Value = V>>(
        references: &PersistentReferences,
        key: KeyDefault<K>,
    ) -> Self {
        let default = key.default_value();
        Self::new_in(references, key, default)
    }

    /// Load `key` explicitly and fail if the backend holds no value
    ///
    /// # Errors
    ///
    /// [`SharedError::NoValueAvailable`] if the backend answers with no value,
    /// [`SharedError::LoadFailed`] if it fails.
    pub async fn require<K: SharedReaderKey<Value = V>>(key: K) -> Result<Self, SharedError> {
        Self::require_in(&defaults::references(), key).await
    }

    pub async fn require_in<K: SharedReaderKey<Value = V>>(
        references: &PersistentReferences,
        key: K,
    ) -> Result<Self, SharedError> {
        let key = erased::reader(key);
        let value = load_required(key.as_ref()).await?;
        Ok(Self {
            reference: references.acquire_loaded(key, value),
        })
    }

    #[must_use]
    pub fn get(&self) -> V {
        self.reference.value()
    }

    /// Reload from the backend
    ///
    /// # Errors
    ///
    /// The backend's error, also latched in [`load_error`](Self::load_error).
    pub async fn load(&self) -> Result<(), SharedError> {
        self.reference.load().await
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

    /// Read-only view of a value derived from this one
    pub fn map<T, F>(&self, transform: F) -> SharedReader<T>
    where
        T: SharedValue,
        F: Fn(&V) -> T + Send + Sync + 'static,
    {
        SharedReader {
            reference: ReadReference::new(Arc::clone(&self.reference), transform, PathSegment::closure()),
        }
    }

    /// Like [`map`](Self::map), identified by `label` instead of the closure
    pub fn map_path<T: SharedValue>(
        &self,
        label: &'static str,
        transform: impl Fn(&V) -> T + Send + Sync + 'static,
    ) -> SharedReader<T> {
        SharedReader {
            reference: ReadReference::new(Arc::clone(&self.reference), transform, PathSegment::Named(label)),
        }
    }
}

/// Explicit load straight from a key, outside any cell
pub(crate) async fn load_required<V: SharedValue>(key: &dyn ErasedKey<V>) -> Result<V, SharedError> {
    let description = key.description();
    let (sender, receiver) = oneshot::channel();
    let continuation = LoadContinuation::new(description.clone(), move |result| {
        let _ = sender.send(result);
    });
    key.load(LoadContext::UserInitiated, continuation);
    match receiver.await {
        Ok(Ok(LoadResult::NewValue(value))) => Ok(value),
        Ok(Ok(LoadResult::InitialValue)) => Err(SharedError::NoValueAvailable(description)),
        Ok(Err(error)) => Err(SharedError::LoadFailed(error)),
        Err(_) => Err(SharedError::ContinuationMisuse {
            description,
            misuse: Misuse::NeverResumed,
        }),
    }
}

impl<V: SharedValue> From<Shared<V>> for SharedReader<V> {
    fn from(shared: Shared<V>) -> Self {
        Self {
            reference: shared.reference.as_reference(),
        }
    }
}

impl<V: SharedValue> SharedObservable<V> for SharedReader<V> {
    fn observe(&self, listener: impl Fn(&V) + Send + Sync + 'static) -> SharedSubscription {
        self.reference.observe(Arc::new(listener))
    }

    fn stream(&self) -> SharedStream<V> {
        SharedStream::new(self.get(), |listener| self.reference.observe(listener))
    }
}

impl<V: SharedValue> Clone for SharedReader<V> {
    fn clone(&self) -> Self {
        Self {
            reference: Arc::clone(&self.reference),
        }
    }
}

impl<V: SharedValue + PartialEq> PartialEq for SharedReader<V> {
    fn eq(&self, other: &Self) -> bool {
        references_equal::<V, _, _>(self.reference.as_ref(), other.reference.as_ref())
    }
}

impl<V: SharedValue + PartialEq> PartialEq<Shared<V>> for SharedReader<V> {
    fn eq(&self, other: &Shared<V>) -> bool {
        references_equal::<V, _, _>(self.reference.as_ref(), other.reference.as_ref())
    }
}

impl<V: SharedValue> fmt::Display for SharedReader<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SharedReader<{}>({})", short_type_name::<V>(), self.reference.description())
    }
}

impl<V: SharedValue> fmt::Debug for SharedReader<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedReader")
            .field("reference", &self.reference.description())
            .field("value", &self.get())
            .finish()
    }
}
