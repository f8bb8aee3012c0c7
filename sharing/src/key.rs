//! Storage key capability
//!
//! A key describes *where* an external value lives and how to reach it.
//! Every backend implements [`SharedReaderKey`] (read + observe) and,
//! when writable, [`SharedKey`].
//!
//! # Contract
//!
//! - `id()`: two keys with equal ids denote the same external slot. The
//!   cache shares one cell per `(Value type, Id)`.
//! - `load()`: resume the continuation exactly once, now or later. "No value
//!   yet" is [`LoadResult::InitialValue`], not an error.
//! - `subscribe()`: push every external change until the returned
//!   subscription is cancelled. Pushes caused by the cell's own synchronous
//!   `save` are ignored by the cell; asynchronous backends suppress their
//!   own echoes.
//! - `save()`: may defer for [`SaveContext::DidSet`], must not defer for
//!   [`SaveContext::UserInitiated`].

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use crate::continuation::{LoadContinuation, SaveContinuation};
use crate::subscriber::SharedSubscriber;
use crate::subscription::SharedSubscription;

/// Values that can live in a shared reference
pub trait SharedValue: Clone + Send + Sync + fmt::Debug + 'static {}

impl<T: Clone + Send + Sync + fmt::Debug + 'static> SharedValue for T {}

/// The context in which a value is loaded
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LoadContext<V> {
    /// Implicit load at handle construction; carries the caller's default
    InitialValue(V),
    /// Explicit load via `load()` or `require()`
    UserInitiated,
}

impl<V> LoadContext<V> {
    #[must_use]
    pub fn initial_value(&self) -> Option<&V> {
        match self {
            Self::InitialValue(value) => Some(value),
            Self::UserInitiated => None,
        }
    }
}

/// The context in which a value is saved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SaveContext {
    /// Implicit save after `with_lock`; backends may throttle
    DidSet,
    /// Explicit save via `save()`; backends must write now
    UserInitiated,
}

/// Outcome of a successful load or subscription push
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadResult<V> {
    /// The backend holds no value; keep the cell's initial value
    InitialValue,
    /// A fresh value from the backend
    NewValue(V),
}

impl<V> LoadResult<V> {
    #[must_use]
    pub fn into_option(self) -> Option<V> {
        match self {
            Self::InitialValue => None,
            Self::NewValue(value) => Some(value),
        }
    }
}

impl<V> From<Option<V>> for LoadResult<V> {
    fn from(value: Option<V>) -> Self {
        value.map_or(Self::InitialValue, Self::NewValue)
    }
}

/// A type that can load and subscribe to state in an external system
pub trait SharedReaderKey: Send + Sync + 'static {
    type Value: SharedValue;
    type Id: Hash + Eq + fmt::Debug + Send + Sync + 'static;

    /// Hashable identity used to share one cell between equal keys
    fn id(&self) -> Self::Id;

    /// Load the freshest value from storage
    fn load(&self, context: LoadContext<Self::Value>, continuation: LoadContinuation<Self::Value>);

    /// Subscribe to external updates
    fn subscribe(
        &self,
        context: LoadContext<Self::Value>,
        subscriber: SharedSubscriber<Self::Value>,
    ) -> SharedSubscription;

    /// Human-readable description, used by handle `Display` and diagnostics
    fn description(&self) -> String {
        std::any::type_name::<Self>().to_string()
    }

    /// Attach a default value so call sites need not supply one
    fn with_default(self, default: Self::Value) -> KeyDefault<Self>
    where
        Self: Sized,
    {
        KeyDefault::new(self, default)
    }
}

/// A type that can also persist state to external storage
pub trait SharedKey: SharedReaderKey {
    /// Save a value to storage
    fn save(&self, value: &Self::Value, context: SaveContext, continuation: SaveContinuation);
}

/// A key paired with its default value
///
/// Shares the identity of the wrapped key. The first default registered for
/// an identity wins: a handle built from a `KeyDefault` whose cell is already
/// live reads the live value, not its own default.
pub struct KeyDefault<K: SharedReaderKey> {
    base: K,
    default: Arc<dyn Fn() -> K::Value + Send + Sync>,
}

impl<K: SharedReaderKey> KeyDefault<K> {
    pub fn new(base: K, default: K::Value) -> Self {
        Self {
            base,
            default: Arc::new(move || default.clone()),
        }
    }

    /// Default computed on demand
    pub fn new_with(base: K, default: impl Fn() -> K::Value + Send + Sync + 'static) -> Self {
        Self {
            base,
            default: Arc::new(default),
        }
    }

    #[must_use]
    pub fn default_value(&self) -> K::Value {
        (self.default)()
    }

    #[must_use]
    pub fn base(&self) -> &K {
        &self.base
    }
}

impl<K: SharedReaderKey + Clone> Clone for KeyDefault<K> {
    fn clone(&self) -> Self {
        Self {
            base: self.base.clone(),
            default: Arc::clone(&self.default),
        }
    }
}

impl<K: SharedReaderKey> SharedReaderKey for KeyDefault<K> {
    type Value = K::Value;
    type Id = K::Id;

    fn id(&self) -> Self::Id {
        self.base.id()
    }

    fn load(&self, context: LoadContext<Self::Value>, continuation: LoadContinuation<Self::Value>) {
        let context = match context {
            LoadContext::UserInitiated => LoadContext::InitialValue(self.default_value()),
            initial @ LoadContext::InitialValue(_) => initial,
        };
        self.base.load(context, continuation);
    }

    fn subscribe(
        &self,
        context: LoadContext<Self::Value>,
        subscriber: SharedSubscriber<Self::Value>,
    ) -> SharedSubscription {
        self.base.subscribe(context, subscriber)
    }

    fn description(&self) -> String {
        format!(
            "KeyDefault[{}, default: {:?}]",
            self.base.description(),
            self.default_value()
        )
    }
}

impl<K: SharedKey> SharedKey for KeyDefault<K> {
    fn save(&self, value: &Self::Value, context: SaveContext, continuation: SaveContinuation) {
        self.base.save(value, context, continuation);
    }
}

impl<K: SharedReaderKey> fmt::Debug for KeyDefault<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_result_from_option() {
        assert_eq!(LoadResult::from(Some(3)), LoadResult::NewValue(3));
        assert_eq!(LoadResult::<i32>::from(None), LoadResult::InitialValue);
        assert_eq!(LoadResult::NewValue("x").into_option(), Some("x"));
    }

    #[test]
    fn test_load_context_initial_value() {
        assert_eq!(LoadContext::InitialValue(5).initial_value(), Some(&5));
        assert_eq!(LoadContext::<i32>::UserInitiated.initial_value(), None);
    }
}
