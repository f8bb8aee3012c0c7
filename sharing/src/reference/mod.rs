//! References: the storage behind `Shared` and `SharedReader` handles
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │  Shared / SharedReader (handles)         │
//! └──────────────────────────────────────────┘
//!          │ Arc<dyn (Mutable)Reference>
//!          ▼
//! ┌──────────────┐ ┌──────────────┐ ┌──────────────────────┐
//! │ Persistent   │ │ Box          │ │ Projection / Read /  │
//! │ (cache cell) │ │ (plain value)│ │ Optional (views)     │
//! └──────────────┘ └──────────────┘ └──────────────────────┘
//!        │                                  │
//!        │ load / subscribe / save          │ observe parent
//!        ▼                                  ▼
//!     backend key                      any reference
//! ```

pub(crate) mod boxed;
pub(crate) mod erased;
pub(crate) mod persistent;
pub(crate) mod projection;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::error::SharedError;
use crate::key::SharedValue;
use crate::subscription::SharedSubscription;

/// Change listener registered on a reference
pub(crate) type Listener<V> = Arc<dyn Fn(&V) + Send + Sync>;

/// One step of a derived view's transform chain
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum PathSegment {
    /// An opaque closure; every view built from one gets a fresh id
    Closure(u64),
    /// Identified by an explicit label
    Named(&'static str),
    /// `Option<T>` unwrapped to `T`
    Unwrapped,
}

impl PathSegment {
    /// Closures can capture state, so two views built from the same closure
    /// type may still read different parts of the root
    pub(crate) fn closure() -> Self {
        static NEXT_CLOSURE: AtomicU64 = AtomicU64::new(1);
        Self::Closure(NEXT_CLOSURE.fetch_add(1, Ordering::Relaxed))
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Closure(_) => "<closure>",
            Self::Named(label) => label,
            Self::Unwrapped => "?",
        }
    }
}

/// Structural identity of a reference: root object plus transform chain
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct Identity {
    root: usize,
    path: Vec<PathSegment>,
}

impl Identity {
    pub(crate) fn root(address: usize) -> Self {
        Self {
            root: address,
            path: Vec::new(),
        }
    }

    pub(crate) fn appending(&self, segment: PathSegment) -> Self {
        let mut path = self.path.clone();
        path.push(segment);
        Self {
            root: self.root,
            path,
        }
    }
}

pub(crate) trait Reference<V: SharedValue>: Send + Sync {
    fn value(&self) -> V;
    fn load_error(&self) -> Option<SharedError>;
    fn save_error(&self) -> Option<SharedError>;
    fn is_loading(&self) -> bool;
    fn load(&self) -> BoxFuture<'static, Result<(), SharedError>>;
    fn observe(&self, listener: Listener<V>) -> SharedSubscription;
    fn identity(&self) -> Identity;
    /// Whether the root is a cache cell backed by external storage
    fn is_persisted(&self) -> bool;
    fn description(&self) -> String;
}

pub(crate) trait MutableReference<V: SharedValue>: Reference<V> {
    /// Run `body` exactly once on the value under the mutation lock
    fn with_lock_dyn(&self, body: &mut dyn FnMut(&mut V));
    fn save(&self) -> BoxFuture<'static, Result<(), SharedError>>;
    fn as_reference(self: Arc<Self>) -> Arc<dyn Reference<V>>;
}

/// Equality of two handles
///
/// Same root and same transform chain are equal. Two different persisted
/// roots are never equal. Anything else compares values.
pub(crate) fn references_equal<V, A, B>(lhs: &A, rhs: &B) -> bool
where
    V: SharedValue + PartialEq,
    A: Reference<V> + ?Sized,
    B: Reference<V> + ?Sized,
{
    let (left, right) = (lhs.identity(), rhs.identity());
    if left == right {
        return true;
    }
    if left.root != right.root && lhs.is_persisted() && rhs.is_persisted() {
        return false;
    }
    lhs.value() == rhs.value()
}

/// Registry of change listeners
pub(crate) struct Listeners<V> {
    next_id: AtomicU64,
    entries: Mutex<Vec<(u64, Listener<V>)>>,
}

impl<V: 'static> Listeners<V> {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(1),
            entries: Mutex::new(Vec::new()),
        })
    }

    /// Register a listener; cancelling the subscription removes it
    pub(crate) fn register(self: &Arc<Self>, listener: Listener<V>) -> SharedSubscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().push((id, listener));
        let listeners: Weak<Self> = Arc::downgrade(self);
        SharedSubscription::new(move || {
            if let Some(listeners) = listeners.upgrade() {
                listeners.entries.lock().retain(|(entry_id, _)| *entry_id != id);
            }
        })
    }

    /// Call every listener with `value`
    ///
    /// Listeners run outside the registry lock, so they may read or mutate
    /// the reference that notified them.
    pub(crate) fn notify(&self, value: &V) {
        let snapshot: Vec<Listener<V>> = self
            .entries
            .lock()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in snapshot {
            listener(value);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

/// `std::any::type_name` without module paths: `Option<String>`, not
/// `core::option::Option<alloc::string::String>`
pub(crate) fn short_type_name<T: ?Sized>() -> String {
    let full = std::any::type_name::<T>();
    let mut short = String::with_capacity(full.len());
    for piece in full.split_inclusive(|c: char| "<>,;()[]& ".contains(c)) {
        let (ident, delimiter) = match piece.char_indices().last() {
            Some((index, last)) if "<>,;()[]& ".contains(last) => piece.split_at(index),
            _ => (piece, ""),
        };
        short.push_str(ident.rsplit("::").next().unwrap_or(ident));
        short.push_str(delimiter);
    }
    short
}

pub(crate) fn describe_path(base: &str, segment: &PathSegment) -> String {
    format!("{base}.{}", segment.label())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_short_type_name() {
        assert_eq!(short_type_name::<i32>(), "i32");
        assert_eq!(short_type_name::<String>(), "String");
        assert_eq!(short_type_name::<Option<Vec<String>>>(), "Option<Vec<String>>");
        assert_eq!(short_type_name::<(u8, String)>(), "(u8, String)");
    }

    #[test]
    fn test_listener_unregisters_on_cancel() {
        let listeners = Listeners::<i32>::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let subscription = listeners.register(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        listeners.notify(&1);
        assert_eq!(listeners.len(), 1);
        drop(subscription);
        listeners.notify(&2);
        assert_eq!(listeners.len(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_identity_paths() {
        let root = Identity::root(42);
        let named = root.appending(PathSegment::Named("count"));
        assert_ne!(root, named);
        assert_eq!(named, Identity::root(42).appending(PathSegment::Named("count")));
        assert_ne!(named, root.appending(PathSegment::Unwrapped));
    }

    #[test]
    fn test_closure_segments_are_unique() {
        let root = Identity::root(7);
        let first = root.appending(PathSegment::closure());
        let second = root.appending(PathSegment::closure());
        assert_ne!(first, second);
        assert_eq!(first, first.clone());
    }
}
