//! Derived views onto another reference
//!
//! Views never own storage and never create cache entries. Reading a view
//! reads its parent; mutating a writable view mutates the parent under the
//! parent's lock; listeners registered on a view are registered on the parent
//! and see the transformed value.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::error::SharedError;
use crate::key::SharedValue;
use crate::reference::{describe_path, Identity, Listener, MutableReference, PathSegment, Reference};
use crate::subscription::SharedSubscription;

type Getter<Root, V> = Box<dyn Fn(&Root) -> &V + Send + Sync>;
type GetterMut<Root, V> = Box<dyn Fn(&mut Root) -> &mut V + Send + Sync>;

/// Pair of accessors into a field of `Root`
pub(crate) struct Lens<Root, V> {
    get: Getter<Root, V>,
    get_mut: GetterMut<Root, V>,
}

impl<Root, V> Lens<Root, V> {
    pub(crate) fn new(
        get: impl Fn(&Root) -> &V + Send + Sync + 'static,
        get_mut: impl Fn(&mut Root) -> &mut V + Send + Sync + 'static,
    ) -> Self {
        Self {
            get: Box::new(get),
            get_mut: Box::new(get_mut),
        }
    }
}

// ============================================================================
// Writable projection
// ============================================================================

pub(crate) struct ProjectionReference<Root: SharedValue, V> {
    base: Arc<dyn MutableReference<Root>>,
    lens: Arc<Lens<Root, V>>,
    segment: PathSegment,
}

impl<Root: SharedValue, V: SharedValue> ProjectionReference<Root, V> {
    pub(crate) fn new(base: Arc<dyn MutableReference<Root>>, lens: Lens<Root, V>, segment: PathSegment) -> Arc<Self> {
        Arc::new(Self {
            base,
            lens: Arc::new(lens),
            segment,
        })
    }
}

impl<Root: SharedValue, V: SharedValue> Reference<V> for ProjectionReference<Root, V> {
    fn value(&self) -> V {
        (self.lens.get)(&self.base.value()).clone()
    }

    fn load_error(&self) -> Option<SharedError> {
        self.base.load_error()
    }

    fn save_error(&self) -> Option<SharedError> {
        self.base.save_error()
    }

    fn is_loading(&self) -> bool {
        self.base.is_loading()
    }

    fn load(&self) -> BoxFuture<'static, Result<(), SharedError>> {
        self.base.load()
    }

    fn observe(&self, listener: Listener<V>) -> SharedSubscription {
        let lens = Arc::clone(&self.lens);
        self.base.observe(Arc::new(move |root: &Root| listener((lens.get)(root))))
    }

    fn identity(&self) -> Identity {
        self.base.identity().appending(self.segment.clone())
    }

    fn is_persisted(&self) -> bool {
        self.base.is_persisted()
    }

    fn description(&self) -> String {
        describe_path(&self.base.description(), &self.segment)
    }
}

impl<Root: SharedValue, V: SharedValue> MutableReference<V> for ProjectionReference<Root, V> {
    fn with_lock_dyn(&self, body: &mut dyn FnMut(&mut V)) {
        let get_mut = &self.lens.get_mut;
        self.base.with_lock_dyn(&mut |root: &mut Root| body(get_mut(root)));
    }

    fn save(&self) -> BoxFuture<'static, Result<(), SharedError>> {
        self.base.save()
    }

    fn as_reference(self: Arc<Self>) -> Arc<dyn Reference<V>> {
        self
    }
}

// ============================================================================
// Read-only transform
// ============================================================================

pub(crate) struct ReadReference<Root: SharedValue, V> {
    base: Arc<dyn Reference<Root>>,
    transform: Arc<dyn Fn(&Root) -> V + Send + Sync>,
    segment: PathSegment,
}

impl<Root: SharedValue, V: SharedValue> ReadReference<Root, V> {
    pub(crate) fn new(
        base: Arc<dyn Reference<Root>>,
        transform: impl Fn(&Root) -> V + Send + Sync + 'static,
        segment: PathSegment,
    ) -> Arc<Self> {
        Arc::new(Self {
            base,
            transform: Arc::new(transform),
            segment,
        })
    }
}

impl<Root: SharedValue, V: SharedValue> Reference<V> for ReadReference<Root, V> {
    fn value(&self) -> V {
        (self.transform)(&self.base.value())
    }

    fn load_error(&self) -> Option<SharedError> {
        self.base.load_error()
    }

    fn save_error(&self) -> Option<SharedError> {
        self.base.save_error()
    }

    fn is_loading(&self) -> bool {
        self.base.is_loading()
    }

    fn load(&self) -> BoxFuture<'static, Result<(), SharedError>> {
        self.base.load()
    }

    fn observe(&self, listener: Listener<V>) -> SharedSubscription {
        let transform = Arc::clone(&self.transform);
        self.base.observe(Arc::new(move |root: &Root| listener(&transform(root))))
    }

    fn identity(&self) -> Identity {
        self.base.identity().appending(self.segment.clone())
    }

    fn is_persisted(&self) -> bool {
        self.base.is_persisted()
    }

    fn description(&self) -> String {
        describe_path(&self.base.description(), &self.segment)
    }
}

// ============================================================================
// Option unwrapping
// ============================================================================

/// `Option<V>` viewed as `V`, remembering the last `Some`
///
/// When the parent becomes `None` the view keeps returning the last value it
/// saw. Mutating the view writes `Some` back to the parent.
pub(crate) struct OptionalReference<V: SharedValue> {
    base: Arc<dyn MutableReference<Option<V>>>,
    last: Arc<Mutex<V>>,
}

impl<V: SharedValue> OptionalReference<V> {
    /// `None` if the parent currently holds `None`
    pub(crate) fn new(base: Arc<dyn MutableReference<Option<V>>>) -> Option<Arc<Self>> {
        let current = base.value()?;
        Some(Arc::new(Self {
            base,
            last: Arc::new(Mutex::new(current)),
        }))
    }
}

impl<V: SharedValue> Reference<V> for OptionalReference<V> {
    fn value(&self) -> V {
        match self.base.value() {
            Some(value) => {
                *self.last.lock() = value.clone();
                value
            }
            None => self.last.lock().clone(),
        }
    }

    fn load_error(&self) -> Option<SharedError> {
        self.base.load_error()
    }

    fn save_error(&self) -> Option<SharedError> {
        self.base.save_error()
    }

    fn is_loading(&self) -> bool {
        self.base.is_loading()
    }

    fn load(&self) -> BoxFuture<'static, Result<(), SharedError>> {
        self.base.load()
    }

    fn observe(&self, listener: Listener<V>) -> SharedSubscription {
        let last = Arc::clone(&self.last);
        self.base.observe(Arc::new(move |value: &Option<V>| {
            if let Some(value) = value {
                *last.lock() = value.clone();
                listener(value);
            }
        }))
    }

    fn identity(&self) -> Identity {
        self.base.identity().appending(PathSegment::Unwrapped)
    }

    fn is_persisted(&self) -> bool {
        self.base.is_persisted()
    }

    fn description(&self) -> String {
        describe_path(&self.base.description(), &PathSegment::Unwrapped)
    }
}

impl<V: SharedValue> MutableReference<V> for OptionalReference<V> {
    fn with_lock_dyn(&self, body: &mut dyn FnMut(&mut V)) {
        let last = &self.last;
        self.base.with_lock_dyn(&mut |slot: &mut Option<V>| {
            let mut value = slot.clone().unwrap_or_else(|| last.lock().clone());
            body(&mut value);
            *last.lock() = value.clone();
            *slot = Some(value);
        });
    }

    fn save(&self) -> BoxFuture<'static, Result<(), SharedError>> {
        self.base.save()
    }

    fn as_reference(self: Arc<Self>) -> Arc<dyn Reference<V>> {
        self
    }
}
