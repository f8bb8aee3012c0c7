//! Process-wide deduplicating cache of reference cells
//!
//! Maps a key identity to a weak pointer to its live cell. Acquiring the
//! same identity twice returns the same cell; the cell removes its own slot
//! when the last strong handle drops.
//!
//! # Locking
//!
//! The map lock is only held for lookups and inserts. Default closures,
//! backend calls and cell teardown all happen outside it, so a default
//! closure or a backend callback may itself acquire references.

use parking_lot::Mutex;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Weak};
use tracing::{debug, trace, warn};

use crate::key::{SharedReaderKey, SharedValue};
use crate::reference::erased::ErasedKey;
use crate::reference::persistent::PersistentReference;

// ============================================================================
// Identity
// ============================================================================

trait DynId: Send + Sync + fmt::Debug {
    fn as_any(&self) -> &dyn Any;
    fn dyn_eq(&self, other: &dyn DynId) -> bool;
    fn dyn_hash(&self, state: &mut dyn Hasher);
}

impl<T: Hash + Eq + fmt::Debug + Send + Sync + 'static> DynId for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn dyn_eq(&self, other: &dyn DynId) -> bool {
        other.as_any().downcast_ref::<T>() == Some(self)
    }

    fn dyn_hash(&self, mut state: &mut dyn Hasher) {
        TypeId::of::<T>().hash(&mut state);
        self.hash(&mut state);
    }
}

/// Cache identity of a key: value type plus the key's own id
#[derive(Clone)]
pub(crate) struct ReferenceId {
    value_type: TypeId,
    id: Arc<dyn DynId>,
}

impl ReferenceId {
    pub(crate) fn new<V: 'static, I: Hash + Eq + fmt::Debug + Send + Sync + 'static>(id: I) -> Self {
        Self {
            value_type: TypeId::of::<V>(),
            id: Arc::new(id),
        }
    }
}

impl PartialEq for ReferenceId {
    fn eq(&self, other: &Self) -> bool {
        self.value_type == other.value_type && self.id.dyn_eq(other.id.as_ref())
    }
}

impl Eq for ReferenceId {}

impl Hash for ReferenceId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.value_type.hash(state);
        self.id.dyn_hash(state);
    }
}

impl fmt::Debug for ReferenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.id)
    }
}

// ============================================================================
// Cache
// ============================================================================

pub(crate) type Registry = Mutex<HashMap<ReferenceId, Weak<dyn Any + Send + Sync>>>;

/// Deduplicating cache of persistent reference cells
///
/// Cloning yields another handle to the same cache. Most code uses the
/// process-wide cache from [`crate::defaults`]; tests create their own for
/// isolation and pass it to the `*_in` constructors.
#[derive(Clone, Default)]
pub struct PersistentReferences {
    registry: Arc<Registry>,
}

impl PersistentReferences {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the live cell for `key`, or create and start one
    ///
    /// `default` is evaluated only if no live cell exists. When
    /// `is_explicit_load` is set, the caller already loaded the value and the
    /// new cell skips its implicit initial load.
    pub(crate) fn acquire<V: SharedValue>(
        &self,
        key: Arc<dyn ErasedKey<V>>,
        default: impl FnOnce() -> V,
        is_explicit_load: bool,
    ) -> Arc<PersistentReference<V>> {
        let id = key.reference_id();
        if let Some(existing) = self.lookup::<V>(&id) {
            existing.promote(key);
            return existing;
        }

        let candidate = PersistentReference::new(id.clone(), key, default(), Arc::downgrade(&self.registry));
        let raced = {
            let mut registry = self.registry.lock();
            match registry.get(&id).and_then(Weak::upgrade) {
                Some(live) => Some(live),
                None => {
                    let slot: Weak<dyn Any + Send + Sync> = Arc::downgrade(&candidate) as _;
                    registry.insert(id.clone(), slot);
                    None
                }
            }
        };

        match raced.map(|live| live.downcast::<PersistentReference<V>>()) {
            None => {
                debug!(id = ?id, "cell created");
                candidate.start(is_explicit_load);
                candidate
            }
            Some(Ok(existing)) => {
                trace!(id = ?id, "lost creation race, reusing live cell");
                existing.promote(candidate.key());
                existing
            }
            Some(Err(_)) => {
                // Unreachable while ids include the value type
                warn!(id = ?id, "slot holds a cell of another type, using an uncached cell");
                candidate.start(is_explicit_load);
                candidate
            }
        }
    }

    /// Like [`acquire`](Self::acquire) with a value the caller just loaded
    ///
    /// A live cell adopts `value`; a new cell starts from it without an
    /// implicit load.
    pub(crate) fn acquire_loaded<V: SharedValue>(
        &self,
        key: Arc<dyn ErasedKey<V>>,
        value: V,
    ) -> Arc<PersistentReference<V>> {
        if let Some(existing) = self.lookup::<V>(&key.reference_id()) {
            existing.promote(key);
            existing.adopt_loaded(value);
            return existing;
        }
        self.acquire(key, || value, true)
    }

    fn lookup<V: SharedValue>(&self, id: &ReferenceId) -> Option<Arc<PersistentReference<V>>> {
        let live = self.registry.lock().get(id).and_then(Weak::upgrade);
        // A failed downcast drops its Arc here, outside the lock
        live.and_then(|any| any.downcast::<PersistentReference<V>>().ok())
    }

    /// Remove the slot for `id` if it no longer points at a live cell
    pub(crate) fn release(registry: &Registry, id: &ReferenceId) {
        let mut registry = registry.lock();
        if registry.get(id).is_some_and(|slot| slot.strong_count() == 0) {
            registry.remove(id);
        }
    }

    /// Number of live cells
    #[must_use]
    pub fn len(&self) -> usize {
        self.registry
            .lock()
            .values()
            .filter(|slot| slot.strong_count() > 0)
            .count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a live cell exists for `key`
    #[must_use]
    pub fn contains<K: SharedReaderKey>(&self, key: &K) -> bool {
        let id = ReferenceId::new::<K::Value, _>(key.id());
        self.registry
            .lock()
            .get(&id)
            .is_some_and(|slot| slot.strong_count() > 0)
    }
}

impl fmt::Debug for PersistentReferences {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentReferences")
            .field("live", &self.len())
            .finish()
    }
}
