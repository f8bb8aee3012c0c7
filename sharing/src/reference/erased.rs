//! Type-erased view of a key as held by a cache cell
//!
//! A cell only knows its value type. Readers and writers of the same slot
//! share one cell, so the key is stored behind [`ErasedKey`] and swapped from
//! a [`ReaderKey`] to a [`WriterKey`] when a writer shows up.

use std::sync::Arc;
use tracing::debug;

use crate::continuation::{LoadContinuation, SaveContinuation};
use crate::key::{LoadContext, SaveContext, SharedKey, SharedReaderKey, SharedValue};
use crate::persistent_references::ReferenceId;
use crate::subscriber::SharedSubscriber;
use crate::subscription::SharedSubscription;

pub(crate) trait ErasedKey<V: SharedValue>: Send + Sync {
    fn reference_id(&self) -> ReferenceId;
    fn load(&self, context: LoadContext<V>, continuation: LoadContinuation<V>);
    fn subscribe(&self, context: LoadContext<V>, subscriber: SharedSubscriber<V>) -> SharedSubscription;
    fn save(&self, value: &V, context: SaveContext, continuation: SaveContinuation);
    fn is_writable(&self) -> bool;
    fn description(&self) -> String;
}

/// Read-only key; saves complete immediately without touching storage
pub(crate) struct ReaderKey<K>(K);

/// Writable key
pub(crate) struct WriterKey<K>(K);

pub(crate) fn reader<K: SharedReaderKey>(key: K) -> Arc<dyn ErasedKey<K::Value>> {
    Arc::new(ReaderKey(key))
}

pub(crate) fn writer<K: SharedKey>(key: K) -> Arc<dyn ErasedKey<K::Value>> {
    Arc::new(WriterKey(key))
}

impl<K: SharedReaderKey> ErasedKey<K::Value> for ReaderKey<K> {
    fn reference_id(&self) -> ReferenceId {
        ReferenceId::new::<K::Value, _>(self.0.id())
    }

    fn load(&self, context: LoadContext<K::Value>, continuation: LoadContinuation<K::Value>) {
        self.0.load(context, continuation);
    }

    fn subscribe(
        &self,
        context: LoadContext<K::Value>,
        subscriber: SharedSubscriber<K::Value>,
    ) -> SharedSubscription {
        self.0.subscribe(context, subscriber)
    }

    fn save(&self, _value: &K::Value, _context: SaveContext, continuation: SaveContinuation) {
        debug!(key = %self.0.description(), "read-only key, save skipped");
        continuation.resume();
    }

    fn is_writable(&self) -> bool {
        false
    }

    fn description(&self) -> String {
        self.0.description()
    }
}

impl<K: SharedKey> ErasedKey<K::Value> for WriterKey<K> {
    fn reference_id(&self) -> ReferenceId {
        ReferenceId::new::<K::Value, _>(self.0.id())
    }

    fn load(&self, context: LoadContext<K::Value>, continuation: LoadContinuation<K::Value>) {
        self.0.load(context, continuation);
    }

    fn subscribe(
        &self,
        context: LoadContext<K::Value>,
        subscriber: SharedSubscriber<K::Value>,
    ) -> SharedSubscription {
        self.0.subscribe(context, subscriber)
    }

    fn save(&self, value: &K::Value, context: SaveContext, continuation: SaveContinuation) {
        self.0.save(value, context, continuation);
    }

    fn is_writable(&self) -> bool {
        true
    }

    fn description(&self) -> String {
        self.0.description()
    }
}
