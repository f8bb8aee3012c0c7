//! Controllable key for integration tests

#![allow(dead_code)]

use parking_lot::Mutex;
use sharing::{
    LoadContext, LoadContinuation, SaveContext, SaveContinuation, SharedKey, SharedReaderKey, SharedSubscriber,
    SharedSubscription, SharedValue,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Backend state shared by every clone of a [`MockKey`]
pub struct MockBackend<V> {
    pub value: Mutex<Option<V>>,
    pub load_error: Mutex<Option<String>>,
    pub save_error: Mutex<Option<String>>,
    /// Keep load continuations in `pending_loads` instead of resuming
    pub defer_loads: AtomicBool,
    /// Push every saved value back to subscribers before resuming
    pub echo_saves: AtomicBool,
    pub pending_loads: Mutex<Vec<LoadContinuation<V>>>,
    pub saves: Mutex<Vec<(V, SaveContext)>>,
    pub subscribers: Mutex<Vec<(usize, SharedSubscriber<V>)>>,
    pub load_count: AtomicUsize,
    pub subscribe_count: AtomicUsize,
    pub cancel_count: AtomicUsize,
}

impl<V: SharedValue> MockBackend<V> {
    /// Push a value as an external change
    pub fn push(&self, value: V) {
        let subscribers = self.subscribers.lock().clone();
        for (_, subscriber) in subscribers {
            subscriber.yield_value(value.clone());
        }
    }

    pub fn push_error(&self, message: &str) {
        let subscribers = self.subscribers.lock().clone();
        for (_, subscriber) in subscribers {
            subscriber.yield_error(message.to_string());
        }
    }

    pub fn take_pending(&self) -> Vec<LoadContinuation<V>> {
        std::mem::take(&mut *self.pending_loads.lock())
    }

    pub fn loads(&self) -> usize {
        self.load_count.load(Ordering::SeqCst)
    }
}

pub struct MockKey<V> {
    name: &'static str,
    backend: Arc<MockBackend<V>>,
}

impl<V: SharedValue> MockKey<V> {
    pub fn new(name: &'static str, value: Option<V>) -> Self {
        Self {
            name,
            backend: Arc::new(MockBackend {
                value: Mutex::new(value),
                load_error: Mutex::new(None),
                save_error: Mutex::new(None),
                defer_loads: AtomicBool::new(false),
                echo_saves: AtomicBool::new(false),
                pending_loads: Mutex::new(Vec::new()),
                saves: Mutex::new(Vec::new()),
                subscribers: Mutex::new(Vec::new()),
                load_count: AtomicUsize::new(0),
                subscribe_count: AtomicUsize::new(0),
                cancel_count: AtomicUsize::new(0),
            }),
        }
    }

    pub fn deferred(name: &'static str) -> Self {
        let key = Self::new(name, None);
        key.backend.defer_loads.store(true, Ordering::SeqCst);
        key
    }

    pub fn backend(&self) -> Arc<MockBackend<V>> {
        Arc::clone(&self.backend)
    }
}

impl<V> Clone for MockKey<V> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            backend: Arc::clone(&self.backend),
        }
    }
}

impl<V: SharedValue> SharedReaderKey for MockKey<V> {
    type Value = V;
    type Id = &'static str;

    fn id(&self) -> &'static str {
        self.name
    }

    fn load(&self, _context: LoadContext<V>, continuation: LoadContinuation<V>) {
        self.backend.load_count.fetch_add(1, Ordering::SeqCst);
        if self.backend.defer_loads.load(Ordering::SeqCst) {
            self.backend.pending_loads.lock().push(continuation);
            return;
        }
        if let Some(message) = self.backend.load_error.lock().clone() {
            continuation.resume_throwing(message);
            return;
        }
        match self.backend.value.lock().clone() {
            Some(value) => continuation.resume_returning_value(value),
            None => continuation.resume_returning_initial_value(),
        }
    }

    fn subscribe(&self, _context: LoadContext<V>, subscriber: SharedSubscriber<V>) -> SharedSubscription {
        let id = self.backend.subscribe_count.fetch_add(1, Ordering::SeqCst);
        self.backend.subscribers.lock().push((id, subscriber));
        let backend = Arc::downgrade(&self.backend);
        SharedSubscription::new(move || {
            if let Some(backend) = backend.upgrade() {
                backend.cancel_count.fetch_add(1, Ordering::SeqCst);
                backend.subscribers.lock().retain(|(entry, _)| *entry != id);
            }
        })
    }

    fn description(&self) -> String {
        format!(".mock({:?})", self.name)
    }
}

impl<V: SharedValue> SharedKey for MockKey<V> {
    fn save(&self, value: &V, context: SaveContext, continuation: SaveContinuation) {
        if let Some(message) = self.backend.save_error.lock().clone() {
            continuation.resume_throwing(message);
            return;
        }
        *self.backend.value.lock() = Some(value.clone());
        self.backend.saves.lock().push((value.clone(), context));
        if self.backend.echo_saves.load(Ordering::SeqCst) {
            self.backend.push(value.clone());
        }
        continuation.resume();
    }
}
