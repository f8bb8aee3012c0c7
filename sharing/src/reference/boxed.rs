//! Plain in-process value, not backed by any key

use futures::future::BoxFuture;
use parking_lot::{Mutex, ReentrantMutex};
use std::sync::Arc;

use crate::error::SharedError;
use crate::key::SharedValue;
use crate::reference::{Identity, Listener, Listeners, MutableReference, Reference};
use crate::subscription::SharedSubscription;

pub(crate) struct BoxReference<V> {
    value: Mutex<V>,
    mutation: ReentrantMutex<()>,
    listeners: Arc<Listeners<V>>,
}

impl<V: SharedValue> BoxReference<V> {
    pub(crate) fn new(value: V) -> Arc<Self> {
        Arc::new(Self {
            value: Mutex::new(value),
            mutation: ReentrantMutex::new(()),
            listeners: Listeners::new(),
        })
    }
}

impl<V: SharedValue> Reference<V> for BoxReference<V> {
    fn value(&self) -> V {
        self.value.lock().clone()
    }

    fn load_error(&self) -> Option<SharedError> {
        None
    }

    fn save_error(&self) -> Option<SharedError> {
        None
    }

    fn is_loading(&self) -> bool {
        false
    }

    fn load(&self) -> BoxFuture<'static, Result<(), SharedError>> {
        Box::pin(async { Ok(()) })
    }

    fn observe(&self, listener: Listener<V>) -> SharedSubscription {
        self.listeners.register(listener)
    }

    fn identity(&self) -> Identity {
        Identity::root(self as *const Self as usize)
    }

    fn is_persisted(&self) -> bool {
        false
    }

    fn description(&self) -> String {
        format!("value: {:?}", *self.value.lock())
    }
}

impl<V: SharedValue> MutableReference<V> for BoxReference<V> {
    fn with_lock_dyn(&self, body: &mut dyn FnMut(&mut V)) {
        let _mutation = self.mutation.lock();
        let mut value = self.value();
        body(&mut value);
        *self.value.lock() = value.clone();
        self.listeners.notify(&value);
    }

    fn save(&self) -> BoxFuture<'static, Result<(), SharedError>> {
        Box::pin(async { Ok(()) })
    }

    fn as_reference(self: Arc<Self>) -> Arc<dyn Reference<V>> {
        self
    }
}
