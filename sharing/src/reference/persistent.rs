//! Cache cell synchronized with a backend key
//!
//! # State
//!
//! ```text
//! Loading ──ok──▶ Ready(value)
//!    │               │ ▲
//!    err          err│ │ok
//!    ▼               ▼ │
//! Ready(value, load_error / save_error)
//! ```
//!
//! Errors latch independently and never replace the last good value. At most
//! one load is in flight; starting another cancels the previous one.
//!
//! # Thread Safety
//!
//! `state` is a short critical section that never spans a backend call or a
//! listener. `mutation` serializes `with_lock` bodies and is re-entrant so a
//! body may mutate the same reference again.

use futures::future::BoxFuture;
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::continuation::{LoadContinuation, SaveContinuation};
use crate::echo::{self, EchoScope};
use crate::error::{BackendError, Misuse, SharedError};
use crate::key::{LoadContext, LoadResult, SaveContext, SharedValue};
use crate::persistent_references::{PersistentReferences, ReferenceId, Registry};
use crate::reference::erased::ErasedKey;
use crate::reference::{Identity, Listener, Listeners, MutableReference, Reference};
use crate::subscriber::SharedSubscriber;
use crate::subscription::SharedSubscription;

type Waiter = oneshot::Sender<Result<(), SharedError>>;

struct InFlightLoad {
    generation: u64,
    cancelled: Arc<AtomicBool>,
    waiter: Option<Waiter>,
}

impl InFlightLoad {
    fn cancel(self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(waiter) = self.waiter {
            let _ = waiter.send(Err(SharedError::Cancelled));
        }
    }
}

struct CellState<V> {
    value: V,
    initial_value: V,
    load_error: Option<SharedError>,
    save_error: Option<SharedError>,
    in_flight: Option<InFlightLoad>,
    next_generation: u64,
}

pub(crate) struct PersistentReference<V: SharedValue> {
    this: Weak<Self>,
    id: ReferenceId,
    key: RwLock<Arc<dyn ErasedKey<V>>>,
    state: Mutex<CellState<V>>,
    mutation: ReentrantMutex<()>,
    listeners: Arc<Listeners<V>>,
    subscription: Mutex<Option<SharedSubscription>>,
    registry: Weak<Registry>,
}

impl<V: SharedValue> PersistentReference<V> {
    pub(crate) fn new(
        id: ReferenceId,
        key: Arc<dyn ErasedKey<V>>,
        initial_value: V,
        registry: Weak<Registry>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            id,
            key: RwLock::new(key),
            state: Mutex::new(CellState {
                value: initial_value.clone(),
                initial_value,
                load_error: None,
                save_error: None,
                in_flight: None,
                next_generation: 0,
            }),
            mutation: ReentrantMutex::new(()),
            listeners: Listeners::new(),
            subscription: Mutex::new(None),
            registry,
        })
    }

    /// Implicit initial load (unless the caller already loaded) and subscribe
    pub(crate) fn start(&self, is_explicit_load: bool) {
        let context = if is_explicit_load {
            LoadContext::UserInitiated
        } else {
            let context = LoadContext::InitialValue(self.state.lock().initial_value.clone());
            self.begin_load(context.clone(), None);
            context
        };
        self.subscribe(context);
    }

    pub(crate) fn key(&self) -> Arc<dyn ErasedKey<V>> {
        Arc::clone(&self.key.read())
    }

    /// Switch a reader-created cell to a writable key
    pub(crate) fn promote(&self, key: Arc<dyn ErasedKey<V>>) {
        if !key.is_writable() || self.key.read().is_writable() {
            return;
        }
        debug!(key = %key.description(), "promoted to writable key");
        *self.key.write() = key;
        let initial_value = self.state.lock().initial_value.clone();
        self.subscribe(LoadContext::InitialValue(initial_value));
    }

    /// Take a value that was loaded outside the cell
    pub(crate) fn adopt_loaded(&self, value: V) {
        {
            let mut state = self.state.lock();
            state.value = value.clone();
            state.load_error = None;
        }
        self.listeners.notify(&value);
    }

    fn token(&self) -> usize {
        self as *const Self as usize
    }

    // ========================================================================
    // Subscription
    // ========================================================================

    fn subscribe(&self, context: LoadContext<V>) {
        let cell = self.this.clone();
        let subscriber = SharedSubscriber::new(move |result| {
            if let Some(cell) = cell.upgrade() {
                cell.apply_push(result);
            }
        });
        // Values yielded while subscribing are genuine backend state
        let subscription = self.key().subscribe(context, subscriber);
        let previous = self.subscription.lock().replace(subscription);
        drop(previous);
    }

    fn apply_push(&self, result: Result<LoadResult<V>, BackendError>) {
        if echo::is_echo(self.token()) {
            trace!(id = ?self.id, "ignoring echo of own write");
            return;
        }
        let changed = {
            let mut state = self.state.lock();
            match result {
                Ok(loaded) => Some(Self::apply_loaded(&mut state, loaded)),
                Err(error) => {
                    warn!(id = ?self.id, %error, "subscription error");
                    state.load_error = Some(SharedError::LoadFailed(error));
                    None
                }
            }
        };
        if let Some(value) = changed {
            self.listeners.notify(&value);
        }
    }

    fn apply_loaded(state: &mut CellState<V>, loaded: LoadResult<V>) -> V {
        state.value = match loaded {
            LoadResult::NewValue(value) => value,
            LoadResult::InitialValue => state.initial_value.clone(),
        };
        state.load_error = None;
        state.value.clone()
    }

    // ========================================================================
    // Load
    // ========================================================================

    fn begin_load(&self, context: LoadContext<V>, waiter: Option<Waiter>) {
        let cancelled = Arc::new(AtomicBool::new(false));
        let (generation, superseded) = {
            let mut state = self.state.lock();
            let generation = state.next_generation;
            state.next_generation += 1;
            let superseded = state.in_flight.replace(InFlightLoad {
                generation,
                cancelled: Arc::clone(&cancelled),
                waiter,
            });
            (generation, superseded)
        };
        if let Some(superseded) = superseded {
            debug!(id = ?self.id, superseded = superseded.generation, generation, "load superseded");
            superseded.cancel();
        }

        let completion = LoadCompletion {
            cell: self.this.clone(),
            generation,
            completed: false,
        };
        let key = self.key();
        let continuation = LoadContinuation::with_cancellation(key.description(), cancelled, move |result| {
            completion.complete(result);
        });
        let _scope = EchoScope::enter(self.token());
        key.load(context, continuation);
    }

    fn finish_load(&self, generation: u64, result: Result<LoadResult<V>, SharedError>) {
        let (waiter, outcome, changed) = {
            let mut state = self.state.lock();
            let in_flight = match state.in_flight.take() {
                Some(in_flight) if in_flight.generation == generation => in_flight,
                other => {
                    state.in_flight = other;
                    trace!(id = ?self.id, generation, "dropping stale load");
                    return;
                }
            };
            match result {
                Ok(loaded) => {
                    let value = Self::apply_loaded(&mut state, loaded);
                    (in_flight.waiter, Ok(()), Some(value))
                }
                Err(error) => {
                    warn!(id = ?self.id, %error, "load failed");
                    if !matches!(error, SharedError::ContinuationMisuse { .. }) {
                        state.load_error = Some(error.clone());
                    }
                    (in_flight.waiter, Err(error), None)
                }
            }
        };
        if let Some(value) = changed {
            self.listeners.notify(&value);
        }
        if let Some(waiter) = waiter {
            let _ = waiter.send(outcome);
        }
    }

    async fn load_explicitly(self: Arc<Self>) -> Result<(), SharedError> {
        let (sender, receiver) = oneshot::channel();
        self.begin_load(LoadContext::UserInitiated, Some(sender));
        drop(self);
        receiver.await.unwrap_or(Err(SharedError::Cancelled))
    }

    // ========================================================================
    // Save
    // ========================================================================

    fn begin_save(&self, value: &V, context: SaveContext, waiter: Option<Waiter>) {
        let key = self.key();
        if !key.is_writable() {
            if let Some(waiter) = waiter {
                let _ = waiter.send(Ok(()));
            }
            return;
        }
        let description = key.description();
        let cell = self.this.clone();
        let waiter = SaveWaiter(waiter);
        let continuation = SaveContinuation::new(description, move |result| {
            let outcome = match cell.upgrade() {
                Some(cell) => cell.finish_save(result),
                None => result.map_err(SharedError::SaveFailed),
            };
            waiter.send(outcome);
        });
        let _scope = EchoScope::enter(self.token());
        key.save(value, context, continuation);
    }

    fn finish_save(&self, result: Result<(), BackendError>) -> Result<(), SharedError> {
        let mut state = self.state.lock();
        match result {
            Ok(()) => {
                state.save_error = None;
                Ok(())
            }
            Err(error) => {
                warn!(id = ?self.id, %error, "save failed");
                let error = SharedError::SaveFailed(error);
                state.save_error = Some(error.clone());
                Err(error)
            }
        }
    }

    async fn save_explicitly(self: Arc<Self>) -> Result<(), SharedError> {
        let (sender, receiver) = oneshot::channel();
        let description = self.key().description();
        {
            let _mutation = self.mutation.lock();
            let value = self.state.lock().value.clone();
            self.begin_save(&value, SaveContext::UserInitiated, Some(sender));
        }
        drop(self);
        receiver.await.unwrap_or_else(|_| {
            Err(SharedError::ContinuationMisuse {
                description,
                misuse: Misuse::NeverResumed,
            })
        })
    }
}

/// Routes a load continuation back to its cell exactly once
///
/// Dropped without completing means the backend dropped the continuation:
/// the waiting caller fails instead of hanging.
struct LoadCompletion<V: SharedValue> {
    cell: Weak<PersistentReference<V>>,
    generation: u64,
    completed: bool,
}

impl<V: SharedValue> LoadCompletion<V> {
    fn complete(mut self, result: Result<LoadResult<V>, BackendError>) {
        self.completed = true;
        if let Some(cell) = self.cell.upgrade() {
            cell.finish_load(self.generation, result.map_err(SharedError::LoadFailed));
        }
    }
}

impl<V: SharedValue> Drop for LoadCompletion<V> {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        if let Some(cell) = self.cell.upgrade() {
            let description = cell.key().description();
            cell.finish_load(
                self.generation,
                Err(SharedError::ContinuationMisuse {
                    description,
                    misuse: Misuse::NeverResumed,
                }),
            );
        }
    }
}

struct SaveWaiter(Option<Waiter>);

impl SaveWaiter {
    fn send(mut self, outcome: Result<(), SharedError>) {
        if let Some(waiter) = self.0.take() {
            let _ = waiter.send(outcome);
        }
    }
}

impl<V: SharedValue> Drop for PersistentReference<V> {
    fn drop(&mut self) {
        if let Some(in_flight) = self.state.get_mut().in_flight.take() {
            in_flight.cancel();
        }
        if let Some(subscription) = self.subscription.get_mut().take() {
            subscription.cancel();
        }
        if let Some(registry) = self.registry.upgrade() {
            PersistentReferences::release(&registry, &self.id);
        }
        debug!(id = ?self.id, "cell released");
    }
}

impl<V: SharedValue> Reference<V> for PersistentReference<V> {
    fn value(&self) -> V {
        self.state.lock().value.clone()
    }

    fn load_error(&self) -> Option<SharedError> {
        self.state.lock().load_error.clone()
    }

    fn save_error(&self) -> Option<SharedError> {
        self.state.lock().save_error.clone()
    }

    fn is_loading(&self) -> bool {
        self.state.lock().in_flight.is_some()
    }

    fn load(&self) -> BoxFuture<'static, Result<(), SharedError>> {
        let cell = self.this.upgrade();
        Box::pin(async move {
            match cell {
                Some(cell) => cell.load_explicitly().await,
                None => Err(SharedError::Cancelled),
            }
        })
    }

    fn observe(&self, listener: Listener<V>) -> SharedSubscription {
        self.listeners.register(listener)
    }

    fn identity(&self) -> Identity {
        Identity::root(self.token())
    }

    fn is_persisted(&self) -> bool {
        true
    }

    fn description(&self) -> String {
        self.key().description()
    }
}

impl<V: SharedValue> MutableReference<V> for PersistentReference<V> {
    fn with_lock_dyn(&self, body: &mut dyn FnMut(&mut V)) {
        let _mutation = self.mutation.lock();
        let mut value = self.state.lock().value.clone();
        body(&mut value);
        self.state.lock().value = value.clone();
        self.listeners.notify(&value);
        self.begin_save(&value, SaveContext::DidSet, None);
    }

    fn save(&self) -> BoxFuture<'static, Result<(), SharedError>> {
        let cell = self.this.upgrade();
        Box::pin(async move {
            match cell {
                Some(cell) => cell.save_explicitly().await,
                None => Err(SharedError::Cancelled),
            }
        })
    }

    fn as_reference(self: Arc<Self>) -> Arc<dyn Reference<V>> {
        self
    }
}
