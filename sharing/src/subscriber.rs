//! Multi-shot update channel from a backend into a cell

use std::fmt;
use std::sync::Arc;

use crate::error::{into_backend_error, BackendError, BoxError};
use crate::key::LoadResult;

type Callback<V> = Arc<dyn Fn(Result<LoadResult<V>, BackendError>) + Send + Sync>;

/// Passed to `SharedReaderKey::subscribe` to feed external updates
///
/// Cheap to clone; every clone feeds the same cell. Once the cell is
/// released, yields are silently dropped.
pub struct SharedSubscriber<V> {
    callback: Callback<V>,
}

impl<V> SharedSubscriber<V> {
    /// Subscriber invoking `callback` for every yield
    pub fn new(callback: impl Fn(Result<LoadResult<V>, BackendError>) + Send + Sync + 'static) -> Self {
        Self {
            callback: Arc::new(callback),
        }
    }

    /// Yield an updated value
    pub fn yield_value(&self, value: V) {
        self.yield_with(Ok(LoadResult::NewValue(value)));
    }

    /// The external system no longer holds a value; reset to the initial value
    pub fn yield_initial_value(&self) {
        self.yield_with(Ok(LoadResult::InitialValue));
    }

    /// Yield an error; the cell keeps its value and latches a load error
    pub fn yield_error(&self, error: impl Into<BoxError>) {
        self.yield_with(Err(into_backend_error(error)));
    }

    pub fn yield_with(&self, result: Result<LoadResult<V>, BackendError>) {
        (self.callback)(result);
    }
}

impl<V> Clone for SharedSubscriber<V> {
    fn clone(&self) -> Self {
        Self {
            callback: Arc::clone(&self.callback),
        }
    }
}

impl<V> fmt::Debug for SharedSubscriber<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedSubscriber").finish_non_exhaustive()
    }
}
