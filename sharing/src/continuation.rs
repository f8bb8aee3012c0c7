//! One-shot completion handles
//!
//! A continuation is passed to `SharedReaderKey::load` and `SharedKey::save`
//! so a backend can report completion synchronously or from any thread,
//! later.
//!
//! A resume method must be called exactly once on every path:
//!
//! - resuming more than once is a logic error; only the first call takes
//!   effect and the rest are reported through [`crate::diagnostics`];
//! - never resuming leaves whoever awaits the operation suspended; it is
//!   reported when the last clone of the continuation is dropped, unless the
//!   operation was cancelled first.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::diagnostics::report_issue;
use crate::error::{into_backend_error, BackendError, BoxError, Misuse, SharedError};
use crate::key::LoadResult;

type Callback<T> = Box<dyn FnOnce(Result<T, BackendError>) + Send>;

/// Continuation passed to `load`
pub type LoadContinuation<V> = SharedContinuation<LoadResult<V>>;

/// Continuation passed to `save`
pub type SaveContinuation = SharedContinuation<()>;

/// Exactly-once completion handle
///
/// Clones share the same state: resuming any clone counts for all of them.
pub struct SharedContinuation<T> {
    inner: Arc<ContinuationBox<T>>,
}

struct ContinuationBox<T> {
    callback: Mutex<Option<Callback<T>>>,
    description: String,
    resume_count: AtomicUsize,
    cancelled: Arc<AtomicBool>,
}

impl<T: Send + 'static> SharedContinuation<T> {
    /// Continuation invoking `callback` on the first resume
    ///
    /// `description` names the key in diagnostics; empty means "A shared key".
    pub fn new(
        description: impl Into<String>,
        callback: impl FnOnce(Result<T, BackendError>) + Send + 'static,
    ) -> Self {
        Self::with_cancellation(description, Arc::new(AtomicBool::new(false)), callback)
    }

    pub(crate) fn with_cancellation(
        description: impl Into<String>,
        cancelled: Arc<AtomicBool>,
        callback: impl FnOnce(Result<T, BackendError>) + Send + 'static,
    ) -> Self {
        let description = description.into();
        let description = if description.is_empty() {
            "A shared key".to_string()
        } else {
            format!("'{description}'")
        };
        Self {
            inner: Arc::new(ContinuationBox {
                callback: Mutex::new(Some(Box::new(callback))),
                description,
                resume_count: AtomicUsize::new(0),
                cancelled,
            }),
        }
    }

    /// Complete successfully
    pub fn resume_returning(&self, value: T) {
        self.resume_with(Ok(value));
    }

    /// Complete with an error
    pub fn resume_throwing(&self, error: impl Into<BoxError>) {
        self.resume_with(Err(into_backend_error(error)));
    }

    /// Complete with either outcome
    pub fn resume_with(&self, result: Result<T, BackendError>) {
        let resume_count = self.inner.resume_count.fetch_add(1, Ordering::SeqCst) + 1;
        if resume_count != 1 {
            report_issue(SharedError::ContinuationMisuse {
                description: self.inner.description.clone(),
                misuse: Misuse::ResumedMoreThanOnce,
            });
            return;
        }
        let callback = self.inner.callback.lock().take();
        if let Some(callback) = callback {
            callback(result);
        }
    }

    /// Whether the operation this continuation completes was superseded or
    /// its reference released. Backends may stop work early when set; a
    /// cancelled continuation may be dropped without resuming.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_resumed(&self) -> bool {
        self.inner.resume_count.load(Ordering::SeqCst) > 0
    }

    #[must_use]
    pub fn description(&self) -> &str {
        &self.inner.description
    }
}

impl SharedContinuation<()> {
    /// Complete a save successfully
    pub fn resume(&self) {
        self.resume_returning(());
    }
}

impl<V: Send + 'static> SharedContinuation<LoadResult<V>> {
    /// Complete a load with a fresh value
    pub fn resume_returning_value(&self, value: V) {
        self.resume_returning(LoadResult::NewValue(value));
    }

    /// Complete a load with "no value; keep the initial value"
    pub fn resume_returning_initial_value(&self) {
        self.resume_returning(LoadResult::InitialValue);
    }
}

impl<T> Clone for SharedContinuation<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Drop for ContinuationBox<T> {
    fn drop(&mut self) {
        let resumed = *self.resume_count.get_mut() > 0;
        if !resumed && !self.cancelled.load(Ordering::SeqCst) {
            report_issue(SharedError::ContinuationMisuse {
                description: std::mem::take(&mut self.description),
                misuse: Misuse::NeverResumed,
            });
        }
    }
}

impl<T> fmt::Debug for SharedContinuation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedContinuation")
            .field("description", &self.inner.description)
            .field("resume_count", &self.inner.resume_count.load(Ordering::SeqCst))
            .field("cancelled", &self.inner.cancelled.load(Ordering::SeqCst))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::subscribe_issues;

    #[test]
    fn test_first_resume_wins() {
        let mut issues = subscribe_issues();
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        let continuation: SharedContinuation<i32> = SharedContinuation::new("unit-first-resume-wins", move |result| {
            sink.lock().push(result.map_err(|e| e.to_string()));
        });

        continuation.resume_returning(1);
        continuation.clone().resume_returning(2);
        continuation.resume_throwing("late failure");

        assert_eq!(*received.lock(), vec![Ok(1)]);
        let misuse = issues.drain_matching("unit-first-resume-wins");
        assert_eq!(misuse.len(), 2);
        assert!(matches!(
            misuse[0],
            SharedError::ContinuationMisuse {
                misuse: Misuse::ResumedMoreThanOnce,
                ..
            }
        ));
    }

    #[test]
    fn test_drop_without_resume_reports_leak() {
        let mut issues = subscribe_issues();
        let continuation: SaveContinuation = SharedContinuation::new("unit-leaky", |_| {});
        let clone = continuation.clone();
        drop(continuation);
        assert!(issues.drain_matching("unit-leaky").is_empty());
        drop(clone);

        let leaked = issues.drain_matching("unit-leaky");
        assert_eq!(leaked.len(), 1);
        assert!(matches!(
            leaked[0],
            SharedError::ContinuationMisuse {
                misuse: Misuse::NeverResumed,
                ..
            }
        ));
    }

    #[test]
    fn test_cancelled_drop_is_silent() {
        let mut issues = subscribe_issues();
        let flag = Arc::new(AtomicBool::new(false));
        let continuation: LoadContinuation<i32> =
            SharedContinuation::with_cancellation("unit-cancelled", Arc::clone(&flag), |_| {});
        flag.store(true, Ordering::SeqCst);
        assert!(continuation.is_cancelled());
        drop(continuation);
        assert!(issues.drain_matching("unit-cancelled").is_empty());
    }

    #[test]
    fn test_empty_description() {
        let continuation: SaveContinuation = SharedContinuation::new("", |_| {});
        assert_eq!(continuation.description(), "A shared key");
        continuation.resume();
    }
}
