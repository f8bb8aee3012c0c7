//! Cancellable registration for external-change notifications

use parking_lot::Mutex;
use std::fmt;

type OnCancel = Box<dyn FnOnce() + Send>;

/// A subscription to a key's updates
///
/// Returned from `SharedReaderKey::subscribe`. The backend keeps feeding
/// updates until [`cancel`](Self::cancel) is called or the subscription is
/// dropped. The cancel closure runs at most once.
pub struct SharedSubscription {
    on_cancel: Mutex<Option<OnCancel>>,
}

impl SharedSubscription {
    /// Subscription that runs `on_cancel` when cancelled or dropped
    pub fn new(on_cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            on_cancel: Mutex::new(Some(Box::new(on_cancel))),
        }
    }

    /// Subscription with nothing to tear down
    #[must_use]
    pub fn empty() -> Self {
        Self {
            on_cancel: Mutex::new(None),
        }
    }

    /// Cancel the subscription
    pub fn cancel(&self) {
        // Take the closure out first so a re-entrant cancel sees `None`
        let on_cancel = self.on_cancel.lock().take();
        if let Some(on_cancel) = on_cancel {
            on_cancel();
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.on_cancel.lock().is_some()
    }
}

impl Drop for SharedSubscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl fmt::Debug for SharedSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedSubscription")
            .field("active", &self.is_active())
            .finish()
    }
}
