//! Observing handles: callbacks and async streams of values

use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

use crate::key::SharedValue;
use crate::reference::Listener;
use crate::subscription::SharedSubscription;

/// Handles whose value changes can be observed
pub trait SharedObservable<V: SharedValue> {
    /// Call `listener` after every change, until the subscription is dropped
    ///
    /// The listener runs synchronously on the thread that made the change and
    /// outside every internal lock, so it may read or mutate the handle.
    fn observe(&self, listener: impl Fn(&V) + Send + Sync + 'static) -> SharedSubscription;

    /// Stream of values: the current one first, then every change
    fn stream(&self) -> SharedStream<V>;
}

/// Async stream of a handle's values
///
/// Unbounded: values are queued until consumed. Dropping the stream stops
/// observation.
pub struct SharedStream<V> {
    receiver: mpsc::UnboundedReceiver<V>,
    _subscription: SharedSubscription,
}

impl<V: SharedValue> SharedStream<V> {
    pub(crate) fn new(current: V, subscribe: impl FnOnce(Listener<V>) -> SharedSubscription) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let _ = sender.send(current);
        let subscription = subscribe(Arc::new(move |value: &V| {
            let _ = sender.send(value.clone());
        }));
        Self {
            receiver,
            _subscription: subscription,
        }
    }

    /// Wait for the next value
    pub async fn next_value(&mut self) -> Option<V> {
        self.receiver.recv().await
    }

    /// Next queued value, if any, without waiting
    pub fn try_next_value(&mut self) -> Option<V> {
        self.receiver.try_recv().ok()
    }

    /// Every value queued so far
    pub fn drain(&mut self) -> Vec<V> {
        std::iter::from_fn(|| self.try_next_value()).collect()
    }
}

impl<V> Stream for SharedStream<V> {
    type Item = V;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<V>> {
        self.receiver.poll_recv(cx)
    }
}
