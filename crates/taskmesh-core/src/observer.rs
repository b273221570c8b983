use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::error;

/// Handle returned by [`ObserverList::subscribe`].
pub type SubscriptionId = u64;

/// A subscriber callback.
pub type Observer<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// A list of callbacks with isolated-failure fan-out.
///
/// `notify` iterates over a snapshot taken under the lock, so callbacks may
/// subscribe or unsubscribe re-entrantly. A callback that panics is logged and
/// skipped; the remaining subscribers still receive the event.
pub struct ObserverList<E> {
    name: &'static str,
    next_id: AtomicU64,
    observers: Mutex<Vec<(SubscriptionId, Observer<E>)>>,
}

impl<E> ObserverList<E> {
    /// Create an empty list. `name` tags log lines from failing subscribers.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            next_id: AtomicU64::new(1),
            observers: Mutex::new(Vec::new()),
        }
    }

    /// Register a callback and return its id.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.observers.lock().push((id, Arc::new(callback)));
        id
    }

    /// Remove a callback. Returns false if the id was unknown.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut observers = self.observers.lock();
        let before = observers.len();
        observers.retain(|(sid, _)| *sid != id);
        observers.len() != before
    }

    /// Number of live subscriptions.
    pub fn len(&self) -> usize {
        self.observers.lock().len()
    }

    /// Whether nobody is subscribed.
    pub fn is_empty(&self) -> bool {
        self.observers.lock().is_empty()
    }

    /// Deliver `event` to every subscriber. Returns how many callbacks panicked.
    pub fn notify(&self, event: &E) -> usize {
        let snapshot: Vec<(SubscriptionId, Observer<E>)> = self.observers.lock().clone();
        let mut failures = 0;
        for (id, callback) in snapshot {
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                failures += 1;
                error!(observer = self.name, subscription_id = id, "Subscriber panicked");
            }
        }
        failures
    }
}

impl<E> Default for ObserverList<E> {
    fn default() -> Self {
        Self::new("observer")
    }
}

impl<E> std::fmt::Debug for ObserverList<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverList")
            .field("name", &self.name)
            .field("subscribers", &self.len())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_failing_subscriber_is_isolated() {
        let list: ObserverList<u32> = ObserverList::new("test");
        let hits = Arc::new(AtomicUsize::new(0));

        let h1 = hits.clone();
        list.subscribe(move |_| {
            h1.fetch_add(1, Ordering::SeqCst);
        });
        list.subscribe(|_| panic!("subscriber failure"));
        let h2 = hits.clone();
        list.subscribe(move |v| {
            h2.fetch_add(*v as usize, Ordering::SeqCst);
        });

        let failures = list.notify(&10);
        assert_eq!(failures, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn test_unsubscribe() {
        let list: ObserverList<()> = ObserverList::default();
        let id = list.subscribe(|_| {});
        assert_eq!(list.len(), 1);
        assert!(list.unsubscribe(id));
        assert!(!list.unsubscribe(id));
        assert!(list.is_empty());
    }

    #[test]
    fn test_reentrant_subscribe_during_notify() {
        let list: Arc<ObserverList<()>> = Arc::new(ObserverList::new("reentrant"));
        let inner = list.clone();
        list.subscribe(move |_| {
            inner.subscribe(|_| {});
        });
        list.notify(&());
        assert_eq!(list.len(), 2);
    }
}
