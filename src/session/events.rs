//! Subscriber fan-out for session events.
//!
//! The session broadcasts state changes, errors and discovered devices to
//! every registered callback. Registration hands back a [`Subscription`]
//! whose `unsubscribe` removes exactly that one callback; dropping the
//! guard without calling it leaves the subscription alive.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// A set of callbacks for one event type.
pub struct Subscribers<T> {
    slots: Mutex<HashMap<u64, Callback<T>>>,
    next_id: Mutex<u64>,
}

impl<T> Default for Subscribers<T> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            next_id: Mutex::new(0),
        }
    }
}

impl<T> Subscribers<T> {
    fn insert(&self, callback: Callback<T>) -> u64 {
        let mut next_id = self.next_id.lock().unwrap();
        let id = *next_id;
        *next_id += 1;
        self.slots.lock().unwrap().insert(id, callback);
        id
    }

    fn remove(&self, id: u64) {
        self.slots.lock().unwrap().remove(&id);
    }

    /// Delivers `event` to every subscriber registered at the time of the
    /// call, exactly once each.
    ///
    /// The callbacks are snapshotted and invoked with the registry unlocked,
    /// so a callback may subscribe or unsubscribe (including itself) without
    /// blocking the delivery.
    pub fn emit(&self, event: &T) {
        let snapshot: Vec<Callback<T>> = self.slots.lock().unwrap().values().cloned().collect();
        for callback in snapshot {
            callback(event);
        }
    }

    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(&T) + Send + Sync + 'static,
    ) -> Subscription
    where
        T: 'static,
        Self: Send + Sync,
    {
        let id = self.insert(Arc::new(callback));
        let registry = Arc::clone(self);
        Subscription {
            cancel: Some(Box::new(move || registry.remove(id))),
        }
    }
}

/// Handle returned by a subscription; removes exactly its own callback.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Removes the associated callback from the registry.
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn every_subscriber_sees_the_event_once() {
        let registry: Arc<Subscribers<u32>> = Arc::new(Subscribers::default());
        let first = Arc::new(AtomicU32::new(0));
        let second = Arc::new(AtomicU32::new(0));

        let first_in_cb = first.clone();
        let _a = registry.subscribe(move |v| {
            first_in_cb.fetch_add(*v, Ordering::SeqCst);
        });
        let second_in_cb = second.clone();
        let _b = registry.subscribe(move |v| {
            second_in_cb.fetch_add(*v, Ordering::SeqCst);
        });

        registry.emit(&7);
        assert_eq!(first.load(Ordering::SeqCst), 7);
        assert_eq!(second.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn unsubscribe_removes_only_itself() {
        let registry: Arc<Subscribers<u32>> = Arc::new(Subscribers::default());
        let kept = Arc::new(AtomicU32::new(0));
        let removed = Arc::new(AtomicU32::new(0));

        let kept_in_cb = kept.clone();
        let _keep = registry.subscribe(move |_| {
            kept_in_cb.fetch_add(1, Ordering::SeqCst);
        });
        let removed_in_cb = removed.clone();
        let gone = registry.subscribe(move |_| {
            removed_in_cb.fetch_add(1, Ordering::SeqCst);
        });

        registry.emit(&1);
        gone.unsubscribe();
        registry.emit(&1);

        assert_eq!(kept.load(Ordering::SeqCst), 2);
        assert_eq!(removed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn callback_can_unsubscribe_itself_during_delivery() {
        let registry: Arc<Subscribers<u32>> = Arc::new(Subscribers::default());
        let calls = Arc::new(AtomicU32::new(0));
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let calls_in_cb = calls.clone();
        let slot_in_cb = slot.clone();
        let sub = registry.subscribe(move |_| {
            calls_in_cb.fetch_add(1, Ordering::SeqCst);
            if let Some(own) = slot_in_cb.lock().unwrap().take() {
                own.unsubscribe();
            }
        });
        *slot.lock().unwrap() = Some(sub);

        // One-shot semantics: the first delivery removes the callback, the
        // second must not reach it, and neither may block.
        registry.emit(&1);
        registry.emit(&2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn callback_can_subscribe_another_during_delivery() {
        let registry: Arc<Subscribers<u32>> = Arc::new(Subscribers::default());
        let late_calls = Arc::new(AtomicU32::new(0));

        let registry_in_cb = registry.clone();
        let late_in_cb = late_calls.clone();
        let _first = registry.subscribe(move |_| {
            let late = late_in_cb.clone();
            // Dropping the guard keeps the registration alive; only an
            // explicit unsubscribe removes it.
            let _ = registry_in_cb.subscribe(move |_| {
                late.fetch_add(1, Ordering::SeqCst);
            });
        });

        registry.emit(&1);
        // The newcomer was not part of the first delivery's snapshot.
        assert_eq!(late_calls.load(Ordering::SeqCst), 0);
        registry.emit(&2);
        assert!(late_calls.load(Ordering::SeqCst) >= 1);
    }
}
