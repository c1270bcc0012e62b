//! Observer registration with explicit disposal.
//!
//! Callers register a callback and get back an [`ObserverHandle`]; dropping
//! the handle keeps the observer alive, calling [`ObserverHandle::dispose`]
//! removes it. Disposal is idempotent and safe concurrently with a
//! notification pass (a callback already snapshotted for the pass may fire
//! one last time).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Slots<T: ?Sized> {
    next_id: AtomicU64,
    entries: parking_lot::Mutex<Vec<(u64, Callback<T>)>>,
}

pub struct ObserverSet<T: ?Sized> {
    slots: Arc<Slots<T>>,
}

impl<T: ?Sized> Clone for ObserverSet<T> {
    fn clone(&self) -> Self {
        Self {
            slots: self.slots.clone(),
        }
    }
}

impl<T: ?Sized + 'static> Default for ObserverSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized + 'static> ObserverSet<T> {
    pub fn new() -> Self {
        Self {
            slots: Arc::new(Slots {
                next_id: AtomicU64::new(0),
                entries: parking_lot::Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn register(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> ObserverHandle {
        let id = self.slots.next_id.fetch_add(1, Ordering::Relaxed);
        self.slots.entries.lock().push((id, Arc::new(callback)));
        let slots: Weak<Slots<T>> = Arc::downgrade(&self.slots);
        ObserverHandle {
            disposer: parking_lot::Mutex::new(Some(Box::new(move || {
                if let Some(slots) = slots.upgrade() {
                    slots.entries.lock().retain(|(sid, _)| *sid != id);
                }
            }))),
        }
    }

    /// Invokes every registered callback in registration order. Callbacks
    /// run outside the registry lock, so they may register or dispose
    /// observers without deadlocking.
    pub fn notify(&self, value: &T) {
        let snapshot: Vec<Callback<T>> = self
            .slots
            .entries
            .lock()
            .iter()
            .map(|(_, callback)| callback.clone())
            .collect();
        for callback in snapshot {
            callback(value);
        }
    }
}

pub struct ObserverHandle {
    disposer: parking_lot::Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl ObserverHandle {
    /// Stops further delivery. Calling it again is a no-op.
    pub fn dispose(&self) {
        if let Some(disposer) = self.disposer.lock().take() {
            disposer();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn observers_fire_in_registration_order() {
        let set: ObserverSet<u32> = ObserverSet::new();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let first = {
            let seen = seen.clone();
            set.register(move |v| seen.lock().push(("first", *v)))
        };
        let second = {
            let seen = seen.clone();
            set.register(move |v| seen.lock().push(("second", *v)))
        };
        set.notify(&7);
        assert_eq!(*seen.lock(), vec![("first", 7), ("second", 7)]);
        first.dispose();
        second.dispose();
    }

    #[test]
    fn dispose_stops_delivery_and_is_idempotent() {
        let set: ObserverSet<u32> = ObserverSet::new();
        let count = Arc::new(AtomicUsize::new(0));
        let handle = {
            let count = count.clone();
            set.register(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };
        set.notify(&1);
        handle.dispose();
        handle.dispose();
        set.notify(&2);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropping_the_handle_keeps_the_observer() {
        let set: ObserverSet<u32> = ObserverSet::new();
        let count = Arc::new(AtomicUsize::new(0));
        {
            let count = count.clone();
            drop(set.register(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            }));
        }
        set.notify(&1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn callbacks_may_register_without_deadlocking() {
        let set: ObserverSet<u32> = ObserverSet::new();
        let inner = set.clone();
        let handle = set.register(move |_| {
            inner.register(|_| {}).dispose();
        });
        set.notify(&1);
        handle.dispose();
    }

    #[test]
    fn slices_work_as_notification_payloads() {
        let set: ObserverSet<[u8]> = ObserverSet::new();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let handle = {
            let seen = seen.clone();
            set.register(move |values: &[u8]| seen.lock().extend_from_slice(values))
        };
        set.notify(&[1, 2, 3][..]);
        assert_eq!(*seen.lock(), vec![1, 2, 3]);
        handle.dispose();
    }
}
