//! Observer registration with handle-scoped lifetimes
//!
//! Observers are registered against a set and notified synchronously, in
//! registration order, on the notifying caller's context. Registration
//! returns a handle; dropping the handle unregisters the observer. This
//! replaces weak-reference observer tables: there is no epoch compaction
//! and no silently dead entries.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

type Entries<T> = Mutex<Vec<(u64, Arc<T>)>>;

/// An ordered set of observers of type `T` (usually a `dyn` trait object).
pub struct ObserverSet<T: ?Sized> {
    entries: Arc<Entries<T>>,
    next_id: AtomicU64,
}

impl<T: ?Sized> ObserverSet<T> {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(Vec::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register an observer. It stays registered until the returned handle
    /// is dropped.
    pub fn add(&self, observer: Arc<T>) -> ObserverHandle<T> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut entries) = self.entries.lock() {
            entries.push((id, observer));
        }
        ObserverHandle {
            id,
            entries: Arc::downgrade(&self.entries),
        }
    }

    /// Snapshot the registered observers in registration order.
    ///
    /// Notification happens on the snapshot, so an observer that
    /// unregisters during fan-out may still receive the in-flight
    /// notification.
    pub fn snapshot(&self) -> Vec<Arc<T>> {
        self.entries
            .lock()
            .map(|entries| entries.iter().map(|(_, o)| Arc::clone(o)).collect())
            .unwrap_or_default()
    }

    /// Notify every registered observer, in registration order.
    pub fn notify(&self, mut f: impl FnMut(&T)) {
        for observer in self.snapshot() {
            f(&observer);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: ?Sized> Default for ObserverSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized> std::fmt::Debug for ObserverSet<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverSet").field("len", &self.len()).finish()
    }
}

/// Registration handle returned by [`ObserverSet::add`].
///
/// Dropping the handle removes the observer from the set. If the set was
/// dropped first, dropping the handle is a no-op.
pub struct ObserverHandle<T: ?Sized> {
    id: u64,
    entries: Weak<Entries<T>>,
}

impl<T: ?Sized> Drop for ObserverHandle<T> {
    fn drop(&mut self) {
        if let Some(entries) = self.entries.upgrade() {
            if let Ok(mut entries) = entries.lock() {
                entries.retain(|(id, _)| *id != self.id);
            }
        }
    }
}

impl<T: ?Sized> std::fmt::Debug for ObserverHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverHandle").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    trait Counter: Send + Sync {
        fn bump(&self);
    }

    struct Tally(AtomicUsize);

    impl Counter for Tally {
        fn bump(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn notifies_in_registration_order() {
        let set: ObserverSet<Mutex<Vec<u32>>> = ObserverSet::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let first = Arc::new(Mutex::new(vec![1]));
        let second = Arc::new(Mutex::new(vec![2]));
        let _h1 = set.add(Arc::clone(&first));
        let _h2 = set.add(Arc::clone(&second));

        set.notify(|slot| {
            let tag = slot.lock().unwrap()[0];
            order.lock().unwrap().push(tag);
        });
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn dropping_handle_unregisters() {
        let set: ObserverSet<dyn Counter> = ObserverSet::new();
        let tally = Arc::new(Tally(AtomicUsize::new(0)));

        let handle = set.add(Arc::clone(&tally) as Arc<dyn Counter>);
        set.notify(|o| o.bump());
        assert_eq!(tally.0.load(Ordering::SeqCst), 1);

        drop(handle);
        set.notify(|o| o.bump());
        assert_eq!(tally.0.load(Ordering::SeqCst), 1);
        assert!(set.is_empty());
    }
}
