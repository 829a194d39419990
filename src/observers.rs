//! Explicit observer lists
//!
//! Callbacks are registered and unregistered by id and invoked in
//! registration order. Notification runs on a snapshot of the list, so an
//! observer may unregister itself (or others) while being notified.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Lock a std mutex, recovering the data if a panicking holder poisoned it
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle returned by [`ObserverList::register`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

type Observer<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Ordered list of callbacks receiving `&T`
pub struct ObserverList<T> {
    next_id: AtomicU64,
    observers: Mutex<Vec<(ObserverId, Observer<T>)>>,
}

impl<T> ObserverList<T> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            observers: Mutex::new(Vec::new()),
        }
    }

    pub fn register<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        lock_unpoisoned(&self.observers).push((id, Arc::new(observer)));
        id
    }

    /// Returns false if the id was not registered
    pub fn unregister(&self, id: ObserverId) -> bool {
        let mut observers = lock_unpoisoned(&self.observers);
        let before = observers.len();
        observers.retain(|(existing, _)| *existing != id);
        observers.len() != before
    }

    /// Invoke every observer in registration order
    pub fn notify(&self, event: &T) {
        let snapshot: Vec<Observer<T>> = lock_unpoisoned(&self.observers)
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect();

        for observer in snapshot {
            observer(event);
        }
    }

    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.observers).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        lock_unpoisoned(&self.observers).clear();
    }
}

impl<T> Default for ObserverList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for ObserverList<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverList")
            .field("observers", &self.len())
            .finish()
    }
}
