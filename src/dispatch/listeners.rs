//! Ordered listener lists with capability-style unsubscribe handles
//!
//! Listeners are stored with a stable id so removal never disturbs the order of
//! the others. Emission works on a snapshot of the list, so a listener may add
//! or remove listeners (itself included) while it is running.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::error;

/// A registered callback
pub type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Table<T: ?Sized> {
    next_id: u64,
    entries: Vec<(u64, Listener<T>)>,
}

/// An ordered, shareable list of listeners for values of type `T`
pub struct Listeners<T: ?Sized> {
    table: Arc<Mutex<Table<T>>>,
}

impl<T: ?Sized + 'static> Listeners<T> {
    pub fn new() -> Self {
        Self {
            table: Arc::new(Mutex::new(Table {
                next_id: 0,
                entries: Vec::new(),
            })),
        }
    }

    /// Append a listener; it runs after every listener already registered
    pub fn add(&self, listener: Listener<T>) -> Subscription {
        let id = {
            let mut table = lock(&self.table);
            let id = table.next_id;
            table.next_id += 1;
            table.entries.push((id, listener));
            id
        };

        let table: Weak<Mutex<Table<T>>> = Arc::downgrade(&self.table);
        Subscription::new(move || {
            if let Some(table) = table.upgrade() {
                lock(&table).entries.retain(|(entry_id, _)| *entry_id != id);
            }
        })
    }

    pub fn len(&self) -> usize {
        lock(&self.table).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the current listeners, in registration order
    pub fn snapshot(&self) -> Vec<Listener<T>> {
        lock(&self.table)
            .entries
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect()
    }

    /// Invoke every listener with `value`; returns how many were invoked
    pub fn emit(&self, value: &T) -> usize {
        let listeners = self.snapshot();
        for listener in &listeners {
            invoke_isolated(listener, value);
        }
        listeners.len()
    }
}

impl<T: ?Sized + 'static> Default for Listeners<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized> Clone for Listeners<T> {
    fn clone(&self) -> Self {
        Self {
            table: Arc::clone(&self.table),
        }
    }
}

/// Run a listener, logging instead of unwinding into the caller if it panics
fn invoke_isolated<T: ?Sized>(listener: &Listener<T>, value: &T) {
    if catch_unwind(AssertUnwindSafe(|| listener(value))).is_err() {
        error!("Listener panicked; continuing with remaining listeners");
    }
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Subscription
// ============================================================================

type Cancel = Box<dyn FnOnce() + Send>;

/// Handle returned by every registration
///
/// Calling [`Subscription::unsubscribe`] removes the listener. It is safe to
/// call more than once. Dropping the handle does not unsubscribe.
pub struct Subscription {
    cancel: Mutex<Option<Cancel>>,
}

impl Subscription {
    fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Mutex::new(Some(Box::new(cancel))),
        }
    }

    /// Remove the listener this handle was returned for
    pub fn unsubscribe(&self) {
        let cancel = lock(&self.cancel).take();
        if let Some(cancel) = cancel {
            cancel();
        }
    }

    /// Whether `unsubscribe` has already run
    pub fn is_cancelled(&self) -> bool {
        lock(&self.cancel).is_none()
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
