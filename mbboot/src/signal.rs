//! Typed event channels for single-threaded, event-driven components.
//!
//! A [`Signal`] is a cheaply clonable handle to a list of connected
//! callbacks. Components expose their signals by cloning the handle;
//! subscribers connect closures and keep the returned [`SlotId`] to
//! disconnect later. Everything runs on the thread that emits — there is
//! no queueing and no synchronization.
//!
//! Emission is re-entrancy safe: a handler may connect, disconnect or
//! trigger further emissions (including another exchange completing
//! synchronously) while the signal is being delivered. A handler that is
//! disconnected mid-emission is not called again in the same emission.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Identifies one connected callback so it can be disconnected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotId(u64);

struct SlotEntry<T> {
    id: u64,
    // Taken out while the callback runs so emit never holds the list
    // borrow across user code.
    callback: Option<Box<dyn FnMut(&T)>>,
}

struct SignalInner<T> {
    slots: RefCell<Vec<SlotEntry<T>>>,
    next_id: Cell<u64>,
}

/// A typed event channel with connect/disconnect lifecycle.
pub struct Signal<T> {
    inner: Rc<SignalInner<T>>,
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Signal<T> {
    /// Create a signal with no connected slots.
    pub fn new() -> Self {
        Self {
            inner: Rc::new(SignalInner {
                slots: RefCell::new(Vec::new()),
                next_id: Cell::new(1),
            }),
        }
    }

    /// Connect a callback; it stays connected until [`disconnect`] is
    /// called with the returned id.
    ///
    /// [`disconnect`]: Signal::disconnect
    pub fn connect<F>(&self, callback: F) -> SlotId
    where
        F: FnMut(&T) + 'static,
    {
        let id = self.inner.next_id.get();
        self.inner.next_id.set(id + 1);
        self.inner.slots.borrow_mut().push(SlotEntry {
            id,
            callback: Some(Box::new(callback)),
        });
        SlotId(id)
    }

    /// Disconnect a previously connected callback.
    ///
    /// Returns `false` if the slot was already disconnected.
    pub fn disconnect(&self, id: SlotId) -> bool {
        let mut slots = self.inner.slots.borrow_mut();
        let before = slots.len();
        slots.retain(|entry| entry.id != id.0);
        slots.len() != before
    }

    /// Number of currently connected slots.
    pub fn connected_count(&self) -> usize {
        self.inner.slots.borrow().len()
    }

    /// Deliver `value` to every slot connected at the start of the
    /// emission (snapshot semantics).
    pub fn emit(&self, value: &T) {
        let ids: Vec<u64> = self
            .inner
            .slots
            .borrow()
            .iter()
            .map(|entry| entry.id)
            .collect();

        for id in ids {
            let taken = {
                let mut slots = self.inner.slots.borrow_mut();
                slots
                    .iter_mut()
                    .find(|entry| entry.id == id)
                    .and_then(|entry| entry.callback.take())
            };

            if let Some(mut callback) = taken {
                callback(value);

                // Put the callback back unless the handler disconnected
                // itself while running.
                let mut slots = self.inner.slots.borrow_mut();
                if let Some(entry) = slots.iter_mut().find(|entry| entry.id == id) {
                    if entry.callback.is_none() {
                        entry.callback = Some(callback);
                    }
                }
            }
        }
    }
}

impl<T> std::fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("slots", &self.connected_count())
            .finish()
    }
}
