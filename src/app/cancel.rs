//! Cooperative cancellation with guaranteed listener delivery
//!
//! A [`CancelableOperation`] carries a permanent cancellation flag, a started
//! flag, and an ordered list of cancel listeners, all guarded by one status
//! lock. Because starting and cancelling share that lock, "is it cancelled"
//! cannot change between a check and the action taken on it inside a
//! [`StatusGuard`]. That closes both races the executor cares about: a request
//! starting its transport after being cancelled, and a cancel landing before
//! the abort listener is registered.

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::debug;

/// Callback invoked once when an operation is cancelled
pub type CancelListener = Box<dyn FnOnce() + Send>;

/// Handle returned when registering a cancel listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
struct CancelState {
    cancelled: bool,
    started: bool,
    next_listener_id: u64,
    listeners: Vec<(ListenerId, CancelListener)>,
}

/// Cancellation state shared between a request and everyone who may cancel it
#[derive(Default)]
pub struct CancelableOperation {
    state: Mutex<CancelState>,
}

impl CancelableOperation {
    /// Create a fresh, not started, not cancelled operation
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the status lock
    ///
    /// Listeners run while this lock is held, so a listener must never call
    /// back into the same operation.
    pub fn lock_status(&self) -> StatusGuard<'_> {
        StatusGuard {
            state: self.state.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }

    /// Cancel the operation
    ///
    /// Idempotent: only the first call flips the flag and fires listeners.
    /// Returns `true` if this call performed the cancellation.
    pub fn cancel(&self) -> bool {
        self.lock_status().cancel()
    }

    /// Whether the operation has been cancelled
    pub fn is_cancelled(&self) -> bool {
        self.lock_status().is_cancelled()
    }

    /// Whether the operation has been started
    pub fn is_started(&self) -> bool {
        self.lock_status().is_started()
    }

    /// Register a listener to be called on cancellation
    ///
    /// If the operation is already cancelled the listener is invoked before
    /// this returns. Either way it runs exactly once.
    pub fn add_on_cancel_listener<F>(&self, listener: F) -> ListenerId
    where
        F: FnOnce() + Send + 'static,
    {
        self.lock_status().add_on_cancel_listener(listener)
    }

    /// Remove a listener that has not fired yet
    pub fn remove_on_cancel_listener(&self, id: ListenerId) -> bool {
        let mut status = self.lock_status();
        let before = status.state.listeners.len();
        status.state.listeners.retain(|(listener_id, _)| *listener_id != id);
        status.state.listeners.len() != before
    }
}

impl fmt::Debug for CancelableOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = self.lock_status();
        f.debug_struct("CancelableOperation")
            .field("cancelled", &status.state.cancelled)
            .field("started", &status.state.started)
            .field("listeners", &status.state.listeners.len())
            .finish()
    }
}

/// Held status lock of a [`CancelableOperation`]
pub struct StatusGuard<'a> {
    state: MutexGuard<'a, CancelState>,
}

impl StatusGuard<'_> {
    /// Whether the operation has been cancelled
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled
    }

    /// Whether the operation has been started
    pub fn is_started(&self) -> bool {
        self.state.started
    }

    /// Mark the operation started
    ///
    /// Returns `false` if it is cancelled or was already started; an operation
    /// starts at most once.
    pub fn mark_started(&mut self) -> bool {
        if self.state.cancelled || self.state.started {
            return false;
        }
        self.state.started = true;
        true
    }

    /// Register a cancel listener while holding the lock
    pub fn add_on_cancel_listener<F>(&mut self, listener: F) -> ListenerId
    where
        F: FnOnce() + Send + 'static,
    {
        let id = ListenerId(self.state.next_listener_id);
        self.state.next_listener_id += 1;

        if self.state.cancelled {
            listener();
        } else {
            self.state.listeners.push((id, Box::new(listener)));
        }
        id
    }

    /// Cancel while holding the lock, firing listeners in registration order
    pub fn cancel(&mut self) -> bool {
        if self.state.cancelled {
            return false;
        }
        self.state.cancelled = true;

        let listeners = std::mem::take(&mut self.state.listeners);
        debug!("Cancelling operation, notifying {} listeners", listeners.len());
        for (_, listener) in listeners {
            listener();
        }
        true
    }
}
