//! Transfer progress listeners
//!
//! Progress is reported as `(current, total)` byte counts, with `total`
//! absent when the size is not known up front.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

type ProgressCallback = Arc<dyn Fn(u64, Option<u64>) + Send + Sync>;

/// Identifies a listener registered with [`ProgressListeners::add`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgressListenerId(u64);

#[derive(Default)]
struct ListenerList {
    next_id: u64,
    listeners: Vec<(ProgressListenerId, ProgressCallback)>,
}

/// Set of listeners subscribed to one request's progress
#[derive(Default)]
pub struct ProgressListeners {
    inner: Mutex<ListenerList>,
}

impl ProgressListeners {
    pub fn new() -> Self {
        Self::default()
    }

    fn list(&self) -> MutexGuard<'_, ListenerList> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribe to progress updates
    pub fn add<F>(&self, listener: F) -> ProgressListenerId
    where
        F: Fn(u64, Option<u64>) + Send + Sync + 'static,
    {
        let mut list = self.list();
        let id = ProgressListenerId(list.next_id);
        list.next_id += 1;
        list.listeners.push((id, Arc::new(listener)));
        id
    }

    /// Unsubscribe; returns `false` if the listener was not registered
    pub fn remove(&self, id: ProgressListenerId) -> bool {
        let mut list = self.list();
        let before = list.listeners.len();
        list.listeners.retain(|(listener_id, _)| *listener_id != id);
        list.listeners.len() != before
    }

    pub fn is_empty(&self) -> bool {
        self.list().listeners.is_empty()
    }

    /// Report progress to every listener, in subscription order
    ///
    /// Listeners run outside the internal lock and may add or remove
    /// listeners themselves.
    pub fn publish(&self, current: u64, total: Option<u64>) {
        let listeners: Vec<ProgressCallback> = self
            .list()
            .listeners
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(current, total);
        }
    }
}

impl fmt::Debug for ProgressListeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressListeners")
            .field("listeners", &self.list().listeners.len())
            .finish()
    }
}
