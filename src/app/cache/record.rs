//! In-flight download records and caller handles
//!
//! Every `get` returns its own [`CacheHandle`]. Handles of callers asking for
//! the same key while a download is running share that download's request, so
//! cancelling through any of them cancels it for all. Each handle completes
//! exactly once with a [`CacheOutcome`].

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use crate::app::progress::ProgressListenerId;
use crate::app::request::{RequestSpec, WebRequest};
use crate::app::translate::FileTranslator;
use crate::errors::DownloadFailure;

/// Request type used for cache downloads
pub type DownloadRequest = WebRequest<FileTranslator>;

/// Callback receiving the outcome of a cache lookup
pub type CacheListener = Box<dyn FnOnce(CacheOutcome) + Send>;

/// Result of a cache lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheOutcome {
    /// The resource is available at this local path
    Ready(PathBuf),
    /// The download failed; no local file exists
    Failed(DownloadFailure),
}

impl CacheOutcome {
    pub fn is_ready(&self) -> bool {
        matches!(self, CacheOutcome::Ready(_))
    }

    /// Local path, if the lookup succeeded
    pub fn path(&self) -> Option<&Path> {
        match self {
            CacheOutcome::Ready(path) => Some(path),
            CacheOutcome::Failed(_) => None,
        }
    }

    pub fn into_result(self) -> Result<PathBuf, DownloadFailure> {
        match self {
            CacheOutcome::Ready(path) => Ok(path),
            CacheOutcome::Failed(failure) => Err(failure),
        }
    }
}

/// Identifies a listener registered with [`CacheHandle::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
struct HandleState {
    outcome: Option<CacheOutcome>,
    next_id: u64,
    listeners: Vec<(SubscriptionId, CacheListener)>,
}

#[derive(Default)]
struct HandleShared {
    state: Mutex<HandleState>,
    completed: Notify,
}

/// A caller's view of one cache lookup
#[derive(Clone)]
pub struct CacheHandle {
    shared: Arc<HandleShared>,
    download: Option<Arc<DownloadRequest>>,
}

impl CacheHandle {
    /// Handle waiting on an in-flight download
    pub(crate) fn pending(download: Arc<DownloadRequest>) -> Self {
        Self {
            shared: Arc::default(),
            download: Some(download),
        }
    }

    /// Handle that is complete from the start
    pub(crate) fn completed(outcome: CacheOutcome) -> Self {
        let handle = Self {
            shared: Arc::default(),
            download: None,
        };
        handle.state().outcome = Some(outcome);
        handle
    }

    fn state(&self) -> MutexGuard<'_, HandleState> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_completed(&self) -> bool {
        self.state().outcome.is_some()
    }

    /// Whether the underlying download has started (or the lookup is done)
    pub fn is_started(&self) -> bool {
        self.is_completed()
            || self
                .download
                .as_ref()
                .map_or(false, |download| download.operation().is_started())
    }

    /// Cancel the underlying download for every caller sharing it
    ///
    /// Returns `false` if there is nothing to cancel or it was already
    /// cancelled.
    pub fn cancel(&self) -> bool {
        match &self.download {
            Some(download) if !self.is_completed() => download.cancel(),
            _ => false,
        }
    }

    /// Register a listener for the outcome
    ///
    /// Runs immediately on the calling thread if the handle is already
    /// complete.
    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: FnOnce(CacheOutcome) + Send + 'static,
    {
        let mut state = self.state();
        let id = SubscriptionId(state.next_id);
        state.next_id += 1;

        match state.outcome.clone() {
            Some(outcome) => {
                drop(state);
                listener(outcome);
            }
            None => state.listeners.push((id, Box::new(listener))),
        }
        id
    }

    /// Remove a listener that has not run yet
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut state = self.state();
        let before = state.listeners.len();
        state.listeners.retain(|(listener_id, _)| *listener_id != id);
        state.listeners.len() != before
    }

    /// Subscribe to progress of the underlying download
    ///
    /// Returns `None` for lookups served from disk, which have no download.
    pub fn add_progress_listener<F>(&self, listener: F) -> Option<ProgressListenerId>
    where
        F: Fn(u64, Option<u64>) + Send + Sync + 'static,
    {
        self.download
            .as_ref()
            .map(|download| download.add_progress_listener(listener))
    }

    /// Outcome, if complete
    pub fn outcome(&self) -> Option<CacheOutcome> {
        self.state().outcome.clone()
    }

    /// Wait for the outcome
    pub async fn wait(&self) -> CacheOutcome {
        loop {
            let notified = self.shared.completed.notified();
            if let Some(outcome) = self.outcome() {
                return outcome;
            }
            notified.await;
        }
    }

    /// Complete the handle and run its listeners, once
    pub(crate) fn complete(&self, outcome: CacheOutcome) -> bool {
        let listeners = {
            let mut state = self.state();
            if state.outcome.is_some() {
                return false;
            }
            state.outcome = Some(outcome.clone());
            std::mem::take(&mut state.listeners)
        };
        for (_, listener) in listeners {
            listener(outcome.clone());
        }
        self.shared.completed.notify_waiters();
        true
    }
}

impl fmt::Debug for CacheHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheHandle")
            .field("outcome", &self.outcome())
            .field("shared_download", &self.download.is_some())
            .finish()
    }
}

/// Transient state of a key with a download in flight
///
/// Once the download finishes, the record stays in place while its outcome is
/// handed to the waiters, and the key accepts no other transition until then.
pub(crate) struct DownloadRecord {
    pub request: Arc<DownloadRequest>,
    pub started_at: DateTime<Utc>,
    waiters: Vec<CacheHandle>,
    delivering: Option<CacheOutcome>,
}

impl DownloadRecord {
    pub fn new(request: Arc<DownloadRequest>) -> Self {
        Self {
            request,
            started_at: Utc::now(),
            waiters: Vec::new(),
            delivering: None,
        }
    }

    /// Add a waiter sharing this download
    ///
    /// A caller arriving while the outcome is being delivered gets that
    /// outcome directly.
    pub fn join(&mut self) -> CacheHandle {
        if let Some(outcome) = &self.delivering {
            return CacheHandle::completed(outcome.clone());
        }
        let handle = CacheHandle::pending(Arc::clone(&self.request));
        self.waiters.push(handle.clone());
        handle
    }

    /// Fix the outcome and take the waiters it must be delivered to
    pub fn begin_delivery(&mut self, outcome: CacheOutcome) -> Vec<CacheHandle> {
        self.delivering = Some(outcome);
        std::mem::take(&mut self.waiters)
    }

    pub fn is_delivering(&self) -> bool {
        self.delivering.is_some()
    }

    /// Outcome being delivered, if the download has finished
    pub fn delivered(&self) -> Option<&CacheOutcome> {
        self.delivering.as_ref()
    }
}
