//! Priority worker pool
//!
//! A fixed (but resizable) set of Tokio worker tasks drains a shared
//! [`PriorityBacklog`]. The backlog hands out the highest-priority job first
//! and keeps submission order among jobs of equal priority. A semaphore counts
//! queued jobs so idle workers park without polling.
//!
//! # Examples
//!
//! ```rust,no_run
//! use resource_fetcher::app::pool::{Priority, PriorityWorkQueue};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = PriorityWorkQueue::new(2)?;
//! pool.submit(Priority::High, Box::pin(async { println!("urgent") }))?;
//! pool.submit(Priority::Low, Box::pin(async { println!("whenever") }))?;
//! # Ok(())
//! # }
//! ```

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, error, info};

use crate::errors::{ConfigError, ConfigResult, QueueError, QueueResult};

/// Scheduling priority of queued work
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
        };
        f.write_str(name)
    }
}

/// Unit of work run by the pool
pub type Job = BoxFuture<'static, ()>;

struct BacklogEntry<T> {
    priority: Priority,
    sequence: u64,
    item: T,
}

impl<T> BacklogEntry<T> {
    fn rank(&self) -> (Priority, Reverse<u64>) {
        (self.priority, Reverse(self.sequence))
    }
}

impl<T> PartialEq for BacklogEntry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.rank() == other.rank()
    }
}

impl<T> Eq for BacklogEntry<T> {}

impl<T> PartialOrd for BacklogEntry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for BacklogEntry<T> {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.rank().cmp(&other.rank())
    }
}

/// Priority-ordered store: highest priority first, FIFO among equals
pub struct PriorityBacklog<T> {
    heap: BinaryHeap<BacklogEntry<T>>,
    next_sequence: u64,
}

impl<T> PriorityBacklog<T> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_sequence: 0,
        }
    }

    /// Add an item behind everything already queued at the same priority
    pub fn push(&mut self, priority: Priority, item: T) {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.heap.push(BacklogEntry {
            priority,
            sequence,
            item,
        });
    }

    /// Remove the next item to run
    pub fn pop(&mut self) -> Option<T> {
        self.heap.pop().map(|entry| entry.item)
    }

    /// Priority of the next item to run
    pub fn peek_priority(&self) -> Option<Priority> {
        self.heap.peek().map(|entry| entry.priority)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Remove every queued item, in no particular order
    pub fn drain(&mut self) -> Vec<T> {
        self.heap.drain().map(|entry| entry.item).collect()
    }
}

impl<T> Default for PriorityBacklog<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for PriorityBacklog<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PriorityBacklog")
            .field("len", &self.heap.len())
            .field("next", &self.peek_priority())
            .finish()
    }
}

struct PoolShared {
    backlog: Mutex<PriorityBacklog<Job>>,
    /// One permit per queued job; closed on shutdown
    queued: Semaphore,
    target_workers: AtomicUsize,
    live_workers: AtomicUsize,
    shut_down: AtomicBool,
}

impl PoolShared {
    fn backlog(&self) -> MutexGuard<'_, PriorityBacklog<Job>> {
        self.backlog.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim a retirement slot if more workers are alive than wanted
    fn retire_if_surplus(&self) -> bool {
        let mut live = self.live_workers.load(Ordering::SeqCst);
        loop {
            if live <= self.target_workers.load(Ordering::SeqCst) {
                return false;
            }
            match self.live_workers.compare_exchange(
                live,
                live - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => live = actual,
            }
        }
    }
}

async fn run_worker(shared: Arc<PoolShared>, worker_id: usize) {
    debug!("Worker {} started", worker_id);
    loop {
        if shared.retire_if_surplus() {
            debug!("Worker {} retiring after pool shrink", worker_id);
            return;
        }

        let permit = match shared.queued.acquire().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        if shared.retire_if_surplus() {
            // Leave the job for a worker that is staying
            drop(permit);
            debug!("Worker {} retiring after pool shrink", worker_id);
            return;
        }
        permit.forget();

        let job = shared.backlog().pop();
        if let Some(job) = job {
            if AssertUnwindSafe(job).catch_unwind().await.is_err() {
                error!("Worker {} caught a panicking job", worker_id);
            }
        }
    }
    shared.live_workers.fetch_sub(1, Ordering::SeqCst);
    debug!("Worker {} stopped", worker_id);
}

/// Pool of Tokio workers executing jobs in priority order
pub struct PriorityWorkQueue {
    shared: Arc<PoolShared>,
    next_worker_id: Mutex<usize>,
}

impl PriorityWorkQueue {
    /// Start a pool with `workers` worker tasks
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if `workers` is zero
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime
    pub fn new(workers: usize) -> ConfigResult<Self> {
        Self::validate(workers)?;
        let pool = Self {
            shared: Arc::new(PoolShared {
                backlog: Mutex::new(PriorityBacklog::new()),
                queued: Semaphore::new(0),
                target_workers: AtomicUsize::new(workers),
                live_workers: AtomicUsize::new(0),
                shut_down: AtomicBool::new(false),
            }),
            next_worker_id: Mutex::new(0),
        };
        pool.spawn_workers(workers);
        info!("Priority work queue started with {} workers", workers);
        Ok(pool)
    }

    fn validate(workers: usize) -> ConfigResult<()> {
        if workers == 0 {
            return Err(ConfigError::invalid_value(
                "workers",
                workers,
                "Must be at least 1",
            ));
        }
        Ok(())
    }

    fn spawn_workers(&self, count: usize) {
        let mut next_id = self.next_worker_id.lock().unwrap_or_else(PoisonError::into_inner);
        for _ in 0..count {
            let worker_id = *next_id;
            *next_id += 1;
            self.shared.live_workers.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(run_worker(Arc::clone(&self.shared), worker_id));
        }
    }

    /// Queue a job without waiting
    ///
    /// # Errors
    ///
    /// Returns `QueueError::Shutdown` once the pool has been shut down; the
    /// job is dropped without running.
    pub fn submit(&self, priority: Priority, job: Job) -> QueueResult<()> {
        {
            let mut backlog = self.shared.backlog();
            if self.shared.shut_down.load(Ordering::SeqCst) {
                drop(backlog);
                drop(job);
                return Err(QueueError::Shutdown);
            }
            backlog.push(priority, job);
        }
        self.shared.queued.add_permits(1);
        Ok(())
    }

    /// Change the number of worker tasks
    ///
    /// New workers start immediately. Surplus workers retire once they finish
    /// their current job; running work is never interrupted.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if `workers` is zero
    pub fn resize(&self, workers: usize) -> ConfigResult<()> {
        Self::validate(workers)?;
        let old = self.shared.target_workers.swap(workers, Ordering::SeqCst);
        let live = self.shared.live_workers.load(Ordering::SeqCst);
        if workers > live {
            self.spawn_workers(workers - live);
        }
        if workers != old {
            info!("Priority work queue resized from {} to {} workers", old, workers);
        }
        Ok(())
    }

    /// Number of workers the pool is sized for
    pub fn worker_count(&self) -> usize {
        self.shared.target_workers.load(Ordering::SeqCst)
    }

    /// Number of jobs waiting for a worker
    pub fn pending(&self) -> usize {
        self.shared.backlog().len()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.shut_down.load(Ordering::SeqCst)
    }

    /// Stop the pool
    ///
    /// Queued jobs are dropped without running; jobs already running finish.
    /// Later submissions fail. Idempotent.
    pub fn shutdown(&self) {
        let dropped = {
            let mut backlog = self.shared.backlog();
            if self.shared.shut_down.swap(true, Ordering::SeqCst) {
                return;
            }
            backlog.drain()
        };
        self.shared.queued.close();
        info!(
            "Priority work queue shut down, {} queued jobs dropped",
            dropped.len()
        );
        // Dropped outside the backlog lock; job destructors may submit work
        drop(dropped);
    }
}

impl Drop for PriorityWorkQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for PriorityWorkQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PriorityWorkQueue")
            .field("workers", &self.worker_count())
            .field("pending", &self.pending())
            .field("shut_down", &self.is_shutdown())
            .finish()
    }
}
