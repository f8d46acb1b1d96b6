//! Resizable connection throttle
//!
//! A counting semaphore bounding the number of transport operations in flight.
//! Growing the limit takes effect immediately; shrinking waits for enough
//! in-flight work to finish and never evicts anything already admitted.
//! Closing the throttle turns every pending and future admission away.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

use crate::constants::connections;
use crate::errors::{ConfigError, ConfigResult, QueueError, QueueResult};

/// Global gate on concurrent transport operations
#[derive(Debug)]
pub struct ConnectionThrottle {
    semaphore: Arc<Semaphore>,
    /// Serializes resizes; holds the limit they agree on
    resize_lock: Mutex<usize>,
    /// Last committed limit, readable without awaiting
    max: AtomicUsize,
}

/// One admitted operation; the permit returns to the throttle on drop
#[derive(Debug)]
pub struct ThrottlePermit {
    _permit: OwnedSemaphorePermit,
}

impl ConnectionThrottle {
    /// Create a throttle admitting at most `max` concurrent operations
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if `max` is zero or above the supported limit
    pub fn new(max: usize) -> ConfigResult<Self> {
        Self::validate(max)?;
        Ok(Self {
            semaphore: Arc::new(Semaphore::new(max)),
            resize_lock: Mutex::new(max),
            max: AtomicUsize::new(max),
        })
    }

    fn validate(max: usize) -> ConfigResult<()> {
        if max == 0 {
            return Err(ConfigError::invalid_value(
                "max_concurrent_connections",
                max,
                "Must be at least 1",
            ));
        }
        if max > connections::MAX_CONNECTIONS_LIMIT {
            return Err(ConfigError::invalid_value(
                "max_concurrent_connections",
                max,
                format!("Must not exceed {}", connections::MAX_CONNECTIONS_LIMIT),
            ));
        }
        Ok(())
    }

    /// Wait for a free permit
    ///
    /// # Errors
    ///
    /// Returns `QueueError::Shutdown` once the throttle has been closed
    pub async fn acquire(&self) -> QueueResult<ThrottlePermit> {
        Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map(|permit| ThrottlePermit { _permit: permit })
            .map_err(|_| QueueError::Shutdown)
    }

    /// Take a permit only if one is free right now
    pub fn try_acquire(&self) -> Option<ThrottlePermit> {
        Arc::clone(&self.semaphore)
            .try_acquire_owned()
            .ok()
            .map(|permit| ThrottlePermit { _permit: permit })
    }

    /// Refuse all further admissions
    ///
    /// Operations waiting in [`acquire`](Self::acquire) are woken with an
    /// error. Permits already handed out stay valid until dropped.
    pub fn close(&self) {
        if !self.semaphore.is_closed() {
            self.semaphore.close();
            debug!("Connection throttle closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }

    /// Change the maximum number of concurrent operations
    ///
    /// Growing returns immediately. Shrinking waits, without the possibility of
    /// failing, until enough permits have been returned. Concurrent resizes are
    /// applied one at a time.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if `new_max` is zero or above the supported limit
    pub async fn resize(&self, new_max: usize) -> ConfigResult<()> {
        Self::validate(new_max)?;

        let mut current = self.resize_lock.lock().await;
        let old_max = *current;

        if new_max > old_max {
            self.semaphore.add_permits(new_max - old_max);
        } else if new_max < old_max {
            let delta = (old_max - new_max) as u32;
            debug!("Shrinking throttle by {} permits, waiting for in-flight work", delta);
            match Arc::clone(&self.semaphore).acquire_many_owned(delta).await {
                Ok(permits) => permits.forget(),
                Err(_) => debug!("Throttle closed while shrinking; nothing left to reclaim"),
            }
        }

        *current = new_max;
        self.max.store(new_max, Ordering::SeqCst);
        info!("Connection throttle resized from {} to {}", old_max, new_max);
        Ok(())
    }

    /// Current maximum number of concurrent operations
    pub fn max(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }

    /// Number of permits free right now
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}
