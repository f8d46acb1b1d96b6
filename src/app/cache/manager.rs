//! Keyed download cache
//!
//! [`KeyedDownloadCache`] maps a request to a locally persisted file and
//! fetches each distinct key at most once at a time. All decisions about a key
//! (join the running download, serve from disk, or start a new download) are
//! taken under that key's lock, and network I/O never happens while holding
//! it. Listeners run only after the lock has been released.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use chrono::Utc;
use tokio::fs;
use tracing::{debug, error, info, warn};

use crate::app::executor::RequestExecutor;
use crate::app::pool::Priority;
use crate::app::request::{RequestBuilder, WebRequest};
use crate::app::result::ResultInfo;
use crate::errors::{CacheError, CacheResult, DownloadFailure, StoreResult};

use super::config::CacheConfig;
use super::freshness::{FreshnessPolicy, MaxAgePolicy};
use super::path::{CacheKey, PathGenerator};
use super::record::{CacheHandle, CacheOutcome, DownloadRecord};
use super::store::PersistentCompletionStore;

/// Hooks called for every finished download
pub trait CacheObserver: Send + Sync {
    fn on_download_complete(&self, _key: &CacheKey, _path: &Path) {}

    fn on_download_failed(&self, _failure: &DownloadFailure) {}
}

/// Per-key state guarded by the key's lock
struct KeyState {
    path: PathBuf,
    download: Option<DownloadRecord>,
}

type KeySlot = Arc<Mutex<KeyState>>;

#[derive(Default)]
struct KeyTable {
    slots: HashMap<CacheKey, KeySlot>,
    by_path: HashMap<PathBuf, CacheKey>,
}

fn lock_slot(slot: &KeySlot) -> MutexGuard<'_, KeyState> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Delete a local file, treating "already gone" as success
fn remove_local_file(path: &Path) -> bool {
    match std::fs::remove_file(path) {
        Ok(()) => true,
        Err(e) if e.kind() == ErrorKind::NotFound => false,
        Err(e) => {
            warn!("Failed to delete cached file {}: {}", path.display(), e);
            false
        }
    }
}

/// State shared with download completions running on executor workers
struct CacheShared {
    keys: RwLock<KeyTable>,
    store: PersistentCompletionStore,
    observer: RwLock<Option<Arc<dyn CacheObserver>>>,
}

impl CacheShared {
    /// Lock for `key`, created on first use and never removed
    fn slot(&self, key: &CacheKey, path: &Path) -> KeySlot {
        {
            let table = self.keys.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(slot) = table.slots.get(key) {
                return Arc::clone(slot);
            }
        }

        let mut table = self.keys.write().unwrap_or_else(PoisonError::into_inner);
        let table = &mut *table;
        let slot = table.slots.entry(key.clone()).or_insert_with(|| {
            Arc::new(Mutex::new(KeyState {
                path: path.to_path_buf(),
                download: None,
            }))
        });
        table
            .by_path
            .entry(path.to_path_buf())
            .or_insert_with(|| key.clone());
        Arc::clone(slot)
    }

    fn observer(&self) -> Option<Arc<dyn CacheObserver>> {
        self.observer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether the file for `path` may be served; removes stale records
    ///
    /// Must be called with the key's lock held.
    fn is_cached(&self, path: &Path) -> bool {
        let recorded = self.store.is_downloaded(path);
        let exists = path.is_file();
        if recorded && !exists {
            debug!("Dropping completion record of missing file {}", path.display());
            self.store.forget(path);
        }
        recorded && exists
    }

    fn failure(key: &CacheKey, info: &ResultInfo<u64>) -> DownloadFailure {
        let reason = if info.cancelled {
            "Download was cancelled".to_string()
        } else if !info.has_response() {
            "No response received".to_string()
        } else if !info.is_status_ok() {
            format!("Server responded with HTTP {}", info.response_code)
        } else {
            "Response could not be saved".to_string()
        };
        DownloadFailure {
            key: key.to_string(),
            response_code: info.response_code,
            cancelled: info.cancelled,
            reason,
        }
    }

    /// Record the outcome of a download and fan it out to every waiter
    ///
    /// The key stays reserved by its record until every waiter has been
    /// handed the outcome, so nothing can delete or replace the delivered file
    /// in between. Waiters run outside the key's lock and may call back into
    /// the cache.
    fn finish_download(&self, key: &CacheKey, path: &Path, info: ResultInfo<u64>) {
        let succeeded = info.result.is_some() && !info.cancelled;
        let slot = self.slot(key, path);

        let (waiters, outcome) = {
            let mut state = lock_slot(&slot);

            let outcome = if succeeded {
                self.store.mark_completed(path);
                CacheOutcome::Ready(path.to_path_buf())
            } else {
                remove_local_file(path);
                self.store.forget(path);
                CacheOutcome::Failed(Self::failure(key, &info))
            };

            let waiters = match state.download.as_mut() {
                Some(record) => {
                    let waiters = record.begin_delivery(outcome.clone());
                    debug!(
                        "Download of {} finished after {} ms for {} waiters",
                        key,
                        (Utc::now() - record.started_at).num_milliseconds(),
                        waiters.len()
                    );
                    waiters
                }
                None => {
                    error!("Download of {} finished without a record", key);
                    return;
                }
            };
            (waiters, outcome)
        };
        let _release = DeliveryRelease { slot: &slot };

        match &outcome {
            CacheOutcome::Ready(path) => {
                info!("Cached {} at {}", key, path.display());
                if let Some(observer) = self.observer() {
                    observer.on_download_complete(key, path);
                }
            }
            CacheOutcome::Failed(failure) => {
                warn!("{}", failure);
                if let Some(observer) = self.observer() {
                    observer.on_download_failed(failure);
                }
            }
        }

        for waiter in waiters {
            waiter.complete(outcome.clone());
        }
    }
}

/// Ends a delivery by dropping the key's record, even if a listener panics
struct DeliveryRelease<'a> {
    slot: &'a KeySlot,
}

impl Drop for DeliveryRelease<'_> {
    fn drop(&mut self) {
        let mut state = lock_slot(self.slot);
        if state
            .download
            .as_ref()
            .map_or(false, DownloadRecord::is_delivering)
        {
            state.download = None;
        }
    }
}

/// Cache of remote resources persisted as local files
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use resource_fetcher::app::cache::{CacheConfig, KeyedDownloadCache};
/// use resource_fetcher::app::executor::{ExecutorConfig, RequestExecutor};
/// use resource_fetcher::app::request::RequestBuilder;
/// use resource_fetcher::app::transport::{ClientConfig, HttpTransport};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let transport = Arc::new(HttpTransport::new(&ClientConfig::default())?);
/// let executor = Arc::new(RequestExecutor::new(ExecutorConfig::default(), transport)?);
/// let cache = KeyedDownloadCache::new(CacheConfig::named("icons"), executor).await?;
///
/// let path = cache
///     .get_and_wait(RequestBuilder::get("https://example.com/logo.png")?, false)
///     .await?;
/// println!("logo at {}", path.display());
/// # Ok(())
/// # }
/// ```
pub struct KeyedDownloadCache {
    config: CacheConfig,
    cache_dir: PathBuf,
    executor: Arc<RequestExecutor>,
    freshness: Arc<dyn FreshnessPolicy>,
    shared: Arc<CacheShared>,
}

impl KeyedDownloadCache {
    /// Create a cache backed by `executor`
    ///
    /// Creates the cache directory if needed and loads the completion store.
    ///
    /// # Errors
    ///
    /// Returns `CacheError` if the cache directory cannot be created or the
    /// completion store cannot be read
    pub async fn new(config: CacheConfig, executor: Arc<RequestExecutor>) -> CacheResult<Self> {
        let cache_dir = config.resolve_cache_dir()?;
        Self::ensure_directory_exists(&cache_dir).await?;
        let store = PersistentCompletionStore::open(&cache_dir, &config.name).await?;

        info!(
            "Initialized cache '{}' at {} ({} recorded files)",
            config.name,
            cache_dir.display(),
            store.completed_paths().len()
        );

        Ok(Self {
            freshness: Arc::new(MaxAgePolicy::from_option(config.max_age)),
            config,
            cache_dir,
            executor,
            shared: Arc::new(CacheShared {
                keys: RwLock::new(KeyTable::default()),
                store,
                observer: RwLock::new(None),
            }),
        })
    }

    /// Replace the freshness policy derived from `max_age`
    pub fn with_freshness_policy(mut self, policy: impl FreshnessPolicy + 'static) -> Self {
        self.freshness = Arc::new(policy);
        self
    }

    /// Install a hook called for every finished download
    pub fn set_observer(&self, observer: Arc<dyn CacheObserver>) {
        *self
            .shared
            .observer
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(observer);
    }

    async fn ensure_directory_exists(path: &Path) -> CacheResult<()> {
        if !path.exists() {
            fs::create_dir_all(path).await.map_err(|e| {
                error!("Failed to create cache directory: {}", e);
                CacheError::DirectoryNotAccessible {
                    path: path.to_path_buf(),
                }
            })?;
            debug!("Created cache directory: {}", path.display());
        }
        Ok(())
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Directory holding the cached files
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// The completion store of this instance
    pub fn store(&self) -> &PersistentCompletionStore {
        &self.shared.store
    }

    fn locate(&self, request: &RequestBuilder) -> CacheResult<(CacheKey, PathBuf)> {
        let key = CacheKey::for_request(request)?;
        let path = PathGenerator::file_path(&self.cache_dir, &key, &request.resolved_url());
        Ok((key, path))
    }

    /// Local path the resource for `request` is (or would be) stored at
    pub fn file_path_for(&self, request: &RequestBuilder) -> CacheResult<PathBuf> {
        self.locate(request).map(|(_, path)| path)
    }

    /// Look up or fetch a resource, delivering the outcome to `listener`
    ///
    /// If a download for the same key is running, this call joins it; one
    /// that has just finished and is still handing out its outcome is joined
    /// too, even with `force_refresh`. If a fresh local copy exists (and
    /// `force_refresh` is false), `listener` runs before this returns.
    /// Otherwise any stale copy is deleted and a download is queued at
    /// `priority`.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::InvalidKey` if no cache key can be derived from
    /// the request URL
    pub fn get<F>(
        &self,
        request: RequestBuilder,
        force_refresh: bool,
        priority: Priority,
        listener: F,
    ) -> CacheResult<CacheHandle>
    where
        F: FnOnce(CacheOutcome) + Send + 'static,
    {
        let handle = self.fetch(request, force_refresh, priority)?;
        handle.subscribe(listener);
        Ok(handle)
    }

    /// Like [`get`](Self::get) without a listener
    pub fn fetch(
        &self,
        request: RequestBuilder,
        force_refresh: bool,
        priority: Priority,
    ) -> CacheResult<CacheHandle> {
        let (key, path) = self.locate(&request)?;
        let slot = self.shared.slot(&key, &path);

        let (handle, download) = {
            let mut state = lock_slot(&slot);

            if let Some(record) = state.download.as_mut() {
                debug!("Joining in-flight download of {}", key);
                (record.join(), None)
            } else if !force_refresh
                && self.shared.is_cached(&path)
                && self.is_fresh(&request, &path)
            {
                debug!("Serving {} from {}", key, path.display());
                (CacheHandle::completed(CacheOutcome::Ready(path.clone())), None)
            } else {
                if remove_local_file(&path) {
                    debug!("Deleted stale copy of {}", key);
                }
                self.shared.store.mark_not_downloaded(&path);

                let download = Arc::new(WebRequest::download(request, &path));
                let mut record = DownloadRecord::new(Arc::clone(&download));
                let handle = record.join();
                state.download = Some(record);
                (handle, Some(download))
            }
        };

        if let Some(download) = download {
            debug!("Queueing download of {} at {} priority", key, priority);
            let shared = Arc::clone(&self.shared);
            let submitted = self.executor.execute_async(
                download,
                move |info| shared.finish_download(&key, &path, info),
                priority,
            );
            if let Err(e) = submitted {
                // The completion already ran with a cancelled failure
                warn!("Could not queue download: {}", e);
            }
        }

        Ok(handle)
    }

    fn is_fresh(&self, request: &RequestBuilder, path: &Path) -> bool {
        match self.shared.store.age(path) {
            Some(age) => self.freshness.is_fresh(request, age),
            None => false,
        }
    }

    /// Fetch at the configured default priority and wait for the outcome
    ///
    /// # Errors
    ///
    /// Returns `CacheError::DownloadFailed` if the download fails, or
    /// `CacheError::InvalidKey` for an unusable URL
    pub async fn get_and_wait(
        &self,
        request: RequestBuilder,
        force_refresh: bool,
    ) -> CacheResult<PathBuf> {
        let handle = self.fetch(request, force_refresh, self.config.default_priority)?;
        handle.wait().await.into_result().map_err(CacheError::from)
    }

    /// Local copy of a resource, without fetching
    ///
    /// With `fresh_only`, a copy older than the freshness policy allows is
    /// treated as absent. Returns `None` while a download is running, and the
    /// delivered file while a finished download is handing out its outcome.
    pub fn get_file_if_cached(
        &self,
        request: &RequestBuilder,
        fresh_only: bool,
    ) -> Option<PathBuf> {
        let (key, path) = self.locate(request).ok()?;
        let slot = self.shared.slot(&key, &path);
        let state = lock_slot(&slot);

        if let Some(record) = &state.download {
            return record
                .delivered()
                .and_then(CacheOutcome::path)
                .map(Path::to_path_buf);
        }
        if !self.shared.is_cached(&path) {
            return None;
        }
        if fresh_only && !self.is_fresh(request, &path) {
            return None;
        }
        Some(path)
    }

    /// Whether a download of this resource is running
    pub fn is_downloading(&self, request: &RequestBuilder) -> bool {
        let Ok((key, path)) = self.locate(request) else {
            return false;
        };
        let slot = self.shared.slot(&key, &path);
        let downloading = lock_slot(&slot)
            .download
            .as_ref()
            .map_or(false, |record| !record.is_delivering());
        downloading
    }

    /// Delete the local copy of a resource
    ///
    /// Returns `false` while a download is running or its outcome is still
    /// being delivered, or when nothing is recorded for the resource.
    pub fn remove_file(&self, request: &RequestBuilder) -> bool {
        let Ok((key, path)) = self.locate(request) else {
            return false;
        };
        let slot = self.shared.slot(&key, &path);
        let state = lock_slot(&slot);

        if state.download.is_some() {
            debug!("Not removing {}: download in progress or being delivered", key);
            return false;
        }

        let recorded = self.shared.store.is_downloaded(&path);
        let deleted = remove_local_file(&path);
        if recorded {
            self.shared.store.forget(&path);
        }
        if recorded || deleted {
            info!("Removed {} from cache", key);
        }
        recorded || deleted
    }

    /// Delete every completed download not currently being refreshed
    ///
    /// Returns the number of entries removed.
    pub fn clear(&self) -> usize {
        let table = self.shared.keys.read().unwrap_or_else(PoisonError::into_inner);
        let mut removed = 0;

        for path in self.shared.store.completed_paths() {
            let slot = table
                .by_path
                .get(&path)
                .and_then(|key| table.slots.get(key));
            let state = slot.map(lock_slot);
            if let Some(state) = &state {
                if state.download.is_some() {
                    debug!("Skipping {} during clear: download in progress", state.path.display());
                    continue;
                }
            }

            remove_local_file(&path);
            self.shared.store.forget(&path);
            removed += 1;
        }

        info!("Cleared {} files from cache '{}'", removed, self.config.name);
        removed
    }

    /// Wait until the completion store is persisted
    pub async fn flush(&self) -> StoreResult<()> {
        self.shared.store.flush().await
    }
}

impl std::fmt::Debug for KeyedDownloadCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedDownloadCache")
            .field("name", &self.config.name)
            .field("cache_dir", &self.cache_dir)
            .field("store", &self.shared.store)
            .finish()
    }
}
