//! Durable record of completed downloads
//!
//! Maps absolute local file paths to the time their download completed. The
//! map lives in memory and every write updates it synchronously; persisting it
//! happens in the background. Each commit writes the whole latest snapshot to
//! a temporary file and renames it over `<dir>/<name>.completions.json`, so a
//! crash leaves either the previous or the next complete snapshot on disk.

use std::collections::{BTreeMap, HashMap};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tokio::fs;
use tracing::{debug, error, info, warn};

use crate::constants::cache;
use crate::errors::{StoreError, StoreResult};

/// Persisted state of one local file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub enum CompletionEntry {
    /// Download completed at this many milliseconds since the Unix epoch
    Completed(i64),
    /// Not downloaded, or a download is in progress
    NotDownloaded,
}

impl From<i64> for CompletionEntry {
    fn from(value: i64) -> Self {
        if value == cache::NOT_DOWNLOADED {
            CompletionEntry::NotDownloaded
        } else {
            CompletionEntry::Completed(value)
        }
    }
}

impl From<CompletionEntry> for i64 {
    fn from(entry: CompletionEntry) -> Self {
        match entry {
            CompletionEntry::Completed(millis) => millis,
            CompletionEntry::NotDownloaded => cache::NOT_DOWNLOADED,
        }
    }
}

type Snapshot = BTreeMap<String, CompletionEntry>;

fn store_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

struct StoreInner {
    file_path: PathBuf,
    entries: Mutex<HashMap<String, CompletionEntry>>,
    /// Bumped on every in-memory change
    generation: AtomicU64,
    /// Serializes commits; holds the generation last written to disk
    commit_lock: Mutex<u64>,
}

impl StoreInner {
    fn entries(&self) -> MutexGuard<'_, HashMap<String, CompletionEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn commit(&self) -> StoreResult<()> {
        let mut committed = self.commit_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let (generation, snapshot) = {
            let entries = self.entries();
            let snapshot: Snapshot = entries.iter().map(|(k, v)| (k.clone(), *v)).collect();
            (self.generation.load(Ordering::SeqCst), snapshot)
        };
        if generation == *committed {
            return Ok(());
        }

        self.write_snapshot(&snapshot)?;
        *committed = generation;
        debug!(
            "Committed {} completion entries to {}",
            snapshot.len(),
            self.file_path.display()
        );
        Ok(())
    }

    fn write_snapshot(&self, snapshot: &Snapshot) -> StoreResult<()> {
        let dir = self.file_path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir).map_err(|source| StoreError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        let temp = NamedTempFile::new_in(dir).map_err(|source| StoreError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        {
            let mut writer = BufWriter::new(temp.as_file());
            serde_json::to_writer_pretty(&mut writer, snapshot)?;
            writer.flush().map_err(|source| StoreError::Io {
                path: temp.path().to_path_buf(),
                source,
            })?;
        }
        temp.persist(&self.file_path)
            .map_err(|_| StoreError::PersistFailed {
                path: self.file_path.clone(),
            })?;
        Ok(())
    }
}

/// Key to completion-timestamp map persisted per cache instance
#[derive(Clone)]
pub struct PersistentCompletionStore {
    inner: Arc<StoreInner>,
}

impl PersistentCompletionStore {
    /// Load the store for cache instance `name` from `dir`
    ///
    /// A missing file yields an empty store. A file that cannot be parsed is
    /// logged and treated as empty; it is replaced on the next commit.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Io` if the file exists but cannot be read
    pub async fn open(dir: &Path, name: &str) -> StoreResult<Self> {
        let file_path = dir.join(format!("{}{}", name, cache::COMPLETION_FILE_SUFFIX));

        let entries = match fs::read(&file_path).await {
            Ok(bytes) => match serde_json::from_slice::<Snapshot>(&bytes) {
                Ok(snapshot) => {
                    info!(
                        "Loaded {} completion entries from {}",
                        snapshot.len(),
                        file_path.display()
                    );
                    snapshot.into_iter().collect()
                }
                Err(e) => {
                    warn!(
                        "Ignoring unreadable completion store {}: {}",
                        file_path.display(),
                        e
                    );
                    HashMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No completion store at {}, starting empty", file_path.display());
                HashMap::new()
            }
            Err(source) => {
                return Err(StoreError::Io {
                    path: file_path,
                    source,
                })
            }
        };

        Ok(Self {
            inner: Arc::new(StoreInner {
                file_path,
                entries: Mutex::new(entries),
                generation: AtomicU64::new(0),
                commit_lock: Mutex::new(0),
            }),
        })
    }

    /// Location of the persisted file
    pub fn file_path(&self) -> &Path {
        &self.inner.file_path
    }

    /// Whether `path` is recorded as completely downloaded
    pub fn is_downloaded(&self, path: &Path) -> bool {
        self.completed_millis(path).is_some()
    }

    fn completed_millis(&self, path: &Path) -> Option<i64> {
        match self.inner.entries().get(&store_key(path)) {
            Some(CompletionEntry::Completed(millis)) => Some(*millis),
            _ => None,
        }
    }

    /// When the download of `path` completed
    pub fn completed_at(&self, path: &Path) -> Option<DateTime<Utc>> {
        let millis = self.completed_millis(path)?;
        Utc.timestamp_millis_opt(millis).single()
    }

    /// Time since the download of `path` completed
    ///
    /// Timestamps in the future (clock changes) count as age zero.
    pub fn age(&self, path: &Path) -> Option<Duration> {
        let millis = self.completed_millis(path)?;
        let elapsed = Utc::now().timestamp_millis().saturating_sub(millis);
        Some(Duration::from_millis(elapsed.max(0) as u64))
    }

    /// Record `path` as downloaded now
    pub fn mark_completed(&self, path: &Path) {
        self.mark_completed_at(path, Utc::now());
    }

    /// Record `path` as downloaded at a given time
    pub fn mark_completed_at(&self, path: &Path, at: DateTime<Utc>) {
        self.update(path, Some(CompletionEntry::Completed(at.timestamp_millis())));
    }

    /// Record `path` as not downloaded
    pub fn mark_not_downloaded(&self, path: &Path) {
        self.update(path, Some(CompletionEntry::NotDownloaded));
    }

    /// Drop any record of `path`
    pub fn forget(&self, path: &Path) {
        self.update(path, None);
    }

    fn update(&self, path: &Path, entry: Option<CompletionEntry>) {
        {
            let mut entries = self.inner.entries();
            let key = store_key(path);
            let previous = match entry {
                Some(entry) => entries.insert(key, entry),
                None => entries.remove(&key),
            };
            if previous == entry {
                return;
            }
            self.inner.generation.fetch_add(1, Ordering::SeqCst);
        }
        self.schedule_commit();
    }

    /// Paths currently recorded as completely downloaded
    pub fn completed_paths(&self) -> Vec<PathBuf> {
        self.inner
            .entries()
            .iter()
            .filter(|(_, entry)| matches!(entry, CompletionEntry::Completed(_)))
            .map(|(path, _)| PathBuf::from(path))
            .collect()
    }

    /// Number of entries, in any state
    pub fn len(&self) -> usize {
        self.inner.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn schedule_commit(&self) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let inner = Arc::clone(&self.inner);
                handle.spawn_blocking(move || {
                    if let Err(e) = inner.commit() {
                        error!("Failed to persist completion store: {}", e);
                    }
                });
            }
            Err(_) => {
                if let Err(e) = self.inner.commit() {
                    error!("Failed to persist completion store: {}", e);
                }
            }
        }
    }

    /// Write the current state to disk and wait for it
    pub async fn flush(&self) -> StoreResult<()> {
        let inner = Arc::clone(&self.inner);
        match tokio::task::spawn_blocking(move || inner.commit()).await {
            Ok(result) => result,
            Err(e) => {
                error!("Completion store commit task failed: {}", e);
                Err(StoreError::PersistFailed {
                    path: self.inner.file_path.clone(),
                })
            }
        }
    }
}

impl std::fmt::Debug for PersistentCompletionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentCompletionStore")
            .field("file_path", &self.inner.file_path)
            .field("entries", &self.len())
            .finish()
    }
}
