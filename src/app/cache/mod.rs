//! Keyed download cache with persisted completion records
//!
//! This module maps remote resources to local files. Concurrent lookups of the
//! same resource share a single download, completed downloads are recorded in
//! a small JSON store next to the files, and a freshness policy decides when a
//! recorded file must be fetched again.
//!
//! # Key Features
//!
//! - **At most one download per key**: later callers join the running download
//! - **Synchronous hits**: a fresh local copy is delivered before `get` returns
//! - **Durable records**: completion timestamps survive restarts
//! - **No partial files**: failed downloads leave neither a file nor a record
//!
//! # Module Organization
//!
//! - [`config`] - Configuration types and defaults
//! - [`path`] - Cache keys and file naming
//! - [`freshness`] - Policies deciding when a copy is stale
//! - [`store`] - Persisted completion timestamps
//! - [`record`] - In-flight downloads and caller handles
//! - [`manager`] - The cache itself

pub mod config;
pub mod freshness;
pub mod manager;
pub mod path;
pub mod record;
pub mod store;

pub use config::CacheConfig;
pub use freshness::{FreshnessPolicy, MaxAgePolicy};
pub use manager::{CacheObserver, KeyedDownloadCache};
pub use path::{CacheKey, PathGenerator};
pub use record::{CacheHandle, CacheListener, CacheOutcome, DownloadRequest, SubscriptionId};
pub use store::{CompletionEntry, PersistentCompletionStore};
