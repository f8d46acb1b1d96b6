//! Application constants for the resource fetcher
//!
//! Centralizes defaults used throughout the crate, organized by functional
//! domain.

use std::time::Duration;

/// Request execution and connection limits
pub mod connections {
    use super::Duration;

    /// Default maximum number of concurrently in-flight transport operations
    pub const DEFAULT_MAX_CONNECTIONS: usize = 5;

    /// Upper bound accepted for the connection limit
    pub const MAX_CONNECTIONS_LIMIT: usize = 256;

    /// Default timeout for establishing a connection
    pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(15);

    /// Default timeout for reading a response
    pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(15);

    /// Response code recorded when no response was received
    pub const NO_RESPONSE_CODE: i32 = -1;
}

/// HTTP client constants
pub mod http {
    use super::Duration;

    /// Default user agent for all HTTP requests
    pub const USER_AGENT: &str = concat!("resource-fetcher/", env!("CARGO_PKG_VERSION"));

    /// Connection pool idle timeout
    pub const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

    /// Maximum idle connections kept per host
    pub const POOL_MAX_IDLE_PER_HOST: usize = 8;
}

/// Keyed file cache constants
pub mod cache {
    /// Application directory name under the OS cache directory
    pub const APP_DIR_NAME: &str = "resource-fetcher";

    /// Default cache instance name
    pub const DEFAULT_CACHE_NAME: &str = "default";

    /// Extension of the persisted completion record file
    pub const COMPLETION_FILE_SUFFIX: &str = ".completions.json";

    /// Suffix for in-progress download files
    pub const TEMP_FILE_SUFFIX: &str = ".part";

    /// Bytes written between progress updates while saving a download
    pub const PROGRESS_CHUNK_SIZE: usize = 64 * 1024;

    /// Sentinel stored for keys that are not downloaded
    pub const NOT_DOWNLOADED: i64 = i64::MIN;

    /// Longest file extension carried over from a URL path
    pub const MAX_EXTENSION_LEN: usize = 8;
}

/// Logging constants
pub mod logging {
    /// Target used in the default `EnvFilter` directive
    pub const CRATE_TARGET: &str = "resource_fetcher";

    /// Default log level
    pub const DEFAULT_LEVEL: &str = "info";
}
