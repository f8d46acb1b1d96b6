//! Cache keys and on-disk file naming
//!
//! A [`CacheKey`] identifies a remote resource independently of scheme and
//! fragment, so `http://` and `https://` fetches of the same resource share
//! one local file. Files live flat in the cache directory, named by the md5 of
//! the key plus the extension of the URL path when it has a short one.

use std::fmt;
use std::path::{Path, PathBuf};

use url::Url;

use crate::app::request::RequestBuilder;
use crate::constants::cache;
use crate::errors::{CacheError, CacheResult};

/// Stable identity of a cached resource: `host[:port]/path[?query]`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derive the key for a URL
    ///
    /// # Errors
    ///
    /// Returns `CacheError::InvalidKey` for URLs without a hierarchical path,
    /// such as `mailto:` or `data:` URLs
    pub fn from_url(url: &Url) -> CacheResult<Self> {
        if url.cannot_be_a_base() {
            return Err(CacheError::InvalidKey {
                url: url.to_string(),
            });
        }

        let mut key = String::new();
        if let Some(host) = url.host_str() {
            key.push_str(host);
        }
        if let Some(port) = url.port() {
            key.push(':');
            key.push_str(&port.to_string());
        }
        key.push_str(url.path());
        if let Some(query) = url.query() {
            key.push('?');
            key.push_str(query);
        }
        Ok(Self(key))
    }

    /// Derive the key for a request, including its query parameters
    pub fn for_request(request: &RequestBuilder) -> CacheResult<Self> {
        Self::from_url(&request.resolved_url())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Path generation utility for cache files
pub struct PathGenerator;

impl PathGenerator {
    /// Local path for a key, keeping the URL's file extension when sensible
    pub fn file_path(cache_dir: &Path, key: &CacheKey, url: &Url) -> PathBuf {
        let digest = md5::compute(key.as_str().as_bytes());
        let mut file_name = format!("{:x}", digest);
        if let Some(extension) = Self::extension(url) {
            file_name.push('.');
            file_name.push_str(&extension);
        }
        cache_dir.join(file_name)
    }

    /// Extension of the last path segment, if short and alphanumeric
    fn extension(url: &Url) -> Option<String> {
        let last_segment = url.path_segments()?.next_back()?;
        let (stem, extension) = last_segment.rsplit_once('.')?;
        let valid = !stem.is_empty()
            && !extension.is_empty()
            && extension.len() <= cache::MAX_EXTENSION_LEN
            && extension.chars().all(|c| c.is_ascii_alphanumeric());
        valid.then(|| extension.to_ascii_lowercase())
    }
}
