//! Response translators
//!
//! Translators turn a [`RawResponse`] into a typed value. They always accept
//! an absent response and never fail across the boundary: anything that cannot
//! be decoded becomes `None` and is logged.

use std::ffi::OsString;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use super::progress::ProgressListeners;
use super::request::RawResponse;
use crate::constants::cache;

/// Converts a raw response (possibly absent) into a typed result
#[async_trait]
pub trait ResponseTranslator: Send + Sync {
    /// Type produced on success
    type Output: Send;

    /// Translate the response; `None` means no response was received
    async fn translate(&self, response: Option<RawResponse>) -> Option<Self::Output>;

    /// Translate while reporting progress to `progress`
    ///
    /// Translators that do no incremental work keep the default, which
    /// reports nothing.
    async fn translate_with_progress(
        &self,
        response: Option<RawResponse>,
        _progress: &ProgressListeners,
    ) -> Option<Self::Output> {
        self.translate(response).await
    }
}

/// Returns the body as UTF-8 text
#[derive(Debug, Clone, Copy, Default)]
pub struct StringTranslator;

#[async_trait]
impl ResponseTranslator for StringTranslator {
    type Output = String;

    async fn translate(&self, response: Option<RawResponse>) -> Option<String> {
        let response = response?;
        match String::from_utf8(response.body) {
            Ok(text) => Some(text),
            Err(e) => {
                warn!("Response body is not valid UTF-8: {}", e);
                None
            }
        }
    }
}

/// Returns the body bytes unchanged
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesTranslator;

#[async_trait]
impl ResponseTranslator for BytesTranslator {
    type Output = Vec<u8>;

    async fn translate(&self, response: Option<RawResponse>) -> Option<Vec<u8>> {
        response.map(|r| r.body)
    }
}

/// Deserializes the body as JSON into `T`
#[derive(Debug)]
pub struct JsonTranslator<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonTranslator<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonTranslator<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T> ResponseTranslator for JsonTranslator<T>
where
    T: DeserializeOwned + Send + 'static,
{
    type Output = T;

    async fn translate(&self, response: Option<RawResponse>) -> Option<T> {
        let response = response?;
        match serde_json::from_slice(&response.body) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Failed to parse JSON response (status {}): {}", response.status, e);
                None
            }
        }
    }
}

/// Writes a successful response body to a local file
///
/// The body is written to a sibling temporary file first and renamed into
/// place, so the target path only ever holds a complete download. Yields the
/// number of bytes written.
#[derive(Debug, Clone)]
pub struct FileTranslator {
    target: PathBuf,
}

impl FileTranslator {
    pub fn new(target: impl Into<PathBuf>) -> Self {
        Self {
            target: target.into(),
        }
    }

    /// Destination of the download
    pub fn target(&self) -> &Path {
        &self.target
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .target
            .file_name()
            .map(OsString::from)
            .unwrap_or_default();
        name.push(cache::TEMP_FILE_SUFFIX);
        self.target.with_file_name(name)
    }

    async fn write_atomic(
        &self,
        response: &RawResponse,
        progress: &ProgressListeners,
    ) -> std::io::Result<()> {
        if let Some(parent) = self.target.parent() {
            fs::create_dir_all(parent).await?;
        }

        let temp_path = self.temp_path();
        let total = content_length(response);
        let result = async {
            let mut file = fs::File::create(&temp_path).await?;
            let mut written = 0u64;
            progress.publish(written, total);
            for chunk in response.body.chunks(cache::PROGRESS_CHUNK_SIZE) {
                file.write_all(chunk).await?;
                written += chunk.len() as u64;
                progress.publish(written, total);
            }
            file.sync_all().await?;
            drop(file);
            fs::rename(&temp_path, &self.target).await
        }
        .await;

        if result.is_err() {
            let _ = fs::remove_file(&temp_path).await;
        }
        result
    }
}

/// Declared body size, if the server sent a usable `Content-Length`
fn content_length(response: &RawResponse) -> Option<u64> {
    response
        .header("content-length")
        .and_then(|value| value.trim().parse().ok())
}

#[async_trait]
impl ResponseTranslator for FileTranslator {
    type Output = u64;

    async fn translate(&self, response: Option<RawResponse>) -> Option<u64> {
        self.translate_with_progress(response, &ProgressListeners::new())
            .await
    }

    async fn translate_with_progress(
        &self,
        response: Option<RawResponse>,
        progress: &ProgressListeners,
    ) -> Option<u64> {
        let response = response?;
        if !response.is_success() {
            debug!(
                "Not saving {}: server responded with HTTP {}",
                self.target.display(),
                response.status
            );
            return None;
        }

        match self.write_atomic(&response, progress).await {
            Ok(()) => {
                debug!(
                    "Saved {} bytes to {}",
                    response.body.len(),
                    self.target.display()
                );
                Some(response.body.len() as u64)
            }
            Err(e) => {
                warn!("Failed to save download to {}: {}", self.target.display(), e);
                None
            }
        }
    }
}
