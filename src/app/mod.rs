//! Core request execution and caching components
//!
//! Requests flow from a [`RequestSpec`] through the [`RequestExecutor`], which
//! admits them through a [`ConnectionThrottle`], runs them on a [`Transport`],
//! and wraps the translated response in a [`ResultInfo`]. The
//! [`KeyedDownloadCache`] builds on the executor to fetch remote files once per
//! key and keep them on disk.
//!
//! # Examples
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use resource_fetcher::app::{
//!     ClientConfig, ExecutorConfig, HttpTransport, JsonTranslator, Priority, RequestBuilder,
//!     RequestExecutor, WebRequest,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = Arc::new(HttpTransport::new(&ClientConfig::default())?);
//! let executor = RequestExecutor::new(ExecutorConfig::default(), transport)?;
//!
//! let request = Arc::new(WebRequest::new(
//!     RequestBuilder::get("https://example.com/status.json")?,
//!     JsonTranslator::<serde_json::Value>::new(),
//! ));
//! executor.execute_async(
//!     request,
//!     |info| println!("status {}: {:?}", info.response_code, info.result),
//!     Priority::High,
//! )?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod cancel;
pub mod executor;
pub mod pool;
pub mod progress;
pub mod request;
pub mod result;
pub mod throttle;
pub mod translate;
pub mod transport;

// Re-export main public API
pub use cache::{
    CacheConfig, CacheHandle, CacheKey, CacheObserver, CacheOutcome, FreshnessPolicy,
    KeyedDownloadCache, MaxAgePolicy, PersistentCompletionStore,
};
pub use cancel::{CancelableOperation, ListenerId};
pub use executor::{ExecutorConfig, NeverRetry, RequestExecutor, RetryPolicy, RetryTransient};
pub use pool::{Priority, PriorityBacklog, PriorityWorkQueue};
pub use progress::{ProgressListenerId, ProgressListeners};
pub use request::{
    ExecutableRequest, HttpMethod, ParamLocation, RawResponse, RequestBuilder, RequestId,
    RequestSpec, WebRequest,
};
pub use result::ResultInfo;
pub use throttle::{ConnectionThrottle, ThrottlePermit};
pub use translate::{
    BytesTranslator, FileTranslator, JsonTranslator, ResponseTranslator, StringTranslator,
};
pub use transport::{ClientConfig, HttpTransport, Transport, TrustPolicy};
