//! Request execution engine
//!
//! [`RequestExecutor`] admits requests through a [`ConnectionThrottle`], hands
//! them to a [`Transport`], and wraps whatever comes back in a [`ResultInfo`].
//! Transport failures never escape as errors. Asynchronous execution goes
//! through a [`PriorityWorkQueue`] sized to the connection limit, so queued
//! work waits in priority order rather than on the throttle.
//!
//! The start/cancel race is closed by the request's status lock: the started
//! flag is set and the abort listener registered in one critical section, so
//! a cancel either lands before the start (and the transport is never touched)
//! or after it (and the abort listener fires).

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::cancel::{CancelableOperation, ListenerId};
use super::pool::{Priority, PriorityWorkQueue};
use super::request::{ExecutableRequest, RequestSpec};
use super::result::ResultInfo;
use super::throttle::ConnectionThrottle;
use super::transport::Transport;
use crate::constants::connections;
use crate::errors::{ConfigError, ConfigResult, QueueResult, TransportError};

/// Executor settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Maximum number of concurrently executing transport operations
    pub max_concurrent_connections: usize,
    /// Priority used by [`RequestExecutor::execute_in_background`]
    pub default_priority: Priority,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_connections: connections::DEFAULT_MAX_CONNECTIONS,
            default_priority: Priority::Normal,
        }
    }
}

impl ExecutorConfig {
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_concurrent_connections = max;
        self
    }

    pub fn with_default_priority(mut self, priority: Priority) -> Self {
        self.default_priority = priority;
        self
    }

    /// Validate configuration values
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_concurrent_connections == 0 {
            return Err(ConfigError::invalid_value(
                "max_concurrent_connections",
                self.max_concurrent_connections,
                "Must be at least 1",
            ));
        }
        if self.max_concurrent_connections > connections::MAX_CONNECTIONS_LIMIT {
            return Err(ConfigError::invalid_value(
                "max_concurrent_connections",
                self.max_concurrent_connections,
                format!("Must not exceed {}", connections::MAX_CONNECTIONS_LIMIT),
            ));
        }
        Ok(())
    }
}

/// Decides whether a failed transport operation gets a second attempt
pub trait RetryPolicy: Send + Sync {
    fn should_retry(&self, request: &ExecutableRequest, error: &TransportError) -> bool;
}

/// Never retries
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverRetry;

impl RetryPolicy for NeverRetry {
    fn should_retry(&self, _request: &ExecutableRequest, _error: &TransportError) -> bool {
        false
    }
}

/// Retries failures that look transient (timeouts, connect errors)
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryTransient;

impl RetryPolicy for RetryTransient {
    fn should_retry(&self, _request: &ExecutableRequest, error: &TransportError) -> bool {
        error.is_transient()
    }
}

/// Removes the abort listener when the transport call is over, however it ends
struct AbortRegistration<'a> {
    operation: &'a CancelableOperation,
    listener: ListenerId,
}

impl Drop for AbortRegistration<'_> {
    fn drop(&mut self) {
        self.operation.remove_on_cancel_listener(self.listener);
    }
}

/// Hands a result to a listener exactly once
///
/// If the work is dropped before it produces a result (queue shutdown, or a
/// panic while executing), the listener receives a cancelled failure instead.
struct ResultDelivery<T, F>
where
    F: FnOnce(ResultInfo<T>),
{
    listener: Option<F>,
    _result: std::marker::PhantomData<fn(T)>,
}

impl<T, F: FnOnce(ResultInfo<T>)> ResultDelivery<T, F> {
    fn new(listener: F) -> Self {
        Self {
            listener: Some(listener),
            _result: std::marker::PhantomData,
        }
    }

    fn deliver(mut self, result: ResultInfo<T>) {
        if let Some(listener) = self.listener.take() {
            listener(result);
        }
    }
}

impl<T, F: FnOnce(ResultInfo<T>)> Drop for ResultDelivery<T, F> {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            debug!("Queued request dropped before running");
            listener(ResultInfo::failed(Utc::now()).with_cancelled(true));
        }
    }
}

struct ExecutorCore {
    transport: Arc<dyn Transport>,
    throttle: ConnectionThrottle,
    retry: Box<dyn RetryPolicy>,
}

impl ExecutorCore {
    async fn execute<S>(&self, spec: &S) -> ResultInfo<S::Output>
    where
        S: RequestSpec + ?Sized,
    {
        let timestamp = Utc::now();
        let operation = spec.operation();

        if operation.is_cancelled() {
            debug!("Request cancelled before admission");
            return ResultInfo::failed(timestamp).with_cancelled(true);
        }
        if operation.is_started() {
            warn!("Request has already been started; refusing to execute it again");
            return ResultInfo::failed(timestamp);
        }

        let request = match spec.executable_request() {
            Ok(request) => request,
            Err(e) => {
                warn!("Could not build request: {}", e);
                return ResultInfo::failed(timestamp);
            }
        };

        let permit = match self.throttle.acquire().await {
            Ok(permit) => permit,
            Err(e) => {
                debug!("Request {} not admitted: {}", request.id, e);
                return ResultInfo::failed(timestamp).with_cancelled(true);
            }
        };

        let registration = {
            let mut status = operation.lock_status();
            if !status.mark_started() {
                let cancelled = status.is_cancelled();
                debug!(
                    "Request {} not started (cancelled: {})",
                    request.id, cancelled
                );
                return ResultInfo::failed(timestamp).with_cancelled(cancelled);
            }
            let transport = Arc::clone(&self.transport);
            let aborted = request.clone();
            let listener = status.add_on_cancel_listener(move || transport.abort(&aborted));
            AbortRegistration {
                operation,
                listener,
            }
        };

        debug!("Request {} started: {} {}", request.id, request.method, request.url);
        let mut response = self.transport.perform(&request).await;
        if let Err(e) = &response {
            if !operation.is_cancelled() && self.retry.should_retry(&request, e) {
                info!("Retrying request {} after failure: {}", request.id, e);
                response = self.transport.perform(&request).await;
            }
        }
        drop(permit);
        // No abort can fire past this point
        drop(registration);
        self.transport.release(&request);

        let info = match response {
            Ok(raw) => {
                spec.on_connected(&raw);
                let code = i32::from(raw.status);
                let message = raw.reason.clone();
                debug!("Request {} completed with HTTP {}", request.id, code);
                let result = spec.translate(Some(raw)).await;
                ResultInfo::new(result, timestamp, code, message)
            }
            Err(e) => {
                if operation.is_cancelled() {
                    debug!("Request {} aborted: {}", request.id, e);
                } else {
                    warn!("Request {} to {} failed: {}", request.id, request.url, e);
                }
                let mut info = ResultInfo::failed(timestamp);
                info.result = spec.translate(None).await;
                info
            }
        };

        info.with_cancelled(operation.is_cancelled())
    }
}

/// Executes requests under a global connection limit
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use resource_fetcher::app::executor::{ExecutorConfig, RequestExecutor};
/// use resource_fetcher::app::request::{RequestBuilder, WebRequest};
/// use resource_fetcher::app::translate::StringTranslator;
/// use resource_fetcher::app::transport::{ClientConfig, HttpTransport};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let transport = Arc::new(HttpTransport::new(&ClientConfig::default())?);
/// let executor = RequestExecutor::new(ExecutorConfig::default(), transport)?;
///
/// let request = WebRequest::new(RequestBuilder::get("https://example.com/")?, StringTranslator);
/// let info = executor.execute(&request).await;
/// if info.is_status_ok() {
///     println!("{}", info.result.unwrap_or_default());
/// }
/// # Ok(())
/// # }
/// ```
pub struct RequestExecutor {
    core: Arc<ExecutorCore>,
    pool: PriorityWorkQueue,
    default_priority: Priority,
}

impl RequestExecutor {
    /// Create an executor that never retries
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the configuration is invalid
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime
    pub fn new(config: ExecutorConfig, transport: Arc<dyn Transport>) -> ConfigResult<Self> {
        Self::with_retry_policy(config, transport, NeverRetry)
    }

    /// Create an executor with a retry policy
    pub fn with_retry_policy(
        config: ExecutorConfig,
        transport: Arc<dyn Transport>,
        retry: impl RetryPolicy + 'static,
    ) -> ConfigResult<Self> {
        config.validate()?;
        let throttle = ConnectionThrottle::new(config.max_concurrent_connections)?;
        let pool = PriorityWorkQueue::new(config.max_concurrent_connections)?;

        info!(
            "Request executor ready with {} connections",
            config.max_concurrent_connections
        );

        Ok(Self {
            core: Arc::new(ExecutorCore {
                transport,
                throttle,
                retry: Box::new(retry),
            }),
            pool,
            default_priority: config.default_priority,
        })
    }

    /// Execute a request on the calling task
    ///
    /// Never fails: transport errors produce a [`ResultInfo`] with response
    /// code `-1`. A request executes at most once; executing a started request
    /// again yields a failed result without contacting the transport.
    pub async fn execute<S>(&self, spec: &S) -> ResultInfo<S::Output>
    where
        S: RequestSpec + ?Sized,
    {
        self.core.execute(spec).await
    }

    /// Queue a request and deliver its result to `listener`
    ///
    /// Higher priorities run first; equal priorities run in submission order.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::Shutdown` after [`shutdown`](Self::shutdown); the
    /// listener is then called with a cancelled failure.
    pub fn execute_async<S, F>(
        &self,
        spec: Arc<S>,
        listener: F,
        priority: Priority,
    ) -> QueueResult<()>
    where
        S: RequestSpec + ?Sized + 'static,
        S::Output: 'static,
        F: FnOnce(ResultInfo<S::Output>) + Send + 'static,
    {
        let core = Arc::clone(&self.core);
        let delivery = ResultDelivery::new(listener);
        self.pool.submit(
            priority,
            Box::pin(async move {
                let result = core.execute(spec.as_ref()).await;
                delivery.deliver(result);
            }),
        )
    }

    /// Queue a request at the configured default priority
    pub fn execute_in_background<S, F>(&self, spec: Arc<S>, listener: F) -> QueueResult<()>
    where
        S: RequestSpec + ?Sized + 'static,
        S::Output: 'static,
        F: FnOnce(ResultInfo<S::Output>) + Send + 'static,
    {
        self.execute_async(spec, listener, self.default_priority)
    }

    /// Change the connection limit and worker count
    ///
    /// Shrinking waits until enough in-flight operations have finished.
    pub async fn set_max_connections(&self, max: usize) -> ConfigResult<()> {
        self.core.throttle.resize(max).await?;
        self.pool.resize(max)
    }

    /// Current connection limit
    pub fn max_connections(&self) -> usize {
        self.core.throttle.max()
    }

    /// Connection permits free right now
    pub fn available_connections(&self) -> usize {
        self.core.throttle.available()
    }

    /// Requests queued but not yet picked up by a worker
    pub fn pending(&self) -> usize {
        self.pool.pending()
    }

    pub fn default_priority(&self) -> Priority {
        self.default_priority
    }

    /// Stop the worker pool and close the throttle
    ///
    /// Queued requests are dropped, and requests still waiting for a
    /// connection finish as cancelled. Transfers already running complete
    /// normally.
    pub fn shutdown(&self) {
        self.pool.shutdown();
        self.core.throttle.close();
    }
}

impl std::fmt::Debug for RequestExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestExecutor")
            .field("max_connections", &self.max_connections())
            .field("pool", &self.pool)
            .finish()
    }
}
