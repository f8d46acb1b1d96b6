//! Request descriptions and raw responses
//!
//! A [`RequestSpec`] is what callers hand to the executor. The executor only
//! needs four things from it: an [`ExecutableRequest`] for the transport, the
//! [`CancelableOperation`] carrying cancellation and the status lock, a hook
//! called once a response arrives, and a translation step. [`WebRequest`] is
//! the stock implementation pairing a [`RequestBuilder`] with a
//! [`ResponseTranslator`].

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use tracing::warn;
use url::Url;

use super::cancel::CancelableOperation;
use super::progress::{ProgressListenerId, ProgressListeners};
use super::translate::{FileTranslator, ResponseTranslator};
use crate::errors::{TransportError, TransportResult};

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identity of one executable request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl RequestId {
    /// Allocate the next process-wide request id
    pub fn next() -> Self {
        Self(NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Numeric value of the id
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// HTTP methods supported by the request builder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Head,
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    /// Method name as sent on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Head => "HEAD",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
        }
    }

    /// Whether parameters for this method travel in the body
    fn params_in_body(&self) -> bool {
        matches!(self, HttpMethod::Post | HttpMethod::Put)
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where parameters added with [`RequestBuilder::with_param`] are sent
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamLocation {
    /// Form body for POST and PUT, query string otherwise
    #[default]
    Auto,
    /// Always the query string
    Url,
    /// Always a form-encoded body
    Body,
}

/// Immutable description of a request's method, target, parameters and body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestBuilder {
    method: HttpMethod,
    url: Url,
    params: Vec<(String, String)>,
    body_params: Vec<(String, String)>,
    param_location: ParamLocation,
    headers: Vec<(String, String)>,
    body: Option<Vec<u8>>,
}

impl RequestBuilder {
    /// Create a request for the given method and URL
    ///
    /// # Errors
    ///
    /// Returns `TransportError::InvalidUrl` if the URL does not parse
    pub fn new(method: HttpMethod, url: &str) -> TransportResult<Self> {
        let url = Url::parse(url).map_err(|e| TransportError::InvalidUrl {
            url: url.to_string(),
            error: e.to_string(),
        })?;
        Ok(Self::from_url(method, url))
    }

    /// Create a request from an already parsed URL
    pub fn from_url(method: HttpMethod, url: Url) -> Self {
        Self {
            method,
            url,
            params: Vec::new(),
            body_params: Vec::new(),
            param_location: ParamLocation::Auto,
            headers: Vec::new(),
            body: None,
        }
    }

    /// Shorthand for a GET request
    pub fn get(url: &str) -> TransportResult<Self> {
        Self::new(HttpMethod::Get, url)
    }

    /// Add a request parameter, sent according to the [`ParamLocation`]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    /// Add a parameter that is always sent in the form body
    pub fn with_body_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.body_params.push((key.into(), value.into()));
        self
    }

    /// Send parameters in the query string regardless of method
    pub fn send_params_in_url(mut self) -> Self {
        self.param_location = ParamLocation::Url;
        self
    }

    /// Send parameters in a form-encoded body regardless of method
    pub fn send_params_in_body(mut self) -> Self {
        self.param_location = ParamLocation::Body;
        self
    }

    /// Authenticate with HTTP basic auth, replacing any earlier credentials
    pub fn with_basic_auth(mut self, user: &str, password: &str) -> Self {
        let token = general_purpose::STANDARD.encode(format!("{}:{}", user, password));
        self.headers
            .retain(|(name, _)| !name.eq_ignore_ascii_case("Authorization"));
        self.headers
            .push(("Authorization".to_string(), format!("Basic {}", token)));
        self
    }

    /// Add a request header
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set a raw request body
    ///
    /// An explicit body takes the place of form-encoded parameters.
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Use a string as the request body
    pub fn with_string_input(self, input: &str) -> Self {
        self.with_body(input.as_bytes())
    }

    /// Use the contents of a local file as the request body
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Io` if the file cannot be read
    pub async fn with_file_input(self, path: &Path) -> TransportResult<Self> {
        let contents = tokio::fs::read(path).await?;
        Ok(self.with_body(contents))
    }

    /// Request method
    pub fn method(&self) -> HttpMethod {
        self.method
    }

    /// Base URL, without parameters applied
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Request parameters
    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }

    pub fn param_location(&self) -> ParamLocation {
        self.param_location
    }

    fn params_in_body(&self) -> bool {
        match self.param_location {
            ParamLocation::Auto => self.method.params_in_body(),
            ParamLocation::Url => false,
            ParamLocation::Body => true,
        }
    }

    /// URL with parameters applied when they travel in the query string
    pub fn resolved_url(&self) -> Url {
        let mut url = self.url.clone();
        if !self.params_in_body() && !self.params.is_empty() {
            url.query_pairs_mut().extend_pairs(self.params.iter());
        }
        url
    }

    /// Produce the executable form of this request
    pub fn build(&self) -> ExecutableRequest {
        let mut headers = self.headers.clone();
        let mut body = self.body.clone();

        let mut form: Vec<&(String, String)> = Vec::new();
        if self.params_in_body() {
            form.extend(self.params.iter());
        }
        form.extend(self.body_params.iter());

        if !form.is_empty() && body.is_some() {
            warn!(
                "Ignoring {} body parameters for {}: an explicit body is set",
                form.len(),
                self.url
            );
        } else if !form.is_empty() {
            let encoded = url::form_urlencoded::Serializer::new(String::new())
                .extend_pairs(form.iter().map(|(k, v)| (k.as_str(), v.as_str())))
                .finish();
            headers.push((
                "Content-Type".to_string(),
                "application/x-www-form-urlencoded".to_string(),
            ));
            body = Some(encoded.into_bytes());
        }

        ExecutableRequest {
            id: RequestId::next(),
            method: self.method,
            url: self.resolved_url(),
            headers,
            body,
        }
    }
}

/// A request ready to be handed to a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutableRequest {
    pub id: RequestId,
    pub method: HttpMethod,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

/// Response as returned by a transport, before translation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    /// HTTP status code
    pub status: u16,
    /// Reason phrase, if the transport knows one
    pub reason: Option<String>,
    /// Response headers
    pub headers: Vec<(String, String)>,
    /// Full response body
    pub body: Vec<u8>,
}

impl RawResponse {
    /// Create a response with a status and body and no headers
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            reason: None,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    /// Whether the status is in the 2xx range
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// First header value with the given name (case-insensitive)
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Everything the executor needs from a request
#[async_trait]
pub trait RequestSpec: Send + Sync {
    /// Type produced by translating the response
    type Output: Send;

    /// Produce the request to hand to the transport
    fn executable_request(&self) -> TransportResult<ExecutableRequest>;

    /// Cancellation state and status lock of this request
    fn operation(&self) -> &CancelableOperation;

    /// Called once a response has been received, before translation
    fn on_connected(&self, _response: &RawResponse) {}

    /// Translate the response; `None` input means no response was received
    async fn translate(&self, response: Option<RawResponse>) -> Option<Self::Output>;

    /// Listeners for transfer progress, if this request reports any
    fn progress_listeners(&self) -> Option<&ProgressListeners> {
        None
    }

    /// Cancel this request
    fn cancel(&self) -> bool {
        self.operation().cancel()
    }

    /// Whether this request has been cancelled
    fn is_cancelled(&self) -> bool {
        self.operation().is_cancelled()
    }
}

/// A [`RequestBuilder`] paired with a [`ResponseTranslator`]
#[derive(Debug)]
pub struct WebRequest<T> {
    builder: RequestBuilder,
    translator: T,
    operation: CancelableOperation,
    progress: ProgressListeners,
}

impl<T: ResponseTranslator> WebRequest<T> {
    /// Create a request translated by `translator`
    pub fn new(builder: RequestBuilder, translator: T) -> Self {
        Self {
            builder,
            translator,
            operation: CancelableOperation::new(),
            progress: ProgressListeners::new(),
        }
    }

    /// The request description
    pub fn builder(&self) -> &RequestBuilder {
        &self.builder
    }

    /// The translator
    pub fn translator(&self) -> &T {
        &self.translator
    }

    /// Subscribe to `(current, total)` progress while the response is processed
    pub fn add_progress_listener<F>(&self, listener: F) -> ProgressListenerId
    where
        F: Fn(u64, Option<u64>) + Send + Sync + 'static,
    {
        self.progress.add(listener)
    }

    pub fn remove_progress_listener(&self, id: ProgressListenerId) -> bool {
        self.progress.remove(id)
    }
}

impl WebRequest<FileTranslator> {
    /// A request that downloads the response body to `target`
    pub fn download(builder: RequestBuilder, target: impl Into<PathBuf>) -> Self {
        Self::new(builder, FileTranslator::new(target))
    }
}

#[async_trait]
impl<T: ResponseTranslator> RequestSpec for WebRequest<T> {
    type Output = T::Output;

    fn executable_request(&self) -> TransportResult<ExecutableRequest> {
        Ok(self.builder.build())
    }

    fn operation(&self) -> &CancelableOperation {
        &self.operation
    }

    async fn translate(&self, response: Option<RawResponse>) -> Option<Self::Output> {
        self.translator
            .translate_with_progress(response, &self.progress)
            .await
    }

    fn progress_listeners(&self) -> Option<&ProgressListeners> {
        Some(&self.progress)
    }
}
