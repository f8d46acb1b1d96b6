//! reqwest-backed transport
//!
//! Each `perform` runs the send and body read on its own task so that `abort`
//! can stop it from any thread. Aborts that arrive before the task exists are
//! remembered and honored when `perform` starts; one that arrives after the
//! transfer is over is forgotten on `release`.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method};
use tokio::task::AbortHandle;
use tracing::{debug, trace};

use super::config::ClientConfig;
use super::Transport;
use crate::app::request::{ExecutableRequest, HttpMethod, RawResponse, RequestId};
use crate::errors::{ConfigResult, TransportError, TransportResult};

#[derive(Debug, Default)]
struct InFlight {
    running: HashMap<RequestId, AbortHandle>,
    aborted_early: HashSet<RequestId>,
}

/// HTTP transport over a shared reqwest client
#[derive(Debug)]
pub struct HttpTransport {
    client: Client,
    read_timeout: Duration,
    in_flight: Mutex<InFlight>,
}

impl HttpTransport {
    /// Build a transport from client settings
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::HttpClient` if the client cannot be built
    pub fn new(config: &ClientConfig) -> ConfigResult<Self> {
        let client = config.build_http_client()?;
        Ok(Self::with_client(client, config.read_timeout))
    }

    /// Wrap an existing client
    pub fn with_client(client: Client, read_timeout: Duration) -> Self {
        Self {
            client,
            read_timeout,
            in_flight: Mutex::new(InFlight::default()),
        }
    }

    fn in_flight(&self) -> MutexGuard<'_, InFlight> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of transfers currently running
    pub fn running(&self) -> usize {
        self.in_flight().running.len()
    }

    /// Number of aborts remembered for requests with no transfer running
    pub fn pending_aborts(&self) -> usize {
        self.in_flight().aborted_early.len()
    }

    fn method(method: HttpMethod) -> Method {
        match method {
            HttpMethod::Get => Method::GET,
            HttpMethod::Head => Method::HEAD,
            HttpMethod::Post => Method::POST,
            HttpMethod::Put => Method::PUT,
            HttpMethod::Delete => Method::DELETE,
        }
    }

    fn map_error(&self, error: reqwest::Error) -> TransportError {
        if error.is_timeout() {
            TransportError::Timeout {
                millis: self.read_timeout.as_millis() as u64,
            }
        } else {
            TransportError::Http(error)
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn perform(&self, request: &ExecutableRequest) -> TransportResult<RawResponse> {
        let mut builder = self
            .client
            .request(Self::method(request.method), request.url.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let task = {
            let mut in_flight = self.in_flight();
            if in_flight.aborted_early.remove(&request.id) {
                debug!("Request {} aborted before it was sent", request.id);
                return Err(TransportError::Aborted {
                    request_id: request.id.value(),
                });
            }

            let task = tokio::spawn(async move {
                let response = builder.send().await?;
                let status = response.status();
                let headers = response
                    .headers()
                    .iter()
                    .filter_map(|(name, value)| {
                        value
                            .to_str()
                            .ok()
                            .map(|v| (name.as_str().to_string(), v.to_string()))
                    })
                    .collect();
                let body = response.bytes().await?.to_vec();

                Ok::<_, reqwest::Error>(RawResponse {
                    status: status.as_u16(),
                    reason: status.canonical_reason().map(str::to_string),
                    headers,
                    body,
                })
            });
            in_flight.running.insert(request.id, task.abort_handle());
            task
        };

        trace!("{} {} started", request.method, request.url);
        let outcome = task.await;
        self.in_flight().running.remove(&request.id);

        match outcome {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(self.map_error(e)),
            Err(e) if e.is_cancelled() => Err(TransportError::Aborted {
                request_id: request.id.value(),
            }),
            Err(e) => Err(TransportError::Other(format!("Transfer task failed: {}", e))),
        }
    }

    fn abort(&self, request: &ExecutableRequest) {
        let mut in_flight = self.in_flight();
        match in_flight.running.remove(&request.id) {
            Some(handle) => {
                debug!("Aborting in-flight request {}", request.id);
                handle.abort();
            }
            None => {
                in_flight.aborted_early.insert(request.id);
            }
        }
    }

    fn release(&self, request: &ExecutableRequest) {
        let mut in_flight = self.in_flight();
        if in_flight.aborted_early.remove(&request.id) {
            trace!("Dropped late abort of request {}", request.id);
        }
        in_flight.running.remove(&request.id);
    }
}
