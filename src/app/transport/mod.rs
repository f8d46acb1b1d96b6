//! Pluggable network transport
//!
//! The executor never talks to the network directly. It hands an
//! [`ExecutableRequest`] to a [`Transport`] and receives a [`RawResponse`] or a
//! [`TransportError`]. Cancellation reaches an in-flight operation through
//! [`Transport::abort`].
//!
//! - `config`: client settings (timeouts, user agent, certificate trust)
//! - `http`: the reqwest-backed [`HttpTransport`]

use async_trait::async_trait;

use super::request::{ExecutableRequest, RawResponse};
use crate::errors::TransportResult;

pub mod config;
pub mod http;

pub use config::{ClientConfig, TrustPolicy};
pub use http::HttpTransport;

/// Performs requests and aborts them on demand
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send the request and read the full response
    async fn perform(&self, request: &ExecutableRequest) -> TransportResult<RawResponse>;

    /// Interrupt an in-flight `perform` for this request
    ///
    /// May be called before, during, or after `perform`. An abort that arrives
    /// first must make the later `perform` fail fast.
    fn abort(&self, request: &ExecutableRequest);

    /// Drop any state kept for aborting this request
    ///
    /// Called once neither `perform` nor `abort` will be issued for the
    /// request again.
    fn release(&self, _request: &ExecutableRequest) {}
}
