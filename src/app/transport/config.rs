//! HTTP client configuration and building logic

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::constants::{connections, http};
use crate::errors::{ConfigError, ConfigResult};

/// Which server certificates the client accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustPolicy {
    /// Platform trust roots
    #[default]
    System,
    /// Accept any certificate; only for test servers with self-signed certs
    AcceptAll,
}

/// Settings used to build the underlying HTTP client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Connect timeout
    pub connect_timeout: Duration,
    /// Timeout for the whole response once connected
    pub read_timeout: Duration,
    /// User-Agent header sent with every request
    pub user_agent: String,
    /// Certificate trust policy
    pub trust_policy: TrustPolicy,
    /// TCP nodelay (disable Nagle's algorithm)
    pub tcp_nodelay: bool,
    /// Connection pool idle timeout
    pub pool_idle_timeout: Option<Duration>,
    /// Maximum idle connections kept per host
    pub pool_max_idle_per_host: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: connections::DEFAULT_CONNECTION_TIMEOUT,
            read_timeout: connections::DEFAULT_READ_TIMEOUT,
            user_agent: http::USER_AGENT.to_string(),
            trust_policy: TrustPolicy::System,
            tcp_nodelay: true,
            pool_idle_timeout: Some(http::POOL_IDLE_TIMEOUT),
            pool_max_idle_per_host: http::POOL_MAX_IDLE_PER_HOST,
        }
    }
}

impl ClientConfig {
    /// Set the connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the read timeout
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Set the user agent
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Set the certificate trust policy
    pub fn with_trust_policy(mut self, policy: TrustPolicy) -> Self {
        self.trust_policy = policy;
        self
    }

    /// Builds the HTTP client with the specified configuration
    pub fn build_http_client(&self) -> ConfigResult<Client> {
        let mut client_builder = Client::builder()
            .timeout(self.read_timeout)
            .connect_timeout(self.connect_timeout)
            .user_agent(self.user_agent.as_str())
            .tcp_nodelay(self.tcp_nodelay)
            .pool_max_idle_per_host(self.pool_max_idle_per_host);

        if let Some(idle_timeout) = self.pool_idle_timeout {
            client_builder = client_builder.pool_idle_timeout(idle_timeout);
        }

        if self.trust_policy == TrustPolicy::AcceptAll {
            tracing::warn!("Certificate validation disabled for HTTP client");
            client_builder = client_builder.danger_accept_invalid_certs(true);
        }

        client_builder.build().map_err(ConfigError::HttpClient)
    }
}
