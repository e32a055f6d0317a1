//! Main client for the shoal SDK.

use crate::api::*;
use crate::config::{ClientConfig, RetryConfig};
use crate::error::{ShoalError, ShoalResult};
use crate::transport::HttpTransport;
use shoal_core::types::AgentInfo;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Client for one agent's HTTP API.
#[derive(Clone)]
pub struct ShoalClient {
    config: Arc<ClientConfig>,
    pub(crate) http: HttpTransport,
}

impl ShoalClient {
    /// Create a new client builder.
    pub fn builder() -> ShoalClientBuilder {
        ShoalClientBuilder::new()
    }

    /// Create a client from configuration.
    pub fn from_config(config: ClientConfig) -> ShoalResult<Self> {
        let config = Arc::new(config);
        let http = HttpTransport::new(config.clone())?;

        Ok(Self { config, http })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// A client with the same settings that talks to another agent directly.
    pub fn for_agent(&self, agent: &AgentInfo) -> ShoalResult<Self> {
        let mut config = (*self.config).clone();
        config.base_url = Url::parse(&agent.base_url())?;
        Self::from_config(config)
    }

    /// A client sharing this one's connections whose reads are never retried
    /// by the transport, for callers that run their own retry budget.
    pub fn without_retries(&self) -> Self {
        let http = self.http.with_retry_config(RetryConfig::no_retry());
        Self {
            config: http.config().clone(),
            http,
        }
    }

    /// Get the health API.
    pub fn health(&self) -> HealthApi<'_> {
        HealthApi::new(self)
    }

    /// Get the DAG API.
    pub fn dags(&self) -> DagsApi<'_> {
        DagsApi::new(self)
    }

    /// Get the operations API.
    pub fn operations(&self) -> OperationsApi<'_> {
        OperationsApi::new(self)
    }

    /// Get the agent-to-agent API.
    pub fn agent(&self) -> AgentApi<'_> {
        AgentApi::new(self)
    }
}

/// Builder for creating a ShoalClient.
pub struct ShoalClientBuilder {
    base_url: Option<String>,
    token: Option<String>,
    timeout: Duration,
    retry_config: RetryConfig,
}

impl ShoalClientBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            base_url: None,
            token: None,
            timeout: Duration::from_secs(30),
            retry_config: RetryConfig::default(),
        }
    }

    /// Set the base URL of the agent.
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Set the bearer token for authentication.
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Set the request timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the retry configuration.
    pub fn retry_config(mut self, config: RetryConfig) -> Self {
        self.retry_config = config;
        self
    }

    /// Build the client.
    pub fn build(self) -> ShoalResult<ShoalClient> {
        let base_url_str = self
            .base_url
            .ok_or_else(|| ShoalError::Config("base_url is required".to_string()))?;

        let base_url = Url::parse(&base_url_str)?;

        let config = ClientConfig {
            base_url,
            token: self.token,
            timeout: self.timeout,
            retry_config: self.retry_config,
        };

        ShoalClient::from_config(config)
    }
}

impl Default for ShoalClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}
