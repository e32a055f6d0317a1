//! reqwest transport shared by every API group.

use crate::config::{ClientConfig, RetryConfig};
use crate::error::{ShoalError, ShoalResult};
use reqwest::{header, Client, RequestBuilder, Response};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Sends JSON requests to one agent.
///
/// Reads are retried according to [`RetryConfig`]; writes are sent once.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    config: Arc<ClientConfig>,
}

impl HttpTransport {
    pub fn new(config: Arc<ClientConfig>) -> ShoalResult<Self> {
        let mut headers = header::HeaderMap::new();

        if let Some(ref token) = config.token {
            let mut value = header::HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|_| ShoalError::Config("Invalid token format".to_string()))?;
            value.set_sensitive(true);
            headers.insert(header::AUTHORIZATION, value);
        }

        let client = Client::builder()
            .timeout(config.timeout)
            .default_headers(headers)
            .build()?;

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &Arc<ClientConfig> {
        &self.config
    }

    /// Same connection pool and headers, different read retry policy.
    pub fn with_retry_config(&self, retry_config: RetryConfig) -> Self {
        let mut config = (*self.config).clone();
        config.retry_config = retry_config;
        Self {
            client: self.client.clone(),
            config: Arc::new(config),
        }
    }

    fn build_url(&self, path: &str) -> ShoalResult<url::Url> {
        self.config
            .base_url
            .join(path)
            .map_err(ShoalError::InvalidUrl)
    }

    /// Send once, mapping non-2xx answers to [`ShoalError`].
    async fn send(&self, request: RequestBuilder) -> ShoalResult<Response> {
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ShoalError::Timeout
            } else {
                ShoalError::Http(e)
            }
        })?;

        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Err(ShoalError::from_response(status, &body))
    }

    async fn send_read(&self, request: RequestBuilder) -> ShoalResult<Response> {
        let policy = &self.config.retry_config;
        let mut attempt = 0;

        loop {
            let attempt_request = request
                .try_clone()
                .ok_or_else(|| ShoalError::Config("Request cannot be cloned".to_string()))?;

            match self.send(attempt_request).await {
                Err(e) if policy.permits(attempt, &e) => {
                    attempt += 1;
                    warn!(
                        attempt = attempt,
                        backoff_ms = policy.backoff.as_millis() as u64,
                        "Read failed, retrying: {}",
                        e
                    );
                    tokio::time::sleep(policy.backoff).await;
                }
                result => return result,
            }
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> ShoalResult<T> {
        let url = self.build_url(path)?;
        debug!(url = %url, "GET");

        let response = self.send_read(self.client.get(url)).await?;
        Ok(response.json().await?)
    }

    pub async fn get_with_query<T: DeserializeOwned, Q: Serialize>(
        &self,
        path: &str,
        query: &Q,
    ) -> ShoalResult<T> {
        let url = self.build_url(path)?;
        debug!(url = %url, "GET with query");

        let response = self.send_read(self.client.get(url).query(query)).await?;
        Ok(response.json().await?)
    }

    /// POST `body` exactly once.
    pub async fn post<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> ShoalResult<T> {
        let url = self.build_url(path)?;
        debug!(url = %url, "POST");

        let response = self.send(self.client.post(url).json(body)).await?;
        Ok(response.json().await?)
    }
}
