//! Health API endpoints.

use crate::client::ShoalClient;
use crate::error::ShoalResult;
use serde::{Deserialize, Serialize};

/// Health API for checking agent status.
pub struct HealthApi<'a> {
    client: &'a ShoalClient,
}

impl<'a> HealthApi<'a> {
    pub(crate) fn new(client: &'a ShoalClient) -> Self {
        Self { client }
    }

    /// Check basic health status.
    pub async fn check(&self) -> ShoalResult<HealthCheck> {
        self.client.http.get("/api/health").await
    }
}

/// Basic health check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    pub status: String,
    /// `ip:port` the agent identifies as
    pub agent: String,
}
