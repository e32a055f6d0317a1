//! Operations API endpoints.

use crate::client::ShoalClient;
use crate::error::ShoalResult;
use serde::{Deserialize, Serialize};
use shoal_core::types::Capabilities;

pub struct OperationsApi<'a> {
    client: &'a ShoalClient,
}

impl<'a> OperationsApi<'a> {
    pub(crate) fn new(client: &'a ShoalClient) -> Self {
        Self { client }
    }

    /// Operation types the agent has registered.
    pub async fn list(&self) -> ShoalResult<Vec<OperationInfo>> {
        let response: ListOperationsResponse = self.client.http.get("/api/v1/operations").await?;
        Ok(response.operations)
    }
}

/// A registered operation type and the commands its tasks accept.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationInfo {
    pub type_name: String,
    pub capabilities: Capabilities,
}

#[derive(Debug, Serialize, Deserialize)]
struct ListOperationsResponse {
    operations: Vec<OperationInfo>,
}
