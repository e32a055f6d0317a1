//! Agent-to-agent endpoints.

use crate::client::ShoalClient;
use crate::error::ShoalResult;
use shoal_core::engine::{DispatchRequest, TaskOutcome};

/// Task dispatch between agents taking part in the same DAG.
pub struct AgentApi<'a> {
    client: &'a ShoalClient,
}

impl<'a> AgentApi<'a> {
    pub(crate) fn new(client: &'a ShoalClient) -> Self {
        Self { client }
    }

    /// Run a task on this agent and wait for its outcome.
    pub async fn dispatch(&self, request: &DispatchRequest) -> ShoalResult<TaskOutcome> {
        self.client.http.post("/api/v1/agent/dispatch", request).await
    }
}
