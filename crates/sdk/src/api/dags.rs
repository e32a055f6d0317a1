//! DAG API endpoints.

use crate::client::ShoalClient;
use crate::error::ShoalResult;
use serde::{Deserialize, Serialize};
use shoal_core::events::Event;
use shoal_core::types::{Dag, DagId, DagOperator, DagOperatorRequest, DagSpec, TaskId, TaskLogEntry};

/// DAG API for submitting, observing and steering DAGs.
pub struct DagsApi<'a> {
    client: &'a ShoalClient,
}

impl<'a> DagsApi<'a> {
    pub(crate) fn new(client: &'a ShoalClient) -> Self {
        Self { client }
    }

    /// Submit a new DAG.
    pub async fn submit(&self, spec: &DagSpec) -> ShoalResult<Dag> {
        self.client.http.post("/api/v1/dags", spec).await
    }

    /// List all DAGs known to the agent.
    pub async fn list(&self) -> ShoalResult<Vec<Dag>> {
        let response: ListDagsResponse = self.client.http.get("/api/v1/dags").await?;
        Ok(response.dags)
    }

    /// Get a DAG snapshot.
    pub async fn get(&self, dag_id: &DagId) -> ShoalResult<Dag> {
        self.client.http.get(&format!("/api/v1/dags/{}", dag_id)).await
    }

    /// Get a DAG snapshot through the upgrade query path. Only upgrade DAGs are served there.
    pub async fn get_upgrade(&self, dag_id: &DagId) -> ShoalResult<Dag> {
        self.client
            .http
            .get(&format!("/api/v1/upgrade/dags/{}", dag_id))
            .await
    }

    /// Send an operator command.
    pub async fn operator(&self, dag_id: &DagId, operator: DagOperator) -> ShoalResult<Dag> {
        self.client
            .http
            .post(
                &format!("/api/v1/dags/{}/operator", dag_id),
                &DagOperatorRequest { operator },
            )
            .await
    }

    /// Execution log of a task, optionally only its last `tail` lines.
    pub async fn task_logs(
        &self,
        dag_id: &DagId,
        task_id: &TaskId,
        tail: Option<usize>,
    ) -> ShoalResult<Vec<TaskLogEntry>> {
        let path = format!("/api/v1/dags/{}/tasks/{}/logs", dag_id, task_id);
        let response: TaskLogsResponse = match tail {
            Some(tail) => {
                self.client
                    .http
                    .get_with_query(&path, &[("tail", tail)])
                    .await?
            }
            None => self.client.http.get(&path).await?,
        };
        Ok(response.logs)
    }

    /// Audit trail of a DAG.
    pub async fn events(&self, dag_id: &DagId) -> ShoalResult<Vec<Event>> {
        let response: DagEventsResponse = self
            .client
            .http
            .get(&format!("/api/v1/dags/{}/events", dag_id))
            .await?;
        Ok(response.events)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ListDagsResponse {
    dags: Vec<Dag>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TaskLogsResponse {
    logs: Vec<TaskLogEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct DagEventsResponse {
    events: Vec<Event>,
}
