//! Client-side control loop for one DAG.
//!
//! A [`DagHandler`] polls the agent that owns a DAG until the DAG reaches a
//! final state, reports each newly reached stage once and relays operator
//! commands. Transient fetch failures are retried against a fixed budget and
//! are never confused with a failure reported inside a fetched snapshot.

use crate::client::ShoalClient;
use crate::error::{ShoalError, ShoalResult};
use crate::progress::{ProgressReporter, SilentProgress};
use shoal_core::types::{AgentInfo, Dag, DagId, DagOperator, DagStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Status checks made after a local cancel before giving up on confirmation
const CONFIRM_ATTEMPTS: u32 = 30;
const CONFIRM_INTERVAL: Duration = Duration::from_millis(100);

/// Watches and steers a single DAG.
///
/// All methods take `&self`, so the handler can be shared between the task
/// running [`DagHandler::watch`] and the one issuing commands.
pub struct DagHandler {
    client: ShoalClient,
    dag_id: DagId,
    retry_times: u32,
    upgrade: bool,
    poll_interval: Duration,
    fetch_backoff: Duration,
    log_tail: usize,
    reporter: Arc<dyn ProgressReporter>,
    cancel: CancellationToken,
}

impl DagHandler {
    pub fn new(client: ShoalClient, dag: &Dag) -> Self {
        Self::from_id(client, dag.id)
    }

    pub fn from_id(client: ShoalClient, dag_id: DagId) -> Self {
        Self {
            // Fetches run against this handler's own budget
            client: client.without_retries(),
            dag_id,
            retry_times: 3,
            upgrade: false,
            poll_interval: Duration::from_secs(1),
            fetch_backoff: Duration::from_secs(1),
            log_tail: 20,
            reporter: Arc::new(SilentProgress),
            cancel: CancellationToken::new(),
        }
    }

    /// Address a specific agent instead of the one the client points at.
    pub fn with_agent(mut self, agent: &AgentInfo) -> ShoalResult<Self> {
        self.client = self.client.for_agent(agent)?;
        Ok(self)
    }

    /// How many consecutive transient fetch failures are tolerated.
    pub fn retry_times(mut self, retry_times: u32) -> Self {
        self.retry_times = retry_times;
        self
    }

    /// Fetch through the upgrade path. The upgrade path is asked first and the
    /// plain path only after it answers 404, so a plain query is never made
    /// for a DAG the agent serves as an upgrade.
    pub fn for_upgrade(mut self, upgrade: bool) -> Self {
        self.upgrade = upgrade;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn fetch_backoff(mut self, backoff: Duration) -> Self {
        self.fetch_backoff = backoff;
        self
    }

    /// Number of log lines shown for a failed task.
    pub fn log_tail(mut self, lines: usize) -> Self {
        self.log_tail = lines;
        self
    }

    pub fn reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn dag_id(&self) -> DagId {
        self.dag_id
    }

    /// Token that ends the polling wait early. Cancelling it alone does not
    /// cancel the DAG; use [`DagHandler::cancel`] for that.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Current snapshot, with the fetch retry budget applied.
    pub async fn get_dag(&self) -> ShoalResult<Dag> {
        self.fetch_with_retry().await
    }

    /// Poll until the DAG reaches a final state.
    ///
    /// Returns the final snapshot when the DAG succeeded, was cancelled or was
    /// rolled back, and [`ShoalError::DagFailed`] when it stopped on a failure.
    pub async fn watch(&self) -> ShoalResult<Dag> {
        let mut reported = 0;
        let mut confirm_left = CONFIRM_ATTEMPTS;

        loop {
            let dag = self.fetch_with_retry().await?;

            for stage in reported + 1..=dag.stage {
                self.reporter.stage_started(&dag, stage);
            }
            reported = reported.max(dag.stage);

            if dag.is_finished() {
                return self.finish(dag).await;
            }

            if self.cancel.is_cancelled() {
                // Keep asking until the agent confirms the dag is final
                if confirm_left == 0 {
                    return Err(ShoalError::WaitTimeout(format!(
                        "dag {} is still {:?} after cancellation",
                        dag.id, dag.status
                    )));
                }
                confirm_left -= 1;
                tokio::time::sleep(CONFIRM_INTERVAL).await;
                continue;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("Watch of dag {} cancelled, checking final status", self.dag_id);
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    pub async fn retry(&self) -> ShoalResult<Dag> {
        self.command(DagOperator::Retry).await
    }

    pub async fn pass(&self) -> ShoalResult<Dag> {
        self.command(DagOperator::Pass).await
    }

    pub async fn rollback(&self) -> ShoalResult<Dag> {
        self.command(DagOperator::Rollback).await
    }

    /// Cancel the DAG on the agent, then wake the watch loop so it confirms the result.
    pub async fn cancel(&self) -> ShoalResult<Dag> {
        let dag = self.command(DagOperator::Cancel).await?;
        self.cancel.cancel();
        Ok(dag)
    }

    async fn command(&self, operator: DagOperator) -> ShoalResult<Dag> {
        debug!("Sending {} to dag {}", operator, self.dag_id);
        self.client.dags().operator(&self.dag_id, operator).await
    }

    async fn finish(&self, dag: Dag) -> ShoalResult<Dag> {
        match dag.status {
            DagStatus::Succeeded => {
                self.reporter.dag_succeeded(&dag);
                Ok(dag)
            }
            DagStatus::Cancelled => {
                self.reporter.dag_cancelled(&dag);
                Ok(dag)
            }
            _ if dag.is_rolled_back() => {
                self.reporter.dag_rolled_back(&dag);
                Ok(dag)
            }
            _ => {
                let (node, task) = match dag.failed_task() {
                    Some((node, task)) => (node.name.clone(), Some(task.clone())),
                    None => (dag.current_node().name.clone(), None),
                };

                let logs = match &task {
                    Some(task) => self
                        .client
                        .dags()
                        .task_logs(&dag.id, &task.id, Some(self.log_tail))
                        .await
                        .unwrap_or_else(|e| {
                            warn!("Failed to fetch logs of task {}: {}", task.id, e);
                            Vec::new()
                        }),
                    None => Vec::new(),
                };

                self.reporter.dag_failed(&dag, &node, task.as_ref(), &logs);
                Err(ShoalError::DagFailed {
                    dag: dag.name,
                    node,
                    task: task.map(|t| t.name),
                })
            }
        }
    }

    async fn fetch(&self) -> ShoalResult<Dag> {
        let dags = self.client.dags();
        if self.upgrade {
            match dags.get_upgrade(&self.dag_id).await {
                Err(ShoalError::NotFound(_)) => {
                    debug!("Dag {} not served as upgrade, retrying plain query", self.dag_id);
                }
                other => return other,
            }
        }
        dags.get(&self.dag_id).await
    }

    async fn fetch_with_retry(&self) -> ShoalResult<Dag> {
        let mut failures = 0;
        loop {
            match self.fetch().await {
                Err(e) if e.is_retryable() && failures < self.retry_times => {
                    failures += 1;
                    warn!(
                        "Failed to fetch dag {} ({}/{}): {}",
                        self.dag_id, failures, self.retry_times, e
                    );
                    tokio::time::sleep(self.fetch_backoff).await;
                }
                result => return result,
            }
        }
    }
}
