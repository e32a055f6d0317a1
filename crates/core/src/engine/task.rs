use super::registry::OperationRegistry;
use crate::error::EngineError;
use crate::events::DispatchAction;
use crate::storage::DagStore;
use crate::types::{AgentInfo, Capabilities, DagId, Task, TaskContext, TaskId, TaskLogEntry, TaskStatus};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Behavior of one operation type.
///
/// `execute` may be invoked more than once with the same persisted context
/// (operator retry, restart recovery) and must converge to the same result.
/// Progress goes through [`TaskRun::log`] so it is visible while running.
#[async_trait::async_trait]
pub trait Operation: Send + Sync {
    /// Registry key, persisted with every task of this type
    fn type_name(&self) -> &str;

    /// Operator commands tasks of this type accept
    fn capabilities(&self) -> Capabilities;

    async fn execute(&self, run: &mut TaskRun) -> anyhow::Result<()>;

    /// Compensating action
    async fn rollback(&self, run: &mut TaskRun) -> anyhow::Result<()> {
        run.log("nothing to roll back");
        Ok(())
    }
}

/// Destination for task log lines as they are produced
pub trait LogSink: Send + Sync {
    fn append(&self, task_id: &TaskId, entry: &TaskLogEntry) -> anyhow::Result<()>;
}

/// Writes log lines straight into the task log table
pub struct StoreLogSink {
    store: Arc<dyn DagStore>,
}

impl StoreLogSink {
    pub fn new(store: Arc<dyn DagStore>) -> Self {
        Self { store }
    }
}

impl LogSink for StoreLogSink {
    fn append(&self, task_id: &TaskId, entry: &TaskLogEntry) -> anyhow::Result<()> {
        self.store.append_task_log(task_id, entry)
    }
}

/// Collects a task's log lines, forwarding each one to an optional sink
pub struct TaskLogger {
    task_id: TaskId,
    entries: Vec<TaskLogEntry>,
    sink: Option<Arc<dyn LogSink>>,
}

impl TaskLogger {
    pub fn new(task_id: TaskId, sink: Option<Arc<dyn LogSink>>) -> Self {
        Self {
            task_id,
            entries: Vec::new(),
            sink,
        }
    }

    pub fn log(&mut self, message: impl Into<String>) {
        let entry = TaskLogEntry::new(message);
        tracing::debug!(task_id = %self.task_id, "{}", entry.message);

        if let Some(sink) = &self.sink {
            if let Err(e) = sink.append(&self.task_id, &entry) {
                tracing::warn!("Failed to persist log line for task {}: {}", self.task_id, e);
            }
        }
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[TaskLogEntry] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<TaskLogEntry> {
        self.entries
    }
}

/// Everything an operation sees while it runs
pub struct TaskRun {
    dag_id: DagId,
    task_id: TaskId,
    context: TaskContext,
    local_agent: AgentInfo,
    logger: TaskLogger,
    cancel: CancellationToken,
}

impl TaskRun {
    pub fn new(
        dag_id: DagId,
        task_id: TaskId,
        context: TaskContext,
        local_agent: AgentInfo,
        logger: TaskLogger,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            dag_id,
            task_id,
            context,
            local_agent,
            logger,
            cancel,
        }
    }

    pub fn dag_id(&self) -> DagId {
        self.dag_id
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn context(&self) -> &TaskContext {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut TaskContext {
        &mut self.context
    }

    /// The agent this run takes place on
    pub fn local_agent(&self) -> &AgentInfo {
        &self.local_agent
    }

    pub fn is_real_execute_agent(&self) -> bool {
        self.local_agent == self.context.execute_agent
    }

    pub fn log(&mut self, message: impl Into<String>) {
        self.logger.log(message);
    }

    /// Lines logged so far in this run
    pub fn logs(&self) -> &[TaskLogEntry] {
        self.logger.entries()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn finish(self) -> (TaskContext, Vec<TaskLogEntry>) {
        (self.context, self.logger.into_entries())
    }
}

/// A task sent to one agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub dag_id: DagId,
    pub task: Task,
    pub action: DispatchAction,
}

/// What one agent reports back for a dispatched task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task_id: TaskId,
    pub agent: AgentInfo,
    pub status: TaskStatus,
    pub error: Option<String>,
    pub context: TaskContext,
    #[serde(default)]
    pub logs: Vec<TaskLogEntry>,
}

/// Receiving side of a dispatch: restores the operation and runs it
#[derive(Clone)]
pub struct TaskRunner {
    registry: Arc<OperationRegistry>,
}

impl TaskRunner {
    pub fn new(registry: Arc<OperationRegistry>) -> Self {
        Self { registry }
    }

    /// Run `request` as `agent`. Only the task's execute agent performs the
    /// operation; every other participant acknowledges without side effects.
    pub async fn run(
        &self,
        agent: &AgentInfo,
        request: DispatchRequest,
        cancel: CancellationToken,
        sink: Option<Arc<dyn LogSink>>,
    ) -> TaskOutcome {
        let DispatchRequest {
            dag_id,
            task,
            action,
        } = request;
        let success = match action {
            DispatchAction::Execute => TaskStatus::Succeeded,
            DispatchAction::Rollback => TaskStatus::RolledBack,
        };

        let mut logger = TaskLogger::new(task.id, sink);

        let instance = match self.registry.instantiate(&task.type_name, task.context.clone()) {
            Ok(instance) => instance,
            Err(e) => {
                logger.log(e.to_string());
                return TaskOutcome {
                    task_id: task.id,
                    agent: agent.clone(),
                    status: TaskStatus::Failed,
                    error: Some(e.to_string()),
                    context: task.context,
                    logs: logger.into_entries(),
                };
            }
        };

        let mut run = TaskRun::new(
            dag_id,
            task.id,
            instance.context,
            agent.clone(),
            logger,
            cancel.clone(),
        );

        if !run.is_real_execute_agent() {
            let message = format!(
                "{} is not the execute agent ({}), skipped",
                agent,
                run.context().execute_agent
            );
            run.log(message);
            let (context, logs) = run.finish();
            return TaskOutcome {
                task_id: task.id,
                agent: agent.clone(),
                status: success,
                error: None,
                context,
                logs,
            };
        }

        tracing::info!(
            "Running task '{}' ({}) action={:?} dag_id={}",
            task.name,
            task.type_name,
            action,
            dag_id
        );

        let operation = instance.operation;
        let result = if cancel.is_cancelled() {
            Err(anyhow::anyhow!("task cancelled"))
        } else {
            tokio::select! {
                r = async {
                    match action {
                        DispatchAction::Execute => operation.execute(&mut run).await,
                        DispatchAction::Rollback => operation.rollback(&mut run).await,
                    }
                } => r,
                _ = cancel.cancelled() => Err(anyhow::anyhow!("task cancelled")),
            }
        };

        let (status, error) = match result {
            Ok(()) => (success, None),
            Err(e) => {
                let error = EngineError::TaskExecutionFailed(format!("{:#}", e));
                tracing::warn!("Task '{}' failed: {}", task.name, error);
                // Recorded verbatim
                run.log(format!("{:#}", e));
                (TaskStatus::Failed, Some(error.to_string()))
            }
        };

        let (context, logs) = run.finish();
        TaskOutcome {
            task_id: task.id,
            agent: agent.clone(),
            status,
            error,
            context,
            logs,
        }
    }
}
