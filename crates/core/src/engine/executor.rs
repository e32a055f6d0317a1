use super::dag::DagBuilder;
use super::dispatch::AgentDispatcher;
use super::registry::OperationRegistry;
use super::task::{DispatchRequest, TaskOutcome};
use crate::error::{EngineError, EngineResult};
use crate::events::{DispatchAction, Event, EventLog, EventType};
use crate::storage::DagStore;
use crate::types::{
    AgentInfo, Dag, DagId, DagOperator, DagSpec, DagStatus, NodeStatus, Task, TaskId,
    TaskLogEntry, TaskStatus,
};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

type Batch = Vec<(Task, Vec<AgentInfo>)>;
type Reports = Vec<(TaskId, AgentInfo, EngineResult<TaskOutcome>)>;
type LogLines = Vec<(TaskId, TaskLogEntry)>;

/// Handle of a running drive loop
struct ActiveDag {
    generation: u64,
    cancel: CancellationToken,
}

enum Step {
    Continue,
    Stop,
}

/// Drives DAGs forward and applies operator commands.
///
/// The persisted record is the only source of truth. Every mutation of a DAG
/// happens under that DAG's lock and is committed with compare-and-set on
/// `Dag::version`.
#[derive(Clone)]
pub struct DagExecutor {
    store: Arc<dyn DagStore>,
    journal: Arc<dyn EventLog>,
    dispatcher: Arc<dyn AgentDispatcher>,
    registry: Arc<OperationRegistry>,
    builder: DagBuilder,
    locks: Arc<Mutex<HashMap<DagId, Arc<Mutex<()>>>>>,
    // Drive loops in flight, for cancellation
    active: Arc<RwLock<HashMap<DagId, ActiveDag>>>,
    generation: Arc<AtomicU64>,
}

impl DagExecutor {
    pub fn new(
        store: Arc<dyn DagStore>,
        journal: Arc<dyn EventLog>,
        dispatcher: Arc<dyn AgentDispatcher>,
        registry: Arc<OperationRegistry>,
    ) -> Self {
        Self {
            store,
            journal,
            dispatcher,
            builder: DagBuilder::new(registry.clone()),
            registry,
            locks: Arc::new(Mutex::new(HashMap::new())),
            active: Arc::new(RwLock::new(HashMap::new())),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn registry(&self) -> &Arc<OperationRegistry> {
        &self.registry
    }

    /// Validate, persist and start a new DAG
    pub async fn submit(&self, spec: DagSpec) -> EngineResult<Dag> {
        let dag = self.builder.build(spec)?;
        self.store.save_dag(&dag)?;

        tracing::info!(
            "Submitted dag '{}' ({}) with {} stage(s)",
            dag.name,
            dag.id,
            dag.max_stage
        );
        self.record(
            dag.id,
            EventType::DagSubmitted {
                name: dag.name.clone(),
                max_stage: dag.max_stage,
            },
        )
        .await;

        let lock = self.lock_for(dag.id).await;
        let _guard = lock.lock().await;
        self.spawn_drive(dag.id).await;

        Ok(dag)
    }

    pub async fn get_dag(&self, dag_id: DagId) -> EngineResult<Dag> {
        self.load(&dag_id)
    }

    pub async fn list_dags(&self) -> EngineResult<Vec<Dag>> {
        Ok(self.store.list_dags()?)
    }

    /// Execution log of a task, optionally only the last `tail` lines
    pub async fn task_logs(
        &self,
        dag_id: DagId,
        task_id: TaskId,
        tail: Option<usize>,
    ) -> EngineResult<Vec<TaskLogEntry>> {
        let dag = self.load(&dag_id)?;
        if dag.task(&task_id).is_none() {
            return Err(EngineError::TaskNotFound(task_id.to_string()));
        }

        Ok(self.store.task_logs(&task_id, tail)?)
    }

    /// Audit trail of a DAG
    pub async fn dag_events(&self, dag_id: DagId) -> EngineResult<Vec<Event>> {
        self.load(&dag_id)?;
        Ok(self.journal.get_dag_events(dag_id).await?)
    }

    pub async fn is_active(&self, dag_id: DagId) -> bool {
        self.active.read().await.contains_key(&dag_id)
    }

    /// Apply an operator command
    pub async fn command(&self, dag_id: DagId, operator: DagOperator) -> EngineResult<Dag> {
        let result = self.apply_command(dag_id, operator).await;
        if !self.is_active(dag_id).await {
            self.prune_lock(dag_id).await;
        }
        result
    }

    async fn apply_command(&self, dag_id: DagId, operator: DagOperator) -> EngineResult<Dag> {
        let lock = self.lock_for(dag_id).await;
        let _guard = lock.lock().await;

        let mut dag = self.load(&dag_id)?;
        let logs = match operator {
            DagOperator::Run => return Err(invalid_state(&dag, operator)),
            DagOperator::Retry => prepare_retry(&mut dag)?,
            DagOperator::Pass => prepare_pass(&mut dag)?,
            DagOperator::Rollback => prepare_rollback(&mut dag)?,
            DagOperator::Cancel => prepare_cancel(&mut dag)?,
        };
        dag.operator = operator;
        self.commit(&mut dag)?;
        self.append_logs(&logs);

        tracing::warn!(
            "Operator command {} applied to dag '{}' ({})",
            operator,
            dag.name,
            dag.id
        );
        self.record(dag_id, EventType::OperatorCommand { operator }).await;

        if operator == DagOperator::Cancel {
            if let Some(active) = self.active.write().await.remove(&dag_id) {
                active.cancel.cancel();
            }
            self.record(dag_id, EventType::DagCancelled).await;
        } else {
            self.spawn_drive(dag_id).await;
        }

        Ok(dag)
    }

    /// Resume every DAG that was running when the process stopped
    pub async fn recover(&self) -> EngineResult<usize> {
        let mut resumed = 0;

        for dag in self.store.list_dags()?.into_iter().filter(Dag::is_running) {
            let lock = self.lock_for(dag.id).await;
            let _guard = lock.lock().await;

            let interrupted = dag
                .nodes
                .iter()
                .flat_map(|n| n.tasks.iter())
                .filter(|t| t.status == TaskStatus::Running);

            for task in interrupted {
                let (status, message) =
                    match self.registry.instantiate(&task.type_name, task.context.clone()) {
                        Err(e) => (TaskStatus::Failed, e.to_string()),
                        Ok(_) if !task.capabilities.can_continue => (
                            TaskStatus::Failed,
                            "interrupted by agent restart and cannot be continued".to_string(),
                        ),
                        Ok(_) => (
                            TaskStatus::Pending,
                            "interrupted by agent restart, resuming".to_string(),
                        ),
                    };
                tracing::info!(
                    "Recovering task '{}' of dag {}: {}",
                    task.name,
                    dag.id,
                    message
                );
                self.store.save_task_status(
                    &dag.id,
                    &task.id,
                    status,
                    &[TaskLogEntry::new(message)],
                )?;
            }

            self.record(dag.id, EventType::DagRecovered { stage: dag.stage })
                .await;
            self.spawn_drive(dag.id).await;
            resumed += 1;
        }

        if resumed > 0 {
            tracing::info!("Resumed {} running dag(s)", resumed);
        }
        Ok(resumed)
    }

    /// Stop every drive loop. Interrupted tasks are picked up by `recover` on next start.
    pub async fn shutdown(&self) {
        let mut active = self.active.write().await;
        for (dag_id, dag) in active.drain() {
            tracing::debug!("Stopping drive loop of dag {}", dag_id);
            dag.cancel.cancel();
        }
    }

    async fn lock_for(&self, dag_id: DagId) -> Arc<Mutex<()>> {
        self.locks.lock().await.entry(dag_id).or_default().clone()
    }

    /// Forget a DAG's lock once no one holds or waits on it. Clones are only
    /// handed out under the map lock, so a count of one cannot race.
    async fn prune_lock(&self, dag_id: DagId) {
        let mut locks = self.locks.lock().await;
        if locks.get(&dag_id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(&dag_id);
        }
    }

    fn load(&self, dag_id: &DagId) -> EngineResult<Dag> {
        self.store
            .load_dag(dag_id)?
            .ok_or(EngineError::DagNotFound(*dag_id))
    }

    fn commit(&self, dag: &mut Dag) -> EngineResult<()> {
        let expected = dag.version;
        dag.version = expected + 1;
        dag.updated_at = chrono::Utc::now();

        if self.store.compare_and_swap(dag, expected)? {
            Ok(())
        } else {
            dag.version = expected;
            Err(EngineError::VersionConflict {
                dag: dag.id,
                expected,
            })
        }
    }

    fn append_logs(&self, logs: &[(TaskId, TaskLogEntry)]) {
        for (task_id, entry) in logs {
            if let Err(e) = self.store.append_task_log(task_id, entry) {
                tracing::warn!("Failed to append log for task {}: {}", task_id, e);
            }
        }
    }

    async fn record(&self, dag_id: DagId, event_type: EventType) {
        if let Err(e) = self.journal.append(Event::new(dag_id, event_type)).await {
            tracing::warn!("Failed to journal event for dag {}: {}", dag_id, e);
        }
    }

    /// Start a drive loop unless one is already registered. Callers hold the DAG lock.
    async fn spawn_drive(&self, dag_id: DagId) {
        let mut active = self.active.write().await;
        if active.contains_key(&dag_id) {
            return;
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        active.insert(
            dag_id,
            ActiveDag {
                generation,
                cancel: cancel.clone(),
            },
        );
        drop(active);

        let this = self.clone();
        tokio::spawn(this.drive(dag_id, generation, cancel));
    }

    async fn drive(self, dag_id: DagId, generation: u64, cancel: CancellationToken) {
        tracing::debug!("Drive loop started for dag {}", dag_id);

        loop {
            match self.step(dag_id, &cancel).await {
                Ok(Step::Continue) => continue,
                Err(EngineError::VersionConflict { .. }) => {
                    tracing::warn!("Dag {} changed underneath the drive loop, reloading", dag_id);
                    continue;
                }
                Ok(Step::Stop) => {
                    let lock = self.lock_for(dag_id).await;
                    let _guard = lock.lock().await;

                    // A command may have made the dag runnable again before we got the lock
                    let runnable = !cancel.is_cancelled()
                        && matches!(self.store.load_dag(&dag_id), Ok(Some(ref dag)) if dag.is_running());
                    if runnable {
                        continue;
                    }
                    self.deregister(dag_id, generation).await;
                    break;
                }
                Err(e) => {
                    tracing::error!("Drive loop of dag {} stopped: {}", dag_id, e);
                    let lock = self.lock_for(dag_id).await;
                    let _guard = lock.lock().await;
                    self.deregister(dag_id, generation).await;
                    break;
                }
            }
        }

        self.prune_lock(dag_id).await;
        tracing::debug!("Drive loop finished for dag {}", dag_id);
    }

    async fn deregister(&self, dag_id: DagId, generation: u64) {
        let mut active = self.active.write().await;
        if active.get(&dag_id).map(|a| a.generation) == Some(generation) {
            active.remove(&dag_id);
        }
    }

    async fn step(&self, dag_id: DagId, cancel: &CancellationToken) -> EngineResult<Step> {
        if cancel.is_cancelled() {
            return Ok(Step::Stop);
        }

        let lock = self.lock_for(dag_id).await;
        let guard = lock.lock().await;

        let mut dag = self.load(&dag_id)?;
        if !dag.is_running() {
            return Ok(Step::Stop);
        }

        let (action, batch) = if dag.operator == DagOperator::Rollback {
            match self.unwind_step(&mut dag).await? {
                Some(batch) => (DispatchAction::Rollback, batch),
                None => return Ok(Step::Continue),
            }
        } else {
            match self.forward_step(&mut dag).await? {
                Some(batch) => (DispatchAction::Execute, batch),
                None => return Ok(Step::Continue),
            }
        };
        let stage = dag.stage;
        drop(guard);

        // Node barrier: wait for every target of every task
        let reports = tokio::select! {
            reports = self.dispatch_batch(dag_id, batch, action, cancel) => reports,
            _ = cancel.cancelled() => return Ok(Step::Stop),
        };

        let _guard = lock.lock().await;
        let mut dag = self.load(&dag_id)?;
        if !dag.is_running() || dag.stage != stage {
            return Ok(Step::Continue);
        }

        let (events, logs, failure) = apply_reports(&mut dag, reports, action);
        if action == DispatchAction::Rollback {
            if let Some(error) = &failure {
                dag.status = DagStatus::Failed;
                tracing::error!("Rollback of dag '{}' ({}) failed: {}", dag.name, dag.id, error);
            }
        }
        self.commit(&mut dag)?;
        self.append_logs(&logs);
        for event in events {
            self.record(dag_id, event).await;
        }
        if action == DispatchAction::Rollback {
            if let Some(error) = failure {
                self.record(dag_id, EventType::DagFailed { stage, error }).await;
            }
        }

        Ok(Step::Continue)
    }

    /// Advance past a finished node, or mark the current node's tasks running
    /// and return them for dispatch
    async fn forward_step(&self, dag: &mut Dag) -> EngineResult<Option<Batch>> {
        let stage = dag.stage;

        match dag.current_node().status() {
            status if status.is_done() && stage < dag.max_stage => {
                dag.stage += 1;
                self.commit(dag)?;
                tracing::info!(
                    "Dag '{}' ({}) advanced to stage {}/{}",
                    dag.name,
                    dag.id,
                    dag.stage,
                    dag.max_stage
                );
                self.record(
                    dag.id,
                    EventType::StageAdvanced {
                        from: stage,
                        to: dag.stage,
                    },
                )
                .await;
                return Ok(None);
            }
            status if status.is_done() => {
                dag.status = DagStatus::Succeeded;
                self.commit(dag)?;
                tracing::info!("Dag '{}' ({}) succeeded", dag.name, dag.id);
                self.record(dag.id, EventType::DagSucceeded).await;
                return Ok(None);
            }
            NodeStatus::Failed => {
                let error = dag
                    .current_node()
                    .failed_tasks()
                    .map(|t| format!("task '{}' failed", t.name))
                    .collect::<Vec<_>>()
                    .join(", ");
                dag.status = DagStatus::Failed;
                self.commit(dag)?;
                tracing::error!(
                    "Dag '{}' ({}) failed at stage {}/{}: {}",
                    dag.name,
                    dag.id,
                    stage,
                    dag.max_stage,
                    error
                );
                self.record(dag.id, EventType::DagFailed { stage, error }).await;
                return Ok(None);
            }
            _ => {}
        }

        let now = chrono::Utc::now();
        for task in dag
            .current_node_mut()
            .tasks
            .iter_mut()
            .filter(|t| !t.status.is_terminal())
        {
            task.status = TaskStatus::Running;
            task.started_at = Some(now);
            task.finished_at = None;
            task.agent_results.clear();
        }

        let node = dag.current_node();
        let node_name = node.name.clone();
        let batch: Batch = node
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Running)
            .map(|t| (t.clone(), node.targets_for(t)))
            .collect();

        if batch.is_empty() {
            dag.status = DagStatus::Failed;
            self.commit(dag)?;
            let error = format!("node '{}' has no runnable tasks", node_name);
            tracing::error!("Dag {} stuck at stage {}: {}", dag.id, stage, error);
            self.record(dag.id, EventType::DagFailed { stage, error }).await;
            return Ok(None);
        }

        // Running status is committed before anything is dispatched
        self.commit(dag)?;
        tracing::info!(
            "Dag '{}' ({}) stage {}/{} '{}': dispatching {} task(s)",
            dag.name,
            dag.id,
            stage,
            dag.max_stage,
            node_name,
            batch.len()
        );
        self.record(
            dag.id,
            EventType::StageStarted {
                stage,
                node: node_name,
            },
        )
        .await;

        Ok(Some(batch))
    }

    /// Unwind the current node, or step back once it holds nothing left to compensate
    async fn unwind_step(&self, dag: &mut Dag) -> EngineResult<Option<Batch>> {
        let stage = dag.stage;
        let node = dag.current_node();
        let node_name = node.name.clone();

        let batch: Batch = node
            .tasks
            .iter()
            .filter(|t| t.status.is_executed())
            .map(|t| (t.clone(), node.targets_for(t)))
            .collect();

        if !batch.is_empty() {
            tracing::info!(
                "Rolling back stage {}/{} '{}' of dag {}",
                stage,
                dag.max_stage,
                node_name,
                dag.id
            );
            return Ok(Some(batch));
        }

        if stage > 1 {
            dag.stage -= 1;
            self.commit(dag)?;
        } else {
            dag.status = DagStatus::Failed;
            self.commit(dag)?;
            tracing::info!("Dag '{}' ({}) rolled back", dag.name, dag.id);
        }

        self.record(
            dag.id,
            EventType::StageRolledBack {
                stage,
                node: node_name,
            },
        )
        .await;
        if dag.is_failed() {
            self.record(dag.id, EventType::DagRolledBack).await;
        }

        Ok(None)
    }

    async fn dispatch_batch(
        &self,
        dag_id: DagId,
        batch: Batch,
        action: DispatchAction,
        cancel: &CancellationToken,
    ) -> Reports {
        let mut calls = Vec::new();

        for (task, targets) in batch {
            for agent in targets {
                self.record(
                    dag_id,
                    EventType::TaskDispatched {
                        task_id: task.id,
                        agent: agent.clone(),
                        action,
                    },
                )
                .await;

                let task_id = task.id;
                let request = DispatchRequest {
                    dag_id,
                    task: task.clone(),
                    action,
                };
                let dispatcher = self.dispatcher.clone();
                let cancel = cancel.child_token();

                calls.push(async move {
                    let result = dispatcher.dispatch(&agent, request, cancel).await;
                    (task_id, agent, result)
                });
            }
        }

        join_all(calls).await
    }
}

/// Fold per-agent reports into task state. Returns the journal events, log
/// lines for dispatch errors and the first failure, if any.
fn apply_reports(
    dag: &mut Dag,
    reports: Reports,
    action: DispatchAction,
) -> (Vec<EventType>, LogLines, Option<String>) {
    let mut by_task: HashMap<TaskId, Vec<(AgentInfo, EngineResult<TaskOutcome>)>> = HashMap::new();
    for (task_id, agent, result) in reports {
        by_task.entry(task_id).or_default().push((agent, result));
    }

    let now = chrono::Utc::now();
    let mut events = Vec::new();
    let mut logs = Vec::new();
    let mut first_failure = None;

    for (task_id, results) in by_task {
        let Some(task) = dag.task_mut(&task_id) else {
            continue;
        };

        let mut error: Option<String> = None;
        for (agent, result) in results {
            match result {
                Ok(outcome) => {
                    task.agent_results.insert(agent.to_string(), outcome.status);
                    if outcome.status == TaskStatus::Failed && error.is_none() {
                        error = Some(
                            outcome
                                .error
                                .unwrap_or_else(|| format!("failed on agent {}", agent)),
                        );
                    }
                    if &agent == task.agent() {
                        task.context = outcome.context;
                    }
                }
                Err(e) => {
                    task.agent_results.insert(agent.to_string(), TaskStatus::Failed);
                    let message = e.to_string();
                    logs.push((task_id, TaskLogEntry::new(message.clone())));
                    if error.is_none() {
                        error = Some(message);
                    }
                }
            }
        }

        task.finished_at = Some(now);
        match error {
            None => {
                task.status = match action {
                    DispatchAction::Execute => TaskStatus::Succeeded,
                    DispatchAction::Rollback => TaskStatus::RolledBack,
                };
                events.push(match action {
                    DispatchAction::Execute => EventType::TaskSucceeded { task_id },
                    DispatchAction::Rollback => EventType::TaskRolledBack { task_id },
                });
            }
            Some(error) => {
                task.status = TaskStatus::Failed;
                tracing::warn!("Task '{}' ({}) failed: {}", task.name, task_id, error);
                if first_failure.is_none() {
                    first_failure = Some(format!("task '{}' failed: {}", task.name, error));
                }
                events.push(EventType::TaskFailed { task_id, error });
            }
        }
    }

    (events, logs, first_failure)
}

fn invalid_state(dag: &Dag, command: DagOperator) -> EngineError {
    EngineError::InvalidDagState {
        dag: dag.id,
        status: dag.status,
        command,
    }
}

/// Failed tasks of the current node, checked against the command's capability flag
fn failed_tasks_permitting(dag: &Dag, command: DagOperator) -> EngineResult<Vec<TaskId>> {
    if !dag.is_failed() || dag.operator == DagOperator::Rollback {
        return Err(invalid_state(dag, command));
    }

    let failed: Vec<&Task> = dag.current_node().failed_tasks().collect();
    if failed.is_empty() {
        return Err(invalid_state(dag, command));
    }
    if let Some(task) = failed.iter().find(|t| !t.capabilities.permits(command)) {
        return Err(EngineError::OperationNotPermitted {
            command,
            task: task.name.clone(),
        });
    }

    Ok(failed.iter().map(|t| t.id).collect())
}

fn prepare_retry(dag: &mut Dag) -> EngineResult<LogLines> {
    let failed = failed_tasks_permitting(dag, DagOperator::Retry)?;

    let mut logs = Vec::new();
    for task_id in failed {
        if let Some(task) = dag.task_mut(&task_id) {
            task.status = TaskStatus::Pending;
            task.started_at = None;
            task.finished_at = None;
            task.agent_results.clear();
            logs.push((task_id, TaskLogEntry::new("retry requested by operator")));
        }
    }
    dag.status = DagStatus::Running;
    Ok(logs)
}

fn prepare_pass(dag: &mut Dag) -> EngineResult<LogLines> {
    let failed = failed_tasks_permitting(dag, DagOperator::Pass)?;

    let now = chrono::Utc::now();
    let mut logs = Vec::new();
    for task_id in failed {
        if let Some(task) = dag.task_mut(&task_id) {
            task.status = TaskStatus::Succeeded;
            task.finished_at = Some(now);
            logs.push((
                task_id,
                TaskLogEntry::new("marked succeeded by operator override (PASS)"),
            ));
        }
    }
    dag.status = DagStatus::Running;
    Ok(logs)
}

fn prepare_rollback(dag: &mut Dag) -> EngineResult<LogLines> {
    if !dag.is_failed() {
        return Err(invalid_state(dag, DagOperator::Rollback));
    }

    // Every task that would be compensated must allow it, before anything changes
    let executed = dag.nodes[..dag.stage]
        .iter()
        .flat_map(|n| n.tasks.iter())
        .filter(|t| t.status.is_executed());
    let mut logs = Vec::new();
    for task in executed {
        if !task.capabilities.can_rollback {
            return Err(EngineError::OperationNotPermitted {
                command: DagOperator::Rollback,
                task: task.name.clone(),
            });
        }
        logs.push((task.id, TaskLogEntry::new("rollback requested by operator")));
    }

    dag.status = DagStatus::Running;
    Ok(logs)
}

fn prepare_cancel(dag: &mut Dag) -> EngineResult<LogLines> {
    if !(dag.is_running() || dag.is_failed()) {
        return Err(invalid_state(dag, DagOperator::Cancel));
    }

    let running = dag
        .nodes
        .iter()
        .flat_map(|n| n.tasks.iter())
        .filter(|t| t.status == TaskStatus::Running);
    for task in running {
        if !task.capabilities.can_cancel {
            return Err(EngineError::OperationNotPermitted {
                command: DagOperator::Cancel,
                task: task.name.clone(),
            });
        }
    }

    let now = chrono::Utc::now();
    let mut logs = Vec::new();
    for task in dag
        .nodes
        .iter_mut()
        .flat_map(|n| n.tasks.iter_mut())
        .filter(|t| t.status == TaskStatus::Running)
    {
        task.status = TaskStatus::Failed;
        task.finished_at = Some(now);
        logs.push((task.id, TaskLogEntry::new("cancelled by operator")));
    }

    // Tasks that never started will not run any more
    for task in dag
        .nodes
        .iter_mut()
        .flat_map(|n| n.tasks.iter_mut())
        .filter(|t| t.status == TaskStatus::Pending)
    {
        task.status = TaskStatus::Skipped;
        task.finished_at = Some(now);
    }

    dag.status = DagStatus::Cancelled;
    Ok(logs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::dispatch::LocalDispatcher;
    use crate::engine::task::{Operation, TaskRun, TaskRunner};
    use crate::storage::{JsonlEventLog, RedbDagStore};
    use crate::types::{Capabilities, NodeSpec, TaskSpec};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Test operation with injectable failures and a configurable delay
    struct Scripted {
        type_name: &'static str,
        capabilities: Capabilities,
        failures: AtomicUsize,
        fail_rollback: bool,
        delay: Duration,
        executions: Arc<AtomicUsize>,
        rollbacks: Arc<AtomicUsize>,
    }

    impl Scripted {
        fn new(type_name: &'static str, capabilities: Capabilities) -> Self {
            Self {
                type_name,
                capabilities,
                failures: AtomicUsize::new(0),
                fail_rollback: false,
                delay: Duration::ZERO,
                executions: Arc::new(AtomicUsize::new(0)),
                rollbacks: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn failing(self, times: usize) -> Self {
            self.failures.store(times, Ordering::SeqCst);
            self
        }

        fn failing_rollback(mut self) -> Self {
            self.fail_rollback = true;
            self
        }

        fn delayed(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }
    }

    #[async_trait::async_trait]
    impl Operation for Scripted {
        fn type_name(&self) -> &str {
            self.type_name
        }

        fn capabilities(&self) -> Capabilities {
            self.capabilities
        }

        async fn execute(&self, run: &mut TaskRun) -> anyhow::Result<()> {
            self.executions.fetch_add(1, Ordering::SeqCst);
            run.log(format!("{} started", self.type_name));
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let fail = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if fail {
                anyhow::bail!("{} failed: injected failure", self.type_name);
            }
            run.context_mut().set_result("done", true)?;
            Ok(())
        }

        async fn rollback(&self, run: &mut TaskRun) -> anyhow::Result<()> {
            self.rollbacks.fetch_add(1, Ordering::SeqCst);
            if self.fail_rollback {
                anyhow::bail!("{} cannot be undone", self.type_name);
            }
            run.log(format!("{} rolled back", self.type_name));
            Ok(())
        }
    }

    struct Harness {
        executor: DagExecutor,
        store: Arc<dyn DagStore>,
        registry: Arc<OperationRegistry>,
        _dir: TempDir,
    }

    fn harness(operations: Vec<Arc<dyn Operation>>) -> Harness {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn DagStore> =
            Arc::new(RedbDagStore::new(dir.path().join("dags.redb")).unwrap());
        let journal = Arc::new(JsonlEventLog::new(dir.path().join("journal")).unwrap());

        let mut builder = OperationRegistry::builder();
        for operation in operations {
            builder = builder.register(operation).unwrap();
        }
        let registry = Arc::new(builder.build());
        let dispatcher = Arc::new(LocalDispatcher::new(registry.clone(), store.clone()));

        Harness {
            executor: DagExecutor::new(store.clone(), journal, dispatcher, registry.clone()),
            store,
            registry,
            _dir: dir,
        }
    }

    fn agent(n: u8) -> AgentInfo {
        AgentInfo::new(format!("10.0.0.{}", n), 2886)
    }

    fn single(node: &str, type_name: &str) -> NodeSpec {
        NodeSpec::new(node).task(TaskSpec::new(node.to_lowercase(), type_name, agent(1)))
    }

    async fn wait_for(executor: &DagExecutor, dag_id: DagId, pred: impl Fn(&Dag) -> bool) -> Dag {
        for _ in 0..500 {
            let dag = executor.get_dag(dag_id).await.unwrap();
            if pred(&dag) {
                return dag;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("dag {} did not reach the expected state", dag_id);
    }

    async fn wait_idle(executor: &DagExecutor, dag_id: DagId) {
        for _ in 0..500 {
            if !executor.is_active(dag_id).await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("drive loop of dag {} did not stop", dag_id);
    }

    #[tokio::test]
    async fn test_two_stage_dag_succeeds() {
        let first = Arc::new(Scripted::new("create_tenant", Capabilities::default()));
        let second = Arc::new(Scripted::new("create_unit", Capabilities::default()));
        let h = harness(vec![first.clone(), second.clone()]);

        let spec = DagSpec::new("Create tenant")
            .node(single("Create", "create_tenant"))
            .node(single("Units", "create_unit"));
        let dag = h.executor.submit(spec).await.unwrap();

        let dag = wait_for(&h.executor, dag.id, Dag::is_finished).await;
        assert_eq!(dag.status, DagStatus::Succeeded);
        assert_eq!(dag.stage, 2);
        assert!(dag.all_tasks_done());
        assert_eq!(first.executions.load(Ordering::SeqCst), 1);
        assert_eq!(second.executions.load(Ordering::SeqCst), 1);

        // Context results come back from the execute agent
        assert_eq!(dag.nodes[0].tasks[0].context.result::<bool>("done"), Some(true));

        // Stage moved forward one step at a time and never past the last node
        wait_idle(&h.executor, dag.id).await;
        let events = h.executor.dag_events(dag.id).await.unwrap();
        let advances: Vec<_> = events
            .iter()
            .filter_map(|e| match e.event_type {
                EventType::StageAdvanced { from, to } => Some((from, to)),
                _ => None,
            })
            .collect();
        assert_eq!(advances, vec![(1, 2)]);
        assert!(matches!(
            events.last().unwrap().event_type,
            EventType::DagSucceeded
        ));
    }

    #[tokio::test]
    async fn test_retry_after_failure_resumes() {
        let flaky = Arc::new(Scripted::new("start_observer", Capabilities::default().retryable()).failing(1));
        let next = Arc::new(Scripted::new("bootstrap", Capabilities::default()));
        let h = harness(vec![flaky.clone(), next.clone()]);

        let spec = DagSpec::new("Start cluster")
            .node(single("Start", "start_observer"))
            .node(single("Bootstrap", "bootstrap"));
        let dag = h.executor.submit(spec).await.unwrap();

        let failed = wait_for(&h.executor, dag.id, Dag::is_failed).await;
        assert_eq!(failed.stage, 1);
        assert_eq!(next.executions.load(Ordering::SeqCst), 0);

        let task_id = failed.nodes[0].tasks[0].id;
        let logs = h.executor.task_logs(dag.id, task_id, Some(1)).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].message, "start_observer failed: injected failure");

        let resumed = h.executor.command(dag.id, DagOperator::Retry).await.unwrap();
        assert_eq!(resumed.status, DagStatus::Running);
        assert_eq!(resumed.operator, DagOperator::Retry);

        let dag = wait_for(&h.executor, dag.id, Dag::is_finished).await;
        assert_eq!(dag.status, DagStatus::Succeeded);
        assert_eq!(dag.stage, 2);
        assert_eq!(flaky.executions.load(Ordering::SeqCst), 2);
        assert_eq!(next.executions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_pass_overrides_failed_task() {
        let broken = Arc::new(Scripted::new("check_disk", Capabilities::default().passable()).failing(usize::MAX));
        let next = Arc::new(Scripted::new("deploy", Capabilities::default()));
        let h = harness(vec![broken.clone(), next.clone()]);

        let spec = DagSpec::new("Deploy")
            .node(single("Check", "check_disk"))
            .node(single("Deploy", "deploy"));
        let dag = h.executor.submit(spec).await.unwrap();
        wait_for(&h.executor, dag.id, Dag::is_failed).await;

        h.executor.command(dag.id, DagOperator::Pass).await.unwrap();

        let dag = wait_for(&h.executor, dag.id, Dag::is_finished).await;
        assert_eq!(dag.status, DagStatus::Succeeded);
        assert_eq!(dag.nodes[0].tasks[0].status, TaskStatus::Succeeded);
        assert_eq!(broken.executions.load(Ordering::SeqCst), 1);
        assert_eq!(next.executions.load(Ordering::SeqCst), 1);

        let logs = h
            .executor
            .task_logs(dag.id, dag.nodes[0].tasks[0].id, None)
            .await
            .unwrap();
        assert!(logs.iter().any(|l| l.message.contains("operator override")));
    }

    #[tokio::test]
    async fn test_cancel_during_second_stage() {
        let quick = Arc::new(Scripted::new("stop_zone", Capabilities::default()));
        let slow = Arc::new(
            Scripted::new("migrate_unit", Capabilities::default().cancellable())
                .delayed(Duration::from_secs(3600)),
        );
        let last = Arc::new(Scripted::new("start_zone", Capabilities::default()));
        let h = harness(vec![quick.clone(), slow.clone(), last.clone()]);

        let spec = DagSpec::new("Migrate")
            .node(single("Stop", "stop_zone"))
            .node(single("Migrate", "migrate_unit"))
            .node(single("Start", "start_zone"));
        let dag = h.executor.submit(spec).await.unwrap();

        wait_for(&h.executor, dag.id, |d| {
            d.stage == 2 && d.nodes[1].tasks[0].status == TaskStatus::Running
        })
        .await;

        let cancelled = h.executor.command(dag.id, DagOperator::Cancel).await.unwrap();
        assert_eq!(cancelled.status, DagStatus::Cancelled);

        wait_idle(&h.executor, dag.id).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let dag = h.executor.get_dag(dag.id).await.unwrap();
        assert_eq!(dag.status, DagStatus::Cancelled);
        assert_eq!(dag.stage, 2);
        assert_eq!(dag.nodes[1].tasks[0].status, TaskStatus::Failed);
        assert_eq!(dag.nodes[2].tasks[0].status, TaskStatus::Skipped);
        assert_eq!(dag.nodes[2].status(), NodeStatus::Skipped);
        assert_eq!(last.executions.load(Ordering::SeqCst), 0);

        // Cancelled is terminal
        let err = h.executor.command(dag.id, DagOperator::Retry).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidDagState { .. }));
    }

    #[tokio::test]
    async fn test_cancel_requires_capability_on_running_tasks() {
        let slow = Arc::new(
            Scripted::new("restore_tenant", Capabilities::default()).delayed(Duration::from_secs(3600)),
        );
        let h = harness(vec![slow]);

        let dag = h
            .executor
            .submit(DagSpec::new("Restore").node(single("Restore", "restore_tenant")))
            .await
            .unwrap();
        wait_for(&h.executor, dag.id, |d| {
            d.nodes[0].tasks[0].status == TaskStatus::Running
        })
        .await;

        let err = h.executor.command(dag.id, DagOperator::Cancel).await.unwrap_err();
        assert!(matches!(err, EngineError::OperationNotPermitted { command: DagOperator::Cancel, .. }));
        assert!(h.executor.get_dag(dag.id).await.unwrap().is_running());

        h.executor.shutdown().await;
    }

    #[tokio::test]
    async fn test_only_execute_agent_does_real_work() {
        let restart = Arc::new(Scripted::new("restart_server", Capabilities::default()));
        let h = harness(vec![restart.clone()]);

        let node = NodeSpec::new("Restart zone")
            .participants(vec![agent(1), agent(2), agent(3)])
            .task(TaskSpec::new("restart 10.0.0.1", "restart_server", agent(1)));
        let dag = h
            .executor
            .submit(DagSpec::new("Rolling restart").node(node))
            .await
            .unwrap();

        let dag = wait_for(&h.executor, dag.id, Dag::is_finished).await;
        assert_eq!(dag.status, DagStatus::Succeeded);
        assert_eq!(restart.executions.load(Ordering::SeqCst), 1);

        let task = &dag.nodes[0].tasks[0];
        assert_eq!(task.agent_results.len(), 3);
        assert!(task.agent_results.values().all(|s| *s == TaskStatus::Succeeded));

        let logs = h.executor.task_logs(dag.id, task.id, None).await.unwrap();
        let skipped = logs
            .iter()
            .filter(|l| l.message.contains("is not the execute agent"))
            .count();
        assert_eq!(skipped, 2);
    }

    #[tokio::test]
    async fn test_retry_without_capability_leaves_state_unchanged() {
        let broken = Arc::new(Scripted::new("upgrade_binary", Capabilities::none()).failing(usize::MAX));
        let h = harness(vec![broken]);

        let dag = h
            .executor
            .submit(DagSpec::new("Upgrade").node(single("Upgrade", "upgrade_binary")))
            .await
            .unwrap();
        wait_for(&h.executor, dag.id, Dag::is_failed).await;
        wait_idle(&h.executor, dag.id).await;
        let before = h.executor.get_dag(dag.id).await.unwrap();

        for command in [DagOperator::Retry, DagOperator::Pass] {
            let err = h.executor.command(dag.id, command).await.unwrap_err();
            assert!(
                matches!(err, EngineError::OperationNotPermitted { command: c, ref task } if c == command && task == "upgrade")
            );
        }

        let after = h.executor.get_dag(dag.id).await.unwrap();
        assert_eq!(after.version, before.version);
        assert_eq!(after.status, DagStatus::Failed);
        assert_eq!(after.operator, DagOperator::Run);
        assert_eq!(after.nodes[0].tasks[0].status, TaskStatus::Failed);
        assert!(!h.executor.is_active(dag.id).await);
    }

    #[tokio::test]
    async fn test_commands_in_wrong_state() {
        let slow = Arc::new(
            Scripted::new("backup", Capabilities::all()).delayed(Duration::from_secs(3600)),
        );
        let h = harness(vec![slow]);

        let err = h
            .executor
            .command(DagId::new(), DagOperator::Retry)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::DagNotFound(_)));

        let dag = h
            .executor
            .submit(DagSpec::new("Backup").node(single("Backup", "backup")))
            .await
            .unwrap();

        for command in [DagOperator::Retry, DagOperator::Pass, DagOperator::Rollback, DagOperator::Run] {
            let err = h.executor.command(dag.id, command).await.unwrap_err();
            assert!(matches!(err, EngineError::InvalidDagState { status: DagStatus::Running, .. }));
        }

        h.executor.shutdown().await;
    }

    #[tokio::test]
    async fn test_rollback_unwinds_every_stage() {
        let create = Arc::new(Scripted::new("create_pool", Capabilities::default().rollbackable()));
        let grant = Arc::new(
            Scripted::new("grant_pool", Capabilities::default().rollbackable()).failing(usize::MAX),
        );
        let h = harness(vec![create.clone(), grant.clone()]);

        let spec = DagSpec::new("Create pool")
            .node(single("Create", "create_pool"))
            .node(single("Grant", "grant_pool"));
        let dag = h.executor.submit(spec).await.unwrap();
        let failed = wait_for(&h.executor, dag.id, Dag::is_failed).await;
        assert_eq!(failed.stage, 2);

        h.executor.command(dag.id, DagOperator::Rollback).await.unwrap();

        let dag = wait_for(&h.executor, dag.id, |d| d.is_finished() && d.stage == 1).await;
        assert_eq!(dag.status, DagStatus::Failed);
        assert_eq!(dag.operator, DagOperator::Rollback);
        assert_eq!(dag.nodes[0].tasks[0].status, TaskStatus::RolledBack);
        assert_eq!(dag.nodes[1].tasks[0].status, TaskStatus::RolledBack);
        assert_eq!(create.rollbacks.load(Ordering::SeqCst), 1);
        assert_eq!(grant.rollbacks.load(Ordering::SeqCst), 1);

        // Retry is not offered after a rollback
        wait_idle(&h.executor, dag.id).await;
        let err = h.executor.command(dag.id, DagOperator::Retry).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidDagState { .. }));

        let events = h.executor.dag_events(dag.id).await.unwrap();
        assert!(events
            .iter()
            .any(|e| matches!(e.event_type, EventType::DagRolledBack)));
    }

    #[tokio::test]
    async fn test_rollback_rejected_before_any_change() {
        let create = Arc::new(Scripted::new("create_user", Capabilities::default()));
        let grant = Arc::new(
            Scripted::new("grant_user", Capabilities::default().rollbackable()).failing(usize::MAX),
        );
        let h = harness(vec![create.clone(), grant.clone()]);

        let spec = DagSpec::new("Create user")
            .node(single("Create", "create_user"))
            .node(single("Grant", "grant_user"));
        let dag = h.executor.submit(spec).await.unwrap();
        wait_for(&h.executor, dag.id, Dag::is_failed).await;
        wait_idle(&h.executor, dag.id).await;
        let before = h.executor.get_dag(dag.id).await.unwrap();

        let err = h.executor.command(dag.id, DagOperator::Rollback).await.unwrap_err();
        assert!(matches!(err, EngineError::OperationNotPermitted { ref task, .. } if task == "create"));

        let after = h.executor.get_dag(dag.id).await.unwrap();
        assert_eq!(after.version, before.version);
        assert_eq!(grant.rollbacks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_rollback_parks_dag() {
        let drop_db = Arc::new(
            Scripted::new("drop_database", Capabilities::default().rollbackable())
                .failing(usize::MAX)
                .failing_rollback(),
        );
        let h = harness(vec![drop_db.clone()]);

        let dag = h
            .executor
            .submit(DagSpec::new("Drop").node(single("Drop", "drop_database")))
            .await
            .unwrap();
        wait_for(&h.executor, dag.id, Dag::is_failed).await;

        h.executor.command(dag.id, DagOperator::Rollback).await.unwrap();
        let dag = wait_for(&h.executor, dag.id, |d| {
            d.is_failed() && drop_db.rollbacks.load(Ordering::SeqCst) == 1
        })
        .await;
        wait_idle(&h.executor, dag.id).await;

        let dag = h.executor.get_dag(dag.id).await.unwrap();
        assert_eq!(dag.status, DagStatus::Failed);
        assert_eq!(dag.nodes[0].tasks[0].status, TaskStatus::Failed);
        let logs = h
            .executor
            .task_logs(dag.id, dag.nodes[0].tasks[0].id, Some(1))
            .await
            .unwrap();
        assert_eq!(logs[0].message, "drop_database cannot be undone");
    }

    #[tokio::test]
    async fn test_re_execution_is_idempotent() {
        let op = Arc::new(Scripted::new("set_parameter", Capabilities::default()));
        let h = harness(vec![op]);

        let spec = DagSpec::new("Set parameter").node(
            NodeSpec::new("Set").task(
                TaskSpec::new("set", "set_parameter", agent(1)).param("name", "memory_limit"),
            ),
        );
        let dag = h.executor.submit(spec).await.unwrap();
        let dag = wait_for(&h.executor, dag.id, Dag::is_finished).await;
        let task = dag.nodes[0].tasks[0].clone();

        // Restore from the persisted type name and context and run it again
        let instance = h
            .registry
            .instantiate(&task.type_name, task.context.clone())
            .unwrap();
        assert_eq!(instance.context, task.context);

        let outcome = TaskRunner::new(h.registry.clone())
            .run(
                &agent(1),
                DispatchRequest {
                    dag_id: dag.id,
                    task: task.clone(),
                    action: DispatchAction::Execute,
                },
                CancellationToken::new(),
                None,
            )
            .await;
        assert_eq!(outcome.status, TaskStatus::Succeeded);
        assert_eq!(outcome.context, task.context);

        let after = h.executor.get_dag(dag.id).await.unwrap();
        assert_eq!(after.status, DagStatus::Succeeded);
        assert_eq!(after.version, dag.version);
    }

    fn interrupted_dag(h: &Harness, type_name: &str, capabilities: Capabilities) -> Dag {
        let mut dag = DagBuilder::new(h.registry.clone())
            .build(DagSpec::new("Scale out").node(single("Scale", "scale_out")))
            .unwrap();
        let task = &mut dag.nodes[0].tasks[0];
        task.type_name = type_name.to_string();
        task.capabilities = capabilities;
        task.status = TaskStatus::Running;
        task.started_at = Some(chrono::Utc::now());
        h.store.save_dag(&dag).unwrap();
        dag
    }

    #[tokio::test]
    async fn test_recover_resumes_continuable_tasks() {
        let scale = Arc::new(Scripted::new("scale_out", Capabilities::default()));
        let h = harness(vec![scale.clone()]);
        let dag = interrupted_dag(&h, "scale_out", Capabilities::default());

        assert_eq!(h.executor.recover().await.unwrap(), 1);

        let dag = wait_for(&h.executor, dag.id, Dag::is_finished).await;
        assert_eq!(dag.status, DagStatus::Succeeded);
        assert_eq!(scale.executions.load(Ordering::SeqCst), 1);

        let logs = h
            .executor
            .task_logs(dag.id, dag.nodes[0].tasks[0].id, None)
            .await
            .unwrap();
        assert_eq!(logs[0].message, "interrupted by agent restart, resuming");
    }

    #[tokio::test]
    async fn test_recover_fails_non_continuable_tasks() {
        let scale = Arc::new(Scripted::new("scale_out", Capabilities::none().retryable()));
        let h = harness(vec![scale.clone()]);
        let dag = interrupted_dag(&h, "scale_out", Capabilities::none().retryable());

        h.executor.recover().await.unwrap();

        let dag = wait_for(&h.executor, dag.id, Dag::is_finished).await;
        assert_eq!(dag.status, DagStatus::Failed);
        assert_eq!(scale.executions.load(Ordering::SeqCst), 0);

        // The operator can still retry it
        wait_idle(&h.executor, dag.id).await;
        h.executor.command(dag.id, DagOperator::Retry).await.unwrap();
        let dag = wait_for(&h.executor, dag.id, Dag::is_finished).await;
        assert_eq!(dag.status, DagStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_recover_with_unknown_operation_type() {
        let scale = Arc::new(Scripted::new("scale_out", Capabilities::default()));
        let h = harness(vec![scale]);
        let dag = interrupted_dag(&h, "scale_out_v2", Capabilities::default());

        h.executor.recover().await.unwrap();

        let dag = wait_for(&h.executor, dag.id, Dag::is_finished).await;
        assert_eq!(dag.status, DagStatus::Failed);

        let logs = h
            .executor
            .task_logs(dag.id, dag.nodes[0].tasks[0].id, None)
            .await
            .unwrap();
        assert_eq!(logs[0].message, "unknown operation type: scale_out_v2");
    }

    #[tokio::test]
    async fn test_task_logs_unknown_task() {
        let h = harness(vec![Arc::new(Scripted::new("noop", Capabilities::default()))]);
        let dag = h
            .executor
            .submit(DagSpec::new("Noop").node(single("Noop", "noop")))
            .await
            .unwrap();

        let err = h
            .executor
            .task_logs(dag.id, TaskId::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::TaskNotFound(_)));
    }

    #[tokio::test]
    async fn test_concurrent_retries_apply_once() {
        let flaky = Arc::new(
            Scripted::new("create_resource_pool", Capabilities::default().retryable()).failing(1),
        );
        let h = harness(vec![flaky.clone()]);

        let dag = h
            .executor
            .submit(DagSpec::new("Create pool").node(single("Pool", "create_resource_pool")))
            .await
            .unwrap();
        let failed = wait_for(&h.executor, dag.id, Dag::is_failed).await;

        let (first, second) = tokio::join!(
            h.executor.command(dag.id, DagOperator::Retry),
            h.executor.command(dag.id, DagOperator::Retry),
        );

        let (applied, rejected) = match (first, second) {
            (Ok(dag), Err(e)) | (Err(e), Ok(dag)) => (dag, e),
            (first, second) => panic!("expected one retry to apply, got {:?} and {:?}", first, second),
        };
        assert_eq!(applied.version, failed.version + 1);
        assert!(matches!(
            rejected,
            EngineError::InvalidDagState { command: DagOperator::Retry, .. }
        ));

        let dag = wait_for(&h.executor, dag.id, Dag::is_finished).await;
        assert_eq!(dag.status, DagStatus::Succeeded);
        wait_idle(&h.executor, dag.id).await;
        assert_eq!(flaky.executions.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_lock_released_once_dag_stops() {
        let h = harness(vec![
            Arc::new(Scripted::new("noop", Capabilities::default())),
            Arc::new(Scripted::new("broken", Capabilities::default()).failing(1)),
        ]);

        let ok = h
            .executor
            .submit(DagSpec::new("Noop").node(single("Noop", "noop")))
            .await
            .unwrap();
        let broken = h
            .executor
            .submit(DagSpec::new("Broken").node(single("Broken", "broken")))
            .await
            .unwrap();
        wait_for(&h.executor, ok.id, Dag::is_finished).await;
        wait_for(&h.executor, broken.id, Dag::is_failed).await;

        for _ in 0..500 {
            if h.executor.locks.lock().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(h.executor.locks.lock().await.is_empty());

        // A rejected command does not leave an entry behind either
        let err = h.executor.command(broken.id, DagOperator::Retry).await.unwrap_err();
        assert!(matches!(err, EngineError::OperationNotPermitted { .. }));
        assert!(h.executor.locks.lock().await.is_empty());
    }
}
