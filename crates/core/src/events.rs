use crate::types::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An entry in a DAG's audit journal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub dag_id: DagId,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
}

impl Event {
    pub fn new(dag_id: DagId, event_type: EventType) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            dag_id,
            timestamp: Utc::now(),
            event_type,
        }
    }
}

/// State transitions recorded for a DAG
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventType {
    // DAG lifecycle
    DagSubmitted {
        name: String,
        max_stage: usize,
    },
    DagSucceeded,
    DagFailed {
        stage: usize,
        error: String,
    },
    DagCancelled,
    DagRolledBack,
    DagRecovered {
        stage: usize,
    },

    // Stage barrier
    StageStarted {
        stage: usize,
        node: String,
    },
    StageAdvanced {
        from: usize,
        to: usize,
    },
    StageRolledBack {
        stage: usize,
        node: String,
    },

    // Tasks
    TaskDispatched {
        task_id: TaskId,
        agent: AgentInfo,
        action: DispatchAction,
    },
    TaskSucceeded {
        task_id: TaskId,
    },
    TaskFailed {
        task_id: TaskId,
        error: String,
    },
    TaskRolledBack {
        task_id: TaskId,
    },

    // Operator
    OperatorCommand {
        operator: DagOperator,
    },
}

/// Which direction a dispatched task runs in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchAction {
    Execute,
    Rollback,
}

/// Event log writer trait
#[async_trait::async_trait]
pub trait EventLog: Send + Sync {
    /// Append an event to the log
    async fn append(&self, event: Event) -> anyhow::Result<()>;

    /// Get all events for a DAG
    async fn get_dag_events(&self, dag_id: DagId) -> anyhow::Result<Vec<Event>>;

    /// Get events for a DAG within a time range
    async fn get_dag_events_range(
        &self,
        dag_id: DagId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Event>>;
}
