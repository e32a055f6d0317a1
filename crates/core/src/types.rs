use crate::error::EngineError;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use uuid::Uuid;

/// Generic identifier of a DAG, shared by every agent that takes part in it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DagId(pub Uuid);

impl DagId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DagId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for DagId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DagId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Unique identifier for a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Address of a management agent
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentInfo {
    pub ip: String,
    pub port: u16,
}

impl AgentInfo {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
        }
    }

    /// Base URL of the agent's HTTP API
    pub fn base_url(&self) -> String {
        if self.ip.contains(':') {
            format!("http://[{}]:{}", self.ip, self.port)
        } else {
            format!("http://{}:{}", self.ip, self.port)
        }
    }
}

impl std::fmt::Display for AgentInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

impl FromStr for AgentInfo {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ip, port) = s
            .rsplit_once(':')
            .ok_or_else(|| EngineError::InvalidAgentAddress(s.to_string()))?;
        let ip = ip.trim_start_matches('[').trim_end_matches(']');
        if ip.is_empty() {
            return Err(EngineError::InvalidAgentAddress(s.to_string()));
        }
        let port = port
            .parse()
            .map_err(|_| EngineError::InvalidAgentAddress(s.to_string()))?;
        Ok(Self::new(ip, port))
    }
}

/// Operator commands a task may be subject to. Fixed when the task is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// May be resumed automatically after the agent was interrupted mid-run
    pub can_continue: bool,
    pub can_rollback: bool,
    pub can_retry: bool,
    pub can_pass: bool,
    pub can_cancel: bool,
}

impl Capabilities {
    pub const fn none() -> Self {
        Self {
            can_continue: false,
            can_rollback: false,
            can_retry: false,
            can_pass: false,
            can_cancel: false,
        }
    }

    pub const fn all() -> Self {
        Self {
            can_continue: true,
            can_rollback: true,
            can_retry: true,
            can_pass: true,
            can_cancel: true,
        }
    }

    pub fn continuable(mut self) -> Self {
        self.can_continue = true;
        self
    }

    pub fn rollbackable(mut self) -> Self {
        self.can_rollback = true;
        self
    }

    pub fn retryable(mut self) -> Self {
        self.can_retry = true;
        self
    }

    pub fn passable(mut self) -> Self {
        self.can_pass = true;
        self
    }

    pub fn cancellable(mut self) -> Self {
        self.can_cancel = true;
        self
    }

    /// Whether the given operator command is allowed against a task with these flags
    pub fn permits(&self, operator: DagOperator) -> bool {
        match operator {
            DagOperator::Run => true,
            DagOperator::Retry => self.can_retry,
            DagOperator::Pass => self.can_pass,
            DagOperator::Rollback => self.can_rollback,
            DagOperator::Cancel => self.can_cancel,
        }
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::none().continuable()
    }
}

/// Status of a single task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
    RolledBack,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Skipped | TaskStatus::RolledBack
        )
    }

    /// Terminal and not failed: the node barrier may release
    pub fn is_done(&self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Skipped)
    }

    /// Has run (or started to run) its forward action and may need compensation
    pub fn is_executed(&self) -> bool {
        matches!(
            self,
            TaskStatus::Running | TaskStatus::Succeeded | TaskStatus::Failed
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
            TaskStatus::RolledBack => "rolled_back",
        };
        f.write_str(s)
    }
}

/// Status of a node, derived from its tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    /// Every task was skipped without running
    Skipped,
    RolledBack,
}

impl NodeStatus {
    /// The stage barrier may release
    pub fn is_done(&self) -> bool {
        matches!(self, NodeStatus::Succeeded | NodeStatus::Skipped)
    }
}

/// Overall status of a DAG
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DagStatus {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl DagStatus {
    pub fn is_finished(&self) -> bool {
        !matches!(self, DagStatus::Running)
    }
}

impl std::fmt::Display for DagStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DagStatus::Running => "running",
            DagStatus::Succeeded => "succeeded",
            DagStatus::Failed => "failed",
            DagStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Operator command applied to a DAG. `Run` is the state of a freshly submitted DAG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DagOperator {
    Run,
    Retry,
    Pass,
    Rollback,
    Cancel,
}

impl std::fmt::Display for DagOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DagOperator::Run => "RUN",
            DagOperator::Retry => "RETRY",
            DagOperator::Pass => "PASS",
            DagOperator::Rollback => "ROLLBACK",
            DagOperator::Cancel => "CANCEL",
        };
        f.write_str(s)
    }
}

impl FromStr for DagOperator {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "RUN" => Ok(DagOperator::Run),
            "RETRY" => Ok(DagOperator::Retry),
            "PASS" => Ok(DagOperator::Pass),
            "ROLLBACK" => Ok(DagOperator::Rollback),
            "CANCEL" => Ok(DagOperator::Cancel),
            other => Err(EngineError::InvalidDag(format!("unknown operator: {}", other))),
        }
    }
}

/// Kind of DAG. Upgrade DAGs are also served on the upgrade query path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DagKind {
    #[default]
    Standard,
    Upgrade,
}

/// One line of a task's execution log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskLogEntry {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

impl TaskLogEntry {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for TaskLogEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}] {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            self.message
        )
    }
}

/// Serialized task context: the operation's parameters, the results it has
/// accumulated so far and the agent that must perform the real work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskContext {
    pub execute_agent: AgentInfo,
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub results: serde_json::Map<String, serde_json::Value>,
}

impl TaskContext {
    pub fn new(execute_agent: AgentInfo) -> Self {
        Self {
            execute_agent,
            params: serde_json::Map::new(),
            results: serde_json::Map::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        // Values that fail to serialize are stored as null
        let value = serde_json::to_value(value).unwrap_or(serde_json::Value::Null);
        self.params.insert(key.into(), value);
        self
    }

    /// Decode a required parameter
    pub fn param<T: DeserializeOwned>(&self, key: &str) -> anyhow::Result<T> {
        let value = self
            .params
            .get(key)
            .ok_or_else(|| anyhow::anyhow!("missing task parameter '{}'", key))?;
        serde_json::from_value(value.clone())
            .map_err(|e| anyhow::anyhow!("invalid task parameter '{}': {}", key, e))
    }

    /// Decode an optional parameter
    pub fn param_opt<T: DeserializeOwned>(&self, key: &str) -> anyhow::Result<Option<T>> {
        match self.params.get(key) {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(_) => self.param(key).map(Some),
        }
    }

    pub fn set_result(&mut self, key: impl Into<String>, value: impl Serialize) -> anyhow::Result<()> {
        self.results.insert(key.into(), serde_json::to_value(value)?);
        Ok(())
    }

    pub fn result<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.results
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

/// Atomic unit of work inside a node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    /// Operation type name, resolved through the operation registry
    pub type_name: String,
    pub context: TaskContext,
    pub capabilities: Capabilities,
    pub status: TaskStatus,
    /// Last reported status per participating agent, keyed by `ip:port`
    #[serde(default)]
    pub agent_results: BTreeMap<String, TaskStatus>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    /// The agent that performs the real work
    pub fn agent(&self) -> &AgentInfo {
        &self.context.execute_agent
    }
}

/// A stage of a DAG: tasks that must all finish before the DAG advances
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    /// Agents that receive every dispatch of this node. Empty means each
    /// task is only sent to its own execute agent.
    #[serde(default)]
    pub participants: Vec<AgentInfo>,
    pub tasks: Vec<Task>,
}

impl Node {
    pub fn status(&self) -> NodeStatus {
        if self.tasks.iter().all(|t| t.status == TaskStatus::Skipped) {
            NodeStatus::Skipped
        } else if self.tasks.iter().all(|t| t.status.is_done()) {
            NodeStatus::Succeeded
        } else if self.tasks.iter().any(|t| t.status == TaskStatus::Failed) {
            NodeStatus::Failed
        } else if self
            .tasks
            .iter()
            .all(|t| matches!(t.status, TaskStatus::RolledBack | TaskStatus::Pending | TaskStatus::Skipped))
            && self.tasks.iter().any(|t| t.status == TaskStatus::RolledBack)
        {
            NodeStatus::RolledBack
        } else if self.tasks.iter().all(|t| t.status == TaskStatus::Pending) {
            NodeStatus::Pending
        } else {
            NodeStatus::Running
        }
    }

    /// Agents that receive the dispatch of `task`. The execute agent is always among them.
    pub fn targets_for(&self, task: &Task) -> Vec<AgentInfo> {
        let mut targets = self.participants.clone();
        if !targets.contains(task.agent()) {
            targets.push(task.agent().clone());
        }
        targets
    }

    pub fn failed_tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter().filter(|t| t.status == TaskStatus::Failed)
    }
}

/// A workflow instance: ordered nodes plus the stage pointer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dag {
    pub id: DagId,
    pub name: String,
    #[serde(default)]
    pub kind: DagKind,
    pub nodes: Vec<Node>,
    /// 1-based index of the node being executed or awaited
    pub stage: usize,
    pub max_stage: usize,
    pub status: DagStatus,
    pub operator: DagOperator,
    /// Compare-and-set token, bumped on every committed write
    #[serde(default)]
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Dag {
    pub fn current_node(&self) -> &Node {
        &self.nodes[self.stage - 1]
    }

    pub fn current_node_mut(&mut self) -> &mut Node {
        let idx = self.stage - 1;
        &mut self.nodes[idx]
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_finished()
    }

    pub fn is_succeeded(&self) -> bool {
        self.status == DagStatus::Succeeded
    }

    pub fn is_failed(&self) -> bool {
        self.status == DagStatus::Failed
    }

    pub fn is_running(&self) -> bool {
        self.status == DagStatus::Running
    }

    pub fn is_cancelled(&self) -> bool {
        self.status == DagStatus::Cancelled
    }

    /// A rollback unwound every stage and nothing is left failed
    pub fn is_rolled_back(&self) -> bool {
        self.is_failed() && self.operator == DagOperator::Rollback && self.failed_task().is_none()
    }

    /// Every task of every node succeeded or was skipped
    pub fn all_tasks_done(&self) -> bool {
        self.nodes
            .iter()
            .all(|n| n.tasks.iter().all(|t| t.status.is_done()))
    }

    pub fn task(&self, task_id: &TaskId) -> Option<&Task> {
        self.nodes
            .iter()
            .flat_map(|n| n.tasks.iter())
            .find(|t| &t.id == task_id)
    }

    pub fn task_mut(&mut self, task_id: &TaskId) -> Option<&mut Task> {
        self.nodes
            .iter_mut()
            .flat_map(|n| n.tasks.iter_mut())
            .find(|t| &t.id == task_id)
    }

    /// The first failed task together with its node, searching from the current stage
    pub fn failed_task(&self) -> Option<(&Node, &Task)> {
        self.nodes[..self.stage]
            .iter()
            .rev()
            .find_map(|n| n.failed_tasks().next().map(|t| (n, t)))
    }
}

/// Request to create a DAG, compiled by a builder from a high-level operator request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DagSpec {
    pub name: String,
    #[serde(default)]
    pub kind: DagKind,
    pub nodes: Vec<NodeSpec>,
}

impl DagSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: DagKind::Standard,
            nodes: Vec::new(),
        }
    }

    pub fn kind(mut self, kind: DagKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn node(mut self, node: NodeSpec) -> Self {
        self.nodes.push(node);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub name: String,
    #[serde(default)]
    pub participants: Vec<AgentInfo>,
    pub tasks: Vec<TaskSpec>,
}

impl NodeSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            participants: Vec::new(),
            tasks: Vec::new(),
        }
    }

    pub fn participants(mut self, agents: Vec<AgentInfo>) -> Self {
        self.participants = agents;
        self
    }

    pub fn task(mut self, task: TaskSpec) -> Self {
        self.tasks.push(task);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub name: String,
    pub type_name: String,
    pub agent: AgentInfo,
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

impl TaskSpec {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>, agent: AgentInfo) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            agent,
            params: serde_json::Map::new(),
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        let value = serde_json::to_value(value).unwrap_or(serde_json::Value::Null);
        self.params.insert(key.into(), value);
        self
    }
}

/// Operator command request body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DagOperatorRequest {
    pub operator: DagOperator,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(status: TaskStatus) -> Task {
        Task {
            id: TaskId::new(),
            name: "t".to_string(),
            type_name: "noop".to_string(),
            context: TaskContext::new(AgentInfo::new("10.0.0.1", 2886)),
            capabilities: Capabilities::default(),
            status,
            agent_results: BTreeMap::new(),
            started_at: None,
            finished_at: None,
        }
    }

    fn node(statuses: &[TaskStatus]) -> Node {
        Node {
            name: "n".to_string(),
            participants: vec![],
            tasks: statuses.iter().map(|s| task(*s)).collect(),
        }
    }

    #[test]
    fn test_agent_info_parse_and_display() {
        let agent: AgentInfo = "192.168.1.10:2886".parse().unwrap();
        assert_eq!(agent, AgentInfo::new("192.168.1.10", 2886));
        assert_eq!(agent.to_string(), "192.168.1.10:2886");
        assert_eq!(agent.base_url(), "http://192.168.1.10:2886");

        let v6: AgentInfo = "[::1]:2886".parse().unwrap();
        assert_eq!(v6.ip, "::1");
        assert_eq!(v6.base_url(), "http://[::1]:2886");

        assert!("no-port".parse::<AgentInfo>().is_err());
        assert!("host:notaport".parse::<AgentInfo>().is_err());
    }

    #[test]
    fn test_node_status_derivation() {
        use TaskStatus::*;
        assert_eq!(node(&[Succeeded, Skipped]).status(), NodeStatus::Succeeded);
        assert_eq!(node(&[Skipped, Skipped]).status(), NodeStatus::Skipped);
        assert!(node(&[Skipped, Skipped]).status().is_done());
        assert_eq!(node(&[Succeeded, Failed]).status(), NodeStatus::Failed);
        assert_eq!(node(&[Running, Failed]).status(), NodeStatus::Failed);
        assert_eq!(node(&[Pending, Pending]).status(), NodeStatus::Pending);
        assert_eq!(node(&[Succeeded, Pending]).status(), NodeStatus::Running);
        assert_eq!(node(&[RolledBack, RolledBack]).status(), NodeStatus::RolledBack);
    }

    #[test]
    fn test_targets_always_include_execute_agent() {
        let mut n = node(&[TaskStatus::Pending]);
        let a = AgentInfo::new("10.0.0.1", 2886);
        let b = AgentInfo::new("10.0.0.2", 2886);

        assert_eq!(n.targets_for(&n.tasks[0]), vec![a.clone()]);

        n.participants = vec![b.clone()];
        assert_eq!(n.targets_for(&n.tasks[0]), vec![b.clone(), a.clone()]);

        n.participants = vec![a.clone(), b.clone()];
        assert_eq!(n.targets_for(&n.tasks[0]), vec![a, b]);
    }

    #[test]
    fn test_capabilities_permits() {
        let caps = Capabilities::none().retryable();
        assert!(caps.permits(DagOperator::Retry));
        assert!(!caps.permits(DagOperator::Pass));
        assert!(!caps.permits(DagOperator::Rollback));
        assert!(!caps.permits(DagOperator::Cancel));
        assert!(Capabilities::default().can_continue);
    }

    #[test]
    fn test_operator_wire_format() {
        let json = serde_json::to_string(&DagOperator::Rollback).unwrap();
        assert_eq!(json, "\"ROLLBACK\"");
        assert_eq!("retry".parse::<DagOperator>().unwrap(), DagOperator::Retry);
        assert!("explode".parse::<DagOperator>().is_err());
    }

    #[test]
    fn test_task_context_params() {
        let ctx = TaskContext::new(AgentInfo::new("10.0.0.1", 2886))
            .with_param("seconds", 3u64)
            .with_param("zone", "z1");

        assert_eq!(ctx.param::<u64>("seconds").unwrap(), 3);
        assert_eq!(ctx.param::<String>("zone").unwrap(), "z1");
        assert!(ctx.param::<u64>("missing").is_err());
        assert!(ctx.param::<u64>("zone").is_err());
        assert_eq!(ctx.param_opt::<u64>("missing").unwrap(), None);
    }
}
