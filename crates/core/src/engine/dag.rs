use super::registry::OperationRegistry;
use crate::error::{EngineError, EngineResult};
use crate::types::{
    Dag, DagOperator, DagSpec, DagStatus, Node, Task, TaskContext, TaskId, TaskStatus,
};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Compiles a [`DagSpec`] into a runnable [`Dag`]
#[derive(Clone)]
pub struct DagBuilder {
    registry: Arc<OperationRegistry>,
}

impl DagBuilder {
    pub fn new(registry: Arc<OperationRegistry>) -> Self {
        Self { registry }
    }

    pub fn build(&self, spec: DagSpec) -> EngineResult<Dag> {
        if spec.name.trim().is_empty() {
            return Err(EngineError::InvalidDag("dag name must not be empty".to_string()));
        }
        if spec.nodes.is_empty() {
            return Err(EngineError::InvalidDag(format!(
                "dag '{}' has no nodes",
                spec.name
            )));
        }

        let mut nodes = Vec::with_capacity(spec.nodes.len());
        for node in spec.nodes {
            if node.tasks.is_empty() {
                return Err(EngineError::InvalidDag(format!(
                    "node '{}' has no tasks",
                    node.name
                )));
            }

            let mut tasks = Vec::with_capacity(node.tasks.len());
            for task in node.tasks {
                // Capabilities are taken from the prototype and never change afterwards
                let capabilities = self.registry.capabilities(&task.type_name)?;
                let mut context = TaskContext::new(task.agent);
                context.params = task.params;

                tasks.push(Task {
                    id: TaskId::new(),
                    name: task.name,
                    type_name: task.type_name,
                    context,
                    capabilities,
                    status: TaskStatus::Pending,
                    agent_results: BTreeMap::new(),
                    started_at: None,
                    finished_at: None,
                });
            }

            nodes.push(Node {
                name: node.name,
                participants: node.participants,
                tasks,
            });
        }

        let now = chrono::Utc::now();
        Ok(Dag {
            id: crate::types::DagId::new(),
            name: spec.name,
            kind: spec.kind,
            max_stage: nodes.len(),
            nodes,
            stage: 1,
            status: DagStatus::Running,
            operator: DagOperator::Run,
            version: 0,
            created_at: now,
            updated_at: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::task::{Operation, TaskRun};
    use crate::types::{AgentInfo, Capabilities, DagKind, NodeSpec, TaskSpec};

    struct Noop;

    #[async_trait::async_trait]
    impl Operation for Noop {
        fn type_name(&self) -> &str {
            "noop"
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities::all()
        }

        async fn execute(&self, _run: &mut TaskRun) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn builder() -> DagBuilder {
        let registry = OperationRegistry::builder()
            .register(Arc::new(Noop))
            .unwrap()
            .build();
        DagBuilder::new(Arc::new(registry))
    }

    fn agent() -> AgentInfo {
        AgentInfo::new("10.0.0.1", 2886)
    }

    #[test]
    fn test_build_linear_dag() {
        let spec = DagSpec::new("Upgrade cluster")
            .kind(DagKind::Upgrade)
            .node(NodeSpec::new("Check").task(TaskSpec::new("check", "noop", agent()).param("zone", "z1")))
            .node(NodeSpec::new("Upgrade").task(TaskSpec::new("upgrade", "noop", agent())));

        let dag = builder().build(spec).unwrap();

        assert_eq!(dag.stage, 1);
        assert_eq!(dag.max_stage, 2);
        assert_eq!(dag.status, DagStatus::Running);
        assert_eq!(dag.operator, DagOperator::Run);
        assert_eq!(dag.kind, DagKind::Upgrade);
        assert_eq!(dag.nodes[0].name, "Check");

        let task = &dag.nodes[0].tasks[0];
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.capabilities, Capabilities::all());
        assert_eq!(task.context.param::<String>("zone").unwrap(), "z1");
        assert_eq!(task.agent(), &agent());
    }

    #[test]
    fn test_empty_dag_rejected() {
        let result = builder().build(DagSpec::new("nothing"));
        assert!(matches!(result, Err(EngineError::InvalidDag(_))));

        let result = builder().build(DagSpec::new("empty node").node(NodeSpec::new("n")));
        assert!(result.unwrap_err().to_string().contains("has no tasks"));
    }

    #[test]
    fn test_unregistered_type_rejected() {
        let spec = DagSpec::new("Backup")
            .node(NodeSpec::new("Backup").task(TaskSpec::new("backup", "backup_tenant", agent())));

        let result = builder().build(spec);
        assert!(matches!(result, Err(EngineError::UnknownOperationType(t)) if t == "backup_tenant"));
    }
}
