use super::task::Operation;
use crate::error::{EngineError, EngineResult};
use crate::types::{Capabilities, TaskContext};
use std::collections::HashMap;
use std::sync::Arc;

/// An operation prototype bound to a restored task context
#[derive(Clone)]
pub struct TaskInstance {
    pub operation: Arc<dyn Operation>,
    pub context: TaskContext,
}

impl TaskInstance {
    pub fn type_name(&self) -> &str {
        self.operation.type_name()
    }

    pub fn capabilities(&self) -> Capabilities {
        self.operation.capabilities()
    }
}

impl std::fmt::Debug for TaskInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskInstance")
            .field("type_name", &self.type_name())
            .field("context", &self.context)
            .finish()
    }
}

/// Catalog of operation types. Built once at start-up and read-only afterwards.
pub struct OperationRegistry {
    operations: HashMap<String, Arc<dyn Operation>>,
}

impl OperationRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Restore an executable instance from a persisted type name and context
    pub fn instantiate(&self, type_name: &str, context: TaskContext) -> EngineResult<TaskInstance> {
        let operation = self
            .operations
            .get(type_name)
            .cloned()
            .ok_or_else(|| EngineError::UnknownOperationType(type_name.to_string()))?;

        Ok(TaskInstance { operation, context })
    }

    pub fn get(&self, type_name: &str) -> Option<Arc<dyn Operation>> {
        self.operations.get(type_name).cloned()
    }

    /// Capability flags tasks of this type are created with
    pub fn capabilities(&self, type_name: &str) -> EngineResult<Capabilities> {
        self.get(type_name)
            .map(|op| op.capabilities())
            .ok_or_else(|| EngineError::UnknownOperationType(type_name.to_string()))
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.operations.contains_key(type_name)
    }

    /// Registered type names, sorted
    pub fn type_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.operations.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

#[derive(Default)]
pub struct RegistryBuilder {
    operations: HashMap<String, Arc<dyn Operation>>,
}

impl RegistryBuilder {
    /// Register an operation prototype. A type name may only be registered once.
    pub fn register(mut self, operation: Arc<dyn Operation>) -> EngineResult<Self> {
        let name = operation.type_name().to_string();
        if self.operations.contains_key(&name) {
            return Err(EngineError::DuplicateOperationType(name));
        }
        tracing::debug!("Registered operation type: {}", name);
        self.operations.insert(name, operation);
        Ok(self)
    }

    pub fn build(self) -> OperationRegistry {
        OperationRegistry {
            operations: self.operations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::task::TaskRun;
    use crate::types::AgentInfo;

    struct AddZone;

    #[async_trait::async_trait]
    impl Operation for AddZone {
        fn type_name(&self) -> &str {
            "add_zone"
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities::none().retryable().rollbackable()
        }

        async fn execute(&self, run: &mut TaskRun) -> anyhow::Result<()> {
            let zone: String = run.context().param("zone")?;
            run.log(format!("zone {} added", zone));
            Ok(())
        }
    }

    struct DeleteZone;

    #[async_trait::async_trait]
    impl Operation for DeleteZone {
        fn type_name(&self) -> &str {
            "delete_zone"
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities::default()
        }

        async fn execute(&self, _run: &mut TaskRun) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_register_and_instantiate() {
        let registry = OperationRegistry::builder()
            .register(Arc::new(AddZone))
            .unwrap()
            .register(Arc::new(DeleteZone))
            .unwrap()
            .build();

        assert_eq!(registry.len(), 2);
        assert!(registry.contains("add_zone"));
        assert_eq!(registry.type_names(), vec!["add_zone", "delete_zone"]);

        let context = TaskContext::new(AgentInfo::new("10.0.0.1", 2886)).with_param("zone", "z3");
        let instance = registry.instantiate("add_zone", context.clone()).unwrap();
        assert_eq!(instance.type_name(), "add_zone");
        assert_eq!(instance.context, context);
        assert!(instance.capabilities().can_retry);
        assert!(!instance.capabilities().can_pass);
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let result = OperationRegistry::builder()
            .register(Arc::new(AddZone))
            .unwrap()
            .register(Arc::new(AddZone));

        match result {
            Err(EngineError::DuplicateOperationType(name)) => assert_eq!(name, "add_zone"),
            _ => panic!("expected DuplicateOperationType"),
        }
    }

    #[test]
    fn test_unknown_operation_type() {
        let registry = OperationRegistry::builder().build();
        let context = TaskContext::new(AgentInfo::new("10.0.0.1", 2886));

        let err = registry.instantiate("upgrade_binary", context).unwrap_err();
        assert!(matches!(err, EngineError::UnknownOperationType(ref t) if t == "upgrade_binary"));
        assert!(registry.capabilities("upgrade_binary").is_err());
    }
}
