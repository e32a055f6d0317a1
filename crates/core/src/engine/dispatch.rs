use super::registry::OperationRegistry;
use super::task::{DispatchRequest, LogSink, StoreLogSink, TaskOutcome, TaskRunner};
use crate::error::EngineResult;
use crate::storage::DagStore;
use crate::types::AgentInfo;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Delivers a task to an agent and waits for its terminal report.
///
/// Implementations land the task's log lines in the local store, either as
/// they are produced or from the returned outcome.
#[async_trait::async_trait]
pub trait AgentDispatcher: Send + Sync {
    async fn dispatch(
        &self,
        agent: &AgentInfo,
        request: DispatchRequest,
        cancel: CancellationToken,
    ) -> EngineResult<TaskOutcome>;
}

/// Runs every dispatch in-process, acting as whichever agent is addressed
pub struct LocalDispatcher {
    runner: TaskRunner,
    sink: Arc<dyn LogSink>,
}

impl LocalDispatcher {
    pub fn new(registry: Arc<OperationRegistry>, store: Arc<dyn DagStore>) -> Self {
        Self {
            runner: TaskRunner::new(registry),
            sink: Arc::new(StoreLogSink::new(store)),
        }
    }
}

#[async_trait::async_trait]
impl AgentDispatcher for LocalDispatcher {
    async fn dispatch(
        &self,
        agent: &AgentInfo,
        request: DispatchRequest,
        cancel: CancellationToken,
    ) -> EngineResult<TaskOutcome> {
        Ok(self
            .runner
            .run(agent, request, cancel, Some(self.sink.clone()))
            .await)
    }
}
