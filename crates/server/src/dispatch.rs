use shoal_core::engine::{
    AgentDispatcher, DispatchRequest, LogSink, OperationRegistry, StoreLogSink, TaskOutcome,
    TaskRunner,
};
use shoal_core::storage::DagStore;
use shoal_core::types::AgentInfo;
use shoal_core::{EngineError, EngineResult};
use shoal_sdk::ShoalClient;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Sends tasks to peer agents over HTTP.
///
/// A dispatch addressed to this agent runs in-process with live log
/// persistence. Logs of remote runs arrive with the outcome and are stored
/// once it is received.
pub struct HttpDispatcher {
    local: AgentInfo,
    runner: TaskRunner,
    store: Arc<dyn DagStore>,
    sink: Arc<dyn LogSink>,
    peers: ShoalClient,
}

impl HttpDispatcher {
    pub fn new(
        local: AgentInfo,
        registry: Arc<OperationRegistry>,
        store: Arc<dyn DagStore>,
        peers: ShoalClient,
    ) -> Self {
        Self {
            local,
            runner: TaskRunner::new(registry),
            sink: Arc::new(StoreLogSink::new(store.clone())),
            store,
            peers,
        }
    }
}

fn dispatch_error(agent: &AgentInfo, message: impl ToString) -> EngineError {
    EngineError::Dispatch {
        agent: agent.to_string(),
        message: message.to_string(),
    }
}

#[async_trait::async_trait]
impl AgentDispatcher for HttpDispatcher {
    async fn dispatch(
        &self,
        agent: &AgentInfo,
        request: DispatchRequest,
        cancel: CancellationToken,
    ) -> EngineResult<TaskOutcome> {
        if agent == &self.local {
            return Ok(self
                .runner
                .run(agent, request, cancel, Some(self.sink.clone()))
                .await);
        }

        let task_id = request.task.id;
        let client = self
            .peers
            .for_agent(agent)
            .map_err(|e| dispatch_error(agent, e))?;

        tracing::debug!("Dispatching task {} to {}", task_id, agent);
        let agent_client = client.agent();
        let outcome = tokio::select! {
            result = agent_client.dispatch(&request) => {
                result.map_err(|e| dispatch_error(agent, e))?
            }
            _ = cancel.cancelled() => {
                return Err(dispatch_error(agent, "dispatch cancelled"));
            }
        };

        self.store.append_task_logs(&task_id, &outcome.logs)?;

        Ok(outcome)
    }
}
