use super::{ApiError, ApiResult};
use crate::config::AppState;
use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use shoal_core::{
    engine::{DispatchRequest, TaskOutcome},
    events::Event,
    types::{Capabilities, Dag, DagId, DagKind, DagOperatorRequest, DagSpec, TaskId, TaskLogEntry},
};
use std::sync::Arc;

fn parse_dag_id(dag_id: &str) -> ApiResult<DagId> {
    dag_id
        .parse()
        .map_err(|_| ApiError::bad_request(format!("Invalid dag ID: {}", dag_id)))
}

fn parse_task_id(task_id: &str) -> ApiResult<TaskId> {
    task_id
        .parse()
        .map_err(|_| ApiError::bad_request(format!("Invalid task ID: {}", task_id)))
}

/// List registered operation types
pub async fn list_operations(
    State(state): State<Arc<AppState>>,
) -> Json<ListOperationsResponse> {
    let registry = state.executor.registry();
    let operations = registry
        .type_names()
        .into_iter()
        .filter_map(|type_name| {
            let capabilities = registry.capabilities(&type_name).ok()?;
            Some(OperationInfo {
                type_name,
                capabilities,
            })
        })
        .collect();

    Json(ListOperationsResponse { operations })
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OperationInfo {
    pub type_name: String,
    pub capabilities: Capabilities,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListOperationsResponse {
    pub operations: Vec<OperationInfo>,
}

/// Submit a new DAG
pub async fn submit_dag(
    State(state): State<Arc<AppState>>,
    Json(spec): Json<DagSpec>,
) -> ApiResult<Json<Dag>> {
    let dag = state.executor.submit(spec).await?;
    Ok(Json(dag))
}

/// List all DAGs, newest first
pub async fn list_dags(State(state): State<Arc<AppState>>) -> ApiResult<Json<ListDagsResponse>> {
    let dags = state.executor.list_dags().await?;
    Ok(Json(ListDagsResponse { dags }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListDagsResponse {
    pub dags: Vec<Dag>,
}

/// Get a DAG snapshot
pub async fn get_dag(
    State(state): State<Arc<AppState>>,
    Path(dag_id): Path<String>,
) -> ApiResult<Json<Dag>> {
    let dag_id = parse_dag_id(&dag_id)?;
    Ok(Json(state.executor.get_dag(dag_id).await?))
}

/// Get a DAG snapshot through the upgrade path, which only serves upgrade DAGs
pub async fn get_upgrade_dag(
    State(state): State<Arc<AppState>>,
    Path(dag_id): Path<String>,
) -> ApiResult<Json<Dag>> {
    let dag_id = parse_dag_id(&dag_id)?;
    let dag = state.executor.get_dag(dag_id).await?;

    if dag.kind != DagKind::Upgrade {
        return Err(ApiError::not_found(format!("dag {} is not an upgrade dag", dag_id)));
    }

    Ok(Json(dag))
}

/// Apply an operator command
pub async fn send_operator(
    State(state): State<Arc<AppState>>,
    Path(dag_id): Path<String>,
    Json(req): Json<DagOperatorRequest>,
) -> ApiResult<Json<Dag>> {
    let dag_id = parse_dag_id(&dag_id)?;
    tracing::info!("Operator {} requested for dag {}", req.operator, dag_id);

    let dag = state.executor.command(dag_id, req.operator).await?;
    Ok(Json(dag))
}

/// Get the audit trail of a DAG
pub async fn get_dag_events(
    State(state): State<Arc<AppState>>,
    Path(dag_id): Path<String>,
) -> ApiResult<Json<GetDagEventsResponse>> {
    let dag_id = parse_dag_id(&dag_id)?;
    let events = state.executor.dag_events(dag_id).await?;
    Ok(Json(GetDagEventsResponse { events }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetDagEventsResponse {
    pub events: Vec<Event>,
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub tail: Option<usize>,
}

/// Get the execution log of a task
pub async fn get_task_logs(
    State(state): State<Arc<AppState>>,
    Path((dag_id, task_id)): Path<(String, String)>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<Json<TaskLogsResponse>> {
    let dag_id = parse_dag_id(&dag_id)?;
    let task_id = parse_task_id(&task_id)?;

    let logs = state.executor.task_logs(dag_id, task_id, query.tail).await?;
    Ok(Json(TaskLogsResponse { logs }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TaskLogsResponse {
    pub logs: Vec<TaskLogEntry>,
}

/// Run a task another agent dispatched to this one
pub async fn dispatch_task(
    State(state): State<Arc<AppState>>,
    Json(request): Json<DispatchRequest>,
) -> Json<TaskOutcome> {
    tracing::info!(
        "Received task '{}' of dag {} ({:?})",
        request.task.name,
        request.dag_id,
        request.action
    );

    let outcome = state
        .runner
        .run(&state.agent, request, state.shutdown.child_token(), None)
        .await;
    Json(outcome)
}
