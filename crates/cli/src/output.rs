//! Plain-text rendering of agent responses.

use shoal_sdk::api::OperationInfo;
use shoal_sdk::{Capabilities, Dag, Event, EventType};

pub fn print_dag_list(dags: &[Dag]) {
    if dags.is_empty() {
        println!("No dags");
        return;
    }
    for dag in dags {
        println!(
            "{}  {:<10} {}/{}  {}  {}",
            dag.id,
            dag.status.to_string(),
            dag.stage,
            dag.max_stage,
            dag.created_at.format("%Y-%m-%d %H:%M:%S"),
            dag.name
        );
    }
}

pub fn print_dag(dag: &Dag) {
    println!("{} ({})", dag.name, dag.id);
    println!(
        "  status: {}  stage: {}/{}  operator: {}",
        dag.status, dag.stage, dag.max_stage, dag.operator
    );

    for (i, node) in dag.nodes.iter().enumerate() {
        let marker = if i + 1 == dag.stage { ">" } else { " " };
        println!("{} [{}] {} ({:?})", marker, i + 1, node.name, node.status());
        for task in &node.tasks {
            println!(
                "      {}  {:<11} {} ({}) on {}",
                task.id,
                task.status.to_string(),
                task.name,
                task.type_name,
                task.agent()
            );
            for (agent, status) in &task.agent_results {
                println!("          {} {}", agent, status);
            }
        }
    }
}

pub fn print_operations(operations: &[OperationInfo]) {
    for op in operations {
        println!("{:<20} {}", op.type_name, capability_list(&op.capabilities));
    }
}

fn capability_list(caps: &Capabilities) -> String {
    let flags = [
        (caps.can_continue, "continue"),
        (caps.can_retry, "retry"),
        (caps.can_pass, "pass"),
        (caps.can_rollback, "rollback"),
        (caps.can_cancel, "cancel"),
    ];
    let names: Vec<&str> = flags
        .iter()
        .filter(|(set, _)| *set)
        .map(|(_, name)| *name)
        .collect();
    if names.is_empty() {
        "-".to_string()
    } else {
        names.join(",")
    }
}

pub fn print_events(events: &[Event]) {
    for event in events {
        println!(
            "{}  {}",
            event.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            describe(&event.event_type)
        );
    }
}

fn describe(event: &EventType) -> String {
    match event {
        EventType::DagSubmitted { name, max_stage } => {
            format!("submitted '{}' with {} stage(s)", name, max_stage)
        }
        EventType::DagSucceeded => "dag succeeded".to_string(),
        EventType::DagFailed { stage, error } => format!("dag failed at stage {}: {}", stage, error),
        EventType::DagCancelled => "dag cancelled".to_string(),
        EventType::DagRolledBack => "dag rolled back".to_string(),
        EventType::DagRecovered { stage } => format!("resumed at stage {} after restart", stage),
        EventType::StageStarted { stage, node } => format!("stage {} '{}' started", stage, node),
        EventType::StageAdvanced { from, to } => format!("advanced from stage {} to {}", from, to),
        EventType::StageRolledBack { stage, node } => {
            format!("stage {} '{}' rolled back", stage, node)
        }
        EventType::TaskDispatched {
            task_id,
            agent,
            action,
        } => format!("task {} dispatched to {} ({:?})", task_id, agent, action),
        EventType::TaskSucceeded { task_id } => format!("task {} succeeded", task_id),
        EventType::TaskFailed { task_id, error } => format!("task {} failed: {}", task_id, error),
        EventType::TaskRolledBack { task_id } => format!("task {} rolled back", task_id),
        EventType::OperatorCommand { operator } => format!("operator {}", operator),
    }
}
