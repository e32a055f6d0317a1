//! Operator-facing progress output for a watched DAG.

use shoal_core::types::{Dag, Task, TaskLogEntry};

/// Receives the milestones a [`crate::DagHandler`] observes.
pub trait ProgressReporter: Send + Sync {
    /// `stage` (1-based) was reached and has not been reported yet. Called once
    /// per stage in order, even when several stages pass between two polls.
    fn stage_started(&self, dag: &Dag, stage: usize);

    fn dag_succeeded(&self, dag: &Dag);

    /// The DAG stopped on a failure. `logs` is the tail of the failing task's log.
    fn dag_failed(&self, dag: &Dag, node: &str, task: Option<&Task>, logs: &[TaskLogEntry]);

    fn dag_rolled_back(&self, dag: &Dag);

    fn dag_cancelled(&self, dag: &Dag);
}

/// Prints progress to stdout.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleProgress;

impl ConsoleProgress {
    pub fn new() -> Self {
        Self
    }
}

impl ProgressReporter for ConsoleProgress {
    fn stage_started(&self, dag: &Dag, stage: usize) {
        let name = stage
            .checked_sub(1)
            .and_then(|i| dag.nodes.get(i))
            .map_or("", |node| node.name.as_str());
        println!("[{}/{}] {}", stage, dag.max_stage, name);
    }

    fn dag_succeeded(&self, dag: &Dag) {
        println!(
            "[{}/{}] {} done",
            dag.max_stage,
            dag.max_stage,
            dag.current_node().name
        );
        println!("Congratulations! '{}' task completed successfully.", dag.name);
    }

    fn dag_failed(&self, dag: &Dag, node: &str, task: Option<&Task>, logs: &[TaskLogEntry]) {
        if let Some(task) = task {
            println!("Task '{}' ({}) failed, last log lines:", task.name, task.id);
            for entry in logs {
                println!("  {}", entry);
            }
        }
        println!("Sorry, task '{}' failed at stage '{}'.", dag.name, node);
    }

    fn dag_rolled_back(&self, dag: &Dag) {
        println!("Task '{}' has been rolled back.", dag.name);
    }

    fn dag_cancelled(&self, dag: &Dag) {
        println!("Task '{}' cancelled.", dag.name);
    }
}

/// Discards every milestone.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn stage_started(&self, _dag: &Dag, _stage: usize) {}

    fn dag_succeeded(&self, _dag: &Dag) {}

    fn dag_failed(&self, _dag: &Dag, _node: &str, _task: Option<&Task>, _logs: &[TaskLogEntry]) {}

    fn dag_rolled_back(&self, _dag: &Dag) {}

    fn dag_cancelled(&self, _dag: &Dag) {}
}
