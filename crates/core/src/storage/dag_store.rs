use crate::types::{Dag, DagId, TaskId, TaskLogEntry, TaskStatus};
use anyhow::{Context, Result};
use redb::{Database, Durability, ReadableTable, Table, TableDefinition};
use std::path::PathBuf;
use std::sync::Arc;

const DAGS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("dags");
/// One row per log line, keyed by (task id, sequence number)
const TASK_LOGS_TABLE: TableDefinition<(&str, u64), &[u8]> = TableDefinition::new("task_logs");

type LogTable<'txn> = Table<'txn, (&'static str, u64), &'static [u8]>;

/// Persistence contract of the engine. Every call is atomic.
pub trait DagStore: Send + Sync {
    /// Insert or overwrite a DAG record
    fn save_dag(&self, dag: &Dag) -> Result<()>;

    /// Write `dag` only if the stored version still equals `expected_version`.
    /// Returns false when another writer got there first.
    fn compare_and_swap(&self, dag: &Dag, expected_version: u64) -> Result<bool>;

    /// Get a DAG by ID
    fn load_dag(&self, dag_id: &DagId) -> Result<Option<Dag>>;

    /// List all DAGs, most recent first
    fn list_dags(&self) -> Result<Vec<Dag>>;

    /// Update one task's status and append to its log in a single transaction
    fn save_task_status(
        &self,
        dag_id: &DagId,
        task_id: &TaskId,
        status: TaskStatus,
        log: &[TaskLogEntry],
    ) -> Result<()>;

    /// Append lines to a task's execution log
    fn append_task_logs(&self, task_id: &TaskId, entries: &[TaskLogEntry]) -> Result<()>;

    fn append_task_log(&self, task_id: &TaskId, entry: &TaskLogEntry) -> Result<()> {
        self.append_task_logs(task_id, std::slice::from_ref(entry))
    }

    /// Execution log of a task, oldest first. With `tail`, only the last
    /// `tail` lines are read.
    fn task_logs(&self, task_id: &TaskId, tail: Option<usize>) -> Result<Vec<TaskLogEntry>>;
}

/// DAG store backed by redb
#[derive(Clone)]
pub struct RedbDagStore {
    db: Arc<Database>,
}

impl RedbDagStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create store directory")?;
        }

        let db = Database::create(&path).context("Failed to create redb database")?;

        // Initialize tables
        let write_txn = db.begin_write().context("Failed to begin write transaction")?;
        {
            let _dags = write_txn
                .open_table(DAGS_TABLE)
                .context("Failed to open dags table")?;
            let _logs = write_txn
                .open_table(TASK_LOGS_TABLE)
                .context("Failed to open task logs table")?;
        }
        write_txn.commit().context("Failed to commit transaction")?;

        Ok(Self { db: Arc::new(db) })
    }

    fn decode_dag(bytes: &[u8]) -> Result<Dag> {
        serde_json::from_slice(bytes).context("Failed to deserialize dag")
    }

    fn decode_log(bytes: &[u8]) -> Result<TaskLogEntry> {
        serde_json::from_slice(bytes).context("Failed to deserialize log line")
    }

    /// Append lines after the highest sequence number already stored for the task
    fn push_log_lines(table: &mut LogTable<'_>, task_id: &TaskId, lines: &[TaskLogEntry]) -> Result<()> {
        let key = task_id.to_string();
        let mut seq = match table
            .range((key.as_str(), 0)..=(key.as_str(), u64::MAX))
            .context("Failed to scan task log")?
            .next_back()
        {
            Some(item) => item.context("Failed to read task log")?.0.value().1 + 1,
            None => 0,
        };

        for line in lines {
            let value = serde_json::to_vec(line).context("Failed to serialize log line")?;
            table
                .insert((key.as_str(), seq), value.as_slice())
                .context("Failed to insert log line")?;
            seq += 1;
        }
        Ok(())
    }
}

impl DagStore for RedbDagStore {
    fn save_dag(&self, dag: &Dag) -> Result<()> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        {
            let mut table = write_txn
                .open_table(DAGS_TABLE)
                .context("Failed to open table")?;

            let key = dag.id.to_string();
            let value = serde_json::to_vec(dag).context("Failed to serialize dag")?;

            table
                .insert(key.as_str(), value.as_slice())
                .context("Failed to insert dag")?;
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(())
    }

    fn compare_and_swap(&self, dag: &Dag, expected_version: u64) -> Result<bool> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        {
            let mut table = write_txn
                .open_table(DAGS_TABLE)
                .context("Failed to open table")?;

            let key = dag.id.to_string();
            let current_version = match table.get(key.as_str()).context("Failed to get dag")? {
                Some(guard) => Some(Self::decode_dag(guard.value())?.version),
                None => None,
            };

            if current_version != Some(expected_version) {
                // Dropping the transaction aborts it
                return Ok(false);
            }

            let value = serde_json::to_vec(dag).context("Failed to serialize dag")?;
            table
                .insert(key.as_str(), value.as_slice())
                .context("Failed to insert dag")?;
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(true)
    }

    fn load_dag(&self, dag_id: &DagId) -> Result<Option<Dag>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn.open_table(DAGS_TABLE).context("Failed to open table")?;

        let key = dag_id.to_string();
        let value = table.get(key.as_str()).context("Failed to get dag")?;

        match value {
            Some(guard) => Ok(Some(Self::decode_dag(guard.value())?)),
            None => Ok(None),
        }
    }

    fn list_dags(&self) -> Result<Vec<Dag>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn.open_table(DAGS_TABLE).context("Failed to open table")?;

        let mut dags = Vec::new();
        for item in table.iter().context("Failed to iterate dags")? {
            let (_key, value) = item.context("Failed to read item")?;
            dags.push(Self::decode_dag(value.value())?);
        }

        dags.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(dags)
    }

    fn save_task_status(
        &self,
        dag_id: &DagId,
        task_id: &TaskId,
        status: TaskStatus,
        log: &[TaskLogEntry],
    ) -> Result<()> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        {
            let mut dags = write_txn
                .open_table(DAGS_TABLE)
                .context("Failed to open table")?;

            let key = dag_id.to_string();
            let mut dag = match dags.get(key.as_str()).context("Failed to get dag")? {
                Some(guard) => Self::decode_dag(guard.value())?,
                None => anyhow::bail!("dag {} not found", dag_id),
            };

            let now = chrono::Utc::now();
            let task = dag
                .task_mut(task_id)
                .with_context(|| format!("task {} not found in dag {}", task_id, dag_id))?;
            task.status = status;
            if status.is_terminal() {
                task.finished_at = Some(now);
            } else {
                task.finished_at = None;
            }
            dag.version += 1;
            dag.updated_at = now;

            let value = serde_json::to_vec(&dag).context("Failed to serialize dag")?;
            dags.insert(key.as_str(), value.as_slice())
                .context("Failed to insert dag")?;

            if !log.is_empty() {
                let mut logs = write_txn
                    .open_table(TASK_LOGS_TABLE)
                    .context("Failed to open task logs table")?;
                Self::push_log_lines(&mut logs, task_id, log)?;
            }
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(())
    }

    fn append_task_logs(&self, task_id: &TaskId, entries: &[TaskLogEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut write_txn = self.db.begin_write().context("Failed to begin write")?;
        // Log lines ride on the next durable commit instead of forcing an fsync each
        write_txn.set_durability(Durability::Eventual);
        {
            let mut table = write_txn
                .open_table(TASK_LOGS_TABLE)
                .context("Failed to open table")?;
            Self::push_log_lines(&mut table, task_id, entries)?;
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(())
    }

    fn task_logs(&self, task_id: &TaskId, tail: Option<usize>) -> Result<Vec<TaskLogEntry>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn
            .open_table(TASK_LOGS_TABLE)
            .context("Failed to open table")?;

        let key = task_id.to_string();
        let rows = table
            .range((key.as_str(), 0)..=(key.as_str(), u64::MAX))
            .context("Failed to scan task log")?;

        let mut logs = Vec::new();
        match tail {
            Some(tail) => {
                for item in rows.rev().take(tail) {
                    let (_key, value) = item.context("Failed to read log line")?;
                    logs.push(Self::decode_log(value.value())?);
                }
                logs.reverse();
            }
            None => {
                for item in rows {
                    let (_key, value) = item.context("Failed to read log line")?;
                    logs.push(Self::decode_log(value.value())?);
                }
            }
        }
        Ok(logs)
    }
}
