use crate::events::{Event, EventLog};
use crate::types::DagId;
use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// Number of buffered events per DAG before they are written out
const FLUSH_THRESHOLD: usize = 32;

/// Audit journal using JSONL (JSON Lines) files compressed with gzip
pub struct JsonlEventLog {
    base_path: PathBuf,
    // Pending events per DAG, flushed on threshold or on read
    buffer: Mutex<HashMap<DagId, Vec<Event>>>,
}

impl JsonlEventLog {
    pub fn new(base_path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&base_path).context("Failed to create event log directory")?;
        Ok(Self {
            base_path,
            buffer: Mutex::new(HashMap::new()),
        })
    }

    /// Format: events/YYYY/MM/DD/<dag_id>.jsonl.gz
    fn event_log_path(&self, dag_id: &DagId, date: NaiveDate) -> PathBuf {
        self.base_path
            .join("events")
            .join(format!("{:04}", date.year()))
            .join(format!("{:02}", date.month()))
            .join(format!("{:02}", date.day()))
            .join(format!("{}.jsonl.gz", dag_id))
    }

    /// Write buffered events of one DAG to disk
    pub async fn flush(&self, dag_id: &DagId) -> Result<()> {
        let events = {
            let mut buffer = self.buffer.lock().await;
            match buffer.remove(dag_id) {
                Some(events) if !events.is_empty() => events,
                _ => return Ok(()),
            }
        };

        let mut events_by_date: HashMap<NaiveDate, Vec<Event>> = HashMap::new();
        for event in events {
            events_by_date
                .entry(event.timestamp.date_naive())
                .or_default()
                .push(event);
        }

        for (date, events) in events_by_date {
            let path = self.event_log_path(dag_id, date);

            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .context("Failed to create event log directory")?;
            }

            let mut all_events = if path.exists() {
                read_jsonl_gz(&path)?
            } else {
                Vec::new()
            };
            all_events.extend(events);

            write_jsonl_gz(&path, &all_events).await?;
        }

        Ok(())
    }

    /// Write out every buffered DAG, used on shutdown
    pub async fn flush_all(&self) -> Result<()> {
        let dag_ids: Vec<DagId> = self.buffer.lock().await.keys().copied().collect();
        for dag_id in dag_ids {
            self.flush(&dag_id).await?;
        }
        Ok(())
    }

    fn get_log_files(&self, dag_id: &DagId) -> Result<Vec<PathBuf>> {
        let events_dir = self.base_path.join("events");
        if !events_dir.exists() {
            return Ok(Vec::new());
        }

        let filename = format!("{}.jsonl.gz", dag_id);
        let mut files = Vec::new();

        // events/<year>/<month>/<day>/
        for year in subdirs(&events_dir)? {
            for month in subdirs(&year)? {
                for day in subdirs(&month)? {
                    let log_file = day.join(&filename);
                    if log_file.exists() {
                        files.push(log_file);
                    }
                }
            }
        }

        Ok(files)
    }
}

fn subdirs(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(dir).context("Failed to read event log directory")? {
        let path = entry.context("Failed to read directory entry")?.path();
        if path.is_dir() {
            dirs.push(path);
        }
    }
    Ok(dirs)
}

fn read_jsonl_gz(path: &Path) -> Result<Vec<Event>> {
    use flate2::read::GzDecoder;
    use std::io::BufRead;

    let file = std::fs::File::open(path).context("Failed to open event log")?;
    let reader = std::io::BufReader::new(GzDecoder::new(file));

    let mut events = Vec::new();
    for line in reader.lines() {
        let line = line.context("Failed to read line from event log")?;
        if line.is_empty() {
            continue;
        }
        let event: Event = serde_json::from_str(&line).context("Failed to parse event")?;
        events.push(event);
    }

    Ok(events)
}

async fn write_jsonl_gz(path: &Path, events: &[Event]) -> Result<()> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());

    for event in events {
        let json = serde_json::to_string(event).context("Failed to serialize event")?;
        encoder
            .write_all(json.as_bytes())
            .context("Failed to write event")?;
        encoder.write_all(b"\n").context("Failed to write newline")?;
    }

    let compressed = encoder.finish().context("Failed to finish compression")?;

    tokio::fs::write(path, compressed)
        .await
        .context("Failed to write event log file")?;

    Ok(())
}

#[async_trait::async_trait]
impl EventLog for JsonlEventLog {
    async fn append(&self, event: Event) -> Result<()> {
        let dag_id = event.dag_id;
        let pending = {
            let mut buffer = self.buffer.lock().await;
            let events = buffer.entry(dag_id).or_default();
            events.push(event);
            events.len()
        };

        if pending >= FLUSH_THRESHOLD {
            self.flush(&dag_id).await?;
        }

        Ok(())
    }

    async fn get_dag_events(&self, dag_id: DagId) -> Result<Vec<Event>> {
        self.flush(&dag_id).await?;

        let mut all_events = Vec::new();
        for file in self.get_log_files(&dag_id)? {
            all_events.extend(read_jsonl_gz(&file)?);
        }

        all_events.sort_by_key(|e| e.timestamp);

        Ok(all_events)
    }

    async fn get_dag_events_range(
        &self,
        dag_id: DagId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Event>> {
        let all_events = self.get_dag_events(dag_id).await?;
        Ok(all_events
            .into_iter()
            .filter(|e| e.timestamp >= start && e.timestamp <= end)
            .collect())
    }
}
