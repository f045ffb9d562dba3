use crate::record::TaskRecord;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use swarm_core::{Clock, SwarmResult, SystemClock};
use tokio::io::AsyncWriteExt;
use tracing::warn;

/// Durable home for task records.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Every record the store holds, in no particular order.
    async fn load_records(&self) -> SwarmResult<Vec<TaskRecord>>;
    /// Insert or replace the record with the same task id.
    async fn save_record(&self, record: &TaskRecord) -> SwarmResult<()>;
    /// Remove a record. Deleting an unknown id is not an error.
    async fn delete_record(&self, task_id: &str) -> SwarmResult<()>;
}

/// One line of the store log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum StoreEvent {
    #[serde(rename_all = "camelCase")]
    Upsert {
        task_id: String,
        at: i64,
        record: Box<TaskRecord>,
    },
    #[serde(rename_all = "camelCase")]
    Delete { task_id: String, at: i64 },
    Snapshot {
        at: i64,
        records: BTreeMap<String, TaskRecord>,
    },
}

/// Append-only JSONL task store.
///
/// Every save or delete appends one event; loading replays the log.
/// [`FileTaskStore::compact`] rewrites the log as a single snapshot.
pub struct FileTaskStore {
    path: PathBuf,
    clock: Arc<dyn Clock>,
}

impl FileTaskStore {
    /// A store backed by the JSONL log at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Use `clock` to timestamp log events.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Location of the log.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn ensure_parent_dir(&self) -> SwarmResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        Ok(())
    }

    async fn append_event(&self, event: &StoreEvent) -> SwarmResult<()> {
        self.ensure_parent_dir().await?;
        let mut line = serde_json::to_string(event)?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Replace the log with one snapshot of `records`, via a temp file and rename.
    pub async fn compact(&self, records: &[TaskRecord]) -> SwarmResult<()> {
        self.ensure_parent_dir().await?;
        let snapshot = StoreEvent::Snapshot {
            at: self.clock.now_ms(),
            records: records
                .iter()
                .map(|r| (r.task_id.clone(), r.clone()))
                .collect(),
        };
        let mut payload = serde_json::to_string(&snapshot)?;
        payload.push('\n');

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, payload).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl TaskStore for FileTaskStore {
    async fn load_records(&self) -> SwarmResult<Vec<TaskRecord>> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut state: BTreeMap<String, TaskRecord> = BTreeMap::new();
        for (index, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<StoreEvent>(line) {
                Ok(StoreEvent::Upsert { task_id, record, .. }) => {
                    state.insert(task_id, *record);
                }
                Ok(StoreEvent::Delete { task_id, .. }) => {
                    state.remove(&task_id);
                }
                Ok(StoreEvent::Snapshot { records, .. }) => state = records,
                Err(e) => warn!(
                    path = %self.path.display(),
                    line = index + 1,
                    error = %e,
                    "Skipping malformed task store event"
                ),
            }
        }
        Ok(state.into_values().collect())
    }

    async fn save_record(&self, record: &TaskRecord) -> SwarmResult<()> {
        self.append_event(&StoreEvent::Upsert {
            task_id: record.task_id.clone(),
            at: self.clock.now_ms(),
            record: Box::new(record.clone()),
        })
        .await
    }

    async fn delete_record(&self, task_id: &str) -> SwarmResult<()> {
        self.append_event(&StoreEvent::Delete {
            task_id: task_id.to_string(),
            at: self.clock.now_ms(),
        })
        .await
    }
}

/// In-memory task store.
#[derive(Default)]
pub struct MemoryTaskStore {
    records: Mutex<BTreeMap<String, TaskRecord>>,
    saves: Mutex<u64>,
}

impl MemoryTaskStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store, as if the records had been saved earlier.
    pub fn with_records(records: Vec<TaskRecord>) -> Self {
        let store = Self::default();
        {
            let mut map = store.records.lock();
            for record in records {
                map.insert(record.task_id.clone(), record);
            }
        }
        store
    }

    /// Stored copy of a record.
    pub fn get(&self, task_id: &str) -> Option<TaskRecord> {
        self.records.lock().get(task_id).cloned()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// True when nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Number of `save_record` calls served.
    pub fn save_count(&self) -> u64 {
        *self.saves.lock()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn load_records(&self) -> SwarmResult<Vec<TaskRecord>> {
        Ok(self.records.lock().values().cloned().collect())
    }

    async fn save_record(&self, record: &TaskRecord) -> SwarmResult<()> {
        self.records.lock().insert(record.task_id.clone(), record.clone());
        *self.saves.lock() += 1;
        Ok(())
    }

    async fn delete_record(&self, task_id: &str) -> SwarmResult<()> {
        self.records.lock().remove(task_id);
        Ok(())
    }
}
