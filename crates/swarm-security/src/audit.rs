use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::PathBuf;
use swarm_core::{AuditEvent, AuditSink, SwarmError, SwarmResult};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

enum AuditCommand {
    Append(AuditEvent),
    Flush(oneshot::Sender<()>),
}

/// Append-only audit log that writes one JSON object per line to
/// `<log_dir>/audit.jsonl` from a background task.
pub struct JsonlAuditSink {
    tx: mpsc::UnboundedSender<AuditCommand>,
}

impl JsonlAuditSink {
    /// Create a new sink. Spawns the background writer, so this must be called
    /// from within a tokio runtime.
    pub fn new(log_dir: PathBuf) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<AuditCommand>();

        tokio::spawn(async move {
            if let Err(e) = tokio::fs::create_dir_all(&log_dir).await {
                warn!(dir = %log_dir.display(), error = %e, "Failed to create audit directory");
            }
            let log_file = log_dir.join("audit.jsonl");
            let mut file = match tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_file)
                .await
            {
                Ok(file) => Some(file),
                Err(e) => {
                    warn!(path = %log_file.display(), error = %e, "Failed to open audit log");
                    None
                }
            };

            while let Some(command) = rx.recv().await {
                match command {
                    AuditCommand::Append(event) => {
                        let Some(f) = file.as_mut() else { continue };
                        match serde_json::to_string(&event) {
                            Ok(line) => {
                                let line = format!("{line}\n");
                                if let Err(e) = f.write_all(line.as_bytes()).await {
                                    warn!(error = %e, "Failed to write audit entry");
                                }
                            }
                            Err(e) => warn!(error = %e, "Failed to serialize audit entry"),
                        }
                    }
                    AuditCommand::Flush(done) => {
                        if let Some(f) = file.as_mut() {
                            let _ = f.flush().await;
                        }
                        let _ = done.send(());
                    }
                }
            }
        });

        Self { tx }
    }

    /// Wait until every event appended so far has been written.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(AuditCommand::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

#[async_trait]
impl AuditSink for JsonlAuditSink {
    async fn append(&self, event: AuditEvent) -> SwarmResult<()> {
        info!(
            event_type = %event.event_type,
            actor = %event.actor,
            at = event.at,
            "audit"
        );
        self.tx
            .send(AuditCommand::Append(event))
            .map_err(|_| SwarmError::Store("audit writer stopped".into()))
    }
}

/// In-memory audit sink, for tests and embedding.
#[derive(Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all recorded events.
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    /// Event types in append order.
    pub fn event_types(&self) -> Vec<String> {
        self.events.lock().iter().map(|e| e.event_type.clone()).collect()
    }

    /// Number of recorded events of the given type.
    pub fn count(&self, event_type: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn append(&self, event: AuditEvent) -> SwarmResult<()> {
        self.events.lock().push(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_sink_records_in_order() {
        let sink = MemoryAuditSink::new();
        sink.append(AuditEvent::new("task_created", 1, "orchestrator", json!({})))
            .await
            .unwrap();
        sink.append(AuditEvent::new("task_result", 2, "orchestrator", json!({"ok": true})))
            .await
            .unwrap();
        assert_eq!(sink.event_types(), vec!["task_created", "task_result"]);
        assert_eq!(sink.count("task_result"), 1);
    }

    #[tokio::test]
    async fn test_jsonl_sink_writes_lines() {
        let tmp = tempfile::tempdir().unwrap();
        let log_dir = tmp.path().join("audit");
        let sink = JsonlAuditSink::new(log_dir.clone());

        for i in 0..3 {
            sink.append(AuditEvent::new(format!("event_{i}"), i, "tester", json!({"index": i})))
                .await
                .unwrap();
        }
        sink.flush().await;

        let contents = tokio::fs::read_to_string(log_dir.join("audit.jsonl")).await.unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["eventType"], "event_0");
        assert_eq!(first["actor"], "tester");
    }
}
