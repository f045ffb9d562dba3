//! File-backed transport used by the offline commands.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use swarm_core::{SwarmMessage, SwarmResult, TaskRequest};
use swarm_orchestrator::Transport;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Appends every sent request to a JSONL outbox as a `task_request` message.
///
/// A relay process is expected to drain the file and deliver the requests;
/// the line order is the send order.
pub struct OutboxTransport {
    path: PathBuf,
}

impl OutboxTransport {
    /// An outbox writing to `path`; the file is created on first send.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of the outbox.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Transport for OutboxTransport {
    async fn send(&self, target: &str, request: &TaskRequest) -> SwarmResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let mut line = serde_json::to_string(&SwarmMessage::TaskRequest(request.clone()))?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        debug!(task_id = %request.id(), target, "Request written to outbox");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use swarm_core::TaskRequestDraft;

    #[tokio::test]
    async fn test_outbox_appends_messages_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let transport = OutboxTransport::new(tmp.path().join("spool").join("outbox.jsonl"));

        for id in ["a", "b"] {
            let request = TaskRequestDraft::new("swarm:orchestrator", "work")
                .with_id(id)
                .with_target("worker:1")
                .with_created_at(5)
                .build()
                .unwrap();
            transport.send("worker:1", &request).await.unwrap();
        }

        let contents = tokio::fs::read_to_string(transport.path()).await.unwrap();
        let ids: Vec<String> = contents
            .lines()
            .map(|line| match SwarmMessage::parse_json(line).unwrap() {
                SwarmMessage::TaskRequest(request) => request.id().to_string(),
                other => panic!("unexpected message {other:?}"),
            })
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
