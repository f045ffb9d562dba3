use crate::SwarmResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One structured audit event emitted by a core component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    /// Stable event name, e.g. `task_send_success`.
    pub event_type: String,
    /// Epoch milliseconds.
    pub at: i64,
    /// Component that emitted the event.
    pub actor: String,
    /// Event-specific data.
    pub payload: Value,
}

impl AuditEvent {
    /// Build an event.
    pub fn new(event_type: impl Into<String>, at: i64, actor: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            at,
            actor: actor.into(),
            payload,
        }
    }
}

/// Append-only destination for audit events.
///
/// Failures are reported to the caller, which logs and discards them; a sink
/// can never block or roll back a state transition.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Record one event. Errors are logged by callers and otherwise ignored.
    async fn append(&self, event: AuditEvent) -> SwarmResult<()>;
}
