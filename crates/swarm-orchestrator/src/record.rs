//! Task bookkeeping owned by the orchestrator.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use swarm_core::{TaskReceipt, TaskRequest, TaskResult};
use swarm_security::{PolicyReason, Redaction};

/// Lifecycle status of a tracked task.
///
/// `completed`, `partial`, `failed`, `rejected`, `timed_out` and
/// `transport_error` are terminal: once reached, nothing changes the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Accepted, not yet sent.
    Created,
    /// Held until a reviewer approves.
    AwaitingApproval,
    /// Sent; no receipt yet.
    Dispatched,
    /// The worker confirmed receipt.
    Acknowledged,
    /// Waiting for `next_retry_at`.
    RetryScheduled,
    /// Finished successfully.
    Completed,
    /// Finished with partial output.
    Partial,
    /// The worker reported failure.
    Failed,
    /// Denied by a reviewer.
    Rejected,
    /// Ran out of retries after deadlines passed.
    TimedOut,
    /// Ran out of retries after send failures.
    TransportError,
}

impl TaskStatus {
    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Created => "created",
            TaskStatus::AwaitingApproval => "awaiting_approval",
            TaskStatus::Dispatched => "dispatched",
            TaskStatus::Acknowledged => "acknowledged",
            TaskStatus::RetryScheduled => "retry_scheduled",
            TaskStatus::Completed => "completed",
            TaskStatus::Partial => "partial",
            TaskStatus::Failed => "failed",
            TaskStatus::Rejected => "rejected",
            TaskStatus::TimedOut => "timed_out",
            TaskStatus::TransportError => "transport_error",
        }
    }

    /// Absorbing statuses; see the type docs.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed
                | TaskStatus::Partial
                | TaskStatus::Failed
                | TaskStatus::Rejected
                | TaskStatus::TimedOut
                | TaskStatus::TransportError
        )
    }

    /// States that maintenance watches for deadlines and due retries.
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            TaskStatus::Created | TaskStatus::Dispatched | TaskStatus::Acknowledged | TaskStatus::RetryScheduled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a record sits in the retry cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// No retry in flight.
    #[default]
    Idle,
    /// A send is under way.
    Dispatching,
    /// A retry is due at `next_retry_at`.
    Scheduled,
    /// Closed; no further retries.
    Terminalized,
}

/// Retry bookkeeping carried by every record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryLifecycle {
    /// Where the record is in the retry cycle.
    pub state: LifecycleState,
    /// Retries scheduled so far; drives the exponential factor.
    pub scheduled_count: u32,
    /// Send attempts, successful or not.
    pub dispatch_count: u32,
    /// Failures since the last successful send.
    pub consecutive_failures: u32,
    /// Hard bound on scheduled retries, `(maxRetries + 1) × cycleMultiplier`.
    pub max_cycles: u32,
    /// Reason of the most recent scheduled retry.
    pub last_reason: Option<String>,
    /// Delay chosen for that retry.
    pub last_delay_ms: Option<i64>,
    /// Due time of that retry.
    pub next_retry_at: Option<i64>,
    /// Why the record was closed, once terminalized.
    pub terminal_reason: Option<String>,
}

impl RetryLifecycle {
    /// Fresh lifecycle bounded by `max_cycles` scheduled retries.
    pub fn new(max_cycles: u32) -> Self {
        Self {
            max_cycles,
            ..Self::default()
        }
    }
}

/// Review state of an approval-gated task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    /// Waiting for a reviewer.
    Pending,
    /// Released for dispatch.
    Approved,
    /// Rejected by the reviewer.
    Denied,
}

/// Approval metadata attached to a gated task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRecord {
    /// Review state.
    pub status: ApprovalStatus,
    /// Who should review.
    #[serde(default)]
    pub reviewer_group: Option<String>,
    /// `approval_required:<rules>` as produced by the approval policy.
    pub reason: String,
    /// Approval rules that matched.
    #[serde(default)]
    pub matched_rules: Vec<String>,
    /// When the hold started.
    pub requested_at: i64,
    /// When the decision was made.
    #[serde(default)]
    pub reviewed_at: Option<i64>,
    /// Who decided.
    #[serde(default)]
    pub reviewer: Option<String>,
    /// Free text supplied by the reviewer.
    #[serde(default)]
    pub review_reason: Option<String>,
}

/// What the dispatch policy decided when the record was created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyRecord {
    /// Whether dispatch went ahead.
    pub allowed: bool,
    /// Denial reasons, empty when allowed.
    #[serde(default)]
    pub reasons: Vec<PolicyReason>,
    /// Redactions applied to the stored request.
    #[serde(default)]
    pub redactions: Vec<Redaction>,
}

/// One entry of a record's append-only history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Event time in epoch milliseconds.
    pub at: i64,
    /// Event name, e.g. `dispatched` or `retry_scheduled`.
    pub event: String,
    /// Event-specific fields, flattened into the entry on the wire.
    #[serde(flatten)]
    pub detail: Map<String, Value>,
}

impl HistoryEntry {
    /// Entry with no detail fields.
    pub fn new(at: i64, event: impl Into<String>) -> Self {
        Self {
            at,
            event: event.into(),
            detail: Map::new(),
        }
    }

    /// Attach a detail field.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.detail.insert(key.to_string(), value.into());
        self
    }
}

/// Everything the orchestrator knows about one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    /// Unique task id.
    pub task_id: String,
    /// Worker the task is sent to.
    pub target: String,
    /// The request as sent, after redaction.
    pub request: TaskRequest,
    /// Current status.
    pub status: TaskStatus,
    /// Present on approval-gated tasks.
    #[serde(default)]
    pub approval: Option<ApprovalRecord>,
    /// Present when a dispatch policy ran.
    #[serde(default)]
    pub policy: Option<PolicyRecord>,
    /// Sends made, the first included.
    pub attempts: u32,
    /// Retries allowed after the first send.
    pub max_retries: u32,
    /// Zero on records written before per-task timeouts existed.
    #[serde(default)]
    pub timeout_ms: i64,
    /// Retry bookkeeping.
    #[serde(default)]
    pub retry_lifecycle: RetryLifecycle,
    /// Creation time in epoch milliseconds.
    pub created_at: i64,
    /// Last mutation time.
    pub updated_at: i64,
    /// When the current attempt times out.
    pub deadline_at: i64,
    /// Due time of the scheduled retry, if any.
    #[serde(default)]
    pub next_retry_at: Option<i64>,
    /// When the record reached a terminal status.
    #[serde(default)]
    pub closed_at: Option<i64>,
    /// Last transport or timeout error.
    #[serde(default)]
    pub last_error: Option<String>,
    /// Receipts in arrival order.
    #[serde(default)]
    pub receipts: Vec<TaskReceipt>,
    /// The final result, once received.
    #[serde(default)]
    pub result: Option<TaskResult>,
    /// Append-only event log.
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

impl TaskRecord {
    /// True once the status is terminal.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// True while a human review stands between the record and the
    /// transport: the record is awaiting approval, or its approval is still
    /// pending or was denied.
    pub fn held_for_approval(&self) -> bool {
        self.status == TaskStatus::AwaitingApproval
            || self
                .approval
                .as_ref()
                .is_some_and(|a| a.status != ApprovalStatus::Approved)
    }

    /// Number of history entries with the given event name.
    pub fn history_count(&self, event: &str) -> usize {
        self.history.iter().filter(|h| h.event == event).count()
    }

    pub(crate) fn push_history(&mut self, entry: HistoryEntry) {
        self.history.push(entry);
    }

    /// Close the record with a terminal status.
    pub(crate) fn close(&mut self, status: TaskStatus, at: i64, terminal_reason: impl Into<String>) {
        self.status = status;
        self.updated_at = at;
        self.closed_at = Some(at);
        self.next_retry_at = None;
        self.retry_lifecycle.state = LifecycleState::Terminalized;
        self.retry_lifecycle.next_retry_at = None;
        self.retry_lifecycle.terminal_reason = Some(terminal_reason.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_and_open_sets_are_disjoint() {
        let all = [
            TaskStatus::Created,
            TaskStatus::AwaitingApproval,
            TaskStatus::Dispatched,
            TaskStatus::Acknowledged,
            TaskStatus::RetryScheduled,
            TaskStatus::Completed,
            TaskStatus::Partial,
            TaskStatus::Failed,
            TaskStatus::Rejected,
            TaskStatus::TimedOut,
            TaskStatus::TransportError,
        ];
        assert_eq!(all.iter().filter(|s| s.is_terminal()).count(), 6);
        assert!(all.iter().all(|s| !(s.is_terminal() && s.is_open())));
        assert!(!TaskStatus::AwaitingApproval.is_open());
        assert!(!TaskStatus::AwaitingApproval.is_terminal());
    }

    #[test]
    fn test_status_serializes_snake_case() {
        assert_eq!(serde_json::to_value(TaskStatus::TimedOut).unwrap(), "timed_out");
        assert_eq!(TaskStatus::RetryScheduled.to_string(), "retry_scheduled");
    }

    #[test]
    fn test_history_detail_is_flattened() {
        let entry = HistoryEntry::new(5, "send_attempt").with("attempt", 2).with("reason", "initial_dispatch");
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["event"], "send_attempt");
        assert_eq!(value["attempt"], 2);
        assert_eq!(value["reason"], "initial_dispatch");
    }

    #[test]
    fn test_held_for_approval_follows_review_state() {
        let request = swarm_core::TaskRequestDraft::new("swarm:orchestrator", "ship it")
            .with_id("t-1")
            .with_target("worker:a")
            .with_created_at(0)
            .build()
            .unwrap();
        let mut record = TaskRecord {
            task_id: "t-1".into(),
            target: "worker:a".into(),
            request,
            status: TaskStatus::Dispatched,
            approval: None,
            policy: None,
            attempts: 1,
            max_retries: 1,
            timeout_ms: 1_000,
            retry_lifecycle: RetryLifecycle::new(8),
            created_at: 0,
            updated_at: 0,
            deadline_at: 1_000,
            next_retry_at: None,
            closed_at: None,
            last_error: None,
            receipts: Vec::new(),
            result: None,
            history: Vec::new(),
        };
        assert!(!record.held_for_approval());

        record.approval = Some(ApprovalRecord {
            status: ApprovalStatus::Pending,
            reviewer_group: None,
            reason: "approval_required:critical_priority".into(),
            matched_rules: Vec::new(),
            requested_at: 0,
            reviewed_at: None,
            reviewer: None,
            review_reason: None,
        });
        assert!(record.held_for_approval());

        if let Some(approval) = record.approval.as_mut() {
            approval.status = ApprovalStatus::Approved;
        }
        assert!(!record.held_for_approval());

        record.status = TaskStatus::AwaitingApproval;
        assert!(record.held_for_approval());
    }

    #[test]
    fn test_lifecycle_defaults_when_missing() {
        let lifecycle: RetryLifecycle = serde_json::from_str("{}").unwrap();
        assert_eq!(lifecycle.state, LifecycleState::Idle);
        assert_eq!(lifecycle.max_cycles, 0);
    }
}
