//! The three messages exchanged between the orchestrator and workers.
//!
//! [`TaskRequest`] is immutable once built: it can only be produced through a
//! validating [`TaskRequestDraft`] (directly, or implicitly when deserializing),
//! and its fields are exposed read-only.

use crate::{SwarmError, SwarmResult};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Structured context attached to a task request.
pub type TaskContext = Map<String, Value>;

/// Priority of a task request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    /// Background work; routers penalise it slightly.
    Low,
    /// The default.
    #[default]
    Normal,
    /// Preferred by routers.
    High,
    /// Needs a lightly loaded worker; approval policies may gate it.
    Critical,
}

impl TaskPriority {
    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPriority::Low => "low",
            TaskPriority::Normal => "normal",
            TaskPriority::High => "high",
            TaskPriority::Critical => "critical",
        }
    }
}

impl std::fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutable, unvalidated form of a [`TaskRequest`].
///
/// Call [`TaskRequestDraft::build`] to obtain a validated request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRequestDraft {
    /// Task id, unique per orchestrator.
    pub id: String,
    /// Agent id of the sender.
    pub from: String,
    /// Worker id; may be filled in later by a router.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Request priority.
    #[serde(default)]
    pub priority: TaskPriority,
    /// What the worker should do.
    pub task: String,
    /// Structured context, e.g. `requiredCapabilities` or `riskTags`.
    #[serde(default)]
    pub context: TaskContext,
    /// Free-form constraints passed to the worker.
    #[serde(default)]
    pub constraints: Vec<String>,
    /// Creation time in epoch milliseconds.
    pub created_at: i64,
}

impl TaskRequestDraft {
    /// Start a draft with a fresh UUID and the current wall-clock time.
    pub fn new(from: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            from: from.into(),
            target: None,
            priority: TaskPriority::Normal,
            task: task.into(),
            context: TaskContext::new(),
            constraints: Vec::new(),
            created_at: Utc::now().timestamp_millis(),
        }
    }

    /// Replace the generated id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Address the draft to a worker.
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Replace the context.
    pub fn with_context(mut self, context: TaskContext) -> Self {
        self.context = context;
        self
    }

    /// Insert a single context entry.
    pub fn with_context_value(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    /// Set the constraints.
    pub fn with_constraints(mut self, constraints: Vec<String>) -> Self {
        self.constraints = constraints;
        self
    }

    /// Set the creation time.
    pub fn with_created_at(mut self, created_at: i64) -> Self {
        self.created_at = created_at;
        self
    }

    /// Validate the draft and freeze it into a [`TaskRequest`].
    pub fn build(self) -> SwarmResult<TaskRequest> {
        TaskRequest::try_from(self)
    }
}

/// A validated, immutable request for a worker to perform a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "TaskRequestDraft")]
pub struct TaskRequest {
    id: String,
    from: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    target: Option<String>,
    priority: TaskPriority,
    task: String,
    #[serde(skip_serializing_if = "Map::is_empty")]
    context: TaskContext,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    constraints: Vec<String>,
    created_at: i64,
}

impl TryFrom<TaskRequestDraft> for TaskRequest {
    type Error = SwarmError;

    fn try_from(draft: TaskRequestDraft) -> SwarmResult<Self> {
        require_non_empty("id", &draft.id)?;
        require_non_empty("from", &draft.from)?;
        require_non_empty("task", &draft.task)?;
        if let Some(target) = &draft.target {
            require_non_empty("target", target)?;
        }
        if draft.created_at < 0 {
            return Err(SwarmError::validation("createdAt must be a non-negative timestamp"));
        }

        Ok(Self {
            id: draft.id,
            from: draft.from,
            target: draft.target,
            priority: draft.priority,
            task: draft.task,
            context: draft.context,
            constraints: draft.constraints,
            created_at: draft.created_at,
        })
    }
}

impl TaskRequest {
    /// Parse and validate a request from an untyped JSON payload.
    pub fn parse(value: Value) -> SwarmResult<Self> {
        Ok(serde_json::from_value(value)?)
    }

    /// Task id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Sender agent id.
    pub fn from(&self) -> &str {
        &self.from
    }

    /// Worker id, when addressed.
    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    /// Request priority.
    pub fn priority(&self) -> TaskPriority {
        self.priority
    }

    /// Task text.
    pub fn task(&self) -> &str {
        &self.task
    }

    /// Structured context.
    pub fn context(&self) -> &TaskContext {
        &self.context
    }

    /// Free-form constraints.
    pub fn constraints(&self) -> &[String] {
        &self.constraints
    }

    /// Creation time in epoch milliseconds.
    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    /// Copy this request back into an editable draft.
    pub fn to_draft(&self) -> TaskRequestDraft {
        TaskRequestDraft {
            id: self.id.clone(),
            from: self.from.clone(),
            target: self.target.clone(),
            priority: self.priority,
            task: self.task.clone(),
            context: self.context.clone(),
            constraints: self.constraints.clone(),
            created_at: self.created_at,
        }
    }

    /// A copy of this request addressed to `target`.
    pub fn retarget(&self, target: impl Into<String>) -> SwarmResult<Self> {
        self.to_draft().with_target(target).build()
    }

    /// `context.requiredCapabilities`, trimmed and de-duplicated in order.
    pub fn required_capabilities(&self) -> Vec<String> {
        normalize_string_list(self.context.get("requiredCapabilities"))
    }

    /// `context.riskTags`, lowercased, trimmed and de-duplicated in order.
    pub fn risk_tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = Vec::new();
        for tag in normalize_string_list(self.context.get("riskTags")) {
            let lowered = tag.to_lowercase();
            if !tags.contains(&lowered) {
                tags.push(lowered);
            }
        }
        tags
    }

    /// True only when `context[key]` is the JSON boolean `true`.
    pub fn context_flag(&self, key: &str) -> bool {
        matches!(self.context.get(key), Some(Value::Bool(true)))
    }
}

/// Keep string entries of a JSON array, trimmed, non-empty and unique.
pub fn normalize_string_list(value: Option<&Value>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    if let Some(Value::Array(items)) = value {
        for item in items {
            if let Some(s) = item.as_str() {
                let trimmed = s.trim();
                if !trimmed.is_empty() && !out.iter().any(|existing| existing == trimmed) {
                    out.push(trimmed.to_string());
                }
            }
        }
    }
    out
}

fn require_non_empty(field: &str, value: &str) -> SwarmResult<()> {
    if value.trim().is_empty() {
        return Err(SwarmError::validation(format!("{field} must be a non-empty string")));
    }
    Ok(())
}

/// A worker's acknowledgement (or refusal) of a task request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskReceipt {
    /// Task being acknowledged.
    pub task_id: String,
    /// Worker sending the receipt.
    pub from: String,
    /// `false` means the worker refused the task.
    pub accepted: bool,
    /// Refusal reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Expected time to completion; moves the task deadline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta_ms: Option<u64>,
    /// Receipt time in epoch milliseconds.
    pub timestamp: i64,
}

impl TaskReceipt {
    /// A receipt accepting the task.
    pub fn accepted(task_id: impl Into<String>, from: impl Into<String>, timestamp: i64) -> Self {
        Self {
            task_id: task_id.into(),
            from: from.into(),
            accepted: true,
            reason: None,
            eta_ms: None,
            timestamp,
        }
    }

    /// A receipt refusing the task.
    pub fn rejected(
        task_id: impl Into<String>,
        from: impl Into<String>,
        reason: impl Into<String>,
        timestamp: i64,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            from: from.into(),
            accepted: false,
            reason: Some(reason.into()),
            eta_ms: None,
            timestamp,
        }
    }

    /// Attach an expected completion time.
    pub fn with_eta(mut self, eta_ms: u64) -> Self {
        self.eta_ms = Some(eta_ms);
        self
    }

    /// Check identity fields and the timestamp.
    pub fn validate(&self) -> SwarmResult<()> {
        require_non_empty("taskId", &self.task_id)?;
        require_non_empty("from", &self.from)?;
        if self.timestamp < 0 {
            return Err(SwarmError::validation("timestamp must be non-negative"));
        }
        Ok(())
    }
}

/// Outcome reported by a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskResultStatus {
    /// The task finished.
    Success,
    /// The task could not be done.
    Failure,
    /// Some of the work was done.
    Partial,
}

impl TaskResultStatus {
    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskResultStatus::Success => "success",
            TaskResultStatus::Failure => "failure",
            TaskResultStatus::Partial => "partial",
        }
    }
}

/// A file created or modified by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultArtifact {
    /// Artifact name.
    pub name: String,
    /// Where the worker stored it.
    pub path: String,
    /// Optional media or artifact type.
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

/// The final report of a worker for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    /// Task being reported on.
    pub task_id: String,
    /// Worker reporting.
    pub from: String,
    /// Outcome.
    pub status: TaskResultStatus,
    /// Human-readable output.
    pub output: String,
    /// Files produced.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<ResultArtifact>,
    /// Numeric metrics, all finite.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metrics: BTreeMap<String, f64>,
    /// Completion time in epoch milliseconds.
    pub completed_at: i64,
}

impl TaskResult {
    /// Build a result.
    pub fn new(
        task_id: impl Into<String>,
        from: impl Into<String>,
        status: TaskResultStatus,
        output: impl Into<String>,
        completed_at: i64,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            from: from.into(),
            status,
            output: output.into(),
            artifacts: Vec::new(),
            metrics: BTreeMap::new(),
            completed_at,
        }
    }

    /// A successful result with output `ok`.
    pub fn success(task_id: impl Into<String>, from: impl Into<String>, completed_at: i64) -> Self {
        Self::new(task_id, from, TaskResultStatus::Success, "ok", completed_at)
    }

    /// A failed result.
    pub fn failure(
        task_id: impl Into<String>,
        from: impl Into<String>,
        output: impl Into<String>,
        completed_at: i64,
    ) -> Self {
        Self::new(task_id, from, TaskResultStatus::Failure, output, completed_at)
    }

    /// Attach an artifact.
    pub fn with_artifact(mut self, artifact: ResultArtifact) -> Self {
        self.artifacts.push(artifact);
        self
    }

    /// Record a metric.
    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }

    /// Check identity fields, the timestamp and that every metric is finite.
    pub fn validate(&self) -> SwarmResult<()> {
        require_non_empty("taskId", &self.task_id)?;
        require_non_empty("from", &self.from)?;
        if self.completed_at < 0 {
            return Err(SwarmError::validation("completedAt must be non-negative"));
        }
        if let Some((name, _)) = self.metrics.iter().find(|(_, v)| !v.is_finite()) {
            return Err(SwarmError::validation(format!("metric {name} must be finite")));
        }
        Ok(())
    }
}

/// Wire envelope, tagged by `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SwarmMessage {
    /// A request for a worker.
    TaskRequest(TaskRequest),
    /// A worker acknowledgement.
    TaskReceipt(TaskReceipt),
    /// A worker outcome.
    TaskResult(TaskResult),
}

impl SwarmMessage {
    /// Parse and validate a message from its JSON text.
    pub fn parse_json(input: &str) -> SwarmResult<Self> {
        let message: SwarmMessage = serde_json::from_str(input)?;
        match &message {
            SwarmMessage::TaskRequest(_) => {}
            SwarmMessage::TaskReceipt(receipt) => receipt.validate()?,
            SwarmMessage::TaskResult(result) => result.validate()?,
        }
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn draft() -> TaskRequestDraft {
        TaskRequestDraft::new("agent:main", "Summarize the incident")
            .with_id("task-1")
            .with_created_at(1_000)
    }

    #[test]
    fn test_build_valid_request() {
        let request = draft().with_target("agent:worker").build().unwrap();
        assert_eq!(request.id(), "task-1");
        assert_eq!(request.target(), Some("agent:worker"));
        assert_eq!(request.priority(), TaskPriority::Normal);
    }

    #[test]
    fn test_empty_task_rejected() {
        let err = TaskRequestDraft::new("agent:main", "   ").build().unwrap_err();
        assert_eq!(err.code(), "VALIDATION");
    }

    #[test]
    fn test_empty_target_rejected() {
        let err = draft().with_target("").build().unwrap_err();
        assert!(err.to_string().contains("target"));
    }

    #[test]
    fn test_deserialize_goes_through_validation() {
        let bad = json!({
            "id": "t", "from": "", "task": "x", "createdAt": 1
        });
        assert!(TaskRequest::parse(bad).is_err());

        let good = json!({
            "id": "t", "from": "a", "task": "x", "createdAt": 1, "priority": "high"
        });
        let parsed = TaskRequest::parse(good).unwrap();
        assert_eq!(parsed.priority(), TaskPriority::High);
    }

    #[test]
    fn test_required_capabilities_normalized() {
        let request = draft()
            .with_context_value(
                "requiredCapabilities",
                json!([" analysis ", "analysis", 3, "", "web-search"]),
            )
            .build()
            .unwrap();
        assert_eq!(request.required_capabilities(), vec!["analysis", "web-search"]);
    }

    #[test]
    fn test_risk_tags_lowercased() {
        let request = draft()
            .with_context_value("riskTags", json!(["Production", "production", "legal"]))
            .build()
            .unwrap();
        assert_eq!(request.risk_tags(), vec!["production", "legal"]);
    }

    #[test]
    fn test_context_flag_requires_boolean_true() {
        let request = draft()
            .with_context_value("needsNetwork", json!("true"))
            .with_context_value("requiresPrivilegedAccess", json!(true))
            .build()
            .unwrap();
        assert!(!request.context_flag("needsNetwork"));
        assert!(request.context_flag("requiresPrivilegedAccess"));
    }

    #[test]
    fn test_message_envelope_kind() {
        let request = draft().build().unwrap();
        let text = serde_json::to_string(&SwarmMessage::TaskRequest(request.clone())).unwrap();
        assert!(text.contains("\"kind\":\"task_request\""));
        assert!(text.contains("\"createdAt\":1000"));

        let parsed = SwarmMessage::parse_json(&text).unwrap();
        assert_eq!(parsed, SwarmMessage::TaskRequest(request));
    }

    #[test]
    fn test_result_with_non_finite_metric_rejected() {
        let result = TaskResult::success("task-1", "agent:worker", 5).with_metric("latency", f64::NAN);
        assert!(result.validate().is_err());
    }

    #[test]
    fn test_receipt_json_shape() {
        let receipt = TaskReceipt::accepted("task-1", "agent:worker", 10).with_eta(500);
        let value = serde_json::to_value(&receipt).unwrap();
        assert_eq!(value["taskId"], "task-1");
        assert_eq!(value["etaMs"], 500);
        assert!(value.get("reason").is_none());
    }
}
