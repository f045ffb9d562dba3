//! Traits the orchestrator is wired through, and its dispatch input.

use crate::record::TaskRecord;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use swarm_core::{SwarmResult, TaskContext, TaskPriority, TaskRequest};

/// Delivers a task request to a worker.
///
/// The orchestrator holds its task table lock while `send` runs, so every
/// other call on the same orchestrator waits for it to return. A slow
/// delivery should be handed off (to a channel, an outbox file) rather than
/// awaited inline, and `send` must never call back into the orchestrator
/// that owns it: that deadlocks. Receipts and results go through
/// `ingest_receipt` / `ingest_result` after `send` has returned.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Hand `request` to the worker `target`. An error counts as a failed
    /// attempt and feeds retry scheduling.
    async fn send(&self, target: &str, request: &TaskRequest) -> SwarmResult<()>;
}

/// What a [`RouteResolver`] decided for an untargeted request.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteOutcome {
    /// A worker id.
    Target(String),
    /// A selection made by a scoring router.
    Selection { selected_agent_id: String },
    /// The request, already addressed to a worker.
    Request(TaskRequest),
    /// No worker can take the request.
    Unroutable,
}

impl RouteOutcome {
    /// The resolved worker id, if any non-blank one was produced.
    pub fn target(&self) -> Option<&str> {
        let id = match self {
            RouteOutcome::Target(id) => Some(id.as_str()),
            RouteOutcome::Selection { selected_agent_id } => Some(selected_agent_id.as_str()),
            RouteOutcome::Request(request) => request.target(),
            RouteOutcome::Unroutable => None,
        };
        id.map(str::trim).filter(|id| !id.is_empty())
    }
}

/// Picks a worker for a request that has no explicit target.
#[async_trait]
pub trait RouteResolver: Send + Sync {
    /// Decide where `draft` goes. Errors abort the dispatch.
    async fn resolve(&self, draft: &TaskRequest) -> SwarmResult<RouteOutcome>;
}

/// Input to `dispatch_task`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchOptions {
    /// Task id; a UUID is generated when absent.
    #[serde(default)]
    pub id: Option<String>,
    /// Worker id; the router decides when absent.
    #[serde(default)]
    pub target: Option<String>,
    /// What the worker should do.
    pub task: String,
    /// Urgency; `normal` when absent.
    #[serde(default)]
    pub priority: TaskPriority,
    /// Optional working context handed to the worker.
    #[serde(default)]
    pub context: TaskContext,
    /// Free-form constraints the worker must respect.
    #[serde(default)]
    pub constraints: Vec<String>,
    /// Request creation time; the orchestrator clock when absent.
    #[serde(default)]
    pub created_at: Option<i64>,
    /// Overrides the orchestrator's default deadline for this task.
    #[serde(default)]
    pub timeout_ms: Option<i64>,
    /// Overrides the orchestrator's default retry budget for this task.
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl DispatchOptions {
    /// Options for `task` with every other field defaulted.
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            ..Self::default()
        }
    }

    /// Use a caller-chosen task id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Skip routing and send to `target`.
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Set the request priority.
    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Replace the whole request context.
    pub fn with_context(mut self, context: TaskContext) -> Self {
        self.context = context;
        self
    }

    /// Set one context key.
    pub fn with_context_value(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    /// Set the free-form constraints passed to the worker.
    pub fn with_constraints(mut self, constraints: Vec<String>) -> Self {
        self.constraints = constraints;
        self
    }

    /// Pin the request creation time.
    pub fn with_created_at(mut self, created_at: i64) -> Self {
        self.created_at = Some(created_at);
        self
    }

    /// Per-task deadline override; non-positive values fall back to the default.
    pub fn with_timeout_ms(mut self, timeout_ms: i64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Per-task retry budget override.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// Anything that can turn [`DispatchOptions`] into a tracked task.
///
/// The workflow engine drives dispatch through this seam.
#[async_trait]
pub trait TaskDispatcher: Send + Sync {
    /// Create and send a task, returning its record.
    async fn dispatch(&self, options: DispatchOptions) -> SwarmResult<TaskRecord>;
}
