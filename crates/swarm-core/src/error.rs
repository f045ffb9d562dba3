use thiserror::Error;

/// A convenience `Result` alias using [`SwarmError`].
pub type SwarmResult<T> = Result<T, SwarmError>;

/// Top-level error type for the swarm dispatch core.
///
/// Every variant maps to a stable upper-snake code (see [`SwarmError::code`])
/// so that callers and audit consumers can match on failures without parsing
/// messages.
#[derive(Debug, Error)]
pub enum SwarmError {
    /// A message or definition failed structural validation at a boundary.
    #[error("Validation error: {0}")]
    Validation(String),

    /// No explicit target and the router could not resolve one.
    #[error("Task target is required (or provide a router that resolves one)")]
    MissingTarget,

    /// The dispatch policy refused the request.
    #[error("Dispatch policy denied task {task_id}: {}", reasons.join(", "))]
    PolicyDenied {
        /// Id of the refused request.
        task_id: String,
        /// Rendered policy reasons.
        reasons: Vec<String>,
    },

    /// The injected transport failed to deliver a request.
    #[error("Failed to send task {task_id} to {target} (attempt {attempt}): {message}")]
    SendFailed {
        /// Task being sent.
        task_id: String,
        /// Worker it was addressed to.
        target: String,
        /// 1-based attempt number.
        attempt: u32,
        /// Transport error text.
        message: String,
    },

    /// `review_task` was called on a record that is not awaiting approval.
    #[error("Task {0} is not waiting for approval")]
    NotAwaitingApproval(String),

    /// Two workflow nodes share the same id.
    #[error("Duplicate workflow node id: {0}")]
    DuplicateNode(String),

    /// A workflow node depends on a node that does not exist.
    #[error("Node {node} depends on unknown node {dependency}")]
    UnknownDependency {
        /// Node declaring the dependency.
        node: String,
        /// Missing node id.
        dependency: String,
    },

    /// The workflow dependency graph contains a cycle.
    #[error("Workflow cycle detected at node {0}")]
    WorkflowCycle(String),

    /// A workflow with the same id is already registered.
    #[error("Workflow already exists: {0}")]
    WorkflowExists(String),

    /// No profile is registered under the requested id.
    #[error("Unknown sandbox profile: {0}")]
    UnknownProfile(String),

    /// Neither an explicit nor a default profile could be resolved.
    #[error("No sandbox profile available")]
    MissingProfile,

    /// The selected profile refuses one of the request's risk tags.
    #[error("Profile {profile_id} blocks risk tag {risk_tag}")]
    ProfileBlockedRiskTag {
        /// Selected profile.
        profile_id: String,
        /// First blocked tag found.
        risk_tag: String,
    },

    /// The plan needs an escalation token and none was supplied.
    #[error("Task {task_id} requires approved escalation")]
    EscalationRequired {
        /// Task being executed.
        task_id: String,
    },

    /// The supplied escalation is pending or was denied.
    #[error("Escalation {token} is not approved (status: {status})")]
    EscalationNotApproved {
        /// Escalation token.
        token: String,
        /// Current review status.
        status: String,
    },

    /// The approved escalation was raised against a different plan.
    #[error("Escalation does not match current execution plan (expected {expected}, got {actual})")]
    EscalationPlanMismatch {
        /// Fingerprint the escalation was approved for.
        expected: String,
        /// Fingerprint of the plan being executed.
        actual: String,
    },

    /// No escalation exists for the token.
    #[error("Unknown escalation token: {0}")]
    UnknownEscalation(String),

    /// An error raised by a transport implementation.
    #[error("Transport error: {0}")]
    Transport(String),

    /// An error raised by a persistence store implementation.
    #[error("Store error: {0}")]
    Store(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SwarmError {
    /// Stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            SwarmError::Validation(_) => "VALIDATION",
            SwarmError::MissingTarget => "MISSING_TARGET",
            SwarmError::PolicyDenied { .. } => "POLICY_DENIED",
            SwarmError::SendFailed { .. } => "SEND_FAILED",
            SwarmError::NotAwaitingApproval(_) => "NOT_AWAITING_APPROVAL",
            SwarmError::DuplicateNode(_) => "DUPLICATE_NODE",
            SwarmError::UnknownDependency { .. } => "UNKNOWN_DEPENDENCY",
            SwarmError::WorkflowCycle(_) => "WORKFLOW_CYCLE",
            SwarmError::WorkflowExists(_) => "WORKFLOW_EXISTS",
            SwarmError::UnknownProfile(_) => "UNKNOWN_PROFILE",
            SwarmError::MissingProfile => "MISSING_PROFILE",
            SwarmError::ProfileBlockedRiskTag { .. } => "PROFILE_BLOCKED_RISK_TAG",
            SwarmError::EscalationRequired { .. } => "ESCALATION_REQUIRED",
            SwarmError::EscalationNotApproved { .. } => "ESCALATION_NOT_APPROVED",
            SwarmError::EscalationPlanMismatch { .. } => "ESCALATION_PLAN_MISMATCH",
            SwarmError::UnknownEscalation(_) => "UNKNOWN_ESCALATION",
            SwarmError::Transport(_) => "TRANSPORT",
            SwarmError::Store(_) => "STORE",
            SwarmError::Config(_) => "CONFIG",
            SwarmError::Json(_) => "JSON",
            SwarmError::Io(_) => "IO",
        }
    }

    /// Shorthand for a [`SwarmError::Validation`] error.
    pub fn validation(message: impl Into<String>) -> Self {
        SwarmError::Validation(message.into())
    }
}
