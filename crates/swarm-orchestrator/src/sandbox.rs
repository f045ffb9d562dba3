//! Sandbox profile selection, escalation gating and replayable execution.
//!
//! Every execution is planned fresh from the request. A plan that needs
//! privileged access runs only with an approved escalation raised against the
//! same plan fingerprint. Each run leaves a hash-chained event log that
//! [`verify_replay_events`] can check without trusting the stored hashes.

use crate::config::SandboxConfig;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use swarm_core::canonical::{hash_value, sha256_hex};
use swarm_core::{
    ApprovalDecision, Clock, ResultArtifact, SwarmError, SwarmResult, SystemClock, TaskPriority,
    TaskRequest, TaskResultStatus,
};
use tracing::{debug, info, warn};

/// Read-only profile used for high-risk work.
pub const STRICT_PROFILE_ID: &str = "strict-readonly";
/// Default profile for ordinary tooling.
pub const BALANCED_PROFILE_ID: &str = "balanced-tooling";
/// Profile for privileged capabilities; always needs escalation.
pub const PRIVILEGED_PROFILE_ID: &str = "privileged-controlled";

/// Capabilities that always route to the privileged profile and need escalation.
pub const PRIVILEGED_CAPABILITIES: [&str; 4] = [
    "destructive_shell",
    "credential_access",
    "filesystem_write",
    "production_deploy",
];

/// Risk tags that route to the strict profile.
pub const HIGH_RISK_TAGS: [&str; 4] = ["security", "legal", "financial", "production"];

/// How tightly a profile confines its task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxIsolation {
    /// No network, no writes, no shell.
    Strict,
    /// Limited tooling.
    #[default]
    Balanced,
    /// Few restrictions.
    Permissive,
}

fn default_max_runtime_ms() -> i64 {
    30_000
}

/// A named set of execution permissions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxProfile {
    /// Profile id.
    pub id: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// Confinement level.
    #[serde(default)]
    pub isolation: SandboxIsolation,
    /// Network access allowed.
    #[serde(default)]
    pub allow_network: bool,
    /// Filesystem writes allowed.
    #[serde(default)]
    pub allow_filesystem_write: bool,
    /// Shell access allowed.
    #[serde(default)]
    pub allow_shell: bool,
    /// Capabilities the profile is meant for.
    #[serde(default)]
    pub allowed_capabilities: Vec<String>,
    /// Requests carrying any of these risk tags cannot be planned here.
    #[serde(default)]
    pub blocked_risk_tags: Vec<String>,
    /// Plans on this profile need an approved escalation.
    #[serde(default)]
    pub requires_escalation: bool,
    /// Runtime ceiling for executions on this profile.
    #[serde(default = "default_max_runtime_ms")]
    pub max_runtime_ms: i64,
}

impl SandboxProfile {
    /// A balanced profile with no permissions.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            isolation: SandboxIsolation::Balanced,
            allow_network: false,
            allow_filesystem_write: false,
            allow_shell: false,
            allowed_capabilities: Vec::new(),
            blocked_risk_tags: Vec::new(),
            requires_escalation: false,
            max_runtime_ms: default_max_runtime_ms(),
        }
    }

    /// Check the profile and normalize its lists (trimmed, non-empty, unique).
    pub fn validate(mut self) -> SwarmResult<Self> {
        self.id = self.id.trim().to_string();
        if self.id.is_empty() {
            return Err(SwarmError::validation("sandbox profile id must be a non-empty string"));
        }
        if self.max_runtime_ms <= 0 {
            return Err(SwarmError::validation(format!(
                "sandbox profile {} maxRuntimeMs must be positive",
                self.id
            )));
        }
        self.allowed_capabilities = normalize_list(self.allowed_capabilities);
        self.blocked_risk_tags = normalize_list(self.blocked_risk_tags);
        Ok(self)
    }

    /// SHA-256 of the canonical JSON of the profile.
    pub fn fingerprint(&self) -> SwarmResult<String> {
        swarm_core::canonical::fingerprint(self)
    }
}

fn normalize_list(items: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(items.len());
    for item in items {
        let trimmed = item.trim();
        if !trimmed.is_empty() && !out.iter().any(|existing| existing == trimmed) {
            out.push(trimmed.to_string());
        }
    }
    out
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

/// The three built-in profiles.
pub fn default_profiles() -> Vec<SandboxProfile> {
    vec![
        SandboxProfile {
            id: STRICT_PROFILE_ID.into(),
            description: "Read-only profile for uncertain/high-risk tasks".into(),
            isolation: SandboxIsolation::Strict,
            allow_network: false,
            allow_filesystem_write: false,
            allow_shell: false,
            allowed_capabilities: strings(&["analysis", "read", "reasoning"]),
            blocked_risk_tags: strings(&["security", "production"]),
            requires_escalation: false,
            max_runtime_ms: 10_000,
        },
        SandboxProfile {
            id: BALANCED_PROFILE_ID.into(),
            description: "Balanced profile for standard tool usage".into(),
            isolation: SandboxIsolation::Balanced,
            allow_network: true,
            allow_filesystem_write: false,
            allow_shell: false,
            allowed_capabilities: strings(&["analysis", "web-search", "reporting", "read"]),
            blocked_risk_tags: Vec::new(),
            requires_escalation: false,
            max_runtime_ms: 30_000,
        },
        SandboxProfile {
            id: PRIVILEGED_PROFILE_ID.into(),
            description: "Privileged profile gated by human escalation".into(),
            isolation: SandboxIsolation::Permissive,
            allow_network: true,
            allow_filesystem_write: true,
            allow_shell: true,
            allowed_capabilities: strings(&[
                "operations",
                "deploy",
                "filesystem_write",
                "destructive_shell",
                "credential_access",
            ]),
            blocked_risk_tags: Vec::new(),
            requires_escalation: true,
            max_runtime_ms: 120_000,
        },
    ]
}

/// Why a profile was picked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionReason {
    /// The caller named the profile.
    ExplicitProfile,
    /// A privileged capability was required.
    PrivilegedCapability,
    /// A high-risk tag forced the strict profile.
    HighRiskGuardrail,
    /// The task needs network access.
    NetworkTooling,
    /// Nothing matched; the default profile was used.
    DefaultProfile,
}

impl SelectionReason {
    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionReason::ExplicitProfile => "explicit_profile",
            SelectionReason::PrivilegedCapability => "privileged_capability",
            SelectionReason::HighRiskGuardrail => "high_risk_guardrail",
            SelectionReason::NetworkTooling => "network_tooling",
            SelectionReason::DefaultProfile => "default_profile",
        }
    }
}

/// A chosen profile and why it was chosen.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileSelection {
    /// The chosen profile.
    pub profile: SandboxProfile,
    /// Why it was chosen.
    pub reason: SelectionReason,
}

/// Capabilities and risk tags read from a request's context.
struct RiskAssessment {
    required_capabilities: Vec<String>,
    risk_tags: Vec<String>,
    privileged: bool,
    high_risk: bool,
}

impl RiskAssessment {
    fn of(request: &TaskRequest) -> Self {
        let required_capabilities = request.required_capabilities();
        let risk_tags = request.risk_tags();
        let privileged = request.context_flag("requiresPrivilegedAccess")
            || required_capabilities
                .iter()
                .any(|c| PRIVILEGED_CAPABILITIES.contains(&c.as_str()));
        let high_risk = risk_tags.iter().any(|t| HIGH_RISK_TAGS.contains(&t.as_str()));
        Self {
            required_capabilities,
            risk_tags,
            privileged,
            high_risk,
        }
    }
}

/// The fingerprinted decision of how to run one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionPlan {
    /// Task the plan is for.
    pub task_id: String,
    /// Worker the task is addressed to.
    pub target: Option<String>,
    /// Task priority.
    pub priority: TaskPriority,
    /// Why the profile was picked.
    pub selected_reason: SelectionReason,
    /// Chosen profile id.
    pub profile_id: String,
    /// Fingerprint of the profile at planning time.
    pub profile_fingerprint: String,
    /// Capabilities the task needs.
    pub required_capabilities: Vec<String>,
    /// Risk tags the task carries.
    pub risk_tags: Vec<String>,
    /// Whether an approved escalation must precede execution.
    pub escalation_required: bool,
    /// Runtime ceiling, from the profile.
    pub max_runtime_ms: i64,
    /// Fingerprint over [`ExecutionPlan::fingerprint_payload`].
    pub plan_fingerprint: String,
    /// Copy of the chosen profile.
    pub profile: SandboxProfile,
}

impl ExecutionPlan {
    /// The fields covered by `plan_fingerprint`.
    pub fn fingerprint_payload(&self) -> Value {
        json!({
            "taskId": self.task_id,
            "target": self.target,
            "priority": self.priority.as_str(),
            "selectedReason": self.selected_reason.as_str(),
            "profileId": self.profile_id,
            "profileFingerprint": self.profile_fingerprint,
            "requiredCapabilities": self.required_capabilities,
            "riskTags": self.risk_tags,
            "escalationRequired": self.escalation_required,
            "maxRuntimeMs": self.max_runtime_ms,
        })
    }

    /// Recompute the fingerprint from the plan fields.
    pub fn compute_fingerprint(&self) -> String {
        hash_value(&self.fingerprint_payload())
    }
}

/// Review state of an escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EscalationStatus {
    /// Awaiting review.
    Pending,
    /// Execution may proceed.
    Approved,
    /// Execution is refused.
    Denied,
}

impl EscalationStatus {
    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            EscalationStatus::Pending => "pending",
            EscalationStatus::Approved => "approved",
            EscalationStatus::Denied => "denied",
        }
    }
}

/// A request for privileged execution of one exact plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscalationRecord {
    /// Derived from the plan fingerprint; see [`escalation_token`].
    pub token: String,
    /// Review state.
    pub status: EscalationStatus,
    /// Why escalation is needed.
    pub reason: String,
    /// When it was requested.
    pub requested_at: i64,
    /// When it was reviewed.
    pub reviewed_at: Option<i64>,
    /// Who reviewed it.
    pub reviewer: Option<String>,
    /// Reviewer's note.
    pub review_reason: Option<String>,
    /// The exact plan the escalation covers.
    pub plan: ExecutionPlan,
}

/// Result of [`SandboxOrchestrator::request_escalation`].
#[derive(Debug, Clone, PartialEq)]
pub enum EscalationRequest {
    /// The plan runs without escalation.
    NotRequired(ExecutionPlan),
    /// An escalation was filed and awaits review.
    Requested(EscalationRecord),
}

impl EscalationRequest {
    /// True when an escalation was filed.
    pub fn is_requested(&self) -> bool {
        matches!(self, EscalationRequest::Requested(_))
    }

    /// The filed escalation, if any.
    pub fn record(&self) -> Option<&EscalationRecord> {
        match self {
            EscalationRequest::Requested(record) => Some(record),
            EscalationRequest::NotRequired(_) => None,
        }
    }

    /// The plan, whether or not escalation was needed.
    pub fn plan(&self) -> &ExecutionPlan {
        match self {
            EscalationRequest::NotRequired(plan) => plan,
            EscalationRequest::Requested(record) => &record.plan,
        }
    }
}

/// Token under which an escalation for `plan_fingerprint` is stored.
pub fn escalation_token(plan_fingerprint: &str) -> String {
    sha256_hex(format!("escalation|{plan_fingerprint}").as_bytes())
}

/// What an executor reports back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionOutcome {
    /// How the run ended.
    pub status: TaskResultStatus,
    /// Executor output.
    pub output: String,
    /// Files or blobs produced.
    #[serde(default)]
    pub artifacts: Vec<ResultArtifact>,
    /// Numeric measurements.
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
}

impl ExecutionOutcome {
    /// A successful outcome with `output`.
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            status: TaskResultStatus::Success,
            output: output.into(),
            artifacts: Vec::new(),
            metrics: BTreeMap::new(),
        }
    }

    /// A failed outcome with `output`.
    pub fn failure(output: impl Into<String>) -> Self {
        Self {
            status: TaskResultStatus::Failure,
            output: output.into(),
            artifacts: Vec::new(),
            metrics: BTreeMap::new(),
        }
    }

    /// Record a metric.
    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }
}

/// Everything an executor gets to see.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// The request being executed.
    pub task_request: TaskRequest,
    /// The approved plan.
    pub plan: ExecutionPlan,
    /// Caller-supplied metadata.
    pub metadata: Map<String, Value>,
}

/// Runs a planned task inside its sandbox.
#[async_trait]
pub trait SandboxExecutor: Send + Sync {
    /// Execute `context` and report the outcome.
    async fn run(&self, context: ExecutionContext) -> SwarmResult<ExecutionOutcome>;
}

/// Executor that does nothing and succeeds.
pub struct NoopExecutor;

#[async_trait]
impl SandboxExecutor for NoopExecutor {
    async fn run(&self, _context: ExecutionContext) -> SwarmResult<ExecutionOutcome> {
        Ok(ExecutionOutcome::success("noop"))
    }
}

/// One link of an execution's hash chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayEvent {
    /// 1-based position in the chain.
    pub seq: u64,
    /// Event time in epoch milliseconds.
    pub at: i64,
    /// Event type, e.g. `execution_started`.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Event payload.
    pub data: Value,
    /// `None` for the first event.
    pub previous_hash: Option<String>,
    /// Hash of this event.
    pub event_hash: String,
}

impl ReplayEvent {
    fn new(seq: u64, at: i64, event_type: &str, data: Value, previous_hash: Option<String>) -> Self {
        let mut event = Self {
            seq,
            at,
            event_type: event_type.to_string(),
            data,
            previous_hash,
            event_hash: String::new(),
        };
        event.event_hash = event.expected_hash();
        event
    }

    /// Hash over `{seq, at, type, data, previousHash}`, ignoring the stored hash.
    pub fn expected_hash(&self) -> String {
        hash_value(&json!({
            "seq": self.seq,
            "at": self.at,
            "type": self.event_type,
            "data": self.data,
            "previousHash": self.previous_hash,
        }))
    }
}

/// Outcome of [`verify_replay_events`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayVerification {
    /// True when the chain is intact.
    pub ok: bool,
    /// Events checked, on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
    /// Hash of the last event, on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_hash: Option<String>,
    /// Why verification failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Index of the first event that failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
}

impl ReplayVerification {
    fn valid(count: usize, final_hash: Option<String>) -> Self {
        Self {
            ok: true,
            count: Some(count),
            final_hash,
            reason: None,
            index: None,
        }
    }

    fn broken(reason: &str, index: usize) -> Self {
        Self {
            ok: false,
            count: None,
            final_hash: None,
            reason: Some(reason.to_string()),
            index: Some(index),
        }
    }
}

/// Recompute every link of an event chain and report the first divergence.
pub fn verify_replay_events(events: &[ReplayEvent]) -> ReplayVerification {
    let mut previous: Option<&str> = None;
    for (index, event) in events.iter().enumerate() {
        if event.previous_hash.as_deref() != previous {
            return ReplayVerification::broken("previous_hash_mismatch", index);
        }
        if event.expected_hash() != event.event_hash {
            return ReplayVerification::broken("event_hash_mismatch", index);
        }
        previous = Some(event.event_hash.as_str());
    }
    ReplayVerification::valid(events.len(), previous.map(str::to_string))
}

/// Per-call options of [`SandboxOrchestrator::execute_task`].
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Force this profile instead of selecting one.
    pub profile_id: Option<String>,
    /// Token of an approved escalation.
    pub escalation_token: Option<String>,
    /// Passed through to the executor.
    pub metadata: Map<String, Value>,
}

impl ExecuteOptions {
    /// Empty options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Force a profile.
    pub fn with_profile(mut self, profile_id: impl Into<String>) -> Self {
        self.profile_id = Some(profile_id.into());
        self
    }

    /// Supply an escalation token.
    pub fn with_escalation_token(mut self, token: impl Into<String>) -> Self {
        self.escalation_token = Some(token.into());
        self
    }

    /// Add a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Returned by [`SandboxOrchestrator::execute_task`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionReport {
    /// Token under which the execution is stored.
    pub replay_token: String,
    /// How the run ended.
    pub status: TaskResultStatus,
    /// Profile it ran under.
    pub profile_id: String,
    /// True when the call carried an escalation token.
    pub escalation_used: bool,
    /// Executor outcome.
    pub outcome: ExecutionOutcome,
    /// The replay chain.
    pub events: Vec<ReplayEvent>,
}

/// Stored trace of one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    /// Token under which the execution is stored.
    pub replay_token: String,
    /// Task that ran.
    pub task_id: String,
    /// Profile it ran under.
    pub profile_id: String,
    /// The plan that was executed.
    pub plan: ExecutionPlan,
    /// How the run ended.
    pub status: TaskResultStatus,
    /// Start time in epoch milliseconds.
    pub started_at: i64,
    /// End time in epoch milliseconds.
    pub completed_at: i64,
    /// The replay chain.
    pub events: Vec<ReplayEvent>,
    /// Hash of the last event.
    pub final_event_hash: Option<String>,
    /// Executor outcome.
    pub outcome: ExecutionOutcome,
}

/// Self-contained evidence for one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayPacket {
    /// Token of the execution.
    pub replay_token: String,
    /// Task that ran.
    pub task_id: String,
    /// Profile it ran under.
    pub profile_id: String,
    /// Fingerprint of the executed plan.
    pub plan_fingerprint: String,
    /// The replay chain.
    pub events: Vec<ReplayEvent>,
    /// Executor outcome.
    pub outcome: ExecutionOutcome,
    /// Chain check at packet build time.
    pub verification: ReplayVerification,
}

/// Picks profiles, gates privileged plans and records executions.
pub struct SandboxOrchestrator {
    profiles: RwLock<BTreeMap<String, SandboxProfile>>,
    default_profile_id: String,
    escalations: Mutex<HashMap<String, EscalationRecord>>,
    executions: Mutex<HashMap<String, ExecutionRecord>>,
    executor: Arc<dyn SandboxExecutor>,
    clock: Arc<dyn Clock>,
}

impl Default for SandboxOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl SandboxOrchestrator {
    /// An orchestrator with the built-in profiles and a no-op executor.
    pub fn new() -> Self {
        let profiles = default_profiles()
            .into_iter()
            .map(|p| (p.id.clone(), p))
            .collect();
        Self {
            profiles: RwLock::new(profiles),
            default_profile_id: BALANCED_PROFILE_ID.into(),
            escalations: Mutex::new(HashMap::new()),
            executions: Mutex::new(HashMap::new()),
            executor: Arc::new(NoopExecutor),
            clock: Arc::new(SystemClock),
        }
    }

    /// Built-in profiles plus those in `config`, with its default profile.
    pub fn from_config(config: &SandboxConfig) -> SwarmResult<Self> {
        let orchestrator = Self::new();
        for profile in &config.profiles {
            orchestrator.register_profile(profile.clone())?;
        }
        Ok(orchestrator.with_default_profile(&config.default_profile_id))
    }

    /// Fall back to `balanced-tooling` when `profile_id` is not registered.
    pub fn with_default_profile(mut self, profile_id: &str) -> Self {
        if self.profiles.read().contains_key(profile_id) {
            self.default_profile_id = profile_id.to_string();
        } else {
            warn!(profile_id, "Unknown default sandbox profile, using {BALANCED_PROFILE_ID}");
            self.default_profile_id = BALANCED_PROFILE_ID.into();
        }
        self
    }

    /// Run plans through `executor`.
    pub fn with_executor(mut self, executor: Arc<dyn SandboxExecutor>) -> Self {
        self.executor = executor;
        self
    }

    /// Use `clock` for every timestamp.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Id of the fallback profile.
    pub fn default_profile_id(&self) -> &str {
        &self.default_profile_id
    }

    /// Validate and add `profile`, replacing any profile with the same id.
    pub fn register_profile(&self, profile: SandboxProfile) -> SwarmResult<SandboxProfile> {
        let profile = profile.validate()?;
        self.profiles.write().insert(profile.id.clone(), profile.clone());
        Ok(profile)
    }

    /// A registered profile.
    pub fn get_profile(&self, profile_id: &str) -> Option<SandboxProfile> {
        self.profiles.read().get(profile_id).cloned()
    }

    /// Registered profiles ordered by id.
    pub fn list_profiles(&self) -> Vec<SandboxProfile> {
        self.profiles.read().values().cloned().collect()
    }

    /// Pick a profile for `request`.
    ///
    /// An explicit `profile_id` must be registered. Otherwise the first
    /// matching rule wins: privileged capability or flag, then high-risk tag or
    /// critical priority, then network need, then the default profile.
    pub fn select_profile(&self, request: &TaskRequest, profile_id: Option<&str>) -> SwarmResult<ProfileSelection> {
        let profiles = self.profiles.read();
        if let Some(id) = profile_id {
            let profile = profiles
                .get(id)
                .ok_or_else(|| SwarmError::UnknownProfile(id.to_string()))?;
            return Ok(ProfileSelection {
                profile: profile.clone(),
                reason: SelectionReason::ExplicitProfile,
            });
        }

        let risk = RiskAssessment::of(request);
        let wants_network = request.context_flag("needsNetwork")
            || risk.required_capabilities.iter().any(|c| c == "web-search");

        let (preferred, reason) = if risk.privileged {
            (Some(PRIVILEGED_PROFILE_ID), SelectionReason::PrivilegedCapability)
        } else if risk.high_risk || request.priority() == TaskPriority::Critical {
            (Some(STRICT_PROFILE_ID), SelectionReason::HighRiskGuardrail)
        } else if wants_network {
            (Some(BALANCED_PROFILE_ID), SelectionReason::NetworkTooling)
        } else {
            (None, SelectionReason::DefaultProfile)
        };

        let profile = preferred
            .and_then(|id| profiles.get(id))
            .or_else(|| profiles.get(&self.default_profile_id))
            .ok_or(SwarmError::MissingProfile)?;

        debug!(task_id = %request.id(), profile_id = %profile.id, reason = reason.as_str(), "Sandbox profile selected");
        Ok(ProfileSelection {
            profile: profile.clone(),
            reason,
        })
    }

    /// Build the fingerprinted plan for `request`.
    pub fn plan_execution(&self, request: &TaskRequest, profile_id: Option<&str>) -> SwarmResult<ExecutionPlan> {
        let ProfileSelection { profile, reason } = self.select_profile(request, profile_id)?;
        let risk = RiskAssessment::of(request);

        if let Some(tag) = risk.risk_tags.iter().find(|t| profile.blocked_risk_tags.contains(t)) {
            return Err(SwarmError::ProfileBlockedRiskTag {
                profile_id: profile.id.clone(),
                risk_tag: tag.clone(),
            });
        }

        let mut plan = ExecutionPlan {
            task_id: request.id().to_string(),
            target: request.target().map(str::to_string),
            priority: request.priority(),
            selected_reason: reason,
            profile_id: profile.id.clone(),
            profile_fingerprint: profile.fingerprint()?,
            required_capabilities: risk.required_capabilities,
            risk_tags: risk.risk_tags,
            escalation_required: profile.requires_escalation || risk.privileged,
            max_runtime_ms: profile.max_runtime_ms,
            plan_fingerprint: String::new(),
            profile,
        };
        plan.plan_fingerprint = plan.compute_fingerprint();
        Ok(plan)
    }

    /// Open a pending escalation for the plan of `request`, if it needs one.
    ///
    /// Requesting again for an identical plan resets the record to pending.
    pub fn request_escalation(
        &self,
        request: &TaskRequest,
        profile_id: Option<&str>,
        reason: Option<&str>,
    ) -> SwarmResult<EscalationRequest> {
        let plan = self.plan_execution(request, profile_id)?;
        if !plan.escalation_required {
            return Ok(EscalationRequest::NotRequired(plan));
        }

        let record = EscalationRecord {
            token: escalation_token(&plan.plan_fingerprint),
            status: EscalationStatus::Pending,
            reason: reason.unwrap_or("privileged_access").to_string(),
            requested_at: self.clock.now_ms(),
            reviewed_at: None,
            reviewer: None,
            review_reason: None,
            plan,
        };
        info!(task_id = %record.plan.task_id, token = %record.token, "Sandbox escalation requested");
        self.escalations.lock().insert(record.token.clone(), record.clone());
        Ok(EscalationRequest::Requested(record))
    }

    /// Approve or deny a pending escalation. Unknown tokens are an error.
    pub fn review_escalation(&self, token: &str, decision: ApprovalDecision) -> SwarmResult<EscalationRecord> {
        let mut escalations = self.escalations.lock();
        let record = escalations
            .get_mut(token)
            .ok_or_else(|| SwarmError::UnknownEscalation(token.to_string()))?;

        record.status = if decision.approved {
            EscalationStatus::Approved
        } else {
            EscalationStatus::Denied
        };
        record.reviewed_at = Some(decision.reviewed_at.unwrap_or_else(|| self.clock.now_ms()));
        record.reviewer = decision.reviewer;
        record.review_reason = decision.reason;

        info!(token, status = record.status.as_str(), "Sandbox escalation reviewed");
        Ok(record.clone())
    }

    /// Snapshot of one escalation.
    pub fn get_escalation(&self, token: &str) -> Option<EscalationRecord> {
        self.escalations.lock().get(token).cloned()
    }

    /// Escalations, optionally filtered by status, newest first.
    pub fn list_escalations(&self, status: Option<EscalationStatus>) -> Vec<EscalationRecord> {
        let mut records: Vec<EscalationRecord> = self
            .escalations
            .lock()
            .values()
            .filter(|r| status.map_or(true, |s| r.status == s))
            .cloned()
            .collect();
        records.sort_by(|a, b| b.requested_at.cmp(&a.requested_at).then_with(|| a.token.cmp(&b.token)));
        records
    }

    fn check_escalation(&self, plan: &ExecutionPlan, token: Option<&str>) -> SwarmResult<()> {
        if !plan.escalation_required {
            return Ok(());
        }
        let escalations = self.escalations.lock();
        let Some(record) = token.and_then(|t| escalations.get(t)) else {
            return Err(SwarmError::EscalationRequired {
                task_id: plan.task_id.clone(),
            });
        };
        if record.status != EscalationStatus::Approved {
            return Err(SwarmError::EscalationNotApproved {
                token: record.token.clone(),
                status: record.status.as_str().to_string(),
            });
        }
        if record.plan.plan_fingerprint != plan.plan_fingerprint {
            return Err(SwarmError::EscalationPlanMismatch {
                expected: record.plan.plan_fingerprint.clone(),
                actual: plan.plan_fingerprint.clone(),
            });
        }
        Ok(())
    }

    /// Plan, gate and run `request`, recording a replayable event chain.
    ///
    /// Planning and escalation errors are returned before the executor runs.
    /// Executor errors and runs longer than the profile's `maxRuntimeMs`
    /// produce a `failure` outcome instead of an error.
    pub async fn execute_task(&self, request: &TaskRequest, options: ExecuteOptions) -> SwarmResult<ExecutionReport> {
        let plan = self.plan_execution(request, options.profile_id.as_deref())?;
        self.check_escalation(&plan, options.escalation_token.as_deref())?;

        let started_at = self.clock.now_ms();
        let mut events: Vec<ReplayEvent> = Vec::with_capacity(3);
        push_event(
            &mut events,
            started_at,
            "plan_created",
            json!({
                "taskId": plan.task_id,
                "profileId": plan.profile_id,
                "planFingerprint": plan.plan_fingerprint,
                "escalationRequired": plan.escalation_required,
            }),
        );
        push_event(
            &mut events,
            started_at,
            "execution_started",
            json!({ "metadata": options.metadata }),
        );

        let context = ExecutionContext {
            task_request: request.clone(),
            plan: plan.clone(),
            metadata: options.metadata.clone(),
        };
        let limit = Duration::from_millis(u64::try_from(plan.max_runtime_ms).unwrap_or(1));
        let outcome = match tokio::time::timeout(limit, self.executor.run(context)).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                warn!(task_id = %plan.task_id, error = %e, "Sandbox executor failed");
                ExecutionOutcome::failure(e.to_string())
            }
            Err(_) => {
                warn!(task_id = %plan.task_id, max_runtime_ms = plan.max_runtime_ms, "Sandbox execution timed out");
                ExecutionOutcome::failure(format!("execution exceeded maxRuntimeMs ({} ms)", plan.max_runtime_ms))
            }
        };
        let status = outcome.status;

        let completed_at = self.clock.now_ms();
        push_event(
            &mut events,
            completed_at,
            "execution_completed",
            json!({ "status": status, "outcome": outcome }),
        );

        let final_event_hash = events.last().map(|e| e.event_hash.clone());
        let replay_token = sha256_hex(
            format!(
                "replay|{}|{}",
                plan.plan_fingerprint,
                final_event_hash.as_deref().unwrap_or_default()
            )
            .as_bytes(),
        );

        let record = ExecutionRecord {
            replay_token: replay_token.clone(),
            task_id: plan.task_id.clone(),
            profile_id: plan.profile_id.clone(),
            plan,
            status,
            started_at,
            completed_at,
            events: events.clone(),
            final_event_hash,
            outcome: outcome.clone(),
        };
        info!(
            task_id = %record.task_id,
            profile_id = %record.profile_id,
            status = status.as_str(),
            replay_token = %replay_token,
            "Sandbox execution recorded"
        );
        let profile_id = record.profile_id.clone();
        self.executions.lock().insert(replay_token.clone(), record);

        Ok(ExecutionReport {
            replay_token,
            status,
            profile_id,
            escalation_used: options.escalation_token.is_some(),
            outcome,
            events,
        })
    }

    /// Stored trace of one execution.
    pub fn get_execution(&self, replay_token: &str) -> Option<ExecutionRecord> {
        self.executions.lock().get(replay_token).cloned()
    }

    /// The events and outcome of an execution with a fresh verification.
    pub fn get_replay_packet(&self, replay_token: &str) -> Option<ReplayPacket> {
        let record = self.get_execution(replay_token)?;
        let verification = verify_replay_events(&record.events);
        Some(ReplayPacket {
            replay_token: record.replay_token,
            task_id: record.task_id,
            profile_id: record.profile_id,
            plan_fingerprint: record.plan.plan_fingerprint,
            events: record.events,
            outcome: record.outcome,
            verification,
        })
    }
}

fn push_event(events: &mut Vec<ReplayEvent>, at: i64, event_type: &str, data: Value) {
    let previous = events.last().map(|e| e.event_hash.clone());
    let seq = events.len() as u64 + 1;
    events.push(ReplayEvent::new(seq, at, event_type, data, previous));
}
