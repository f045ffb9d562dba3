use serde::{Deserialize, Serialize};
use swarm_core::{ApprovalRequirement, TaskPriority, TaskRequest};

/// Decides whether a request must wait for a human reviewer.
pub trait ApprovalPolicy: Send + Sync {
    /// Evaluate `request`.
    fn evaluate(&self, request: &TaskRequest) -> ApprovalRequirement;
}

impl<F> ApprovalPolicy for F
where
    F: Fn(&TaskRequest) -> ApprovalRequirement + Send + Sync,
{
    fn evaluate(&self, request: &TaskRequest) -> ApprovalRequirement {
        self(request)
    }
}

fn default_true() -> bool {
    true
}

fn default_high_risk_tags() -> Vec<String> {
    ["external_write", "legal", "finance", "security"]
        .iter()
        .map(|s| (*s).to_string())
        .collect()
}

fn default_sensitive_capabilities() -> Vec<String> {
    ["legal", "finance", "security", "production-deploy"]
        .iter()
        .map(|s| (*s).to_string())
        .collect()
}

fn default_reviewer_group() -> String {
    "human-review".into()
}

/// Configuration for [`RuleApprovalPolicy`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalPolicyConfig {
    /// Gate every `critical` request.
    #[serde(default = "default_true")]
    pub critical_requires_approval: bool,
    /// Gate `high` priority requests as well.
    #[serde(default)]
    pub high_priority_requires_approval: bool,
    /// Risk tags that always require review.
    #[serde(default = "default_high_risk_tags")]
    pub high_risk_tags: Vec<String>,
    /// Capabilities that always require review.
    #[serde(default = "default_sensitive_capabilities")]
    pub sensitive_capabilities: Vec<String>,
    /// Group recorded as the reviewer on gated tasks.
    #[serde(default = "default_reviewer_group")]
    pub reviewer_group: String,
}

impl Default for ApprovalPolicyConfig {
    fn default() -> Self {
        Self {
            critical_requires_approval: true,
            high_priority_requires_approval: false,
            high_risk_tags: default_high_risk_tags(),
            sensitive_capabilities: default_sensitive_capabilities(),
            reviewer_group: default_reviewer_group(),
        }
    }
}

/// Rule-based [`ApprovalPolicy`].
///
/// Rules, in the order they are reported: `critical_priority`,
/// `high_priority`, `high_risk_tag`, `sensitive_capability` and
/// `manual_override` (`context.requiresHumanApproval == true`).
#[derive(Debug, Clone, Default)]
pub struct RuleApprovalPolicy {
    config: ApprovalPolicyConfig,
}

impl RuleApprovalPolicy {
    /// Create a policy from `config`.
    pub fn new(config: ApprovalPolicyConfig) -> Self {
        Self { config }
    }
}

impl ApprovalPolicy for RuleApprovalPolicy {
    fn evaluate(&self, request: &TaskRequest) -> ApprovalRequirement {
        let cfg = &self.config;
        let mut matched = Vec::new();

        if cfg.critical_requires_approval && request.priority() == TaskPriority::Critical {
            matched.push("critical_priority".to_string());
        }
        if cfg.high_priority_requires_approval && request.priority() == TaskPriority::High {
            matched.push("high_priority".to_string());
        }
        if request.risk_tags().iter().any(|t| cfg.high_risk_tags.contains(t)) {
            matched.push("high_risk_tag".to_string());
        }
        if request
            .required_capabilities()
            .iter()
            .any(|c| cfg.sensitive_capabilities.contains(c))
        {
            matched.push("sensitive_capability".to_string());
        }
        if request.context_flag("requiresHumanApproval") {
            matched.push("manual_override".to_string());
        }

        if matched.is_empty() {
            return ApprovalRequirement::not_required();
        }

        ApprovalRequirement::required(format!("approval_required:{}", matched.join(",")))
            .with_reviewer_group(cfg.reviewer_group.clone())
            .with_rules(matched)
    }
}
