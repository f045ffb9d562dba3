//! Approval types for human-in-the-loop gates.
//!
//! These live in `swarm-core` so that the policy implementations in
//! `swarm-security` and the orchestrator that enforces them share one
//! vocabulary without a dependency cycle.

use serde::{Deserialize, Serialize};

/// Outcome of evaluating an approval policy against a task request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequirement {
    /// Whether a human must review before the task is sent.
    pub required: bool,
    /// Group expected to review, e.g. `human-review`.
    #[serde(default)]
    pub reviewer_group: Option<String>,
    /// Why approval is required.
    #[serde(default)]
    pub reason: Option<String>,
    /// Rule names that triggered the requirement.
    #[serde(default)]
    pub matched_rules: Vec<String>,
}

impl ApprovalRequirement {
    /// No approval needed.
    pub fn not_required() -> Self {
        Self::default()
    }

    /// Approval needed for `reason`.
    pub fn required(reason: impl Into<String>) -> Self {
        Self {
            required: true,
            reviewer_group: None,
            reason: Some(reason.into()),
            matched_rules: Vec::new(),
        }
    }

    /// Route the review to `group`.
    pub fn with_reviewer_group(mut self, group: impl Into<String>) -> Self {
        self.reviewer_group = Some(group.into());
        self
    }

    /// Record the rules that matched.
    pub fn with_rules(mut self, rules: Vec<String>) -> Self {
        self.matched_rules = rules;
        self
    }
}

/// The decision made by a reviewer, for task approvals and sandbox escalations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalDecision {
    /// `true` releases the task, `false` rejects it.
    pub approved: bool,
    /// Who decided.
    #[serde(default)]
    pub reviewer: Option<String>,
    /// Reviewer comment; required in practice for denials.
    #[serde(default)]
    pub reason: Option<String>,
    /// Review time; the reviewing component's clock is used when absent.
    #[serde(default)]
    pub reviewed_at: Option<i64>,
}

impl ApprovalDecision {
    /// Approval by `reviewer`.
    pub fn approve(reviewer: impl Into<String>) -> Self {
        Self {
            approved: true,
            reviewer: Some(reviewer.into()),
            reason: None,
            reviewed_at: None,
        }
    }

    /// Denial by `reviewer` with a reason.
    pub fn deny(reviewer: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            approved: false,
            reviewer: Some(reviewer.into()),
            reason: Some(reason.into()),
            reviewed_at: None,
        }
    }

    /// Stamp the decision time.
    pub fn at(mut self, reviewed_at: i64) -> Self {
        self.reviewed_at = Some(reviewed_at);
        self
    }
}
