//! Dispatch policy: block rules and secret redaction applied to a task
//! request before it leaves the orchestrator.

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fmt;
use swarm_core::{SwarmError, SwarmResult, TaskRequest};

/// One reason a policy denied a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyReason {
    /// Stable machine code, e.g. `blocked_risk_tag`.
    pub code: String,
    /// Human-readable detail.
    pub reason: String,
}

impl PolicyReason {
    /// Create a reason with a machine code and a detail string.
    pub fn new(code: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for PolicyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.code, self.reason)
    }
}

/// One redaction applied at a JSON path of the request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Redaction {
    /// JSON path of the redacted field.
    pub path: String,
    /// Name of the rule that matched.
    pub pattern: String,
    /// Number of replacements made.
    pub count: usize,
}

/// Verdict of a [`DispatchPolicy`].
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyVerdict {
    /// Send the request unchanged.
    Allow,
    /// Do not send; no record is created.
    Deny {
        /// Every rule that matched, in evaluation order.
        reasons: Vec<PolicyReason>,
    },
    /// Send `request` in place of the original.
    AllowWithRedactions {
        /// The redacted copy.
        request: TaskRequest,
        /// What was replaced, and where.
        redactions: Vec<Redaction>,
    },
}

impl PolicyVerdict {
    /// True unless the verdict is [`PolicyVerdict::Deny`].
    pub fn is_allowed(&self) -> bool {
        !matches!(self, PolicyVerdict::Deny { .. })
    }
}

/// Decides whether a request may be dispatched.
pub trait DispatchPolicy: Send + Sync {
    /// Evaluate `request`. Errors are treated as denials by the caller.
    fn evaluate(&self, request: &TaskRequest) -> SwarmResult<PolicyVerdict>;
}

impl<F> DispatchPolicy for F
where
    F: Fn(&TaskRequest) -> SwarmResult<PolicyVerdict> + Send + Sync,
{
    fn evaluate(&self, request: &TaskRequest) -> SwarmResult<PolicyVerdict> {
        self(request)
    }
}

/// A named regular expression matched against the task text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedPattern {
    /// Name reported in denial reasons.
    pub name: String,
    /// Regular expression source.
    pub pattern: String,
}

/// A named pattern and its replacement text (`${1}` refers to a capture group).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedactionRule {
    /// Name reported in the redaction list.
    pub name: String,
    /// Regular expression source.
    pub pattern: String,
    /// Replacement text.
    #[serde(default = "default_replacement")]
    pub replacement: String,
    /// Compile the pattern with the `i` flag.
    #[serde(default)]
    pub case_insensitive: bool,
}

fn default_replacement() -> String {
    "[REDACTED]".into()
}

fn default_true() -> bool {
    true
}

fn default_blocked_risk_tags() -> Vec<String> {
    ["malware", "credential_theft", "data_exfiltration", "self_harm"]
        .iter()
        .map(|s| (*s).to_string())
        .collect()
}

fn default_blocked_capabilities() -> Vec<String> {
    ["destructive_shell", "credential_access", "mass_messaging"]
        .iter()
        .map(|s| (*s).to_string())
        .collect()
}

fn default_blocked_task_patterns() -> Vec<NamedPattern> {
    vec![
        NamedPattern {
            name: "malware_intent".into(),
            pattern: r"\b(ransomware|malware|botnet|keylogger)\b".into(),
        },
        NamedPattern {
            name: "credential_exfiltration_intent".into(),
            pattern: r"\b(steal|exfiltrate)\b.{0,32}\b(password|credential|token)\b".into(),
        },
    ]
}

fn default_redaction_rules() -> Vec<RedactionRule> {
    vec![
        RedactionRule {
            name: "openai_api_key".into(),
            pattern: r"sk-[A-Za-z0-9]{20,}".into(),
            replacement: "[REDACTED:OPENAI_KEY]".into(),
            case_insensitive: false,
        },
        RedactionRule {
            name: "aws_access_key".into(),
            pattern: r"AKIA[0-9A-Z]{16}".into(),
            replacement: "[REDACTED:AWS_ACCESS_KEY]".into(),
            case_insensitive: false,
        },
        RedactionRule {
            name: "api_key_assignment".into(),
            pattern: r"(api[_-]?key|token|secret)\s*[:=]\s*[^\s,;]+".into(),
            replacement: "${1}=[REDACTED]".into(),
            case_insensitive: true,
        },
        RedactionRule {
            name: "email".into(),
            pattern: r"[A-Z0-9._%+-]+@[A-Z0-9.-]+\.[A-Z]{2,}".into(),
            replacement: "[REDACTED:EMAIL]".into(),
            case_insensitive: true,
        },
    ]
}

/// Configuration for [`RuleDispatchPolicy`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchPolicyConfig {
    /// Risk tags that deny the request outright.
    #[serde(default = "default_blocked_risk_tags")]
    pub blocked_risk_tags: Vec<String>,
    /// Capabilities that deny the request outright.
    #[serde(default = "default_blocked_capabilities")]
    pub blocked_capabilities: Vec<String>,
    /// Matched case-insensitively against the task text.
    #[serde(default = "default_blocked_task_patterns")]
    pub blocked_task_patterns: Vec<NamedPattern>,
    /// Rules applied to the task text and payload strings.
    #[serde(default = "default_redaction_rules")]
    pub redaction_patterns: Vec<RedactionRule>,
    /// Apply `redaction_patterns`; when false, requests pass unredacted.
    #[serde(default = "default_true")]
    pub redact_sensitive_data: bool,
}

impl Default for DispatchPolicyConfig {
    fn default() -> Self {
        Self {
            blocked_risk_tags: default_blocked_risk_tags(),
            blocked_capabilities: default_blocked_capabilities(),
            blocked_task_patterns: default_blocked_task_patterns(),
            redaction_patterns: default_redaction_rules(),
            redact_sensitive_data: true,
        }
    }
}

struct CompiledRedaction {
    name: String,
    regex: Regex,
    replacement: String,
}

type CustomRule = Box<dyn Fn(&TaskRequest) -> Option<PolicyReason> + Send + Sync>;

/// Rule-based [`DispatchPolicy`].
pub struct RuleDispatchPolicy {
    blocked_risk_tags: HashSet<String>,
    blocked_capabilities: HashSet<String>,
    blocked_task_patterns: Vec<(String, Regex)>,
    redactions: Vec<CompiledRedaction>,
    redact_sensitive_data: bool,
    custom_rules: Vec<CustomRule>,
}

impl RuleDispatchPolicy {
    /// Compile `config`. Invalid regular expressions are a configuration error.
    pub fn new(config: DispatchPolicyConfig) -> SwarmResult<Self> {
        let compile = |pattern: &str, case_insensitive: bool| {
            RegexBuilder::new(pattern)
                .case_insensitive(case_insensitive)
                .build()
                .map_err(|e| SwarmError::Config(format!("invalid policy pattern '{pattern}': {e}")))
        };

        let mut blocked_task_patterns = Vec::with_capacity(config.blocked_task_patterns.len());
        for p in &config.blocked_task_patterns {
            blocked_task_patterns.push((p.name.clone(), compile(&p.pattern, true)?));
        }

        let mut redactions = Vec::with_capacity(config.redaction_patterns.len());
        for rule in &config.redaction_patterns {
            redactions.push(CompiledRedaction {
                name: rule.name.clone(),
                regex: compile(&rule.pattern, rule.case_insensitive)?,
                replacement: rule.replacement.clone(),
            });
        }

        Ok(Self {
            blocked_risk_tags: lowered_set(&config.blocked_risk_tags),
            blocked_capabilities: lowered_set(&config.blocked_capabilities),
            blocked_task_patterns,
            redactions,
            redact_sensitive_data: config.redact_sensitive_data,
            custom_rules: Vec::new(),
        })
    }

    /// Policy with the default rule set.
    pub fn with_defaults() -> SwarmResult<Self> {
        Self::new(DispatchPolicyConfig::default())
    }

    /// Add a rule that denies a request by returning a reason.
    pub fn with_rule<F>(mut self, rule: F) -> Self
    where
        F: Fn(&TaskRequest) -> Option<PolicyReason> + Send + Sync + 'static,
    {
        self.custom_rules.push(Box::new(rule));
        self
    }

    fn deny_reasons(&self, request: &TaskRequest) -> Vec<PolicyReason> {
        let mut reasons = Vec::new();

        for tag in request.risk_tags() {
            if self.blocked_risk_tags.contains(&tag) {
                reasons.push(PolicyReason::new("blocked_risk_tag", tag));
            }
        }

        for capability in request.required_capabilities() {
            let lowered = capability.to_lowercase();
            if self.blocked_capabilities.contains(&lowered) {
                reasons.push(PolicyReason::new("blocked_capability", lowered));
            }
        }

        for (name, regex) in &self.blocked_task_patterns {
            if regex.is_match(request.task()) {
                reasons.push(PolicyReason::new("blocked_task_pattern", name.clone()));
            }
        }

        reasons.extend(self.custom_rules.iter().filter_map(|rule| rule(request)));
        reasons
    }

    fn redact_str(&self, input: &str, path: &str, out: &mut Vec<Redaction>) -> String {
        let mut value = input.to_string();
        for rule in &self.redactions {
            let count = rule.regex.find_iter(&value).count();
            if count == 0 {
                continue;
            }
            out.push(Redaction {
                path: path.to_string(),
                pattern: rule.name.clone(),
                count,
            });
            value = rule.regex.replace_all(&value, rule.replacement.as_str()).into_owned();
        }
        value
    }

    fn redact_value(&self, value: &Value, path: &str, out: &mut Vec<Redaction>) -> Value {
        match value {
            Value::String(s) => Value::String(self.redact_str(s, path, out)),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .enumerate()
                    .map(|(i, item)| self.redact_value(item, &format!("{path}[{i}]"), out))
                    .collect(),
            ),
            Value::Object(map) => {
                let mut redacted = Map::with_capacity(map.len());
                for (key, child) in map {
                    redacted.insert(key.clone(), self.redact_value(child, &format!("{path}.{key}"), out));
                }
                Value::Object(redacted)
            }
            other => other.clone(),
        }
    }

    /// Redact secrets from the task text, context values and constraints.
    pub fn redact(&self, request: &TaskRequest) -> SwarmResult<(TaskRequest, Vec<Redaction>)> {
        let mut redactions = Vec::new();
        let mut draft = request.to_draft();

        draft.task = self.redact_str(request.task(), "task", &mut redactions);

        let mut context = Map::with_capacity(request.context().len());
        for (key, child) in request.context() {
            context.insert(key.clone(), self.redact_value(child, &format!("context.{key}"), &mut redactions));
        }
        draft.context = context;

        draft.constraints = request
            .constraints()
            .iter()
            .enumerate()
            .map(|(i, c)| self.redact_str(c, &format!("constraints[{i}]"), &mut redactions))
            .collect();

        Ok((draft.build()?, redactions))
    }
}

impl DispatchPolicy for RuleDispatchPolicy {
    fn evaluate(&self, request: &TaskRequest) -> SwarmResult<PolicyVerdict> {
        let reasons = self.deny_reasons(request);
        if !reasons.is_empty() {
            return Ok(PolicyVerdict::Deny { reasons });
        }
        if !self.redact_sensitive_data {
            return Ok(PolicyVerdict::Allow);
        }
        let (sanitized, redactions) = self.redact(request)?;
        if redactions.is_empty() {
            Ok(PolicyVerdict::Allow)
        } else {
            Ok(PolicyVerdict::AllowWithRedactions {
                request: sanitized,
                redactions,
            })
        }
    }
}

fn lowered_set(values: &[String]) -> HashSet<String> {
    values
        .iter()
        .map(|v| v.trim().to_lowercase())
        .filter(|v| !v.is_empty())
        .collect()
}
