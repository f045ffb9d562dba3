use crate::retry::RetryPolicy;
use crate::router::RouterConfig;
use crate::sandbox::SandboxProfile;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use swarm_core::{SwarmError, SwarmResult};
use swarm_security::{ApprovalPolicyConfig, DispatchPolicyConfig};

fn default_local_agent_id() -> String {
    "swarm:orchestrator".into()
}

fn default_timeout_ms() -> i64 {
    30_000
}

fn default_max_retries() -> u32 {
    1
}

fn default_retry_delay_ms() -> i64 {
    500
}

fn default_max_retry_delay_ms() -> i64 {
    30_000
}

fn default_retry_jitter_ratio() -> f64 {
    0.2
}

fn default_retry_cycle_multiplier() -> u32 {
    4
}

fn default_persistence_queue_capacity() -> usize {
    256
}

/// Task orchestrator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Sender id stamped on every outgoing request and audit event.
    #[serde(default = "default_local_agent_id")]
    pub local_agent_id: String,
    /// Applied when a request has no timeout of its own.
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: i64,
    /// Retries allowed after the first send.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base of the exponential retry delay.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: i64,
    /// Cap on any single retry delay.
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: i64,
    /// Jitter spread in `[0, 1]`; `0` disables jitter.
    #[serde(default = "default_retry_jitter_ratio")]
    pub retry_jitter_ratio: f64,
    /// Growth factor of the delay across retry cycles.
    #[serde(default = "default_retry_cycle_multiplier")]
    pub retry_cycle_multiplier: u32,
    /// Bound of the queue feeding the task store.
    #[serde(default = "default_persistence_queue_capacity")]
    pub persistence_queue_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            local_agent_id: default_local_agent_id(),
            default_timeout_ms: default_timeout_ms(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            max_retry_delay_ms: default_max_retry_delay_ms(),
            retry_jitter_ratio: default_retry_jitter_ratio(),
            retry_cycle_multiplier: default_retry_cycle_multiplier(),
            persistence_queue_capacity: default_persistence_queue_capacity(),
        }
    }
}

impl OrchestratorConfig {
    /// The retry curve described by these settings.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay_ms: self.retry_delay_ms,
            max_delay_ms: self.max_retry_delay_ms,
            jitter_ratio: self.retry_jitter_ratio,
            cycle_multiplier: self.retry_cycle_multiplier,
        }
    }
}

fn default_profile_id() -> String {
    "balanced-tooling".into()
}

/// Sandbox orchestrator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Profile used when no heuristic applies.
    #[serde(default = "default_profile_id")]
    pub default_profile_id: String,
    /// Extra profiles, registered after the built-in ones (same id overrides).
    #[serde(default)]
    pub profiles: Vec<SandboxProfile>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            default_profile_id: default_profile_id(),
            profiles: Vec::new(),
        }
    }
}

fn default_signing_key_env() -> String {
    "SWARM_AUDIT_KEY".into()
}

fn default_key_id() -> String {
    "default".into()
}

/// Where audit events go.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Directory for the plain `audit.jsonl` log.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    /// File for the HMAC-signed chain.
    #[serde(default)]
    pub signed_log: Option<PathBuf>,
    /// Environment variable holding the signing secret.
    #[serde(default = "default_signing_key_env")]
    pub signing_key_env: String,
    /// Key id written into each signed entry.
    #[serde(default = "default_key_id")]
    pub key_id: String,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            log_dir: None,
            signed_log: None,
            signing_key_env: default_signing_key_env(),
            key_id: default_key_id(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

/// Top-level configuration, usually read from `swarm.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwarmConfig {
    /// Root of the task log and audit files.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Dispatch and retry settings.
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    /// Worker selection settings.
    #[serde(default)]
    pub router: RouterConfig,
    /// Sandbox profiles and escalation settings.
    #[serde(default)]
    pub sandbox: SandboxConfig,
    /// Audit sinks.
    #[serde(default)]
    pub audit: AuditConfig,
    /// Rule-based dispatch policy; none installed when absent.
    #[serde(default)]
    pub dispatch_policy: Option<DispatchPolicyConfig>,
    /// Rule-based approval policy; none installed when absent.
    #[serde(default)]
    pub approval_policy: Option<ApprovalPolicyConfig>,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            orchestrator: OrchestratorConfig::default(),
            router: RouterConfig::default(),
            sandbox: SandboxConfig::default(),
            audit: AuditConfig::default(),
            dispatch_policy: None,
            approval_policy: None,
        }
    }
}

impl SwarmConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(input: &str) -> SwarmResult<Self> {
        toml::from_str(input).map_err(|e| SwarmError::Config(e.to_string()))
    }

    /// Read and parse a TOML file.
    pub fn load(path: &Path) -> SwarmResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SwarmError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    /// Path of the task store log under `data_dir`.
    pub fn task_store_path(&self) -> PathBuf {
        self.data_dir.join("tasks.jsonl")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = SwarmConfig::from_toml_str("").unwrap();
        assert_eq!(config, SwarmConfig::default());
        assert_eq!(config.orchestrator.local_agent_id, "swarm:orchestrator");
        assert_eq!(config.orchestrator.persistence_queue_capacity, 256);
        assert_eq!(config.sandbox.default_profile_id, "balanced-tooling");
        assert_eq!(config.task_store_path(), PathBuf::from("data/tasks.jsonl"));
    }

    #[test]
    fn test_partial_sections_keep_defaults() {
        let config = SwarmConfig::from_toml_str(
            r#"
            data_dir = "/var/lib/swarm"

            [orchestrator]
            max_retries = 3
            retry_delay_ms = 40

            [router]
            max_staleness_ms = 15000

            [[sandbox.profiles]]
            id = "gpu-batch"
            isolation = "balanced"
            allowNetwork = true
            maxRuntimeMs = 600000
            "#,
        )
        .unwrap();

        assert_eq!(config.orchestrator.max_retries, 3);
        assert_eq!(config.orchestrator.default_timeout_ms, 30_000);
        assert_eq!(config.router.max_staleness_ms, 15_000);
        assert_eq!(config.sandbox.profiles.len(), 1);
        assert_eq!(config.sandbox.profiles[0].max_runtime_ms, 600_000);

        let retry = config.orchestrator.retry_policy();
        assert_eq!(retry.base_delay_ms, 40);
        assert_eq!(retry.cycle_multiplier, 4);
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let err = SwarmConfig::from_toml_str("[orchestrator\nmax_retries = ").unwrap_err();
        assert_eq!(err.code(), "CONFIG");
    }

    #[test]
    fn test_load_from_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("swarm.toml");
        std::fs::write(&path, "[audit]\nkey_id = \"k1\"\n").unwrap();
        let config = SwarmConfig::load(&path).unwrap();
        assert_eq!(config.audit.key_id, "k1");
        assert_eq!(config.audit.signing_key_env, "SWARM_AUDIT_KEY");

        assert!(SwarmConfig::load(&tmp.path().join("missing.toml")).is_err());
    }
}
