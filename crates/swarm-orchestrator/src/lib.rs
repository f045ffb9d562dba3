//! Dispatch core for agent swarms: routing, task lifecycle, workflows and
//! sandboxed execution.
//!
//! The [`TaskOrchestrator`] owns every task from dispatch to a terminal
//! status. It consults a router to pick workers, applies dispatch and
//! approval policies, retries with deterministic backoff, persists through a
//! single ordered queue and records audit events. The [`WorkflowEngine`]
//! drives it for DAGs of tasks, and the [`SandboxOrchestrator`] gates and
//! records privileged execution.
//!
//! # Main types
//!
//! - [`TaskRouter`] — Scores agent snapshots and picks the best eligible worker.
//! - [`StaticAgentRegistry`] / [`RegistryRouter`] — Heartbeat-fed registry and the resolver built on it.
//! - [`TaskOrchestrator`] — Task state machine with retries, approvals, persistence and audit.
//! - [`WorkflowEngine`] — Dispatches DAG nodes wave by wave and propagates failure.
//! - [`SandboxOrchestrator`] — Profile selection, escalation binding and hash-chained replay.
//! - [`SwarmConfig`] — TOML configuration for all of the above.

/// TOML configuration.
pub mod config;
/// Task state machine.
pub mod orchestrator;
/// Task records and their history.
pub mod record;
/// Agent registry and registry-backed routing.
pub mod registry;
/// Retry reasons and backoff.
pub mod retry;
/// Agent scoring and selection.
pub mod router;
/// Sandbox profiles, escalations and replay.
pub mod sandbox;
/// Task record persistence.
pub mod store;
/// Seams between the orchestrator and its collaborators.
pub mod types;
/// DAG workflows.
pub mod workflow;

pub use config::{AuditConfig, OrchestratorConfig, SandboxConfig, SwarmConfig};
pub use orchestrator::{MaintenanceSummary, OrchestratorMetrics, TaskFilter, TaskOrchestrator};
pub use record::{
    ApprovalRecord, ApprovalStatus, HistoryEntry, LifecycleState, PolicyRecord, RetryLifecycle,
    TaskRecord, TaskStatus,
};
pub use registry::{AgentRegistry, Heartbeat, RegistryHealth, RegistryRouter, StaticAgentRegistry};
pub use retry::{jitter_unit, RetryPolicy, RetryReason};
pub use router::{
    AgentSnapshot, AgentStatus, BenchmarkStats, BenchmarkThresholds, BenchmarkWeights, RankedAgent,
    RouteDecision, RouterConfig, TaskRouter,
};
pub use sandbox::{
    default_profiles, escalation_token, verify_replay_events, EscalationRecord, EscalationRequest,
    EscalationStatus, ExecuteOptions, ExecutionContext, ExecutionOutcome, ExecutionPlan,
    ExecutionRecord, ExecutionReport, NoopExecutor, ProfileSelection, ReplayEvent, ReplayPacket,
    ReplayVerification, SandboxExecutor, SandboxIsolation, SandboxOrchestrator, SandboxProfile,
    SelectionReason,
};
pub use store::{FileTaskStore, MemoryTaskStore, TaskStore};
pub use types::{DispatchOptions, RouteOutcome, RouteResolver, TaskDispatcher, Transport};
pub use workflow::{
    validate_workflow_definition, NodeState, NodeStatus, WorkflowDefinition, WorkflowEngine,
    WorkflowMetrics, WorkflowNode, WorkflowRecord, WorkflowStatus,
};
