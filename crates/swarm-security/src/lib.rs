//! Security layer for the swarm dispatch core.
//!
//! Provides audit sinks (a background JSONL writer, an HMAC-signed
//! hash-chained log and an in-memory sink) plus the dispatch and approval
//! policies the orchestrator consults before sending a task.

/// Rule-based approval policy.
pub mod approval_policy;
/// JSONL and in-memory audit sinks.
pub mod audit;
/// Block rules and secret redaction.
pub mod dispatch_policy;
/// HMAC-signed hash-chained audit log.
pub mod signed;

pub use approval_policy::{ApprovalPolicy, ApprovalPolicyConfig, RuleApprovalPolicy};
pub use audit::{JsonlAuditSink, MemoryAuditSink};
pub use dispatch_policy::{
    DispatchPolicy, DispatchPolicyConfig, NamedPattern, PolicyReason, PolicyVerdict, Redaction,
    RedactionRule, RuleDispatchPolicy,
};
pub use signed::{load_entries, sign_event, verify_chain, ChainVerification, SignedAuditEntry, SignedAuditLog};
