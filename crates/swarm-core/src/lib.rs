//! Core types and error definitions for the swarm dispatch core.
//!
//! This crate provides the foundational types shared across all swarm crates:
//! the task message contract, error handling, canonical hashing, time, audit
//! and approval vocabularies.
//!
//! # Main types
//!
//! - [`SwarmError`] — Unified error enum with stable error codes.
//! - [`SwarmResult`] — Convenience alias for `Result<T, SwarmError>`.
//! - [`TaskRequest`] — Validated, immutable request for a worker.
//! - [`TaskReceipt`] / [`TaskResult`] — Worker acknowledgements and outcomes.
//! - [`SwarmMessage`] — `kind`-tagged wire envelope.
//! - [`Clock`] — Injectable millisecond time source.
//! - [`AuditSink`] — Append-only audit destination.

/// Approval types for human-in-the-loop gates.
pub mod approval;
/// Audit event type and sink trait.
pub mod audit;
/// Canonical JSON encoding and SHA-256 helpers.
pub mod canonical;
/// Millisecond clocks.
pub mod clock;
/// Error type and result alias.
pub mod error;
/// Task request, receipt and result messages.
pub mod message;

pub use approval::{ApprovalDecision, ApprovalRequirement};
pub use audit::{AuditEvent, AuditSink};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{SwarmError, SwarmResult};
pub use message::{
    normalize_string_list, ResultArtifact, SwarmMessage, TaskContext, TaskPriority, TaskReceipt,
    TaskRequest, TaskRequestDraft, TaskResult, TaskResultStatus,
};
