//! The task orchestrator: a per-task state machine with deadlines, bounded
//! retries, approval gates, ordered persistence and audit.
//!
//! All records live behind one async mutex; every public operation holds it
//! for its whole duration, so transitions of one orchestrator never
//! interleave. Queries hand out clones.

use crate::config::OrchestratorConfig;
use crate::record::{
    ApprovalRecord, ApprovalStatus, HistoryEntry, LifecycleState, PolicyRecord, RetryLifecycle, TaskRecord,
    TaskStatus,
};
use crate::retry::{RetryPolicy, RetryReason};
use crate::store::TaskStore;
use crate::types::{DispatchOptions, RouteResolver, TaskDispatcher, Transport};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use swarm_core::{
    ApprovalDecision, AuditEvent, AuditSink, Clock, SwarmError, SwarmResult, SystemClock, TaskReceipt, TaskRequest,
    TaskRequestDraft, TaskResult, TaskResultStatus,
};
use swarm_security::{ApprovalPolicy, DispatchPolicy, PolicyReason, PolicyVerdict};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

/// Counters reported by one [`TaskOrchestrator::run_maintenance`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceSummary {
    /// Open records inspected.
    pub checked: usize,
    /// Retries scheduled for records past their deadline.
    pub scheduled_retries: usize,
    /// Retry sends that succeeded.
    pub retried: usize,
    /// Records closed as `timed_out`.
    pub timed_out: usize,
    /// Retry sends that failed.
    pub transport_failures: usize,
}

/// Selection for [`TaskOrchestrator::list_tasks`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskFilter {
    /// Only records in this status.
    pub status: Option<TaskStatus>,
    /// Only records sent to this worker.
    pub target: Option<String>,
    /// Skip terminal records.
    pub open_only: bool,
}

impl TaskFilter {
    /// Restrict to `status`.
    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Restrict to `target`.
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Skip terminal records.
    pub fn open_only(mut self) -> Self {
        self.open_only = true;
        self
    }

    fn matches(&self, record: &TaskRecord) -> bool {
        if self.status.is_some_and(|s| s != record.status) {
            return false;
        }
        if self.target.as_deref().is_some_and(|t| t != record.target) {
            return false;
        }
        !(self.open_only && record.is_terminal())
    }
}

/// Aggregate view over all tracked records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorMetrics {
    /// Records tracked.
    pub total: usize,
    /// Records still awaiting an outcome.
    pub open: usize,
    /// Records in a terminal state.
    pub terminal: usize,
    /// Record count per status.
    pub by_status: BTreeMap<String, usize>,
    /// Mean attempts per record, two decimals.
    pub avg_attempts: f64,
}

enum PersistOp {
    Save(Box<TaskRecord>),
    Delete(String),
    Flush(oneshot::Sender<()>),
}

enum RetryOutcome {
    Scheduled { next_retry_at: i64 },
    Exhausted,
}

/// Spawn the single consumer that applies store writes in enqueue order.
fn spawn_persistence(store: Arc<dyn TaskStore>, capacity: usize) -> mpsc::Sender<PersistOp> {
    let (tx, mut rx) = mpsc::channel::<PersistOp>(capacity.max(1));

    tokio::spawn(async move {
        while let Some(op) = rx.recv().await {
            match op {
                PersistOp::Save(record) => {
                    if let Err(e) = store.save_record(&record).await {
                        warn!(task_id = %record.task_id, error = %e, "Persistence operation failed (save_record)");
                    }
                }
                PersistOp::Delete(task_id) => {
                    if let Err(e) = store.delete_record(&task_id).await {
                        warn!(task_id = %task_id, error = %e, "Persistence operation failed (delete_record)");
                    }
                }
                PersistOp::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
    });

    tx
}

/// Tracks dispatched tasks from creation to a terminal status.
pub struct TaskOrchestrator {
    config: OrchestratorConfig,
    retry: RetryPolicy,
    transport: Arc<dyn Transport>,
    router: Option<Arc<dyn RouteResolver>>,
    dispatch_policy: Option<Arc<dyn DispatchPolicy>>,
    approval_policy: Option<Arc<dyn ApprovalPolicy>>,
    store: Option<Arc<dyn TaskStore>>,
    persistence: Option<mpsc::Sender<PersistOp>>,
    audit: Option<Arc<dyn AuditSink>>,
    clock: Arc<dyn Clock>,
    tasks: Mutex<BTreeMap<String, TaskRecord>>,
}

impl TaskOrchestrator {
    /// An orchestrator without router, policies, store or audit.
    pub fn new(config: OrchestratorConfig, transport: Arc<dyn Transport>) -> Self {
        let retry = config.retry_policy();
        Self {
            config,
            retry,
            transport,
            router: None,
            dispatch_policy: None,
            approval_policy: None,
            store: None,
            persistence: None,
            audit: None,
            clock: Arc::new(SystemClock),
            tasks: Mutex::new(BTreeMap::new()),
        }
    }

    /// Resolve targets for requests dispatched without one.
    pub fn with_router(mut self, router: Arc<dyn RouteResolver>) -> Self {
        self.router = Some(router);
        self
    }

    /// Consult `policy` before every dispatch.
    pub fn with_dispatch_policy(mut self, policy: Arc<dyn DispatchPolicy>) -> Self {
        self.dispatch_policy = Some(policy);
        self
    }

    /// Gate dispatches on `policy`.
    pub fn with_approval_policy(mut self, policy: Arc<dyn ApprovalPolicy>) -> Self {
        self.approval_policy = Some(policy);
        self
    }

    /// Persist every mutation to `store`.
    ///
    /// Spawns the persistence consumer, so this must be called from within a
    /// tokio runtime.
    pub fn with_store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.persistence = Some(spawn_persistence(
            store.clone(),
            self.config.persistence_queue_capacity,
        ));
        self.store = Some(store);
        self
    }

    /// Emit audit events to `audit`.
    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Use `clock` for every timestamp.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Settings in effect.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Create, gate and send a task.
    ///
    /// Fails without creating a record when validation, routing or the
    /// dispatch policy refuses the request. A failed first send does not fail
    /// the call: the record is returned in `retry_scheduled`.
    pub async fn dispatch_task(&self, options: DispatchOptions) -> SwarmResult<TaskRecord> {
        let now = self.clock.now_ms();

        let mut draft = TaskRequestDraft::new(self.config.local_agent_id.clone(), options.task)
            .with_priority(options.priority)
            .with_context(options.context)
            .with_constraints(options.constraints)
            .with_created_at(options.created_at.unwrap_or(now));
        if let Some(id) = options.id {
            draft = draft.with_id(id);
        }
        let explicit_target = options
            .target
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());
        if let Some(target) = &explicit_target {
            draft = draft.with_target(target.clone());
        }
        let mut request = draft.build()?;

        let target = match explicit_target {
            Some(target) => target,
            None => self.resolve_target(&request).await?,
        };
        request = request.retarget(target.clone())?;

        let mut policy_record = None;
        if let Some(policy) = &self.dispatch_policy {
            let verdict = policy.evaluate(&request).unwrap_or_else(|e| PolicyVerdict::Deny {
                reasons: vec![PolicyReason::new("policy_error", e.to_string())],
            });
            match verdict {
                PolicyVerdict::Allow => {
                    policy_record = Some(PolicyRecord {
                        allowed: true,
                        reasons: Vec::new(),
                        redactions: Vec::new(),
                    });
                }
                PolicyVerdict::Deny { reasons } => {
                    warn!(task_id = %request.id(), target = %target, reasons = reasons.len(), "Dispatch policy denied task");
                    self.emit(
                        "task_policy_denied",
                        now,
                        json!({ "taskId": request.id(), "target": target, "reasons": reasons }),
                    )
                    .await;
                    return Err(SwarmError::PolicyDenied {
                        task_id: request.id().to_string(),
                        reasons: reasons.iter().map(ToString::to_string).collect(),
                    });
                }
                PolicyVerdict::AllowWithRedactions {
                    request: redacted,
                    redactions,
                } => {
                    let mut draft = redacted.to_draft();
                    draft.id = request.id().to_string();
                    draft.from = request.from().to_string();
                    draft.target = Some(target.clone());
                    draft.created_at = request.created_at();
                    request = draft.build()?;
                    policy_record = Some(PolicyRecord {
                        allowed: true,
                        reasons: Vec::new(),
                        redactions,
                    });
                }
            }
        }

        let mut tasks = self.tasks.lock().await;
        if tasks.contains_key(request.id()) {
            return Err(SwarmError::validation(format!("task {} already exists", request.id())));
        }

        let timeout_ms = options
            .timeout_ms
            .filter(|t| *t > 0)
            .unwrap_or(self.config.default_timeout_ms);
        let max_retries = options.max_retries.unwrap_or(self.config.max_retries);
        let task_id = request.id().to_string();

        let mut record = TaskRecord {
            task_id: task_id.clone(),
            target: target.clone(),
            request,
            status: TaskStatus::Created,
            approval: None,
            policy: policy_record,
            attempts: 0,
            max_retries,
            timeout_ms,
            retry_lifecycle: RetryLifecycle::new(self.retry.max_cycles(max_retries)),
            created_at: now,
            updated_at: now,
            deadline_at: now.saturating_add(timeout_ms),
            next_retry_at: None,
            closed_at: None,
            last_error: None,
            receipts: Vec::new(),
            result: None,
            history: Vec::new(),
        };
        record.push_history(HistoryEntry::new(now, "created").with("target", target.as_str()));

        let redactions = record
            .policy
            .as_ref()
            .map(|p| p.redactions.clone())
            .unwrap_or_default();
        if !redactions.is_empty() {
            record.push_history(HistoryEntry::new(now, "policy_redacted").with("redactionCount", redactions.len()));
        }

        if let Some(policy) = &self.approval_policy {
            let requirement = policy.evaluate(&record.request);
            if requirement.required {
                let reason = requirement.reason.unwrap_or_else(|| "approval_required".into());
                record.status = TaskStatus::AwaitingApproval;
                record.push_history(HistoryEntry::new(now, "approval_requested").with("reason", reason.as_str()));
                record.approval = Some(ApprovalRecord {
                    status: ApprovalStatus::Pending,
                    reviewer_group: requirement.reviewer_group,
                    reason,
                    matched_rules: requirement.matched_rules,
                    requested_at: now,
                    reviewed_at: None,
                    reviewer: None,
                    review_reason: None,
                });
            }
        }

        self.persist(&record).await;
        self.emit(
            "task_created",
            now,
            json!({
                "taskId": task_id,
                "target": target,
                "priority": record.request.priority(),
                "status": record.status,
                "maxRetries": max_retries,
                "timeoutMs": timeout_ms,
            }),
        )
        .await;
        if !redactions.is_empty() {
            self.emit(
                "task_policy_redacted",
                now,
                json!({ "taskId": task_id, "redactions": redactions }),
            )
            .await;
        }
        info!(task_id = %task_id, target = %target, status = %record.status, "Task created");

        if record.status == TaskStatus::AwaitingApproval {
            if let Some(approval) = &record.approval {
                self.emit(
                    "task_approval_requested",
                    now,
                    json!({
                        "taskId": task_id,
                        "reviewerGroup": approval.reviewer_group,
                        "reason": approval.reason,
                        "matchedRules": approval.matched_rules,
                    }),
                )
                .await;
            }
        } else if self.send_task(&mut record, "initial_dispatch").await.is_err() {
            let now = self.clock.now_ms();
            self.schedule_retry(&mut record, RetryReason::TransportFailure, now).await;
        }

        let snapshot = record.clone();
        tasks.insert(task_id, record);
        Ok(snapshot)
    }

    async fn resolve_target(&self, request: &TaskRequest) -> SwarmResult<String> {
        let Some(router) = &self.router else {
            return Err(SwarmError::MissingTarget);
        };
        let outcome = router.resolve(request).await?;
        outcome
            .target()
            .map(str::to_string)
            .ok_or(SwarmError::MissingTarget)
    }

    /// Release or reject a task waiting for approval.
    ///
    /// Returns `Ok(None)` for an unknown task.
    pub async fn review_task(&self, task_id: &str, decision: ApprovalDecision) -> SwarmResult<Option<TaskRecord>> {
        let mut tasks = self.tasks.lock().await;
        let Some(record) = tasks.get_mut(task_id) else {
            return Ok(None);
        };
        if record.status != TaskStatus::AwaitingApproval {
            return Err(SwarmError::NotAwaitingApproval(task_id.to_string()));
        }

        let reviewed_at = decision.reviewed_at.unwrap_or_else(|| self.clock.now_ms());
        let created_at = record.created_at;
        let approval = record.approval.get_or_insert_with(|| ApprovalRecord {
            status: ApprovalStatus::Pending,
            reviewer_group: None,
            reason: "approval_required".into(),
            matched_rules: Vec::new(),
            requested_at: created_at,
            reviewed_at: None,
            reviewer: None,
            review_reason: None,
        });
        approval.status = if decision.approved {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Denied
        };
        approval.reviewed_at = Some(reviewed_at);
        approval.reviewer = decision.reviewer.clone();
        approval.review_reason = decision.reason.clone();

        let payload = json!({
            "taskId": task_id,
            "reviewer": decision.reviewer,
            "reason": decision.reason,
        });

        if !decision.approved {
            record.close(TaskStatus::Rejected, reviewed_at, "approval_denied");
            record.push_history(
                HistoryEntry::new(reviewed_at, "approval_denied")
                    .with("reason", decision.reason.as_deref().unwrap_or("denied")),
            );
            self.persist(record).await;
            self.emit("task_approval_denied", reviewed_at, payload).await;
            info!(task_id = %task_id, "Task approval denied");
            return Ok(Some(record.clone()));
        }

        record.status = TaskStatus::Created;
        record.updated_at = reviewed_at;
        record.push_history(HistoryEntry::new(reviewed_at, "approval_approved"));
        self.persist(record).await;
        self.emit("task_approval_approved", reviewed_at, payload).await;
        info!(task_id = %task_id, "Task approved");

        if self.send_task(record, "approval_release").await.is_err() {
            let now = self.clock.now_ms();
            self.schedule_retry(record, RetryReason::ApprovalReleaseFailed, now).await;
        }
        Ok(Some(record.clone()))
    }

    /// Apply a worker receipt. Returns `false` for unknown or closed tasks.
    pub async fn ingest_receipt(&self, receipt: TaskReceipt) -> SwarmResult<bool> {
        receipt.validate()?;
        let mut tasks = self.tasks.lock().await;
        let Some(record) = tasks.get_mut(&receipt.task_id) else {
            debug!(task_id = %receipt.task_id, "Receipt for unknown task ignored");
            return Ok(false);
        };
        if record.is_terminal() {
            debug!(task_id = %receipt.task_id, status = %record.status, "Receipt for closed task ignored");
            return Ok(false);
        }
        if record.held_for_approval() {
            debug!(task_id = %receipt.task_id, status = %record.status, "Receipt for unapproved task ignored");
            return Ok(false);
        }

        let at = receipt.timestamp;
        record.receipts.push(receipt.clone());
        record.updated_at = at;

        if !receipt.accepted {
            let reason = receipt.reason.clone().unwrap_or_else(|| "rejected_by_worker".into());
            record.last_error = Some(reason.clone());
            record.close(TaskStatus::Rejected, at, "worker_rejected");
            record.push_history(HistoryEntry::new(at, "rejected").with("reason", reason.as_str()));
            self.persist(record).await;
            self.emit(
                "task_rejected",
                at,
                json!({ "taskId": record.task_id, "from": receipt.from, "reason": reason }),
            )
            .await;
            info!(task_id = %record.task_id, reason = %reason, "Task rejected by worker");
            return Ok(true);
        }

        record.status = TaskStatus::Acknowledged;
        record.next_retry_at = None;
        record.retry_lifecycle.next_retry_at = None;
        record.retry_lifecycle.state = LifecycleState::Idle;
        if let Some(eta) = receipt.eta_ms {
            record.deadline_at = at.saturating_add(i64::try_from(eta).unwrap_or(i64::MAX));
        }
        record.push_history(HistoryEntry::new(at, "acknowledged").with("etaMs", receipt.eta_ms));
        self.persist(record).await;
        self.emit(
            "task_acknowledged",
            at,
            json!({
                "taskId": record.task_id,
                "from": receipt.from,
                "etaMs": receipt.eta_ms,
                "deadlineAt": record.deadline_at,
            }),
        )
        .await;
        debug!(task_id = %record.task_id, deadline_at = record.deadline_at, "Task acknowledged");
        Ok(true)
    }

    /// Apply a worker result. Returns `false` for unknown or closed tasks.
    pub async fn ingest_result(&self, result: TaskResult) -> SwarmResult<bool> {
        result.validate()?;
        let mut tasks = self.tasks.lock().await;
        let Some(record) = tasks.get_mut(&result.task_id) else {
            debug!(task_id = %result.task_id, "Result for unknown task ignored");
            return Ok(false);
        };
        if record.is_terminal() {
            debug!(task_id = %result.task_id, status = %record.status, "Result for closed task ignored");
            return Ok(false);
        }
        if record.held_for_approval() {
            debug!(task_id = %result.task_id, status = %record.status, "Result for unapproved task ignored");
            return Ok(false);
        }

        let at = result.completed_at;
        let status = match result.status {
            TaskResultStatus::Success => TaskStatus::Completed,
            TaskResultStatus::Partial => TaskStatus::Partial,
            TaskResultStatus::Failure => TaskStatus::Failed,
        };
        record.close(status, at, "result_received");
        record.push_history(HistoryEntry::new(at, "result").with("resultStatus", result.status.as_str()));
        record.result = Some(result.clone());
        self.persist(record).await;
        self.emit(
            "task_result",
            at,
            json!({
                "taskId": record.task_id,
                "from": result.from,
                "resultStatus": result.status,
                "status": status,
                "attempts": record.attempts,
            }),
        )
        .await;
        info!(task_id = %record.task_id, status = %status, attempts = record.attempts, "Task closed by result");
        Ok(true)
    }

    /// Enforce deadlines and fire due retries.
    ///
    /// Deadlines are only ever checked here; callers drive this from their
    /// own scheduling loop.
    pub async fn run_maintenance(&self, now: i64) -> MaintenanceSummary {
        let mut summary = MaintenanceSummary::default();
        let mut tasks = self.tasks.lock().await;

        for record in tasks.values_mut() {
            if !record.status.is_open() {
                continue;
            }
            if record.held_for_approval() {
                warn!(task_id = %record.task_id, status = %record.status, "Unapproved task skipped by maintenance");
                continue;
            }
            summary.checked += 1;

            if record.status == TaskStatus::RetryScheduled {
                let due_at = record.next_retry_at.unwrap_or(record.updated_at);
                if now >= due_at {
                    self.execute_retry(record, now, &mut summary).await;
                }
                continue;
            }

            if now <= record.deadline_at {
                continue;
            }

            record.retry_lifecycle.consecutive_failures += 1;
            record.push_history(HistoryEntry::new(now, "deadline_exceeded").with("deadlineAt", record.deadline_at));
            match self.schedule_retry(record, RetryReason::Timeout, now).await {
                RetryOutcome::Exhausted => summary.timed_out += 1,
                RetryOutcome::Scheduled { next_retry_at } => {
                    summary.scheduled_retries += 1;
                    if next_retry_at <= now {
                        self.execute_retry(record, now, &mut summary).await;
                    }
                }
            }
        }

        if summary != MaintenanceSummary::default() {
            debug!(
                checked = summary.checked,
                scheduled_retries = summary.scheduled_retries,
                retried = summary.retried,
                timed_out = summary.timed_out,
                transport_failures = summary.transport_failures,
                "Maintenance pass complete"
            );
        }
        summary
    }

    async fn execute_retry(&self, record: &mut TaskRecord, now: i64, summary: &mut MaintenanceSummary) {
        if record.held_for_approval() {
            return;
        }
        let reason = record
            .retry_lifecycle
            .last_reason
            .clone()
            .unwrap_or_else(|| RetryReason::Timeout.as_str().to_string());
        match self.send_task(record, &format!("retry:{reason}")).await {
            Ok(()) => summary.retried += 1,
            Err(_) => {
                summary.transport_failures += 1;
                self.schedule_retry(record, RetryReason::TransportFailure, now).await;
            }
        }
    }

    async fn send_task(&self, record: &mut TaskRecord, reason: &str) -> SwarmResult<()> {
        let send_at = self.clock.now_ms();
        record.attempts += 1;
        record.updated_at = send_at;
        record.retry_lifecycle.state = LifecycleState::Dispatching;
        record.retry_lifecycle.dispatch_count += 1;
        let attempt = record.attempts;
        record.push_history(
            HistoryEntry::new(send_at, "send_attempt")
                .with("reason", reason)
                .with("attempt", attempt),
        );
        self.emit(
            "task_send_attempt",
            send_at,
            json!({ "taskId": record.task_id, "target": record.target, "attempt": attempt, "reason": reason }),
        )
        .await;

        match self.transport.send(&record.target, &record.request).await {
            Ok(()) => {
                let at = self.clock.now_ms();
                record.status = TaskStatus::Dispatched;
                record.updated_at = at;
                record.deadline_at = send_at.saturating_add(record.timeout_ms);
                record.next_retry_at = None;
                record.last_error = None;
                record.retry_lifecycle.consecutive_failures = 0;
                record.retry_lifecycle.state = LifecycleState::Idle;
                record.retry_lifecycle.next_retry_at = None;
                record.push_history(HistoryEntry::new(at, "send_success").with("attempt", attempt));
                self.persist(record).await;
                self.emit(
                    "task_send_success",
                    at,
                    json!({
                        "taskId": record.task_id,
                        "target": record.target,
                        "attempt": attempt,
                        "deadlineAt": record.deadline_at,
                    }),
                )
                .await;
                info!(task_id = %record.task_id, target = %record.target, attempt, "Task sent");
                Ok(())
            }
            Err(e) => {
                let at = self.clock.now_ms();
                let message = e.to_string();
                record.updated_at = at;
                record.last_error = Some(message.clone());
                record.retry_lifecycle.consecutive_failures += 1;
                record.push_history(
                    HistoryEntry::new(at, "send_failed")
                        .with("attempt", attempt)
                        .with("error", message.as_str()),
                );
                self.persist(record).await;
                self.emit(
                    "task_send_failed",
                    at,
                    json!({
                        "taskId": record.task_id,
                        "target": record.target,
                        "attempt": attempt,
                        "error": message,
                    }),
                )
                .await;
                warn!(task_id = %record.task_id, target = %record.target, attempt, error = %message, "Task send failed");
                Err(SwarmError::SendFailed {
                    task_id: record.task_id.clone(),
                    target: record.target.clone(),
                    attempt,
                    message,
                })
            }
        }
    }

    async fn schedule_retry(&self, record: &mut TaskRecord, reason: RetryReason, now: i64) -> RetryOutcome {
        if record.attempts > record.max_retries {
            self.terminalize(record, reason, "retry_budget_exhausted", now).await;
            return RetryOutcome::Exhausted;
        }
        if record.retry_lifecycle.scheduled_count >= record.retry_lifecycle.max_cycles {
            self.terminalize(record, reason, "retry_cycle_guard", now).await;
            return RetryOutcome::Exhausted;
        }

        let delay_ms = self.retry.compute_delay(
            &record.task_id,
            reason,
            &record.retry_lifecycle,
            record.attempts,
            record.updated_at,
        );
        let next_retry_at = now.saturating_add(delay_ms);

        let lifecycle = &mut record.retry_lifecycle;
        lifecycle.scheduled_count += 1;
        lifecycle.state = LifecycleState::Scheduled;
        lifecycle.last_reason = Some(reason.as_str().to_string());
        lifecycle.last_delay_ms = Some(delay_ms);
        lifecycle.next_retry_at = Some(next_retry_at);

        record.status = TaskStatus::RetryScheduled;
        record.next_retry_at = Some(next_retry_at);
        record.updated_at = now;
        record.push_history(
            HistoryEntry::new(now, "retry_scheduled")
                .with("reason", reason.as_str())
                .with("delayMs", delay_ms)
                .with("nextRetryAt", next_retry_at),
        );
        self.persist(record).await;
        self.emit(
            "task_retry_scheduled",
            now,
            json!({
                "taskId": record.task_id,
                "reason": reason,
                "attempts": record.attempts,
                "delayMs": delay_ms,
                "nextRetryAt": next_retry_at,
                "scheduledCount": record.retry_lifecycle.scheduled_count,
            }),
        )
        .await;
        info!(task_id = %record.task_id, reason = %reason, delay_ms, "Retry scheduled");
        RetryOutcome::Scheduled { next_retry_at }
    }

    async fn terminalize(&self, record: &mut TaskRecord, reason: RetryReason, terminal_reason: &str, now: i64) {
        let status = reason.terminal_status();
        record.close(status, now, terminal_reason);
        record.push_history(
            HistoryEntry::new(now, status.as_str())
                .with("reason", terminal_reason)
                .with("retryReason", reason.as_str()),
        );
        self.persist(record).await;
        self.emit(
            "task_retry_exhausted",
            now,
            json!({
                "taskId": record.task_id,
                "status": status,
                "reason": terminal_reason,
                "retryReason": reason,
                "attempts": record.attempts,
                "lastError": record.last_error,
            }),
        )
        .await;
        warn!(task_id = %record.task_id, status = %status, reason = terminal_reason, attempts = record.attempts, "Task retries exhausted");
    }

    async fn persist(&self, record: &TaskRecord) {
        self.enqueue(PersistOp::Save(Box::new(record.clone()))).await;
    }

    async fn enqueue(&self, op: PersistOp) {
        if let Some(tx) = &self.persistence {
            if tx.send(op).await.is_err() {
                warn!("Persistence consumer stopped; dropping write");
            }
        }
    }

    async fn emit(&self, event_type: &str, at: i64, payload: Value) {
        let Some(audit) = &self.audit else { return };
        let event = AuditEvent::new(event_type, at, self.config.local_agent_id.clone(), payload);
        if let Err(e) = audit.append(event).await {
            warn!(event_type, error = %e, "Audit append failed");
        }
    }

    /// Wait until every store write enqueued so far has been applied.
    pub async fn flush(&self) {
        let Some(tx) = &self.persistence else { return };
        let (done_tx, done_rx) = oneshot::channel();
        if tx.send(PersistOp::Flush(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Load records from the store, optionally replacing the in-memory table.
    ///
    /// Records written by older versions are normalised: missing timeouts and
    /// cycle bounds are filled in, terminal records are marked terminalized
    /// and scheduled retries get a due time. Returns the number loaded.
    pub async fn hydrate(&self, replace: bool) -> SwarmResult<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let loaded = store.load_records().await?;

        let mut tasks = self.tasks.lock().await;
        if replace {
            tasks.clear();
        }
        let count = loaded.len();
        for mut record in loaded {
            self.normalize(&mut record);
            tasks.insert(record.task_id.clone(), record);
        }
        info!(loaded = count, replace, "Task records hydrated");
        Ok(count)
    }

    fn normalize(&self, record: &mut TaskRecord) {
        if record.timeout_ms <= 0 {
            record.timeout_ms = self.config.default_timeout_ms;
        }
        let lifecycle = &mut record.retry_lifecycle;
        if lifecycle.max_cycles == 0 {
            lifecycle.max_cycles = self.retry.max_cycles(record.max_retries);
        }

        if record.status.is_terminal() {
            lifecycle.state = LifecycleState::Terminalized;
            lifecycle.next_retry_at = None;
            record.next_retry_at = None;
            if record.closed_at.is_none() {
                record.closed_at = Some(record.updated_at);
            }
        } else if record.status == TaskStatus::RetryScheduled {
            let due_at = record
                .next_retry_at
                .or(lifecycle.next_retry_at)
                .unwrap_or(record.updated_at);
            record.next_retry_at = Some(due_at);
            lifecycle.next_retry_at = Some(due_at);
            lifecycle.state = LifecycleState::Scheduled;
        } else if lifecycle.state == LifecycleState::Scheduled {
            lifecycle.state = LifecycleState::Idle;
            lifecycle.next_retry_at = None;
        }
    }

    /// Snapshot of one record.
    pub async fn get_task(&self, task_id: &str) -> Option<TaskRecord> {
        self.tasks.lock().await.get(task_id).cloned()
    }

    /// Matching records, oldest first.
    pub async fn list_tasks(&self, filter: &TaskFilter) -> Vec<TaskRecord> {
        let tasks = self.tasks.lock().await;
        let mut out: Vec<TaskRecord> = tasks.values().filter(|r| filter.matches(r)).cloned().collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.task_id.cmp(&b.task_id)));
        out
    }

    /// Records waiting on a reviewer, oldest first.
    pub async fn list_pending_approvals(&self) -> Vec<TaskRecord> {
        self.list_tasks(&TaskFilter::default().with_status(TaskStatus::AwaitingApproval))
            .await
    }

    /// Counters over all tracked records.
    pub async fn metrics(&self) -> OrchestratorMetrics {
        let tasks = self.tasks.lock().await;
        let mut metrics = OrchestratorMetrics {
            total: tasks.len(),
            ..OrchestratorMetrics::default()
        };
        let mut attempts_total: u64 = 0;
        for record in tasks.values() {
            attempts_total += u64::from(record.attempts);
            *metrics.by_status.entry(record.status.as_str().to_string()).or_insert(0) += 1;
            if record.is_terminal() {
                metrics.terminal += 1;
            } else {
                metrics.open += 1;
            }
        }
        if metrics.total > 0 {
            let avg = attempts_total as f64 / metrics.total as f64;
            metrics.avg_attempts = (avg * 100.0).round() / 100.0;
        }
        metrics
    }

    /// Drop terminal records closed before `before_ms`, in memory and in the
    /// store. Returns the ids removed.
    pub async fn purge_closed(&self, before_ms: i64) -> Vec<String> {
        let mut tasks = self.tasks.lock().await;
        let expired: Vec<String> = tasks
            .values()
            .filter(|r| r.is_terminal() && r.closed_at.unwrap_or(r.updated_at) < before_ms)
            .map(|r| r.task_id.clone())
            .collect();
        for task_id in &expired {
            tasks.remove(task_id);
            self.enqueue(PersistOp::Delete(task_id.clone())).await;
        }
        if !expired.is_empty() {
            info!(purged = expired.len(), before_ms, "Closed task records purged");
        }
        expired
    }
}

#[async_trait]
impl TaskDispatcher for TaskOrchestrator {
    async fn dispatch(&self, options: DispatchOptions) -> SwarmResult<TaskRecord> {
        self.dispatch_task(options).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryTaskStore;
    use crate::types::RouteOutcome;
    use parking_lot::Mutex as SyncMutex;
    use std::collections::VecDeque;
    use swarm_core::{ApprovalRequirement, ManualClock, TaskPriority};
    use swarm_security::{MemoryAuditSink, Redaction};

    /// Records every send; fails while scripted failures remain.
    #[derive(Default)]
    struct ScriptedTransport {
        failures: SyncMutex<VecDeque<bool>>,
        sent: SyncMutex<Vec<(String, TaskRequest)>>,
    }

    impl ScriptedTransport {
        fn failing_first(n: usize) -> Self {
            let t = Self::default();
            t.failures.lock().extend(std::iter::repeat(true).take(n));
            t
        }

        fn sent(&self) -> Vec<(String, TaskRequest)> {
            self.sent.lock().clone()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(&self, target: &str, request: &TaskRequest) -> SwarmResult<()> {
            self.sent.lock().push((target.to_string(), request.clone()));
            if self.failures.lock().pop_front().unwrap_or(false) {
                return Err(SwarmError::Transport("connection refused".into()));
            }
            Ok(())
        }
    }

    struct Fixture {
        orchestrator: TaskOrchestrator,
        transport: Arc<ScriptedTransport>,
        audit: Arc<MemoryAuditSink>,
        clock: Arc<ManualClock>,
    }

    fn config() -> OrchestratorConfig {
        OrchestratorConfig {
            default_timeout_ms: 1_000,
            max_retries: 1,
            retry_delay_ms: 40,
            retry_jitter_ratio: 0.0,
            ..OrchestratorConfig::default()
        }
    }

    fn fixture_with(config: OrchestratorConfig, transport: ScriptedTransport) -> Fixture {
        let transport = Arc::new(transport);
        let audit = Arc::new(MemoryAuditSink::new());
        let clock = Arc::new(ManualClock::new(10_000));
        let orchestrator = TaskOrchestrator::new(config, transport.clone())
            .with_audit(audit.clone())
            .with_clock(clock.clone());
        Fixture {
            orchestrator,
            transport,
            audit,
            clock,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(config(), ScriptedTransport::default())
    }

    fn options(id: &str) -> DispatchOptions {
        DispatchOptions::new("summarize the incident")
            .with_id(id)
            .with_target("worker:a")
    }

    #[tokio::test]
    async fn test_dispatch_sends_and_sets_deadline() {
        let f = fixture();
        let record = f.orchestrator.dispatch_task(options("t1")).await.unwrap();

        assert_eq!(record.status, TaskStatus::Dispatched);
        assert_eq!(record.attempts, 1);
        assert_eq!(record.deadline_at, 11_000);
        assert_eq!(record.request.from(), "swarm:orchestrator");
        assert_eq!(record.request.target(), Some("worker:a"));
        assert_eq!(record.retry_lifecycle.max_cycles, 8);
        assert_eq!(record.retry_lifecycle.dispatch_count, 1);

        let sent = f.transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "worker:a");
        assert_eq!(
            f.audit.event_types(),
            vec!["task_created", "task_send_attempt", "task_send_success"]
        );
    }

    #[tokio::test]
    async fn test_missing_target_without_router() {
        let f = fixture();
        let err = f
            .orchestrator
            .dispatch_task(DispatchOptions::new("orphan"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "MISSING_TARGET");
        assert!(f.transport.sent().is_empty());
        assert_eq!(f.orchestrator.metrics().await.total, 0);
    }

    struct FixedRouter(RouteOutcome);

    #[async_trait]
    impl RouteResolver for FixedRouter {
        async fn resolve(&self, _draft: &TaskRequest) -> SwarmResult<RouteOutcome> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_router_outcomes_resolve_target() {
        let f = fixture();
        let orchestrator = f.orchestrator.with_router(Arc::new(FixedRouter(RouteOutcome::Selection {
            selected_agent_id: "worker:b".into(),
        })));
        let record = orchestrator
            .dispatch_task(DispatchOptions::new("route me").with_id("r1"))
            .await
            .unwrap();
        assert_eq!(record.target, "worker:b");
        assert_eq!(f.transport.sent()[0].0, "worker:b");

        let unroutable = fixture().orchestrator.with_router(Arc::new(FixedRouter(RouteOutcome::Unroutable)));
        let err = unroutable.dispatch_task(DispatchOptions::new("nowhere")).await.unwrap_err();
        assert!(matches!(err, SwarmError::MissingTarget));
    }

    #[tokio::test]
    async fn test_duplicate_id_is_rejected() {
        let f = fixture();
        f.orchestrator.dispatch_task(options("dup")).await.unwrap();
        let err = f.orchestrator.dispatch_task(options("dup")).await.unwrap_err();
        assert_eq!(err.code(), "VALIDATION");
        assert_eq!(f.transport.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_fail_then_succeed_completes_in_two_attempts() {
        let f = fixture_with(config(), ScriptedTransport::failing_first(1));
        let record = f.orchestrator.dispatch_task(options("t1")).await.unwrap();
        assert_eq!(record.status, TaskStatus::RetryScheduled);
        assert_eq!(record.attempts, 1);
        // 40ms base, one consecutive failure (1.15), transport penalty (1.25)
        assert!(matches!(record.retry_lifecycle.last_delay_ms, Some(57..=58)));
        let due = record.next_retry_at.unwrap();

        let early = f.orchestrator.run_maintenance(due - 1).await;
        assert_eq!(early.retried, 0);

        f.clock.set(due);
        let summary = f.orchestrator.run_maintenance(due).await;
        assert_eq!(summary.retried, 1);

        let closed = f
            .orchestrator
            .ingest_result(TaskResult::success("t1", "worker:a", due + 5))
            .await
            .unwrap();
        assert!(closed);

        let record = f.orchestrator.get_task("t1").await.unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
        assert_eq!(record.attempts, 2);
        assert_eq!(record.history_count("retry_scheduled"), 1);
        assert_eq!(record.retry_lifecycle.state, LifecycleState::Terminalized);
    }

    #[tokio::test]
    async fn test_budget_exhaustion_closes_as_transport_error() {
        let f = fixture_with(config(), ScriptedTransport::failing_first(5));
        let record = f.orchestrator.dispatch_task(options("t1")).await.unwrap();
        let due = record.next_retry_at.unwrap();

        f.clock.set(due);
        let summary = f.orchestrator.run_maintenance(due).await;
        assert_eq!(summary.transport_failures, 1);

        let record = f.orchestrator.get_task("t1").await.unwrap();
        assert_eq!(record.status, TaskStatus::TransportError);
        assert_eq!(record.attempts, 2);
        assert_eq!(
            record.retry_lifecycle.terminal_reason.as_deref(),
            Some("retry_budget_exhausted")
        );
        assert_eq!(f.audit.count("task_retry_exhausted"), 1);
        assert_eq!(f.transport.sent().len(), 2);
    }

    #[tokio::test]
    async fn test_timeout_retries_then_times_out() {
        let f = fixture();
        f.orchestrator.dispatch_task(options("t1")).await.unwrap();

        f.clock.set(11_001);
        let summary = f.orchestrator.run_maintenance(11_001).await;
        assert_eq!(summary.scheduled_retries, 1);
        let record = f.orchestrator.get_task("t1").await.unwrap();
        assert_eq!(record.status, TaskStatus::RetryScheduled);
        // 40 * 1.15 for one consecutive timeout
        assert_eq!(record.retry_lifecycle.last_delay_ms, Some(46));

        let due = record.next_retry_at.unwrap();
        f.clock.set(due);
        assert_eq!(f.orchestrator.run_maintenance(due).await.retried, 1);

        let deadline = f.orchestrator.get_task("t1").await.unwrap().deadline_at;
        f.clock.set(deadline + 1);
        let summary = f.orchestrator.run_maintenance(deadline + 1).await;
        assert_eq!(summary.timed_out, 1);

        let record = f.orchestrator.get_task("t1").await.unwrap();
        assert_eq!(record.status, TaskStatus::TimedOut);
        assert!(record.closed_at.is_some());
    }

    #[tokio::test]
    async fn test_cycle_guard_bounds_scheduling() {
        let mut cfg = config();
        cfg.max_retries = 10;
        cfg.retry_cycle_multiplier = 1;
        let f = fixture_with(cfg, ScriptedTransport::default());
        let record = f
            .orchestrator
            .dispatch_task(options("t1").with_max_retries(0))
            .await
            .unwrap();
        assert_eq!(record.max_retries, 0);
        assert_eq!(record.retry_lifecycle.max_cycles, 1);

        {
            let mut tasks = f.orchestrator.tasks.lock().await;
            let record = tasks.get_mut("t1").unwrap();
            record.retry_lifecycle.scheduled_count = 1;
            record.max_retries = 5;
        }
        let summary = f.orchestrator.run_maintenance(20_000).await;
        assert_eq!(summary.timed_out, 1);
        let record = f.orchestrator.get_task("t1").await.unwrap();
        assert_eq!(record.retry_lifecycle.terminal_reason.as_deref(), Some("retry_cycle_guard"));
    }

    #[tokio::test]
    async fn test_terminal_records_ignore_late_messages() {
        let f = fixture();
        f.orchestrator.dispatch_task(options("t1")).await.unwrap();
        assert!(f
            .orchestrator
            .ingest_result(TaskResult::failure("t1", "worker:a", "boom", 10_100))
            .await
            .unwrap());

        let before = f.orchestrator.get_task("t1").await.unwrap();
        assert_eq!(before.status, TaskStatus::Failed);

        assert!(!f
            .orchestrator
            .ingest_result(TaskResult::success("t1", "worker:a", 10_200))
            .await
            .unwrap());
        assert!(!f
            .orchestrator
            .ingest_receipt(TaskReceipt::accepted("t1", "worker:a", 10_300))
            .await
            .unwrap());
        let summary = f.orchestrator.run_maintenance(1_000_000).await;
        assert_eq!(summary.checked, 0);

        assert_eq!(f.orchestrator.get_task("t1").await.unwrap(), before);
        assert!(!f
            .orchestrator
            .ingest_result(TaskResult::success("ghost", "worker:a", 1))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_invalid_receipt_is_an_error() {
        let f = fixture();
        let err = f
            .orchestrator
            .ingest_receipt(TaskReceipt::accepted("", "worker:a", 1))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION");
    }

    #[tokio::test]
    async fn test_receipts_acknowledge_and_reject() {
        let f = fixture();
        f.orchestrator.dispatch_task(options("t1")).await.unwrap();
        f.orchestrator.dispatch_task(options("t2")).await.unwrap();

        assert!(f
            .orchestrator
            .ingest_receipt(TaskReceipt::accepted("t1", "worker:a", 10_050).with_eta(5_000))
            .await
            .unwrap());
        let t1 = f.orchestrator.get_task("t1").await.unwrap();
        assert_eq!(t1.status, TaskStatus::Acknowledged);
        assert_eq!(t1.deadline_at, 15_050);

        assert!(f
            .orchestrator
            .ingest_receipt(TaskReceipt::rejected("t2", "worker:a", "overloaded", 10_060))
            .await
            .unwrap());
        let t2 = f.orchestrator.get_task("t2").await.unwrap();
        assert_eq!(t2.status, TaskStatus::Rejected);
        assert_eq!(t2.last_error.as_deref(), Some("overloaded"));
        assert_eq!(f.audit.count("task_rejected"), 1);
    }

    #[tokio::test]
    async fn test_policy_denial_creates_no_record() {
        let f = fixture();
        let deny = |_: &TaskRequest| -> SwarmResult<PolicyVerdict> {
            Ok(PolicyVerdict::Deny {
                reasons: vec![PolicyReason::new("blocked_risk_tag", "malware")],
            })
        };
        let orchestrator = f.orchestrator.with_dispatch_policy(Arc::new(deny));
        let err = orchestrator.dispatch_task(options("t1")).await.unwrap_err();
        match err {
            SwarmError::PolicyDenied { task_id, reasons } => {
                assert_eq!(task_id, "t1");
                assert_eq!(reasons, vec!["blocked_risk_tag:malware"]);
            }
            other => panic!("unexpected error {other}"),
        }
        assert!(orchestrator.get_task("t1").await.is_none());
        assert!(f.transport.sent().is_empty());
        assert_eq!(f.audit.event_types(), vec!["task_policy_denied"]);
    }

    #[tokio::test]
    async fn test_policy_error_counts_as_denial() {
        let f = fixture();
        let broken = |_: &TaskRequest| -> SwarmResult<PolicyVerdict> { Err(SwarmError::Config("bad".into())) };
        let orchestrator = f.orchestrator.with_dispatch_policy(Arc::new(broken));
        let err = orchestrator.dispatch_task(options("t1")).await.unwrap_err();
        assert_eq!(err.code(), "POLICY_DENIED");
        assert!(err.to_string().contains("policy_error"));
    }

    #[tokio::test]
    async fn test_redaction_preserves_identity() {
        let f = fixture();
        let redact = |req: &TaskRequest| -> SwarmResult<PolicyVerdict> {
            let mut draft = req.to_draft();
            draft.task = "use [REDACTED]".into();
            draft.id = "hijacked".into();
            draft.target = Some("worker:evil".into());
            Ok(PolicyVerdict::AllowWithRedactions {
                request: draft.build()?,
                redactions: vec![Redaction {
                    path: "task".into(),
                    pattern: "secret".into(),
                    count: 1,
                }],
            })
        };
        let orchestrator = f.orchestrator.with_dispatch_policy(Arc::new(redact));
        let record = orchestrator.dispatch_task(options("t1")).await.unwrap();

        assert_eq!(record.task_id, "t1");
        assert_eq!(record.request.task(), "use [REDACTED]");
        assert_eq!(record.request.target(), Some("worker:a"));
        assert_eq!(record.history_count("policy_redacted"), 1);
        assert_eq!(f.transport.sent()[0].0, "worker:a");
        assert_eq!(f.audit.count("task_policy_redacted"), 1);
    }

    fn require_for_critical(req: &TaskRequest) -> ApprovalRequirement {
        if req.priority() == TaskPriority::Critical {
            ApprovalRequirement::required("approval_required:critical_priority")
                .with_reviewer_group("human-review")
                .with_rules(vec!["critical_priority".into()])
        } else {
            ApprovalRequirement::not_required()
        }
    }

    #[tokio::test]
    async fn test_approval_gate_holds_then_releases() {
        let f = fixture();
        let orchestrator = f.orchestrator.with_approval_policy(Arc::new(require_for_critical));

        let record = orchestrator
            .dispatch_task(options("t1").with_priority(TaskPriority::Critical))
            .await
            .unwrap();
        assert_eq!(record.status, TaskStatus::AwaitingApproval);
        assert_eq!(record.attempts, 0);
        assert!(f.transport.sent().is_empty());
        assert_eq!(orchestrator.list_pending_approvals().await.len(), 1);

        // maintenance never touches a gated record
        assert_eq!(orchestrator.run_maintenance(1_000_000).await.checked, 0);

        let released = orchestrator
            .review_task("t1", ApprovalDecision::approve("alice").at(10_500))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(released.status, TaskStatus::Dispatched);
        assert_eq!(released.approval.as_ref().unwrap().status, ApprovalStatus::Approved);
        assert_eq!(f.transport.sent().len(), 1);

        let err = orchestrator
            .review_task("t1", ApprovalDecision::approve("alice"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NOT_AWAITING_APPROVAL");
        assert!(orchestrator
            .review_task("ghost", ApprovalDecision::approve("alice"))
            .await
            .unwrap()
            .is_none());
        assert_eq!(f.audit.count("task_approval_requested"), 1);
        assert_eq!(f.audit.count("task_approval_approved"), 1);
    }

    #[tokio::test]
    async fn test_approval_denial_rejects() {
        let f = fixture();
        let orchestrator = f.orchestrator.with_approval_policy(Arc::new(require_for_critical));
        orchestrator
            .dispatch_task(options("t1").with_priority(TaskPriority::Critical))
            .await
            .unwrap();

        let record = orchestrator
            .review_task("t1", ApprovalDecision::deny("bob", "too risky"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, TaskStatus::Rejected);
        assert_eq!(record.approval.unwrap().review_reason.as_deref(), Some("too risky"));
        assert!(f.transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_approval_release_failure_schedules_retry() {
        let f = fixture_with(config(), ScriptedTransport::failing_first(1));
        let orchestrator = f.orchestrator.with_approval_policy(Arc::new(require_for_critical));
        orchestrator
            .dispatch_task(options("t1").with_priority(TaskPriority::Critical))
            .await
            .unwrap();

        let record = orchestrator
            .review_task("t1", ApprovalDecision::approve("alice"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, TaskStatus::RetryScheduled);
        assert_eq!(
            record.retry_lifecycle.last_reason.as_deref(),
            Some("approval_release_failed")
        );
    }

    #[tokio::test]
    async fn test_gated_task_ignores_worker_messages() {
        let f = fixture();
        let orchestrator = f.orchestrator.with_approval_policy(Arc::new(require_for_critical));
        orchestrator
            .dispatch_task(options("gated").with_priority(TaskPriority::Critical))
            .await
            .unwrap();

        let applied = orchestrator
            .ingest_receipt(TaskReceipt::accepted("gated", "worker:a", 10_100))
            .await
            .unwrap();
        assert!(!applied);
        let applied = orchestrator
            .ingest_result(TaskResult::success("gated", "worker:a", 10_200))
            .await
            .unwrap();
        assert!(!applied);

        let first = orchestrator.run_maintenance(20_000).await;
        let second = orchestrator.run_maintenance(1_000_000).await;
        assert_eq!(first, MaintenanceSummary::default());
        assert_eq!(second, MaintenanceSummary::default());

        let record = orchestrator.get_task("gated").await.unwrap();
        assert_eq!(record.status, TaskStatus::AwaitingApproval);
        assert_eq!(record.approval.unwrap().status, ApprovalStatus::Pending);
        assert!(record.receipts.is_empty());
        assert!(record.result.is_none());
        assert_eq!(record.attempts, 0);
        assert!(f.transport.sent().is_empty());
        assert_eq!(f.audit.count("task_acknowledged"), 0);
    }

    #[tokio::test]
    async fn test_maintenance_never_sends_unapproved_stored_record() {
        let f = fixture();
        let orchestrator = f.orchestrator.with_approval_policy(Arc::new(require_for_critical));
        let mut stored = orchestrator
            .dispatch_task(options("gated").with_priority(TaskPriority::Critical))
            .await
            .unwrap();
        // A record persisted open while its approval is still pending.
        stored.status = TaskStatus::RetryScheduled;
        stored.next_retry_at = Some(10_500);

        let transport = Arc::new(ScriptedTransport::default());
        let restored = TaskOrchestrator::new(config(), transport.clone())
            .with_store(Arc::new(MemoryTaskStore::with_records(vec![stored])))
            .with_clock(f.clock.clone());
        assert_eq!(restored.hydrate(true).await.unwrap(), 1);

        let summary = restored.run_maintenance(50_000).await;
        assert_eq!(summary.checked, 0);
        assert_eq!(summary.retried, 0);
        assert!(transport.sent().is_empty());
        assert_eq!(restored.get_task("gated").await.unwrap().attempts, 0);
    }

    /// Hands requests to a channel instead of delivering them inline.
    struct ChannelTransport(mpsc::UnboundedSender<(String, TaskRequest)>);

    #[async_trait]
    impl Transport for ChannelTransport {
        async fn send(&self, target: &str, request: &TaskRequest) -> SwarmResult<()> {
            self.0
                .send((target.to_string(), request.clone()))
                .map_err(|e| SwarmError::Transport(e.to_string()))
        }
    }

    #[tokio::test]
    async fn test_worker_replies_arrive_after_send_returns() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let orchestrator = Arc::new(
            TaskOrchestrator::new(config(), Arc::new(ChannelTransport(tx))).with_clock(Arc::new(ManualClock::new(10_000))),
        );

        let worker = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move {
                let (target, request) = rx.recv().await.unwrap();
                orchestrator
                    .ingest_receipt(TaskReceipt::accepted(request.id(), target.as_str(), 10_010))
                    .await
                    .unwrap();
                orchestrator
                    .ingest_result(TaskResult::success(request.id(), target.as_str(), 10_020))
                    .await
                    .unwrap()
            })
        };

        let record = orchestrator.dispatch_task(options("t1")).await.unwrap();
        assert_eq!(record.status, TaskStatus::Dispatched);
        assert!(worker.await.unwrap());

        let record = orchestrator.get_task("t1").await.unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
        assert_eq!(record.receipts.len(), 1);
    }

    #[tokio::test]
    async fn test_huge_timeout_saturates_deadline() {
        let f = fixture();
        let record = f
            .orchestrator
            .dispatch_task(options("big").with_timeout_ms(i64::MAX))
            .await
            .unwrap();
        assert_eq!(record.status, TaskStatus::Dispatched);
        assert_eq!(record.deadline_at, i64::MAX);

        let summary = f.orchestrator.run_maintenance(i64::MAX - 1).await;
        assert_eq!(summary.checked, 1);
        assert_eq!(summary.scheduled_retries, 0);
        assert_eq!(f.orchestrator.get_task("big").await.unwrap().status, TaskStatus::Dispatched);
    }

    #[tokio::test]
    async fn test_per_task_overrides() {
        let f = fixture();
        let record = f
            .orchestrator
            .dispatch_task(options("t1").with_timeout_ms(250).with_max_retries(3))
            .await
            .unwrap();
        assert_eq!(record.deadline_at, 10_250);
        assert_eq!(record.max_retries, 3);
        assert_eq!(record.retry_lifecycle.max_cycles, 16);

        let fallback = f
            .orchestrator
            .dispatch_task(options("t2").with_timeout_ms(0))
            .await
            .unwrap();
        assert_eq!(fallback.timeout_ms, 1_000);
    }

    #[tokio::test]
    async fn test_persistence_and_hydrate() {
        let store = Arc::new(MemoryTaskStore::new());
        let f = fixture();
        let orchestrator = f.orchestrator.with_store(store.clone());
        orchestrator.dispatch_task(options("t1")).await.unwrap();
        orchestrator.flush().await;

        let saved = store.get("t1").unwrap();
        assert_eq!(saved.status, TaskStatus::Dispatched);
        assert!(store.save_count() >= 2);

        let fresh = TaskOrchestrator::new(config(), Arc::new(ScriptedTransport::default())).with_store(store.clone());
        assert_eq!(fresh.hydrate(true).await.unwrap(), 1);
        assert_eq!(fresh.get_task("t1").await.unwrap(), saved);
    }

    #[tokio::test]
    async fn test_hydrate_normalizes_legacy_records() {
        let f = fixture();
        let seeded = f.orchestrator.dispatch_task(options("old")).await.unwrap();

        let mut legacy = seeded.clone();
        legacy.timeout_ms = 0;
        legacy.retry_lifecycle = RetryLifecycle::default();
        legacy.status = TaskStatus::RetryScheduled;
        legacy.next_retry_at = None;

        let mut done = seeded.clone();
        done.task_id = "done".into();
        done.status = TaskStatus::Completed;
        done.retry_lifecycle = RetryLifecycle::default();

        let store = Arc::new(MemoryTaskStore::with_records(vec![legacy.clone(), done]));
        let orchestrator = TaskOrchestrator::new(config(), Arc::new(ScriptedTransport::default())).with_store(store);
        assert_eq!(orchestrator.hydrate(true).await.unwrap(), 2);

        let old = orchestrator.get_task("old").await.unwrap();
        assert_eq!(old.timeout_ms, 1_000);
        assert_eq!(old.retry_lifecycle.max_cycles, 8);
        assert_eq!(old.next_retry_at, Some(legacy.updated_at));
        assert_eq!(old.retry_lifecycle.state, LifecycleState::Scheduled);

        let done = orchestrator.get_task("done").await.unwrap();
        assert_eq!(done.retry_lifecycle.state, LifecycleState::Terminalized);
    }

    #[tokio::test]
    async fn test_listing_metrics_and_purge() {
        let f = fixture();
        f.orchestrator.dispatch_task(options("a")).await.unwrap();
        f.orchestrator
            .dispatch_task(options("b").with_target("worker:b"))
            .await
            .unwrap();
        f.orchestrator
            .ingest_result(TaskResult::success("a", "worker:a", 10_100))
            .await
            .unwrap();

        let open = f.orchestrator.list_tasks(&TaskFilter::default().open_only()).await;
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].task_id, "b");
        let on_b = f
            .orchestrator
            .list_tasks(&TaskFilter::default().with_target("worker:b"))
            .await;
        assert_eq!(on_b.len(), 1);

        let metrics = f.orchestrator.metrics().await;
        assert_eq!(metrics.total, 2);
        assert_eq!(metrics.open, 1);
        assert_eq!(metrics.terminal, 1);
        assert_eq!(metrics.by_status.get("completed"), Some(&1));
        assert_eq!(metrics.avg_attempts, 1.0);

        assert_eq!(f.orchestrator.purge_closed(10_101).await, vec!["a"]);
        assert!(f.orchestrator.get_task("a").await.is_none());
        assert!(f.orchestrator.purge_closed(i64::MAX).await.is_empty());
    }

    #[tokio::test]
    async fn test_dispatcher_seam() {
        let f = fixture();
        let dispatcher: &dyn TaskDispatcher = &f.orchestrator;
        let record = dispatcher.dispatch(options("seam")).await.unwrap();
        assert_eq!(record.status, TaskStatus::Dispatched);
    }
}
