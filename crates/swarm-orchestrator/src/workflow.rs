//! DAG workflows dispatched wave by wave through a [`TaskDispatcher`].
//!
//! A node is dispatched once every node it depends on has completed. A
//! failed node fails the whole workflow and nothing downstream of it ever
//! starts.

use crate::record::HistoryEntry;
use crate::types::{DispatchOptions, TaskDispatcher};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use swarm_core::{
    Clock, SwarmError, SwarmResult, SystemClock, TaskContext, TaskPriority, TaskResult, TaskResultStatus,
};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// One step of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowNode {
    /// Node id, unique within the workflow.
    pub id: String,
    /// What the worker should do.
    pub task: String,
    /// Worker id; routed when absent.
    #[serde(default)]
    pub target: Option<String>,
    /// Urgency of the node's task.
    #[serde(default)]
    pub priority: TaskPriority,
    /// Context handed to the worker.
    #[serde(default)]
    pub context: Option<TaskContext>,
    /// Ids of nodes that must complete first.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Overrides `context.requiredCapabilities` when set.
    #[serde(default)]
    pub required_capabilities: Option<Vec<String>>,
    /// Per-node timeout; the orchestrator default when absent.
    #[serde(default)]
    pub timeout_ms: Option<i64>,
    /// Per-node retry budget; the orchestrator default when absent.
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl WorkflowNode {
    /// A node with no dependencies and default settings.
    pub fn new(id: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            task: task.into(),
            target: None,
            priority: TaskPriority::Normal,
            context: None,
            dependencies: Vec::new(),
            required_capabilities: None,
            timeout_ms: None,
            max_retries: None,
        }
    }

    /// Pin the node to a worker.
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Set the urgency.
    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Replace the dependency list.
    pub fn depends_on<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = dependencies.into_iter().map(Into::into).collect();
        self
    }

    /// Replace the required capabilities.
    pub fn with_required_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.required_capabilities = Some(capabilities);
        self
    }

    /// Override the timeout.
    pub fn with_timeout_ms(mut self, timeout_ms: i64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Override the retry budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// A named DAG of nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Workflow id.
    pub id: String,
    /// Nodes, in any order.
    pub nodes: Vec<WorkflowNode>,
}

impl WorkflowDefinition {
    /// A definition from its parts; see [`validate_workflow_definition`].
    pub fn new(id: impl Into<String>, nodes: Vec<WorkflowNode>) -> Self {
        Self { id: id.into(), nodes }
    }
}

/// Check a definition without side effects: non-empty ids and tasks, unique
/// node ids, known dependencies and no cycles.
pub fn validate_workflow_definition(definition: &WorkflowDefinition) -> SwarmResult<()> {
    if definition.id.trim().is_empty() {
        return Err(SwarmError::validation("workflow id must be a non-empty string"));
    }
    if definition.nodes.is_empty() {
        return Err(SwarmError::validation(format!(
            "workflow {} must have at least one node",
            definition.id
        )));
    }

    let mut seen = HashSet::new();
    for node in &definition.nodes {
        if node.id.trim().is_empty() {
            return Err(SwarmError::validation("workflow node id must be a non-empty string"));
        }
        if node.task.trim().is_empty() {
            return Err(SwarmError::validation(format!("node {} must have a task", node.id)));
        }
        if node.timeout_ms.is_some_and(|t| t <= 0) {
            return Err(SwarmError::validation(format!("node {} timeoutMs must be positive", node.id)));
        }
        if !seen.insert(node.id.as_str()) {
            return Err(SwarmError::DuplicateNode(node.id.clone()));
        }
    }

    for node in &definition.nodes {
        if let Some(dependency) = node.dependencies.iter().find(|d| !seen.contains(d.as_str())) {
            return Err(SwarmError::UnknownDependency {
                node: node.id.clone(),
                dependency: dependency.clone(),
            });
        }
    }

    let by_id: HashMap<&str, &WorkflowNode> = definition.nodes.iter().map(|n| (n.id.as_str(), n)).collect();
    let mut visited: HashMap<&str, u8> = HashMap::new();
    for node in &definition.nodes {
        if let Some(at) = dfs_cycle(node.id.as_str(), &by_id, &mut visited) {
            return Err(SwarmError::WorkflowCycle(at.to_string()));
        }
    }
    Ok(())
}

/// Returns the node at which a back edge was found.
fn dfs_cycle<'a>(
    id: &'a str,
    by_id: &HashMap<&'a str, &'a WorkflowNode>,
    visited: &mut HashMap<&'a str, u8>,
) -> Option<&'a str> {
    match visited.get(id) {
        Some(1) => return Some(id),
        Some(2) => return None,
        _ => {}
    }
    visited.insert(id, 1);
    if let Some(node) = by_id.get(id) {
        for dep in &node.dependencies {
            if let Some(at) = dfs_cycle(dep.as_str(), by_id, visited) {
                return Some(at);
            }
        }
    }
    visited.insert(id, 2);
    None
}

/// Progress of one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Waiting on dependencies.
    Pending,
    /// Its task has been dispatched.
    Running,
    /// Its task completed.
    Completed,
    /// Its task failed, or dispatch did.
    Failed,
}

/// Progress of a whole workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Some nodes are still open.
    Running,
    /// Every node completed.
    Completed,
    /// A node failed.
    Failed,
}

impl WorkflowStatus {
    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Running => "running",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
        }
    }
}

/// Progress of one node within a [`WorkflowRecord`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeState {
    /// Node id.
    pub id: String,
    /// Current progress.
    pub status: NodeStatus,
    /// Task dispatched for the node.
    pub task_id: Option<String>,
    /// Worker the task went to.
    pub target: Option<String>,
    /// When the task was dispatched.
    pub started_at: Option<i64>,
    /// When the node finished.
    pub completed_at: Option<i64>,
    /// Status of the worker's result.
    pub result_status: Option<TaskResultStatus>,
    /// Why the node failed.
    pub error: Option<String>,
}

/// Everything the engine tracks for one workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRecord {
    /// Workflow id.
    pub workflow_id: String,
    /// Overall progress.
    pub status: WorkflowStatus,
    /// Start time in epoch milliseconds.
    pub created_at: i64,
    /// Last mutation time.
    pub updated_at: i64,
    /// When the workflow finished, either way.
    pub completed_at: Option<i64>,
    /// First node that failed.
    pub failed_node_id: Option<String>,
    /// Append-only event log.
    pub history: Vec<HistoryEntry>,
    /// The validated definition.
    pub workflow: WorkflowDefinition,
    /// Per-node progress, keyed by node id.
    pub nodes: BTreeMap<String, NodeState>,
}

impl WorkflowRecord {
    fn new(workflow: WorkflowDefinition, created_at: i64) -> Self {
        let nodes = workflow
            .nodes
            .iter()
            .map(|node| {
                (
                    node.id.clone(),
                    NodeState {
                        id: node.id.clone(),
                        status: NodeStatus::Pending,
                        task_id: None,
                        target: node.target.clone(),
                        started_at: None,
                        completed_at: None,
                        result_status: None,
                        error: None,
                    },
                )
            })
            .collect();
        Self {
            workflow_id: workflow.id.clone(),
            status: WorkflowStatus::Running,
            created_at,
            updated_at: created_at,
            completed_at: None,
            failed_node_id: None,
            history: vec![HistoryEntry::new(created_at, "workflow_created")],
            workflow,
            nodes,
        }
    }

    fn node_status(&self, node_id: &str) -> Option<NodeStatus> {
        self.nodes.get(node_id).map(|n| n.status)
    }

    fn is_ready(&self, node: &WorkflowNode) -> bool {
        self.node_status(&node.id) == Some(NodeStatus::Pending)
            && node
                .dependencies
                .iter()
                .all(|dep| self.node_status(dep) == Some(NodeStatus::Completed))
    }

    fn all_completed(&self) -> bool {
        self.nodes.values().all(|n| n.status == NodeStatus::Completed)
    }

    fn fail(&mut self, node_id: &str, at: i64) {
        self.status = WorkflowStatus::Failed;
        self.failed_node_id = Some(node_id.to_string());
        self.updated_at = at;
        self.completed_at = Some(at);
    }
}

/// Workflow counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowMetrics {
    /// Workflows tracked.
    pub total: usize,
    /// Still running.
    pub running: usize,
    /// Finished successfully.
    pub completed: usize,
    /// Stopped on a failed node.
    pub failed: usize,
}

#[derive(Default)]
struct EngineState {
    workflows: BTreeMap<String, WorkflowRecord>,
    /// task id → (workflow id, node id)
    task_index: HashMap<String, (String, String)>,
}

/// Runs workflows on top of a task dispatcher.
pub struct WorkflowEngine {
    dispatcher: Arc<dyn TaskDispatcher>,
    clock: Arc<dyn Clock>,
    state: Mutex<EngineState>,
}

impl WorkflowEngine {
    /// An engine dispatching through `dispatcher`.
    pub fn new(dispatcher: Arc<dyn TaskDispatcher>) -> Self {
        Self {
            dispatcher,
            clock: Arc::new(SystemClock),
            state: Mutex::new(EngineState::default()),
        }
    }

    /// Use `clock` for every timestamp.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Validate, register and dispatch the first wave of `definition`.
    ///
    /// An invalid definition is rejected before anything is dispatched. A
    /// dispatch error does not fail the call; it fails the workflow, which is
    /// returned with `failed` status.
    pub async fn start_workflow(&self, definition: WorkflowDefinition) -> SwarmResult<WorkflowRecord> {
        validate_workflow_definition(&definition)?;

        let mut state = self.state.lock().await;
        if state.workflows.contains_key(&definition.id) {
            return Err(SwarmError::WorkflowExists(definition.id));
        }

        let mut record = WorkflowRecord::new(definition, self.clock.now_ms());
        info!(workflow_id = %record.workflow_id, nodes = record.nodes.len(), "Workflow started");
        self.dispatch_ready(&mut record, &mut state.task_index).await;

        let snapshot = record.clone();
        state.workflows.insert(record.workflow_id.clone(), record);
        Ok(snapshot)
    }

    async fn dispatch_ready(&self, record: &mut WorkflowRecord, task_index: &mut HashMap<String, (String, String)>) {
        if record.status != WorkflowStatus::Running {
            return;
        }
        let ready: Vec<WorkflowNode> = record
            .workflow
            .nodes
            .iter()
            .filter(|node| record.is_ready(node))
            .cloned()
            .collect();

        for node in ready {
            self.dispatch_node(record, &node, task_index).await;
            if record.status == WorkflowStatus::Failed {
                return;
            }
        }
    }

    async fn dispatch_node(
        &self,
        record: &mut WorkflowRecord,
        node: &WorkflowNode,
        task_index: &mut HashMap<String, (String, String)>,
    ) {
        let mut context = node.context.clone().unwrap_or_default();
        if let Some(capabilities) = &node.required_capabilities {
            context.insert("requiredCapabilities".into(), json!(capabilities));
        }
        context.insert(
            "workflow".into(),
            json!({ "workflowId": record.workflow_id, "nodeId": node.id }),
        );

        let mut options = DispatchOptions::new(node.task.clone())
            .with_priority(node.priority)
            .with_context(context);
        options.target = node.target.clone();
        options.timeout_ms = node.timeout_ms;
        options.max_retries = node.max_retries;

        let outcome = self.dispatcher.dispatch(options).await;
        let at = self.clock.now_ms();
        let Some(state) = record.nodes.get_mut(&node.id) else {
            return;
        };

        match outcome {
            Ok(task) => {
                state.status = NodeStatus::Running;
                state.task_id = Some(task.task_id.clone());
                state.target = Some(task.target.clone());
                state.started_at = Some(at);
                record.updated_at = at;
                record.history.push(
                    HistoryEntry::new(at, "node_dispatched")
                        .with("nodeId", node.id.as_str())
                        .with("taskId", task.task_id.as_str()),
                );
                task_index.insert(task.task_id, (record.workflow_id.clone(), node.id.clone()));
                info!(workflow_id = %record.workflow_id, node_id = %node.id, target = %task.target, "Workflow node dispatched");
            }
            Err(e) => {
                let message = e.to_string();
                state.status = NodeStatus::Failed;
                state.error = Some(message.clone());
                record.fail(&node.id, at);
                record.history.push(
                    HistoryEntry::new(at, "node_dispatch_failed")
                        .with("nodeId", node.id.as_str())
                        .with("error", Value::String(message.clone())),
                );
                warn!(workflow_id = %record.workflow_id, node_id = %node.id, error = %message, "Workflow node dispatch failed");
            }
        }
    }

    /// Advance the workflow that owns `result.task_id`.
    ///
    /// Returns `false` when the task belongs to no running node of a running
    /// workflow. Results are not forwarded to the orchestrator; callers feed
    /// both.
    pub async fn ingest_result(&self, result: &TaskResult) -> SwarmResult<bool> {
        result.validate()?;
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let Some((workflow_id, node_id)) = state.task_index.get(&result.task_id).cloned() else {
            return Ok(false);
        };
        let Some(record) = state.workflows.get_mut(&workflow_id) else {
            return Ok(false);
        };
        if record.status != WorkflowStatus::Running {
            return Ok(false);
        }
        let at = result.completed_at;
        let Some(node) = record.nodes.get_mut(&node_id) else {
            return Ok(false);
        };
        if node.status != NodeStatus::Running {
            return Ok(false);
        }

        node.completed_at = Some(at);
        node.result_status = Some(result.status);
        record.updated_at = at;

        if result.status == TaskResultStatus::Failure {
            node.status = NodeStatus::Failed;
            record.fail(&node_id, at);
            record.history.push(
                HistoryEntry::new(at, "node_failed")
                    .with("nodeId", node_id.as_str())
                    .with("taskId", result.task_id.as_str()),
            );
            warn!(workflow_id = %workflow_id, node_id = %node_id, "Workflow failed");
            return Ok(true);
        }

        node.status = NodeStatus::Completed;
        record.history.push(
            HistoryEntry::new(at, "node_completed")
                .with("nodeId", node_id.as_str())
                .with("taskId", result.task_id.as_str())
                .with("resultStatus", result.status.as_str()),
        );

        if record.all_completed() {
            record.status = WorkflowStatus::Completed;
            record.completed_at = Some(at);
            record.history.push(HistoryEntry::new(at, "workflow_completed"));
            info!(workflow_id = %workflow_id, "Workflow completed");
            return Ok(true);
        }

        self.dispatch_ready(record, &mut state.task_index).await;
        Ok(true)
    }

    /// Snapshot of one workflow.
    pub async fn get_workflow(&self, workflow_id: &str) -> Option<WorkflowRecord> {
        self.state.lock().await.workflows.get(workflow_id).cloned()
    }

    /// Workflows, optionally only those with `status`, ordered by id.
    pub async fn list_workflows(&self, status: Option<WorkflowStatus>) -> Vec<WorkflowRecord> {
        self.state
            .lock()
            .await
            .workflows
            .values()
            .filter(|w| status.map_or(true, |s| w.status == s))
            .cloned()
            .collect()
    }

    /// Counts over all tracked workflows.
    pub async fn metrics(&self) -> WorkflowMetrics {
        let state = self.state.lock().await;
        let mut metrics = WorkflowMetrics {
            total: state.workflows.len(),
            ..WorkflowMetrics::default()
        };
        for record in state.workflows.values() {
            match record.status {
                WorkflowStatus::Running => metrics.running += 1,
                WorkflowStatus::Completed => metrics.completed += 1,
                WorkflowStatus::Failed => metrics.failed += 1,
            }
        }
        metrics
    }
}
