//! Stateless scoring router.
//!
//! Given a task request and worker snapshots, [`TaskRouter`] filters out
//! ineligible workers, scores the rest and returns them ranked best first.
//! The result depends only on its inputs and the `now_ms` passed in.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use swarm_core::{normalize_string_list, SwarmResult, TaskPriority, TaskRequest};

/// Worker health as last reported by heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    /// Ready for work.
    Idle,
    /// Working, may take more.
    Busy,
    /// Reporting an error; never routed to.
    Error,
    /// Gone; never routed to.
    Offline,
}

impl AgentStatus {
    /// Lowercase wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Idle => "idle",
            AgentStatus::Busy => "busy",
            AgentStatus::Error => "error",
            AgentStatus::Offline => "offline",
        }
    }

    /// Only idle and busy workers may receive work.
    pub fn is_healthy(&self) -> bool {
        matches!(self, AgentStatus::Idle | AgentStatus::Busy)
    }

    fn rank(&self) -> u8 {
        match self {
            AgentStatus::Idle => 2,
            AgentStatus::Busy => 1,
            _ => 0,
        }
    }
}

/// Observed performance of a worker. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BenchmarkStats {
    /// Number of observations behind the rates.
    pub samples: Option<f64>,
    /// Share of tasks that succeeded.
    pub success_rate: Option<f64>,
    /// Share of tasks that timed out.
    pub timeout_rate: Option<f64>,
    /// Share of tasks that failed.
    pub failure_rate: Option<f64>,
    /// Mean latency.
    pub avg_latency_ms: Option<f64>,
    /// 95th percentile latency.
    pub p95_latency_ms: Option<f64>,
}

impl BenchmarkStats {
    fn normalized(&self) -> Self {
        let finite = |v: Option<f64>| v.filter(|x| x.is_finite());
        let rate = |v: Option<f64>| finite(v).map(|x| x.clamp(0.0, 1.0));
        let non_negative = |v: Option<f64>| finite(v).map(|x| x.max(0.0));
        Self {
            samples: non_negative(self.samples),
            success_rate: rate(self.success_rate),
            timeout_rate: rate(self.timeout_rate),
            failure_rate: rate(self.failure_rate),
            avg_latency_ms: non_negative(self.avg_latency_ms),
            p95_latency_ms: non_negative(self.p95_latency_ms),
        }
    }

    fn has_any(&self) -> bool {
        self.samples.is_some()
            || self.success_rate.is_some()
            || self.timeout_rate.is_some()
            || self.failure_rate.is_some()
            || self.avg_latency_ms.is_some()
            || self.p95_latency_ms.is_some()
    }
}

/// Point-in-time view of one worker, supplied by a registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSnapshot {
    /// Worker id.
    pub id: String,
    /// Reported status.
    pub status: AgentStatus,
    /// Load in `[0, 1]`; `0.5` when unreported.
    #[serde(default = "default_load")]
    pub load: f64,
    /// Capabilities the worker advertises.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Last heartbeat, ms since epoch.
    pub timestamp: i64,
    /// Performance stats, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub benchmark: Option<BenchmarkStats>,
}

fn default_load() -> f64 {
    0.5
}

impl AgentSnapshot {
    /// Snapshot with no capabilities and no benchmark stats.
    pub fn new(id: impl Into<String>, status: AgentStatus, load: f64, timestamp: i64) -> Self {
        Self {
            id: id.into(),
            status,
            load,
            capabilities: Vec::new(),
            timestamp,
            benchmark: None,
        }
    }

    /// Replace the advertised capabilities.
    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    /// Attach performance stats.
    pub fn with_benchmark(mut self, benchmark: BenchmarkStats) -> Self {
        self.benchmark = Some(benchmark);
        self
    }

    fn normalized_capabilities(&self) -> Vec<String> {
        let values: Vec<serde_json::Value> = self
            .capabilities
            .iter()
            .map(|c| serde_json::Value::String(c.clone()))
            .collect();
        normalize_string_list(Some(&serde_json::Value::Array(values)))
    }

    fn clamped_load(&self) -> f64 {
        if self.load.is_finite() {
            self.load.clamp(0.0, 1.0)
        } else {
            0.5
        }
    }
}

fn default_min_success_rate() -> f64 {
    0.6
}
fn default_max_timeout_rate() -> f64 {
    0.3
}
fn default_max_failure_rate() -> f64 {
    0.3
}
fn default_max_avg_latency_ms() -> f64 {
    400.0
}
fn default_max_p95_latency_ms() -> f64 {
    700.0
}

/// Reference values a worker's benchmark is measured against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkThresholds {
    /// Success rate above this adds to the score, below it subtracts.
    #[serde(default = "default_min_success_rate")]
    pub min_success_rate: f64,
    /// Timeout rate above this lowers the score.
    #[serde(default = "default_max_timeout_rate")]
    pub max_timeout_rate: f64,
    /// Failure rate above this lowers the score.
    #[serde(default = "default_max_failure_rate")]
    pub max_failure_rate: f64,
    /// Mean latency above this lowers the score.
    #[serde(default = "default_max_avg_latency_ms")]
    pub max_avg_latency_ms: f64,
    /// p95 latency above this lowers the score.
    #[serde(default = "default_max_p95_latency_ms")]
    pub max_p95_latency_ms: f64,
}

impl Default for BenchmarkThresholds {
    fn default() -> Self {
        Self {
            min_success_rate: default_min_success_rate(),
            max_timeout_rate: default_max_timeout_rate(),
            max_failure_rate: default_max_failure_rate(),
            max_avg_latency_ms: default_max_avg_latency_ms(),
            max_p95_latency_ms: default_max_p95_latency_ms(),
        }
    }
}

fn default_success_weight() -> f64 {
    24.0
}
fn default_timeout_weight() -> f64 {
    14.0
}
fn default_failure_weight() -> f64 {
    12.0
}
fn default_avg_latency_weight() -> f64 {
    10.0
}
fn default_p95_latency_weight() -> f64 {
    6.0
}

/// Score points per unit of deviation from each threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkWeights {
    /// Weight of the success rate term.
    #[serde(default = "default_success_weight")]
    pub success_rate: f64,
    /// Weight of the timeout rate term.
    #[serde(default = "default_timeout_weight")]
    pub timeout_rate: f64,
    /// Weight of the failure rate term.
    #[serde(default = "default_failure_weight")]
    pub failure_rate: f64,
    /// Weight of the mean latency term.
    #[serde(default = "default_avg_latency_weight")]
    pub avg_latency_ms: f64,
    /// Weight of the p95 latency term.
    #[serde(default = "default_p95_latency_weight")]
    pub p95_latency_ms: f64,
}

impl Default for BenchmarkWeights {
    fn default() -> Self {
        Self {
            success_rate: default_success_weight(),
            timeout_rate: default_timeout_weight(),
            failure_rate: default_failure_weight(),
            avg_latency_ms: default_avg_latency_weight(),
            p95_latency_ms: default_p95_latency_weight(),
        }
    }
}

fn default_max_staleness_ms() -> i64 {
    60_000
}
fn default_max_future_skew_ms() -> i64 {
    5_000
}
fn default_min_samples() -> f64 {
    20.0
}

/// Router configuration (`[router]` in `swarm.toml`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Heartbeats older than this make a worker ineligible.
    #[serde(default = "default_max_staleness_ms")]
    pub max_staleness_ms: i64,
    /// Tolerated clock skew for heartbeats from the future.
    #[serde(default = "default_max_future_skew_ms")]
    pub max_future_skew_ms: i64,
    /// Sample count at which benchmark stats get full weight.
    #[serde(default = "default_min_samples")]
    pub min_samples_for_full_confidence: f64,
    /// Benchmark reference values.
    #[serde(default)]
    pub benchmark_thresholds: BenchmarkThresholds,
    /// Benchmark score weights.
    #[serde(default)]
    pub benchmark_weights: BenchmarkWeights,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_staleness_ms: default_max_staleness_ms(),
            max_future_skew_ms: default_max_future_skew_ms(),
            min_samples_for_full_confidence: default_min_samples(),
            benchmark_thresholds: BenchmarkThresholds::default(),
            benchmark_weights: BenchmarkWeights::default(),
        }
    }
}

/// One worker's evaluation for a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedAgent {
    /// Worker id.
    pub agent_id: String,
    /// Reported status.
    pub status: AgentStatus,
    /// Load used for scoring.
    pub load: f64,
    /// Normalized capabilities.
    pub capabilities: Vec<String>,
    /// Whether the worker could take the task.
    pub eligible: bool,
    /// `-inf` for ineligible workers (serialized as `null`).
    pub score: f64,
    /// `ok`, `status_<x>`, `stale_heartbeat`, `invalid_heartbeat` or `missing_capabilities`.
    pub reason: String,
    /// Required capabilities the worker lacks.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_capabilities: Vec<String>,
    /// Weight given to the benchmark stats.
    pub benchmark_confidence: f64,
    /// Score points added or removed by benchmark stats.
    pub benchmark_adjustment: f64,
    /// Age of the last heartbeat; `None` for ineligible workers.
    #[serde(default)]
    pub heartbeat_staleness_ms: Option<i64>,
}

/// Outcome of [`TaskRouter::route`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteDecision {
    /// True when a worker was selected.
    pub routed: bool,
    /// Chosen worker.
    pub selected_agent_id: Option<String>,
    /// Every worker, best first.
    pub ranked: Vec<RankedAgent>,
    /// The request, addressed to the selected worker when routed.
    pub task_request: TaskRequest,
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

/// Scores and ranks worker snapshots for a request.
#[derive(Debug, Clone, Default)]
pub struct TaskRouter {
    config: RouterConfig,
}

impl TaskRouter {
    /// Create a router with the given thresholds.
    pub fn new(config: RouterConfig) -> Self {
        Self { config }
    }

    /// Current configuration.
    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    fn ineligible(agent: &AgentSnapshot, reason: String, missing: Vec<String>) -> RankedAgent {
        RankedAgent {
            agent_id: agent.id.trim().to_string(),
            status: agent.status,
            load: agent.load,
            capabilities: agent.normalized_capabilities(),
            eligible: false,
            score: f64::NEG_INFINITY,
            reason,
            missing_capabilities: missing,
            benchmark_confidence: 0.0,
            benchmark_adjustment: 0.0,
            heartbeat_staleness_ms: None,
        }
    }

    fn benchmark_adjustment(&self, stats: Option<&BenchmarkStats>) -> (f64, f64) {
        let Some(stats) = stats.map(BenchmarkStats::normalized).filter(BenchmarkStats::has_any) else {
            return (0.0, 0.0);
        };
        let t = &self.config.benchmark_thresholds;
        let w = &self.config.benchmark_weights;

        let mut adjustment = 0.0;
        if let Some(rate) = stats.success_rate {
            adjustment += (rate - t.min_success_rate) * w.success_rate;
        }
        if let Some(rate) = stats.timeout_rate {
            adjustment += (t.max_timeout_rate - rate) * w.timeout_rate;
        }
        if let Some(rate) = stats.failure_rate {
            adjustment += (t.max_failure_rate - rate) * w.failure_rate;
        }
        if let Some(latency) = stats.avg_latency_ms {
            let delta = (t.max_avg_latency_ms - latency) / t.max_avg_latency_ms;
            adjustment += delta.clamp(-2.0, 2.0) * w.avg_latency_ms;
        }
        if let Some(latency) = stats.p95_latency_ms {
            let delta = (t.max_p95_latency_ms - latency) / t.max_p95_latency_ms;
            adjustment += delta.clamp(-2.0, 2.0) * w.p95_latency_ms;
        }

        let sample_confidence = match stats.samples {
            Some(samples) => (samples / self.config.min_samples_for_full_confidence).clamp(0.0, 1.0),
            None => 0.5,
        };
        let confidence = round4(0.55 + sample_confidence * 0.45);
        (round4(adjustment * confidence), confidence)
    }

    /// Evaluate a single worker against `request`.
    pub fn score(&self, request: &TaskRequest, agent: &AgentSnapshot, now_ms: i64) -> RankedAgent {
        if !agent.status.is_healthy() {
            return Self::ineligible(agent, format!("status_{}", agent.status.as_str()), Vec::new());
        }

        let age_ms = now_ms - agent.timestamp;
        if age_ms > self.config.max_staleness_ms {
            return Self::ineligible(agent, "stale_heartbeat".into(), Vec::new());
        }
        if age_ms < -self.config.max_future_skew_ms {
            return Self::ineligible(agent, "invalid_heartbeat".into(), Vec::new());
        }

        let capabilities = agent.normalized_capabilities();
        let required = request.required_capabilities();
        let missing: Vec<String> = required
            .iter()
            .filter(|c| !capabilities.contains(c))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Self::ineligible(agent, "missing_capabilities".into(), missing);
        }

        let load = agent.clamped_load();
        let mut score = 100.0 - load * 60.0;
        match agent.status {
            AgentStatus::Idle => score += 15.0,
            AgentStatus::Busy => score -= 5.0,
            _ => {}
        }
        score += 20.0 * required.len() as f64;
        match request.priority() {
            TaskPriority::Critical => {
                score += 20.0;
                if load > 0.85 {
                    score -= 25.0;
                }
            }
            TaskPriority::High => score += 10.0,
            TaskPriority::Low => score -= 5.0,
            TaskPriority::Normal => {}
        }

        let (adjustment, confidence) = self.benchmark_adjustment(agent.benchmark.as_ref());
        score += adjustment;

        RankedAgent {
            agent_id: agent.id.trim().to_string(),
            status: agent.status,
            load: agent.load,
            capabilities,
            eligible: true,
            score: round4(score),
            reason: "ok".into(),
            missing_capabilities: Vec::new(),
            benchmark_confidence: confidence,
            benchmark_adjustment: adjustment,
            heartbeat_staleness_ms: Some(age_ms.max(0)),
        }
    }

    /// All workers ranked best first. Ties fall through confidence, status,
    /// load, heartbeat age, capability count, id and finally input order.
    pub fn rank(&self, request: &TaskRequest, agents: &[AgentSnapshot], now_ms: i64) -> Vec<RankedAgent> {
        let mut ranked: Vec<RankedAgent> = agents.iter().map(|a| self.score(request, a, now_ms)).collect();
        ranked.sort_by(compare_ranked);
        ranked
    }

    /// The best eligible worker with a non-empty id, plus the full ranking.
    pub fn select(
        &self,
        request: &TaskRequest,
        agents: &[AgentSnapshot],
        now_ms: i64,
    ) -> (Option<String>, Vec<RankedAgent>) {
        let ranked = self.rank(request, agents, now_ms);
        let best = ranked
            .iter()
            .find(|r| r.eligible && !r.agent_id.is_empty())
            .map(|r| r.agent_id.clone());
        (best, ranked)
    }

    /// Select a worker and address the request to it.
    pub fn route(&self, request: &TaskRequest, agents: &[AgentSnapshot], now_ms: i64) -> SwarmResult<RouteDecision> {
        let (selected, ranked) = self.select(request, agents, now_ms);
        let task_request = match &selected {
            Some(id) => request.retarget(id.clone())?,
            None => request.clone(),
        };
        Ok(RouteDecision {
            routed: selected.is_some(),
            selected_agent_id: selected,
            ranked,
            task_request,
        })
    }
}

fn compare_f64_desc(a: f64, b: f64) -> Ordering {
    b.partial_cmp(&a).unwrap_or(Ordering::Equal)
}

fn compare_ranked(a: &RankedAgent, b: &RankedAgent) -> Ordering {
    b.eligible
        .cmp(&a.eligible)
        .then_with(|| compare_f64_desc(a.score, b.score))
        .then_with(|| compare_f64_desc(a.benchmark_confidence, b.benchmark_confidence))
        .then_with(|| b.status.rank().cmp(&a.status.rank()))
        .then_with(|| a.load.partial_cmp(&b.load).unwrap_or(Ordering::Equal))
        .then_with(|| {
            let sa = a.heartbeat_staleness_ms.unwrap_or(i64::MAX);
            let sb = b.heartbeat_staleness_ms.unwrap_or(i64::MAX);
            sa.cmp(&sb)
        })
        .then_with(|| b.capabilities.len().cmp(&a.capabilities.len()))
        .then_with(|| a.agent_id.cmp(&b.agent_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use swarm_core::TaskRequestDraft;

    const NOW: i64 = 1_000_000;

    fn request(priority: TaskPriority, caps: &[&str]) -> TaskRequest {
        TaskRequestDraft::new("swarm:orchestrator", "index the docs")
            .with_priority(priority)
            .with_context_value("requiredCapabilities", json!(caps))
            .with_created_at(NOW)
            .build()
            .unwrap()
    }

    #[test]
    fn test_scores_follow_formula() {
        let router = TaskRouter::default();
        let req = request(TaskPriority::High, &["search"]);
        let agent = AgentSnapshot::new("a", AgentStatus::Idle, 0.5, NOW - 100).with_capabilities(["search", "code"]);
        let ranked = router.score(&req, &agent, NOW);
        // 100 - 30 + 15 + 20 + 10
        assert!(ranked.eligible);
        assert_eq!(ranked.score, 115.0);
        assert_eq!(ranked.heartbeat_staleness_ms, Some(100));
    }

    #[test]
    fn test_critical_overloaded_penalty() {
        let router = TaskRouter::default();
        let req = request(TaskPriority::Critical, &[]);
        let agent = AgentSnapshot::new("a", AgentStatus::Busy, 0.9, NOW);
        // 100 - 54 - 5 + 20 - 25
        assert_eq!(router.score(&req, &agent, NOW).score, 36.0);
    }

    #[test]
    fn test_ineligible_reasons() {
        let router = TaskRouter::default();
        let req = request(TaskPriority::Normal, &["gpu"]);

        let offline = router.score(&req, &AgentSnapshot::new("o", AgentStatus::Offline, 0.0, NOW), NOW);
        assert_eq!(offline.reason, "status_offline");
        assert_eq!(offline.score, f64::NEG_INFINITY);

        let stale = router.score(&req, &AgentSnapshot::new("s", AgentStatus::Idle, 0.0, NOW - 60_001), NOW);
        assert_eq!(stale.reason, "stale_heartbeat");

        let future = router.score(&req, &AgentSnapshot::new("f", AgentStatus::Idle, 0.0, NOW + 5_001), NOW);
        assert_eq!(future.reason, "invalid_heartbeat");

        let missing = router.score(&req, &AgentSnapshot::new("m", AgentStatus::Idle, 0.0, NOW), NOW);
        assert_eq!(missing.reason, "missing_capabilities");
        assert_eq!(missing.missing_capabilities, vec!["gpu"]);
    }

    #[test]
    fn test_select_prefers_highest_score() {
        let router = TaskRouter::default();
        let req = request(TaskPriority::Normal, &[]);
        let agents = vec![
            AgentSnapshot::new("busy", AgentStatus::Busy, 0.1, NOW),
            AgentSnapshot::new("idle", AgentStatus::Idle, 0.4, NOW),
            AgentSnapshot::new("down", AgentStatus::Error, 0.0, NOW),
        ];
        let (selected, ranked) = router.select(&req, &agents, NOW);
        assert_eq!(selected.as_deref(), Some("idle"));
        assert_eq!(ranked.last().map(|r| r.agent_id.as_str()), Some("down"));
    }

    #[test]
    fn test_ties_break_by_id_then_input_order() {
        let router = TaskRouter::default();
        let req = request(TaskPriority::Normal, &[]);
        let agents = vec![
            AgentSnapshot::new("b", AgentStatus::Idle, 0.2, NOW),
            AgentSnapshot::new("a", AgentStatus::Idle, 0.2, NOW),
        ];
        let ranked = router.rank(&req, &agents, NOW);
        assert_eq!(ranked[0].agent_id, "a");
        assert_eq!(ranked[1].agent_id, "b");
    }

    #[test]
    fn test_blank_id_is_never_selected() {
        let router = TaskRouter::default();
        let req = request(TaskPriority::Normal, &[]);
        let agents = vec![
            AgentSnapshot::new("  ", AgentStatus::Idle, 0.0, NOW),
            AgentSnapshot::new("w", AgentStatus::Busy, 0.9, NOW),
        ];
        let (selected, _) = router.select(&req, &agents, NOW);
        assert_eq!(selected.as_deref(), Some("w"));
    }

    #[test]
    fn test_benchmark_adjusts_score() {
        let router = TaskRouter::default();
        let req = request(TaskPriority::Normal, &[]);
        let good = AgentSnapshot::new("good", AgentStatus::Idle, 0.5, NOW).with_benchmark(BenchmarkStats {
            samples: Some(40.0),
            success_rate: Some(0.9),
            ..BenchmarkStats::default()
        });
        let ranked = router.score(&req, &good, NOW);
        // (0.9 - 0.6) * 24 = 7.2 at full confidence
        assert_eq!(ranked.benchmark_confidence, 1.0);
        assert_eq!(ranked.benchmark_adjustment, 7.2);
        assert_eq!(ranked.score, 92.2);
    }

    #[test]
    fn test_route_retargets_request() {
        let router = TaskRouter::default();
        let req = request(TaskPriority::Normal, &[]);
        let decision = router
            .route(&req, &[AgentSnapshot::new("w1", AgentStatus::Idle, 0.0, NOW)], NOW)
            .unwrap();
        assert!(decision.routed);
        assert_eq!(decision.task_request.target(), Some("w1"));

        let none = router.route(&req, &[], NOW).unwrap();
        assert!(!none.routed);
        assert!(none.selected_agent_id.is_none());
        assert!(none.task_request.target().is_none());
    }
}
