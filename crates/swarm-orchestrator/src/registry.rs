//! Worker registry fed by heartbeats, and the router adapter that lets the
//! orchestrator pick targets from it.

use crate::router::{AgentSnapshot, AgentStatus, BenchmarkStats, RouteDecision, TaskRouter};
use crate::types::{RouteOutcome, RouteResolver};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use swarm_core::{Clock, SwarmError, SwarmResult, SystemClock, TaskRequest};
use tracing::{debug, info};

/// Periodic liveness report from a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    /// Worker id.
    pub from: String,
    /// Self-reported status.
    pub status: AgentStatus,
    /// Reported load, when the worker sends one.
    #[serde(default)]
    pub load: Option<f64>,
    /// Report time in epoch milliseconds.
    pub timestamp: i64,
}

impl Heartbeat {
    /// A heartbeat without load.
    pub fn new(from: impl Into<String>, status: AgentStatus, timestamp: i64) -> Self {
        Self {
            from: from.into(),
            status,
            load: None,
            timestamp,
        }
    }

    /// Attach a load reading.
    pub fn with_load(mut self, load: f64) -> Self {
        self.load = Some(load);
        self
    }

    /// Reject empty senders, negative timestamps and non-finite load.
    pub fn validate(&self) -> SwarmResult<()> {
        if self.from.trim().is_empty() {
            return Err(SwarmError::validation("heartbeat from must be a non-empty string"));
        }
        if self.timestamp < 0 {
            return Err(SwarmError::validation("heartbeat timestamp must be non-negative"));
        }
        if self.load.is_some_and(|l| !l.is_finite()) {
            return Err(SwarmError::validation("heartbeat load must be finite"));
        }
        Ok(())
    }
}

/// Health counters over all registered workers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryHealth {
    /// Registered workers.
    pub total: usize,
    /// Fresh and idle or busy.
    pub healthy: usize,
    /// Workers whose last heartbeat is older than `max_staleness_ms`.
    pub stale: usize,
    /// Worker count per status.
    pub by_status: BTreeMap<String, usize>,
}

/// Source of worker snapshots for routing.
pub trait AgentRegistry: Send + Sync {
    /// Current view of every known worker.
    fn snapshots(&self) -> Vec<AgentSnapshot>;
}

fn normalize_capabilities(capabilities: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for capability in capabilities {
        let trimmed = capability.trim();
        if !trimmed.is_empty() && !out.iter().any(|c| c == trimmed) {
            out.push(trimmed.to_string());
        }
    }
    out
}

fn default_max_staleness_ms() -> i64 {
    60_000
}

/// In-memory [`AgentRegistry`] keyed by worker id.
pub struct StaticAgentRegistry {
    agents: RwLock<HashMap<String, AgentSnapshot>>,
    max_staleness_ms: i64,
    clock: Arc<dyn Clock>,
}

impl Default for StaticAgentRegistry {
    fn default() -> Self {
        Self::new(default_max_staleness_ms())
    }
}

impl StaticAgentRegistry {
    /// Workers whose heartbeat is older than `max_staleness_ms` count as stale.
    pub fn new(max_staleness_ms: i64) -> Self {
        let max_staleness_ms = if max_staleness_ms > 0 {
            max_staleness_ms
        } else {
            default_max_staleness_ms()
        };
        Self {
            agents: RwLock::new(HashMap::new()),
            max_staleness_ms,
            clock: Arc::new(SystemClock),
        }
    }

    /// Use `clock` for staleness checks.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Seed with fixed snapshots, e.g. loaded from a file.
    pub fn with_agents(self, agents: Vec<AgentSnapshot>) -> Self {
        {
            let mut map = self.agents.write();
            for agent in agents {
                map.insert(agent.id.clone(), agent);
            }
        }
        self
    }

    /// Record a heartbeat. Capabilities and benchmark stats are kept from the
    /// previous snapshot unless `capabilities` replaces them.
    pub fn ingest_heartbeat(
        &self,
        heartbeat: Heartbeat,
        capabilities: Option<Vec<String>>,
    ) -> SwarmResult<AgentSnapshot> {
        heartbeat.validate()?;
        let mut agents = self.agents.write();
        let existing = agents.get(&heartbeat.from);
        let capabilities = match capabilities {
            Some(caps) => normalize_capabilities(caps),
            None => existing.map(|a| a.capabilities.clone()).unwrap_or_default(),
        };
        let snapshot = AgentSnapshot {
            id: heartbeat.from.clone(),
            status: heartbeat.status,
            load: heartbeat.load.unwrap_or(0.0),
            capabilities,
            timestamp: heartbeat.timestamp,
            benchmark: existing.and_then(|a| a.benchmark.clone()),
        };
        debug!(agent_id = %snapshot.id, status = %snapshot.status.as_str(), load = snapshot.load, "Heartbeat");
        agents.insert(heartbeat.from, snapshot.clone());
        Ok(snapshot)
    }

    /// Replace a worker's capabilities. An unknown worker is registered as
    /// offline and fully loaded until its first heartbeat.
    pub fn update_capabilities(&self, agent_id: &str, capabilities: Vec<String>) -> AgentSnapshot {
        let now = self.clock.now_ms();
        let mut agents = self.agents.write();
        let entry = agents
            .entry(agent_id.to_string())
            .or_insert_with(|| AgentSnapshot::new(agent_id, AgentStatus::Offline, 1.0, now));
        entry.capabilities = normalize_capabilities(capabilities);
        entry.clone()
    }

    /// Attach benchmark stats to a known worker.
    pub fn update_benchmark(&self, agent_id: &str, benchmark: BenchmarkStats) -> Option<AgentSnapshot> {
        let mut agents = self.agents.write();
        let entry = agents.get_mut(agent_id)?;
        entry.benchmark = Some(benchmark);
        Some(entry.clone())
    }

    /// Snapshot of one worker.
    pub fn get_agent(&self, agent_id: &str) -> Option<AgentSnapshot> {
        self.agents.read().get(agent_id).cloned()
    }

    /// All workers, sorted by id.
    pub fn list_agents(&self) -> Vec<AgentSnapshot> {
        let mut agents: Vec<AgentSnapshot> = self.agents.read().values().cloned().collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        agents
    }

    fn is_stale(&self, agent: &AgentSnapshot, now_ms: i64) -> bool {
        now_ms - agent.timestamp > self.max_staleness_ms
    }

    /// Forget workers whose last heartbeat is stale. Returns how many were removed.
    pub fn prune_stale(&self, now_ms: i64) -> usize {
        let mut agents = self.agents.write();
        let before = agents.len();
        agents.retain(|_, agent| now_ms - agent.timestamp <= self.max_staleness_ms);
        let removed = before - agents.len();
        if removed > 0 {
            info!(removed, "Pruned stale agents");
        }
        removed
    }

    /// Counters as of `now_ms`.
    pub fn health_summary(&self, now_ms: i64) -> RegistryHealth {
        let agents = self.agents.read();
        let mut health = RegistryHealth {
            total: agents.len(),
            ..RegistryHealth::default()
        };
        for agent in agents.values() {
            *health
                .by_status
                .entry(agent.status.as_str().to_string())
                .or_insert(0) += 1;
            if self.is_stale(agent, now_ms) {
                health.stale += 1;
            } else if agent.status.is_healthy() {
                health.healthy += 1;
            }
        }
        health
    }
}

impl AgentRegistry for StaticAgentRegistry {
    fn snapshots(&self) -> Vec<AgentSnapshot> {
        self.list_agents()
    }
}

/// Routes untargeted requests to the best worker of a registry.
pub struct RegistryRouter {
    registry: Arc<dyn AgentRegistry>,
    router: TaskRouter,
    clock: Arc<dyn Clock>,
}

impl RegistryRouter {
    /// Route over the workers `registry` knows about.
    pub fn new(registry: Arc<dyn AgentRegistry>, router: TaskRouter) -> Self {
        Self {
            registry,
            router,
            clock: Arc::new(SystemClock),
        }
    }

    /// Use `clock` as the routing time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Full routing decision against the registry's current snapshots.
    pub fn route(&self, request: &TaskRequest) -> SwarmResult<RouteDecision> {
        self.router
            .route(request, &self.registry.snapshots(), self.clock.now_ms())
    }
}

#[async_trait]
impl RouteResolver for RegistryRouter {
    async fn resolve(&self, draft: &TaskRequest) -> SwarmResult<RouteOutcome> {
        let (selected, ranked) = self
            .router
            .select(draft, &self.registry.snapshots(), self.clock.now_ms());
        Ok(match selected {
            Some(selected_agent_id) => {
                debug!(task_id = %draft.id(), agent_id = %selected_agent_id, "Routed task");
                RouteOutcome::Selection { selected_agent_id }
            }
            None => {
                debug!(task_id = %draft.id(), candidates = ranked.len(), "No eligible agent");
                RouteOutcome::Unroutable
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use swarm_core::{ManualClock, TaskRequestDraft};

    fn registry() -> StaticAgentRegistry {
        StaticAgentRegistry::new(1_000).with_clock(Arc::new(ManualClock::new(5_000)))
    }

    #[test]
    fn test_heartbeat_keeps_capabilities() {
        let reg = registry();
        reg.ingest_heartbeat(
            Heartbeat::new("w1", AgentStatus::Idle, 100),
            Some(vec![" search ".into(), "search".into(), "".into(), "code".into()]),
        )
        .unwrap();
        let snap = reg
            .ingest_heartbeat(Heartbeat::new("w1", AgentStatus::Busy, 200).with_load(0.7), None)
            .unwrap();
        assert_eq!(snap.capabilities, vec!["search", "code"]);
        assert_eq!(snap.status, AgentStatus::Busy);
        assert_eq!(snap.load, 0.7);
        assert_eq!(snap.timestamp, 200);
    }

    #[test]
    fn test_invalid_heartbeat_is_rejected() {
        let reg = registry();
        assert!(reg.ingest_heartbeat(Heartbeat::new(" ", AgentStatus::Idle, 1), None).is_err());
        assert!(reg
            .ingest_heartbeat(Heartbeat::new("w", AgentStatus::Idle, 1).with_load(f64::NAN), None)
            .is_err());
        assert!(reg.list_agents().is_empty());
    }

    #[test]
    fn test_update_capabilities_registers_offline_agent() {
        let reg = registry();
        let snap = reg.update_capabilities("w9", vec!["deploy".into()]);
        assert_eq!(snap.status, AgentStatus::Offline);
        assert_eq!(snap.load, 1.0);
        assert_eq!(snap.timestamp, 5_000);
        assert!(reg.update_benchmark("ghost", BenchmarkStats::default()).is_none());
    }

    #[test]
    fn test_prune_and_health() {
        let reg = registry();
        reg.ingest_heartbeat(Heartbeat::new("fresh", AgentStatus::Idle, 4_500), None)
            .unwrap();
        reg.ingest_heartbeat(Heartbeat::new("down", AgentStatus::Error, 4_900), None)
            .unwrap();
        reg.ingest_heartbeat(Heartbeat::new("old", AgentStatus::Busy, 1_000), None)
            .unwrap();

        let health = reg.health_summary(5_000);
        assert_eq!(health.total, 3);
        assert_eq!(health.healthy, 1);
        assert_eq!(health.stale, 1);
        assert_eq!(health.by_status.get("busy"), Some(&1));

        assert_eq!(reg.prune_stale(5_000), 1);
        let ids: Vec<String> = reg.list_agents().into_iter().map(|a| a.id).collect();
        assert_eq!(ids, vec!["down", "fresh"]);
    }

    #[tokio::test]
    async fn test_registry_router_selects_capable_agent() {
        let clock = Arc::new(ManualClock::new(5_000));
        let reg = Arc::new(registry().with_agents(vec![
            AgentSnapshot::new("plain", AgentStatus::Idle, 0.0, 4_900),
            AgentSnapshot::new("searcher", AgentStatus::Busy, 0.5, 4_900).with_capabilities(["search"]),
        ]));
        let router = RegistryRouter::new(reg, TaskRouter::default()).with_clock(clock);

        let request = TaskRequestDraft::new("swarm:orchestrator", "find papers")
            .with_context_value("requiredCapabilities", json!(["search"]))
            .build()
            .unwrap();
        let outcome = router.resolve(&request).await.unwrap();
        assert_eq!(outcome.target(), Some("searcher"));

        let impossible = TaskRequestDraft::new("swarm:orchestrator", "fly")
            .with_context_value("requiredCapabilities", json!(["wings"]))
            .build()
            .unwrap();
        assert_eq!(router.resolve(&impossible).await.unwrap(), RouteOutcome::Unroutable);

        let decision = router.route(&request).unwrap();
        assert!(decision.routed);
        assert_eq!(decision.task_request.target(), Some("searcher"));
    }
}
