//! `swarm` command-line tool: routes, dispatches and inspects tasks against
//! a file-backed task store, and verifies replay packets and audit chains.

mod outbox;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use outbox::OutboxTransport;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use swarm_core::{AuditSink, Clock, SwarmMessage, SystemClock, TaskContext, TaskPriority, TaskRequest};
use swarm_orchestrator::{
    verify_replay_events, AgentSnapshot, AuditConfig, DispatchOptions, FileTaskStore, RegistryRouter, ReplayEvent,
    RouteResolver, SandboxOrchestrator, StaticAgentRegistry, SwarmConfig, TaskFilter, TaskOrchestrator, TaskRouter,
    TaskStatus,
};
use swarm_security::{
    load_entries, verify_chain, JsonlAuditSink, RuleApprovalPolicy, RuleDispatchPolicy, SignedAuditLog,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "swarm", about = "Swarm dispatch core: routing, task lifecycle, workflows and sandbox replay")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "swarm.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the effective configuration as TOML
    Config,
    /// Rank agents for a task request
    Route {
        /// Task request JSON
        #[arg(long)]
        request: PathBuf,
        /// JSON array of agent snapshots
        #[arg(long)]
        agents: PathBuf,
    },
    /// Show the sandbox execution plan for a task request
    Plan {
        #[arg(long)]
        request: PathBuf,
        /// Force a profile instead of the heuristics
        #[arg(long)]
        profile: Option<String>,
    },
    /// Check a workflow definition for structural errors and cycles
    ValidateWorkflow { path: PathBuf },
    /// Verify a replay packet or a bare array of replay events
    VerifyReplay { path: PathBuf },
    /// Verify the HMAC-signed audit chain
    VerifyAudit {
        /// Overrides `audit.signed_log`
        #[arg(long)]
        path: Option<PathBuf>,
    },
    /// Dispatch a task; requests are written to the outbox
    Dispatch {
        #[arg(long)]
        task: String,
        #[arg(long)]
        target: Option<String>,
        #[arg(long)]
        id: Option<String>,
        #[arg(long, default_value = "normal")]
        priority: String,
        /// JSON object used as the request context
        #[arg(long)]
        context: Option<PathBuf>,
        /// Agent snapshots used to route untargeted tasks
        #[arg(long)]
        agents: Option<PathBuf>,
    },
    /// Apply receipts and results from a JSONL file of messages
    Ingest { path: PathBuf },
    /// List stored tasks
    Tasks {
        #[arg(long)]
        status: Option<String>,
        /// Only tasks that are not terminal
        #[arg(long)]
        open: bool,
    },
    /// Run one maintenance pass (deadlines and due retries)
    Maintain {
        /// Epoch milliseconds; defaults to now
        #[arg(long)]
        now: Option<i64>,
    },
    /// Rewrite the task store as a single snapshot
    Compact {
        /// Drop terminal tasks closed before this epoch millisecond first
        #[arg(long)]
        purge_before: Option<i64>,
    },
}

fn read_json(path: &Path) -> anyhow::Result<Value> {
    let text = std::fs::read_to_string(path).with_context(|| format!("Failed to read '{}'", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Invalid JSON in '{}'", path.display()))
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn parse_wire<T: serde::de::DeserializeOwned>(name: &str, value: &str) -> anyhow::Result<T> {
    serde_json::from_value(Value::String(value.to_string())).with_context(|| format!("Unknown {name} '{value}'"))
}

fn load_agents(path: &Path) -> anyhow::Result<Vec<AgentSnapshot>> {
    Ok(serde_json::from_value(read_json(path)?)?)
}

/// Audit sink from config, keeping the JSONL writer around so it can be flushed.
struct AuditHandle {
    sink: Option<Arc<dyn AuditSink>>,
    jsonl: Option<Arc<JsonlAuditSink>>,
}

impl AuditHandle {
    fn from_config(config: &AuditConfig) -> anyhow::Result<Self> {
        if let Some(path) = &config.signed_log {
            let secret = std::env::var(&config.signing_key_env).with_context(|| {
                format!("audit.signed_log is set but ${} is not", config.signing_key_env)
            })?;
            let log = SignedAuditLog::new(secret.into_bytes(), config.key_id.clone()).with_file(path)?;
            return Ok(Self {
                sink: Some(Arc::new(log)),
                jsonl: None,
            });
        }
        if let Some(dir) = &config.log_dir {
            let jsonl = Arc::new(JsonlAuditSink::new(dir.clone()));
            return Ok(Self {
                sink: Some(jsonl.clone()),
                jsonl: Some(jsonl),
            });
        }
        Ok(Self { sink: None, jsonl: None })
    }

    async fn flush(&self) {
        if let Some(jsonl) = &self.jsonl {
            jsonl.flush().await;
        }
    }
}

/// Orchestrator over the configured store, with the outbox as transport.
async fn open_orchestrator(
    config: &SwarmConfig,
    audit: &AuditHandle,
    router: Option<Arc<dyn RouteResolver>>,
) -> anyhow::Result<TaskOrchestrator> {
    let transport = Arc::new(OutboxTransport::new(config.data_dir.join("outbox.jsonl")));
    let mut orchestrator = TaskOrchestrator::new(config.orchestrator.clone(), transport)
        .with_store(Arc::new(FileTaskStore::new(config.task_store_path())));
    if let Some(router) = router {
        orchestrator = orchestrator.with_router(router);
    }
    if let Some(policy) = &config.dispatch_policy {
        orchestrator = orchestrator.with_dispatch_policy(Arc::new(RuleDispatchPolicy::new(policy.clone())?));
    }
    if let Some(policy) = &config.approval_policy {
        orchestrator = orchestrator.with_approval_policy(Arc::new(RuleApprovalPolicy::new(policy.clone())));
    }
    if let Some(sink) = &audit.sink {
        orchestrator = orchestrator.with_audit(sink.clone());
    }
    let loaded = orchestrator.hydrate(true).await?;
    info!(loaded, store = %config.task_store_path().display(), "Task store opened");
    Ok(orchestrator)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .json()
        .init();

    let cli = Cli::parse();

    let config = if cli.config.exists() {
        SwarmConfig::load(&cli.config)?
    } else {
        warn!(path = %cli.config.display(), "Config file not found, using defaults");
        SwarmConfig::default()
    };

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Route { request, agents } => {
            let request = TaskRequest::parse(read_json(&request)?)?;
            let agents = load_agents(&agents)?;
            let router = TaskRouter::new(config.router.clone());
            let decision = router.route(&request, &agents, SystemClock.now_ms())?;
            print_json(&decision)?;
        }
        Commands::Plan { request, profile } => {
            let request = TaskRequest::parse(read_json(&request)?)?;
            let sandbox = SandboxOrchestrator::from_config(&config.sandbox)?;
            let plan = sandbox.plan_execution(&request, profile.as_deref())?;
            print_json(&plan)?;
        }
        Commands::ValidateWorkflow { path } => {
            let definition: swarm_orchestrator::WorkflowDefinition = serde_json::from_value(read_json(&path)?)?;
            swarm_orchestrator::validate_workflow_definition(&definition)?;
            println!("Workflow '{}' is valid ({} nodes)", definition.id, definition.nodes.len());
        }
        Commands::VerifyReplay { path } => {
            let value = read_json(&path)?;
            let events = match value.get("events") {
                Some(events) => events.clone(),
                None => value,
            };
            let events: Vec<ReplayEvent> = serde_json::from_value(events)?;
            let verification = verify_replay_events(&events);
            print_json(&verification)?;
            if !verification.ok {
                bail!(
                    "Replay chain broken at event {}: {}",
                    verification.index.unwrap_or_default(),
                    verification.reason.unwrap_or_default()
                );
            }
        }
        Commands::VerifyAudit { path } => {
            let Some(path) = path.or_else(|| config.audit.signed_log.clone()) else {
                bail!("No signed audit log given and audit.signed_log is not configured");
            };
            let secret = std::env::var(&config.audit.signing_key_env)
                .with_context(|| format!("${} must hold the audit signing key", config.audit.signing_key_env))?;
            let entries = load_entries(&path)?;
            let verification = verify_chain(&entries, secret.as_bytes());
            print_json(&verification)?;
            if !verification.ok {
                bail!(
                    "Audit chain broken at entry {}: {}",
                    verification.failed_at.unwrap_or_default(),
                    verification.reason.unwrap_or_default()
                );
            }
        }
        Commands::Dispatch {
            task,
            target,
            id,
            priority,
            context,
            agents,
        } => {
            let router: Option<Arc<dyn RouteResolver>> = match agents {
                Some(path) => {
                    let registry = StaticAgentRegistry::new(config.router.max_staleness_ms).with_agents(load_agents(&path)?);
                    Some(Arc::new(RegistryRouter::new(
                        Arc::new(registry),
                        TaskRouter::new(config.router.clone()),
                    )))
                }
                None => None,
            };
            let audit = AuditHandle::from_config(&config.audit)?;
            let orchestrator = open_orchestrator(&config, &audit, router).await?;

            let mut options = DispatchOptions::new(task).with_priority(parse_wire::<TaskPriority>("priority", &priority)?);
            if let Some(id) = id {
                options = options.with_id(id);
            }
            if let Some(target) = target {
                options = options.with_target(target);
            }
            if let Some(path) = context {
                let context: TaskContext = serde_json::from_value(read_json(&path)?)
                    .context("Context file must contain a JSON object")?;
                options = options.with_context(context);
            }

            let outcome = orchestrator.dispatch_task(options).await;
            orchestrator.flush().await;
            audit.flush().await;
            print_json(&outcome?)?;
        }
        Commands::Ingest { path } => {
            let audit = AuditHandle::from_config(&config.audit)?;
            let orchestrator = open_orchestrator(&config, &audit, None).await?;
            let text = std::fs::read_to_string(&path).with_context(|| format!("Failed to read '{}'", path.display()))?;

            let (mut applied, mut ignored, mut invalid) = (0usize, 0usize, 0usize);
            for (index, line) in text.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                let outcome = match SwarmMessage::parse_json(line) {
                    Ok(SwarmMessage::TaskReceipt(receipt)) => orchestrator.ingest_receipt(receipt).await,
                    Ok(SwarmMessage::TaskResult(result)) => orchestrator.ingest_result(result).await,
                    Ok(SwarmMessage::TaskRequest(request)) => {
                        warn!(line = index + 1, task_id = %request.id(), "Task requests are not ingested");
                        Ok(false)
                    }
                    Err(e) => Err(e),
                };
                match outcome {
                    Ok(true) => applied += 1,
                    Ok(false) => ignored += 1,
                    Err(e) => {
                        warn!(line = index + 1, error = %e, "Skipping invalid message");
                        invalid += 1;
                    }
                }
            }
            orchestrator.flush().await;
            audit.flush().await;
            print_json(&json!({ "applied": applied, "ignored": ignored, "invalid": invalid }))?;
        }
        Commands::Tasks { status, open } => {
            let audit = AuditHandle { sink: None, jsonl: None };
            let orchestrator = open_orchestrator(&config, &audit, None).await?;
            let mut filter = TaskFilter::default();
            if let Some(status) = status {
                filter = filter.with_status(parse_wire::<TaskStatus>("status", &status)?);
            }
            if open {
                filter = filter.open_only();
            }
            let tasks = orchestrator.list_tasks(&filter).await;
            if tasks.is_empty() {
                println!("No tasks.");
            } else {
                for task in &tasks {
                    println!(
                        "{}  {:<17} {}  attempts={}  {}",
                        task.task_id,
                        task.status.as_str(),
                        task.target,
                        task.attempts,
                        task.request.task()
                    );
                }
                println!("\nTotal: {} task(s)", tasks.len());
            }
        }
        Commands::Maintain { now } => {
            let audit = AuditHandle::from_config(&config.audit)?;
            let orchestrator = open_orchestrator(&config, &audit, None).await?;
            let now = now.unwrap_or_else(|| SystemClock.now_ms());
            let summary = orchestrator.run_maintenance(now).await;
            orchestrator.flush().await;
            audit.flush().await;
            print_json(&summary)?;
        }
        Commands::Compact { purge_before } => {
            let audit = AuditHandle { sink: None, jsonl: None };
            let orchestrator = open_orchestrator(&config, &audit, None).await?;
            let purged = match purge_before {
                Some(before) => orchestrator.purge_closed(before).await,
                None => Vec::new(),
            };
            orchestrator.flush().await;

            let records = orchestrator.list_tasks(&TaskFilter::default()).await;
            FileTaskStore::new(config.task_store_path()).compact(&records).await?;
            info!(kept = records.len(), purged = purged.len(), "Task store compacted");
            print_json(&json!({ "kept": records.len(), "purged": purged }))?;
        }
    }

    Ok(())
}
