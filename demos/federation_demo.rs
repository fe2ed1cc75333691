//! End-to-end walkthrough of the control plane: register agents and
//! clusters, run a dependency-ordered task plan through the execution
//! engine with load-balanced agent selection, then migrate an agent
//! across clusters.
//!
//! Usage:
//!   cargo run --example federation_demo

use std::collections::HashSet;
use std::sync::Arc;

use agent_federation::balancer::LoadBalancer;
use agent_federation::breaker::CircuitBreakerRegistry;
use agent_federation::cluster::ClusterRegistry;
use agent_federation::engine::ExecutionEngine;
use agent_federation::error::EngineError;
use agent_federation::events::EventBus;
use agent_federation::migrator::{AgentMigrator, MigrationOptions};
use agent_federation::ports::{AgentProbe, MigrationTransport, ProbeOutcome, StopMode, TaskExecutor};
use agent_federation::registry::AgentRegistry;
use agent_federation::resolver::DependencyResolver;
use agent_federation::types::{
    Agent, AgentConfig, AgentId, Capabilities, ClusterConfig, Subtask, TaskId, TaskWithDependencies,
};

/// Always-healthy probe, good enough to drive the health checker in a demo.
struct AlwaysHealthy;

#[async_trait::async_trait]
impl AgentProbe for AlwaysHealthy {
    async fn probe(&self, _agent: &Agent) -> ProbeOutcome {
        ProbeOutcome::Healthy
    }
}

/// No-op transport: every step succeeds immediately with empty state.
struct NoopTransport;

#[async_trait::async_trait]
impl MigrationTransport for NoopTransport {
    async fn export_state(&self, _agent: &Agent) -> Result<serde_json::Value, String> {
        Ok(serde_json::json!({}))
    }

    async fn import_state(&self, _agent: &Agent, _state: &serde_json::Value) -> Result<(), String> {
        Ok(())
    }

    async fn start_agent(
        &self,
        _agent: &Agent,
        _state: Option<&serde_json::Value>,
        _resume_from_state: bool,
    ) -> Result<(), String> {
        Ok(())
    }

    async fn verify_agent(&self, _agent: &Agent) -> Result<(), String> {
        Ok(())
    }

    async fn stop_agent(&self, _agent: &Agent, _mode: StopMode) {}

    async fn cleanup_agent(&self, _agent: &Agent) {}
}

/// Executes every subtask by echoing its name back as the result.
struct EchoExecutor;

#[async_trait::async_trait]
impl TaskExecutor for EchoExecutor {
    async fn execute(&self, agent_id: &AgentId, subtask: &Subtask) -> Result<serde_json::Value, EngineError> {
        println!("  agent {agent_id} executing task {}", subtask.name);
        Ok(serde_json::json!({"result": {"task": subtask.name, "agent": agent_id.to_string()}}))
    }

    async fn cancel(&self, _task_id: &TaskId) -> bool {
        true
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let events = EventBus::new(1024);
    let registry = Arc::new(AgentRegistry::new(events.clone()));
    let clusters = Arc::new(ClusterRegistry::new(events.clone()));
    let breakers = Arc::new(CircuitBreakerRegistry::new(events.clone()));

    let primary = clusters.register(ClusterConfig {
        endpoint: "https://primary.example".into(),
        region: "us-east".into(),
        zone: "us-east-1a".into(),
        max_agents: 10,
        ..Default::default()
    })?;
    let secondary = clusters.register(ClusterConfig {
        endpoint: "https://secondary.example".into(),
        region: "us-west".into(),
        zone: "us-west-2a".into(),
        max_agents: 10,
        ..Default::default()
    })?;
    println!("registered clusters {} and {}", primary.id, secondary.id);

    let worker_a = registry.register(AgentConfig {
        capabilities: Capabilities { skills: HashSet::from(["build".to_string()]), ..Default::default() },
        ..Default::default()
    })?;
    let worker_b = registry.register(AgentConfig {
        capabilities: Capabilities { skills: HashSet::from(["build".to_string()]), ..Default::default() },
        ..Default::default()
    })?;
    println!("registered agents {} and {}", worker_a.id, worker_b.id);

    let balancer = Arc::new(LoadBalancer::new(registry.clone(), breakers.clone(), events.clone()));

    let resolver = DependencyResolver::new();
    let fetch = Subtask::new("fetch", "fetch-sources");
    let build = Subtask::new("build", "compile-artifacts");
    let test = Subtask::new("test", "run-tests");
    resolver.build_graph(&[
        TaskWithDependencies::new(fetch, HashSet::new()),
        TaskWithDependencies::new(build, HashSet::from(["fetch".into()])),
        TaskWithDependencies::new(test, HashSet::from(["build".into()])),
    ])?;
    let plan = resolver.get_execution_plan()?;
    println!("execution plan has {} levels, critical path {:?}", plan.levels.len(), plan.critical_path);

    let tasks = vec![
        TaskWithDependencies::new(Subtask::new("fetch", "fetch-sources"), HashSet::new()),
        TaskWithDependencies::new(Subtask::new("build", "compile-artifacts"), HashSet::from(["fetch".into()])),
        TaskWithDependencies::new(Subtask::new("test", "run-tests"), HashSet::from(["build".into()])),
    ];

    let engine = ExecutionEngine::new(balancer.clone(), Arc::new(EchoExecutor), events.clone());
    let outcome = engine.execute(&plan, &tasks).await?;
    println!("completed {} tasks, {} failed", outcome.completed, outcome.failed);

    let probe = Arc::new(AlwaysHealthy);
    let migrator = AgentMigrator::new(
        registry.clone(),
        clusters.clone(),
        Arc::new(NoopTransport),
        probe,
        events.clone(),
    );
    migrator.assign(worker_a.id.clone(), primary.id.clone());
    let migration = migrator
        .migrate(worker_a.id.clone(), primary.id.clone(), secondary.id.clone(), MigrationOptions::default())
        .await?;
    println!("migrated agent {} from {} to {}: {:?}", worker_a.id, primary.id, secondary.id, migration.status);

    let _ = worker_b;
    println!("done");
    Ok(())
}
