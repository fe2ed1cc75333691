//! Collaborator ports the core is built against.
//!
//! The core never opens a socket, starts a process, or renders UI. It
//! takes those capabilities as injected `#[async_trait]` ports and is
//! fully exercisable in tests with in-memory fakes. A `reqwest`-backed
//! reference implementation of the network-facing ports lives behind
//! the `http-adapters` feature in [`crate::adapters::http`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{BalancerError, EngineError};
use crate::types::{Agent, AgentId, Cluster, Subtask, TaskId};

/// Criteria passed to [`AgentSelector::select`], derived by the caller
/// (typically [`crate::balancer::LoadBalancer`] or
/// [`crate::engine::ExecutionEngine`]) from a task's requirements.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SelectionCriteria {
    pub required_skills: Vec<String>,
    pub required_metadata_flags: Vec<String>,
    pub max_cost_per_hour: Option<f64>,
    pub min_reliability: Option<f64>,
    pub exclude_agents: Vec<AgentId>,
}

/// Resolves a [`SelectionCriteria`] to a concrete agent. Implemented by
/// [`crate::balancer::LoadBalancer`] for the engine's own use, and
/// injectable independently for callers that want a different policy.
#[async_trait]
pub trait AgentSelector: Send + Sync {
    async fn select(&self, criteria: &SelectionCriteria) -> Result<Agent, BalancerError>;
}

/// Executes a single subtask on a chosen agent and can cancel a
/// previously dispatched one. The value returned by `execute` is
/// unwrapped by the engine if it is an object containing exactly the
/// key `result`.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, agent_id: &AgentId, subtask: &Subtask) -> Result<Value, EngineError>;
    async fn cancel(&self, task_id: &TaskId) -> bool;
}

/// Outcome of a single health probe, independent of transport.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    Healthy,
    Degraded,
    Failed(String),
}

/// Probes a single agent's `GET /health` endpoint (or equivalent).
/// Implementations report latency via the `Instant` the caller took
/// around the call; the trait itself is latency-agnostic so fakes stay
/// trivial to write.
#[async_trait]
pub trait AgentProbe: Send + Sync {
    async fn probe(&self, agent: &Agent) -> ProbeOutcome;
}

/// Probes a cluster's `GET /health` endpoint.
#[async_trait]
pub trait ClusterProbe: Send + Sync {
    async fn probe(&self, cluster: &Cluster) -> ProbeOutcome;
}

/// Serialized agent runtime state, as produced by `POST
/// /agents/{id}/export` and consumed by `POST /agents/import` and
/// `POST /agents/{id}/start`.
pub type AgentState = Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopMode {
    Graceful,
    Force,
}

/// The agent-endpoint contract the migrator drives: export on the
/// source, import + start on the target, verify, then best-effort
/// stop/cleanup. Every method maps to one HTTP call in the reference
/// adapter; failures are reported as `Err`, except `stop`/`cleanup`
/// which the contract says are best-effort and whose errors the caller
/// ignores.
#[async_trait]
pub trait MigrationTransport: Send + Sync {
    async fn export_state(&self, agent: &Agent) -> Result<AgentState, String>;
    async fn import_state(&self, agent: &Agent, state: &AgentState) -> Result<(), String>;
    async fn start_agent(
        &self,
        agent: &Agent,
        state: Option<&AgentState>,
        resume_from_state: bool,
    ) -> Result<(), String>;
    async fn verify_agent(&self, agent: &Agent) -> Result<(), String>;
    async fn stop_agent(&self, agent: &Agent, mode: StopMode);
    async fn cleanup_agent(&self, agent: &Agent);
}

/// Structured, level-gated logging port. The default implementation
/// delegates to `tracing`; callers embedding this crate in a context
/// with its own logging story can supply their own.
pub trait Logger: Send + Sync {
    fn debug(&self, message: &str);
    fn info(&self, message: &str);
    fn warn(&self, message: &str);
    fn error(&self, message: &str);
}

/// Default [`Logger`] backed by `tracing`'s global subscriber.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn debug(&self, message: &str) {
        tracing::debug!("{message}");
    }

    fn info(&self, message: &str) {
        tracing::info!("{message}");
    }

    fn warn(&self, message: &str) {
        tracing::warn!("{message}");
    }

    fn error(&self, message: &str) {
        tracing::error!("{message}");
    }
}
