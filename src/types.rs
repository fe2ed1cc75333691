//! Core data model shared across the federation control plane.
//!
//! Mirrors specification §3 verbatim: `Agent`, `AgentHealthState`,
//! `CircuitBreakerState`, `Cluster`, `Subtask`/`TaskWithDependencies`,
//! `ExecutionPlan`, `TaskResult`, and `Migration`.

use std::collections::{HashMap, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::metadata::MetadataValue;

/// Opaque identifier for a registered agent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentId(pub String);

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AgentId {
    fn from(value: &str) -> Self {
        AgentId(value.to_string())
    }
}

impl From<String> for AgentId {
    fn from(value: String) -> Self {
        AgentId(value)
    }
}

/// Opaque identifier for a registered cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClusterId(pub String);

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ClusterId {
    fn from(value: &str) -> Self {
        ClusterId(value.to_string())
    }
}

/// Opaque identifier for a task within a dependency graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        TaskId(value.to_string())
    }
}

/// Opaque identifier for a migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MigrationId(pub Uuid);

impl fmt::Display for MigrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl MigrationId {
    pub fn new() -> Self {
        MigrationId(Uuid::new_v4())
    }
}

impl Default for MigrationId {
    fn default() -> Self {
        Self::new()
    }
}

/// Compute runtime tag describing how an agent is hosted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Runtime {
    Process,
    Container,
    Wasm,
    Remote,
    Custom(String),
}

/// Lifecycle status of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AgentStatus {
    Idle,
    Busy,
    Unhealthy,
    Offline,
}

/// Declared skills, languages, and specialties of an agent, plus the
/// scalar attributes the load balancer's weighted strategy consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capabilities {
    pub skills: HashSet<String>,
    pub languages: HashSet<String>,
    pub specialties: HashSet<String>,
    pub cost_per_hour: f64,
    pub avg_speed: f64,
    pub reliability: f64,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            skills: HashSet::new(),
            languages: HashSet::new(),
            specialties: HashSet::new(),
            cost_per_hour: 0.0,
            avg_speed: 0.0,
            reliability: 1.0,
        }
    }
}

impl Capabilities {
    /// Case-folds a skill set into lowercase for matching.
    fn fold(values: &HashSet<String>) -> HashSet<String> {
        values.iter().map(|v| v.to_lowercase()).collect()
    }

    pub fn has_all_skills(&self, required: &[String]) -> bool {
        let owned = Self::fold(&self.skills);
        required.iter().all(|s| owned.contains(&s.to_lowercase()))
    }

    pub fn has_any_skill(&self, required: &[String]) -> bool {
        if required.is_empty() {
            return true;
        }
        let owned = Self::fold(&self.skills);
        required.iter().any(|s| owned.contains(&s.to_lowercase()))
    }
}

/// A registered compute agent. See specification §3 for the invariants:
/// `current_load` stays within `[0, 1]` and every status transition
/// emits exactly one `status_changed` event via the owning registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub runtime: Runtime,
    pub status: AgentStatus,
    pub capabilities: Capabilities,
    pub current_load: f64,
    pub last_heartbeat: DateTime<Utc>,
    pub metadata: HashMap<String, MetadataValue>,
}

/// Registration request consumed by `AgentRegistry::register`.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub id: Option<AgentId>,
    pub runtime: Runtime,
    pub capabilities: Capabilities,
    pub metadata: HashMap<String, MetadataValue>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            id: None,
            runtime: Runtime::Process,
            capabilities: Capabilities::default(),
            metadata: HashMap::new(),
        }
    }
}

/// Classification produced by the health checker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

/// Derived health state for a single agent, consistent with the probe
/// history observed in a monotone window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentHealthState {
    pub status: HealthStatus,
    pub last_check: DateTime<Utc>,
    pub latency_ms: u64,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub total_checks: u64,
    pub total_failures: u64,
}

impl AgentHealthState {
    pub fn unknown(now: DateTime<Utc>) -> Self {
        Self {
            status: HealthStatus::Unknown,
            last_check: now,
            latency_ms: 0,
            consecutive_failures: 0,
            consecutive_successes: 0,
            total_checks: 0,
            total_failures: 0,
        }
    }
}

/// Circuit breaker state machine values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Public snapshot of a single agent's circuit breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub agent_id: AgentId,
    pub state: BreakerState,
    pub windowed_failures: u32,
    pub windowed_successes: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    pub opened_at: Option<DateTime<Utc>>,
}

/// Role of a cluster within the federation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterRole {
    Primary,
    Secondary,
    Standby,
}

/// Boolean capability flags advertised by a cluster.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterCapabilities {
    pub gpu: bool,
    pub large_model: bool,
    pub vision: bool,
    pub audio: bool,
    pub multi_agent: bool,
}

/// Health snapshot of a cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterHealth {
    pub status: HealthStatus,
    pub latency_ms: u64,
    pub last_check_at: DateTime<Utc>,
    pub failure_count: u32,
}

/// Load snapshot of a cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterLoad {
    pub current: f64,
    pub max: f64,
    pub utilization_pct: f64,
    pub queue_depth: u32,
    pub avg_task_latency_ms: u64,
}

impl Default for ClusterLoad {
    fn default() -> Self {
        Self {
            current: 0.0,
            max: 1.0,
            utilization_pct: 0.0,
            queue_depth: 0,
            avg_task_latency_ms: 0,
        }
    }
}

/// A peer cluster in the federation.
///
/// `available_slots` is intentionally a method rather than a stored
/// field: computing it from `max_agents - current_agents` makes the
/// specification's invariant (`current_agents + available_slots ==
/// max_agents`) hold by construction instead of needing to be
/// maintained by every mutator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    pub id: ClusterId,
    pub endpoint: String,
    pub region: String,
    pub zone: String,
    pub role: ClusterRole,
    pub capabilities: ClusterCapabilities,
    pub health: ClusterHealth,
    pub load: ClusterLoad,
    pub max_agents: u32,
    pub current_agents: u32,
    pub routing_weight: f64,
    pub is_active: bool,
    pub is_accepting_traffic: bool,
}

impl Cluster {
    pub fn available_slots(&self) -> u32 {
        self.max_agents.saturating_sub(self.current_agents)
    }
}

/// Registration request consumed by `ClusterRegistry::register`.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub id: Option<ClusterId>,
    pub endpoint: String,
    pub region: String,
    pub zone: String,
    pub role: ClusterRole,
    pub capabilities: ClusterCapabilities,
    pub max_agents: u32,
    pub routing_weight: f64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            id: None,
            endpoint: String::new(),
            region: "default".to_string(),
            zone: "default".to_string(),
            role: ClusterRole::Secondary,
            capabilities: ClusterCapabilities::default(),
            max_agents: 0,
            routing_weight: 1.0,
        }
    }
}

/// Priority level for a subtask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TaskPriority {
    Low,
    Medium,
    High,
    Critical,
}

/// A single unit of work in a task graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtask {
    pub id: TaskId,
    pub name: String,
    pub description: String,
    pub required_skills: Vec<String>,
    pub priority: TaskPriority,
    pub estimated_duration_ms: Option<u64>,
}

impl Subtask {
    pub fn new(id: impl Into<TaskId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            required_skills: Vec::new(),
            priority: TaskPriority::Medium,
            estimated_duration_ms: None,
        }
    }
}

/// A task plus the set of task ids it depends on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskWithDependencies {
    pub id: TaskId,
    pub task: Subtask,
    pub dependencies: HashSet<TaskId>,
}

impl TaskWithDependencies {
    pub fn new(task: Subtask, dependencies: HashSet<TaskId>) -> Self {
        Self {
            id: task.id.clone(),
            task,
            dependencies,
        }
    }
}

/// One parallelisable layer of an execution plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLevel {
    pub level: usize,
    pub tasks: Vec<TaskId>,
}

/// A layered, dependency-respecting schedule over a task set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub levels: Vec<ExecutionLevel>,
    pub critical_path: Vec<TaskId>,
    pub estimated_parallelism: usize,
}

/// Terminal or in-flight status of a task's execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Skipped,
}

/// Outcome of executing a single task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub agent_id: Option<AgentId>,
}

impl TaskResult {
    pub fn pending(task_id: TaskId) -> Self {
        Self {
            task_id,
            status: TaskStatus::Pending,
            result: None,
            error: None,
            started_at: None,
            completed_at: None,
            attempts: 0,
            agent_id: None,
        }
    }
}

/// Migration mode requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationMode {
    Graceful,
    Force,
    ZeroDowntime,
}

/// Lifecycle status of an in-flight or completed migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationStatus {
    Pending,
    Preparing,
    InProgress,
    TransferringState,
    Activating,
    Completed,
    Failed,
    RolledBack,
}

/// A single cross-cluster agent move.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Migration {
    pub id: MigrationId,
    pub agent_id: AgentId,
    pub from_cluster_id: ClusterId,
    pub to_cluster_id: ClusterId,
    pub status: MigrationStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub state_transferred: bool,
    pub retry_count: u32,
    pub error: Option<String>,
}
