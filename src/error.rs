//! Error taxonomy for the federation control plane.
//!
//! One `thiserror` enum per subsystem, following the taxonomy in the
//! specification (Validation / Topology / Availability / Timeout /
//! Upstream / Aggregate), composed into a crate-level [`FederationError`]
//! via `#[from]`. Non-recoverable errors (validation, cycles) are
//! returned immediately by the component that detected them; recoverable
//! errors (timeouts, upstream failures) are retried by the nearest
//! coordinator before ever reaching a caller as one of these types.

use thiserror::Error;

use crate::types::{AgentId, ClusterId, MigrationId, TaskId};

/// Errors from the generic labelled DAG.
#[derive(Error, Debug)]
pub enum DagError<Id: std::fmt::Debug> {
    #[error("duplicate node id: {0:?}")]
    DuplicateId(Id),
    #[error("missing node id: {0:?}")]
    MissingNode(Id),
    #[error("cycle detected: {0:?}")]
    Cycle(Vec<Id>),
}

/// Errors from [`crate::registry::AgentRegistry`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistryError {
    #[error("duplicate agent id: {0}")]
    DuplicateId(AgentId),
    #[error("agent not found: {0}")]
    NotFound(AgentId),
    #[error("invalid load {0}: must be within [0, 1]")]
    InvalidLoad(f64),
}

/// Errors from [`crate::cluster::ClusterRegistry`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClusterError {
    #[error("duplicate cluster id: {0}")]
    DuplicateId(ClusterId),
    #[error("cluster not found: {0}")]
    NotFound(ClusterId),
    #[error("invalid load {0}: must be within [0, 1]")]
    InvalidLoad(f64),
    #[error("no target cluster available for migration")]
    NoTargetCluster,
}

/// One attempt's failure inside an [`BalancerError::Failover`] aggregate.
#[derive(Debug, Clone)]
pub struct FailoverAttempt {
    pub agent_id: AgentId,
    pub error: String,
}

/// Errors from [`crate::balancer::LoadBalancer`].
#[derive(Error, Debug, Clone)]
pub enum BalancerError {
    #[error("no healthy agent satisfies the selection criteria")]
    NoHealthyAgent,
    #[error("all matching agents have an open circuit breaker")]
    AllBreakersOpen,
    #[error("failover exhausted: {} attempt(s) failed", .0.len())]
    Failover(Vec<FailoverAttempt>),
}

/// Errors from [`crate::resolver::DependencyResolver`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResolverError {
    #[error("dependency {0} does not exist in the task set")]
    MissingDependency(TaskId),
    #[error("cycle detected among tasks: {0:?}")]
    Cycle(Vec<TaskId>),
    #[error("plan exceeds the configured maximum of {max} levels (has {actual})")]
    MaxLevelsExceeded { max: usize, actual: usize },
}

/// Errors from [`crate::engine::ExecutionEngine`].
#[derive(Error, Debug, Clone)]
pub enum EngineError {
    #[error("execution failed at level {level}: {failed} task(s) failed")]
    Execution { level: usize, failed: usize },
    #[error("execution was cancelled")]
    Cancelled,
    #[error("execution exceeded its total timeout")]
    ExecutionTimeout,
    #[error("no agent available for task {0}: {1}")]
    NoMatch(TaskId, String),
}

/// Errors from [`crate::migrator::AgentMigrator`].
#[derive(Error, Debug, Clone)]
pub enum MigrationError {
    #[error("source cluster {0} is unhealthy")]
    SourceUnhealthy(ClusterId),
    #[error("target cluster {0} has no available slots")]
    TargetFull(ClusterId),
    #[error("state export failed: {0}")]
    ExportFailed(String),
    #[error("state transfer failed: {0}")]
    TransferFailed(String),
    #[error("agent start on target failed: {0}")]
    StartFailed(String),
    #[error("post-migration verification failed: {0}")]
    VerifyFailed(String),
    #[error("migration step timed out: {0}")]
    StepTimeout(String),
    #[error("maximum concurrent migrations ({0}) reached")]
    MaxConcurrentMigrations(usize),
    #[error("migration not found: {0}")]
    NotFound(MigrationId),
}

/// Crate-level error composing every subsystem's taxonomy.
#[derive(Error, Debug, Clone)]
pub enum FederationError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Cluster(#[from] ClusterError),
    #[error(transparent)]
    Balancer(#[from] BalancerError),
    #[error(transparent)]
    Resolver(#[from] ResolverError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Migration(#[from] MigrationError),
}

pub type Result<T, E = FederationError> = std::result::Result<T, E>;
