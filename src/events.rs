//! Typed event bus shared by every component.
//!
//! Modelled, per the design notes, as "a typed channel or callback set
//! per event kind": here a single `tokio::sync::broadcast` channel of a
//! tagged [`Event`] enum. `publish` is a plain synchronous call — it
//! returns as soon as the message is queued for subscribers, satisfying
//! "event emission is synchronous from the mutator's point of view"
//! without forcing mutators to become `async`. Subscribers that need to
//! do blocking work are expected to trampoline to their own task, per
//! the design note's warning.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::{
    AgentId, AgentStatus, BreakerState, ClusterId, HealthStatus, MigrationId, MigrationStatus,
    TaskId,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    // --- AgentRegistry ---
    AgentRegistered { agent_id: AgentId },
    AgentUnregistered { agent_id: AgentId },
    AgentStatusChanged { agent_id: AgentId, previous: AgentStatus, current: AgentStatus },
    AgentLoadChanged { agent_id: AgentId, previous: f64, current: f64 },
    AgentHeartbeat { agent_id: AgentId, at: DateTime<Utc> },

    // --- HealthChecker ---
    HealthCheckerStarted,
    HealthCheckerStopped,
    AgentChecked { agent_id: AgentId, status: HealthStatus, latency_ms: u64 },
    CycleCompleted { checked: usize, healthy: usize, degraded: usize, unhealthy: usize },
    AgentUnhealthy { agent_id: AgentId },
    AgentRecovered { agent_id: AgentId },
    AgentAutoRemoved { agent_id: AgentId },

    // --- CircuitBreaker / registry ---
    BreakerStateChanged { agent_id: AgentId, previous: BreakerState, current: BreakerState },
    BreakerOpened { agent_id: AgentId },
    BreakerClosed { agent_id: AgentId },
    BreakerHalfOpen { agent_id: AgentId },

    // --- LoadBalancer ---
    AgentSelected { agent_id: AgentId },
    SelectionFailed { reason: String },
    AgentOperationSucceeded { agent_id: AgentId },
    AgentOperationFailed { agent_id: AgentId, error: String },
    AgentCircuitOpen { agent_id: AgentId },
    Failover { from_agent_id: AgentId, attempt: usize },

    // --- ExecutionEngine ---
    ExecutionStarted { total_tasks: usize },
    ExecutionCompleted { completed: usize, failed: usize, cancelled: usize, skipped: usize },
    ExecutionFailed { level: usize },
    ExecutionCancelled,
    LevelStarted { level: usize, task_count: usize },
    LevelCompleted { level: usize, succeeded: usize, failed: usize },
    TaskStarted { task_id: TaskId },
    TaskCompleted { task_id: TaskId },
    TaskFailed { task_id: TaskId, error: String },
    TaskRetry { task_id: TaskId, attempt: u32 },
    TaskCancelled { task_id: TaskId },
    TaskSkipped { task_id: TaskId },
    ProgressUpdated { completed: usize, total: usize },
    TasksShouldSkip { task_ids: Vec<TaskId> },

    // --- ClusterRegistry ---
    ClusterRegistered { cluster_id: ClusterId },
    ClusterUnregistered { cluster_id: ClusterId },
    ClusterHealthChanged { cluster_id: ClusterId, previous: HealthStatus, current: HealthStatus },
    ClusterFailed { cluster_id: ClusterId },
    ClusterHealthCheckCompleted { cluster_id: ClusterId },
    ClusterLoadReport { cluster_id: ClusterId, utilization_pct: f64 },

    // --- AgentMigrator ---
    MigrationStarted { migration_id: MigrationId },
    MigrationStatusChanged { migration_id: MigrationId, status: MigrationStatus },
    MigrationCompleted { migration_id: MigrationId },
    MigrationFailed { migration_id: MigrationId, error: String },
    MigrationRolledBack { migration_id: MigrationId },
    FailoverClusterCompleted { cluster_id: ClusterId, migrated: usize, failed: usize },
}

/// Shared, cloneable event bus. Cloning shares the same underlying
/// broadcast channel (the sender is reference counted internally).
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publishes an event. A lack of subscribers is not an error: the
    /// bus has no memory of whether anyone is listening.
    pub fn publish(&self, event: Event) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_is_observed_by_subscriber() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.publish(Event::AgentRegistered { agent_id: AgentId::from("a1") });
        let event = rx.recv().await.unwrap();
        matches!(event, Event::AgentRegistered { .. });
    }

    #[test]
    fn publish_without_subscribers_does_not_panic() {
        let bus = EventBus::default();
        bus.publish(Event::HealthCheckerStarted);
    }
}
