//! Orchestrates cross-cluster agent moves: export → transfer → start →
//! verify → stop → cleanup, bounded by a per-step timeout with rollback
//! on failure.
//!
//! Each step is wrapped in `tokio::time::timeout` at the call site here,
//! never inside the [`MigrationTransport`] implementation, so the budget
//! is always visible to the core (see SPEC_FULL §5).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::cluster::ClusterRegistry;
use crate::error::MigrationError;
use crate::events::{Event, EventBus};
use crate::ports::{AgentProbe, MigrationTransport, ProbeOutcome, StopMode};
use crate::registry::AgentRegistry;
use crate::types::{Agent, AgentId, ClusterId, Migration, MigrationId, MigrationMode, MigrationStatus};

#[derive(Debug, Clone)]
pub struct MigrationOptions {
    pub mode: MigrationMode,
    pub preserve_state: bool,
    pub graceful_shutdown: bool,
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub rollback_on_failure: bool,
    /// Resolves Open Question 1 (§9): when `true`, a failed state export
    /// aborts the migration instead of continuing with
    /// `state_transferred = false`.
    pub hard_stop_on_export_failure: bool,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            mode: MigrationMode::Graceful,
            preserve_state: false,
            graceful_shutdown: true,
            timeout_ms: 5_000,
            max_retries: 2,
            rollback_on_failure: true,
            hard_stop_on_export_failure: false,
        }
    }
}

impl MigrationOptions {
    pub fn forced_failover() -> Self {
        Self {
            mode: MigrationMode::Force,
            rollback_on_failure: false,
            timeout_ms: 3_000,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FailoverClusterReport {
    pub migrated: usize,
    pub failed: usize,
}

pub struct MigratorConfig {
    pub max_concurrent_migrations: usize,
}

impl Default for MigratorConfig {
    fn default() -> Self {
        Self { max_concurrent_migrations: 10 }
    }
}

/// Orchestrates agent migrations across clusters. `T` is the injected
/// transport driving the agent endpoint contract; `P` probes an agent's
/// liveness on the target cluster during verification.
pub struct AgentMigrator<T: MigrationTransport + 'static, P: AgentProbe + 'static> {
    agents: Arc<AgentRegistry>,
    clusters: Arc<ClusterRegistry>,
    transport: Arc<T>,
    probe: Arc<P>,
    events: EventBus,
    config: MigratorConfig,
    active: AtomicUsize,
    migrations: RwLock<HashMap<MigrationId, Migration>>,
    membership: RwLock<HashMap<AgentId, ClusterId>>,
}

impl<T: MigrationTransport + 'static, P: AgentProbe + 'static> AgentMigrator<T, P> {
    pub fn new(
        agents: Arc<AgentRegistry>,
        clusters: Arc<ClusterRegistry>,
        transport: Arc<T>,
        probe: Arc<P>,
        events: EventBus,
    ) -> Self {
        Self::with_config(agents, clusters, transport, probe, events, MigratorConfig::default())
    }

    pub fn with_config(
        agents: Arc<AgentRegistry>,
        clusters: Arc<ClusterRegistry>,
        transport: Arc<T>,
        probe: Arc<P>,
        events: EventBus,
        config: MigratorConfig,
    ) -> Self {
        Self {
            agents,
            clusters,
            transport,
            probe,
            events,
            config,
            active: AtomicUsize::new(0),
            migrations: RwLock::new(HashMap::new()),
            membership: RwLock::new(HashMap::new()),
        }
    }

    /// Records which cluster an agent currently belongs to. Callers
    /// seed this at agent registration time; the migrator keeps it in
    /// sync across successful and rolled-back migrations.
    pub fn assign(&self, agent_id: AgentId, cluster_id: ClusterId) {
        self.membership.write().unwrap().insert(agent_id, cluster_id);
    }

    pub fn cluster_of(&self, agent_id: &AgentId) -> Option<ClusterId> {
        self.membership.read().unwrap().get(agent_id).cloned()
    }

    pub fn agents_in(&self, cluster_id: &ClusterId) -> Vec<AgentId> {
        self.membership
            .read()
            .unwrap()
            .iter()
            .filter(|(_, c)| *c == cluster_id)
            .map(|(a, _)| a.clone())
            .collect()
    }

    pub fn get(&self, id: &MigrationId) -> Option<Migration> {
        self.migrations.read().unwrap().get(id).cloned()
    }

    fn set_status(&self, migration: &mut Migration, status: MigrationStatus) {
        migration.status = status;
        self.migrations.write().unwrap().insert(migration.id, migration.clone());
        self.events.publish(Event::MigrationStatusChanged { migration_id: migration.id, status });
    }

    async fn step<F, Fut, O>(&self, timeout_ms: u64, op: F) -> Result<O, String>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<O, String>>,
    {
        match tokio::time::timeout(Duration::from_millis(timeout_ms), op()).await {
            Ok(result) => result,
            Err(_) => Err("step timed out".to_string()),
        }
    }

    /// Runs a single migration end to end.
    pub async fn migrate(
        &self,
        agent_id: AgentId,
        from: ClusterId,
        to: ClusterId,
        opts: MigrationOptions,
    ) -> Result<Migration, MigrationError> {
        if self.active.load(Ordering::SeqCst) >= self.config.max_concurrent_migrations {
            return Err(MigrationError::MaxConcurrentMigrations(self.config.max_concurrent_migrations));
        }
        self.active.fetch_add(1, Ordering::SeqCst);
        let result = self.migrate_inner(agent_id, from, to, opts).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn migrate_inner(
        &self,
        agent_id: AgentId,
        from: ClusterId,
        to: ClusterId,
        opts: MigrationOptions,
    ) -> Result<Migration, MigrationError> {
        let mut migration = Migration {
            id: MigrationId::new(),
            agent_id: agent_id.clone(),
            from_cluster_id: from.clone(),
            to_cluster_id: to.clone(),
            status: MigrationStatus::Pending,
            started_at: Utc::now(),
            completed_at: None,
            state_transferred: false,
            retry_count: 0,
            error: None,
        };
        self.events.publish(Event::MigrationStarted { migration_id: migration.id });

        let Some(agent) = self.agents.get(&agent_id) else {
            return Err(MigrationError::StartFailed(format!("unknown agent {agent_id}")));
        };

        match self.run_steps(&mut migration, &agent, &opts).await {
            Ok(()) => {
                self.set_status(&mut migration, MigrationStatus::Completed);
                migration.completed_at = Some(Utc::now());
                self.migrations.write().unwrap().insert(migration.id, migration.clone());
                self.membership.write().unwrap().insert(agent_id, to);
                self.events.publish(Event::MigrationCompleted { migration_id: migration.id });
                Ok(migration)
            }
            Err(err) => {
                error!(agent_id = %migration.agent_id, error = %err, "migration step failed");
                migration.error = Some(err.to_string());
                self.events
                    .publish(Event::MigrationFailed { migration_id: migration.id, error: err.to_string() });

                if opts.rollback_on_failure {
                    self.rollback(&migration, &agent, &opts).await;
                    self.set_status(&mut migration, MigrationStatus::RolledBack);
                    self.events.publish(Event::MigrationRolledBack { migration_id: migration.id });
                } else {
                    self.set_status(&mut migration, MigrationStatus::Failed);
                }
                migration.completed_at = Some(Utc::now());
                self.migrations.write().unwrap().insert(migration.id, migration.clone());
                Err(err)
            }
        }
    }

    async fn run_steps(
        &self,
        migration: &mut Migration,
        agent: &Agent,
        opts: &MigrationOptions,
    ) -> Result<(), MigrationError> {
        // 1. Validate source health.
        self.set_status(migration, MigrationStatus::Preparing);
        let source = self
            .clusters
            .get(&migration.from_cluster_id)
            .ok_or_else(|| MigrationError::SourceUnhealthy(migration.from_cluster_id.clone()))?;
        if source.health.status == crate::types::HealthStatus::Unhealthy {
            return Err(MigrationError::SourceUnhealthy(migration.from_cluster_id.clone()));
        }

        // 2. Reserve capacity on target.
        self.clusters
            .reserve_slot(&migration.to_cluster_id)
            .map_err(|_| MigrationError::TargetFull(migration.to_cluster_id.clone()))?;

        self.set_status(migration, MigrationStatus::InProgress);

        // 3. Export state (if requested).
        let mut state = None;
        if opts.preserve_state {
            self.set_status(migration, MigrationStatus::TransferringState);
            match self.step(opts.timeout_ms, || self.transport.export_state(agent)).await {
                Ok(exported) => {
                    state = Some(exported);
                    migration.state_transferred = true;
                }
                Err(err) if opts.hard_stop_on_export_failure => {
                    return Err(MigrationError::ExportFailed(err));
                }
                Err(_) => {
                    migration.state_transferred = false;
                }
            }
        }

        // 4. Transfer state to target.
        if let Some(state) = &state {
            self.step(opts.timeout_ms, || self.transport.import_state(agent, state))
                .await
                .map_err(MigrationError::TransferFailed)?;
        }

        // 5. Start agent on target.
        self.set_status(migration, MigrationStatus::Activating);
        self.step(opts.timeout_ms, || self.transport.start_agent(agent, state.as_ref(), state.is_some()))
            .await
            .map_err(MigrationError::StartFailed)?;

        // 6. Verify, up to 5 probes with bounded retry.
        let mut verified = false;
        for attempt in 1..=5u32 {
            let outcome = tokio::time::timeout(
                Duration::from_millis(opts.timeout_ms),
                self.probe.probe(agent),
            )
            .await
            .unwrap_or(ProbeOutcome::Failed("verify probe timed out".to_string()));
            if matches!(outcome, ProbeOutcome::Healthy | ProbeOutcome::Degraded) {
                verified = true;
                break;
            }
            migration.retry_count = attempt;
            if attempt < opts.max_retries.max(1) {
                tokio::time::sleep(Duration::from_millis(100 * attempt as u64)).await;
            }
        }
        if !verified {
            return Err(MigrationError::VerifyFailed(format!("agent {} never came up on target", agent.id)));
        }

        // 7. Graceful shutdown on source (best-effort).
        if opts.graceful_shutdown {
            self.transport.stop_agent(agent, StopMode::Graceful).await;
        }

        // 8. Cleanup source.
        self.transport.cleanup_agent(agent).await;
        let _ = self.clusters.release_slot(&migration.from_cluster_id);

        Ok(())
    }

    async fn rollback(&self, migration: &Migration, agent: &Agent, _opts: &MigrationOptions) {
        warn!(migration_id = %migration.id, "rolling back migration");
        let _ = self.clusters.release_slot(&migration.to_cluster_id);
        self.transport.stop_agent(agent, StopMode::Force).await;
        let _ = self.transport.start_agent(agent, None, false).await;
    }

    /// Fans out a batch of single-agent migrations with per-chunk
    /// concurrency `min(5, cap - active)`.
    pub async fn migrate_multiple(
        &self,
        agent_ids: Vec<AgentId>,
        from: ClusterId,
        to: ClusterId,
        opts: MigrationOptions,
    ) -> Vec<Result<Migration, MigrationError>> {
        let mut results = Vec::with_capacity(agent_ids.len());
        for chunk in agent_ids.chunks(self.chunk_size()) {
            let futures = chunk.iter().cloned().map(|agent_id| {
                self.migrate(agent_id, from.clone(), to.clone(), opts.clone())
            });
            results.extend(futures::future::join_all(futures).await);
        }
        results
    }

    fn chunk_size(&self) -> usize {
        let active = self.active.load(Ordering::SeqCst);
        5.min(self.config.max_concurrent_migrations.saturating_sub(active)).max(1)
    }

    /// Marks `cluster_id` as not accepting traffic, then force-migrates
    /// every agent it owns to wherever [`ClusterRegistry::select_cluster_for_migration`]
    /// picks, without rollback.
    pub async fn failover_cluster(&self, cluster_id: ClusterId) -> FailoverClusterReport {
        let _ = self.clusters.set_accepting_traffic(&cluster_id, false);
        let agent_ids = self.agents_in(&cluster_id);

        let mut report = FailoverClusterReport::default();
        for agent_id in agent_ids {
            let Ok(target) = self.clusters.select_cluster_for_migration(&cluster_id) else {
                report.failed += 1;
                continue;
            };
            let opts = MigrationOptions::forced_failover();
            match self.migrate(agent_id, cluster_id.clone(), target.id, opts).await {
                Ok(_) => report.migrated += 1,
                Err(_) => report.failed += 1,
            }
        }
        info!(cluster_id = %cluster_id, migrated = report.migrated, failed = report.failed, "cluster failover complete");
        self.events.publish(Event::FailoverClusterCompleted {
            cluster_id,
            migrated: report.migrated,
            failed: report.failed,
        });
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AgentConfig, Capabilities, ClusterConfig, Runtime};
    use async_trait::async_trait;

    struct FakeTransport {
        export_fails: bool,
        transfer_fails: bool,
    }

    #[async_trait]
    impl MigrationTransport for FakeTransport {
        async fn export_state(&self, _agent: &Agent) -> Result<serde_json::Value, String> {
            if self.export_fails {
                Err("export failed".to_string())
            } else {
                Ok(serde_json::json!({"k": "v"}))
            }
        }
        async fn import_state(&self, _agent: &Agent, _state: &serde_json::Value) -> Result<(), String> {
            if self.transfer_fails {
                Err("transfer failed".to_string())
            } else {
                Ok(())
            }
        }
        async fn start_agent(
            &self,
            _agent: &Agent,
            _state: Option<&serde_json::Value>,
            _resume: bool,
        ) -> Result<(), String> {
            Ok(())
        }
        async fn verify_agent(&self, _agent: &Agent) -> Result<(), String> {
            Ok(())
        }
        async fn stop_agent(&self, _agent: &Agent, _mode: StopMode) {}
        async fn cleanup_agent(&self, _agent: &Agent) {}
    }

    struct AlwaysHealthyProbe;

    #[async_trait]
    impl AgentProbe for AlwaysHealthyProbe {
        async fn probe(&self, _agent: &Agent) -> ProbeOutcome {
            ProbeOutcome::Healthy
        }
    }

    /// Registers one agent on `src` and an empty `dst` with one free
    /// slot. Cluster health starts `Unknown`, which `run_steps` accepts
    /// (only `Unhealthy` is rejected), so tests need no extra setup to
    /// make the source eligible.
    fn setup() -> (Arc<AgentRegistry>, Arc<ClusterRegistry>, AgentId, ClusterId, ClusterId) {
        let events = EventBus::default();
        let agents = Arc::new(AgentRegistry::new(events.clone()));
        let clusters = Arc::new(ClusterRegistry::new(events));
        let agent_id = AgentId::from("a1");
        agents
            .register(AgentConfig {
                id: Some(agent_id.clone()),
                runtime: Runtime::Process,
                capabilities: Capabilities::default(),
                metadata: Default::default(),
            })
            .unwrap();
        let src = ClusterId::from("src");
        let dst = ClusterId::from("dst");
        clusters
            .register(ClusterConfig { id: Some(src.clone()), max_agents: 1, ..ClusterConfig::default() })
            .unwrap();
        clusters
            .register(ClusterConfig { id: Some(dst.clone()), max_agents: 1, ..ClusterConfig::default() })
            .unwrap();
        clusters.reserve_slot(&src).unwrap();
        (agents, clusters, agent_id, src, dst)
    }

    #[tokio::test]
    async fn successful_migration_moves_capacity_from_source_to_target() {
        let (agents, clusters, agent_id, src, dst) = setup();
        let events = EventBus::default();
        let transport = Arc::new(FakeTransport { export_fails: false, transfer_fails: false });
        let migrator =
            AgentMigrator::new(agents, clusters.clone(), transport, Arc::new(AlwaysHealthyProbe), events);
        migrator.assign(agent_id.clone(), src.clone());

        let opts = MigrationOptions { preserve_state: true, ..MigrationOptions::default() };
        let before_target = clusters.get(&dst).unwrap().current_agents;
        let result = migrator.migrate(agent_id.clone(), src, dst.clone(), opts).await.unwrap();

        assert_eq!(result.status, MigrationStatus::Completed);
        assert!(result.state_transferred);
        assert_eq!(clusters.get(&dst).unwrap().current_agents, before_target + 1);
        assert_eq!(migrator.cluster_of(&agent_id), Some(dst));
    }

    #[tokio::test]
    async fn transfer_failure_rolls_back_and_restores_target_slot() {
        let (agents, clusters, agent_id, src, dst) = setup();
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let transport = Arc::new(FakeTransport { export_fails: false, transfer_fails: true });
        let migrator =
            AgentMigrator::new(agents, clusters.clone(), transport, Arc::new(AlwaysHealthyProbe), events);
        migrator.assign(agent_id.clone(), src.clone());

        let before_target = clusters.get(&dst).unwrap().current_agents;
        let opts = MigrationOptions { preserve_state: true, ..MigrationOptions::default() };
        let result = migrator.migrate(agent_id, src, dst.clone(), opts).await;

        assert!(result.is_err());
        assert_eq!(clusters.get(&dst).unwrap().current_agents, before_target);

        let mut saw_rolled_back = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, Event::MigrationRolledBack { .. }) {
                saw_rolled_back = true;
            }
        }
        assert!(saw_rolled_back);
    }

    #[tokio::test]
    async fn max_concurrent_migrations_is_enforced() {
        let (agents, clusters, agent_id, src, dst) = setup();
        let events = EventBus::default();
        let transport = Arc::new(FakeTransport { export_fails: false, transfer_fails: false });
        let migrator = AgentMigrator::with_config(
            agents,
            clusters,
            transport,
            Arc::new(AlwaysHealthyProbe),
            events,
            MigratorConfig { max_concurrent_migrations: 0 },
        );
        let result = migrator.migrate(agent_id, src, dst, MigrationOptions::default()).await;
        assert!(matches!(result, Err(MigrationError::MaxConcurrentMigrations(0))));
    }
}
