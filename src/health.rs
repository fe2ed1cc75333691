//! Periodic health probing of registered agents.
//!
//! One scheduler drives fixed-interval cycles; within a cycle every
//! registered agent is probed concurrently and independently, mirroring
//! the engine's own per-level fan-out (`engine::ExecutionEngine::execute`).
//! Classification and auto-removal follow spec.md §4.3 exactly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::events::{Event, EventBus};
use crate::ports::{AgentProbe, ProbeOutcome};
use crate::registry::AgentRegistry;
use crate::types::{AgentHealthState, AgentId, AgentStatus, HealthStatus};

#[derive(Debug, Clone)]
pub struct HealthCheckerConfig {
    pub interval_ms: u64,
    pub probe_timeout_ms: u64,
    pub unhealthy_threshold: u32,
    pub degraded_threshold_ms: u64,
    pub healthy_latency_threshold_ms: u64,
    pub auto_remove_after_ms: Option<i64>,
}

impl Default for HealthCheckerConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            probe_timeout_ms: 5_000,
            unhealthy_threshold: 3,
            degraded_threshold_ms: 2_000,
            healthy_latency_threshold_ms: 5_000,
            auto_remove_after_ms: None,
        }
    }
}

#[derive(Debug, Clone)]
struct Tracked {
    state: AgentHealthState,
    unhealthy_since: Option<DateTime<Utc>>,
}

impl Tracked {
    fn new(now: DateTime<Utc>) -> Self {
        Self { state: AgentHealthState::unknown(now), unhealthy_since: None }
    }
}

/// Runs probe cycles against every agent in an [`AgentRegistry`] on a
/// fixed interval, classifying outcomes and optionally auto-removing
/// agents that have been unhealthy for too long.
pub struct HealthChecker<P: AgentProbe + 'static> {
    registry: Arc<AgentRegistry>,
    probe: Arc<P>,
    events: EventBus,
    config: HealthCheckerConfig,
    tracked: Arc<RwLock<HashMap<AgentId, Tracked>>>,
    running: Arc<AtomicBool>,
    handle: AsyncMutex<Option<JoinHandle<()>>>,
}

impl<P: AgentProbe + 'static> HealthChecker<P> {
    pub fn new(registry: Arc<AgentRegistry>, probe: Arc<P>, events: EventBus) -> Self {
        Self::with_config(registry, probe, events, HealthCheckerConfig::default())
    }

    pub fn with_config(
        registry: Arc<AgentRegistry>,
        probe: Arc<P>,
        events: EventBus,
        config: HealthCheckerConfig,
    ) -> Self {
        Self {
            registry,
            probe,
            events,
            config,
            tracked: Arc::new(RwLock::new(HashMap::new())),
            running: Arc::new(AtomicBool::new(false)),
            handle: AsyncMutex::new(None),
        }
    }

    pub fn health_of(&self, id: &AgentId) -> Option<AgentHealthState> {
        self.tracked.read().unwrap().get(id).map(|t| t.state.clone())
    }

    /// Spawns the periodic scheduler. A second call while already
    /// running is a no-op.
    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("health checker started");
        self.events.publish(Event::HealthCheckerStarted);

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(this.config.interval_ms));
            loop {
                ticker.tick().await;
                if !this.running.load(Ordering::SeqCst) {
                    break;
                }
                this.run_cycle().await;
            }
        });
        *self.handle.lock().await = Some(handle);
    }

    /// Cancels the scheduler and any in-flight probes. Idempotent.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.handle.lock().await.take() {
            handle.abort();
        }
        info!("health checker stopped");
        self.events.publish(Event::HealthCheckerStopped);
    }

    /// Runs exactly one probe cycle. Exposed directly so callers (and
    /// tests) can drive cycles without waiting on the interval timer.
    pub async fn run_cycle(&self) {
        let agents = self.registry.all();
        let mut handles = Vec::with_capacity(agents.len());
        for agent in agents {
            let probe = self.probe.clone();
            let timeout_ms = self.config.probe_timeout_ms;
            handles.push(tokio::spawn(async move {
                let started = std::time::Instant::now();
                let outcome = match tokio::time::timeout(
                    Duration::from_millis(timeout_ms),
                    probe.probe(&agent),
                )
                .await
                {
                    Ok(outcome) => outcome,
                    Err(_) => ProbeOutcome::Failed("probe timed out".to_string()),
                };
                (agent.id, outcome, started.elapsed().as_millis() as u64)
            }));
        }

        let mut checked = 0usize;
        let mut healthy = 0usize;
        let mut degraded = 0usize;
        let mut unhealthy = 0usize;
        let mut to_remove: Vec<AgentId> = Vec::new();

        for handle in handles {
            let Ok((agent_id, outcome, latency_ms)) = handle.await else { continue };
            checked += 1;
            let status = self.classify(&agent_id, outcome, latency_ms);
            match status {
                HealthStatus::Healthy => healthy += 1,
                HealthStatus::Degraded => degraded += 1,
                HealthStatus::Unhealthy => unhealthy += 1,
                HealthStatus::Unknown => {}
            }
            self.events.publish(Event::AgentChecked { agent_id: agent_id.clone(), status, latency_ms });

            if let Some(after_ms) = self.config.auto_remove_after_ms {
                let tracked = self.tracked.read().unwrap();
                if let Some(since) = tracked.get(&agent_id).and_then(|t| t.unhealthy_since) {
                    if Utc::now().signed_duration_since(since) > ChronoDuration::milliseconds(after_ms) {
                        to_remove.push(agent_id.clone());
                    }
                }
            }
        }

        for id in to_remove {
            if self.registry.unregister(&id) {
                self.tracked.write().unwrap().remove(&id);
                self.events.publish(Event::AgentAutoRemoved { agent_id: id });
            }
        }

        debug!(checked, healthy, degraded, unhealthy, "health check cycle completed");
        self.events.publish(Event::CycleCompleted { checked, healthy, degraded, unhealthy });
    }

    fn classify(&self, agent_id: &AgentId, outcome: ProbeOutcome, latency_ms: u64) -> HealthStatus {
        let now = Utc::now();
        let mut tracked = self.tracked.write().unwrap();
        let entry = tracked.entry(agent_id.clone()).or_insert_with(|| Tracked::new(now));

        entry.state.total_checks += 1;
        entry.state.last_check = now;
        entry.state.latency_ms = latency_ms;

        let was_unhealthy = entry.state.status == HealthStatus::Unhealthy;

        let status = match outcome {
            ProbeOutcome::Failed(_) => {
                entry.state.total_failures += 1;
                entry.state.consecutive_failures += 1;
                entry.state.consecutive_successes = 0;

                if entry.state.consecutive_failures >= self.config.unhealthy_threshold {
                    if !was_unhealthy {
                        entry.unhealthy_since = Some(now);
                        self.events.publish(Event::AgentUnhealthy { agent_id: agent_id.clone() });
                        let _ = self.registry.update_status(agent_id, AgentStatus::Unhealthy);
                    }
                    HealthStatus::Unhealthy
                } else if entry.state.consecutive_failures > 0 {
                    HealthStatus::Degraded
                } else {
                    HealthStatus::Healthy
                }
            }
            ProbeOutcome::Degraded => {
                entry.state.consecutive_failures = 0;
                entry.state.consecutive_successes += 1;
                HealthStatus::Degraded
            }
            ProbeOutcome::Healthy if latency_ms as u64 > self.config.degraded_threshold_ms => {
                entry.state.consecutive_failures = 0;
                entry.state.consecutive_successes += 1;
                HealthStatus::Degraded
            }
            ProbeOutcome::Healthy => {
                entry.state.consecutive_failures = 0;
                entry.state.consecutive_successes += 1;
                if was_unhealthy {
                    entry.unhealthy_since = None;
                    self.events.publish(Event::AgentRecovered { agent_id: agent_id.clone() });
                }
                HealthStatus::Healthy
            }
        };

        entry.state.status = status;
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Agent, AgentConfig, Capabilities, Runtime};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    struct ScriptedProbe {
        outcomes: Vec<ProbeOutcome>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl AgentProbe for ScriptedProbe {
        async fn probe(&self, _agent: &Agent) -> ProbeOutcome {
            let i = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            self.outcomes.get(i.min(self.outcomes.len() - 1)).cloned().unwrap()
        }
    }

    fn registry_with_one_agent() -> (Arc<AgentRegistry>, AgentId) {
        let events = EventBus::default();
        let registry = Arc::new(AgentRegistry::new(events));
        let id = AgentId::from("a1");
        registry
            .register(AgentConfig {
                id: Some(id.clone()),
                runtime: Runtime::Process,
                capabilities: Capabilities::default(),
                metadata: Default::default(),
            })
            .unwrap();
        (registry, id)
    }

    #[tokio::test]
    async fn three_consecutive_failures_mark_unhealthy() {
        let (registry, id) = registry_with_one_agent();
        let probe = Arc::new(ScriptedProbe {
            outcomes: vec![ProbeOutcome::Failed("x".into())],
            calls: AtomicU32::new(0),
        });
        let checker = HealthChecker::with_config(
            registry.clone(),
            probe,
            EventBus::default(),
            HealthCheckerConfig { unhealthy_threshold: 3, ..HealthCheckerConfig::default() },
        );
        for _ in 0..3 {
            checker.run_cycle().await;
        }
        assert_eq!(checker.health_of(&id).unwrap().status, HealthStatus::Unhealthy);
        assert_eq!(registry.get(&id).unwrap().status, AgentStatus::Unhealthy);
    }

    #[tokio::test]
    async fn recovery_after_unhealthy_emits_recovered() {
        let (registry, id) = registry_with_one_agent();
        let probe = Arc::new(ScriptedProbe {
            outcomes: vec![
                ProbeOutcome::Failed("x".into()),
                ProbeOutcome::Failed("x".into()),
                ProbeOutcome::Failed("x".into()),
                ProbeOutcome::Healthy,
            ],
            calls: AtomicU32::new(0),
        });
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let checker = HealthChecker::with_config(
            registry,
            probe,
            events,
            HealthCheckerConfig { unhealthy_threshold: 3, ..HealthCheckerConfig::default() },
        );
        for _ in 0..4 {
            checker.run_cycle().await;
        }
        assert_eq!(checker.health_of(&id).unwrap().status, HealthStatus::Healthy);

        let mut saw_recovered = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, Event::AgentRecovered { .. }) {
                saw_recovered = true;
            }
        }
        assert!(saw_recovered);
    }

    #[tokio::test]
    async fn auto_remove_unregisters_after_grace_period() {
        let (registry, id) = registry_with_one_agent();
        let probe = Arc::new(ScriptedProbe {
            outcomes: vec![ProbeOutcome::Failed("x".into())],
            calls: AtomicU32::new(0),
        });
        let checker = HealthChecker::with_config(
            registry.clone(),
            probe,
            EventBus::default(),
            HealthCheckerConfig {
                unhealthy_threshold: 1,
                auto_remove_after_ms: Some(-1),
                ..HealthCheckerConfig::default()
            },
        );
        checker.run_cycle().await;
        checker.run_cycle().await;
        assert!(registry.get(&id).is_none());
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let (registry, _id) = registry_with_one_agent();
        let probe = Arc::new(ScriptedProbe { outcomes: vec![ProbeOutcome::Healthy], calls: AtomicU32::new(0) });
        let checker = Arc::new(HealthChecker::new(registry, probe, EventBus::default()));
        checker.start().await;
        checker.stop().await;
        checker.stop().await;
    }
}
