//! Selects a healthy, non-broken agent by a configurable strategy and
//! drives a failover loop around an injected operation.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use rand::Rng;

use crate::breaker::CircuitBreakerRegistry;
use crate::error::{BalancerError, FailoverAttempt};
use crate::events::{Event, EventBus};
use crate::ports::{AgentSelector, SelectionCriteria};
use crate::registry::AgentRegistry;
use crate::types::{Agent, AgentId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    LeastConnections,
    RoundRobin,
    Weighted,
    Random,
    FirstAvailable,
}

#[derive(Debug, Clone)]
pub struct BalancerConfig {
    pub strategy: Strategy,
    pub max_failover_attempts: usize,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self { strategy: Strategy::LeastConnections, max_failover_attempts: 5 }
    }
}

pub struct LoadBalancer {
    registry: Arc<AgentRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
    events: EventBus,
    config: BalancerConfig,
    connections: RwLock<HashMap<AgentId, u64>>,
    round_robin_cursor: AtomicU64,
}

impl LoadBalancer {
    pub fn new(
        registry: Arc<AgentRegistry>,
        breakers: Arc<CircuitBreakerRegistry>,
        events: EventBus,
    ) -> Self {
        Self::with_config(registry, breakers, events, BalancerConfig::default())
    }

    pub fn with_config(
        registry: Arc<AgentRegistry>,
        breakers: Arc<CircuitBreakerRegistry>,
        events: EventBus,
        config: BalancerConfig,
    ) -> Self {
        Self {
            registry,
            breakers,
            events,
            config,
            connections: RwLock::new(HashMap::new()),
            round_robin_cursor: AtomicU64::new(0),
        }
    }

    fn metadata_flag_match(agent: &Agent, flags: &[String]) -> bool {
        flags.iter().all(|flag| crate::metadata::capability_flag(&agent.metadata, flag))
    }

    /// Steps 1-4 of `selectAgent`: candidates drawn from a single
    /// snapshot of the registry, then progressively filtered.
    fn candidates(&self, criteria: &SelectionCriteria) -> Result<Vec<Agent>, BalancerError> {
        let excluded: HashSet<&AgentId> = criteria.exclude_agents.iter().collect();
        let filtered: Vec<Agent> = self
            .registry
            .healthy_agents()
            .into_iter()
            .filter(|a| !excluded.contains(&a.id))
            .filter(|a| a.capabilities.has_all_skills(&criteria.required_skills))
            .filter(|a| Self::metadata_flag_match(a, &criteria.required_metadata_flags))
            .filter(|a| criteria.max_cost_per_hour.map_or(true, |max| a.capabilities.cost_per_hour <= max))
            .filter(|a| criteria.min_reliability.map_or(true, |min| a.capabilities.reliability >= min))
            .collect();

        if filtered.is_empty() {
            return Err(BalancerError::NoHealthyAgent);
        }

        let open: Vec<Agent> =
            filtered.into_iter().filter(|a| !self.breakers.is_open(&a.id)).collect();
        if open.is_empty() {
            return Err(BalancerError::AllBreakersOpen);
        }
        Ok(open)
    }

    fn connection_count(&self, id: &AgentId) -> u64 {
        self.connections.read().unwrap().get(id).copied().unwrap_or(0)
    }

    fn pick(&self, candidates: &[Agent]) -> Agent {
        match self.config.strategy {
            Strategy::FirstAvailable => candidates[0].clone(),
            Strategy::Random => {
                let idx = rand::thread_rng().gen_range(0..candidates.len());
                candidates[idx].clone()
            }
            Strategy::RoundRobin => {
                let idx = self.round_robin_cursor.fetch_add(1, Ordering::Relaxed) as usize
                    % candidates.len();
                candidates[idx].clone()
            }
            Strategy::LeastConnections => candidates
                .iter()
                .min_by_key(|a| self.connection_count(&a.id))
                .cloned()
                .unwrap_or_else(|| candidates[0].clone()),
            Strategy::Weighted => {
                let weights: Vec<f64> = candidates
                    .iter()
                    .map(|a| (a.capabilities.reliability + (a.capabilities.avg_speed / 20.0).min(1.0)) / 2.0)
                    .collect();
                let total: f64 = weights.iter().sum();
                if total <= 0.0 {
                    return candidates[0].clone();
                }
                let mut draw = rand::thread_rng().gen_range(0.0..total);
                for (agent, weight) in candidates.iter().zip(weights.iter()) {
                    if draw < *weight {
                        return agent.clone();
                    }
                    draw -= weight;
                }
                candidates.last().cloned().unwrap_or_else(|| candidates[0].clone())
            }
        }
    }

    /// `selectAgent`: full five-step pipeline against a single registry
    /// snapshot, recording the connection increment and emitting
    /// `agent.selected` on success.
    pub fn select_agent(&self, criteria: &SelectionCriteria) -> Result<Agent, BalancerError> {
        let result = self.candidates(criteria).map(|candidates| self.pick(&candidates));
        match &result {
            Ok(agent) => {
                *self.connections.write().unwrap().entry(agent.id.clone()).or_insert(0) += 1;
                self.events.publish(Event::AgentSelected { agent_id: agent.id.clone() });
            }
            Err(err) => {
                self.events.publish(Event::SelectionFailed { reason: err.to_string() });
            }
        }
        result
    }

    /// Called by the caller on a successful operation: decrements the
    /// connection counter and records success to the breaker.
    pub fn record_success(&self, agent_id: &AgentId) {
        let mut connections = self.connections.write().unwrap();
        if let Some(count) = connections.get_mut(agent_id) {
            *count = count.saturating_sub(1);
        }
        drop(connections);
        self.breakers.record_success(agent_id);
        self.events.publish(Event::AgentOperationSucceeded { agent_id: agent_id.clone() });
    }

    pub fn record_failure(&self, agent_id: &AgentId, error: &str) {
        let mut connections = self.connections.write().unwrap();
        if let Some(count) = connections.get_mut(agent_id) {
            *count = count.saturating_sub(1);
        }
        drop(connections);
        self.breakers.record_failure(agent_id);
        self.events.publish(Event::AgentOperationFailed {
            agent_id: agent_id.clone(),
            error: error.to_string(),
        });
        if self.breakers.is_open(agent_id) {
            self.events.publish(Event::AgentCircuitOpen { agent_id: agent_id.clone() });
        }
    }

    /// Runs `op` against a selected agent, retrying on a fresh
    /// selection (excluding every agent that has already failed) up to
    /// `max_failover_attempts` times.
    pub async fn execute_with_failover<F, Fut, T>(
        &self,
        criteria: SelectionCriteria,
        op: F,
    ) -> Result<T, BalancerError>
    where
        F: Fn(Agent) -> Fut,
        Fut: std::future::Future<Output = Result<T, String>>,
    {
        let mut criteria = criteria;
        let mut attempts: Vec<FailoverAttempt> = Vec::new();

        loop {
            let agent = self.select_agent(&criteria)?;
            match op(agent.clone()).await {
                Ok(value) => {
                    self.record_success(&agent.id);
                    return Ok(value);
                }
                Err(error) => {
                    self.record_failure(&agent.id, &error);
                    attempts.push(FailoverAttempt { agent_id: agent.id.clone(), error });
                    criteria.exclude_agents.push(agent.id.clone());
                    self.events.publish(Event::Failover {
                        from_agent_id: agent.id,
                        attempt: attempts.len(),
                    });
                    if attempts.len() >= self.config.max_failover_attempts {
                        return Err(BalancerError::Failover(attempts));
                    }
                }
            }
        }
    }
}

#[async_trait]
impl AgentSelector for LoadBalancer {
    async fn select(&self, criteria: &SelectionCriteria) -> Result<Agent, BalancerError> {
        self.select_agent(criteria)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AgentConfig, AgentStatus, Capabilities, Runtime};

    fn make_registry_with(ids: &[&str]) -> Arc<AgentRegistry> {
        let events = EventBus::default();
        let registry = Arc::new(AgentRegistry::new(events));
        for id in ids {
            registry
                .register(AgentConfig {
                    id: Some(AgentId::from(*id)),
                    runtime: Runtime::Process,
                    capabilities: Capabilities::default(),
                    metadata: Default::default(),
                })
                .unwrap();
        }
        registry
    }

    #[test]
    fn least_connections_alternates_to_balance_load() {
        let registry = make_registry_with(&["a", "b"]);
        let events = EventBus::default();
        let breakers = Arc::new(CircuitBreakerRegistry::new(events.clone()));
        let balancer = LoadBalancer::new(registry, breakers, events);

        let first = balancer.select_agent(&SelectionCriteria::default()).unwrap();
        let second = balancer.select_agent(&SelectionCriteria::default()).unwrap();
        assert_ne!(first.id, second.id);
    }

    #[test]
    fn empty_registry_fails_no_healthy_agent() {
        let registry = make_registry_with(&[]);
        let events = EventBus::default();
        let breakers = Arc::new(CircuitBreakerRegistry::new(events.clone()));
        let balancer = LoadBalancer::new(registry, breakers, events);
        assert!(matches!(
            balancer.select_agent(&SelectionCriteria::default()),
            Err(BalancerError::NoHealthyAgent)
        ));
    }

    #[test]
    fn all_breakers_open_is_reported_distinctly() {
        let registry = make_registry_with(&["a"]);
        let events = EventBus::default();
        let breakers = Arc::new(CircuitBreakerRegistry::new(events.clone()));
        breakers.force_open(&AgentId::from("a"));
        let balancer = LoadBalancer::new(registry, breakers, events);
        assert!(matches!(
            balancer.select_agent(&SelectionCriteria::default()),
            Err(BalancerError::AllBreakersOpen)
        ));
    }

    #[tokio::test]
    async fn failover_exhausts_after_max_attempts_with_three_agents() {
        let registry = make_registry_with(&["a", "b", "c"]);
        let events = EventBus::default();
        let breakers = Arc::new(CircuitBreakerRegistry::new(events.clone()));
        let config = BalancerConfig { strategy: Strategy::FirstAvailable, max_failover_attempts: 3 };
        let balancer = LoadBalancer::with_config(registry, breakers.clone(), events, config);

        let result: Result<(), BalancerError> = balancer
            .execute_with_failover(SelectionCriteria::default(), |_agent| async { Err("boom".to_string()) })
            .await;

        match result {
            Err(BalancerError::Failover(attempts)) => {
                assert_eq!(attempts.len(), 3);
                let distinct: HashSet<&AgentId> = attempts.iter().map(|a| &a.agent_id).collect();
                assert_eq!(distinct.len(), 3);
            }
            other => panic!("expected Failover, got {other:?}"),
        }
        for id in ["a", "b", "c"] {
            assert!(!breakers.is_open(&AgentId::from(id)));
        }
    }
}
