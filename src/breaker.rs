//! Per-agent circuit breaker and its registry.
//!
//! State machine follows the classic closed/open/half-open shape (see
//! the recovery-manager breaker this is grounded on), generalised from
//! a consecutive-failure counter to a windowed one: failures are
//! timestamped and pruned lazily against `monitoring_window_ms` on
//! every record, so a burst of failures outside the window does not
//! count toward the threshold.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::warn;

use crate::events::{Event, EventBus};
use crate::types::{AgentId, BreakerState, CircuitBreakerState};

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub open_timeout_ms: i64,
    pub monitoring_window_ms: i64,
    pub auto_recovery: bool,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 2,
            open_timeout_ms: 30_000,
            monitoring_window_ms: 60_000,
            auto_recovery: true,
        }
    }
}

pub struct CircuitBreaker {
    agent_id: AgentId,
    config: BreakerConfig,
    state: BreakerState,
    failures: VecDeque<DateTime<Utc>>,
    windowed_successes: u32,
    consecutive_successes: u32,
    consecutive_failures: u32,
    opened_at: Option<DateTime<Utc>>,
    last_failure_at: Option<DateTime<Utc>>,
    last_success_at: Option<DateTime<Utc>>,
}

impl CircuitBreaker {
    pub fn new(agent_id: AgentId, config: BreakerConfig) -> Self {
        Self {
            agent_id,
            config,
            state: BreakerState::Closed,
            failures: VecDeque::new(),
            windowed_successes: 0,
            consecutive_successes: 0,
            consecutive_failures: 0,
            opened_at: None,
            last_failure_at: None,
            last_success_at: None,
        }
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let window = ChronoDuration::milliseconds(self.config.monitoring_window_ms);
        while let Some(front) = self.failures.front() {
            if now.signed_duration_since(*front) > window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }

    /// Transitions `open -> half_open` once the timeout has elapsed.
    /// Must be called before `is_open`/`record_*` observe state so the
    /// transition happens under the same lock as the read.
    fn refresh(&mut self, now: DateTime<Utc>, events: &EventBus) {
        if self.state == BreakerState::Open && self.config.auto_recovery {
            if let Some(opened_at) = self.opened_at {
                let timeout = ChronoDuration::milliseconds(self.config.open_timeout_ms);
                if now.signed_duration_since(opened_at) > timeout {
                    self.state = BreakerState::HalfOpen;
                    self.consecutive_successes = 0;
                    events.publish(Event::BreakerStateChanged {
                        agent_id: self.agent_id.clone(),
                        previous: BreakerState::Open,
                        current: BreakerState::HalfOpen,
                    });
                    events.publish(Event::BreakerHalfOpen { agent_id: self.agent_id.clone() });
                }
            }
        }
    }

    pub fn is_open(&mut self, now: DateTime<Utc>, events: &EventBus) -> bool {
        self.refresh(now, events);
        self.state == BreakerState::Open
    }

    pub fn record_success(&mut self, now: DateTime<Utc>, events: &EventBus) {
        self.refresh(now, events);
        self.last_success_at = Some(now);
        match self.state {
            BreakerState::Closed => {
                self.consecutive_failures = 0;
                self.windowed_successes += 1;
            }
            BreakerState::HalfOpen => {
                self.consecutive_successes += 1;
                self.windowed_successes += 1;
                if self.consecutive_successes >= self.config.success_threshold {
                    self.close(events);
                }
            }
            BreakerState::Open => {}
        }
    }

    pub fn record_failure(&mut self, now: DateTime<Utc>, events: &EventBus) {
        self.refresh(now, events);
        self.prune(now);
        self.last_failure_at = Some(now);
        self.consecutive_failures += 1;
        self.consecutive_successes = 0;

        match self.state {
            BreakerState::Closed => {
                self.failures.push_back(now);
                self.prune(now);
                if self.failures.len() as u32 >= self.config.failure_threshold {
                    self.open(events);
                }
            }
            BreakerState::HalfOpen => {
                self.failures.push_back(now);
                self.open(events);
            }
            BreakerState::Open => {}
        }
    }

    fn open(&mut self, events: &EventBus) {
        let previous = self.state;
        self.state = BreakerState::Open;
        self.opened_at = Some(Utc::now());
        if previous != BreakerState::Open {
            warn!(agent_id = %self.agent_id, "circuit breaker opened");
            events.publish(Event::BreakerStateChanged {
                agent_id: self.agent_id.clone(),
                previous,
                current: BreakerState::Open,
            });
            events.publish(Event::BreakerOpened { agent_id: self.agent_id.clone() });
            events.publish(Event::AgentUnhealthy { agent_id: self.agent_id.clone() });
        }
    }

    fn close(&mut self, events: &EventBus) {
        let previous = self.state;
        self.state = BreakerState::Closed;
        self.failures.clear();
        self.windowed_successes = 0;
        self.consecutive_failures = 0;
        self.consecutive_successes = 0;
        self.opened_at = None;
        if previous != BreakerState::Closed {
            events.publish(Event::BreakerStateChanged {
                agent_id: self.agent_id.clone(),
                previous,
                current: BreakerState::Closed,
            });
            events.publish(Event::BreakerClosed { agent_id: self.agent_id.clone() });
        }
    }

    pub fn force_open(&mut self, events: &EventBus) {
        self.open(events);
    }

    pub fn force_close(&mut self, events: &EventBus) {
        self.close(events);
    }

    pub fn reset(&mut self, events: &EventBus) {
        self.close(events);
    }

    pub fn snapshot(&self) -> CircuitBreakerState {
        CircuitBreakerState {
            agent_id: self.agent_id.clone(),
            state: self.state,
            windowed_failures: self.failures.len() as u32,
            windowed_successes: self.windowed_successes,
            last_failure_at: self.last_failure_at,
            last_success_at: self.last_success_at,
            consecutive_successes: self.consecutive_successes,
            consecutive_failures: self.consecutive_failures,
            opened_at: self.opened_at,
        }
    }
}

/// Owns one breaker per agent id.
pub struct CircuitBreakerRegistry {
    breakers: Arc<RwLock<HashMap<AgentId, CircuitBreaker>>>,
    config: BreakerConfig,
    events: EventBus,
}

impl CircuitBreakerRegistry {
    pub fn new(events: EventBus) -> Self {
        Self::with_config(events, BreakerConfig::default())
    }

    pub fn with_config(events: EventBus, config: BreakerConfig) -> Self {
        Self { breakers: Arc::new(RwLock::new(HashMap::new())), config, events }
    }

    fn get_or_create<'a>(
        breakers: &'a mut HashMap<AgentId, CircuitBreaker>,
        id: &AgentId,
        config: &BreakerConfig,
    ) -> &'a mut CircuitBreaker {
        breakers
            .entry(id.clone())
            .or_insert_with(|| CircuitBreaker::new(id.clone(), config.clone()))
    }

    pub fn is_open(&self, id: &AgentId) -> bool {
        let mut breakers = self.breakers.write().unwrap();
        Self::get_or_create(&mut breakers, id, &self.config).is_open(Utc::now(), &self.events)
    }

    pub fn record_success(&self, id: &AgentId) {
        let mut breakers = self.breakers.write().unwrap();
        Self::get_or_create(&mut breakers, id, &self.config).record_success(Utc::now(), &self.events);
    }

    pub fn record_failure(&self, id: &AgentId) {
        let mut breakers = self.breakers.write().unwrap();
        Self::get_or_create(&mut breakers, id, &self.config).record_failure(Utc::now(), &self.events);
    }

    pub fn force_open(&self, id: &AgentId) {
        let mut breakers = self.breakers.write().unwrap();
        Self::get_or_create(&mut breakers, id, &self.config).force_open(&self.events);
    }

    pub fn force_close(&self, id: &AgentId) {
        let mut breakers = self.breakers.write().unwrap();
        Self::get_or_create(&mut breakers, id, &self.config).force_close(&self.events);
    }

    pub fn reset(&self, id: &AgentId) {
        let mut breakers = self.breakers.write().unwrap();
        Self::get_or_create(&mut breakers, id, &self.config).reset(&self.events);
    }

    pub fn reset_all(&self) {
        let mut breakers = self.breakers.write().unwrap();
        for breaker in breakers.values_mut() {
            breaker.reset(&self.events);
        }
    }

    pub fn snapshot(&self, id: &AgentId) -> Option<CircuitBreakerState> {
        self.breakers.read().unwrap().get(id).map(CircuitBreaker::snapshot)
    }

    /// Adds a breaker for every id in `agent_ids` that lacks one, and
    /// drops every breaker whose id is not in `agent_ids`.
    pub fn sync_with_agent_ids(&self, agent_ids: &[AgentId]) {
        let wanted: HashSet<&AgentId> = agent_ids.iter().collect();
        let mut breakers = self.breakers.write().unwrap();
        breakers.retain(|id, _| wanted.contains(id));
        for id in agent_ids {
            breakers.entry(id.clone()).or_insert_with(|| CircuitBreaker::new(id.clone(), self.config.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn three_failures_open_the_circuit() {
        let registry = CircuitBreakerRegistry::new(EventBus::default());
        let id = AgentId::from("a1");
        for _ in 0..3 {
            registry.record_failure(&id);
        }
        assert!(registry.is_open(&id));
        assert_eq!(registry.snapshot(&id).unwrap().state, BreakerState::Open);
    }

    #[test]
    fn half_open_closes_after_success_threshold() {
        let events = EventBus::default();
        let config = BreakerConfig { open_timeout_ms: -1, ..BreakerConfig::default() };
        let registry = CircuitBreakerRegistry::with_config(events, config);
        let id = AgentId::from("a1");
        for _ in 0..3 {
            registry.record_failure(&id);
        }
        assert!(!registry.is_open(&id));
        assert_eq!(registry.snapshot(&id).unwrap().state, BreakerState::HalfOpen);

        registry.record_success(&id);
        assert_eq!(registry.snapshot(&id).unwrap().state, BreakerState::HalfOpen);
        registry.record_success(&id);
        assert_eq!(registry.snapshot(&id).unwrap().state, BreakerState::Closed);
    }

    #[test]
    fn half_open_single_failure_reopens() {
        let events = EventBus::default();
        let config = BreakerConfig { open_timeout_ms: -1, ..BreakerConfig::default() };
        let registry = CircuitBreakerRegistry::with_config(events, config);
        let id = AgentId::from("a1");
        for _ in 0..3 {
            registry.record_failure(&id);
        }
        assert!(!registry.is_open(&id));
        registry.record_failure(&id);
        assert!(registry.is_open(&id));
    }

    #[test]
    fn sync_adds_missing_and_removes_extraneous() {
        let registry = CircuitBreakerRegistry::new(EventBus::default());
        registry.record_failure(&AgentId::from("stale"));
        registry.sync_with_agent_ids(&[AgentId::from("a1"), AgentId::from("a2")]);
        assert!(registry.snapshot(&AgentId::from("stale")).is_none());
        assert!(registry.snapshot(&AgentId::from("a1")).is_some());
        assert!(registry.snapshot(&AgentId::from("a2")).is_some());
    }
}
