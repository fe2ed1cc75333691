//! Authoritative set of registered agents.
//!
//! Mutations go through a single `RwLock<HashMap>`, mirroring the
//! coarse-grained locking the teacher's own registry used for its CSV
//! directory; the specification's "single-writer-at-a-time per entity"
//! requirement is satisfied because the write lock already serializes
//! every mutation, just at map granularity rather than per-agent.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::info;

use crate::error::RegistryError;
use crate::events::{Event, EventBus};
use crate::types::{Agent, AgentConfig, AgentId, AgentStatus};

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Window within which `lastHeartbeat` must fall for an agent to be
    /// considered reachable by `healthy_agents`.
    pub heartbeat_window_ms: i64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self { heartbeat_window_ms: 60_000 }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RegistryStats {
    pub total_agents: usize,
    pub by_status: HashMap<AgentStatus, usize>,
    pub avg_load: f64,
    pub avg_reliability: f64,
}

pub enum SkillMatch {
    All,
    Any,
}

pub struct AgentRegistry {
    agents: Arc<RwLock<HashMap<AgentId, Agent>>>,
    config: RegistryConfig,
    events: EventBus,
}

impl AgentRegistry {
    pub fn new(events: EventBus) -> Self {
        Self::with_config(events, RegistryConfig::default())
    }

    pub fn with_config(events: EventBus, config: RegistryConfig) -> Self {
        info!("initializing agent registry");
        Self { agents: Arc::new(RwLock::new(HashMap::new())), config, events }
    }

    pub fn register(&self, config: AgentConfig) -> Result<Agent, RegistryError> {
        let id = config.id.unwrap_or_else(|| AgentId(uuid::Uuid::new_v4().to_string()));
        let mut agents = self.agents.write().unwrap();
        if agents.contains_key(&id) {
            return Err(RegistryError::DuplicateId(id));
        }
        let agent = Agent {
            id: id.clone(),
            runtime: config.runtime,
            status: AgentStatus::Idle,
            capabilities: config.capabilities,
            current_load: 0.0,
            last_heartbeat: Utc::now(),
            metadata: config.metadata,
        };
        agents.insert(id.clone(), agent.clone());
        drop(agents);
        self.events.publish(Event::AgentRegistered { agent_id: id });
        Ok(agent)
    }

    pub fn unregister(&self, id: &AgentId) -> bool {
        let removed = self.agents.write().unwrap().remove(id).is_some();
        if removed {
            self.events.publish(Event::AgentUnregistered { agent_id: id.clone() });
        }
        removed
    }

    pub fn get(&self, id: &AgentId) -> Option<Agent> {
        self.agents.read().unwrap().get(id).cloned()
    }

    pub fn all(&self) -> Vec<Agent> {
        self.agents.read().unwrap().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.agents.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn matches(owned: &std::collections::HashSet<String>, wanted: &[String], mode: &SkillMatch) -> bool {
        if wanted.is_empty() {
            return true;
        }
        let folded: std::collections::HashSet<String> = owned.iter().map(|s| s.to_lowercase()).collect();
        match mode {
            SkillMatch::All => wanted.iter().all(|w| folded.contains(&w.to_lowercase())),
            SkillMatch::Any => wanted.iter().any(|w| folded.contains(&w.to_lowercase())),
        }
    }

    pub fn by_skill(&self, skills: &[String], mode: SkillMatch) -> Vec<Agent> {
        self.agents
            .read()
            .unwrap()
            .values()
            .filter(|a| Self::matches(&a.capabilities.skills, skills, &mode))
            .cloned()
            .collect()
    }

    pub fn by_language(&self, languages: &[String], mode: SkillMatch) -> Vec<Agent> {
        self.agents
            .read()
            .unwrap()
            .values()
            .filter(|a| Self::matches(&a.capabilities.languages, languages, &mode))
            .cloned()
            .collect()
    }

    pub fn by_specialty(&self, specialties: &[String], mode: SkillMatch) -> Vec<Agent> {
        self.agents
            .read()
            .unwrap()
            .values()
            .filter(|a| Self::matches(&a.capabilities.specialties, specialties, &mode))
            .cloned()
            .collect()
    }

    /// Agents reachable within the configured heartbeat window and not
    /// in a terminal-unhealthy status.
    pub fn healthy_agents(&self) -> Vec<Agent> {
        let now = Utc::now();
        let window = ChronoDuration::milliseconds(self.config.heartbeat_window_ms);
        self.agents
            .read()
            .unwrap()
            .values()
            .filter(|a| {
                now.signed_duration_since(a.last_heartbeat) <= window
                    && !matches!(a.status, AgentStatus::Unhealthy | AgentStatus::Offline)
            })
            .cloned()
            .collect()
    }

    pub fn available_agents(&self) -> Vec<Agent> {
        self.healthy_agents().into_iter().filter(|a| a.status == AgentStatus::Idle).collect()
    }

    pub fn update_status(&self, id: &AgentId, status: AgentStatus) -> Result<(), RegistryError> {
        let mut agents = self.agents.write().unwrap();
        let agent = agents.get_mut(id).ok_or_else(|| RegistryError::NotFound(id.clone()))?;
        let previous = agent.status;
        if previous == status {
            return Ok(());
        }
        agent.status = status;
        drop(agents);
        self.events.publish(Event::AgentStatusChanged { agent_id: id.clone(), previous, current: status });
        Ok(())
    }

    pub fn update_load(&self, id: &AgentId, load: f64) -> Result<(), RegistryError> {
        if !(0.0..=1.0).contains(&load) {
            return Err(RegistryError::InvalidLoad(load));
        }
        let mut agents = self.agents.write().unwrap();
        let agent = agents.get_mut(id).ok_or_else(|| RegistryError::NotFound(id.clone()))?;
        let previous = agent.current_load;
        if previous == load {
            return Ok(());
        }
        agent.current_load = load;
        drop(agents);
        self.events.publish(Event::AgentLoadChanged { agent_id: id.clone(), previous, current: load });
        Ok(())
    }

    /// Refreshes `last_heartbeat`. An agent previously marked
    /// unhealthy or offline is brought back to `idle`, with the usual
    /// status-change event.
    pub fn heartbeat(&self, id: &AgentId) -> Result<(), RegistryError> {
        let now = Utc::now();
        let recovered = {
            let mut agents = self.agents.write().unwrap();
            let agent = agents.get_mut(id).ok_or_else(|| RegistryError::NotFound(id.clone()))?;
            agent.last_heartbeat = now;
            let was_down = matches!(agent.status, AgentStatus::Unhealthy | AgentStatus::Offline);
            if was_down {
                agent.status = AgentStatus::Idle;
            }
            was_down
        };
        self.events.publish(Event::AgentHeartbeat { agent_id: id.clone(), at: now });
        if recovered {
            self.events.publish(Event::AgentStatusChanged {
                agent_id: id.clone(),
                previous: AgentStatus::Unhealthy,
                current: AgentStatus::Idle,
            });
        }
        Ok(())
    }

    pub fn stats(&self) -> RegistryStats {
        let agents = self.agents.read().unwrap();
        let total_agents = agents.len();
        let mut by_status: HashMap<AgentStatus, usize> = HashMap::new();
        let mut load_sum = 0.0;
        let mut reliability_sum = 0.0;
        for agent in agents.values() {
            *by_status.entry(agent.status).or_insert(0) += 1;
            load_sum += agent.current_load;
            reliability_sum += agent.capabilities.reliability;
        }
        let denom = total_agents.max(1) as f64;
        RegistryStats {
            total_agents,
            by_status,
            avg_load: if total_agents == 0 { 0.0 } else { load_sum / denom },
            avg_reliability: if total_agents == 0 { 0.0 } else { reliability_sum / denom },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Capabilities, Runtime};

    fn config(id: &str) -> AgentConfig {
        AgentConfig { id: Some(AgentId::from(id)), runtime: Runtime::Process, ..AgentConfig::default() }
    }

    #[test]
    fn register_rejects_duplicate_id() {
        let registry = AgentRegistry::new(EventBus::default());
        registry.register(config("a1")).unwrap();
        assert!(matches!(registry.register(config("a1")), Err(RegistryError::DuplicateId(_))));
    }

    #[test]
    fn update_load_validates_range() {
        let registry = AgentRegistry::new(EventBus::default());
        registry.register(config("a1")).unwrap();
        let id = AgentId::from("a1");
        assert!(registry.update_load(&id, 0.5).is_ok());
        assert!(matches!(registry.update_load(&id, 1.5), Err(RegistryError::InvalidLoad(_))));
    }

    #[test]
    fn heartbeat_recovers_unhealthy_agent_to_idle() {
        let registry = AgentRegistry::new(EventBus::default());
        registry.register(config("a1")).unwrap();
        let id = AgentId::from("a1");
        registry.update_status(&id, AgentStatus::Unhealthy).unwrap();
        registry.heartbeat(&id).unwrap();
        assert_eq!(registry.get(&id).unwrap().status, AgentStatus::Idle);
    }

    #[test]
    fn skill_filter_is_case_folded_and_honors_match_mode() {
        let registry = AgentRegistry::new(EventBus::default());
        let mut cfg = config("a1");
        cfg.capabilities = Capabilities {
            skills: ["Rust".to_string(), "Go".to_string()].into_iter().collect(),
            ..Capabilities::default()
        };
        registry.register(cfg).unwrap();

        assert_eq!(registry.by_skill(&["rust".to_string()], SkillMatch::Any).len(), 1);
        assert_eq!(registry.by_skill(&["rust".to_string(), "python".to_string()], SkillMatch::All).len(), 0);
        assert_eq!(registry.by_skill(&["rust".to_string(), "go".to_string()], SkillMatch::All).len(), 1);
    }

    #[test]
    fn available_agents_requires_idle_and_fresh_heartbeat() {
        let registry = AgentRegistry::new(EventBus::default());
        registry.register(config("a1")).unwrap();
        assert_eq!(registry.available_agents().len(), 1);
        registry.update_status(&AgentId::from("a1"), AgentStatus::Busy).unwrap();
        assert_eq!(registry.available_agents().len(), 0);
    }
}
