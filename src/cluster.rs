//! Peer-cluster registry: mirrors [`crate::registry::AgentRegistry`]'s
//! shape plus health monitoring, load reporting, and migration-target
//! selection.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::Utc;

use crate::error::ClusterError;
use crate::events::{Event, EventBus};
use crate::ports::{ClusterProbe, ProbeOutcome};
use crate::types::{Cluster, ClusterConfig, ClusterHealth, ClusterId, ClusterLoad, HealthStatus};

pub struct ClusterRegistry {
    clusters: Arc<RwLock<HashMap<ClusterId, Cluster>>>,
    events: EventBus,
}

impl ClusterRegistry {
    pub fn new(events: EventBus) -> Self {
        Self { clusters: Arc::new(RwLock::new(HashMap::new())), events }
    }

    pub fn register(&self, config: ClusterConfig) -> Result<Cluster, ClusterError> {
        let id = config.id.unwrap_or_else(|| ClusterId(uuid::Uuid::new_v4().to_string()));
        let mut clusters = self.clusters.write().unwrap();
        if clusters.contains_key(&id) {
            return Err(ClusterError::DuplicateId(id));
        }
        let cluster = Cluster {
            id: id.clone(),
            endpoint: config.endpoint,
            region: config.region,
            zone: config.zone,
            role: config.role,
            capabilities: config.capabilities,
            health: ClusterHealth { status: HealthStatus::Unknown, latency_ms: 0, last_check_at: Utc::now(), failure_count: 0 },
            load: ClusterLoad::default(),
            max_agents: config.max_agents,
            current_agents: 0,
            routing_weight: config.routing_weight,
            is_active: true,
            is_accepting_traffic: true,
        };
        clusters.insert(id.clone(), cluster.clone());
        drop(clusters);
        self.events.publish(Event::ClusterRegistered { cluster_id: id });
        Ok(cluster)
    }

    pub fn unregister(&self, id: &ClusterId) -> bool {
        let removed = self.clusters.write().unwrap().remove(id).is_some();
        if removed {
            self.events.publish(Event::ClusterUnregistered { cluster_id: id.clone() });
        }
        removed
    }

    pub fn get(&self, id: &ClusterId) -> Option<Cluster> {
        self.clusters.read().unwrap().get(id).cloned()
    }

    pub fn all(&self) -> Vec<Cluster> {
        self.clusters.read().unwrap().values().cloned().collect()
    }

    pub fn healthy_clusters(&self) -> Vec<Cluster> {
        self.clusters
            .read()
            .unwrap()
            .values()
            .filter(|c| c.is_active && c.health.status != HealthStatus::Unhealthy)
            .cloned()
            .collect()
    }

    /// Runs one probe against every registered cluster, recording
    /// health and emitting `cluster:failed` exactly once on the
    /// healthy/degraded -> unhealthy transition.
    pub async fn check_all<P: ClusterProbe>(&self, probe: &P, timeout_ms: u64) {
        let clusters = self.all();
        for cluster in clusters {
            let outcome = match tokio::time::timeout(
                std::time::Duration::from_millis(timeout_ms),
                probe.probe(&cluster),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(_) => ProbeOutcome::Failed("timeout".to_string()),
            };
            self.record_health(&cluster.id, outcome);
            self.events.publish(Event::ClusterHealthCheckCompleted { cluster_id: cluster.id });
        }
    }

    fn record_health(&self, id: &ClusterId, outcome: ProbeOutcome) {
        let mut clusters = self.clusters.write().unwrap();
        let Some(cluster) = clusters.get_mut(id) else { return };
        let previous = cluster.health.status;
        let (status, failure_count) = match outcome {
            ProbeOutcome::Healthy => (HealthStatus::Healthy, 0),
            ProbeOutcome::Degraded => (HealthStatus::Degraded, cluster.health.failure_count),
            ProbeOutcome::Failed(_) => (HealthStatus::Unhealthy, cluster.health.failure_count + 1),
        };
        cluster.health.status = status;
        cluster.health.failure_count = failure_count;
        cluster.health.last_check_at = Utc::now();
        drop(clusters);

        if previous != status {
            self.events.publish(Event::ClusterHealthChanged { cluster_id: id.clone(), previous, current: status });
            if status == HealthStatus::Unhealthy && previous != HealthStatus::Unhealthy {
                self.events.publish(Event::ClusterFailed { cluster_id: id.clone() });
            }
        }
    }

    pub fn report_load(&self, id: &ClusterId, load: ClusterLoad) -> Result<(), ClusterError> {
        let mut clusters = self.clusters.write().unwrap();
        let cluster = clusters.get_mut(id).ok_or_else(|| ClusterError::NotFound(id.clone()))?;
        cluster.load = load;
        let utilization_pct = cluster.load.utilization_pct;
        drop(clusters);
        self.events.publish(Event::ClusterLoadReport { cluster_id: id.clone(), utilization_pct });
        Ok(())
    }

    pub fn set_accepting_traffic(&self, id: &ClusterId, accepting: bool) -> Result<(), ClusterError> {
        let mut clusters = self.clusters.write().unwrap();
        let cluster = clusters.get_mut(id).ok_or_else(|| ClusterError::NotFound(id.clone()))?;
        cluster.is_accepting_traffic = accepting;
        Ok(())
    }

    pub fn reserve_slot(&self, id: &ClusterId) -> Result<(), ClusterError> {
        let mut clusters = self.clusters.write().unwrap();
        let cluster = clusters.get_mut(id).ok_or_else(|| ClusterError::NotFound(id.clone()))?;
        if cluster.available_slots() == 0 {
            return Err(ClusterError::NoTargetCluster);
        }
        cluster.current_agents += 1;
        Ok(())
    }

    pub fn release_slot(&self, id: &ClusterId) -> Result<(), ClusterError> {
        let mut clusters = self.clusters.write().unwrap();
        let cluster = clusters.get_mut(id).ok_or_else(|| ClusterError::NotFound(id.clone()))?;
        cluster.current_agents = cluster.current_agents.saturating_sub(1);
        Ok(())
    }

    /// Region-grouped snapshot of every cluster.
    pub fn federation_status(&self) -> HashMap<String, Vec<Cluster>> {
        let mut by_region: HashMap<String, Vec<Cluster>> = HashMap::new();
        for cluster in self.all() {
            by_region.entry(cluster.region.clone()).or_default().push(cluster);
        }
        by_region
    }

    /// Least-loaded healthy cluster with a free slot in `source`'s
    /// region; falls back to any region if none qualify there.
    pub fn select_cluster_for_migration(&self, source: &ClusterId) -> Result<Cluster, ClusterError> {
        let source_region = self.get(source).map(|c| c.region);
        let candidates: Vec<Cluster> = self
            .healthy_clusters()
            .into_iter()
            .filter(|c| &c.id != source && c.is_accepting_traffic && c.available_slots() > 0)
            .collect();
        if candidates.is_empty() {
            return Err(ClusterError::NoTargetCluster);
        }

        let in_region: Vec<&Cluster> = match &source_region {
            Some(region) => candidates.iter().filter(|c| &c.region == region).collect(),
            None => Vec::new(),
        };
        let pool: Vec<&Cluster> = if in_region.is_empty() { candidates.iter().collect() } else { in_region };

        pool.into_iter()
            .min_by(|a, b| a.load.utilization_pct.partial_cmp(&b.load.utilization_pct).unwrap())
            .cloned()
            .ok_or(ClusterError::NoTargetCluster)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(id: &str, region: &str, max_agents: u32) -> ClusterConfig {
        ClusterConfig {
            id: Some(ClusterId::from(id)),
            region: region.to_string(),
            max_agents,
            ..ClusterConfig::default()
        }
    }

    #[test]
    fn register_rejects_duplicate() {
        let registry = ClusterRegistry::new(EventBus::default());
        registry.register(config("c1", "us", 4)).unwrap();
        assert!(matches!(registry.register(config("c1", "us", 4)), Err(ClusterError::DuplicateId(_))));
    }

    #[test]
    fn reserve_and_release_slot_track_available_capacity() {
        let registry = ClusterRegistry::new(EventBus::default());
        registry.register(config("c1", "us", 1)).unwrap();
        let id = ClusterId::from("c1");
        registry.reserve_slot(&id).unwrap();
        assert!(matches!(registry.reserve_slot(&id), Err(ClusterError::NoTargetCluster)));
        registry.release_slot(&id).unwrap();
        assert_eq!(registry.get(&id).unwrap().available_slots(), 1);
    }

    #[test]
    fn selects_least_loaded_cluster_in_same_region_first() {
        let registry = ClusterRegistry::new(EventBus::default());
        registry.register(config("src", "us", 1)).unwrap();
        registry.register(config("near", "us", 1)).unwrap();
        registry.register(config("far", "eu", 1)).unwrap();
        registry
            .report_load(&ClusterId::from("near"), ClusterLoad { utilization_pct: 0.2, ..ClusterLoad::default() })
            .unwrap();
        registry
            .report_load(&ClusterId::from("far"), ClusterLoad { utilization_pct: 0.1, ..ClusterLoad::default() })
            .unwrap();
        // Mark all healthy so they're eligible.
        for id in ["src", "near", "far"] {
            registry.set_accepting_traffic(&ClusterId::from(id), true).unwrap();
        }
        let mut clusters = registry.clusters.write().unwrap();
        for c in clusters.values_mut() {
            c.health.status = HealthStatus::Healthy;
        }
        drop(clusters);

        let selected = registry.select_cluster_for_migration(&ClusterId::from("src")).unwrap();
        assert_eq!(selected.id, ClusterId::from("near"));
    }
}
