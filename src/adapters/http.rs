//! `reqwest`-backed reference implementation of the agent/cluster
//! endpoint contract (spec.md §6). Feature-gated behind `http-adapters`
//! so the core itself never depends on a transport.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

use crate::ports::{AgentProbe, ClusterProbe, MigrationTransport, ProbeOutcome, StopMode};
use crate::types::{Agent, Cluster};

#[derive(Debug, Clone, serde::Deserialize)]
struct HealthBody {
    #[serde(default)]
    status: Option<String>,
}

async fn probe_endpoint(client: &Client, base_url: &str) -> ProbeOutcome {
    let url = format!("{base_url}/health");
    match client.get(&url).send().await {
        Ok(response) if response.status().is_success() => {
            let body: HealthBody = response.json().await.unwrap_or(HealthBody { status: None });
            match body.status.as_deref() {
                Some("degraded") => ProbeOutcome::Degraded,
                _ => ProbeOutcome::Healthy,
            }
        }
        Ok(response) => ProbeOutcome::Failed(format!("status {}", response.status())),
        Err(err) => ProbeOutcome::Failed(err.to_string()),
    }
}

/// Probes an agent's `GET {endpoint}/health`, where `endpoint` is read
/// from `agent.metadata["endpoint"]`.
pub struct HttpAgentProbe {
    client: Client,
}

impl HttpAgentProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { client: Client::builder().timeout(timeout).build().unwrap_or_default() }
    }
}

impl Default for HttpAgentProbe {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

fn endpoint_of(agent: &Agent) -> Option<String> {
    agent.metadata.get("endpoint").and_then(|v| v.as_str()).map(str::to_string)
}

#[async_trait]
impl AgentProbe for HttpAgentProbe {
    async fn probe(&self, agent: &Agent) -> ProbeOutcome {
        match endpoint_of(agent) {
            Some(endpoint) => probe_endpoint(&self.client, &endpoint).await,
            None => ProbeOutcome::Failed("agent has no endpoint metadata".to_string()),
        }
    }
}

/// Probes a cluster's `GET {endpoint}/health`.
pub struct HttpClusterProbe {
    client: Client,
}

impl HttpClusterProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { client: Client::builder().timeout(timeout).build().unwrap_or_default() }
    }
}

impl Default for HttpClusterProbe {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl ClusterProbe for HttpClusterProbe {
    async fn probe(&self, cluster: &Cluster) -> ProbeOutcome {
        probe_endpoint(&self.client, &cluster.endpoint).await
    }
}

/// Drives the migration endpoint contract (export/import/start/verify/
/// stop/cleanup) over HTTP against an agent's `endpoint` metadata.
pub struct HttpMigrationTransport {
    client: Client,
}

impl HttpMigrationTransport {
    pub fn new(timeout: Duration) -> Self {
        Self { client: Client::builder().timeout(timeout).build().unwrap_or_default() }
    }
}

impl Default for HttpMigrationTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl MigrationTransport for HttpMigrationTransport {
    async fn export_state(&self, agent: &Agent) -> Result<Value, String> {
        let endpoint = endpoint_of(agent).ok_or("agent has no endpoint metadata")?;
        let url = format!("{endpoint}/agents/{}/export", agent.id);
        let response = self.client.post(&url).send().await.map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("export returned status {}", response.status()));
        }
        response.json().await.map_err(|e| e.to_string())
    }

    async fn import_state(&self, agent: &Agent, state: &Value) -> Result<(), String> {
        let endpoint = endpoint_of(agent).ok_or("agent has no endpoint metadata")?;
        let url = format!("{endpoint}/agents/import");
        let response = self.client.post(&url).json(state).send().await.map_err(|e| e.to_string())?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!("import returned status {}", response.status()))
        }
    }

    async fn start_agent(&self, agent: &Agent, state: Option<&Value>, resume_from_state: bool) -> Result<(), String> {
        let endpoint = endpoint_of(agent).ok_or("agent has no endpoint metadata")?;
        let url = format!("{endpoint}/agents/{}/start", agent.id);
        let body = serde_json::json!({"state": state, "resumeFromState": resume_from_state});
        let response = self.client.post(&url).json(&body).send().await.map_err(|e| e.to_string())?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!("start returned status {}", response.status()))
        }
    }

    async fn verify_agent(&self, agent: &Agent) -> Result<(), String> {
        let endpoint = endpoint_of(agent).ok_or("agent has no endpoint metadata")?;
        let url = format!("{endpoint}/agents/{}/health", agent.id);
        let response = self.client.get(&url).send().await.map_err(|e| e.to_string())?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!("verify returned status {}", response.status()))
        }
    }

    async fn stop_agent(&self, agent: &Agent, mode: StopMode) {
        let Some(endpoint) = endpoint_of(agent) else { return };
        let url = format!("{endpoint}/agents/{}/stop", agent.id);
        let graceful = matches!(mode, StopMode::Graceful);
        let _ = self.client.post(&url).json(&serde_json::json!({"graceful": graceful})).send().await;
    }

    async fn cleanup_agent(&self, agent: &Agent) {
        let Some(endpoint) = endpoint_of(agent) else { return };
        let url = format!("{endpoint}/agents/{}/cleanup", agent.id);
        let _ = self.client.post(&url).send().await;
    }
}
