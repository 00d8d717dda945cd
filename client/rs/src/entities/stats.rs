use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display};
use typeshare::typeshare;

use crate::entities::deployment::DeploymentState;

/// A single reported metric axis.
#[typeshare]
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ResourceMetric {
  pub used: f64,
  pub total: f64,
  pub available: f64,
  pub unit: String,
}

impl ResourceMetric {
  pub fn new(used: f64, total: f64, unit: &str) -> ResourceMetric {
    ResourceMetric {
      used,
      total,
      available: (total - used).max(0.0),
      unit: unit.to_string(),
    }
  }
}

#[typeshare]
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ResourceSnapshot {
  pub cpu: ResourceMetric,
  pub memory: ResourceMetric,
  pub storage: ResourceMetric,
  pub network: ResourceMetric,
}

#[typeshare]
#[derive(
  Serialize,
  Deserialize,
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
  Display,
  AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum AgentStatus {
  Starting,
  #[default]
  Online,
  Draining,
  Stopping,
}

#[typeshare]
#[derive(
  Serialize,
  Deserialize,
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
  Display,
  AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum AgentHealth {
  #[default]
  Healthy,
  Degraded,
  Unhealthy,
}

/// Sent once at startup (agent -> plane). A non-2xx response is
/// fatal to startup.
#[typeshare]
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct AgentRegistration {
  pub id: String,
  pub server_id: String,
  pub location: String,
  pub version: String,
  pub capabilities: Vec<String>,
  pub resources: ResourceSnapshot,
  pub status: AgentStatus,
  #[serde(default)]
  pub metadata: HashMap<String, String>,
}

/// Response to registration. The plane may hand back a token
/// for the agent to store.
#[typeshare]
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct AgentRegistrationResponse {
  #[serde(default)]
  pub token: Option<String>,
}

/// Periodic heartbeat payload (agent -> plane). The plane detects
/// staleness from `last_seen`; a failed report never changes local
/// agent state.
#[typeshare]
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct StatusReport {
  pub agent_id: String,
  pub server_id: String,
  pub location: String,
  pub status: AgentStatus,
  pub health: AgentHealth,
  pub resources: ResourceSnapshot,
  pub containers: Vec<ContainerSummary>,
  pub deployments: Vec<DeploymentSummary>,
  #[typeshare(serialized_as = "number")]
  pub last_seen: i64,
  #[serde(default)]
  pub metadata: HashMap<String, String>,
}

#[typeshare]
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ContainerSummary {
  #[serde(default)]
  pub id: Option<String>,
  pub name: String,
  #[serde(default)]
  pub image: Option<String>,
  #[serde(default)]
  pub state: String,
  #[serde(default)]
  pub status: Option<String>,
}

#[typeshare]
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct DeploymentSummary {
  pub id: String,
  pub app_id: String,
  pub version: String,
  pub status: DeploymentState,
}

/// Host level stats sampled from the system.
#[typeshare]
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct SystemStats {
  pub cpu_percent: f64,
  #[typeshare(serialized_as = "number")]
  pub memory_used_bytes: u64,
  #[typeshare(serialized_as = "number")]
  pub memory_total_bytes: u64,
  #[typeshare(serialized_as = "number")]
  pub disk_used_bytes: u64,
  #[typeshare(serialized_as = "number")]
  pub disk_total_bytes: u64,
  #[typeshare(serialized_as = "number")]
  pub network_rx_bytes: u64,
  #[typeshare(serialized_as = "number")]
  pub network_tx_bytes: u64,
  #[typeshare(serialized_as = "number")]
  pub refreshed_at: i64,
}

impl SystemStats {
  pub fn snapshot(&self) -> ResourceSnapshot {
    ResourceSnapshot {
      cpu: ResourceMetric::new(self.cpu_percent, 100.0, "percent"),
      memory: ResourceMetric::new(
        self.memory_used_bytes as f64,
        self.memory_total_bytes as f64,
        "bytes",
      ),
      storage: ResourceMetric::new(
        self.disk_used_bytes as f64,
        self.disk_total_bytes as f64,
        "bytes",
      ),
      network: ResourceMetric::new(
        (self.network_rx_bytes + self.network_tx_bytes) as f64,
        0.0,
        "bytes",
      ),
    }
  }
}
