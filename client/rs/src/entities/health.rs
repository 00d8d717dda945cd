use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display};
use typeshare::typeshare;

/// Probe configuration for readiness and continuous liveness.
#[typeshare]
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HealthCheckConfig {
  #[serde(rename = "type")]
  pub check_type: HealthCheckType,
  /// Container port probed for http / tcp checks.
  #[serde(default)]
  pub port: Option<u16>,
  /// Http probe path.
  #[serde(default = "default_path")]
  pub path: String,
  /// Extra headers for http probes.
  #[serde(default)]
  pub headers: HashMap<String, String>,
  /// Command run inside the container for exec probes.
  #[serde(default)]
  pub command: Vec<String>,
  /// Seconds before the first probe.
  #[serde(default)]
  pub initial_delay: u64,
  /// Seconds between probes.
  #[serde(default = "default_period")]
  pub period: u64,
  /// Per-probe deadline, seconds.
  #[serde(default = "default_timeout")]
  pub timeout: u64,
  /// Consecutive failures before the check is considered failed.
  #[serde(default = "default_failure_threshold")]
  pub failure_threshold: u32,
  /// Consecutive successes before the check is considered passing.
  #[serde(default = "default_success_threshold")]
  pub success_threshold: u32,
}

impl Default for HealthCheckConfig {
  fn default() -> HealthCheckConfig {
    HealthCheckConfig {
      check_type: Default::default(),
      port: None,
      path: default_path(),
      headers: Default::default(),
      command: Default::default(),
      initial_delay: 0,
      period: default_period(),
      timeout: default_timeout(),
      failure_threshold: default_failure_threshold(),
      success_threshold: default_success_threshold(),
    }
  }
}

fn default_path() -> String {
  String::from("/health")
}

fn default_period() -> u64 {
  10
}

fn default_timeout() -> u64 {
  5
}

fn default_failure_threshold() -> u32 {
  3
}

fn default_success_threshold() -> u32 {
  1
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
pub enum HealthCheckType {
  #[default]
  Http,
  Tcp,
  Exec,
}

/// Outcome of a single probe.
#[typeshare]
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct HealthCheckResult {
  pub success: bool,
  pub message: String,
  /// Probe duration in milliseconds.
  #[typeshare(serialized_as = "number")]
  pub duration_ms: u64,
  #[typeshare(serialized_as = "number")]
  pub timestamp: i64,
  #[serde(default)]
  pub metadata: HashMap<String, String>,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn config_defaults_apply_on_sparse_input() {
    let config: HealthCheckConfig = serde_json::from_value(
      serde_json::json!({ "type": "tcp", "port": 5432 }),
    )
    .unwrap();
    assert_eq!(config.check_type, HealthCheckType::Tcp);
    assert_eq!(config.path, "/health");
    assert_eq!(config.failure_threshold, 3);
    assert_eq!(config.success_threshold, 1);
    assert_eq!(config.period, 10);
  }
}
