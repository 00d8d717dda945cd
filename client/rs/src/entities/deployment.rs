use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display};
use typeshare::typeshare;

use crate::entities::{
  EnvironmentVar, LogBuffer,
  health::{HealthCheckConfig, HealthCheckResult},
  resource::{ResourceLimits, ResourceUsage},
};

/// One intended workload instance on this host.
///
/// Created by the Deployment Engine on a deploy request,
/// mutated only by the Engine (state transitions) and the
/// Supervisor (health counters / metrics), destroyed by `Remove`.
#[typeshare]
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Deployment {
  /// Stable identity, `<app>-<version>-<epoch>`.
  pub id: String,
  pub app_id: String,
  pub version: String,
  pub source: DeploymentSource,
  #[serde(default)]
  pub config: DeploymentConfig,
  #[serde(default)]
  pub resource_limits: ResourceLimits,
  #[serde(default)]
  pub health_check: Option<HealthCheckConfig>,
  #[serde(default)]
  pub environment: Vec<EnvironmentVar>,
  /// Sensitive environment, carried separately so snapshots and
  /// status reports can redact it wholesale.
  #[serde(default)]
  pub secrets: Vec<EnvironmentVar>,
  #[serde(default)]
  pub ports: Vec<PortMapping>,
  #[serde(default)]
  pub volumes: Vec<VolumeMapping>,
  #[serde(default)]
  pub networks: Vec<String>,
  #[serde(default)]
  pub labels: HashMap<String, String>,
  #[serde(default)]
  pub status: DeploymentState,
  /// Set once the container is created. Non-empty iff status is
  /// Running / Stopping / HealthCheck / Updating.
  #[serde(default)]
  pub container_id: Option<String>,
  pub container_name: String,
  /// Derived from app_id, unique across live deployments on the node.
  pub subdomain: String,
  /// Image tag pinned at materialisation, `arbor/<app_id>:<version>`
  /// or the pulled reference.
  #[serde(default)]
  pub image: String,
  #[serde(default)]
  pub build_logs: LogBuffer,
  #[serde(default)]
  pub deployment_logs: LogBuffer,
  /// Latest resource usage sample.
  #[serde(default)]
  pub metrics: Option<ResourceUsage>,
  #[serde(default)]
  pub last_health_check: Option<HealthCheckResult>,
  #[typeshare(serialized_as = "number")]
  pub created_at: i64,
  #[typeshare(serialized_as = "number")]
  pub updated_at: i64,
  /// Set the first time the deployment reaches Running.
  #[serde(default)]
  #[typeshare(serialized_as = "number")]
  pub deployed_at: Option<i64>,
  #[serde(default)]
  pub rollback: Option<RollbackRecord>,
  /// Snapshot of the version this deployment replaced,
  /// re-materialised by `Rollback`.
  #[serde(default)]
  pub previous: Option<Box<Deployment>>,
}

impl Deployment {
  /// True when the state machine says a container should exist.
  pub fn expects_container(&self) -> bool {
    matches!(
      self.status,
      DeploymentState::Running
        | DeploymentState::Stopping
        | DeploymentState::HealthCheck
        | DeploymentState::Updating
    )
  }

  /// Drop secret values from a snapshot handed outside the engine.
  pub fn sanitized(mut self) -> Deployment {
    for secret in &mut self.secrets {
      secret.value = String::from("##############");
    }
    if let Some(previous) = &mut self.previous {
      for secret in &mut previous.secrets {
        secret.value = String::from("##############");
      }
    }
    self
  }
}

/// Where the workload image comes from. The field sets are
/// disjoint, so this is a sum type rather than a union-via-flags.
#[typeshare]
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeploymentSource {
  /// Clone and `docker build`.
  Git(GitSource),
  /// `docker pull` a prebuilt reference.
  Image(ImageSource),
}

impl Default for DeploymentSource {
  fn default() -> DeploymentSource {
    DeploymentSource::Image(ImageSource::default())
  }
}

#[typeshare]
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct GitSource {
  pub url: String,
  #[serde(default = "default_branch")]
  pub branch: String,
  /// Pin to a specific commit, overrides branch head.
  #[serde(default)]
  pub commit: Option<String>,
  /// Build context relative to the repo root.
  #[serde(default)]
  pub subpath: String,
  #[serde(default = "default_dockerfile")]
  pub dockerfile: String,
  /// Access token for private repositories. Never logged.
  #[serde(default)]
  pub token: Option<String>,
}

fn default_branch() -> String {
  String::from("main")
}

fn default_dockerfile() -> String {
  String::from("Dockerfile")
}

#[typeshare]
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ImageSource {
  /// Full image reference, eg `redis:7.0.5`.
  pub reference: String,
  #[serde(default)]
  pub auth: Option<RegistryAuth>,
}

#[typeshare]
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct RegistryAuth {
  pub domain: String,
  pub username: String,
  pub token: String,
}

#[typeshare]
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DeploymentConfig {
  #[serde(default = "default_replicas")]
  pub replicas: u32,
  #[serde(default)]
  pub strategy: DeployStrategy,
  /// Budget for the whole Pending -> Running pipeline, seconds.
  #[serde(default = "default_progress_timeout")]
  pub progress_timeout: u64,
  #[serde(default)]
  pub restart: RestartPolicy,
  #[serde(default)]
  pub user: String,
  #[serde(default)]
  pub working_dir: String,
  /// Container command override.
  #[serde(default)]
  pub command: String,
  #[serde(default)]
  pub args: Vec<String>,
  /// Raw `--security-opt` values (seccomp / apparmor / selinux).
  #[serde(default)]
  pub security_opts: Vec<String>,
  #[serde(default)]
  pub cap_add: Vec<String>,
  #[serde(default)]
  pub cap_drop: Vec<String>,
  /// Rebuild even when the pinned image tag already exists.
  #[serde(default)]
  pub force_rebuild: bool,
  /// Grace period for container stop, seconds.
  #[serde(default = "default_stop_grace")]
  pub stop_grace_period: u64,
}

impl Default for DeploymentConfig {
  fn default() -> DeploymentConfig {
    DeploymentConfig {
      replicas: default_replicas(),
      strategy: Default::default(),
      progress_timeout: default_progress_timeout(),
      restart: Default::default(),
      user: Default::default(),
      working_dir: Default::default(),
      command: Default::default(),
      args: Default::default(),
      security_opts: Default::default(),
      cap_add: Default::default(),
      cap_drop: Default::default(),
      force_rebuild: Default::default(),
      stop_grace_period: default_stop_grace(),
    }
  }
}

fn default_replicas() -> u32 {
  1
}

fn default_progress_timeout() -> u64 {
  300
}

fn default_stop_grace() -> u64 {
  30
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
#[serde(rename_all = "snake_case")]
pub enum DeployStrategy {
  #[default]
  Rolling,
  BlueGreen,
  Recreate,
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
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum RestartPolicy {
  #[default]
  No,
  OnFailure,
  Always,
  UnlessStopped,
}

#[typeshare]
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct PortMapping {
  pub container_port: u16,
  #[serde(default)]
  pub host_port: Option<u16>,
  #[serde(default)]
  pub protocol: PortProtocol,
  #[serde(default)]
  pub host_ip: Option<String>,
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
pub enum PortProtocol {
  #[default]
  Tcp,
  Udp,
}

#[typeshare]
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct VolumeMapping {
  pub source: String,
  pub target: String,
  #[serde(default)]
  pub read_only: bool,
}

/// The per-deployment state machine.
///
/// `Pending -> Building -> Deploying -> HealthCheck -> Running`,
/// with `Stopping / Stopped`, `Failed`, `RollingBack`, `Updating`
/// off the main path. `Stopped` and `Failed` are terminal
/// (recoverable by re-deploy, never automatically).
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
  Hash,
  Display,
  AsRefStr,
)]
pub enum DeploymentState {
  #[default]
  Pending,
  Building,
  Deploying,
  HealthCheck,
  Running,
  Stopping,
  Stopped,
  Failed,
  RollingBack,
  Updating,
}

impl DeploymentState {
  pub fn is_terminal(&self) -> bool {
    matches!(self, DeploymentState::Stopped | DeploymentState::Failed)
  }
}

#[typeshare]
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct RollbackRecord {
  pub previous_version: String,
  pub reason: String,
  #[typeshare(serialized_as = "number")]
  pub timestamp: i64,
}

/// The deploy request wire shape (plane / operator -> agent).
#[typeshare]
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct DeployRequest {
  pub app_id: String,
  pub version: String,
  pub source: DeploymentSource,
  #[serde(default)]
  pub config: DeploymentConfig,
  #[serde(default)]
  pub resource_limits: ResourceLimits,
  #[serde(default)]
  pub health_check: Option<HealthCheckConfig>,
  #[serde(default)]
  pub environment: Vec<EnvironmentVar>,
  #[serde(default)]
  pub secrets: Vec<EnvironmentVar>,
  #[serde(default)]
  pub ports: Vec<PortMapping>,
  #[serde(default)]
  pub networks: Vec<String>,
  #[serde(default)]
  pub volumes: Vec<VolumeMapping>,
  #[serde(default)]
  pub labels: HashMap<String, String>,
}

/// `<app>-<version>-<epoch>`, with version dots flattened so the
/// id is safe as a container name and router file name.
pub fn deployment_id(
  app_id: &str,
  version: &str,
  epoch_seconds: i64,
) -> String {
  format!("{app_id}-{version}-{epoch_seconds}")
}

/// Containers are namespaced under the agent.
pub fn container_name(deployment_id: &str) -> String {
  format!("arbor-{deployment_id}")
}

/// Lowercased app id with `_` and spaces replaced by `-`.
pub fn subdomain(app_id: &str) -> String {
  app_id.to_lowercase().replace(['_', ' '], "-")
}

/// Tag applied to images built from source.
pub fn image_tag(app_id: &str, version: &str) -> String {
  format!("arbor/{app_id}:{version}")
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn subdomain_normalizes_app_id() {
    assert_eq!(subdomain("My_App 2"), "my-app-2");
    assert_eq!(subdomain("demo"), "demo");
  }

  #[test]
  fn container_name_is_namespaced() {
    let id = deployment_id("demo", "1.0.0", 1712345678);
    assert_eq!(id, "demo-1.0.0-1712345678");
    assert_eq!(container_name(&id), "arbor-demo-1.0.0-1712345678");
  }

  #[test]
  fn source_variants_are_tagged() {
    let source = DeploymentSource::Git(GitSource {
      url: "https://example.invalid/demo".to_string(),
      ..Default::default()
    });
    let json = serde_json::to_value(&source).unwrap();
    assert_eq!(json["type"], "git");
    assert_eq!(json["branch"], "main");

    let source: DeploymentSource = serde_json::from_value(
      serde_json::json!({ "type": "image", "reference": "redis:7.0.5" }),
    )
    .unwrap();
    let DeploymentSource::Image(image) = source else {
      panic!("expected image source");
    };
    assert_eq!(image.reference, "redis:7.0.5");
  }

  #[test]
  fn expects_container_tracks_states() {
    let mut deployment = Deployment {
      status: DeploymentState::Running,
      ..Default::default()
    };
    assert!(deployment.expects_container());
    deployment.status = DeploymentState::Stopped;
    assert!(!deployment.expects_container());
    deployment.status = DeploymentState::Building;
    assert!(!deployment.expects_container());
  }
}
