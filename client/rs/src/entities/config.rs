use std::{collections::HashMap, path::PathBuf};

use clap::Parser;
use serde::{Deserialize, Serialize};
use typeshare::typeshare;

use crate::entities::{logger::LogConfig, resource::ResourceQuota};

/// Full agent configuration. Loaded from config paths
/// (toml / yaml / json), then overridden by environment, then
/// by CLI args.
#[typeshare]
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct AgentConfig {
  #[serde(default)]
  pub agent: AgentSection,
  #[serde(default)]
  pub backend: BackendSection,
  #[serde(default)]
  pub monitoring: MonitoringSection,
  #[serde(default)]
  pub security: SecuritySection,
  #[serde(default)]
  pub docker: DockerSection,
  #[serde(default)]
  pub resources: ResourcesSection,
  #[serde(default)]
  pub git: GitSection,
  #[serde(default)]
  pub domain: DomainSection,
  #[serde(default)]
  pub storage: StorageSection,
  #[serde(default)]
  pub logging: LogConfig,
}

impl AgentConfig {
  /// Copy with credentials masked, safe for the startup dump.
  pub fn sanitized(&self) -> AgentConfig {
    let mut config = self.clone();
    config.backend.api_token = mask(&config.backend.api_token);
    config.git.password = mask(&config.git.password);
    config.git.token = mask(&config.git.token);
    config.git.ssh_key_passphrase =
      mask(&config.git.ssh_key_passphrase);
    config.storage.encryption_key =
      mask(&config.storage.encryption_key);
    config
  }
}

fn mask(value: &str) -> String {
  if value.is_empty() {
    String::new()
  } else {
    String::from("##############")
  }
}

#[typeshare]
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AgentSection {
  /// Stable agent identity, assigned by the operator or plane.
  #[serde(default)]
  pub id: String,
  /// The plane-side server record this agent backs.
  #[serde(default)]
  pub server_id: String,
  #[serde(default)]
  pub location: String,
  /// Local API listen port.
  #[serde(default = "default_port")]
  pub port: u16,
  #[serde(default = "default_bind_ip")]
  pub bind_ip: String,
  /// Scratch space for clones and build contexts.
  #[serde(default = "default_work_dir")]
  pub work_dir: PathBuf,
  #[serde(default = "default_data_dir")]
  pub data_dir: PathBuf,
  /// Seconds between status reports to the plane.
  #[serde(default = "default_heartbeat_interval")]
  pub heartbeat_interval: u64,
  /// Size of the command worker pool.
  #[serde(default = "default_max_concurrent_ops")]
  pub max_concurrent_ops: usize,
  /// Environment name reported in metadata (production, staging...).
  #[serde(default)]
  pub environment: String,
}

impl Default for AgentSection {
  fn default() -> AgentSection {
    AgentSection {
      id: Default::default(),
      server_id: Default::default(),
      location: Default::default(),
      port: default_port(),
      bind_ip: default_bind_ip(),
      work_dir: default_work_dir(),
      data_dir: default_data_dir(),
      heartbeat_interval: default_heartbeat_interval(),
      max_concurrent_ops: default_max_concurrent_ops(),
      environment: Default::default(),
    }
  }
}

fn default_port() -> u16 {
  8120
}

fn default_bind_ip() -> String {
  String::from("0.0.0.0")
}

fn default_work_dir() -> PathBuf {
  PathBuf::from("/var/lib/arbor/work")
}

fn default_data_dir() -> PathBuf {
  PathBuf::from("/var/lib/arbor/data")
}

fn default_heartbeat_interval() -> u64 {
  30
}

fn default_max_concurrent_ops() -> usize {
  5
}

#[typeshare]
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BackendSection {
  /// Control plane base url. Empty disables the control loop
  /// (local-only mode).
  #[serde(default)]
  pub base_url: String,
  #[serde(default)]
  pub api_token: String,
  /// Read the token from this file instead of `api_token`.
  #[serde(default)]
  pub token_file: String,
  /// Seconds between command polls.
  #[serde(default = "default_refresh_interval")]
  pub refresh_interval: u64,
  /// Request timeout, seconds.
  #[serde(default = "default_backend_timeout")]
  pub timeout: u64,
  #[serde(default = "default_retry_attempts")]
  pub retry_attempts: u32,
  /// Base delay between retries, seconds. Doubles per attempt.
  #[serde(default = "default_retry_delay")]
  pub retry_delay: u64,
  #[serde(default)]
  pub headers: HashMap<String, String>,
  #[serde(default)]
  pub insecure_skip_tls: bool,
  #[serde(default)]
  pub ca_cert_file: String,
  #[serde(default)]
  pub client_cert_file: String,
  #[serde(default)]
  pub client_key_file: String,
}

impl Default for BackendSection {
  fn default() -> BackendSection {
    BackendSection {
      base_url: Default::default(),
      api_token: Default::default(),
      token_file: Default::default(),
      refresh_interval: default_refresh_interval(),
      timeout: default_backend_timeout(),
      retry_attempts: default_retry_attempts(),
      retry_delay: default_retry_delay(),
      headers: Default::default(),
      insecure_skip_tls: false,
      ca_cert_file: Default::default(),
      client_cert_file: Default::default(),
      client_key_file: Default::default(),
    }
  }
}

fn default_refresh_interval() -> u64 {
  5
}

fn default_backend_timeout() -> u64 {
  30
}

fn default_retry_attempts() -> u32 {
  3
}

fn default_retry_delay() -> u64 {
  2
}

#[typeshare]
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MonitoringSection {
  #[serde(default = "default_true")]
  pub enabled: bool,
  #[serde(default)]
  pub metrics_port: Option<u16>,
  #[serde(default)]
  pub health_check_port: Option<u16>,
  #[serde(default)]
  pub log_streaming_enabled: bool,
  #[serde(default)]
  pub log_streaming_endpoint: String,
}

impl Default for MonitoringSection {
  fn default() -> MonitoringSection {
    MonitoringSection {
      enabled: true,
      metrics_port: None,
      health_check_port: None,
      log_streaming_enabled: false,
      log_streaming_endpoint: Default::default(),
    }
  }
}

fn default_true() -> bool {
  true
}

#[typeshare]
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SecuritySection {
  #[serde(default = "default_true")]
  pub audit_log_enabled: bool,
  #[serde(default)]
  pub run_as_non_root: bool,
  /// Seconds between token rotations. Zero disables rotation.
  #[serde(default)]
  pub token_rotation_interval: u64,
  #[serde(default = "default_audit_file")]
  pub audit_file: PathBuf,
  /// Rotate the audit log once it exceeds this size.
  #[serde(default = "default_audit_max_size_mb")]
  pub audit_max_size_mb: u64,
  /// Rotated audit files kept on disk.
  #[serde(default = "default_audit_retention")]
  pub audit_retention: usize,
}

impl Default for SecuritySection {
  fn default() -> SecuritySection {
    SecuritySection {
      audit_log_enabled: true,
      run_as_non_root: false,
      token_rotation_interval: 0,
      audit_file: default_audit_file(),
      audit_max_size_mb: default_audit_max_size_mb(),
      audit_retention: default_audit_retention(),
    }
  }
}

fn default_audit_file() -> PathBuf {
  PathBuf::from("/var/log/arbor/audit.log")
}

fn default_audit_max_size_mb() -> u64 {
  50
}

fn default_audit_retention() -> usize {
  5
}

#[typeshare]
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DockerSection {
  /// Docker daemon address. Empty uses the platform default socket.
  #[serde(default)]
  pub host: String,
  /// Network joined by deployed containers (and the edge router).
  #[serde(default = "default_network_name")]
  pub network_name: String,
}

impl Default for DockerSection {
  fn default() -> DockerSection {
    DockerSection {
      host: Default::default(),
      network_name: default_network_name(),
    }
  }
}

fn default_network_name() -> String {
  String::from("arbor")
}

#[typeshare]
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ResourcesSection {
  #[serde(default = "default_max_containers")]
  pub max_containers: usize,
  /// Per-app admission quota.
  #[serde(default)]
  pub quota: ResourceQuota,
}

impl Default for ResourcesSection {
  fn default() -> ResourcesSection {
    ResourcesSection {
      max_containers: default_max_containers(),
      quota: Default::default(),
    }
  }
}

fn default_max_containers() -> usize {
  50
}

#[typeshare]
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct GitSection {
  #[serde(default = "default_git_cache_dir")]
  pub cache_dir: PathBuf,
  /// Seconds a cached clone is kept before cleanup.
  #[serde(default = "default_git_cache_retention")]
  pub cache_retention: u64,
  #[serde(default)]
  pub username: String,
  #[serde(default)]
  pub password: String,
  #[serde(default)]
  pub token: String,
  #[serde(default)]
  pub ssh_key_path: String,
  #[serde(default)]
  pub ssh_key_passphrase: String,
}

impl Default for GitSection {
  fn default() -> GitSection {
    GitSection {
      cache_dir: default_git_cache_dir(),
      cache_retention: default_git_cache_retention(),
      username: Default::default(),
      password: Default::default(),
      token: Default::default(),
      ssh_key_path: Default::default(),
      ssh_key_passphrase: Default::default(),
    }
  }
}

fn default_git_cache_dir() -> PathBuf {
  PathBuf::from("/var/lib/arbor/repos")
}

fn default_git_cache_retention() -> u64 {
  86400
}

#[typeshare]
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DomainSection {
  /// Apps are exposed at `<subdomain>.<base_domain>`.
  #[serde(default)]
  pub base_domain: String,
  #[serde(default)]
  pub dns_provider: String,
  #[serde(default)]
  pub acme_email: String,
  /// Directory watched by the edge router for route fragments.
  #[serde(default = "default_router_dir")]
  pub router_dir: PathBuf,
  /// Attach the ACME cert resolver to generated routes.
  #[serde(default = "default_true")]
  pub tls_enabled: bool,
}

impl Default for DomainSection {
  fn default() -> DomainSection {
    DomainSection {
      base_domain: Default::default(),
      dns_provider: Default::default(),
      acme_email: Default::default(),
      router_dir: default_router_dir(),
      tls_enabled: true,
    }
  }
}

fn default_router_dir() -> PathBuf {
  PathBuf::from("/etc/arbor/routes")
}

#[typeshare]
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StorageSection {
  #[serde(default = "default_storage_data_dir")]
  pub data_dir: PathBuf,
  /// Passphrase the store key is derived from. Required for startup.
  #[serde(default)]
  pub encryption_key: String,
}

impl Default for StorageSection {
  fn default() -> StorageSection {
    StorageSection {
      data_dir: default_storage_data_dir(),
      encryption_key: Default::default(),
    }
  }
}

fn default_storage_data_dir() -> PathBuf {
  PathBuf::from("/var/lib/arbor/state")
}

/// Environment overrides, parsed with envy. Only the commonly
/// overridden keys are exposed this way; everything else comes
/// from config files.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct Env {
  #[serde(default)]
  pub arbor_config_paths: Vec<PathBuf>,
  #[serde(default)]
  pub arbor_config_keywords: Vec<String>,
  pub arbor_agent_id: Option<String>,
  pub arbor_server_id: Option<String>,
  pub arbor_location: Option<String>,
  pub arbor_port: Option<u16>,
  pub arbor_bind_ip: Option<String>,
  pub arbor_backend_base_url: Option<String>,
  pub arbor_backend_api_token: Option<String>,
  pub arbor_backend_token_file: Option<String>,
  pub arbor_docker_host: Option<String>,
  pub arbor_docker_network: Option<String>,
  pub arbor_base_domain: Option<String>,
  pub arbor_router_dir: Option<PathBuf>,
  pub arbor_storage_data_dir: Option<PathBuf>,
  pub arbor_storage_encryption_key: Option<String>,
  pub arbor_logging_level: Option<crate::entities::logger::LogLevel>,
  pub arbor_max_concurrent_ops: Option<usize>,
  pub arbor_heartbeat_interval: Option<u64>,
}

/// CLI args. Config path / keyword flags mirror the env vars.
#[derive(Parser, Debug, Clone)]
#[command(name = "arbor-agent", version)]
pub struct CliArgs {
  /// Paths to config files or directories.
  #[arg(long = "config-path")]
  pub config_path: Option<Vec<PathBuf>>,

  /// Wildcard patterns matching config file names in directories.
  #[arg(long = "config-keyword")]
  pub config_keyword: Option<Vec<String>>,

  /// Merge nested config objects across files.
  #[arg(long)]
  pub merge_nested_config: bool,

  /// Extend arrays across config files instead of replacing.
  #[arg(long)]
  pub extend_config_arrays: bool,

  /// Override the log level.
  #[arg(long)]
  pub log_level: Option<tracing::Level>,
}
