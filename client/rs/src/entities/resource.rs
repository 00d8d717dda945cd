use serde::{Deserialize, Serialize};
use typeshare::typeshare;

/// Limits requested for a deployment. Zero / None means unlimited
/// for sizes and "runtime default" for knobs.
#[typeshare]
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ResourceLimits {
  #[serde(default)]
  pub cpu_cores: f64,
  #[serde(default)]
  #[typeshare(serialized_as = "number")]
  pub memory_bytes: u64,
  #[serde(default)]
  #[typeshare(serialized_as = "number")]
  pub swap_bytes: u64,
  #[serde(default)]
  #[typeshare(serialized_as = "number")]
  pub disk_bytes: u64,
  #[serde(default)]
  #[typeshare(serialized_as = "number")]
  pub network_bps: u64,
  #[serde(default)]
  #[typeshare(serialized_as = "number")]
  pub process_count: u64,
  #[serde(default)]
  #[typeshare(serialized_as = "number")]
  pub file_count: u64,
  /// Relative cpu weight, valid range 2..=262144.
  #[serde(default)]
  #[typeshare(serialized_as = "number")]
  pub cpu_shares: Option<i64>,
  #[serde(default)]
  #[typeshare(serialized_as = "number")]
  pub cpu_period_us: Option<i64>,
  #[serde(default)]
  #[typeshare(serialized_as = "number")]
  pub cpu_quota_us: Option<i64>,
  #[serde(default)]
  pub cpu_set_cpus: String,
  #[serde(default)]
  pub cpu_set_mems: String,
  /// Block io weight, valid range 10..=1000.
  #[serde(default)]
  #[typeshare(serialized_as = "number")]
  pub blkio_weight: Option<u16>,
  #[serde(default)]
  #[typeshare(serialized_as = "number")]
  pub memory_reservation: u64,
  #[serde(default)]
  #[typeshare(serialized_as = "number")]
  pub kernel_memory: u64,
  #[serde(default)]
  pub oom_kill_disable: bool,
  /// Valid range -1000..=1000.
  #[serde(default)]
  #[typeshare(serialized_as = "number")]
  pub oom_score_adj: Option<i32>,
  #[serde(default)]
  #[typeshare(serialized_as = "number")]
  pub shm_size: u64,
  #[serde(default)]
  pub ulimits: Vec<Ulimit>,
}

#[typeshare]
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Ulimit {
  pub name: String,
  #[typeshare(serialized_as = "number")]
  pub soft: i64,
  #[typeshare(serialized_as = "number")]
  pub hard: i64,
}

/// Per-app admission ceiling the governor validates limits against.
/// Zero means unbounded for that axis.
#[typeshare]
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ResourceQuota {
  #[serde(default)]
  pub cpu_cores: f64,
  #[serde(default)]
  #[typeshare(serialized_as = "number")]
  pub memory_bytes: u64,
  #[serde(default)]
  #[typeshare(serialized_as = "number")]
  pub disk_bytes: u64,
  #[serde(default)]
  #[typeshare(serialized_as = "number")]
  pub network_bps: u64,
  #[serde(default)]
  #[typeshare(serialized_as = "number")]
  pub process_count: u64,
}

/// Admission record held while a deployment owns its share
/// of the host.
#[typeshare]
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ResourceReservation {
  pub app_id: String,
  pub deployment_id: String,
  #[serde(default)]
  pub container_id: Option<String>,
  pub cpu_cores: f64,
  #[typeshare(serialized_as = "number")]
  pub memory_bytes: u64,
  #[typeshare(serialized_as = "number")]
  pub disk_bytes: u64,
  #[typeshare(serialized_as = "number")]
  pub network_bps: u64,
  #[typeshare(serialized_as = "number")]
  pub allocated_at: i64,
}

/// One usage sample for a live container.
#[typeshare]
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ResourceUsage {
  pub container_id: String,
  pub cpu_percent: f64,
  #[typeshare(serialized_as = "number")]
  pub memory_used_bytes: u64,
  #[typeshare(serialized_as = "number")]
  pub memory_limit_bytes: u64,
  #[typeshare(serialized_as = "number")]
  pub network_rx_bytes: u64,
  #[typeshare(serialized_as = "number")]
  pub network_tx_bytes: u64,
  #[typeshare(serialized_as = "number")]
  pub disk_read_bytes: u64,
  #[typeshare(serialized_as = "number")]
  pub disk_write_bytes: u64,
  #[typeshare(serialized_as = "number")]
  pub process_count: u64,
  #[typeshare(serialized_as = "number")]
  pub timestamp: i64,
}

/// Advisory limits computed from a usage history.
/// Never auto-applied.
#[typeshare]
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct LimitRecommendation {
  pub cpu_cores: f64,
  #[typeshare(serialized_as = "number")]
  pub memory_bytes: u64,
  #[typeshare(serialized_as = "number")]
  pub process_count: u64,
}
