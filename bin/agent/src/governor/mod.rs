use arbor_client::{
  entities::{
    arbor_timestamp,
    resource::{ResourceLimits, ResourceQuota, ResourceReservation},
  },
  error::{AgentError, ErrorKind},
};
use dashmap::DashMap;

mod enforce;
mod usage;

pub use enforce::enforce_limits;
pub use usage::{monitor_resource_usage, recommend_limits};

pub const CPU_SHARES_RANGE: (i64, i64) = (2, 262144);
pub const BLKIO_WEIGHT_RANGE: (u16, u16) = (10, 1000);
pub const OOM_SCORE_ADJ_RANGE: (i32, i32) = (-1000, 1000);

/// Gatekeeper for resource admission. Limits are validated against
/// the configured quota before any image work happens, and a
/// reservation is held for the deployment until removal.
pub struct ResourceGovernor {
  quota: ResourceQuota,
  max_containers: usize,
  reservations: DashMap<String, ResourceReservation>,
}

impl ResourceGovernor {
  pub fn new(
    quota: ResourceQuota,
    max_containers: usize,
  ) -> ResourceGovernor {
    ResourceGovernor {
      quota,
      max_containers,
      reservations: Default::default(),
    }
  }

  /// Range checks are enforced here, not left to the runtime.
  pub fn validate(
    &self,
    limits: &ResourceLimits,
  ) -> Result<(), AgentError> {
    if let Some(cpu_shares) = limits.cpu_shares
      && !(CPU_SHARES_RANGE.0..=CPU_SHARES_RANGE.1)
        .contains(&cpu_shares)
    {
      return Err(AgentError::msg(
        ErrorKind::InvalidLimits,
        format!(
          "cpu_shares {cpu_shares} outside valid range {}..={}",
          CPU_SHARES_RANGE.0, CPU_SHARES_RANGE.1
        ),
      ));
    }
    if let Some(blkio_weight) = limits.blkio_weight
      && !(BLKIO_WEIGHT_RANGE.0..=BLKIO_WEIGHT_RANGE.1)
        .contains(&blkio_weight)
    {
      return Err(AgentError::msg(
        ErrorKind::InvalidLimits,
        format!(
          "blkio_weight {blkio_weight} outside valid range {}..={}",
          BLKIO_WEIGHT_RANGE.0, BLKIO_WEIGHT_RANGE.1
        ),
      ));
    }
    if let Some(oom_score_adj) = limits.oom_score_adj
      && !(OOM_SCORE_ADJ_RANGE.0..=OOM_SCORE_ADJ_RANGE.1)
        .contains(&oom_score_adj)
    {
      return Err(AgentError::msg(
        ErrorKind::InvalidLimits,
        format!(
          "oom_score_adj {oom_score_adj} outside valid range {}..={}",
          OOM_SCORE_ADJ_RANGE.0, OOM_SCORE_ADJ_RANGE.1
        ),
      ));
    }

    check_quota(
      "cpu_cores",
      limits.cpu_cores,
      self.quota.cpu_cores,
    )?;
    check_quota(
      "memory_bytes",
      limits.memory_bytes as f64,
      self.quota.memory_bytes as f64,
    )?;
    check_quota(
      "disk_bytes",
      limits.disk_bytes as f64,
      self.quota.disk_bytes as f64,
    )?;
    check_quota(
      "network_bps",
      limits.network_bps as f64,
      self.quota.network_bps as f64,
    )?;
    check_quota(
      "process_count",
      limits.process_count as f64,
      self.quota.process_count as f64,
    )?;

    Ok(())
  }

  /// Validate and record the reservation for a deployment.
  pub fn reserve(
    &self,
    deployment_id: &str,
    app_id: &str,
    limits: &ResourceLimits,
  ) -> Result<(), AgentError> {
    self.validate(limits)?;
    if self.reservations.len() >= self.max_containers
      && !self.reservations.contains_key(deployment_id)
    {
      return Err(AgentError::msg(
        ErrorKind::QuotaExceeded,
        format!(
          "host container capacity reached ({})",
          self.max_containers
        ),
      ));
    }
    self.reservations.insert(
      deployment_id.to_string(),
      ResourceReservation {
        app_id: app_id.to_string(),
        deployment_id: deployment_id.to_string(),
        container_id: None,
        cpu_cores: limits.cpu_cores,
        memory_bytes: limits.memory_bytes,
        disk_bytes: limits.disk_bytes,
        network_bps: limits.network_bps,
        allocated_at: arbor_timestamp(),
      },
    );
    Ok(())
  }

  /// Attach the container id once the container exists.
  pub fn assign_container(
    &self,
    deployment_id: &str,
    container_id: &str,
  ) {
    if let Some(mut reservation) =
      self.reservations.get_mut(deployment_id)
    {
      reservation.container_id = Some(container_id.to_string());
    }
  }

  pub fn release(&self, deployment_id: &str) {
    self.reservations.remove(deployment_id);
  }

  pub fn reservation(
    &self,
    deployment_id: &str,
  ) -> Option<ResourceReservation> {
    self
      .reservations
      .get(deployment_id)
      .map(|r| r.value().clone())
  }

  pub fn reservation_count(&self) -> usize {
    self.reservations.len()
  }
}

fn check_quota(
  axis: &str,
  requested: f64,
  quota: f64,
) -> Result<(), AgentError> {
  // Zero quota means the axis is unbounded.
  if quota > 0.0 && requested > quota {
    return Err(AgentError::msg(
      ErrorKind::QuotaExceeded,
      format!("{axis} {requested} exceeds quota {quota}"),
    ));
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  fn governor() -> ResourceGovernor {
    ResourceGovernor::new(
      ResourceQuota {
        cpu_cores: 4.0,
        memory_bytes: 2 * 1024 * 1024 * 1024,
        ..Default::default()
      },
      2,
    )
  }

  #[test]
  fn cpu_shares_boundaries() {
    let governor = governor();
    let mut limits = ResourceLimits {
      cpu_shares: Some(1),
      ..Default::default()
    };
    let err = governor.validate(&limits).unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidLimits);
    limits.cpu_shares = Some(2);
    governor.validate(&limits).unwrap();
    limits.cpu_shares = Some(262144);
    governor.validate(&limits).unwrap();
    limits.cpu_shares = Some(262145);
    assert!(governor.validate(&limits).is_err());
  }

  #[test]
  fn blkio_weight_boundaries() {
    let governor = governor();
    let mut limits = ResourceLimits {
      blkio_weight: Some(9),
      ..Default::default()
    };
    assert_eq!(
      governor.validate(&limits).unwrap_err().kind,
      ErrorKind::InvalidLimits
    );
    limits.blkio_weight = Some(10);
    governor.validate(&limits).unwrap();
    limits.blkio_weight = Some(1000);
    governor.validate(&limits).unwrap();
  }

  #[test]
  fn oom_score_adj_boundaries() {
    let governor = governor();
    let mut limits = ResourceLimits {
      oom_score_adj: Some(-1001),
      ..Default::default()
    };
    assert_eq!(
      governor.validate(&limits).unwrap_err().kind,
      ErrorKind::InvalidLimits
    );
    limits.oom_score_adj = Some(-1000);
    governor.validate(&limits).unwrap();
  }

  #[test]
  fn quota_rejection_is_quota_exceeded() {
    let governor = governor();
    let limits = ResourceLimits {
      memory_bytes: 4 * 1024 * 1024 * 1024,
      ..Default::default()
    };
    let err = governor.validate(&limits).unwrap_err();
    assert_eq!(err.kind, ErrorKind::QuotaExceeded);
  }

  #[test]
  fn reservations_respect_capacity_and_release() {
    let governor = governor();
    let limits = ResourceLimits::default();
    governor.reserve("d-1", "app", &limits).unwrap();
    governor.reserve("d-2", "app", &limits).unwrap();
    let err =
      governor.reserve("d-3", "app", &limits).unwrap_err();
    assert_eq!(err.kind, ErrorKind::QuotaExceeded);

    // Re-reserving an existing deployment is not a new slot.
    governor.reserve("d-2", "app", &limits).unwrap();

    governor.release("d-1");
    governor.reserve("d-3", "app", &limits).unwrap();
    assert_eq!(governor.reservation_count(), 2);
  }

  #[test]
  fn assign_container_updates_reservation() {
    let governor = governor();
    governor
      .reserve("d-1", "app", &ResourceLimits::default())
      .unwrap();
    governor.assign_container("d-1", "abc123");
    assert_eq!(
      governor.reservation("d-1").unwrap().container_id.as_deref(),
      Some("abc123")
    );
  }
}
