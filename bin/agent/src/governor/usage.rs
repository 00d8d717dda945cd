use std::time::Duration;

use arbor_client::entities::resource::{
  LimitRecommendation, ResourceLimits, ResourceUsage,
};
use tokio_util::sync::CancellationToken;

use crate::docker::docker_client;

/// Sample a container on `period` until the token is cancelled,
/// handing each sample to `callback`. Sample errors are logged and
/// never end the loop.
pub async fn monitor_resource_usage(
  container_id: String,
  container_name: String,
  period: Duration,
  cancel: CancellationToken,
  mut callback: impl FnMut(ResourceUsage),
) {
  loop {
    tokio::select! {
      _ = cancel.cancelled() => return,
      _ = tokio::time::sleep(period) => {}
    }
    match docker_client()
      .resource_usage(&container_id, &container_name)
      .await
    {
      Ok(usage) => callback(usage),
      Err(e) => {
        tracing::debug!(
          "resource sample failed for {container_name} | {e:#}"
        );
      }
    }
  }
}

/// Advisory right-sizing from a usage history: headroom factors
/// over the observed maxima. Never auto-applied.
pub fn recommend_limits(
  history: &[ResourceUsage],
  current: &ResourceLimits,
) -> Option<LimitRecommendation> {
  if history.is_empty() {
    return None;
  }
  let max_cpu_fraction = history
    .iter()
    .map(|sample| sample.cpu_percent / 100.0)
    .fold(0.0f64, f64::max);
  let max_memory = history
    .iter()
    .map(|sample| sample.memory_used_bytes)
    .max()
    .unwrap_or_default();
  let max_processes = history
    .iter()
    .map(|sample| sample.process_count)
    .max()
    .unwrap_or_default();

  let cpu_cores = if max_cpu_fraction > 0.0 {
    max_cpu_fraction * 1.2
  } else {
    current.cpu_cores
  };
  Some(LimitRecommendation {
    cpu_cores,
    memory_bytes: (max_memory as f64 * 1.3) as u64,
    process_count: (max_processes as f64 * 1.5) as u64,
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  fn sample(
    cpu_percent: f64,
    memory: u64,
    processes: u64,
  ) -> ResourceUsage {
    ResourceUsage {
      cpu_percent,
      memory_used_bytes: memory,
      process_count: processes,
      ..Default::default()
    }
  }

  #[test]
  fn recommendation_uses_observed_maxima() {
    let history = vec![
      sample(20.0, 100_000_000, 10),
      sample(50.0, 300_000_000, 40),
      sample(35.0, 200_000_000, 25),
    ];
    let rec =
      recommend_limits(&history, &ResourceLimits::default())
        .unwrap();
    assert!((rec.cpu_cores - 0.6).abs() < 1e-9);
    assert_eq!(rec.memory_bytes, 390_000_000);
    assert_eq!(rec.process_count, 60);
  }

  #[test]
  fn empty_history_yields_nothing() {
    assert!(
      recommend_limits(&[], &ResourceLimits::default()).is_none()
    );
  }
}
