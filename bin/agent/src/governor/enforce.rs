use std::fmt::Write;

use anyhow::anyhow;
use arbor_client::entities::{Log, resource::ResourceLimits};
use command::run_agent_command;

/// Apply limits to a live container through `docker update`.
/// Best effort: flags the runtime rejects are reported through the
/// returned error while the log of the attempt is kept.
pub async fn enforce_limits(
  container_name: &str,
  limits: &ResourceLimits,
) -> anyhow::Result<Log> {
  let flags = update_flags(limits);
  if flags.is_empty() {
    return Ok(Log::simple(
      "Enforce Limits",
      String::from("no runtime-enforceable limits set"),
    ));
  }
  let log = run_agent_command(
    "Enforce Limits",
    None,
    format!("docker update{flags} {container_name}"),
  )
  .await;
  if log.success {
    Ok(log)
  } else {
    tracing::warn!(
      "partial limit enforcement on {container_name} | {}",
      log.stderr.replace('\n', " | "),
    );
    Err(anyhow!("{}", log.stderr.replace('\n', " | ")).context(
      format!("docker update failed for {container_name}"),
    ))
  }
}

fn update_flags(limits: &ResourceLimits) -> String {
  let mut flags = String::new();
  if limits.cpu_cores > 0.0 {
    let _ = write!(flags, " --cpus {}", limits.cpu_cores);
  }
  if let Some(cpu_shares) = limits.cpu_shares {
    let _ = write!(flags, " --cpu-shares {cpu_shares}");
  }
  if let Some(cpu_period_us) = limits.cpu_period_us {
    let _ = write!(flags, " --cpu-period {cpu_period_us}");
  }
  if let Some(cpu_quota_us) = limits.cpu_quota_us {
    let _ = write!(flags, " --cpu-quota {cpu_quota_us}");
  }
  if !limits.cpu_set_cpus.is_empty() {
    let _ = write!(flags, " --cpuset-cpus {}", limits.cpu_set_cpus);
  }
  if !limits.cpu_set_mems.is_empty() {
    let _ = write!(flags, " --cpuset-mems {}", limits.cpu_set_mems);
  }
  if limits.memory_bytes > 0 {
    let _ = write!(flags, " --memory {}b", limits.memory_bytes);
  }
  if limits.swap_bytes > 0 {
    let _ = write!(
      flags,
      " --memory-swap {}b",
      limits.memory_bytes + limits.swap_bytes
    );
  }
  if limits.memory_reservation > 0 {
    let _ = write!(
      flags,
      " --memory-reservation {}b",
      limits.memory_reservation
    );
  }
  if limits.process_count > 0 {
    let _ = write!(flags, " --pids-limit {}", limits.process_count);
  }
  if let Some(blkio_weight) = limits.blkio_weight {
    let _ = write!(flags, " --blkio-weight {blkio_weight}");
  }
  flags
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn flags_cover_set_limits() {
    let limits = ResourceLimits {
      cpu_cores: 1.5,
      memory_bytes: 512 * 1024 * 1024,
      swap_bytes: 256 * 1024 * 1024,
      process_count: 100,
      cpu_shares: Some(512),
      blkio_weight: Some(300),
      cpu_set_cpus: "0-1".to_string(),
      ..Default::default()
    };
    let flags = update_flags(&limits);
    assert!(flags.contains("--cpus 1.5"));
    assert!(flags.contains("--memory 536870912b"));
    // memory-swap is memory + swap.
    assert!(flags.contains("--memory-swap 805306368b"));
    assert!(flags.contains("--pids-limit 100"));
    assert!(flags.contains("--cpu-shares 512"));
    assert!(flags.contains("--blkio-weight 300"));
    assert!(flags.contains("--cpuset-cpus 0-1"));
  }

  #[test]
  fn no_flags_for_default_limits() {
    assert!(update_flags(&ResourceLimits::default()).is_empty());
  }
}
