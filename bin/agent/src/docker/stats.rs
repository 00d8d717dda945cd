use anyhow::Context;
use arbor_client::entities::{
  arbor_timestamp, resource::ResourceUsage,
};
use bollard::{models, query_parameters::StatsOptionsBuilder};
use futures::StreamExt;

use super::DockerClient;

impl DockerClient {
  /// One stats sample, similar to `--no-stream` on the cli.
  pub async fn resource_usage(
    &self,
    container_id: &str,
    container_name: &str,
  ) -> anyhow::Result<ResourceUsage> {
    let mut res = self.docker.stats(
      container_name,
      StatsOptionsBuilder::new().stream(false).build().into(),
    );
    let stats = res
      .next()
      .await
      .with_context(|| format!("unable to get container stats for {container_name} (got None)"))?
      .with_context(|| format!("unable to get container stats for {container_name}"))?;
    Ok(convert_stats(container_id, stats))
  }
}

fn convert_stats(
  container_id: &str,
  stats: models::ContainerStatsResponse,
) -> ResourceUsage {
  let (network_rx_bytes, network_tx_bytes) = stats
    .networks
    .as_ref()
    .map(|networks| {
      networks.values().fold((0, 0), |(rx, tx), iface| {
        (
          rx + iface.rx_bytes.unwrap_or_default(),
          tx + iface.tx_bytes.unwrap_or_default(),
        )
      })
    })
    .unwrap_or_default();

  let (disk_read_bytes, disk_write_bytes) = stats
    .blkio_stats
    .as_ref()
    .and_then(|blkio| blkio.io_service_bytes_recursive.as_ref())
    .map(|entries| {
      let mut read = 0;
      let mut write = 0;
      for entry in entries {
        match entry.op.as_deref() {
          Some("read") | Some("Read") => {
            read += entry.value.unwrap_or_default()
          }
          Some("write") | Some("Write") => {
            write += entry.value.unwrap_or_default()
          }
          _ => {}
        }
      }
      (read, write)
    })
    .unwrap_or_default();

  ResourceUsage {
    container_id: container_id.to_string(),
    cpu_percent: cpu_percent(
      stats.cpu_stats.as_ref(),
      stats.precpu_stats.as_ref(),
    ),
    memory_used_bytes: stats
      .memory_stats
      .as_ref()
      .and_then(|memory| memory.usage)
      .unwrap_or_default(),
    memory_limit_bytes: stats
      .memory_stats
      .as_ref()
      .and_then(|memory| memory.limit)
      .unwrap_or_default(),
    network_rx_bytes,
    network_tx_bytes,
    disk_read_bytes,
    disk_write_bytes,
    process_count: stats
      .pids_stats
      .as_ref()
      .and_then(|pids| pids.current)
      .unwrap_or_default(),
    timestamp: arbor_timestamp(),
  }
}

/// Usage fraction over the sampling window, scaled to the number
/// of online cpus, as a percentage.
fn cpu_percent(
  cpu: Option<&models::ContainerCpuStats>,
  precpu: Option<&models::ContainerCpuStats>,
) -> f64 {
  let (Some(cpu), Some(precpu)) = (cpu, precpu) else {
    return 0.0;
  };
  let total = cpu
    .cpu_usage
    .as_ref()
    .and_then(|usage| usage.total_usage)
    .unwrap_or_default();
  let pre_total = precpu
    .cpu_usage
    .as_ref()
    .and_then(|usage| usage.total_usage)
    .unwrap_or_default();
  let system = cpu.system_cpu_usage.unwrap_or_default();
  let pre_system = precpu.system_cpu_usage.unwrap_or_default();
  let cpu_delta = total.saturating_sub(pre_total) as f64;
  let system_delta = system.saturating_sub(pre_system) as f64;
  if system_delta <= 0.0 || cpu_delta < 0.0 {
    return 0.0;
  }
  let online = cpu.online_cpus.unwrap_or(1).max(1) as f64;
  (cpu_delta / system_delta) * online * 100.0
}
