use std::sync::{Arc, OnceLock};

use arbor_client::entities::{arbor_timestamp, stats::SystemStats};
use arc_swap::ArcSwap;
use async_timing_util::{Timelength, wait_until_timelength};
use sysinfo::System;

/// Latest host stats sample. Refreshed on a fixed cadence,
/// read by heartbeats and the status endpoint.
pub fn system_stats() -> &'static ArcSwap<SystemStats> {
  static SYSTEM_STATS: OnceLock<ArcSwap<SystemStats>> =
    OnceLock::new();
  SYSTEM_STATS.get_or_init(Default::default)
}

pub fn spawn_polling_thread() {
  tokio::spawn(async move {
    // Two refreshes are needed before cpu usage is meaningful.
    let mut sys = System::new_all();
    tokio::time::sleep(std::time::Duration::from_millis(250)).await;
    refresh(&mut sys);
    loop {
      let _ts =
        wait_until_timelength(Timelength::FifteenSeconds, 200)
          .await;
      refresh(&mut sys);
    }
  });
}

fn refresh(sys: &mut System) {
  sys.refresh_cpu_usage();
  sys.refresh_memory();

  let disks = sysinfo::Disks::new_with_refreshed_list();
  let (disk_total, disk_available) = disks.iter().fold(
    (0u64, 0u64),
    |(total, available), disk| {
      (
        total + disk.total_space(),
        available + disk.available_space(),
      )
    },
  );

  let networks = sysinfo::Networks::new_with_refreshed_list();
  let (network_rx, network_tx) = networks.iter().fold(
    (0u64, 0u64),
    |(rx, tx), (_name, data)| {
      (rx + data.total_received(), tx + data.total_transmitted())
    },
  );

  system_stats().store(Arc::new(SystemStats {
    cpu_percent: sys.global_cpu_usage() as f64,
    memory_used_bytes: sys.used_memory(),
    memory_total_bytes: sys.total_memory(),
    disk_used_bytes: disk_total.saturating_sub(disk_available),
    disk_total_bytes: disk_total,
    network_rx_bytes: network_rx,
    network_tx_bytes: network_tx,
    refreshed_at: arbor_timestamp(),
  }));
}
