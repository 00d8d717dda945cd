use std::{sync::Arc, time::Duration};

use arbor_client::entities::deployment::DeploymentState;
use async_timing_util::{Timelength, wait_until_timelength};
use tokio_util::sync::CancellationToken;

use super::DeploymentEngine;
use crate::supervisor::{self, LivenessCounters, LivenessVerdict};

/// Arm continuous supervision for one deployment. Any existing
/// supervision task for the id is cancelled first. The task holds
/// only the deployment id and looks up the snapshot each tick, so
/// removal never leaves it with a dangling reference.
pub fn arm(engine: &Arc<DeploymentEngine>, id: &str) {
  engine.disarm_supervision(id);
  let cancel = engine.cancel.child_token();
  engine.supervisors.insert(id.to_string(), cancel.clone());
  let engine = engine.clone();
  let id = id.to_string();
  tokio::spawn(async move {
    supervision_loop(engine, id, cancel).await;
  });
}

async fn supervision_loop(
  engine: Arc<DeploymentEngine>,
  id: String,
  cancel: CancellationToken,
) {
  let mut counters = LivenessCounters::default();
  let mut first_probe = true;
  loop {
    let Some(deployment) = engine.get(&id) else {
      return;
    };
    if deployment.status != DeploymentState::Running {
      return;
    }
    let Some(config) = deployment.health_check.clone() else {
      return;
    };
    tokio::select! {
      _ = cancel.cancelled() => return,
      _ = tokio::time::sleep(
        Duration::from_secs(config.period.max(1)),
      ) => {}
    }
    // The first probe after arming honors the initial delay.
    let result = if first_probe {
      first_probe = false;
      supervisor::perform_health_check(
        &deployment.container_name,
        &deployment.container_name,
        &config,
      )
      .await
    } else {
      supervisor::probe(
        &deployment.container_name,
        &deployment.container_name,
        &config,
      )
      .await
    };
    let success = result.success;
    engine.record_health(&id, result).await;
    match counters.observe(success, &config) {
      LivenessVerdict::Failed => {
        engine.handle_liveness_failure(&id).await;
        counters = LivenessCounters::default();
      }
      LivenessVerdict::Recovered => {
        tracing::info!("deployment {id} recovered liveness");
      }
      LivenessVerdict::Steady => {}
    }
  }
}

/// Metrics collection: keeps one usage monitor per running
/// deployment, arming and disarming on a fixed cadence.
/// Collection errors never transition deployment state.
pub fn spawn_metrics_loop(engine: Arc<DeploymentEngine>) {
  tokio::spawn(async move {
    loop {
      tokio::select! {
        _ = engine.cancel.cancelled() => return,
        _ = wait_until_timelength(
          Timelength::FifteenSeconds, 300,
        ) => {}
      }
      let deployments = engine.list();

      // Disarm monitors whose deployment is gone or not running.
      let stale: Vec<String> = engine
        .monitors
        .iter()
        .filter(|entry| {
          !deployments.iter().any(|deployment| {
            deployment.id == *entry.key()
              && deployment.status == DeploymentState::Running
          })
        })
        .map(|entry| entry.key().clone())
        .collect();
      for id in stale {
        if let Some((_, cancel)) = engine.monitors.remove(&id) {
          cancel.cancel();
        }
      }

      for deployment in deployments {
        if deployment.status != DeploymentState::Running
          || engine.monitors.contains_key(&deployment.id)
        {
          continue;
        }
        let Some(container_id) = deployment.container_id.clone()
        else {
          continue;
        };
        let cancel = engine.cancel.child_token();
        engine
          .monitors
          .insert(deployment.id.clone(), cancel.clone());
        let callback_engine = engine.clone();
        let id = deployment.id.clone();
        tokio::spawn(crate::governor::monitor_resource_usage(
          container_id,
          deployment.container_name.clone(),
          Duration::from_secs(15),
          cancel,
          move |usage| {
            let engine = callback_engine.clone();
            let id = id.clone();
            tokio::spawn(async move {
              engine.record_metrics(&id, usage).await;
            });
          },
        ));
      }
    }
  });
}

/// Make sure every running deployment with a health check has a
/// live supervision task. Covers supervision lost to crash
/// recovery or a panicked task.
pub fn spawn_supervision_scheduler(engine: Arc<DeploymentEngine>) {
  tokio::spawn(async move {
    loop {
      tokio::select! {
        _ = engine.cancel.cancelled() => return,
        _ = wait_until_timelength(
          Timelength::ThirtySeconds, 300,
        ) => {}
      }
      for deployment in engine.list() {
        if deployment.status == DeploymentState::Running
          && deployment.health_check.is_some()
          && !engine.supervisors.contains_key(&deployment.id)
        {
          arm(&engine, &deployment.id);
        }
      }
    }
  });
}
