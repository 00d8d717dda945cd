use std::sync::Arc;

use arbor_client::entities::{
  Log, deployment::DeploymentState,
};

use super::DeploymentEngine;
use crate::{docker::docker_client, edge};

/// Crash recovery: rebuild the in-memory table from the store and
/// adopt containers that survived the restart. A persisted
/// `Running` deployment whose container is alive is adopted as-is;
/// one whose container is gone is marked `Failed`. Nothing is
/// rebuilt automatically.
pub async fn reconcile(
  engine: &Arc<DeploymentEngine>,
) -> anyhow::Result<()> {
  let persisted =
    engine.store.list_deployments().await.map_err(|e| e.error)?;
  if persisted.is_empty() {
    return Ok(());
  }
  tracing::info!(
    "reconciling {} persisted deployment(s)",
    persisted.len()
  );

  for mut deployment in persisted {
    let id = deployment.id.clone();
    if deployment.status == DeploymentState::Stopping {
      // Finish the interrupted stop.
      let _ =
        crate::docker::stop_container(&deployment.container_name, None)
          .await;
      deployment.status = DeploymentState::Stopped;
      deployment.container_id = None;
      deployment.deployment_logs.push(Log::simple(
        "Reconcile",
        String::from("completed stop interrupted by restart"),
      ));
      engine.insert(deployment).await.map_err(|e| e.error)?;
      let _ = edge::remove_route_fragment(&id).await;
      continue;
    }
    if !deployment.expects_container() {
      // In-flight orchestration states did not survive the crash.
      if !deployment.status.is_terminal() {
        deployment.status = DeploymentState::Failed;
        deployment.container_id = None;
        deployment.deployment_logs.push(Log::error(
          "Reconcile",
          String::from("agent restarted mid-orchestration"),
        ));
      }
      engine.insert(deployment).await.map_err(|e| e.error)?;
      continue;
    }

    let inspect = docker_client()
      .inspect_container(&deployment.container_name)
      .await?;
    match inspect {
      Some(container) if container.running => {
        // Adopt: same name, skip create, re-arm supervision via
        // the scheduler. Reservation is re-recorded.
        deployment.container_id = Some(container.id.clone());
        deployment.status = DeploymentState::Running;
        deployment.deployment_logs.push(Log::simple(
          "Reconcile",
          format!(
            "adopted running container {}",
            deployment.container_name
          ),
        ));
        let _ = engine.governor.reserve(
          &id,
          &deployment.app_id,
          &deployment.resource_limits,
        );
        engine.governor.assign_container(&id, &container.id);
        // Re-assert limits on the adopted container.
        if let Err(e) = crate::governor::enforce_limits(
          &deployment.container_name,
          &deployment.resource_limits,
        )
        .await
        {
          tracing::warn!(
            "limit enforcement failed on adopted container | {e:#}"
          );
        }
        if let Err(e) = edge::write_route_fragment(&deployment).await
        {
          tracing::warn!(
            "failed to restore route fragment for {id} | {e:#}"
          );
        }
        engine.insert(deployment).await.map_err(|e| e.error)?;
      }
      _ => {
        deployment.status = DeploymentState::Failed;
        deployment.container_id = None;
        deployment.deployment_logs.push(Log::error(
          "Reconcile",
          String::from(
            "container not running after agent restart",
          ),
        ));
        engine.insert(deployment).await.map_err(|e| e.error)?;
        if let Err(e) = edge::remove_route_fragment(&id).await {
          tracing::warn!(
            "failed to remove route fragment for {id} | {e:#}"
          );
        }
      }
    }
  }
  Ok(())
}
