use std::{sync::Arc, time::Duration};

use anyhow::anyhow;
use arbor_client::{
  entities::{
    Log, arbor_timestamp,
    deployment::{
      DeployStrategy, Deployment, DeploymentState, RollbackRecord,
      container_name, deployment_id,
    },
  },
  error::{AgentError, ErrorKind},
};
use formatting::format_serror;

use super::{DeploymentEngine, container, image, supervise};
use crate::{config::agent_config, docker, edge, supervisor};

/// Drive a deployment from `Pending` to `Running` under the agent
/// context and the deployment's progress timeout. `replaces` is
/// the id of a live prior version of the same app being updated.
pub async fn run(
  engine: Arc<DeploymentEngine>,
  id: String,
  replaces: Option<String>,
) {
  let Ok(deployment) = engine.require(&id) else {
    return;
  };
  // The unsanitized snapshot: it becomes the rollback source and
  // must keep real secret values.
  let old_snapshot = replaces
    .as_ref()
    .and_then(|old_id| engine.require(old_id).ok());
  let budget =
    Duration::from_secs(deployment.config.progress_timeout.max(1));

  let pipeline =
    pipeline(&engine, &id, replaces.clone());
  let result = tokio::select! {
    _ = engine.cancel.cancelled() => {
      tracing::info!("orchestration of {id} abandoned on shutdown");
      return;
    }
    result = tokio::time::timeout(budget, pipeline) => match result {
      Ok(result) => result,
      Err(_elapsed) => Err(AgentError::msg(
        ErrorKind::DeadlineExceeded,
        format!(
          "deployment did not reach Running within {}s",
          budget.as_secs()
        ),
      )),
    },
  };

  match result {
    Ok(()) => {
      if let (Some(old_id), Some(mut old)) =
        (replaces, old_snapshot)
      {
        old.previous = None;
        let res = engine
          .update(&id, |deployment| {
            deployment.previous = Some(Box::new(old));
          })
          .await;
        if let Err(e) = res {
          tracing::warn!(
            "failed to record previous version | {e:#}"
          );
        }
        if let Err(e) = engine.remove(&old_id).await {
          tracing::warn!(
            "failed to remove replaced deployment {old_id} | {e:#}"
          );
        }
      }
    }
    Err(e) => {
      engine.fail(&id, "Orchestration", e.error, true).await;
    }
  }
}

/// Re-materialise `previous` as a replacement for `current_id`.
/// Success replaces the current deployment; failure leaves its
/// container untouched and restores it to `Running`.
pub async fn run_rollback(
  engine: Arc<DeploymentEngine>,
  current_id: String,
  previous: Deployment,
  record: RollbackRecord,
) {
  let Ok(current) = engine.require(&current_id) else {
    return;
  };

  let new_id = deployment_id(
    &previous.app_id,
    &previous.version,
    arbor_timestamp() / 1000,
  );
  let now = arbor_timestamp();
  let replacement = Deployment {
    container_name: container_name(&new_id),
    id: new_id.clone(),
    status: DeploymentState::Pending,
    container_id: None,
    deployed_at: None,
    metrics: None,
    last_health_check: None,
    created_at: now,
    updated_at: now,
    rollback: Some(record),
    previous: None,
    ..previous
  };
  {
    let res = engine
      .insert(replacement.clone())
      .await;
    if let Err(e) = res {
      tracing::error!(
        "failed to persist rollback deployment | {e:#}"
      );
      return;
    }
  }

  let budget = Duration::from_secs(
    replacement.config.progress_timeout.max(1),
  );
  let result = tokio::select! {
    _ = engine.cancel.cancelled() => return,
    result = tokio::time::timeout(
      budget,
      pipeline(&engine, &new_id, Some(current_id.clone())),
    ) => match result {
      Ok(result) => result,
      Err(_elapsed) => Err(AgentError::msg(
        ErrorKind::DeadlineExceeded,
        format!(
          "rollback did not reach Running within {}s",
          budget.as_secs()
        ),
      )),
    },
  };

  match result {
    Ok(()) => {
      let mut old = current;
      old.previous = None;
      let res = engine
        .update(&new_id, |deployment| {
          deployment.previous = Some(Box::new(old));
        })
        .await;
      if let Err(e) = res {
        tracing::warn!("failed to record rollback source | {e:#}");
      }
      if let Err(e) = engine.remove(&current_id).await {
        tracing::warn!(
          "failed to remove rolled-back deployment | {e:#}"
        );
      }
    }
    Err(e) => {
      engine.fail(&new_id, "Rollback", e.error, true).await;
      // The prior container was never touched; restore it.
      let res = engine
        .update(&current_id, |deployment| {
          deployment.status = DeploymentState::Running;
          deployment.deployment_logs.push(Log::error(
            "Rollback",
            String::from(
              "rollback failed, previous container untouched",
            ),
          ));
        })
        .await;
      if let Err(e) = res {
        tracing::error!(
          "failed to restore deployment after rollback failure | {e:#}"
        );
      }
    }
  }
}

/// The orchestration pipeline. With `swap_with` set, route
/// publication is deferred until the new container passed
/// readiness and the old deployment released the route.
async fn pipeline(
  engine: &Arc<DeploymentEngine>,
  id: &str,
  swap_with: Option<String>,
) -> Result<(), AgentError> {
  let deployment = engine.require(id)?;

  // 1. Materialise the image (build or pull).
  engine.transition(id, DeploymentState::Building).await?;
  let image = image::materialise(engine, &deployment).await?;
  engine
    .update(id, |deployment| {
      deployment.image = image.clone();
    })
    .await?;

  // Recreate strategy tears the old version down before the new
  // container exists; rolling / blue-green keep it serving until
  // the swap.
  if let Some(old_id) = &swap_with
    && deployment.config.strategy == DeployStrategy::Recreate
  {
    engine.stop(old_id).await?;
  }

  // 2. Reserve resources.
  engine.governor.reserve(
    id,
    &deployment.app_id,
    &deployment.resource_limits,
  )?;

  // 3 + 4. Create and start the container.
  engine.transition(id, DeploymentState::Deploying).await?;
  let stale = docker::remove_container(
    &deployment.container_name,
    true,
  )
  .await;
  if stale.success {
    tracing::debug!(
      "removed stale container {}",
      deployment.container_name
    );
  }
  let run_log = container_run(engine, id, &deployment, &image).await?;
  engine.append_log(id, run_log).await;

  let inspect = docker::docker_client()
    .inspect_container(&deployment.container_name)
    .await
    .map_err(|e| {
      AgentError::new(ErrorKind::RuntimeUnavailable, e)
    })?
    .ok_or_else(|| {
      AgentError::msg(
        ErrorKind::StartFailed,
        "container missing directly after start",
      )
    })?;
  engine
    .update(id, |deployment| {
      deployment.container_id = Some(inspect.id.clone());
    })
    .await?;
  engine.governor.assign_container(id, &inspect.id);

  for network in deployment.networks.iter().skip(1) {
    let log =
      docker::connect_network(&deployment.container_name, network)
        .await;
    engine.append_log(id, log).await;
  }

  if swap_with.is_none() {
    // 5. Publish the route, then 6. gate on readiness.
    publish_route(engine, id).await?;
    readiness_gate(engine, id, &deployment).await?;
  } else {
    // Swap: readiness first, then move the route over.
    readiness_gate(engine, id, &deployment).await?;
    if let Some(old_id) = &swap_with {
      if let Ok(old) = engine.require(old_id)
        && old.status != DeploymentState::Stopped
      {
        engine.stop(old_id).await?;
      }
      edge::remove_route_fragment(old_id).await.map_err(|e| {
        AgentError::new(ErrorKind::Internal, e)
      })?;
    }
    publish_route(engine, id).await?;
  }

  // 7. Promote and arm continuous supervision.
  engine.transition(id, DeploymentState::Running).await?;
  supervise::arm(engine, id);
  Ok(())
}

async fn container_run(
  engine: &Arc<DeploymentEngine>,
  id: &str,
  deployment: &Deployment,
  image: &str,
) -> Result<Log, AgentError> {
  let command = container::docker_run_command(
    deployment,
    image,
    &agent_config().docker.network_name,
  );
  let log =
    command::run_agent_command("Docker Run", None, command).await;
  if log.success {
    return Ok(log);
  }
  let stderr = log.stderr.replace('\n', " | ");
  engine.append_log(id, log).await;
  // A failed `docker run` may leave a created container behind.
  let _ =
    docker::remove_container(&deployment.container_name, true).await;
  Err(AgentError::msg(
    ErrorKind::StartFailed,
    format!(
      "failed to start container {}: {stderr}",
      deployment.container_name,
    ),
  ))
}

async fn publish_route(
  engine: &Arc<DeploymentEngine>,
  id: &str,
) -> Result<(), AgentError> {
  let deployment = engine.require(id)?;
  match edge::write_route_fragment(&deployment).await {
    Ok(Some(path)) => {
      engine
        .append_log(
          id,
          Log::simple(
            "Publish Route",
            format!("route fragment written to {}", path.display()),
          ),
        )
        .await;
      Ok(())
    }
    // Port-less deployments are not externally addressable;
    // the route is not required.
    Ok(None) => Ok(()),
    Err(e) => Err(AgentError::new(
      ErrorKind::Internal,
      e.context("failed to publish route fragment"),
    )),
  }
}

async fn readiness_gate(
  engine: &Arc<DeploymentEngine>,
  id: &str,
  deployment: &Deployment,
) -> Result<(), AgentError> {
  engine
    .transition(id, DeploymentState::HealthCheck)
    .await?;
  let Some(health_check) = &deployment.health_check else {
    return Ok(());
  };
  match supervisor::wait_for_container_ready(
    &deployment.container_name,
    &deployment.container_name,
    health_check,
  )
  .await
  {
    Ok(result) => {
      engine.record_health(id, result).await;
      Ok(())
    }
    Err(e) => {
      engine
        .append_log(
          id,
          Log::error(
            "Readiness",
            format_serror(&anyhow!("{e}").into()),
          ),
        )
        .await;
      Err(e)
    }
  }
}
