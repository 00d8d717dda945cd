use anyhow::Context;
use arbor_client::{
  entities::{
    Command, JsonValue, all_logs_success,
    arbor_timestamp,
    command::CommandOp,
    deployment::GitSource,
  },
  error::{AgentError, ErrorKind, WithKind},
};
use command::run_agent_command;

use crate::{
  backend::build_status_report,
  config::agent_config,
  docker,
  state::state,
};

/// Execute one parsed command. Every arm returns the `data`
/// payload for the terminal response.
pub async fn execute(
  op: CommandOp,
  command: &Command,
) -> Result<Option<JsonValue>, AgentError> {
  let engine = &state().engine;
  let target = command.target.as_str();
  match op {
    CommandOp::DeploymentDeploy(request)
    | CommandOp::DeploymentUpdate(request) => {
      let deployment = engine.deploy(request).await?;
      Ok(Some(to_json(&deployment)?))
    }
    CommandOp::DeploymentRollback { reason } => {
      let deployment = engine.rollback(target, &reason).await?;
      Ok(Some(to_json(&deployment)?))
    }
    CommandOp::DeploymentScale { replicas } => {
      scale(target, replicas).await
    }

    CommandOp::ContainerStart => {
      if engine.get(target).is_some() {
        let deployment = engine.start(target).await?;
        Ok(Some(to_json(&deployment)?))
      } else {
        let log = docker::start_container(target).await;
        log_result(log)
      }
    }
    CommandOp::ContainerStop => {
      if engine.get(target).is_some() {
        let deployment = engine.stop(target).await?;
        Ok(Some(to_json(&deployment)?))
      } else {
        let log = docker::stop_container(target, None).await;
        log_result(log)
      }
    }
    CommandOp::ContainerRestart => {
      if engine.get(target).is_some() {
        let deployment = engine.restart(target).await?;
        Ok(Some(to_json(&deployment)?))
      } else {
        let log = docker::restart_container(target).await;
        log_result(log)
      }
    }
    CommandOp::ContainerDelete => {
      if engine.get(target).is_some() {
        engine.remove(target).await?;
        Ok(Some(serde_json::json!({ "removed": target })))
      } else {
        let log = docker::remove_container(target, true).await;
        log_result(log)
      }
    }
    CommandOp::ContainerLogs { tail } => {
      if engine.get(target).is_some() {
        let logs = engine.logs(target, tail as usize)?;
        Ok(Some(to_json(&logs)?))
      } else {
        let log = docker::container_logs(target, tail).await;
        log_result(log)
      }
    }
    CommandOp::ContainerStats => {
      let deployment = engine.get(target).ok_or_else(|| {
        AgentError::msg(
          ErrorKind::NotFound,
          format!("no deployment with id {target}"),
        )
      })?;
      let container_id =
        deployment.container_id.ok_or_else(|| {
          AgentError::msg(
            ErrorKind::InvalidRequest,
            format!("deployment {target} has no container"),
          )
        })?;
      let usage = docker::docker_client()
        .resource_usage(&container_id, &deployment.container_name)
        .await
        .kind(ErrorKind::RuntimeUnavailable)?;
      // Advisory only; limits are never auto-applied.
      let recommendation = crate::governor::recommend_limits(
        &engine.usage_history(target),
        &deployment.resource_limits,
      );
      Ok(Some(serde_json::json!({
        "usage": usage,
        "recommendation": recommendation,
      })))
    }

    CommandOp::GitClone(source) => {
      let destination = git::repo_directory(
        &agent_config().git.cache_dir,
        &source,
      );
      let res = git::clone(&with_config_token(source), &destination)
        .await
        .kind(ErrorKind::Internal)?;
      git_result(res)
    }
    CommandOp::GitPull(source) => {
      let destination = git::repo_directory(
        &agent_config().git.cache_dir,
        &source,
      );
      let res = git::pull_or_clone(
        &with_config_token(source),
        &destination,
      )
      .await
      .kind(ErrorKind::Internal)?;
      git_result(res)
    }
    CommandOp::GitBuild { source, tag } => {
      build_from_source(with_config_token(source), tag).await
    }

    CommandOp::SystemStatus => {
      Ok(Some(to_json(&build_status_report().await)?))
    }
    CommandOp::SystemHealth => Ok(Some(serde_json::json!({
      "healthy": true,
      "uptime_ms": arbor_timestamp() - state().started_at,
      "deployments": state().engine.list().len(),
      "reservations": state().governor.reservation_count(),
    }))),
    CommandOp::SystemCleanup => {
      let log = docker::prune_system().await;
      log_result(log)
    }
    CommandOp::SystemUpdate => Err(AgentError::msg(
      ErrorKind::Internal,
      "unimplemented",
    )),
  }
}

/// `scale` on a single-host agent only toggles between zero and
/// one replica.
async fn scale(
  target: &str,
  replicas: u32,
) -> Result<Option<JsonValue>, AgentError> {
  let engine = &state().engine;
  if replicas > 1 {
    return Err(AgentError::msg(
      ErrorKind::InvalidRequest,
      "replicas > 1 is not supported by a single host agent",
    ));
  }
  let deployment = if replicas == 0 {
    engine.stop(target).await?
  } else {
    let current = engine.require(target)?;
    if current.status.is_terminal() {
      engine.start(target).await?
    } else {
      current
    }
  };
  let deployment = engine
    .update(&deployment.id, |deployment| {
      deployment.config.replicas = replicas;
    })
    .await?;
  Ok(Some(to_json(&deployment.sanitized())?))
}

async fn build_from_source(
  source: GitSource,
  tag: String,
) -> Result<Option<JsonValue>, AgentError> {
  let build_dir = agent_config()
    .agent
    .work_dir
    .join(format!("git-build-{}", arbor_timestamp()));
  let res = async {
    let git_res = git::clone(&source, &build_dir)
      .await
      .kind(ErrorKind::BuildFailed)?;
    if !all_logs_success(&git_res.logs) {
      return Err(AgentError::msg(
        ErrorKind::BuildFailed,
        format!("failed to clone {}", source.url),
      ));
    }
    let mut logs = git_res.logs;
    let build_log = run_agent_command(
      "Docker Build",
      build_dir.as_path(),
      format!(
        "docker build -t {tag} -f {} .",
        source.dockerfile
      ),
    )
    .await;
    let success = build_log.success;
    logs.push(build_log);
    if !success {
      return Err(AgentError::msg(
        ErrorKind::BuildFailed,
        format!("docker build failed for {tag}"),
      ));
    }
    Ok(Some(serde_json::json!({ "tag": tag, "logs": logs })))
  }
  .await;
  if let Err(e) = tokio::fs::remove_dir_all(&build_dir).await
    && e.kind() != std::io::ErrorKind::NotFound
  {
    tracing::warn!("failed to clean build dir {build_dir:?} | {e:?}");
  }
  res
}

/// Fill in the configured git credential when the request does
/// not carry one.
fn with_config_token(mut source: GitSource) -> GitSource {
  if source.token.is_none() {
    let configured = &agent_config().git.token;
    if !configured.is_empty() {
      source.token = Some(configured.clone());
    }
  }
  source
}

fn git_result(
  res: git::GitRes,
) -> Result<Option<JsonValue>, AgentError> {
  let success = all_logs_success(&res.logs);
  let data = serde_json::json!({
    "path": res.path,
    "hash": res.hash,
    "message": res.message,
    "logs": res.logs,
  });
  if success {
    Ok(Some(data))
  } else {
    Err(AgentError::msg(
      ErrorKind::Internal,
      serde_json::to_string(&data).unwrap_or_default(),
    ))
  }
}

fn log_result(
  log: arbor_client::entities::Log,
) -> Result<Option<JsonValue>, AgentError> {
  if log.success {
    Ok(Some(to_json(&log)?))
  } else {
    Err(AgentError::msg(
      ErrorKind::RuntimeUnavailable,
      log.stderr.replace('\n', " | "),
    ))
  }
}

fn to_json<T: serde::Serialize>(
  value: &T,
) -> Result<JsonValue, AgentError> {
  serde_json::to_value(value)
    .context("failed to serialize response data")
    .kind(ErrorKind::Internal)
}
