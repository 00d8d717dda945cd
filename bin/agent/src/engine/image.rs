use std::sync::Arc;

use arbor_client::{
  entities::{
    Log, all_logs_success,
    deployment::{Deployment, DeploymentSource, image_tag},
  },
  error::{AgentError, ErrorKind},
};
use command::run_agent_command;

use super::DeploymentEngine;
use crate::{config::agent_config, docker};

/// Produce the image for a deployment: build from source or pull
/// the reference. Returns the pinned tag. Build working trees are
/// cleaned up on every exit path.
pub async fn materialise(
  engine: &Arc<DeploymentEngine>,
  deployment: &Deployment,
) -> Result<String, AgentError> {
  match &deployment.source {
    DeploymentSource::Image(image) => {
      if let Some(auth) = &image.auth {
        docker::docker_login(
          &auth.domain,
          &auth.username,
          &auth.token,
        )
        .await
        .map_err(|e| {
          AgentError::new(ErrorKind::PullFailed, e)
        })?;
      }
      let log = docker::pull_image(&image.reference).await;
      let success = log.success;
      let stderr = log.stderr.clone();
      push_build_log(engine, &deployment.id, log).await;
      if !success {
        return Err(AgentError::msg(
          ErrorKind::PullFailed,
          format!(
            "failed to pull {}: {}",
            image.reference,
            stderr.replace('\n', " | "),
          ),
        ));
      }
      Ok(image.reference.clone())
    }
    DeploymentSource::Git(git_source) => {
      let tag = image_tag(&deployment.app_id, &deployment.version);
      // The tag is pinned once built. Same (app, version) reuses
      // it unless a rebuild is forced.
      if !deployment.config.force_rebuild
        && docker::image_exists(&tag).await
      {
        push_build_log(
          engine,
          &deployment.id,
          Log::simple(
            "Build",
            format!("image {tag} already present, reusing"),
          ),
        )
        .await;
        return Ok(tag);
      }

      let build_dir =
        agent_config().agent.work_dir.join(&deployment.id);

      let res = async {
        let git_res = git::clone(git_source, &build_dir)
          .await
          .map_err(|e| AgentError::new(ErrorKind::BuildFailed, e))?;
        let clone_ok = all_logs_success(&git_res.logs);
        for log in git_res.logs {
          push_build_log(engine, &deployment.id, log).await;
        }
        if !clone_ok {
          return Err(AgentError::msg(
            ErrorKind::BuildFailed,
            format!("failed to clone {}", git_source.url),
          ));
        }

        let context = if git_source.subpath.is_empty() {
          build_dir.clone()
        } else {
          build_dir.join(&git_source.subpath)
        };
        let build_log = run_agent_command(
          "Docker Build",
          None,
          format!(
            "docker build -t {tag} --label arbor.app={} --label arbor.version={} -f {} {}",
            deployment.app_id,
            deployment.version,
            context.join(&git_source.dockerfile).display(),
            context.display(),
          ),
        )
        .await;
        let success = build_log.success;
        let stderr = build_log.stderr.clone();
        push_build_log(engine, &deployment.id, build_log).await;
        if !success {
          return Err(AgentError::msg(
            ErrorKind::BuildFailed,
            format!(
              "docker build failed: {}",
              stderr.replace('\n', " | "),
            ),
          ));
        }
        Ok(tag.clone())
      }
      .await;

      if let Err(e) = tokio::fs::remove_dir_all(&build_dir).await
        && e.kind() != std::io::ErrorKind::NotFound
      {
        tracing::warn!(
          "failed to clean build dir {build_dir:?} | {e:?}"
        );
      }

      res
    }
  }
}

async fn push_build_log(
  engine: &Arc<DeploymentEngine>,
  id: &str,
  log: Log,
) {
  let res = engine
    .update(id, |deployment| {
      deployment.build_logs.push(log);
    })
    .await;
  if let Err(e) = res {
    tracing::debug!("failed to record build log | {e:#}");
  }
}
