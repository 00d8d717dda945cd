use std::sync::OnceLock;

use anyhow::{Context, anyhow};
use arbor_client::entities::{Log, stats::ContainerSummary};
use bollard::Docker;
use command::run_agent_command;
use run_command::async_run_command;

use crate::config::agent_config;

pub mod stats;

pub fn docker_client() -> &'static DockerClient {
  static DOCKER_CLIENT: OnceLock<DockerClient> = OnceLock::new();
  DOCKER_CLIENT.get_or_init(Default::default)
}

pub struct DockerClient {
  docker: Docker,
}

impl Default for DockerClient {
  fn default() -> DockerClient {
    let host = &agent_config().docker.host;
    let docker = if host.is_empty() {
      Docker::connect_with_defaults()
    } else {
      Docker::connect_with_http(host, 10, bollard::API_DEFAULT_VERSION)
    };
    DockerClient {
      docker: docker
        .expect("failed to connect to docker daemon"),
    }
  }
}

/// Trimmed view of a container inspect, enough for supervision
/// and reconciliation.
#[derive(Debug, Clone, Default)]
pub struct ContainerInspect {
  pub id: String,
  pub name: String,
  pub image: Option<String>,
  pub running: bool,
  pub status: String,
  pub exit_code: Option<i64>,
  pub oom_killed: bool,
}

impl DockerClient {
  /// None when the container does not exist.
  pub async fn inspect_container(
    &self,
    container_name: &str,
  ) -> anyhow::Result<Option<ContainerInspect>> {
    use bollard::query_parameters::InspectContainerOptions;
    let container = match self
      .docker
      .inspect_container(
        container_name,
        InspectContainerOptions::default().into(),
      )
      .await
    {
      Ok(container) => container,
      Err(bollard::errors::Error::DockerResponseServerError {
        status_code: 404,
        ..
      }) => return Ok(None),
      Err(e) => {
        return Err(
          anyhow!(e).context("docker daemon inspect failed"),
        );
      }
    };
    let state = container.state.as_ref();
    Ok(Some(ContainerInspect {
      id: container.id.clone().unwrap_or_default(),
      name: container
        .name
        .clone()
        .unwrap_or_default()
        .trim_start_matches('/')
        .to_string(),
      image: container
        .config
        .as_ref()
        .and_then(|config| config.image.clone()),
      running: state
        .and_then(|state| state.running)
        .unwrap_or_default(),
      status: state
        .and_then(|state| state.status)
        .map(|status| status.to_string())
        .unwrap_or_default(),
      exit_code: state.and_then(|state| state.exit_code),
      oom_killed: state
        .and_then(|state| state.oom_killed)
        .unwrap_or_default(),
    }))
  }

  pub async fn container_running(
    &self,
    container_name: &str,
  ) -> anyhow::Result<bool> {
    Ok(
      self
        .inspect_container(container_name)
        .await?
        .map(|container| container.running)
        .unwrap_or(false),
    )
  }

  pub async fn list_containers(
    &self,
  ) -> anyhow::Result<Vec<ContainerSummary>> {
    use bollard::query_parameters::ListContainersOptions;
    let containers = self
      .docker
      .list_containers(Some(ListContainersOptions {
        all: true,
        ..Default::default()
      }))
      .await
      .context("docker daemon list failed")?;
    let summaries = containers
      .into_iter()
      .flat_map(|container| {
        let name = container
          .names
          .context("no names on container")?
          .pop()
          .context("no names on container (empty vec)")?
          .replace('/', "");
        anyhow::Ok(ContainerSummary {
          id: container.id,
          name,
          image: container.image,
          state: container
            .state
            .map(|state| state.to_string())
            .unwrap_or_default(),
          status: container.status,
        })
      })
      .collect();
    Ok(summaries)
  }
}

// Runtime writes go through the docker cli, collected into Logs.

#[tracing::instrument]
pub async fn pull_image(image: &str) -> Log {
  run_agent_command("Docker Pull", None, format!("docker pull {image}"))
    .await
}

pub async fn start_container(container_name: &str) -> Log {
  run_agent_command(
    "Docker Start",
    None,
    format!("docker start {container_name}"),
  )
  .await
}

pub async fn restart_container(container_name: &str) -> Log {
  run_agent_command(
    "Docker Restart",
    None,
    format!("docker restart {container_name}"),
  )
  .await
}

pub async fn stop_container(
  container_name: &str,
  time: Option<u64>,
) -> Log {
  let time = time
    .map(|time| format!(" --time {time}"))
    .unwrap_or_default();
  run_agent_command(
    "Docker Stop",
    None,
    format!("docker stop{time} {container_name}"),
  )
  .await
}

pub async fn signal_container(
  container_name: &str,
  signal: &str,
) -> Log {
  run_agent_command(
    "Docker Kill",
    None,
    format!("docker kill --signal {signal} {container_name}"),
  )
  .await
}

pub async fn remove_container(
  container_name: &str,
  force: bool,
) -> Log {
  let force = if force { " --force" } else { "" };
  run_agent_command(
    "Docker Remove",
    None,
    format!("docker container rm{force} {container_name}"),
  )
  .await
}

pub async fn connect_network(
  container_name: &str,
  network: &str,
) -> Log {
  run_agent_command(
    "Docker Network Connect",
    None,
    format!("docker network connect {network} {container_name}"),
  )
  .await
}

pub async fn container_logs(
  container_name: &str,
  tail: u64,
) -> Log {
  run_agent_command(
    "Docker Logs",
    None,
    format!("docker logs {container_name} --tail {tail}"),
  )
  .await
}

pub async fn image_exists(image: &str) -> bool {
  async_run_command(&format!("docker image inspect {image}"))
    .await
    .success()
}

pub async fn prune_system() -> Log {
  run_agent_command(
    "Prune System",
    None,
    String::from("docker system prune -a -f"),
  )
  .await
}

/// Returns whether the push after build should happen.
#[tracing::instrument(skip(token))]
pub async fn docker_login(
  domain: &str,
  account: &str,
  token: &str,
) -> anyhow::Result<bool> {
  if domain.is_empty() || account.is_empty() {
    return Ok(false);
  }
  let log = async_run_command(&format!(
    "echo {token} | docker login {domain} --username '{account}' --password-stdin",
  ))
  .await;
  if log.success() {
    Ok(true)
  } else {
    let mut e = anyhow!("End of trace");
    for line in
      log.stderr.split('\n').filter(|line| !line.is_empty()).rev()
    {
      e = e.context(line.to_string());
    }
    Err(e.context(format!("registry {domain} login error")))
  }
}
