use std::{borrow::Cow, fmt::Write};

use arbor_client::entities::deployment::{
  Deployment, PortProtocol, RestartPolicy,
};

fn escape(value: &str) -> Cow<'_, str> {
  shell_escape::escape(Cow::Borrowed(value))
}

/// Translate a deployment into the runtime's create+start call,
/// one `docker run -d` invocation.
pub fn docker_run_command(
  deployment: &Deployment,
  image: &str,
  default_network: &str,
) -> String {
  let mut command = format!(
    "docker run -d --name {}",
    escape(&deployment.container_name)
  );

  // Identity labels, then user labels.
  let _ = write!(
    command,
    " --label arbor.app={} --label arbor.version={} --label arbor.managed=true",
    escape(&deployment.app_id),
    escape(&deployment.version),
  );
  for (key, value) in &deployment.labels {
    let _ = write!(
      command,
      " --label {}={}",
      escape(key),
      escape(value)
    );
  }

  let network = deployment
    .networks
    .first()
    .map(String::as_str)
    .unwrap_or(default_network);
  if !network.is_empty() {
    let _ = write!(command, " --network {}", escape(network));
  }

  for port in &deployment.ports {
    if let Some(host_port) = port.host_port {
      let host_ip = port
        .host_ip
        .as_ref()
        .map(|ip| format!("{ip}:"))
        .unwrap_or_default();
      let protocol = match port.protocol {
        PortProtocol::Tcp => "",
        PortProtocol::Udp => "/udp",
      };
      let _ = write!(
        command,
        " -p {host_ip}{host_port}:{}{protocol}",
        port.container_port,
      );
    } else {
      let _ = write!(command, " --expose {}", port.container_port);
    }
  }

  for volume in &deployment.volumes {
    let read_only = if volume.read_only { ":ro" } else { "" };
    let _ = write!(
      command,
      " -v {}:{}{read_only}",
      escape(&volume.source),
      escape(&volume.target),
    );
  }

  for env in deployment
    .environment
    .iter()
    .chain(deployment.secrets.iter())
  {
    let _ = write!(
      command,
      " --env {}={}",
      escape(&env.variable),
      escape(&env.value)
    );
  }

  if deployment.config.restart != RestartPolicy::No {
    let _ = write!(
      command,
      " --restart {}",
      deployment.config.restart
    );
  }
  if !deployment.config.user.is_empty() {
    let _ = write!(
      command,
      " --user {}",
      escape(&deployment.config.user)
    );
  }
  if !deployment.config.working_dir.is_empty() {
    let _ = write!(
      command,
      " --workdir {}",
      escape(&deployment.config.working_dir)
    );
  }
  for opt in &deployment.config.security_opts {
    let _ = write!(command, " --security-opt {}", escape(opt));
  }
  for cap in &deployment.config.cap_add {
    let _ = write!(command, " --cap-add {}", escape(cap));
  }
  for cap in &deployment.config.cap_drop {
    let _ = write!(command, " --cap-drop {}", escape(cap));
  }

  command.push_str(&resource_flags(deployment));

  let _ = write!(command, " {image}");

  if !deployment.config.command.is_empty() {
    let _ = write!(command, " {}", deployment.config.command);
  }
  for arg in &deployment.config.args {
    let _ = write!(command, " {}", escape(arg));
  }

  command
}

fn resource_flags(deployment: &Deployment) -> String {
  let limits = &deployment.resource_limits;
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
  if limits.kernel_memory > 0 {
    let _ = write!(
      flags,
      " --kernel-memory {}b",
      limits.kernel_memory
    );
  }
  if limits.process_count > 0 {
    let _ = write!(flags, " --pids-limit {}", limits.process_count);
  }
  if let Some(blkio_weight) = limits.blkio_weight {
    let _ = write!(flags, " --blkio-weight {blkio_weight}");
  }
  if limits.oom_kill_disable {
    flags.push_str(" --oom-kill-disable");
  }
  if let Some(oom_score_adj) = limits.oom_score_adj {
    let _ = write!(flags, " --oom-score-adj {oom_score_adj}");
  }
  if limits.shm_size > 0 {
    let _ = write!(flags, " --shm-size {}b", limits.shm_size);
  }
  for ulimit in &limits.ulimits {
    let _ = write!(
      flags,
      " --ulimit {}={}:{}",
      escape(&ulimit.name),
      ulimit.soft,
      ulimit.hard
    );
  }
  flags
}

#[cfg(test)]
mod tests {
  use arbor_client::entities::{
    EnvironmentVar,
    deployment::{
      DeploymentConfig, PortMapping, VolumeMapping, container_name,
    },
    resource::{ResourceLimits, Ulimit},
  };

  use super::*;

  fn deployment() -> Deployment {
    let id = "demo-1.0.0-1712345678".to_string();
    Deployment {
      container_name: container_name(&id),
      id,
      app_id: "demo".to_string(),
      version: "1.0.0".to_string(),
      ports: vec![PortMapping {
        container_port: 8080,
        host_port: Some(18080),
        ..Default::default()
      }],
      environment: vec![EnvironmentVar {
        variable: "MODE".to_string(),
        value: "production".to_string(),
      }],
      volumes: vec![VolumeMapping {
        source: "demo-data".to_string(),
        target: "/data".to_string(),
        read_only: false,
      }],
      config: DeploymentConfig {
        restart: arbor_client::entities::deployment::RestartPolicy::UnlessStopped,
        user: "1000".to_string(),
        ..Default::default()
      },
      resource_limits: ResourceLimits {
        cpu_cores: 0.5,
        memory_bytes: 256 * 1024 * 1024,
        ulimits: vec![Ulimit {
          name: "nofile".to_string(),
          soft: 1024,
          hard: 4096,
        }],
        ..Default::default()
      },
      ..Default::default()
    }
  }

  #[test]
  fn run_command_covers_config() {
    let command =
      docker_run_command(&deployment(), "arbor/demo:1.0.0", "arbor");
    assert!(command.starts_with(
      "docker run -d --name arbor-demo-1.0.0-1712345678"
    ));
    assert!(command.contains("--label arbor.app=demo"));
    assert!(command.contains("--network arbor"));
    assert!(command.contains("-p 18080:8080"));
    assert!(command.contains("-v demo-data:/data"));
    assert!(command.contains("--env MODE=production"));
    assert!(command.contains("--restart unless-stopped"));
    assert!(command.contains("--user 1000"));
    assert!(command.contains("--cpus 0.5"));
    assert!(command.contains("--memory 268435456b"));
    assert!(command.contains("--ulimit nofile=1024:4096"));
    assert!(command.ends_with(" arbor/demo:1.0.0"));
  }

  #[test]
  fn portless_deployment_exposes_nothing() {
    let mut deployment = deployment();
    deployment.ports.clear();
    let command =
      docker_run_command(&deployment, "redis:7.0.5", "arbor");
    assert!(!command.contains(" -p "));
    assert!(!command.contains("--expose"));
  }

  #[test]
  fn env_values_are_shell_escaped() {
    let mut deployment = deployment();
    deployment.environment = vec![EnvironmentVar {
      variable: "GREETING".to_string(),
      value: "hello world; rm -rf /".to_string(),
    }];
    let command =
      docker_run_command(&deployment, "redis:7.0.5", "arbor");
    assert!(
      command.contains("--env GREETING='hello world; rm -rf /'")
    );
  }
}
