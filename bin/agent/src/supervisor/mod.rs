use std::time::{Duration, Instant};

use anyhow::Context;
use arbor_client::{
  entities::{
    arbor_timestamp,
    health::{HealthCheckConfig, HealthCheckResult, HealthCheckType},
  },
  error::{AgentError, ErrorKind},
};
use command::run_agent_command;

use crate::docker::{docker_client, signal_container};

/// Apply the configured initial delay, then run one probe.
pub async fn perform_health_check(
  endpoint: &str,
  container_name: &str,
  config: &HealthCheckConfig,
) -> HealthCheckResult {
  if config.initial_delay > 0 {
    tokio::time::sleep(Duration::from_secs(config.initial_delay))
      .await;
  }
  probe(endpoint, container_name, config).await
}

/// One probe of the configured type under the configured timeout.
/// Errors are classified into the result message; the caller only
/// sees success / fail.
pub async fn probe(
  endpoint: &str,
  container_name: &str,
  config: &HealthCheckConfig,
) -> HealthCheckResult {
  let started = Instant::now();
  let timeout = Duration::from_secs(config.timeout.max(1));
  let outcome = match config.check_type {
    HealthCheckType::Http => {
      http_probe(endpoint, config, timeout).await
    }
    HealthCheckType::Tcp => {
      tcp_probe(endpoint, config, timeout).await
    }
    HealthCheckType::Exec => {
      exec_probe(container_name, config, timeout).await
    }
  };
  let (success, message) = match outcome {
    Ok(message) => (true, message),
    Err(e) => (false, format!("{e:#}")),
  };
  HealthCheckResult {
    success,
    message,
    duration_ms: started.elapsed().as_millis() as u64,
    timestamp: arbor_timestamp(),
    metadata: [(
      String::from("type"),
      config.check_type.to_string(),
    )]
    .into(),
  }
}

async fn http_probe(
  endpoint: &str,
  config: &HealthCheckConfig,
  timeout: Duration,
) -> anyhow::Result<String> {
  let port = config.port.context("http probe requires a port")?;
  let url = format!("http://{endpoint}:{port}{}", config.path);
  let client = reqwest::Client::builder()
    .timeout(timeout)
    .build()
    .context("failed to build probe client")?;
  let mut request = client.get(&url);
  for (key, value) in &config.headers {
    request = request.header(key, value);
  }
  let response = request
    .send()
    .await
    .with_context(|| format!("GET {url} failed"))?;
  let status = response.status().as_u16();
  if (200..300).contains(&status) {
    Ok(format!("GET {url} -> {status}"))
  } else {
    Err(anyhow::anyhow!("GET {url} -> non-2xx status {status}"))
  }
}

async fn tcp_probe(
  endpoint: &str,
  config: &HealthCheckConfig,
  timeout: Duration,
) -> anyhow::Result<String> {
  let port = config.port.context("tcp probe requires a port")?;
  let address = format!("{endpoint}:{port}");
  match tokio::time::timeout(
    timeout,
    tokio::net::TcpStream::connect(&address),
  )
  .await
  {
    Ok(Ok(_stream)) => Ok(format!("tcp connect {address} ok")),
    Ok(Err(e)) => {
      Err(anyhow::anyhow!("tcp connect {address} failed: {e}"))
    }
    Err(_) => {
      Err(anyhow::anyhow!("tcp connect {address} timed out"))
    }
  }
}

async fn exec_probe(
  container_name: &str,
  config: &HealthCheckConfig,
  timeout: Duration,
) -> anyhow::Result<String> {
  if config.command.is_empty() {
    return Err(anyhow::anyhow!("exec probe requires a command"));
  }
  let command = format!(
    "docker exec {container_name} {}",
    config.command.join(" ")
  );
  let log = tokio::time::timeout(
    timeout,
    run_agent_command("Exec Probe", None, command),
  )
  .await
  .map_err(|_| anyhow::anyhow!("exec probe timed out"))?;
  if log.success {
    Ok(String::from("exec probe exited 0"))
  } else {
    Err(anyhow::anyhow!(
      "exec probe exited non-zero: {}",
      log.stderr.replace('\n', " | ")
    ))
  }
}

/// Readiness gate: up to `3 x failure_threshold` probes spaced by
/// `period`, requiring `success_threshold` consecutive successes.
pub async fn wait_for_container_ready(
  endpoint: &str,
  container_name: &str,
  config: &HealthCheckConfig,
) -> Result<HealthCheckResult, AgentError> {
  if config.initial_delay > 0 {
    tokio::time::sleep(Duration::from_secs(config.initial_delay))
      .await;
  }
  let attempt_budget = 3 * config.failure_threshold.max(1);
  let mut consecutive_successes = 0;
  let mut last: Option<HealthCheckResult> = None;
  for attempt in 0..attempt_budget {
    if attempt > 0 {
      tokio::time::sleep(Duration::from_secs(config.period)).await;
    }
    let result = probe(endpoint, container_name, config).await;
    if result.success {
      consecutive_successes += 1;
      if consecutive_successes >= config.success_threshold.max(1) {
        return Ok(result);
      }
    } else {
      consecutive_successes = 0;
    }
    last = Some(result);
  }
  let detail = last
    .map(|result| result.message)
    .unwrap_or_else(|| String::from("no probe attempts ran"));
  Err(AgentError::msg(
    ErrorKind::ReadinessTimeout,
    format!(
      "container {container_name} not ready after {attempt_budget} attempts | {detail}"
    ),
  ))
}

/// Continuous-liveness counters. Failure increments reset the
/// success streak and vice versa; verdicts fire exactly when a
/// threshold is crossed.
#[derive(Debug, Default, Clone, Copy)]
pub struct LivenessCounters {
  pub failures: u32,
  pub successes: u32,
  failed: bool,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum LivenessVerdict {
  Steady,
  Failed,
  Recovered,
}

impl LivenessCounters {
  pub fn observe(
    &mut self,
    success: bool,
    config: &HealthCheckConfig,
  ) -> LivenessVerdict {
    if success {
      self.successes += 1;
      self.failures = 0;
      if self.failed
        && self.successes >= config.success_threshold.max(1)
      {
        self.failed = false;
        return LivenessVerdict::Recovered;
      }
    } else {
      self.failures += 1;
      self.successes = 0;
      if !self.failed
        && self.failures >= config.failure_threshold.max(1)
      {
        self.failed = true;
        return LivenessVerdict::Failed;
      }
    }
    LivenessVerdict::Steady
  }
}

/// SIGTERM, poll running-state every second, SIGKILL once the
/// grace period lapses. Succeeds when the container is stopped
/// or gone; safe to call repeatedly.
pub async fn graceful_shutdown(
  container_name: &str,
  grace: Duration,
) -> anyhow::Result<()> {
  let docker = docker_client();
  if !docker.container_running(container_name).await? {
    return Ok(());
  }
  let term_log = signal_container(container_name, "SIGTERM").await;
  if !term_log.success {
    tracing::debug!(
      "SIGTERM delivery failed for {container_name} | {}",
      term_log.stderr.replace('\n', " | "),
    );
  }
  let deadline = Instant::now() + grace;
  while Instant::now() < deadline {
    tokio::time::sleep(Duration::from_secs(1)).await;
    if !docker.container_running(container_name).await? {
      return Ok(());
    }
  }
  let kill_log = signal_container(container_name, "SIGKILL").await;
  if !kill_log.success
    && docker.container_running(container_name).await?
  {
    return Err(anyhow::anyhow!(
      "container {container_name} still running after SIGKILL: {}",
      kill_log.stderr.replace('\n', " | "),
    ));
  }
  Ok(())
}

/// Restart the container, then require readiness. A container that
/// restarts but never becomes ready is a failed restart.
pub async fn restart(
  endpoint: &str,
  container_name: &str,
  config: Option<&HealthCheckConfig>,
) -> Result<(), AgentError> {
  let log = crate::docker::restart_container(container_name).await;
  if !log.success {
    return Err(AgentError::msg(
      ErrorKind::StartFailed,
      format!(
        "docker restart failed for {container_name}: {}",
        log.stderr.replace('\n', " | "),
      ),
    ));
  }
  if let Some(config) = config {
    wait_for_container_ready(endpoint, container_name, config)
      .await?;
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  fn fast_config(
    check_type: HealthCheckType,
    port: u16,
  ) -> HealthCheckConfig {
    HealthCheckConfig {
      check_type,
      port: Some(port),
      initial_delay: 0,
      period: 0,
      timeout: 1,
      failure_threshold: 2,
      success_threshold: 1,
      ..Default::default()
    }
  }

  #[tokio::test]
  async fn tcp_probe_succeeds_against_listener() {
    let listener =
      tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
      loop {
        let _ = listener.accept().await;
      }
    });
    let result = probe(
      "127.0.0.1",
      "unused",
      &fast_config(HealthCheckType::Tcp, port),
    )
    .await;
    assert!(result.success, "{}", result.message);
  }

  #[tokio::test]
  async fn tcp_probe_fails_against_closed_port() {
    // Bind and drop to find a port that refuses connections.
    let listener =
      tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    let result = probe(
      "127.0.0.1",
      "unused",
      &fast_config(HealthCheckType::Tcp, port),
    )
    .await;
    assert!(!result.success);
  }

  #[tokio::test]
  async fn http_probe_respects_2xx_boundaries() {
    use axum::{Router, http::StatusCode, routing::get};
    let app = Router::new()
      .route("/ok", get(|| async { StatusCode::OK }))
      .route(
        "/edge-299",
        get(|| async { StatusCode::from_u16(299).unwrap() }),
      )
      .route(
        "/multiple-300",
        get(|| async { StatusCode::MULTIPLE_CHOICES }),
      );
    let listener =
      tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
      axum::serve(listener, app).await.unwrap();
    });

    let mut config = fast_config(HealthCheckType::Http, port);

    config.path = String::from("/ok");
    assert!(probe("127.0.0.1", "unused", &config).await.success);

    config.path = String::from("/edge-299");
    assert!(probe("127.0.0.1", "unused", &config).await.success);

    config.path = String::from("/multiple-300");
    assert!(!probe("127.0.0.1", "unused", &config).await.success);
  }

  #[tokio::test]
  async fn readiness_times_out_after_attempt_budget() {
    let listener =
      tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    let config = fast_config(HealthCheckType::Tcp, port);
    let err = wait_for_container_ready("127.0.0.1", "unused", &config)
      .await
      .unwrap_err();
    assert_eq!(err.kind, ErrorKind::ReadinessTimeout);
    // 3 x failure_threshold
    assert!(format!("{err}").contains("6 attempts"));
  }

  #[test]
  fn liveness_counters_cross_thresholds_once() {
    let config = HealthCheckConfig {
      failure_threshold: 3,
      success_threshold: 2,
      ..Default::default()
    };
    let mut counters = LivenessCounters::default();
    assert_eq!(
      counters.observe(false, &config),
      LivenessVerdict::Steady
    );
    assert_eq!(
      counters.observe(false, &config),
      LivenessVerdict::Steady
    );
    assert_eq!(
      counters.observe(false, &config),
      LivenessVerdict::Failed
    );
    // Threshold only fires once.
    assert_eq!(
      counters.observe(false, &config),
      LivenessVerdict::Steady
    );
    // Success resets failures, recovery needs the success streak.
    assert_eq!(
      counters.observe(true, &config),
      LivenessVerdict::Steady
    );
    assert_eq!(
      counters.observe(true, &config),
      LivenessVerdict::Recovered
    );
    assert_eq!(counters.failures, 0);
  }
}
