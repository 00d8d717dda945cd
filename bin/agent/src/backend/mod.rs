use std::time::Duration;

use anyhow::{Context, anyhow};
use arbor_client::entities::{
  Command, CommandResponse, arbor_timestamp,
  stats::{
    AgentHealth, AgentRegistration, AgentRegistrationResponse,
    AgentStatus, DeploymentSummary, StatusReport,
  },
  token::{Token, TokenValidation},
};
use reqwest::StatusCode;

use crate::{
  config::agent_config,
  dispatch::CommandDispatcher,
  state::{current_token, state},
};

pub mod stream;

/// HTTP client for the control plane. Every request carries the
/// current token and the agent identity; transient failures (5xx
/// or network) retry with exponential backoff up to the configured
/// attempts.
pub struct BackendClient {
  http: reqwest::Client,
  base_url: String,
}

pub fn backend() -> Option<&'static BackendClient> {
  static BACKEND: std::sync::OnceLock<Option<BackendClient>> =
    std::sync::OnceLock::new();
  BACKEND
    .get_or_init(|| {
      let config = &agent_config().backend;
      if config.base_url.is_empty() {
        return None;
      }
      Some(BackendClient {
        http: build_http_client(),
        base_url: config.base_url.trim_end_matches('/').to_string(),
      })
    })
    .as_ref()
}

fn build_http_client() -> reqwest::Client {
  let config = &agent_config().backend;
  let mut builder = reqwest::Client::builder()
    .timeout(Duration::from_secs(config.timeout));
  if config.insecure_skip_tls {
    builder = builder.danger_accept_invalid_certs(true);
  }
  if !config.ca_cert_file.is_empty() {
    match std::fs::read(&config.ca_cert_file)
      .context("failed to read ca cert file")
      .and_then(|pem| {
        reqwest::Certificate::from_pem(&pem)
          .context("ca cert file is not valid pem")
      }) {
      Ok(cert) => builder = builder.add_root_certificate(cert),
      Err(e) => {
        tracing::error!("ignoring backend.ca_cert_file | {e:#}")
      }
    }
  }
  if !config.client_cert_file.is_empty()
    && !config.client_key_file.is_empty()
  {
    let identity = std::fs::read(&config.client_cert_file)
      .and_then(|mut cert| {
        let key = std::fs::read(&config.client_key_file)?;
        cert.extend(key);
        Ok(cert)
      })
      .context("failed to read client cert / key")
      .and_then(|pem| {
        reqwest::Identity::from_pem(&pem)
          .context("client cert / key is not valid pem")
      });
    match identity {
      Ok(identity) => builder = builder.identity(identity),
      Err(e) => {
        tracing::error!("ignoring backend client identity | {e:#}")
      }
    }
  }
  builder.build().expect("failed to build backend http client")
}

impl BackendClient {
  async fn authed(
    &self,
    request: reqwest::RequestBuilder,
  ) -> reqwest::RequestBuilder {
    let config = agent_config();
    let mut request = request
      .header(
        "Authorization",
        format!("Bearer {}", current_token().await),
      )
      .header("X-Agent-Id", &config.agent.id);
    for (key, value) in &config.backend.headers {
      request = request.header(key, value);
    }
    request
  }

  /// POST with retry on transient failures.
  async fn post_json<B: serde::Serialize, R: serde::de::DeserializeOwned>(
    &self,
    path: &str,
    body: &B,
  ) -> anyhow::Result<R> {
    let config = &agent_config().backend;
    let mut delay = Duration::from_secs(config.retry_delay.max(1));
    let mut last_err = None;
    for attempt in 0..config.retry_attempts.max(1) {
      if attempt > 0 {
        tokio::time::sleep(delay).await;
        delay *= 2;
      }
      let request = self
        .authed(
          self.http.post(format!("{}{path}", self.base_url)),
        )
        .await
        .json(body);
      match request.send().await {
        Ok(response) if response.status().is_success() => {
          return response
            .json()
            .await
            .context("failed to parse backend response");
        }
        Ok(response)
          if response.status().is_server_error() =>
        {
          last_err = Some(anyhow!(
            "backend returned {}",
            response.status()
          ));
        }
        Ok(response) => {
          // Client errors are not retried.
          let status = response.status();
          let body = response.text().await.unwrap_or_default();
          return Err(anyhow!("backend returned {status} | {body}"));
        }
        Err(e) => {
          last_err =
            Some(anyhow!(e).context("backend request failed"));
        }
      }
    }
    Err(
      last_err
        .unwrap_or_else(|| anyhow!("backend request failed"))
        .context(format!("POST {path} exhausted retries")),
    )
  }

  pub async fn register(
    &self,
    registration: &AgentRegistration,
  ) -> anyhow::Result<AgentRegistrationResponse> {
    self.post_json("/api/agent/register", registration).await
  }

  pub async fn fetch_commands(
    &self,
  ) -> anyhow::Result<Vec<Command>> {
    let request = self
      .authed(self.http.get(format!(
        "{}/api/agent/commands",
        self.base_url
      )))
      .await;
    let response = request
      .send()
      .await
      .context("failed to poll pending commands")?;
    if !response.status().is_success() {
      return Err(anyhow!(
        "command poll returned {}",
        response.status()
      ));
    }
    response
      .json()
      .await
      .context("failed to parse pending commands")
  }

  pub async fn submit_response(
    &self,
    response: &CommandResponse,
  ) -> anyhow::Result<()> {
    let _: serde_json::Value = self
      .post_json("/api/agent/commands/response", response)
      .await?;
    Ok(())
  }

  pub async fn report_status(
    &self,
    report: &StatusReport,
  ) -> anyhow::Result<()> {
    let _: serde_json::Value =
      self.post_json("/api/agent/status", report).await?;
    Ok(())
  }

  pub async fn rotate_token(&self) -> anyhow::Result<String> {
    #[derive(serde::Deserialize)]
    struct RotateResponse {
      token: String,
    }
    let response: RotateResponse = self
      .post_json("/api/agent/token/rotate", &serde_json::json!({}))
      .await?;
    Ok(response.token)
  }

  /// Token validation for the local API's auth middleware.
  /// Distinguishes "invalid" from "validator unreachable".
  pub async fn validate_token(
    &self,
    token: &str,
  ) -> Result<TokenValidation, ValidatorError> {
    let response = self
      .http
      .post(format!("{}/api/auth/validate", self.base_url))
      .json(&serde_json::json!({ "token": token }))
      .send()
      .await
      .map_err(|e| {
        ValidatorError::Unavailable(
          anyhow!(e).context("token validator unreachable"),
        )
      })?;
    match response.status() {
      StatusCode::OK | StatusCode::UNAUTHORIZED => response
        .json()
        .await
        .map_err(|e| {
          ValidatorError::Unavailable(
            anyhow!(e)
              .context("token validator returned malformed body"),
          )
        }),
      status => Err(ValidatorError::Unavailable(anyhow!(
        "token validator returned {status}"
      ))),
    }
  }
}

#[derive(Debug)]
pub enum ValidatorError {
  Unavailable(anyhow::Error),
}

/// Register with the plane. A non-2xx response is fatal to
/// startup. The plane may hand back a token to store.
pub async fn register() -> anyhow::Result<()> {
  let Some(backend) = backend() else {
    tracing::warn!(
      "backend.base_url not configured, running local-only"
    );
    return Ok(());
  };
  let config = agent_config();
  let registration = AgentRegistration {
    id: config.agent.id.clone(),
    server_id: config.agent.server_id.clone(),
    location: config.agent.location.clone(),
    version: env!("CARGO_PKG_VERSION").to_string(),
    capabilities: vec![
      String::from("deployment"),
      String::from("container"),
      String::from("git"),
      String::from("system"),
    ],
    resources: crate::stats::system_stats().load().snapshot(),
    status: AgentStatus::Starting,
    metadata: [(
      String::from("environment"),
      config.agent.environment.clone(),
    )]
    .into(),
  };
  let response = backend
    .register(&registration)
    .await
    .context("agent registration failed")?;
  if let Some(token) = response.token {
    let stored = Token::from_plaintext(token.clone(), 0);
    *state().token.write().await = token;
    if let Err(e) = state().store.store_token(&stored).await {
      tracing::error!("failed to persist issued token | {e:#}");
    }
  }
  tracing::info!("registered with control plane");
  Ok(())
}

/// Timer-driven command poller.
pub fn spawn_command_poller(
  dispatcher: &'static CommandDispatcher,
) {
  let Some(backend) = backend() else {
    return;
  };
  let interval = Duration::from_secs(
    agent_config().backend.refresh_interval.max(1),
  );
  tokio::spawn(async move {
    loop {
      tokio::select! {
        _ = state().cancel.cancelled() => return,
        _ = tokio::time::sleep(interval) => {}
      }
      match backend.fetch_commands().await {
        Ok(commands) => {
          for command in commands {
            dispatcher.enqueue(command).await;
          }
        }
        Err(e) => {
          tracing::debug!("command poll failed | {e:#}");
        }
      }
    }
  });
}

/// Periodic status report. A failed report is logged and never
/// changes agent state.
pub fn spawn_heartbeat() {
  let Some(backend) = backend() else {
    return;
  };
  let interval = Duration::from_secs(
    agent_config().agent.heartbeat_interval.max(1),
  );
  tokio::spawn(async move {
    loop {
      tokio::select! {
        _ = state().cancel.cancelled() => return,
        _ = tokio::time::sleep(interval) => {}
      }
      let report = build_status_report().await;
      if let Err(e) = backend.report_status(&report).await {
        tracing::warn!("status report failed | {e:#}");
      }
    }
  });
}

/// Periodic credential rotation, enabled by
/// `security.token_rotation_interval > 0`.
pub fn spawn_token_rotation() {
  let Some(backend) = backend() else {
    return;
  };
  let interval_secs =
    agent_config().security.token_rotation_interval;
  if interval_secs == 0 {
    return;
  }
  let interval = Duration::from_secs(interval_secs);
  tokio::spawn(async move {
    loop {
      tokio::select! {
        _ = state().cancel.cancelled() => return,
        _ = tokio::time::sleep(interval) => {}
      }
      match backend.rotate_token().await {
        Ok(token) => {
          let stored = Token::from_plaintext(token.clone(), 0);
          *state().token.write().await = token;
          if let Err(e) = state().store.store_token(&stored).await {
            tracing::error!(
              "failed to persist rotated token | {e:#}"
            );
          }
          tracing::info!(
            "rotated backend token (prefix {})",
            stored.prefix
          );
        }
        Err(e) => {
          tracing::warn!("token rotation failed | {e:#}");
        }
      }
    }
  });
}

/// Fresh resource + workload snapshot for heartbeats and
/// `system.status`.
pub async fn build_status_report() -> StatusReport {
  let config = agent_config();
  let containers = crate::docker::docker_client()
    .list_containers()
    .await
    .unwrap_or_default();
  let deployments: Vec<DeploymentSummary> = state()
    .engine
    .list()
    .into_iter()
    .map(|deployment| DeploymentSummary {
      id: deployment.id,
      app_id: deployment.app_id,
      version: deployment.version,
      status: deployment.status,
    })
    .collect();
  StatusReport {
    agent_id: config.agent.id.clone(),
    server_id: config.agent.server_id.clone(),
    location: config.agent.location.clone(),
    status: AgentStatus::Online,
    health: AgentHealth::Healthy,
    resources: crate::stats::system_stats().load().snapshot(),
    containers,
    deployments,
    last_seen: arbor_timestamp(),
    metadata: Default::default(),
  }
}
