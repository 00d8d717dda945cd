use std::{
  collections::HashMap,
  sync::{Arc, RwLock, Weak},
  time::Duration,
};

use anyhow::anyhow;
use arbor_client::{
  entities::{
    Log, arbor_timestamp,
    deployment::{
      DeployRequest, Deployment, DeploymentState, RollbackRecord,
      container_name, deployment_id, subdomain,
    },
    health::HealthCheckResult,
    resource::ResourceUsage,
  },
  error::{AgentError, ErrorKind},
};
use dashmap::DashMap;
use formatting::format_serror;
use tokio_util::sync::CancellationToken;

use crate::{
  governor::ResourceGovernor, store::StateStore,
  supervisor,
};

mod container;
mod image;
mod orchestrate;
pub mod reconcile;
pub mod supervise;

/// Owns the per-deployment state machine and all orchestration.
/// The deployments table is the only shared-mutable surface;
/// readers get copy-on-read snapshots. State transitions for one
/// deployment are serialised by its orchestration task.
pub struct DeploymentEngine {
  deployments: RwLock<HashMap<String, Deployment>>,
  pub(crate) store: Arc<StateStore>,
  pub(crate) governor: Arc<ResourceGovernor>,
  /// Agent context. Orchestration and supervision live under it,
  /// not under any request context.
  pub(crate) cancel: CancellationToken,
  /// Per-deployment supervision cancel handles, keyed by id.
  pub(crate) supervisors: DashMap<String, CancellationToken>,
  /// Per-deployment usage monitor cancel handles, keyed by id.
  pub(crate) monitors: DashMap<String, CancellationToken>,
  /// Recent usage samples per deployment, feeding limit
  /// recommendations.
  usage_history: DashMap<String, Vec<ResourceUsage>>,
  /// Self-reference for spawning orchestration tasks.
  weak: Weak<DeploymentEngine>,
}

/// Samples of history retained per deployment.
const USAGE_HISTORY_CAPACITY: usize = 40;

impl DeploymentEngine {
  pub fn new(
    store: Arc<StateStore>,
    governor: Arc<ResourceGovernor>,
    cancel: CancellationToken,
  ) -> Arc<DeploymentEngine> {
    Arc::new_cyclic(|weak| DeploymentEngine {
      deployments: Default::default(),
      store,
      governor,
      cancel,
      supervisors: Default::default(),
      monitors: Default::default(),
      usage_history: Default::default(),
      weak: weak.clone(),
    })
  }

  fn arc(&self) -> Arc<DeploymentEngine> {
    self.weak.upgrade().expect("engine dropped while in use")
  }

  // ── public operations ─────────────────────────────────────

  /// Validate, assign an id, persist the initial snapshot and
  /// return in `Pending`. Orchestration runs asynchronously under
  /// the agent context; this never blocks on build or start.
  pub async fn deploy(
    &self,
    request: DeployRequest,
  ) -> Result<Deployment, AgentError> {
    validate_request(&request)?;
    // Quota validation happens before any image work.
    self.governor.validate(&request.resource_limits)?;

    let new_subdomain = subdomain(&request.app_id);
    let mut replaces: Option<String> = None;
    {
      let deployments = self.deployments.read().unwrap();
      for existing in deployments.values() {
        if existing.app_id == request.app_id
          && existing.version == request.version
        {
          if existing.status == DeploymentState::Running {
            // Idempotent re-deploy of a running (app, version).
            return Ok(existing.clone().sanitized());
          }
          return Err(AgentError::msg(
            ErrorKind::Conflict,
            format!(
              "deployment {} already exists in state {}",
              existing.id, existing.status
            ),
          ));
        }
        if existing.app_id == request.app_id
          && !existing.status.is_terminal()
        {
          // New version of a live app: replacement deploy.
          replaces = Some(existing.id.clone());
        } else if existing.subdomain == new_subdomain
          && !existing.status.is_terminal()
        {
          return Err(AgentError::msg(
            ErrorKind::Conflict,
            format!(
              "subdomain {new_subdomain} already owned by deployment {}",
              existing.id
            ),
          ));
        }
      }
    }

    let id = deployment_id(
      &request.app_id,
      &request.version,
      arbor_timestamp() / 1000,
    );
    let now = arbor_timestamp();
    let deployment = Deployment {
      container_name: container_name(&id),
      subdomain: new_subdomain,
      id: id.clone(),
      app_id: request.app_id,
      version: request.version,
      source: request.source,
      config: request.config,
      resource_limits: request.resource_limits,
      health_check: request.health_check,
      environment: request.environment,
      secrets: request.secrets,
      ports: request.ports,
      volumes: request.volumes,
      networks: request.networks,
      labels: request.labels,
      status: DeploymentState::Pending,
      created_at: now,
      updated_at: now,
      ..Default::default()
    };

    {
      let mut deployments = self.deployments.write().unwrap();
      deployments.insert(id.clone(), deployment.clone());
    }
    self.store.store_deployment(&deployment).await?;

    let engine = self.arc();
    let orchestrate_id = id.clone();
    tokio::spawn(async move {
      orchestrate::run(engine, orchestrate_id, replaces).await;
    });

    Ok(deployment.sanitized())
  }

  /// `Stopping` then `Stopped`, with a best-effort graceful
  /// container stop. Idempotent when already stopped.
  pub async fn stop(
    &self,
    id: &str,
  ) -> Result<Deployment, AgentError> {
    let deployment = self.require(id)?;
    if deployment.status == DeploymentState::Stopped {
      return Ok(deployment.sanitized());
    }
    self.disarm_supervision(id);
    self.transition(id, DeploymentState::Stopping).await?;

    let grace =
      Duration::from_secs(deployment.config.stop_grace_period);
    if let Err(e) = supervisor::graceful_shutdown(
      &deployment.container_name,
      grace,
    )
    .await
    {
      // Best effort: record and continue to Stopped.
      self
        .append_log(
          id,
          Log::error(
            "Stop",
            format_serror(
              &e.context("graceful shutdown incomplete").into(),
            ),
          ),
        )
        .await;
    }
    if let Err(e) = crate::edge::remove_route_fragment(id).await {
      tracing::warn!("failed to remove route fragment | {e:#}");
    }

    let stopped = self
      .update(id, |deployment| {
        deployment.status = DeploymentState::Stopped;
        deployment.container_id = None;
      })
      .await?;
    Ok(stopped.sanitized())
  }

  /// Drive to `Stopped`, then remove the container, persisted
  /// state, reservation, and route fragment.
  pub async fn remove(
    &self,
    id: &str,
  ) -> Result<(), AgentError> {
    let deployment = self.require(id)?;
    if deployment.status != DeploymentState::Stopped {
      self.stop(id).await?;
    }
    let remove_log = crate::docker::remove_container(
      &deployment.container_name,
      true,
    )
    .await;
    if !remove_log.success
      && !remove_log.stderr.contains("No such container")
    {
      return Err(AgentError::msg(
        ErrorKind::RuntimeUnavailable,
        format!(
          "failed to remove container {}: {}",
          deployment.container_name,
          remove_log.stderr.replace('\n', " | "),
        ),
      ));
    }
    if let Some(reservation) = self.governor.reservation(id) {
      tracing::debug!(
        "releasing reservation for {id} (cpu {}, memory {})",
        reservation.cpu_cores,
        reservation.memory_bytes,
      );
    }
    self.governor.release(id);
    if let Err(e) = crate::edge::remove_route_fragment(id).await {
      tracing::warn!("failed to remove route fragment | {e:#}");
    }
    {
      let mut deployments = self.deployments.write().unwrap();
      deployments.remove(id);
    }
    self.disarm_supervision(id);
    self.usage_history.remove(id);
    self.store.delete_deployment(id).await?;
    Ok(())
  }

  /// Re-materialise the previous version as a replacement.
  /// Requires a stored prior snapshot.
  pub async fn rollback(
    &self,
    id: &str,
    reason: &str,
  ) -> Result<Deployment, AgentError> {
    let deployment = self.require(id)?;
    if deployment.status != DeploymentState::Running {
      return Err(AgentError::msg(
        ErrorKind::Conflict,
        format!(
          "deployment {id} is {}, only Running deployments roll back",
          deployment.status
        ),
      ));
    }
    let Some(previous) = deployment.previous.clone() else {
      return Err(AgentError::msg(
        ErrorKind::InvalidRequest,
        format!("deployment {id} has no previous version to roll back to"),
      ));
    };

    self
      .transition(id, DeploymentState::RollingBack)
      .await?;

    let engine = self.arc();
    let id = id.to_string();
    let reason = reason.to_string();
    let current_version = deployment.version.clone();
    tokio::spawn(async move {
      orchestrate::run_rollback(
        engine,
        id,
        *previous,
        RollbackRecord {
          previous_version: current_version,
          reason,
          timestamp: arbor_timestamp(),
        },
      )
      .await;
    });

    Ok(self.require(&deployment.id)?.sanitized())
  }

  /// Re-run materialise / create / start for a `Stopped` or
  /// `Failed` deployment. The pinned image tag is reused when it
  /// still exists.
  pub async fn start(
    &self,
    id: &str,
  ) -> Result<Deployment, AgentError> {
    let deployment = self.require(id)?;
    if !deployment.status.is_terminal() {
      return Err(AgentError::msg(
        ErrorKind::Conflict,
        format!(
          "deployment {id} is {}, start applies to stopped or failed deployments",
          deployment.status
        ),
      ));
    }
    let restarted = self
      .update(id, |deployment| {
        deployment.status = DeploymentState::Pending;
      })
      .await?;
    let engine = self.arc();
    let id = id.to_string();
    tokio::spawn(async move {
      orchestrate::run(engine, id, None).await;
    });
    Ok(restarted.sanitized())
  }

  /// Supervisor restart for a `Running` deployment: docker restart
  /// then the readiness gate. A restart that never becomes ready
  /// fails the deployment.
  pub async fn restart(
    &self,
    id: &str,
  ) -> Result<Deployment, AgentError> {
    let deployment = self.require(id)?;
    if deployment.status != DeploymentState::Running {
      return Err(AgentError::msg(
        ErrorKind::Conflict,
        format!(
          "deployment {id} is {}, restart applies to running deployments",
          deployment.status
        ),
      ));
    }
    self.transition(id, DeploymentState::Updating).await?;
    match supervisor::restart(
      &deployment.container_name,
      &deployment.container_name,
      deployment.health_check.as_ref(),
    )
    .await
    {
      Ok(()) => {
        let restarted = self
          .update(id, |deployment| {
            deployment.status = DeploymentState::Running;
          })
          .await?;
        Ok(restarted.sanitized())
      }
      Err(e) => {
        self
          .fail(
            id,
            "Restart",
            e.error.context("restart did not become ready"),
            true,
          )
          .await;
        Err(AgentError::msg(
          ErrorKind::HealthCheckFailed,
          format!("restart of {id} failed readiness"),
        ))
      }
    }
  }

  pub fn get(&self, id: &str) -> Option<Deployment> {
    let deployments = self.deployments.read().unwrap();
    deployments.get(id).map(|d| d.clone().sanitized())
  }

  pub fn list(&self) -> Vec<Deployment> {
    let deployments = self.deployments.read().unwrap();
    let mut list: Vec<_> = deployments
      .values()
      .map(|d| d.clone().sanitized())
      .collect();
    list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    list
  }

  /// Merged tail of build and deployment logs, ordered by start
  /// timestamp.
  pub fn logs(
    &self,
    id: &str,
    tail: usize,
  ) -> Result<Vec<Log>, AgentError> {
    let deployment = self.require(id)?;
    let mut merged: Vec<Log> = deployment
      .build_logs
      .iter()
      .chain(deployment.deployment_logs.iter())
      .cloned()
      .collect();
    merged.sort_by(|a, b| a.start_ts.cmp(&b.start_ts));
    let skip = merged.len().saturating_sub(tail);
    Ok(merged.into_iter().skip(skip).collect())
  }

  // ── supervision hooks ─────────────────────────────────────

  pub async fn record_health(
    &self,
    id: &str,
    result: HealthCheckResult,
  ) {
    let res = self
      .update(id, |deployment| {
        deployment.last_health_check = Some(result);
      })
      .await;
    if let Err(e) = res {
      tracing::debug!("failed to record health check | {e:#}");
    }
  }

  pub async fn record_metrics(&self, id: &str, usage: ResourceUsage) {
    {
      let mut history =
        self.usage_history.entry(id.to_string()).or_default();
      if history.len() >= USAGE_HISTORY_CAPACITY {
        history.remove(0);
      }
      history.push(usage.clone());
    }
    let res = self
      .update(id, |deployment| {
        deployment.metrics = Some(usage);
      })
      .await;
    if let Err(e) = res {
      tracing::debug!("failed to record metrics | {e:#}");
    }
  }

  pub fn usage_history(&self, id: &str) -> Vec<ResourceUsage> {
    self
      .usage_history
      .get(id)
      .map(|history| history.value().clone())
      .unwrap_or_default()
  }

  /// Continuous liveness crossed its failure threshold. One
  /// supervised restart is attempted unless the restart policy
  /// is `no`; a failed attempt is terminal.
  pub async fn handle_liveness_failure(&self, id: &str) {
    let Some(deployment) = self.get(id) else {
      return;
    };
    if deployment.status != DeploymentState::Running {
      return;
    }
    tracing::warn!(
      "liveness failure threshold reached for {id} ({})",
      deployment.container_name,
    );
    use arbor_client::entities::deployment::RestartPolicy;
    if deployment.config.restart == RestartPolicy::No {
      self
        .fail(
          id,
          "Liveness",
          anyhow!("liveness failure threshold exceeded"),
          true,
        )
        .await;
      return;
    }
    match supervisor::restart(
      &deployment.container_name,
      &deployment.container_name,
      deployment.health_check.as_ref(),
    )
    .await
    {
      Ok(()) => {
        self
          .append_log(
            id,
            Log::simple(
              "Liveness",
              String::from(
                "container restarted after liveness failure",
              ),
            ),
          )
          .await;
      }
      Err(e) => {
        self
          .fail(
            id,
            "Liveness",
            e.error.context(
              "restart after liveness failure did not become ready",
            ),
            true,
          )
          .await;
      }
    }
  }

  // ── internals ─────────────────────────────────────────────

  /// Insert a fully-formed deployment record (rollback
  /// replacements, reconciliation) and persist it.
  pub(crate) async fn insert(
    &self,
    deployment: Deployment,
  ) -> Result<(), AgentError> {
    {
      let mut deployments = self.deployments.write().unwrap();
      deployments.insert(deployment.id.clone(), deployment.clone());
    }
    self.store.store_deployment(&deployment).await
  }

  pub(crate) fn require(
    &self,
    id: &str,
  ) -> Result<Deployment, AgentError> {
    let deployments = self.deployments.read().unwrap();
    deployments.get(id).cloned().ok_or_else(|| {
      AgentError::msg(
        ErrorKind::NotFound,
        format!("no deployment with id {id}"),
      )
    })
  }

  /// Apply a mutation under the write lock, then persist the
  /// snapshot. The store lock is never taken while the
  /// deployments lock is held.
  pub(crate) async fn update(
    &self,
    id: &str,
    f: impl FnOnce(&mut Deployment),
  ) -> Result<Deployment, AgentError> {
    let snapshot = {
      let mut deployments = self.deployments.write().unwrap();
      let deployment = deployments.get_mut(id).ok_or_else(|| {
        AgentError::msg(
          ErrorKind::NotFound,
          format!("no deployment with id {id}"),
        )
      })?;
      f(deployment);
      deployment.updated_at = arbor_timestamp();
      deployment.clone()
    };
    self.store.store_deployment(&snapshot).await?;
    Ok(snapshot)
  }

  pub(crate) async fn transition(
    &self,
    id: &str,
    status: DeploymentState,
  ) -> Result<Deployment, AgentError> {
    let deployment = self
      .update(id, |deployment| {
        deployment.status = status;
        if status == DeploymentState::Running
          && deployment.deployed_at.is_none()
        {
          deployment.deployed_at = Some(arbor_timestamp());
        }
      })
      .await?;
    tracing::info!("deployment {id} -> {status}");
    Ok(deployment)
  }

  pub(crate) async fn append_log(&self, id: &str, log: Log) {
    let res = self
      .update(id, |deployment| {
        deployment.deployment_logs.push(log);
      })
      .await;
    if let Err(e) = res {
      tracing::debug!("failed to append deployment log | {e:#}");
    }
  }

  /// Record the error, transition to `Failed`, and clean up the
  /// container / route fragment / reservation.
  pub(crate) async fn fail(
    &self,
    id: &str,
    stage: &str,
    error: anyhow::Error,
    remove_container: bool,
  ) {
    tracing::error!("deployment {id} failed at {stage} | {error:#}");
    self.disarm_supervision(id);
    let container_name = self
      .get(id)
      .map(|deployment| deployment.container_name)
      .unwrap_or_default();
    let res = self
      .update(id, |deployment| {
        deployment
          .deployment_logs
          .push(Log::error(stage, format_serror(&error.into())));
        deployment.status = DeploymentState::Failed;
        deployment.container_id = None;
      })
      .await;
    if let Err(e) = res {
      tracing::error!("failed to persist failure state | {e:#}");
    }
    if remove_container && !container_name.is_empty() {
      let log =
        crate::docker::remove_container(&container_name, true).await;
      if !log.success
        && !log.stderr.contains("No such container")
      {
        tracing::warn!(
          "container cleanup failed for {container_name} | {}",
          log.stderr.replace('\n', " | "),
        );
      }
    }
    if let Err(e) = crate::edge::remove_route_fragment(id).await {
      tracing::warn!("failed to remove route fragment | {e:#}");
    }
    self.governor.release(id);
  }

  pub(crate) fn disarm_supervision(&self, id: &str) {
    if let Some((_, cancel)) = self.supervisors.remove(id) {
      cancel.cancel();
    }
    if let Some((_, cancel)) = self.monitors.remove(id) {
      cancel.cancel();
    }
  }
}

fn validate_request(
  request: &DeployRequest,
) -> Result<(), AgentError> {
  use arbor_client::entities::deployment::DeploymentSource;
  if request.app_id.is_empty() {
    return Err(AgentError::msg(
      ErrorKind::InvalidRequest,
      "app_id is required",
    ));
  }
  if request.version.is_empty() {
    return Err(AgentError::msg(
      ErrorKind::InvalidRequest,
      "version is required",
    ));
  }
  if request
    .app_id
    .contains(|c: char| !c.is_ascii_alphanumeric() && !"-_ ".contains(c))
  {
    return Err(AgentError::msg(
      ErrorKind::InvalidRequest,
      "app_id may only contain alphanumerics, '-', '_' and spaces",
    ));
  }
  match &request.source {
    DeploymentSource::Git(git) => {
      if git.url.is_empty() {
        return Err(AgentError::msg(
          ErrorKind::InvalidRequest,
          "git source requires a url",
        ));
      }
    }
    DeploymentSource::Image(image) => {
      if image.reference.is_empty() {
        return Err(AgentError::msg(
          ErrorKind::InvalidRequest,
          "image source requires a reference",
        ));
      }
    }
  }
  if request.config.replicas > 1 {
    // One container per deployment on a single host. Horizontal
    // scale is the control plane's concern.
    return Err(AgentError::msg(
      ErrorKind::InvalidRequest,
      "replicas > 1 is not supported by a single host agent",
    ));
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use arbor_client::entities::deployment::{
    DeploymentSource, GitSource, ImageSource,
  };

  use super::*;

  fn image_request(app_id: &str, version: &str) -> DeployRequest {
    DeployRequest {
      app_id: app_id.to_string(),
      version: version.to_string(),
      source: DeploymentSource::Image(ImageSource {
        reference: "redis:7.0.5".to_string(),
        auth: None,
      }),
      ..Default::default()
    }
  }

  async fn test_engine() -> Arc<DeploymentEngine> {
    let store = Arc::new(
      StateStore::init(
        std::env::temp_dir()
          .join(format!("arbor-engine-{}", uuid::Uuid::new_v4()))
          .join("store.enc"),
        "test-passphrase".to_string(),
      )
      .await
      .unwrap(),
    );
    let governor =
      Arc::new(ResourceGovernor::new(Default::default(), 10));
    DeploymentEngine::new(
      store,
      governor,
      CancellationToken::new(),
    )
  }

  fn record(
    app_id: &str,
    version: &str,
    status: DeploymentState,
  ) -> Deployment {
    let id = deployment_id(app_id, version, 1712345678);
    Deployment {
      container_name: container_name(&id),
      subdomain: subdomain(app_id),
      id,
      app_id: app_id.to_string(),
      version: version.to_string(),
      status,
      ..Default::default()
    }
  }

  #[tokio::test]
  async fn require_unknown_is_not_found() {
    let engine = test_engine().await;
    let err = engine.require("missing").unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotFound);
  }

  #[tokio::test]
  async fn deploy_is_idempotent_while_running() {
    let engine = test_engine().await;
    let existing =
      record("demo", "1.0.0", DeploymentState::Running);
    let existing_id = existing.id.clone();
    engine.insert(existing).await.unwrap();

    let deployment =
      engine.deploy(image_request("demo", "1.0.0")).await.unwrap();
    assert_eq!(deployment.id, existing_id);
    assert_eq!(engine.list().len(), 1);
  }

  #[tokio::test]
  async fn deploy_conflicts_outside_running() {
    let engine = test_engine().await;
    engine
      .insert(record("demo", "1.0.0", DeploymentState::Pending))
      .await
      .unwrap();
    let err = engine
      .deploy(image_request("demo", "1.0.0"))
      .await
      .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Conflict);
  }

  #[tokio::test]
  async fn deploy_conflicts_on_subdomain_collision() {
    let engine = test_engine().await;
    // "my-app" and "my_app" derive the same subdomain.
    engine
      .insert(record("my-app", "1.0.0", DeploymentState::Running))
      .await
      .unwrap();
    let err = engine
      .deploy(image_request("my_app", "2.0.0"))
      .await
      .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Conflict);
  }

  #[tokio::test]
  async fn logs_merge_build_and_deployment_by_start_ts() {
    let engine = test_engine().await;
    let deployment =
      record("demo", "1.0.0", DeploymentState::Running);
    let id = deployment.id.clone();
    engine.insert(deployment).await.unwrap();

    engine
      .update(&id, |deployment| {
        let mut build = Log::simple("Build", "built".to_string());
        build.start_ts = 100;
        deployment.build_logs.push(build);
        let mut run = Log::simple("Docker Run", "ran".to_string());
        run.start_ts = 200;
        deployment.deployment_logs.push(run);
        let mut clone =
          Log::simple("Clone Repo", "cloned".to_string());
        clone.start_ts = 50;
        deployment.build_logs.push(clone);
      })
      .await
      .unwrap();

    let logs = engine.logs(&id, 10).unwrap();
    let stages: Vec<_> =
      logs.iter().map(|log| log.stage.as_str()).collect();
    assert_eq!(stages, vec!["Clone Repo", "Build", "Docker Run"]);

    let tail = engine.logs(&id, 1).unwrap();
    assert_eq!(tail[0].stage, "Docker Run");
  }

  #[test]
  fn validate_rejects_missing_fields() {
    let mut request = image_request("demo", "1.0.0");
    request.app_id = String::new();
    assert_eq!(
      validate_request(&request).unwrap_err().kind,
      ErrorKind::InvalidRequest
    );

    let mut request = image_request("demo", "1.0.0");
    request.source = DeploymentSource::Git(GitSource::default());
    assert_eq!(
      validate_request(&request).unwrap_err().kind,
      ErrorKind::InvalidRequest
    );

    let mut request = image_request("demo", "1.0.0");
    request.config.replicas = 3;
    assert_eq!(
      validate_request(&request).unwrap_err().kind,
      ErrorKind::InvalidRequest
    );
  }

  #[test]
  fn validate_accepts_wellformed_request() {
    validate_request(&image_request("demo", "1.0.0")).unwrap();
  }

  #[test]
  fn validate_rejects_hostile_app_ids() {
    let request = image_request("demo; rm -rf /", "1.0.0");
    assert_eq!(
      validate_request(&request).unwrap_err().kind,
      ErrorKind::InvalidRequest
    );
  }
}
