use std::sync::{Arc, OnceLock};

use anyhow::Context;
use arbor_client::entities::arbor_timestamp;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::{
  config::agent_config, engine::DeploymentEngine,
  governor::ResourceGovernor, store::StateStore,
};

/// Process-wide state, built once at startup. The agent context
/// (`cancel`) is cancelled at shutdown; every long-lived task
/// lives under it.
pub struct AgentState {
  pub engine: Arc<DeploymentEngine>,
  pub store: Arc<StateStore>,
  pub governor: Arc<ResourceGovernor>,
  pub cancel: CancellationToken,
  /// Current backend credential. Swapped atomically on rotation;
  /// poll / stream pick up the new value on next use.
  pub token: RwLock<String>,
  pub started_at: i64,
}

static STATE: OnceLock<AgentState> = OnceLock::new();

pub async fn init_state() -> anyhow::Result<&'static AgentState> {
  let config = agent_config();
  let cancel = CancellationToken::new();

  let store = Arc::new(
    StateStore::init(
      config.storage.data_dir.join("store.enc"),
      config.storage.encryption_key.clone(),
    )
    .await
    .context("failed to initialize state store")?,
  );

  // Flag identity changes against the last persisted config.
  match store.load_config().await {
    Ok(Some(previous))
      if previous.agent.id != config.agent.id =>
    {
      tracing::warn!(
        "agent id changed since last run ({} -> {})",
        previous.agent.id,
        config.agent.id,
      );
    }
    Ok(_) => {}
    Err(e) => {
      tracing::warn!("failed to load persisted config | {e:#}")
    }
  }
  if let Err(e) = store.store_config(config).await {
    tracing::warn!("failed to persist config snapshot | {e:#}");
  }

  let governor = Arc::new(ResourceGovernor::new(
    config.resources.quota.clone(),
    config.resources.max_containers,
  ));

  let engine = DeploymentEngine::new(
    store.clone(),
    governor.clone(),
    cancel.clone(),
  );

  // Prefer a previously stored (possibly rotated) token over the
  // configured one; an expired stored token is dropped.
  let token = match store.load_token().await {
    Ok(Some(stored))
      if !stored.is_expired(arbor_timestamp()) =>
    {
      stored.token
    }
    Ok(Some(_expired)) => {
      tracing::warn!(
        "stored backend token expired, falling back to config"
      );
      if let Err(e) = store.delete_token().await {
        tracing::warn!("failed to drop expired token | {e:#}");
      }
      crate::config::initial_backend_token()?
    }
    _ => crate::config::initial_backend_token()?,
  };

  STATE
    .set(AgentState {
      engine,
      store,
      governor,
      cancel,
      token: RwLock::new(token),
      started_at: arbor_timestamp(),
    })
    .map_err(|_| anyhow::anyhow!("agent state already initialized"))?;
  Ok(state())
}

pub fn state() -> &'static AgentState {
  STATE.get().expect("agent state not initialized")
}

/// For shutdown paths that may run before init completes.
pub fn try_state() -> Option<&'static AgentState> {
  STATE.get()
}

pub async fn current_token() -> String {
  state().token.read().await.clone()
}
