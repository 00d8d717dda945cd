#[macro_use]
extern crate tracing;

use std::{net::SocketAddr, str::FromStr, time::Duration};

use anyhow::Context;

use crate::config::agent_config;

mod api;
mod audit;
mod backend;
mod config;
mod dispatch;
mod docker;
mod edge;
mod engine;
mod governor;
mod state;
mod stats;
mod store;
mod supervisor;

/// Grace given to background tasks and the audit queue once
/// shutdown begins.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(10);

async fn app() -> anyhow::Result<()> {
  dotenvy::dotenv().ok();
  let config = agent_config();
  logger::init(&config.logging)?;

  info!("Arbor Agent version: v{}", env!("CARGO_PKG_VERSION"));
  info!("{:?}", config.sanitized());

  stats::spawn_polling_thread();

  let state = state::init_state().await?;
  audit::init();

  // Crash recovery before anything can issue commands.
  engine::reconcile::reconcile(&state.engine)
    .await
    .context("failed to reconcile persisted deployments")?;

  // A validated envelope is worth keeping a copy of.
  match state.store.backup(&state.store.backup_path()).await {
    Ok(()) => {}
    Err(e)
      if e.kind == arbor_client::error::ErrorKind::NotFound => {}
    Err(e) => warn!("state backup failed | {e:#}"),
  }

  // Registration is fatal on failure.
  backend::register().await?;

  let dispatcher = dispatch::init_dispatcher();
  backend::spawn_command_poller(dispatcher);
  backend::stream::spawn_command_stream(dispatcher);
  backend::spawn_heartbeat();
  backend::spawn_token_rotation();
  if config.monitoring.enabled {
    engine::supervise::spawn_metrics_loop(state.engine.clone());
  }
  engine::supervise::spawn_supervision_scheduler(
    state.engine.clone(),
  );

  let addr =
    format!("{}:{}", config.agent.bind_ip, config.agent.port);
  let socket_addr = SocketAddr::from_str(&addr)
    .context("failed to parse listen address")?;
  let listener = tokio::net::TcpListener::bind(socket_addr)
    .await
    .with_context(|| format!("failed to bind {socket_addr}"))?;
  info!("Arbor Agent starting on http://{socket_addr}");

  let cancel = state.cancel.clone();
  axum::serve(listener, api::router())
    .with_graceful_shutdown(async move {
      cancel.cancelled().await;
    })
    .await
    .context("http server failed")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  let mut term_signal = tokio::signal::unix::signal(
    tokio::signal::unix::SignalKind::terminate(),
  )?;

  let app = tokio::spawn(app());

  tokio::select! {
    res = app => return res?,
    _ = term_signal.recv() => {
      info!("SIGTERM received, draining");
    }
  }

  // Cancel the agent context; in-flight work has a bounded drain
  // window, the audit queue flushes inside the same budget.
  if let Some(state) = state::try_state() {
    state.cancel.cancel();
    audit::flush(SHUTDOWN_DRAIN).await;
  }

  Ok(())
}
