use std::{
  sync::{Arc, OnceLock},
  time::{Duration, Instant},
};

use arbor_client::{
  entities::{Command, CommandResponse, command::CommandOp},
  error::ErrorKind,
};
use tokio::sync::{Semaphore, mpsc, mpsc::error::TrySendError};

use crate::{
  audit::audit,
  backend::{self, stream},
  config::agent_config,
  state::state,
};

mod handlers;

/// Commands waiting for a worker. Producers that would block are
/// rejected instead.
pub const COMMAND_QUEUE_CAPACITY: usize = 100;

/// Deadline applied when a command does not carry its own.
const DEFAULT_COMMAND_TIMEOUT: u64 = 300;

/// Bounded intake for plane commands, drained by a worker pool of
/// `max_concurrent_ops`. Exactly one `started` and one terminal
/// response is emitted per accepted command.
pub struct CommandDispatcher {
  queue_tx: mpsc::Sender<Command>,
}

static DISPATCHER: OnceLock<CommandDispatcher> = OnceLock::new();

pub fn init_dispatcher() -> &'static CommandDispatcher {
  let (queue_tx, queue_rx) =
    mpsc::channel(COMMAND_QUEUE_CAPACITY);
  tokio::spawn(drain_loop(queue_rx));
  let _ = DISPATCHER.set(CommandDispatcher { queue_tx });
  dispatcher()
}

pub fn dispatcher() -> &'static CommandDispatcher {
  DISPATCHER.get().expect("dispatcher not initialized")
}

impl CommandDispatcher {
  /// Accept a command from either ingestion channel. Emits the
  /// `started` response on intake, or a single
  /// `capacity_exceeded` rejection when the queue is full.
  pub async fn enqueue(&self, command: Command) {
    let command_id = command.id.clone();
    match self.queue_tx.try_send(command) {
      Ok(()) => {
        deliver_response(CommandResponse::started(&command_id))
          .await;
      }
      Err(TrySendError::Full(_)) => {
        tracing::warn!(
          "command queue full, rejecting {command_id}"
        );
        deliver_response(CommandResponse::rejected(
          &command_id,
          String::from("capacity_exceeded"),
        ))
        .await;
      }
      Err(TrySendError::Closed(_)) => {
        tracing::error!(
          "command queue closed, dropping {command_id}"
        );
      }
    }
  }
}

async fn drain_loop(mut queue_rx: mpsc::Receiver<Command>) {
  let workers = Arc::new(Semaphore::new(
    agent_config().agent.max_concurrent_ops.max(1),
  ));
  loop {
    let command = tokio::select! {
      _ = state().cancel.cancelled() => return,
      command = queue_rx.recv() => command,
    };
    let Some(command) = command else {
      return;
    };
    let Ok(permit) = workers.clone().acquire_owned().await else {
      return;
    };
    tokio::spawn(async move {
      let _permit = permit;
      execute_command(command).await;
    });
  }
}

async fn execute_command(command: Command) {
  let started = Instant::now();
  let command_id = command.id.clone();

  // Per-variant validation happens at this boundary; a spec that
  // does not parse never reaches a handler.
  let op = match CommandOp::parse(&command) {
    Ok(op) => op,
    Err(e) => {
      deliver_response(CommandResponse::rejected(
        &command_id,
        format!("{e:#}"),
      ))
      .await;
      return;
    }
  };
  if op.requires_target() && command.target.is_empty() {
    deliver_response(CommandResponse::rejected(
      &command_id,
      format!(
        "{}.{} requires a target",
        command.kind, command.action
      ),
    ))
    .await;
    return;
  }

  audit().record(
    "COMMAND_EXECUTE",
    None,
    serde_json::json!({
      "command_id": &command_id,
      "type": command.kind.to_string(),
      "action": &command.action,
      "target": &command.target,
    }),
  );

  let deadline = Duration::from_secs(
    command.timeout.unwrap_or(DEFAULT_COMMAND_TIMEOUT).max(1),
  );
  let result = tokio::select! {
    _ = state().cancel.cancelled() => {
      Err(arbor_client::error::AgentError::msg(
        ErrorKind::Cancelled,
        "agent shutting down",
      ))
    }
    result = tokio::time::timeout(
      deadline,
      handlers::execute(op, &command),
    ) => match result {
      Ok(result) => result,
      Err(_elapsed) => Err(arbor_client::error::AgentError::msg(
        ErrorKind::DeadlineExceeded,
        format!("command exceeded {}s deadline", deadline.as_secs()),
      )),
    },
  };

  let duration_ms = started.elapsed().as_millis() as u64;
  let response = match result {
    Ok(data) => {
      CommandResponse::completed(&command_id, data, duration_ms)
    }
    Err(e) => CommandResponse::failed(
      &command_id,
      format!("{e}"),
      duration_ms,
    ),
  };
  deliver_response(response).await;
}

/// Responses prefer the live stream, falling back to the http
/// channel when disconnected.
pub async fn deliver_response(response: CommandResponse) {
  if stream::try_send_response(&response).await.is_ok() {
    return;
  }
  if let Some(backend) = backend::backend() {
    if let Err(e) = backend.submit_response(&response).await {
      tracing::warn!(
        "failed to deliver response for {} | {e:#}",
        response.command_id,
      );
    }
  } else {
    tracing::debug!(
      "no response channel for {} ({})",
      response.command_id,
      response.status,
    );
  }
}
