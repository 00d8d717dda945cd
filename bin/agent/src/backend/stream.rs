use std::{sync::OnceLock, time::Duration};

use anyhow::Context;
use arbor_client::entities::{Command, CommandResponse};
use futures::{SinkExt, StreamExt};
use tokio::sync::{RwLock, mpsc};
use tokio_tungstenite::tungstenite::{
  Message, client::IntoClientRequest,
};

use crate::{
  config::agent_config,
  dispatch::CommandDispatcher,
  state::{current_token, state},
};

/// Minimum pause between reconnect attempts.
const RECONNECT_SECONDS: u64 = 30;

/// Outbound side of the live stream. Replaced under the write
/// lock on every reconnect; None while disconnected.
fn stream_sender()
-> &'static RwLock<Option<mpsc::UnboundedSender<Message>>> {
  static SENDER: OnceLock<
    RwLock<Option<mpsc::UnboundedSender<Message>>>,
  > = OnceLock::new();
  SENDER.get_or_init(Default::default)
}

/// Send a response over the live stream. Err when disconnected,
/// so the caller can fall back to the http channel.
pub async fn try_send_response(
  response: &CommandResponse,
) -> anyhow::Result<()> {
  let sender = stream_sender().read().await;
  let sender = sender
    .as_ref()
    .context("command stream is not connected")?;
  let text = serde_json::to_string(response)
    .context("failed to serialize command response")?;
  sender
    .send(Message::text(text))
    .context("command stream closed mid-send")?;
  Ok(())
}

/// Persistent bidirectional command stream. Commands arrive
/// pushed; responses return on the same stream. Reconnects with
/// a fixed pause on any failure.
pub fn spawn_command_stream(
  dispatcher: &'static CommandDispatcher,
) {
  let config = agent_config();
  if config.backend.base_url.is_empty() {
    return;
  }
  let endpoint = format!(
    "{}/ws/agent",
    config
      .backend
      .base_url
      .trim_end_matches('/')
      .replacen("http", "ws", 1),
  );
  tokio::spawn(async move {
    let mut already_logged_error = false;
    loop {
      if state().cancel.is_cancelled() {
        return;
      }
      match connect_and_handle(&endpoint, dispatcher).await {
        Ok(()) => return,
        Err(e) => {
          if !already_logged_error {
            tracing::warn!("command stream error | {e:#}");
            already_logged_error = true;
          }
        }
      }
      *stream_sender().write().await = None;
      tokio::select! {
        _ = state().cancel.cancelled() => return,
        _ = tokio::time::sleep(
          Duration::from_secs(RECONNECT_SECONDS),
        ) => {}
      }
    }
  });
}

async fn connect_and_handle(
  endpoint: &str,
  dispatcher: &'static CommandDispatcher,
) -> anyhow::Result<()> {
  let mut request = endpoint
    .into_client_request()
    .context("invalid stream endpoint")?;
  let token = current_token().await;
  request.headers_mut().insert(
    "Authorization",
    format!("Bearer {token}")
      .parse()
      .context("token is not a valid header value")?,
  );
  request.headers_mut().insert(
    "X-Agent-Id",
    agent_config()
      .agent
      .id
      .parse()
      .context("agent id is not a valid header value")?,
  );

  let (socket, _response) =
    tokio_tungstenite::connect_async(request)
      .await
      .with_context(|| {
        format!("failed to connect stream to {endpoint}")
      })?;
  tracing::info!("command stream connected");
  let (mut write, mut read) = socket.split();

  let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
  *stream_sender().write().await = Some(tx);

  loop {
    tokio::select! {
      _ = state().cancel.cancelled() => {
        let _ = write.send(Message::Close(None)).await;
        return Ok(());
      }
      outgoing = rx.recv() => {
        let Some(message) = outgoing else {
          return Err(anyhow::anyhow!("response channel closed"));
        };
        write
          .send(message)
          .await
          .context("failed to send on command stream")?;
      }
      incoming = read.next() => {
        let message = incoming
          .context("command stream closed by peer")?
          .context("command stream read failed")?;
        match message {
          Message::Text(text) => {
            match serde_json::from_str::<Command>(&text) {
              Ok(command) => dispatcher.enqueue(command).await,
              Err(e) => {
                tracing::warn!(
                  "unparseable command on stream | {e:?}"
                );
              }
            }
          }
          Message::Ping(payload) => {
            write
              .send(Message::Pong(payload))
              .await
              .context("failed to answer stream ping")?;
          }
          Message::Close(_) => {
            return Err(anyhow::anyhow!(
              "command stream closed by peer"
            ));
          }
          _ => {}
        }
      }
    }
  }
}
