use std::{
  path::{Path, PathBuf},
  sync::{
    OnceLock,
    atomic::{AtomicU64, Ordering},
  },
  time::Duration,
};

use anyhow::Context;
use arbor_client::entities::arbor_timestamp;
use serde::{Deserialize, Serialize};
use tokio::{io::AsyncWriteExt, sync::mpsc, sync::oneshot};

use crate::config::agent_config;

const AUDIT_QUEUE_CAPACITY: usize = 500;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AuditEvent {
  pub timestamp: i64,
  pub event: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub server_id: Option<String>,
  #[serde(default)]
  pub detail: serde_json::Value,
}

enum AuditMessage {
  Event(AuditEvent),
  Flush(oneshot::Sender<()>),
}

/// Bounded-queue audit writer. Operations never block on audit:
/// events are dropped (and counted) when the queue is full.
pub struct AuditLogger {
  tx: mpsc::Sender<AuditMessage>,
  dropped: AtomicU64,
}

static AUDIT: OnceLock<AuditLogger> = OnceLock::new();

pub fn init() {
  let (tx, rx) = mpsc::channel(AUDIT_QUEUE_CAPACITY);
  let security = &agent_config().security;
  if security.audit_log_enabled {
    tokio::spawn(writer_loop(
      rx,
      security.audit_file.clone(),
      security.audit_max_size_mb * 1024 * 1024,
      security.audit_retention,
    ));
  } else {
    tokio::spawn(drain_loop(rx));
  }
  let _ = AUDIT.set(AuditLogger {
    tx,
    dropped: AtomicU64::new(0),
  });
}

pub fn audit() -> &'static AuditLogger {
  AUDIT.get().expect("audit logger not initialized")
}

/// Flush on shutdown, tolerant of init never having run.
pub async fn flush(grace: Duration) {
  if let Some(audit) = AUDIT.get() {
    audit.flush(grace).await;
  }
}

impl AuditLogger {
  pub fn record(
    &self,
    event: impl Into<String>,
    server_id: Option<String>,
    detail: serde_json::Value,
  ) {
    let message = AuditMessage::Event(AuditEvent {
      timestamp: arbor_timestamp(),
      event: event.into(),
      server_id,
      detail,
    });
    if self.tx.try_send(message).is_err() {
      let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
      tracing::warn!(
        "audit queue full, event dropped (total dropped: {dropped})"
      );
    }
  }

  pub fn dropped_events(&self) -> u64 {
    self.dropped.load(Ordering::Relaxed)
  }

  /// Drain the queue on shutdown, bounded by `grace`.
  pub async fn flush(&self, grace: Duration) {
    let (tx, rx) = oneshot::channel();
    if self.tx.send(AuditMessage::Flush(tx)).await.is_err() {
      return;
    }
    let _ = tokio::time::timeout(grace, rx).await;
  }
}

async fn drain_loop(mut rx: mpsc::Receiver<AuditMessage>) {
  while let Some(message) = rx.recv().await {
    if let AuditMessage::Flush(ack) = message {
      let _ = ack.send(());
    }
  }
}

async fn writer_loop(
  mut rx: mpsc::Receiver<AuditMessage>,
  path: PathBuf,
  max_size_bytes: u64,
  retention: usize,
) {
  if let Some(parent) = path.parent()
    && let Err(e) = tokio::fs::create_dir_all(parent).await
  {
    tracing::error!(
      "failed to create audit log directory {parent:?} | {e:?}"
    );
  }
  while let Some(message) = rx.recv().await {
    match message {
      AuditMessage::Event(event) => {
        if let Err(e) =
          append_event(&path, &event, max_size_bytes, retention)
            .await
        {
          tracing::error!("failed to write audit event | {e:#}");
        }
      }
      AuditMessage::Flush(ack) => {
        let _ = ack.send(());
      }
    }
  }
}

async fn append_event(
  path: &Path,
  event: &AuditEvent,
  max_size_bytes: u64,
  retention: usize,
) -> anyhow::Result<()> {
  if let Ok(metadata) = tokio::fs::metadata(path).await
    && metadata.len() >= max_size_bytes
  {
    rotate(path, retention).await?;
  }
  let mut line = serde_json::to_vec(event)
    .context("failed to serialize audit event")?;
  line.push(b'\n');
  let mut file = tokio::fs::OpenOptions::new()
    .create(true)
    .append(true)
    .open(path)
    .await
    .with_context(|| {
      format!("failed to open audit log at {path:?}")
    })?;
  file
    .write_all(&line)
    .await
    .context("failed to append audit event")?;
  Ok(())
}

/// `audit.log -> audit.log.1 -> ... -> audit.log.<retention>`,
/// dropping the oldest.
async fn rotate(path: &Path, retention: usize) -> anyhow::Result<()> {
  let rotated = |index: usize| {
    PathBuf::from(format!("{}.{index}", path.display()))
  };
  let _ = tokio::fs::remove_file(rotated(retention)).await;
  for index in (1..retention).rev() {
    let _ = tokio::fs::rename(rotated(index), rotated(index + 1))
      .await;
  }
  tokio::fs::rename(path, rotated(1)).await.with_context(|| {
    format!("failed to rotate audit log at {path:?}")
  })?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  fn test_dir() -> PathBuf {
    std::env::temp_dir()
      .join(format!("arbor-audit-{}", uuid::Uuid::new_v4()))
  }

  #[tokio::test]
  async fn events_append_as_json_lines() {
    let path = test_dir().join("audit.log");
    let event = AuditEvent {
      timestamp: arbor_timestamp(),
      event: String::from("AUTH_SUCCESS"),
      server_id: Some(String::from("srv-1")),
      detail: serde_json::json!({ "path": "/api/v1/deployments" }),
    };
    append_event(&path, &event, u64::MAX, 3).await.unwrap_err();
    // Parent dir missing: create then retry.
    tokio::fs::create_dir_all(path.parent().unwrap())
      .await
      .unwrap();
    append_event(&path, &event, u64::MAX, 3).await.unwrap();
    append_event(&path, &event, u64::MAX, 3).await.unwrap();

    let contents = tokio::fs::read_to_string(&path).await.unwrap();
    let lines: Vec<_> = contents.lines().collect();
    assert_eq!(lines.len(), 2);
    let parsed: AuditEvent =
      serde_json::from_str(lines[0]).unwrap();
    assert_eq!(parsed.event, "AUTH_SUCCESS");
  }

  #[tokio::test]
  async fn rotation_shifts_files_and_keeps_retention() {
    let dir = test_dir();
    tokio::fs::create_dir_all(&dir).await.unwrap();
    let path = dir.join("audit.log");
    let event = AuditEvent {
      timestamp: arbor_timestamp(),
      event: String::from("AUTH_MISSING_TOKEN"),
      server_id: None,
      detail: serde_json::Value::Null,
    };
    // Size limit 1 byte: every append after the first rotates.
    append_event(&path, &event, 1, 2).await.unwrap();
    append_event(&path, &event, 1, 2).await.unwrap();
    append_event(&path, &event, 1, 2).await.unwrap();

    assert!(path.exists());
    assert!(dir.join("audit.log.1").exists());
    assert!(dir.join("audit.log.2").exists());
    assert!(!dir.join("audit.log.3").exists());
  }
}
