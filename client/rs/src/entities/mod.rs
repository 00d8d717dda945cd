use std::collections::VecDeque;

use async_timing_util::unix_timestamp_ms;
use serde::{Deserialize, Serialize};
use typeshare::typeshare;

/// [Command] and [CommandResponse], the control plane wire contract.
pub mod command;
/// [AgentConfig][config::AgentConfig] and its sections.
pub mod config;
/// [Deployment][deployment::Deployment] and subtypes.
pub mod deployment;
/// Health check configuration and results.
pub mod health;
/// Subtypes of [LogConfig][logger::LogConfig].
pub mod logger;
/// Resource limits, quotas, reservations, usage samples.
pub mod resource;
/// Host / container stats and status reports.
pub mod stats;
/// Agent token material.
pub mod token;

pub use command::{Command, CommandResponse};

#[typeshare(serialized_as = "number")]
pub type I64 = i64;
#[typeshare(serialized_as = "number")]
pub type U64 = u64;
#[typeshare(serialized_as = "any")]
pub type JsonValue = serde_json::Value;

/// Unix timestamp in milliseconds.
pub fn arbor_timestamp() -> i64 {
  unix_timestamp_ms() as i64
}

/// An environment variable in `VARIABLE=value` form.
#[typeshare]
#[derive(
  Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq,
)]
pub struct EnvironmentVar {
  pub variable: String,
  pub value: String,
}

/// The result of one stage of work, eg a shell command
/// or an orchestration step.
#[typeshare]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Log {
  pub stage: String,
  pub command: String,
  pub stdout: String,
  pub stderr: String,
  pub success: bool,
  #[typeshare(serialized_as = "number")]
  pub start_ts: i64,
  #[typeshare(serialized_as = "number")]
  pub end_ts: i64,
}

impl Log {
  pub fn simple(stage: &str, msg: String) -> Log {
    let ts = arbor_timestamp();
    Log {
      stage: stage.to_string(),
      stdout: msg,
      success: true,
      start_ts: ts,
      end_ts: ts,
      ..Default::default()
    }
  }

  pub fn error(stage: &str, msg: String) -> Log {
    let ts = arbor_timestamp();
    Log {
      stage: stage.to_string(),
      stderr: msg,
      success: false,
      start_ts: ts,
      end_ts: ts,
      ..Default::default()
    }
  }
}

impl Default for Log {
  fn default() -> Log {
    let ts = arbor_timestamp();
    Log {
      stage: Default::default(),
      command: Default::default(),
      stdout: Default::default(),
      stderr: Default::default(),
      success: true,
      start_ts: ts,
      end_ts: ts,
    }
  }
}

pub fn all_logs_success(logs: &[Log]) -> bool {
  for log in logs {
    if !log.success {
      return false;
    }
  }
  true
}

/// A bounded log buffer. Oldest entries are dropped once
/// `capacity` is reached. Serialises as the retained tail.
#[typeshare]
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(transparent)]
pub struct LogBuffer {
  entries: VecDeque<Log>,
}

/// Retained entries per deployment log buffer.
pub const LOG_BUFFER_CAPACITY: usize = 200;

impl LogBuffer {
  pub fn push(&mut self, log: Log) {
    if self.entries.len() >= LOG_BUFFER_CAPACITY {
      self.entries.pop_front();
    }
    self.entries.push_back(log);
  }

  pub fn extend(&mut self, logs: impl IntoIterator<Item = Log>) {
    for log in logs {
      self.push(log);
    }
  }

  pub fn iter(&self) -> impl Iterator<Item = &Log> {
    self.entries.iter()
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  /// The last `tail` entries, oldest first.
  pub fn tail(&self, tail: usize) -> Vec<Log> {
    let skip = self.entries.len().saturating_sub(tail);
    self.entries.iter().skip(skip).cloned().collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn log_buffer_drops_oldest_at_capacity() {
    let mut buffer = LogBuffer::default();
    for i in 0..(LOG_BUFFER_CAPACITY + 25) {
      buffer.push(Log::simple("stage", format!("line {i}")));
    }
    assert_eq!(buffer.len(), LOG_BUFFER_CAPACITY);
    let first = buffer.iter().next().unwrap();
    assert_eq!(first.stdout, "line 25");
  }

  #[test]
  fn log_buffer_tail_returns_newest() {
    let mut buffer = LogBuffer::default();
    for i in 0..10 {
      buffer.push(Log::simple("stage", format!("line {i}")));
    }
    let tail = buffer.tail(3);
    assert_eq!(tail.len(), 3);
    assert_eq!(tail[0].stdout, "line 7");
    assert_eq!(tail[2].stdout, "line 9");
  }

  #[test]
  fn all_logs_success_fails_on_any_error() {
    let logs = vec![
      Log::simple("one", "ok".to_string()),
      Log::error("two", "boom".to_string()),
    ];
    assert!(!all_logs_success(&logs));
    assert!(all_logs_success(&logs[..1]));
  }
}
