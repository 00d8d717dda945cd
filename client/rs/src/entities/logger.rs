use serde::{Deserialize, Serialize};
use typeshare::typeshare;

/// Agent logging configuration, consumed by the `logger` lib.
#[typeshare]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LogConfig {
  /// Minimum level emitted. default: info
  #[serde(default)]
  pub level: LogLevel,

  /// Stdout / stderr log encoding.
  #[serde(default)]
  pub stdio: StdioLogMode,

  /// Use tracing-subscriber's pretty output.
  #[serde(default)]
  pub pretty: bool,

  /// Export spans to an OTLP collector when non-empty.
  #[serde(default)]
  pub otlp_endpoint: String,

  /// Service name attached to exported spans.
  #[serde(default = "default_otlp_service_name")]
  pub otlp_service_name: String,
}

fn default_otlp_service_name() -> String {
  String::from("Arbor Agent")
}

impl Default for LogConfig {
  fn default() -> LogConfig {
    LogConfig {
      level: Default::default(),
      stdio: Default::default(),
      pretty: Default::default(),
      otlp_endpoint: Default::default(),
      otlp_service_name: default_otlp_service_name(),
    }
  }
}

#[typeshare]
#[derive(
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
  Hash,
  Serialize,
  Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
  Trace,
  Debug,
  #[default]
  Info,
  Warn,
  Error,
}

impl From<LogLevel> for tracing::Level {
  fn from(value: LogLevel) -> Self {
    match value {
      LogLevel::Trace => tracing::Level::TRACE,
      LogLevel::Debug => tracing::Level::DEBUG,
      LogLevel::Info => tracing::Level::INFO,
      LogLevel::Warn => tracing::Level::WARN,
      LogLevel::Error => tracing::Level::ERROR,
    }
  }
}

impl From<tracing::Level> for LogLevel {
  fn from(value: tracing::Level) -> Self {
    match value {
      tracing::Level::TRACE => LogLevel::Trace,
      tracing::Level::DEBUG => LogLevel::Debug,
      tracing::Level::INFO => LogLevel::Info,
      tracing::Level::WARN => LogLevel::Warn,
      tracing::Level::ERROR => LogLevel::Error,
    }
  }
}

#[typeshare]
#[derive(
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
  Hash,
  Serialize,
  Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum StdioLogMode {
  #[default]
  Standard,
  Json,
  None,
}
