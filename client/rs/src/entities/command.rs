use std::collections::HashMap;

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display};
use typeshare::typeshare;

use crate::entities::{
  EnvironmentVar, JsonValue,
  deployment::{DeployRequest, GitSource},
};

/// A command as received from the control plane. The `spec` payload
/// is opaque on the wire; [CommandOp::parse] turns the
/// `(type, action, spec)` triple into a typed variant at the
/// dispatch boundary.
#[typeshare]
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Command {
  pub id: String,
  #[serde(rename = "type")]
  pub kind: CommandType,
  pub action: String,
  /// Deployment / container the command addresses, where relevant.
  #[serde(default)]
  pub target: String,
  #[serde(default)]
  pub spec: JsonValue,
  #[serde(default)]
  pub environment: Vec<EnvironmentVar>,
  /// Execution deadline, seconds. Engine default applies when absent.
  #[serde(default)]
  #[typeshare(serialized_as = "number")]
  pub timeout: Option<u64>,
  #[serde(default)]
  #[typeshare(serialized_as = "number")]
  pub priority: i32,
  #[serde(default)]
  pub metadata: HashMap<String, String>,
}

#[typeshare]
#[derive(
  Serialize,
  Deserialize,
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
  Display,
  AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum CommandType {
  #[default]
  Deployment,
  Container,
  Git,
  System,
}

/// Typed command operations, one variant per `(type, action)` pair.
/// Validation of the opaque `spec` happens here, before any handler
/// runs.
#[derive(Debug, Clone)]
pub enum CommandOp {
  DeploymentDeploy(DeployRequest),
  DeploymentUpdate(DeployRequest),
  DeploymentRollback { reason: String },
  DeploymentScale { replicas: u32 },
  ContainerStart,
  ContainerStop,
  ContainerRestart,
  ContainerDelete,
  ContainerLogs { tail: u64 },
  ContainerStats,
  GitClone(GitSource),
  GitPull(GitSource),
  GitBuild { source: GitSource, tag: String },
  SystemStatus,
  SystemHealth,
  SystemCleanup,
  SystemUpdate,
}

#[derive(Deserialize)]
struct RollbackSpec {
  #[serde(default)]
  reason: String,
}

#[derive(Deserialize)]
struct ScaleSpec {
  replicas: u32,
}

#[derive(Deserialize)]
struct LogsSpec {
  #[serde(default = "default_tail")]
  tail: u64,
}

fn default_tail() -> u64 {
  100
}

#[derive(Deserialize)]
struct BuildSpec {
  #[serde(flatten)]
  source: GitSource,
  tag: String,
}

impl CommandOp {
  pub fn parse(command: &Command) -> anyhow::Result<CommandOp> {
    let Command {
      kind, action, spec, ..
    } = command;
    let op = match (kind, action.as_str()) {
      (CommandType::Deployment, "deploy") => {
        CommandOp::DeploymentDeploy(from_spec(spec)?)
      }
      (CommandType::Deployment, "update") => {
        CommandOp::DeploymentUpdate(from_spec(spec)?)
      }
      (CommandType::Deployment, "rollback") => {
        let RollbackSpec { reason } = from_spec(spec)?;
        CommandOp::DeploymentRollback { reason }
      }
      (CommandType::Deployment, "scale") => {
        let ScaleSpec { replicas } = from_spec(spec)?;
        CommandOp::DeploymentScale { replicas }
      }
      (CommandType::Container, "start") => CommandOp::ContainerStart,
      (CommandType::Container, "stop") => CommandOp::ContainerStop,
      (CommandType::Container, "restart") => {
        CommandOp::ContainerRestart
      }
      (CommandType::Container, "delete") => CommandOp::ContainerDelete,
      (CommandType::Container, "logs") => {
        let LogsSpec { tail } = from_spec(spec)?;
        CommandOp::ContainerLogs { tail }
      }
      (CommandType::Container, "stats") => CommandOp::ContainerStats,
      (CommandType::Git, "clone") => CommandOp::GitClone(from_spec(spec)?),
      (CommandType::Git, "pull") => CommandOp::GitPull(from_spec(spec)?),
      (CommandType::Git, "build") => {
        let BuildSpec { source, tag } = from_spec(spec)?;
        CommandOp::GitBuild { source, tag }
      }
      (CommandType::System, "status") => CommandOp::SystemStatus,
      (CommandType::System, "health") => CommandOp::SystemHealth,
      (CommandType::System, "cleanup") => CommandOp::SystemCleanup,
      (CommandType::System, "update") => CommandOp::SystemUpdate,
      (kind, action) => {
        return Err(anyhow!("unknown command {kind}.{action}"));
      }
    };
    Ok(op)
  }

  /// Whether this operation requires a non-empty `target`.
  pub fn requires_target(&self) -> bool {
    matches!(
      self,
      CommandOp::DeploymentRollback { .. }
        | CommandOp::DeploymentScale { .. }
        | CommandOp::ContainerStart
        | CommandOp::ContainerStop
        | CommandOp::ContainerRestart
        | CommandOp::ContainerDelete
        | CommandOp::ContainerLogs { .. }
        | CommandOp::ContainerStats
    )
  }
}

fn from_spec<T: serde::de::DeserializeOwned>(
  spec: &JsonValue,
) -> anyhow::Result<T> {
  // An absent spec decodes like an empty object, so variants
  // whose fields all default still parse.
  let spec = if spec.is_null() {
    JsonValue::Object(Default::default())
  } else {
    spec.clone()
  };
  serde_json::from_value(spec)
    .context("command spec does not match the expected shape")
}

/// Exactly two responses are emitted per command:
/// `Started` on intake, then one terminal response.
#[typeshare]
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct CommandResponse {
  pub command_id: String,
  pub status: CommandStatus,
  pub success: bool,
  #[serde(default)]
  pub data: Option<JsonValue>,
  #[serde(default)]
  pub error: Option<String>,
  /// Milliseconds from intake to this response.
  #[typeshare(serialized_as = "number")]
  pub duration_ms: u64,
  #[typeshare(serialized_as = "number")]
  pub timestamp: i64,
}

impl CommandResponse {
  pub fn started(command_id: &str) -> CommandResponse {
    CommandResponse {
      command_id: command_id.to_string(),
      status: CommandStatus::Started,
      success: true,
      timestamp: crate::entities::arbor_timestamp(),
      ..Default::default()
    }
  }

  pub fn completed(
    command_id: &str,
    data: Option<JsonValue>,
    duration_ms: u64,
  ) -> CommandResponse {
    CommandResponse {
      command_id: command_id.to_string(),
      status: CommandStatus::Completed,
      success: true,
      data,
      duration_ms,
      timestamp: crate::entities::arbor_timestamp(),
      ..Default::default()
    }
  }

  pub fn failed(
    command_id: &str,
    error: String,
    duration_ms: u64,
  ) -> CommandResponse {
    CommandResponse {
      command_id: command_id.to_string(),
      status: CommandStatus::Failed,
      success: false,
      error: Some(error),
      duration_ms,
      timestamp: crate::entities::arbor_timestamp(),
      ..Default::default()
    }
  }

  pub fn rejected(command_id: &str, error: String) -> CommandResponse {
    CommandResponse {
      command_id: command_id.to_string(),
      status: CommandStatus::Rejected,
      success: false,
      error: Some(error),
      timestamp: crate::entities::arbor_timestamp(),
      ..Default::default()
    }
  }
}

#[typeshare]
#[derive(
  Serialize,
  Deserialize,
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
  Display,
  AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum CommandStatus {
  #[default]
  Started,
  Completed,
  Failed,
  Rejected,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_deploy_spec_into_typed_variant() {
    let command: Command = serde_json::from_value(serde_json::json!({
      "id": "cmd-1",
      "type": "deployment",
      "action": "deploy",
      "spec": {
        "app_id": "demo",
        "version": "1.0.0",
        "source": { "type": "image", "reference": "redis:7.0.5" },
      },
    }))
    .unwrap();
    let op = CommandOp::parse(&command).unwrap();
    let CommandOp::DeploymentDeploy(request) = op else {
      panic!("expected deploy op");
    };
    assert_eq!(request.app_id, "demo");
  }

  #[test]
  fn rejects_unknown_action() {
    let command = Command {
      kind: CommandType::System,
      action: "reboot".to_string(),
      ..Default::default()
    };
    assert!(CommandOp::parse(&command).is_err());
  }

  #[test]
  fn rejects_malformed_spec() {
    let command = Command {
      kind: CommandType::Deployment,
      action: "scale".to_string(),
      spec: serde_json::json!({ "replicas": "three" }),
      ..Default::default()
    };
    assert!(CommandOp::parse(&command).is_err());
  }

  #[test]
  fn logs_tail_defaults_to_100() {
    let command = Command {
      kind: CommandType::Container,
      action: "logs".to_string(),
      target: "demo-1.0.0-1".to_string(),
      spec: serde_json::json!({}),
      ..Default::default()
    };
    let CommandOp::ContainerLogs { tail } =
      CommandOp::parse(&command).unwrap()
    else {
      panic!("expected logs op");
    };
    assert_eq!(tail, 100);
  }
}
