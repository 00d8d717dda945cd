use std::path::Path;

use arbor_client::entities::{Log, arbor_timestamp};
use run_command::{CommandOutput, async_run_command};

/// Run a shell command, optionally from `path`, and collect the
/// output into a structured [Log] for the given stage.
pub async fn run_agent_command(
  stage: &str,
  path: impl Into<Option<&Path>>,
  command: impl AsRef<str>,
) -> Log {
  let command = if let Some(path) = path.into() {
    format!("cd {} && {}", path.display(), command.as_ref())
  } else {
    command.as_ref().to_string()
  };
  let start_ts = arbor_timestamp();
  let output = async_run_command(&command).await;
  output_into_log(stage, command, start_ts, output)
}

/// Same as [run_agent_command], with secret values scrubbed from
/// the recorded command and output. `replacers` maps secret ->
/// placeholder.
pub async fn run_agent_command_with_sanitization(
  stage: &str,
  path: impl Into<Option<&Path>>,
  command: impl AsRef<str>,
  replacers: &[(String, String)],
) -> Log {
  let mut log = run_agent_command(stage, path, command).await;
  log.command = sanitize(&log.command, replacers);
  log.stdout = sanitize(&log.stdout, replacers);
  log.stderr = sanitize(&log.stderr, replacers);
  log
}

fn sanitize(input: &str, replacers: &[(String, String)]) -> String {
  let mut out = input.to_string();
  for (secret, placeholder) in replacers {
    if !secret.is_empty() {
      out = out.replace(secret, placeholder);
    }
  }
  out
}

pub fn output_into_log(
  stage: &str,
  command: String,
  start_ts: i64,
  output: CommandOutput,
) -> Log {
  let success = output.success();
  Log {
    stage: stage.to_string(),
    stdout: output.stdout,
    stderr: output.stderr,
    command,
    success,
    start_ts,
    end_ts: arbor_timestamp(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn captures_stdout_and_success() {
    let log = run_agent_command("Echo", None, "echo hello").await;
    assert!(log.success);
    assert_eq!(log.stdout.trim(), "hello");
    assert_eq!(log.stage, "Echo");
  }

  #[tokio::test]
  async fn records_failure() {
    let log = run_agent_command("Fail", None, "false").await;
    assert!(!log.success);
  }

  #[tokio::test]
  async fn sanitization_scrubs_secrets() {
    let replacers =
      vec![("hunter2".to_string(), "<TOKEN>".to_string())];
    let log = run_agent_command_with_sanitization(
      "Echo",
      None,
      "echo hunter2",
      &replacers,
    )
    .await;
    assert!(!log.stdout.contains("hunter2"));
    assert!(log.stdout.contains("<TOKEN>"));
    assert!(log.command.contains("<TOKEN>"));
  }
}
