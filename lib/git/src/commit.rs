use std::path::Path;

use anyhow::{Context, anyhow};
use arbor_client::entities::Log;
use command::run_agent_command;

/// Read the short hash and message of the latest commit.
pub async fn get_commit_hash_log(
  repo_dir: &Path,
) -> anyhow::Result<(Log, String, String)> {
  let log = run_agent_command(
    "Latest Commit",
    repo_dir,
    "git log -n 1 --pretty=format:'%h %s'",
  )
  .await;
  if !log.success {
    return Err(anyhow!("{}", log.stderr.replace('\n', " | ")));
  }
  let (hash, message) = log
    .stdout
    .trim()
    .split_once(' ')
    .context("unexpected git log output")?;
  Ok((log.clone(), hash.to_string(), message.to_string()))
}
