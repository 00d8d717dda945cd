use std::path::Path;

use arbor_client::entities::{
  all_logs_success, deployment::GitSource,
};
use command::{
  run_agent_command, run_agent_command_with_sanitization,
};
use formatting::format_serror;

use crate::{GitRes, get_commit_hash_log, remote_url, token_replacers};

/// Delete any existing directory at `destination`, clone the repo,
/// optionally hard-reset to a pinned commit, and read the latest
/// commit hash / message.
#[tracing::instrument(level = "debug", skip(source))]
pub async fn clone(
  source: &GitSource,
  destination: &Path,
) -> anyhow::Result<GitRes> {
  let repo_url = remote_url(source)?;
  let replacers = token_replacers(source);

  let _ = tokio::fs::remove_dir_all(destination).await;
  if let Some(parent) = destination.parent() {
    let _ = tokio::fs::create_dir_all(parent).await;
  }

  let mut res = GitRes {
    path: destination.to_path_buf(),
    ..Default::default()
  };

  let clone_log = run_agent_command_with_sanitization(
    "Clone Repo",
    None,
    format!(
      "git clone {repo_url} {} -b {}",
      destination.display(),
      source.branch,
    ),
    &replacers,
  )
  .await;
  res.logs.push(clone_log);

  if !all_logs_success(&res.logs) {
    tracing::warn!(
      "failed to clone repo into {destination:?} | url {}",
      source.url,
    );
    return Ok(res);
  }

  if let Some(commit) = &source.commit {
    let reset_log = run_agent_command(
      "Set Commit",
      destination,
      format!("git reset --hard {commit}"),
    )
    .await;
    res.logs.push(reset_log);
    if !all_logs_success(&res.logs) {
      return Ok(res);
    }
  }

  match get_commit_hash_log(destination).await {
    Ok((log, hash, message)) => {
      res.logs.push(log);
      res.hash = Some(hash);
      res.message = Some(message);
    }
    Err(e) => {
      res.logs.push(arbor_client::entities::Log::simple(
        "Latest Commit",
        format_serror(
          &e.context("failed to get latest commit").into(),
        ),
      ));
    }
  }

  Ok(res)
}
