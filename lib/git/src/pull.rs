use std::path::Path;

use arbor_client::entities::{
  all_logs_success, deployment::GitSource,
};
use command::run_agent_command_with_sanitization;
use formatting::format_serror;

use crate::{GitRes, get_commit_hash_log, token_replacers};

/// Fetch and reset the existing checkout to the requested
/// branch head (or pinned commit).
#[tracing::instrument(level = "debug", skip(source))]
pub async fn pull(
  source: &GitSource,
  repo_dir: &Path,
) -> anyhow::Result<GitRes> {
  let replacers = token_replacers(source);
  let mut res = GitRes {
    path: repo_dir.to_path_buf(),
    ..Default::default()
  };

  let reset_target = match &source.commit {
    Some(commit) => commit.clone(),
    None => format!("origin/{}", source.branch),
  };
  let log = run_agent_command_with_sanitization(
    "Pull Repo",
    repo_dir,
    format!("git fetch origin && git reset --hard {reset_target}"),
    &replacers,
  )
  .await;
  res.logs.push(log);

  if !all_logs_success(&res.logs) {
    return Ok(res);
  }

  match get_commit_hash_log(repo_dir).await {
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

/// Pull when the checkout already exists, clone otherwise.
pub async fn pull_or_clone(
  source: &GitSource,
  repo_dir: &Path,
) -> anyhow::Result<GitRes> {
  if repo_dir.join(".git").exists() {
    pull(source, repo_dir).await
  } else {
    crate::clone(source, repo_dir).await
  }
}
