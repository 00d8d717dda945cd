use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow};
use arbor_client::entities::{Log, deployment::GitSource};

mod clone;
mod commit;
mod pull;

pub use clone::clone;
pub use commit::get_commit_hash_log;
pub use pull::{pull, pull_or_clone};

/// Outcome of a repo operation. `logs` carry every stage;
/// hash / message are best-effort.
#[derive(Debug, Default)]
pub struct GitRes {
  pub logs: Vec<Log>,
  pub path: PathBuf,
  pub hash: Option<String>,
  pub message: Option<String>,
}

/// The on-disk directory for a repo under the agent's cache dir:
/// host and path segments of the url, no scheme.
pub fn repo_directory(cache_dir: &Path, source: &GitSource) -> PathBuf {
  let stripped = source
    .url
    .trim_start_matches("https://")
    .trim_start_matches("http://")
    .trim_end_matches('/')
    .trim_end_matches(".git");
  cache_dir.join(stripped)
}

/// Access-token injected remote url. The token never reaches logs;
/// callers must pass the (token, "<TOKEN>") replacer when logging.
pub fn remote_url(source: &GitSource) -> anyhow::Result<String> {
  let Some(token) = &source.token else {
    return Ok(source.url.clone());
  };
  let rest = source
    .url
    .strip_prefix("https://")
    .context("only https urls support token auth")?;
  if token.is_empty() {
    return Err(anyhow!("git token is set but empty"));
  }
  Ok(format!("https://{token}@{rest}"))
}

pub(crate) fn token_replacers(
  source: &GitSource,
) -> Vec<(String, String)> {
  match &source.token {
    Some(token) if !token.is_empty() => {
      vec![(token.clone(), String::from("<TOKEN>"))]
    }
    _ => Vec::new(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn remote_url_injects_token() {
    let source = GitSource {
      url: "https://example.invalid/org/repo".to_string(),
      token: Some("sa_secret".to_string()),
      ..Default::default()
    };
    assert_eq!(
      remote_url(&source).unwrap(),
      "https://sa_secret@example.invalid/org/repo"
    );
  }

  #[test]
  fn remote_url_passthrough_without_token() {
    let source = GitSource {
      url: "https://example.invalid/org/repo".to_string(),
      ..Default::default()
    };
    assert_eq!(remote_url(&source).unwrap(), source.url);
  }

  #[test]
  fn repo_directory_strips_scheme() {
    let source = GitSource {
      url: "https://example.invalid/org/repo.git".to_string(),
      ..Default::default()
    };
    let dir = repo_directory(Path::new("/repos"), &source);
    assert_eq!(dir, PathBuf::from("/repos/example.invalid/org/repo"));
  }
}
