use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;

use crate::{Error, Result, merge::merge_objects};

pub fn collect_config_files(
  // (keyword match index, path); index orders priority.
  files: &mut Vec<(usize, PathBuf)>,
  path: &Path,
  keywords: &[wildcard::Wildcard],
) {
  if path.is_file() {
    files.push((0, path.to_path_buf()));
    return;
  }
  if !path.is_dir() {
    return;
  }
  let Ok(folder) = path.canonicalize() else {
    return;
  };
  let Ok(read_dir) = std::fs::read_dir(&folder) else {
    return;
  };
  for dir_entry in read_dir.flatten() {
    let path = dir_entry.path();
    let Ok(metadata) = dir_entry.metadata() else {
      continue;
    };
    if !metadata.is_file() {
      continue;
    }
    let file_name = dir_entry.file_name();
    let Some(file_name) = file_name.to_str() else {
      continue;
    };
    let index = if keywords.is_empty() {
      0
    } else if let Some(index) = keywords
      .iter()
      .position(|wc| wc.is_match(file_name.as_bytes()))
    {
      index + 1
    } else {
      continue;
    };
    let Ok(path) = path.canonicalize() else {
      continue;
    };
    files.push((index, path));
  }
}

/// Parse and merge multiple config files, in order.
pub fn parse_config_files<T: DeserializeOwned>(
  files: &[PathBuf],
  merge_nested: bool,
  extend_array: bool,
) -> Result<T> {
  let mut target = serde_json::Map::new();

  for file in files {
    let source = match parse_config_file(file) {
      Ok(source) => source,
      Err(e) => {
        eprintln!("WARN: {e}");
        continue;
      }
    };
    target = match merge_objects(
      target.clone(),
      source,
      merge_nested,
      extend_array,
    ) {
      Ok(target) => target,
      Err(e) => {
        eprintln!("WARN: {e}");
        target
      }
    };
  }

  serde_json::from_value(serde_json::Value::Object(target))
    .map_err(|e| Error::ParseFinalJson { e })
}

fn parse_config_file<T: DeserializeOwned>(file: &Path) -> Result<T> {
  let contents =
    std::fs::read_to_string(file).map_err(|e| Error::FileOpen {
      e,
      path: file.to_path_buf(),
    })?;
  let contents = interpolate_env(&contents);
  let config = match file.extension().and_then(|e| e.to_str()) {
    Some("toml") => {
      toml::from_str(&contents).map_err(|e| Error::ParseToml {
        e,
        path: file.to_path_buf(),
      })?
    }
    Some("yaml") | Some("yml") => serde_yaml_ng::from_str(&contents)
      .map_err(|e| Error::ParseYaml {
        e,
        path: file.to_path_buf(),
      })?,
    Some("json") => serde_json::from_str(&contents).map_err(|e| {
      Error::ParseJson {
        e,
        path: file.to_path_buf(),
      }
    })?,
    Some(_) | None => {
      return Err(Error::UnsupportedFileType {
        path: file.to_path_buf(),
      });
    }
  };
  Ok(config)
}

/// Only supports '${VAR}' syntax. Runs twice so an env var may
/// itself expand to another '${VAR}'.
fn interpolate_env(input: &str) -> String {
  let re = regex::Regex::new(r"\$\{([A-Za-z0-9_]+)\}").unwrap();
  let expand = |caps: &regex::Captures| {
    std::env::var(&caps[1]).unwrap_or_default()
  };
  let first_pass = re.replace_all(input, expand).into_owned();
  re.replace_all(&first_pass, expand).into_owned()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn interpolates_env_vars() {
    // SAFETY: test-local env mutation.
    unsafe { std::env::set_var("ARBOR_TEST_INTERP", "value-1") };
    let out = interpolate_env("key = \"${ARBOR_TEST_INTERP}\"");
    assert_eq!(out, "key = \"value-1\"");
    let missing = interpolate_env("key = \"${ARBOR_TEST_MISSING}\"");
    assert_eq!(missing, "key = \"\"");
  }
}
