use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
  #[error("failed to open config file at {path:?} | {e:?}")]
  FileOpen { e: std::io::Error, path: PathBuf },
  #[error("failed to read config file contents at {path:?} | {e:?}")]
  ReadFileContents { e: std::io::Error, path: PathBuf },
  #[error("unsupported config file type at {path:?}")]
  UnsupportedFileType { path: PathBuf },
  #[error("failed to parse toml at {path:?} | {e:?}")]
  ParseToml {
    e: toml::de::Error,
    path: PathBuf,
  },
  #[error("failed to parse yaml at {path:?} | {e:?}")]
  ParseYaml {
    e: serde_yaml_ng::Error,
    path: PathBuf,
  },
  #[error("failed to parse json at {path:?} | {e:?}")]
  ParseJson {
    e: serde_json::Error,
    path: PathBuf,
  },
  #[error("failed to serialize config to json | {e:?}")]
  SerializeJson { e: serde_json::Error },
  #[error("failed to parse merged config | {e:?}")]
  ParseFinalJson { e: serde_json::Error },
  #[error("config must serialize to a json object")]
  ValueIsNotObject,
  #[error(
    "type mismatch merging object at key '{key}' | incoming: {value:?}"
  )]
  ObjectFieldTypeMismatch {
    key: String,
    value: serde_json::Value,
  },
  #[error(
    "type mismatch merging array at key '{key}' | incoming: {value:?}"
  )]
  ArrayFieldTypeMismatch {
    key: String,
    value: serde_json::Value,
  },
}
