use std::{
  collections::BTreeMap,
  path::{Path, PathBuf},
};

use aes_gcm::{
  Aes256Gcm, Key, KeyInit, Nonce,
  aead::Aead,
};
use anyhow::{Context, anyhow};
use arbor_client::{
  entities::{
    arbor_timestamp, config::AgentConfig, deployment::Deployment,
    token::Token,
  },
  error::{AgentError, ErrorKind, WithKind},
};
use pbkdf2::pbkdf2_hmac;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

pub const STORE_VERSION: u32 = 1;
const PBKDF2_ITERATIONS: u32 = 10_000;

const DEPLOYMENTS_KEY: &str = "deployments";
const TOKEN_KEY: &str = "token";
const CONFIG_KEY: &str = "config";

type StateData = BTreeMap<String, serde_json::Value>;

/// The decrypted record. `checksum` is the SHA-256 hex of the
/// canonical json encoding of `data`, checked on every read.
#[derive(Serialize, Deserialize, Debug)]
struct PersistedState {
  version: u32,
  timestamp: i64,
  data: StateData,
  checksum: String,
}

/// What actually hits the disk.
#[derive(Serialize, Deserialize, Debug)]
struct Envelope {
  version: u32,
  salt: String,
  nonce: String,
  ciphertext: String,
}

/// Crash-safe, authenticated persistence for deployment snapshots,
/// the agent token, and agent configuration. One encrypted envelope
/// file; every mutation is a whole-envelope read-modify-write under
/// an exclusive lock.
#[derive(Debug)]
pub struct StateStore {
  path: PathBuf,
  passphrase: String,
  lock: RwLock<()>,
}

impl StateStore {
  pub async fn init(
    path: PathBuf,
    passphrase: String,
  ) -> anyhow::Result<StateStore> {
    if passphrase.is_empty() {
      return Err(anyhow!(
        "storage.encryption_key must be configured"
      ));
    }
    if let Some(parent) = path.parent() {
      tokio::fs::create_dir_all(parent)
        .await
        .with_context(|| {
          format!("failed to create store directory {parent:?}")
        })?;
      set_permissions(parent, 0o700).await?;
    }
    let store = StateStore {
      path,
      passphrase,
      lock: RwLock::new(()),
    };
    // Surface key mismatch / tampering at startup rather than on
    // the first mutation. An unreadable envelope falls back to
    // the last backup when one validates.
    if let Err(e) = store.read_data().await {
      let backup = store.backup_path();
      if !backup.exists() {
        return Err(e.error);
      }
      tracing::error!(
        "state envelope unreadable ({e}), restoring from {backup:?}"
      );
      store.restore(&backup).await.map_err(|restore_err| {
        e.error.context(format!(
          "backup restore also failed: {restore_err}"
        ))
      })?;
    }
    Ok(store)
  }

  pub fn backup_path(&self) -> PathBuf {
    let mut path = self.path.clone().into_os_string();
    path.push(".bak");
    PathBuf::from(path)
  }

  // ── tokens ────────────────────────────────────────────────

  pub async fn store_token(
    &self,
    token: &Token,
  ) -> Result<(), AgentError> {
    let value = serde_json::to_value(token)
      .context("failed to serialize token")?;
    self
      .mutate(|data| {
        data.insert(TOKEN_KEY.to_string(), value);
        Ok(())
      })
      .await
  }

  pub async fn load_token(
    &self,
  ) -> Result<Option<Token>, AgentError> {
    let data = self.read_data().await?;
    let Some(value) = data.get(TOKEN_KEY) else {
      return Ok(None);
    };
    let token = serde_json::from_value(value.clone())
      .context("stored token does not parse")?;
    Ok(Some(token))
  }

  pub async fn delete_token(&self) -> Result<(), AgentError> {
    self
      .mutate(|data| {
        data.remove(TOKEN_KEY);
        Ok(())
      })
      .await
  }

  // ── deployments ───────────────────────────────────────────

  pub async fn store_deployment(
    &self,
    deployment: &Deployment,
  ) -> Result<(), AgentError> {
    let id = deployment.id.clone();
    let value = serde_json::to_value(deployment)
      .context("failed to serialize deployment")?;
    self
      .mutate(move |data| {
        let deployments = data
          .entry(DEPLOYMENTS_KEY.to_string())
          .or_insert_with(|| serde_json::json!({}));
        deployments
          .as_object_mut()
          .context("deployments key is not an object")?
          .insert(id, value);
        Ok(())
      })
      .await
  }

  pub async fn load_deployment(
    &self,
    id: &str,
  ) -> Result<Option<Deployment>, AgentError> {
    let data = self.read_data().await?;
    let Some(value) = data
      .get(DEPLOYMENTS_KEY)
      .and_then(|deployments| deployments.get(id))
    else {
      return Ok(None);
    };
    let deployment = serde_json::from_value(value.clone())
      .context("stored deployment does not parse")?;
    Ok(Some(deployment))
  }

  pub async fn delete_deployment(
    &self,
    id: &str,
  ) -> Result<(), AgentError> {
    let id = id.to_string();
    self
      .mutate(move |data| {
        if let Some(deployments) = data
          .get_mut(DEPLOYMENTS_KEY)
          .and_then(|d| d.as_object_mut())
        {
          deployments.remove(&id);
        }
        Ok(())
      })
      .await
  }

  pub async fn list_deployments(
    &self,
  ) -> Result<Vec<Deployment>, AgentError> {
    let data = self.read_data().await?;
    let Some(deployments) =
      data.get(DEPLOYMENTS_KEY).and_then(|d| d.as_object())
    else {
      return Ok(Vec::new());
    };
    let mut out = Vec::with_capacity(deployments.len());
    for (id, value) in deployments {
      let deployment: Deployment =
        serde_json::from_value(value.clone()).with_context(|| {
          format!("stored deployment {id} does not parse")
        })?;
      out.push(deployment);
    }
    Ok(out)
  }

  // ── config ────────────────────────────────────────────────

  pub async fn store_config(
    &self,
    config: &AgentConfig,
  ) -> Result<(), AgentError> {
    let value = serde_json::to_value(config)
      .context("failed to serialize config")?;
    self
      .mutate(|data| {
        data.insert(CONFIG_KEY.to_string(), value);
        Ok(())
      })
      .await
  }

  pub async fn load_config(
    &self,
  ) -> Result<Option<AgentConfig>, AgentError> {
    let data = self.read_data().await?;
    let Some(value) = data.get(CONFIG_KEY) else {
      return Ok(None);
    };
    let config = serde_json::from_value(value.clone())
      .context("stored config does not parse")?;
    Ok(Some(config))
  }

  // ── backup / restore ──────────────────────────────────────

  /// Copy the current envelope as-is.
  pub async fn backup(
    &self,
    target: &Path,
  ) -> Result<(), AgentError> {
    let _guard = self.lock.read().await;
    if !self.path.exists() {
      return Err(AgentError::msg(
        ErrorKind::NotFound,
        "no state envelope exists yet",
      ));
    }
    tokio::fs::copy(&self.path, target)
      .await
      .with_context(|| {
        format!("failed to copy envelope to {target:?}")
      })?;
    set_permissions(target, 0o600).await?;
    Ok(())
  }

  /// Validate the backup by decrypting it, then atomically
  /// replace the live envelope.
  pub async fn restore(
    &self,
    source: &Path,
  ) -> Result<(), AgentError> {
    let _guard = self.lock.write().await;
    let bytes = tokio::fs::read(source).await.with_context(|| {
      format!("failed to read backup at {source:?}")
    })?;
    // Decrypt-validate before touching the live file.
    decode_envelope(&bytes, &self.passphrase)?;
    atomic_write(&self.path, &bytes).await?;
    Ok(())
  }

  // ── envelope plumbing ─────────────────────────────────────

  async fn read_data(&self) -> Result<StateData, AgentError> {
    let _guard = self.lock.read().await;
    self.read_data_unlocked().await
  }

  async fn read_data_unlocked(
    &self,
  ) -> Result<StateData, AgentError> {
    match tokio::fs::read(&self.path).await {
      Ok(bytes) => decode_envelope(&bytes, &self.passphrase),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
        Ok(StateData::new())
      }
      Err(e) => Err(
        AgentError::new(
          ErrorKind::Internal,
          anyhow!(e).context(format!(
            "failed to read state envelope at {:?}",
            self.path
          )),
        ),
      ),
    }
  }

  async fn mutate<F>(&self, f: F) -> Result<(), AgentError>
  where
    F: FnOnce(&mut StateData) -> anyhow::Result<()>,
  {
    let _guard = self.lock.write().await;
    let mut data = self.read_data_unlocked().await?;
    f(&mut data)?;
    let bytes = encode_envelope(&data, &self.passphrase)?;
    atomic_write(&self.path, &bytes).await?;
    Ok(())
  }
}

fn checksum(data: &StateData) -> Result<String, AgentError> {
  let canonical = serde_json::to_vec(data)
    .context("failed to encode state data")?;
  let mut hasher = Sha256::new();
  hasher.update(&canonical);
  Ok(hex::encode(hasher.finalize()))
}

fn derive_key(passphrase: &str, salt: &[u8]) -> [u8; 32] {
  let mut key = [0u8; 32];
  pbkdf2_hmac::<Sha256>(
    passphrase.as_bytes(),
    salt,
    PBKDF2_ITERATIONS,
    &mut key,
  );
  key
}

fn encode_envelope(
  data: &StateData,
  passphrase: &str,
) -> Result<Vec<u8>, AgentError> {
  let state = PersistedState {
    version: STORE_VERSION,
    timestamp: arbor_timestamp(),
    checksum: checksum(data)?,
    data: data.clone(),
  };
  let plaintext = serde_json::to_vec(&state)
    .context("failed to encode state record")?;

  let mut salt = [0u8; 16];
  rand::rng().fill(&mut salt);
  let mut nonce_bytes = [0u8; 12];
  rand::rng().fill(&mut nonce_bytes);

  let key = derive_key(passphrase, &salt);
  let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
  let ciphertext = cipher
    .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_slice())
    .map_err(|_| {
      AgentError::msg(
        ErrorKind::Internal,
        "failed to encrypt state envelope",
      )
    })?;

  let envelope = Envelope {
    version: STORE_VERSION,
    salt: hex::encode(salt),
    nonce: hex::encode(nonce_bytes),
    ciphertext: hex::encode(ciphertext),
  };
  serde_json::to_vec_pretty(&envelope)
    .context("failed to encode envelope")
    .kind(ErrorKind::Internal)
}

fn decode_envelope(
  bytes: &[u8],
  passphrase: &str,
) -> Result<StateData, AgentError> {
  let envelope: Envelope = serde_json::from_slice(bytes)
    .context("state envelope is not parseable")
    .kind(ErrorKind::DecryptionFailed)?;
  let salt = hex::decode(&envelope.salt)
    .context("envelope salt is not hex")
    .kind(ErrorKind::DecryptionFailed)?;
  let nonce = hex::decode(&envelope.nonce)
    .context("envelope nonce is not hex")
    .kind(ErrorKind::DecryptionFailed)?;
  let ciphertext = hex::decode(&envelope.ciphertext)
    .context("envelope ciphertext is not hex")
    .kind(ErrorKind::DecryptionFailed)?;

  let key = derive_key(passphrase, &salt);
  let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
  let plaintext = cipher
    .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
    .map_err(|_| {
      // Wrong key or corrupted ciphertext. Distinguished from
      // a checksum mismatch so operators can tell key problems
      // from tampering.
      AgentError::msg(
        ErrorKind::DecryptionFailed,
        "failed to decrypt state envelope",
      )
    })?;

  let state: PersistedState = serde_json::from_slice(&plaintext)
    .context("decrypted state record is not parseable")
    .kind(ErrorKind::DecryptionFailed)?;
  let expected = checksum(&state.data)?;
  if state.checksum != expected {
    return Err(AgentError::msg(
      ErrorKind::IntegrityViolation,
      "state record failed integrity check",
    ));
  }
  Ok(state.data)
}

/// Write to a temp file in the same directory, then rename over
/// the target. Either the new envelope is fully present or the
/// old one still is.
async fn atomic_write(
  path: &Path,
  bytes: &[u8],
) -> Result<(), AgentError> {
  let tmp = path.with_extension(format!(
    "tmp-{}",
    uuid::Uuid::new_v4().simple()
  ));
  tokio::fs::write(&tmp, bytes).await.with_context(|| {
    format!("failed to write temp envelope at {tmp:?}")
  })?;
  set_permissions(&tmp, 0o600).await?;
  if let Err(e) = tokio::fs::rename(&tmp, path).await {
    let _ = tokio::fs::remove_file(&tmp).await;
    return Err(
      anyhow!(e)
        .context(format!("failed to rename envelope into {path:?}"))
        .into(),
    );
  }
  Ok(())
}

#[cfg(unix)]
async fn set_permissions(
  path: &Path,
  mode: u32,
) -> anyhow::Result<()> {
  use std::os::unix::fs::PermissionsExt;
  tokio::fs::set_permissions(
    path,
    std::fs::Permissions::from_mode(mode),
  )
  .await
  .with_context(|| format!("failed to set mode on {path:?}"))
}

#[cfg(not(unix))]
async fn set_permissions(
  _path: &Path,
  _mode: u32,
) -> anyhow::Result<()> {
  Ok(())
}

#[cfg(test)]
mod tests {
  use arbor_client::entities::deployment::DeploymentState;

  use super::*;

  fn test_store_path() -> PathBuf {
    std::env::temp_dir()
      .join(format!("arbor-store-{}", uuid::Uuid::new_v4()))
      .join("store.enc")
  }

  async fn test_store() -> StateStore {
    StateStore::init(test_store_path(), "passphrase-1".to_string())
      .await
      .unwrap()
  }

  #[tokio::test]
  async fn deployment_round_trip() {
    let store = test_store().await;
    let deployment = Deployment {
      id: "demo-1.0.0-17".to_string(),
      app_id: "demo".to_string(),
      version: "1.0.0".to_string(),
      status: DeploymentState::Running,
      ..Default::default()
    };
    store.store_deployment(&deployment).await.unwrap();
    let loaded = store
      .load_deployment("demo-1.0.0-17")
      .await
      .unwrap()
      .unwrap();
    assert_eq!(loaded.app_id, "demo");
    assert_eq!(loaded.status, DeploymentState::Running);
    assert_eq!(store.list_deployments().await.unwrap().len(), 1);

    store.delete_deployment("demo-1.0.0-17").await.unwrap();
    assert!(
      store
        .load_deployment("demo-1.0.0-17")
        .await
        .unwrap()
        .is_none()
    );
  }

  #[tokio::test]
  async fn token_round_trip_and_delete() {
    let store = test_store().await;
    assert!(store.load_token().await.unwrap().is_none());
    let token = Token::generate(0);
    store.store_token(&token).await.unwrap();
    let loaded = store.load_token().await.unwrap().unwrap();
    assert_eq!(loaded.hash, token.hash);
    store.delete_token().await.unwrap();
    assert!(store.load_token().await.unwrap().is_none());
  }

  #[tokio::test]
  async fn wrong_passphrase_is_decryption_failure() {
    let path = test_store_path();
    let store =
      StateStore::init(path.clone(), "passphrase-1".to_string())
        .await
        .unwrap();
    store.store_token(&Token::generate(0)).await.unwrap();

    let err =
      StateStore::init(path, "other-passphrase".to_string())
        .await
        .unwrap_err();
    assert!(format!("{err:#}").contains("decrypt"));
  }

  #[tokio::test]
  async fn tampered_ciphertext_is_rejected() {
    let store = test_store().await;
    store.store_token(&Token::generate(0)).await.unwrap();

    // Flip a ciphertext nibble on disk.
    let raw = tokio::fs::read(&store.path).await.unwrap();
    let mut envelope: Envelope =
      serde_json::from_slice(&raw).unwrap();
    let mut chars: Vec<char> =
      envelope.ciphertext.chars().collect();
    let mid = chars.len() / 2;
    chars[mid] = if chars[mid] == '0' { '1' } else { '0' };
    envelope.ciphertext = chars.into_iter().collect();
    tokio::fs::write(
      &store.path,
      serde_json::to_vec(&envelope).unwrap(),
    )
    .await
    .unwrap();

    let err = store.load_token().await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::DecryptionFailed);
  }

  #[tokio::test]
  async fn backup_and_restore_round_trip() {
    let store = test_store().await;
    let token = Token::generate(0);
    store.store_token(&token).await.unwrap();

    let backup_path = std::env::temp_dir()
      .join(format!("arbor-backup-{}", uuid::Uuid::new_v4()));
    store.backup(&backup_path).await.unwrap();

    store.delete_token().await.unwrap();
    assert!(store.load_token().await.unwrap().is_none());

    store.restore(&backup_path).await.unwrap();
    let restored = store.load_token().await.unwrap().unwrap();
    assert_eq!(restored.hash, token.hash);
  }

  #[tokio::test]
  async fn restore_rejects_garbage() {
    let store = test_store().await;
    let bad = std::env::temp_dir()
      .join(format!("arbor-bad-backup-{}", uuid::Uuid::new_v4()));
    tokio::fs::write(&bad, b"not an envelope").await.unwrap();
    assert!(store.restore(&bad).await.is_err());
  }
}
