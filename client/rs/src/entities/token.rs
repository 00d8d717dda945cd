use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use typeshare::typeshare;

/// Chars of the token operators see in listings, including the
/// scheme prefix.
pub const TOKEN_PUBLIC_PREFIX_LEN: usize = 12;

/// Tokens issued by this agent / plane always begin with this
/// ASCII scheme prefix.
pub const TOKEN_SCHEME_PREFIX: &str = "sa_";

/// Bearer credential material. The opaque secret is only held
/// in memory and the encrypted store; the plane stores and
/// compares `hash` (SHA-256 hex of the full token).
#[typeshare]
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Token {
  pub token: String,
  /// First [TOKEN_PUBLIC_PREFIX_LEN] chars, safe to log.
  pub prefix: String,
  pub hash: String,
  #[typeshare(serialized_as = "number")]
  pub created_at: i64,
  /// Zero means no expiry.
  #[typeshare(serialized_as = "number")]
  pub expires_at: i64,
}

impl Token {
  pub fn generate(ttl_ms: i64) -> Token {
    let mut secret = [0u8; 24];
    rand::rng().fill(&mut secret);
    let token =
      format!("{TOKEN_SCHEME_PREFIX}{}", hex::encode(secret));
    Token::from_plaintext(token, ttl_ms)
  }

  pub fn from_plaintext(token: String, ttl_ms: i64) -> Token {
    let created_at = crate::entities::arbor_timestamp();
    let expires_at = if ttl_ms > 0 { created_at + ttl_ms } else { 0 };
    Token {
      prefix: token
        .chars()
        .take(TOKEN_PUBLIC_PREFIX_LEN)
        .collect(),
      hash: hash_token(&token),
      token,
      created_at,
      expires_at,
    }
  }

  pub fn is_expired(&self, now_ms: i64) -> bool {
    self.expires_at != 0 && now_ms >= self.expires_at
  }
}

/// Response of the plane's `POST /api/auth/validate`.
#[typeshare]
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct TokenValidation {
  pub valid: bool,
  #[serde(default)]
  pub server_id: Option<String>,
  #[serde(default)]
  #[typeshare(serialized_as = "number")]
  pub expires_at: Option<i64>,
  #[serde(default)]
  pub error: Option<String>,
}

/// The stored / remotely compared form.
pub fn hash_token(token: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(token.as_bytes());
  hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn generated_token_carries_scheme_and_prefix() {
    let token = Token::generate(0);
    assert!(token.token.starts_with(TOKEN_SCHEME_PREFIX));
    assert_eq!(token.prefix.len(), TOKEN_PUBLIC_PREFIX_LEN);
    assert!(token.token.starts_with(&token.prefix));
    assert_eq!(token.expires_at, 0);
  }

  #[test]
  fn hash_is_stable_and_hex() {
    let a = hash_token("sa_test");
    let b = hash_token("sa_test");
    assert_eq!(a, b);
    assert_eq!(a.len(), 64);
    assert_ne!(a, hash_token("sa_other"));
  }

  #[test]
  fn expiry_respects_ttl() {
    let token = Token::generate(1);
    assert!(token.is_expired(token.created_at + 5));
    let forever = Token::generate(0);
    assert!(!forever.is_expired(i64::MAX));
  }
}
