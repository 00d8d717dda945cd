use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display};
use typeshare::typeshare;

/// Error taxonomy surfaced through the API and command responses.
#[typeshare]
#[derive(
  Serialize,
  Deserialize,
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Display,
  AsRefStr,
)]
pub enum ErrorKind {
  InvalidRequest,
  NotFound,
  Conflict,
  QuotaExceeded,
  InvalidLimits,
  BuildFailed,
  PullFailed,
  CreateFailed,
  StartFailed,
  ReadinessTimeout,
  HealthCheckFailed,
  RuntimeUnavailable,
  Unauthorized,
  AuthBackendUnavailable,
  CapacityExceeded,
  IntegrityViolation,
  DecryptionFailed,
  Cancelled,
  DeadlineExceeded,
  Internal,
}

impl ErrorKind {
  pub fn status_code(&self) -> u16 {
    match self {
      ErrorKind::InvalidRequest | ErrorKind::InvalidLimits => 400,
      ErrorKind::Unauthorized => 401,
      ErrorKind::NotFound => 404,
      ErrorKind::Conflict => 409,
      ErrorKind::QuotaExceeded => 422,
      ErrorKind::CapacityExceeded => 429,
      ErrorKind::RuntimeUnavailable
      | ErrorKind::AuthBackendUnavailable => 503,
      ErrorKind::DeadlineExceeded => 504,
      _ => 500,
    }
  }
}

/// Typed error carried through agent internals: a taxonomy kind
/// plus the full anyhow context chain.
#[derive(Debug)]
pub struct AgentError {
  pub kind: ErrorKind,
  pub error: anyhow::Error,
}

impl AgentError {
  pub fn new(
    kind: ErrorKind,
    error: impl Into<anyhow::Error>,
  ) -> AgentError {
    AgentError {
      kind,
      error: error.into(),
    }
  }

  pub fn msg(kind: ErrorKind, msg: impl std::fmt::Display) -> AgentError {
    AgentError {
      kind,
      error: anyhow::anyhow!("{msg}"),
    }
  }
}

impl std::fmt::Display for AgentError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}: {:#}", self.kind, self.error)
  }
}

impl std::error::Error for AgentError {}

impl From<anyhow::Error> for AgentError {
  fn from(error: anyhow::Error) -> AgentError {
    AgentError {
      kind: ErrorKind::Internal,
      error,
    }
  }
}

/// Attach a taxonomy kind to an anyhow result.
pub trait WithKind<T> {
  fn kind(self, kind: ErrorKind) -> Result<T, AgentError>;
}

impl<T, E: Into<anyhow::Error>> WithKind<T> for Result<T, E> {
  fn kind(self, kind: ErrorKind) -> Result<T, AgentError> {
    self.map_err(|e| AgentError::new(kind, e.into()))
  }
}

/// The API error body: `{ error, status, timestamp }`.
#[typeshare]
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ApiErrorBody {
  pub error: String,
  pub status: u16,
  pub timestamp: String,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn kinds_map_to_expected_statuses() {
    assert_eq!(ErrorKind::InvalidRequest.status_code(), 400);
    assert_eq!(ErrorKind::Unauthorized.status_code(), 401);
    assert_eq!(ErrorKind::NotFound.status_code(), 404);
    assert_eq!(ErrorKind::Conflict.status_code(), 409);
    assert_eq!(ErrorKind::CapacityExceeded.status_code(), 429);
    assert_eq!(ErrorKind::AuthBackendUnavailable.status_code(), 503);
    assert_eq!(ErrorKind::BuildFailed.status_code(), 500);
  }

  #[test]
  fn with_kind_preserves_context() {
    let res: anyhow::Result<()> =
      Err(anyhow::anyhow!("no such deployment"));
    let err = res.kind(ErrorKind::NotFound).unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotFound);
    assert!(format!("{err}").contains("no such deployment"));
  }
}
