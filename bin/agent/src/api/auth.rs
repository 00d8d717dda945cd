use arbor_client::error::{AgentError, ErrorKind};
use axum::{
  extract::Request,
  middleware::Next,
  response::Response,
};

use super::ApiError;
use crate::{
  audit::audit,
  backend::{ValidatorError, backend},
  state::current_token,
};

/// Identity established by the auth middleware, available to
/// handlers through request extensions.
#[derive(Debug, Clone)]
pub struct RequestIdentity {
  pub server_id: String,
}

/// Bearer-token middleware for everything outside the public set.
/// Validation goes to the configured external validator; without
/// a backend the agent falls back to comparing against its own
/// token (local-only mode).
pub async fn require_bearer(
  mut request: Request,
  next: Next,
) -> Result<Response, ApiError> {
  let path = request.uri().path().to_string();
  let method = request.method().clone();

  let token = match bearer_token(&request) {
    Some(token) => token,
    None => {
      audit().record(
        "AUTH_MISSING_TOKEN",
        None,
        serde_json::json!({ "path": &path, "method": method.as_str() }),
      );
      return Err(
        AgentError::msg(
          ErrorKind::Unauthorized,
          "missing Authorization bearer token",
        )
        .into(),
      );
    }
  };

  let server_id = match validate(&token).await {
    Ok(server_id) => server_id,
    Err(ValidationFailure::Invalid(reason)) => {
      audit().record(
        "AUTH_INVALID_TOKEN",
        None,
        serde_json::json!({ "path": &path, "reason": reason }),
      );
      return Err(
        AgentError::msg(ErrorKind::Unauthorized, "invalid token")
          .into(),
      );
    }
    Err(ValidationFailure::Backend(e)) => {
      audit().record(
        "AUTH_VALIDATION_ERROR",
        None,
        serde_json::json!({ "path": &path, "error": format!("{e:#}") }),
      );
      return Err(
        AgentError::new(
          ErrorKind::AuthBackendUnavailable,
          e.context("token validation backend unavailable"),
        )
        .into(),
      );
    }
  };

  audit().record(
    "AUTH_SUCCESS",
    Some(server_id.clone()),
    serde_json::json!({ "path": &path, "method": method.as_str() }),
  );
  tracing::debug!(
    "authorized {method} {path} for server {server_id}"
  );
  request
    .extensions_mut()
    .insert(RequestIdentity { server_id });
  Ok(next.run(request).await)
}

enum ValidationFailure {
  Invalid(String),
  Backend(anyhow::Error),
}

async fn validate(
  token: &str,
) -> Result<String, ValidationFailure> {
  match backend() {
    Some(backend) => {
      match backend.validate_token(token).await {
        Ok(validation) if validation.valid => Ok(
          validation.server_id.unwrap_or_else(|| String::from("unknown")),
        ),
        Ok(validation) => Err(ValidationFailure::Invalid(
          validation
            .error
            .unwrap_or_else(|| String::from("token rejected")),
        )),
        Err(ValidatorError::Unavailable(e)) => {
          Err(ValidationFailure::Backend(e))
        }
      }
    }
    None => {
      // Local-only mode: the agent's own credential is the only
      // accepted token.
      let expected = current_token().await;
      if !expected.is_empty() && token == expected {
        Ok(String::from("local"))
      } else {
        Err(ValidationFailure::Invalid(String::from(
          "token rejected (local-only mode)",
        )))
      }
    }
  }
}

fn bearer_token(request: &Request) -> Option<String> {
  request
    .headers()
    .get("Authorization")
    .and_then(|value| value.to_str().ok())
    .and_then(|value| value.strip_prefix("Bearer "))
    .map(str::to_string)
    .filter(|token| !token.is_empty())
}
