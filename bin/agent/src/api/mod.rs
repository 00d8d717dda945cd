use arbor_client::{
  entities::arbor_timestamp,
  error::{AgentError, ApiErrorBody},
};
use axum::{
  Json, Router,
  http::StatusCode,
  middleware,
  response::{IntoResponse, Response},
  routing::get,
};
use tower_http::cors::{Any, CorsLayer};

use crate::{
  config::agent_config,
  state::state,
};

mod auth;
mod deployments;

/// Everything under `/api/v1`. The public set (status / version /
/// health / metrics) skips auth; the rest requires a valid bearer
/// token.
pub fn router() -> Router {
  let public = Router::new()
    .route("/status", get(status))
    .route("/version", get(version))
    .route("/health", get(health))
    .route("/metrics", get(metrics));

  let protected = deployments::router()
    .layer(middleware::from_fn(auth::require_bearer));

  Router::new().nest(
    "/api/v1",
    public.merge(protected).layer(
      CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any),
    ),
  )
}

/// Api error body: `{ error, status, timestamp }` with the
/// taxonomy kind leading the message.
pub struct ApiError(pub AgentError);

impl From<AgentError> for ApiError {
  fn from(error: AgentError) -> ApiError {
    ApiError(error)
  }
}

impl IntoResponse for ApiError {
  fn into_response(self) -> Response {
    let status = self.0.kind.status_code();
    let body = ApiErrorBody {
      error: format!("{}", self.0),
      status,
      timestamp: chrono::Utc::now().to_rfc3339(),
    };
    (
      StatusCode::from_u16(status)
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
      Json(body),
    )
      .into_response()
  }
}

async fn status() -> Json<serde_json::Value> {
  let config = agent_config();
  let stats = crate::stats::system_stats().load();
  Json(serde_json::json!({
    "agent_id": config.agent.id,
    "server_id": config.agent.server_id,
    "location": config.agent.location,
    "status": "online",
    "uptime_ms": arbor_timestamp() - state().started_at,
    "resources": stats.snapshot(),
    "deployments": state().engine.list().len(),
  }))
}

async fn version() -> Json<serde_json::Value> {
  Json(serde_json::json!({
    "version": env!("CARGO_PKG_VERSION"),
  }))
}

async fn health() -> Json<serde_json::Value> {
  Json(serde_json::json!({ "healthy": true }))
}

/// Operational counters. Json rather than a scrape format; the
/// Prometheus endpoint is an external concern.
async fn metrics() -> Json<serde_json::Value> {
  use arbor_client::entities::deployment::DeploymentState;
  let deployments = state().engine.list();
  let count = |status: DeploymentState| {
    deployments
      .iter()
      .filter(|deployment| deployment.status == status)
      .count()
  };
  let system = crate::stats::system_stats().load_full();
  Json(serde_json::json!({
    "deployments_total": deployments.len(),
    "deployments_running": count(DeploymentState::Running),
    "deployments_failed": count(DeploymentState::Failed),
    "deployments_stopped": count(DeploymentState::Stopped),
    "reservations": state().governor.reservation_count(),
    "audit_events_dropped": crate::audit::audit().dropped_events(),
    "system": &*system,
  }))
}
