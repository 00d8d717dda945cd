use arbor_client::entities::{
  Log,
  deployment::{DeployRequest, Deployment},
};
use axum::{
  Json, Router,
  extract::{Path, Query},
  routing::{get, post},
};
use serde::Deserialize;

use super::ApiError;
use crate::state::state;

pub fn router() -> Router {
  Router::new()
    .route("/deployments", post(create).get(list))
    .route("/deployments/{id}", get(get_one).delete(remove))
    .route("/deployments/{id}/logs", get(logs))
    .route("/deployments/{id}/start", post(start))
    .route("/deployments/{id}/stop", post(stop))
    .route("/deployments/{id}/restart", post(restart))
    .route("/deployments/{id}/rollback", post(rollback))
}

/// Returns immediately with the deployment in `Pending`;
/// orchestration continues under the agent context.
async fn create(
  Json(request): Json<DeployRequest>,
) -> Result<Json<Deployment>, ApiError> {
  let deployment = state().engine.deploy(request).await?;
  Ok(Json(deployment))
}

async fn list() -> Json<Vec<Deployment>> {
  Json(state().engine.list())
}

async fn get_one(
  Path(id): Path<String>,
) -> Result<Json<Deployment>, ApiError> {
  let deployment = state().engine.require(&id)?.sanitized();
  Ok(Json(deployment))
}

async fn remove(
  Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
  state().engine.remove(&id).await?;
  Ok(Json(serde_json::json!({ "removed": id })))
}

#[derive(Deserialize)]
struct LogsQuery {
  tail: Option<usize>,
}

async fn logs(
  Path(id): Path<String>,
  Query(query): Query<LogsQuery>,
) -> Result<Json<Vec<Log>>, ApiError> {
  let logs =
    state().engine.logs(&id, query.tail.unwrap_or(100))?;
  Ok(Json(logs))
}

async fn start(
  Path(id): Path<String>,
) -> Result<Json<Deployment>, ApiError> {
  let deployment = state().engine.start(&id).await?;
  Ok(Json(deployment))
}

async fn stop(
  Path(id): Path<String>,
) -> Result<Json<Deployment>, ApiError> {
  let deployment = state().engine.stop(&id).await?;
  Ok(Json(deployment))
}

async fn restart(
  Path(id): Path<String>,
) -> Result<Json<Deployment>, ApiError> {
  let deployment = state().engine.restart(&id).await?;
  Ok(Json(deployment))
}

#[derive(Deserialize, Default)]
struct RollbackBody {
  #[serde(default)]
  reason: String,
}

async fn rollback(
  Path(id): Path<String>,
  body: Option<Json<RollbackBody>>,
) -> Result<Json<Deployment>, ApiError> {
  let reason = body.map(|Json(body)| body.reason).unwrap_or_default();
  let deployment = state().engine.rollback(&id, &reason).await?;
  Ok(Json(deployment))
}
