//! # Arbor Client
//!
//! Shared entities for the Arbor agent, plus a typed client for
//! its local HTTP API. The CLI and remote validators both speak
//! to the agent through [AgentClient].

use anyhow::{Context, anyhow};
use serde::de::DeserializeOwned;

use crate::{
  entities::{
    JsonValue,
    deployment::{DeployRequest, Deployment},
  },
  error::ApiErrorBody,
};

pub mod entities;
pub mod error;

pub struct AgentClient {
  pub address: String,
  token: String,
  reqwest: reqwest::Client,
}

impl AgentClient {
  pub fn new(
    address: impl Into<String>,
    token: impl Into<String>,
  ) -> AgentClient {
    AgentClient {
      address: address.into().trim_end_matches('/').to_string(),
      token: token.into(),
      reqwest: Default::default(),
    }
  }

  pub async fn status(&self) -> anyhow::Result<JsonValue> {
    self.get("/api/v1/status").await
  }

  pub async fn version(&self) -> anyhow::Result<JsonValue> {
    self.get("/api/v1/version").await
  }

  pub async fn health(&self) -> anyhow::Result<JsonValue> {
    self.get("/api/v1/health").await
  }

  pub async fn metrics(&self) -> anyhow::Result<JsonValue> {
    self.get("/api/v1/metrics").await
  }

  pub async fn list_deployments(
    &self,
  ) -> anyhow::Result<Vec<Deployment>> {
    self.get("/api/v1/deployments").await
  }

  pub async fn get_deployment(
    &self,
    id: &str,
  ) -> anyhow::Result<Deployment> {
    self.get(&format!("/api/v1/deployments/{id}")).await
  }

  pub async fn deploy(
    &self,
    request: &DeployRequest,
  ) -> anyhow::Result<Deployment> {
    self.post("/api/v1/deployments", request).await
  }

  pub async fn remove_deployment(
    &self,
    id: &str,
  ) -> anyhow::Result<JsonValue> {
    self.delete(&format!("/api/v1/deployments/{id}")).await
  }

  pub async fn deployment_logs(
    &self,
    id: &str,
    tail: usize,
  ) -> anyhow::Result<Vec<entities::Log>> {
    self
      .get(&format!("/api/v1/deployments/{id}/logs?tail={tail}"))
      .await
  }

  pub async fn start_deployment(
    &self,
    id: &str,
  ) -> anyhow::Result<Deployment> {
    self
      .post(&format!("/api/v1/deployments/{id}/start"), &())
      .await
  }

  pub async fn stop_deployment(
    &self,
    id: &str,
  ) -> anyhow::Result<Deployment> {
    self
      .post(&format!("/api/v1/deployments/{id}/stop"), &())
      .await
  }

  pub async fn restart_deployment(
    &self,
    id: &str,
  ) -> anyhow::Result<Deployment> {
    self
      .post(&format!("/api/v1/deployments/{id}/restart"), &())
      .await
  }

  pub async fn rollback_deployment(
    &self,
    id: &str,
    reason: &str,
  ) -> anyhow::Result<Deployment> {
    self
      .post(
        &format!("/api/v1/deployments/{id}/rollback"),
        &serde_json::json!({ "reason": reason }),
      )
      .await
  }

  async fn get<R: DeserializeOwned>(
    &self,
    path: &str,
  ) -> anyhow::Result<R> {
    let req = self
      .reqwest
      .get(format!("{}{path}", self.address))
      .header("Authorization", format!("Bearer {}", self.token));
    handle_response(req.send().await?).await
  }

  async fn post<B: serde::Serialize, R: DeserializeOwned>(
    &self,
    path: &str,
    body: &B,
  ) -> anyhow::Result<R> {
    let req = self
      .reqwest
      .post(format!("{}{path}", self.address))
      .header("Authorization", format!("Bearer {}", self.token))
      .json(body);
    handle_response(req.send().await?).await
  }

  async fn delete<R: DeserializeOwned>(
    &self,
    path: &str,
  ) -> anyhow::Result<R> {
    let req = self
      .reqwest
      .delete(format!("{}{path}", self.address))
      .header("Authorization", format!("Bearer {}", self.token));
    handle_response(req.send().await?).await
  }
}

async fn handle_response<R: DeserializeOwned>(
  response: reqwest::Response,
) -> anyhow::Result<R> {
  let status = response.status();
  if status.is_success() {
    response
      .json()
      .await
      .context("failed to parse response body")
  } else {
    let body = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ApiErrorBody>(&body) {
      Ok(error) => Err(anyhow!("{} | {}", error.status, error.error)),
      Err(_) => Err(anyhow!("{status} | {body}")),
    }
  }
}
