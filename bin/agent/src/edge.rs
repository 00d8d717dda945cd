use std::{collections::BTreeMap, path::PathBuf};

use anyhow::Context;
use arbor_client::entities::deployment::Deployment;
use serde::{Deserialize, Serialize};

use crate::config::agent_config;

/// The dynamic route fragment dropped into the edge router's
/// watched directory, one file per deployment.
#[derive(Serialize, Deserialize, Debug)]
struct RouteFragment {
  http: HttpSection,
}

#[derive(Serialize, Deserialize, Debug)]
struct HttpSection {
  routers: BTreeMap<String, Router>,
  services: BTreeMap<String, Service>,
}

#[derive(Serialize, Deserialize, Debug)]
struct Router {
  rule: String,
  service: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  tls: Option<RouterTls>,
}

#[derive(Serialize, Deserialize, Debug)]
struct RouterTls {
  #[serde(rename = "certResolver")]
  cert_resolver: String,
}

#[derive(Serialize, Deserialize, Debug)]
struct Service {
  #[serde(rename = "loadBalancer")]
  load_balancer: LoadBalancer,
}

#[derive(Serialize, Deserialize, Debug)]
struct LoadBalancer {
  servers: Vec<Server>,
}

#[derive(Serialize, Deserialize, Debug)]
struct Server {
  url: String,
}

pub fn fragment_path(deployment_id: &str) -> PathBuf {
  agent_config()
    .domain
    .router_dir
    .join(format!("{deployment_id}.yml"))
}

/// Write the fragment for a deployment that advertises a port.
/// Returns None (and writes nothing) for port-less deployments.
pub async fn write_route_fragment(
  deployment: &Deployment,
) -> anyhow::Result<Option<PathBuf>> {
  let Some(port) = deployment
    .ports
    .first()
    .map(|mapping| mapping.container_port)
  else {
    return Ok(None);
  };
  let config = agent_config();
  let contents = render_fragment(
    &deployment.app_id,
    &deployment.subdomain,
    &config.domain.base_domain,
    &deployment.container_name,
    port,
    config.domain.tls_enabled,
  )?;
  let path = fragment_path(&deployment.id);
  tokio::fs::create_dir_all(&config.domain.router_dir)
    .await
    .with_context(|| {
      format!(
        "failed to create router dir {:?}",
        config.domain.router_dir
      )
    })?;
  tokio::fs::write(&path, contents)
    .await
    .with_context(|| {
      format!("failed to write route fragment at {path:?}")
    })?;
  Ok(Some(path))
}

/// The router watches the directory; deleting the file is the
/// whole removal protocol.
pub async fn remove_route_fragment(
  deployment_id: &str,
) -> anyhow::Result<()> {
  let path = fragment_path(deployment_id);
  match tokio::fs::remove_file(&path).await {
    Ok(()) => Ok(()),
    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
    Err(e) => Err(anyhow::anyhow!(e).context(format!(
      "failed to remove route fragment at {path:?}"
    ))),
  }
}

fn render_fragment(
  app_id: &str,
  subdomain: &str,
  base_domain: &str,
  container_name: &str,
  port: u16,
  tls: bool,
) -> anyhow::Result<String> {
  let fragment = RouteFragment {
    http: HttpSection {
      routers: [(
        app_id.to_string(),
        Router {
          rule: format!("Host(`{subdomain}.{base_domain}`)"),
          service: app_id.to_string(),
          tls: tls.then(|| RouterTls {
            cert_resolver: String::from("letsencrypt"),
          }),
        },
      )]
      .into(),
      services: [(
        app_id.to_string(),
        Service {
          load_balancer: LoadBalancer {
            servers: vec![Server {
              url: format!("http://{container_name}:{port}"),
            }],
          },
        },
      )]
      .into(),
    },
  };
  serde_yaml_ng::to_string(&fragment)
    .context("failed to render route fragment")
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn fragment_contains_host_rule_and_upstream() {
    let out = render_fragment(
      "demo",
      "demo",
      "apps.example.com",
      "arbor-demo-1.0.0-17",
      8080,
      true,
    )
    .unwrap();
    assert!(out.contains("Host(`demo.apps.example.com`)"));
    assert!(out.contains("http://arbor-demo-1.0.0-17:8080"));
    assert!(out.contains("certResolver: letsencrypt"));

    // Round-trips as yaml with the expected structure.
    let parsed: RouteFragment =
      serde_yaml_ng::from_str(&out).unwrap();
    assert!(parsed.http.routers.contains_key("demo"));
    assert_eq!(
      parsed.http.services["demo"].load_balancer.servers[0].url,
      "http://arbor-demo-1.0.0-17:8080"
    );
  }

  #[test]
  fn tls_block_omitted_when_disabled() {
    let out = render_fragment(
      "demo",
      "demo",
      "apps.example.com",
      "arbor-demo",
      80,
      false,
    )
    .unwrap();
    assert!(!out.contains("certResolver"));
  }
}
