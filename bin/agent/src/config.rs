use std::{path::PathBuf, sync::OnceLock};

use arbor_client::entities::config::{AgentConfig, CliArgs, Env};
use clap::Parser;
use colored::Colorize;
use config::ConfigLoader;

pub fn agent_config() -> &'static AgentConfig {
  static AGENT_CONFIG: OnceLock<AgentConfig> = OnceLock::new();
  AGENT_CONFIG.get_or_init(|| {
    let env: Env = envy::from_env()
      .expect("failed to parse agent environment");
    let args = CliArgs::parse();
    let config_paths = args
      .config_path
      .unwrap_or(env.arbor_config_paths.clone());

    let mut config = if config_paths.is_empty() {
      println!(
        "{}: No config paths found, using default config",
        "INFO".green(),
      );
      AgentConfig::default()
    } else {
      (ConfigLoader {
        paths: &config_paths
          .iter()
          .map(PathBuf::as_path)
          .collect::<Vec<_>>(),
        match_wildcards: &args
          .config_keyword
          .unwrap_or(env.arbor_config_keywords.clone())
          .iter()
          .map(String::as_str)
          .collect::<Vec<_>>(),
        merge_nested: args.merge_nested_config,
        extend_array: args.extend_config_arrays,
        debug_print: args
          .log_level
          .map(|level| {
            level == tracing::Level::DEBUG
              || level == tracing::Level::TRACE
          })
          .unwrap_or_default(),
      })
      .load()
      .expect("failed at parsing config from paths")
    };

    // Environment overrides beat config file contents,
    // CLI log level beats both.
    if let Some(id) = env.arbor_agent_id {
      config.agent.id = id;
    }
    if let Some(server_id) = env.arbor_server_id {
      config.agent.server_id = server_id;
    }
    if let Some(location) = env.arbor_location {
      config.agent.location = location;
    }
    if let Some(port) = env.arbor_port {
      config.agent.port = port;
    }
    if let Some(bind_ip) = env.arbor_bind_ip {
      config.agent.bind_ip = bind_ip;
    }
    if let Some(base_url) = env.arbor_backend_base_url {
      config.backend.base_url = base_url;
    }
    if let Some(api_token) = env.arbor_backend_api_token {
      config.backend.api_token = api_token;
    }
    if let Some(token_file) = env.arbor_backend_token_file {
      config.backend.token_file = token_file;
    }
    if let Some(host) = env.arbor_docker_host {
      config.docker.host = host;
    }
    if let Some(network) = env.arbor_docker_network {
      config.docker.network_name = network;
    }
    if let Some(base_domain) = env.arbor_base_domain {
      config.domain.base_domain = base_domain;
    }
    if let Some(router_dir) = env.arbor_router_dir {
      config.domain.router_dir = router_dir;
    }
    if let Some(data_dir) = env.arbor_storage_data_dir {
      config.storage.data_dir = data_dir;
    }
    if let Some(key) = env.arbor_storage_encryption_key {
      config.storage.encryption_key = key;
    }
    if let Some(max_concurrent_ops) = env.arbor_max_concurrent_ops {
      config.agent.max_concurrent_ops = max_concurrent_ops;
    }
    if let Some(heartbeat_interval) = env.arbor_heartbeat_interval {
      config.agent.heartbeat_interval = heartbeat_interval;
    }
    config.logging.level = args
      .log_level
      .map(Into::into)
      .or(env.arbor_logging_level)
      .unwrap_or(config.logging.level);

    if config.agent.id.is_empty() {
      config.agent.id = format!("agent-{}", uuid::Uuid::new_v4());
    }

    config
  })
}

/// The token presented to the control plane. `token_file` wins
/// over the inline config value.
pub fn initial_backend_token() -> anyhow::Result<String> {
  let backend = &agent_config().backend;
  if !backend.token_file.is_empty() {
    let token = std::fs::read_to_string(&backend.token_file)
      .map_err(|e| {
        anyhow::anyhow!(
          "failed to read backend token file {} | {e:?}",
          backend.token_file
        )
      })?;
    return Ok(token.trim().to_string());
  }
  Ok(backend.api_token.clone())
}
