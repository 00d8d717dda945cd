use anyhow::Context;
use arbor_client::entities::logger::{LogConfig, StdioLogMode};
use tracing::level_filters::LevelFilter;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::{
  Registry, layer::SubscriberExt, util::SubscriberInitExt,
};

mod otel;

/// Initialise the global tracing subscriber from [LogConfig].
/// Must be called once, before any task spawns.
pub fn init(config: &LogConfig) -> anyhow::Result<()> {
  let log_level: tracing::Level = config.level.into();

  let registry =
    Registry::default().with(LevelFilter::from(log_level));

  let use_otel = !config.otlp_endpoint.is_empty();

  match (config.stdio, use_otel) {
    (StdioLogMode::Standard, true) => {
      let tracer = otel::tracer(
        &config.otlp_endpoint,
        config.otlp_service_name.clone(),
      );
      if config.pretty {
        registry
          .with(tracing_subscriber::fmt::layer().pretty())
          .with(OpenTelemetryLayer::new(tracer))
          .try_init()
      } else {
        registry
          .with(tracing_subscriber::fmt::layer())
          .with(OpenTelemetryLayer::new(tracer))
          .try_init()
      }
    }
    (StdioLogMode::Json, true) => {
      let tracer = otel::tracer(
        &config.otlp_endpoint,
        config.otlp_service_name.clone(),
      );
      registry
        .with(tracing_subscriber::fmt::layer().json())
        .with(OpenTelemetryLayer::new(tracer))
        .try_init()
    }
    (StdioLogMode::None, true) => {
      let tracer = otel::tracer(
        &config.otlp_endpoint,
        config.otlp_service_name.clone(),
      );
      registry.with(OpenTelemetryLayer::new(tracer)).try_init()
    }

    (StdioLogMode::Standard, false) => {
      if config.pretty {
        registry
          .with(tracing_subscriber::fmt::layer().pretty())
          .try_init()
      } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
      }
    }
    (StdioLogMode::Json, false) => registry
      .with(tracing_subscriber::fmt::layer().json())
      .try_init(),
    (StdioLogMode::None, false) => Ok(()),
  }
  .context("failed to init logger")
}
