mod batch;
mod broker;
mod committer;
mod config;
mod error;
mod pipeline;
mod sink;
mod store;
mod supervisor;
mod telemetry;

#[cfg(test)]
mod test_support;

use crate::batch::FlushTrigger;
use crate::broker::{KafkaConnector, KafkaSettings};
use crate::config::Config;
use crate::pipeline::{IngestStats, Pipeline, PipelineSettings};
use crate::sink::SinkWriter;
use crate::store::RedisConnector;
use crate::supervisor::{RetryPolicy, Supervised};
use anyhow::Result;
use std::sync::Arc;

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,telemetry_sink=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    if let Some(endpoint) = &config.otlp_endpoint {
        let endpoint = normalize_otlp_http_endpoint(endpoint);
        let exporter = opentelemetry_otlp::new_exporter()
            .http()
            .with_endpoint(endpoint);
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "telemetry-sink"),
            ])))
            .install_batch(Tokio)?;

        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}

fn normalize_otlp_http_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.contains("/v1/traces") {
        return trimmed.to_string();
    }
    format!("{}/v1/traces", trimmed.trim_end_matches('/'))
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config)?;

    if config.startup_delay_secs > 0 {
        tracing::info!(delay_secs = config.startup_delay_secs, "waiting before connecting");
        tokio::time::sleep(config.startup_delay()).await;
    }

    let retry = RetryPolicy::fixed(config.reconnect_delay());
    let broker = Supervised::new(
        KafkaConnector::new(KafkaSettings {
            brokers: config.kafka_brokers.clone(),
            topic: config.kafka_topic.clone(),
            group_id: config.kafka_group_id.clone(),
            client_id: config.kafka_client_id.clone(),
            auto_offset_reset: config.kafka_offset_reset.clone(),
        }),
        retry,
    );
    let store = Supervised::new(RedisConnector::new(config.redis_url.clone()), retry);

    let stats = Arc::new(IngestStats::new());
    let mut pipeline = Pipeline::new(
        broker,
        store,
        SinkWriter::new(config.retention(), config.prune_unattributed),
        PipelineSettings {
            trigger: FlushTrigger::new(config.batch_size, config.flush_interval()),
            poll_timeout: config.poll_timeout(),
            loop_error_delay: config.loop_error_delay(),
        },
        stats.clone(),
    );

    let status_interval = config.status_log_interval();
    let status_stats = stats.clone();
    let status_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(status_interval);
        loop {
            ticker.tick().await;
            status_stats.log_snapshot();
        }
    });

    tracing::info!(
        topic = %config.kafka_topic,
        batch_size = config.batch_size,
        flush_interval_ms = config.flush_interval_ms,
        retention_seconds = config.retention_seconds,
        "telemetry sink starting"
    );

    tokio::select! {
        _ = async {
            pipeline.connect().await;
            pipeline.run().await;
        } => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received; pending records stay uncommitted");
        }
    }

    status_handle.abort();

    Ok(())
}
