use anyhow::{Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

fn setup_config_path() -> Option<PathBuf> {
    env_optional("SINK_SETUP_CONFIG_PATH").map(PathBuf::from)
}

/// Values from the optional setup file; each applies only while its env variable is unset.
#[derive(Debug, Clone, Default, Deserialize)]
struct SetupConfigOverrides {
    #[serde(default)]
    kafka_brokers: Option<String>,
    #[serde(default)]
    kafka_topic: Option<String>,
    #[serde(default)]
    kafka_group_id: Option<String>,
    #[serde(default)]
    redis_url: Option<String>,
    #[serde(default)]
    batch_size: Option<usize>,
    #[serde(default)]
    flush_interval_ms: Option<u64>,
    #[serde(default)]
    retention_seconds: Option<u64>,
    #[serde(default)]
    prune_unattributed: Option<bool>,
}

fn load_setup_config_overrides() -> Option<SetupConfigOverrides> {
    let path = setup_config_path()?;
    if !path.exists() {
        tracing::warn!(path = %path.display(), "telemetry-sink setup config not found; using env defaults");
        return None;
    }
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "telemetry-sink failed to read setup config; using env defaults"
            );
            return None;
        }
    };
    parse_setup_config(contents)
        .map_err(|err| {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "telemetry-sink failed to parse setup config; using env defaults"
            );
        })
        .ok()
}

fn parse_setup_config(contents: String) -> Result<SetupConfigOverrides, simd_json::Error> {
    let mut bytes = contents.into_bytes();
    simd_json::serde::from_slice(&mut bytes)
}

fn apply_setup_overrides(config: &mut Config, overrides: &SetupConfigOverrides) {
    if env_allows(&["SINK_KAFKA_BROKERS", "KAFKA_BROKER"]) {
        if let Some(value) = non_empty(&overrides.kafka_brokers) {
            config.kafka_brokers = value;
        }
    }
    if env_allows(&["SINK_KAFKA_TOPIC", "KAFKA_TOPIC"]) {
        if let Some(value) = non_empty(&overrides.kafka_topic) {
            config.kafka_topic = value;
        }
    }
    if env_allows(&["SINK_KAFKA_GROUP_ID"]) {
        if let Some(value) = non_empty(&overrides.kafka_group_id) {
            config.kafka_group_id = value;
        }
    }
    if env_allows(&["SINK_REDIS_URL", "REDIS_URL", "REDIS_HOST"]) {
        if let Some(value) = non_empty(&overrides.redis_url) {
            config.redis_url = value;
        }
    }
    if env_allows(&["SINK_BATCH_SIZE"]) {
        if let Some(value) = overrides.batch_size.filter(|v| *v != 0) {
            config.batch_size = value;
        }
    }
    if env_allows(&["SINK_FLUSH_INTERVAL_MS"]) {
        if let Some(value) = overrides.flush_interval_ms.filter(|v| *v != 0) {
            config.flush_interval_ms = value;
        }
    }
    if env_allows(&["SINK_RETENTION_SECONDS"]) {
        if let Some(value) = overrides.retention_seconds.filter(|v| *v != 0) {
            config.retention_seconds = value;
        }
    }
    if env_allows(&["SINK_PRUNE_UNATTRIBUTED"]) {
        if let Some(value) = overrides.prune_unattributed {
            config.prune_unattributed = value;
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub kafka_brokers: String,
    pub kafka_topic: String,
    pub kafka_group_id: String,
    pub kafka_client_id: String,
    pub kafka_offset_reset: String,
    pub poll_timeout_ms: u64,
    pub redis_url: String,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub reconnect_delay_ms: u64,
    pub loop_error_delay_ms: u64,
    pub retention_seconds: u64,
    pub prune_unattributed: bool,
    pub startup_delay_secs: u64,
    pub status_log_interval_ms: u64,
    pub otlp_endpoint: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let setup_overrides = load_setup_config_overrides();

        let kafka_brokers = env_optional("SINK_KAFKA_BROKERS")
            .or_else(|| env_optional("KAFKA_BROKER"))
            .unwrap_or_else(|| "redpanda:29092".to_string());
        let kafka_topic = env_optional("SINK_KAFKA_TOPIC")
            .or_else(|| env_optional("KAFKA_TOPIC"))
            .unwrap_or_else(|| "iot-data".to_string());
        let kafka_group_id = env_optional("SINK_KAFKA_GROUP_ID")
            .unwrap_or_else(|| "kafka-redis-consumer-group".to_string());
        let kafka_client_id = env_optional("SINK_KAFKA_CLIENT_ID")
            .unwrap_or_else(|| format!("telemetry-sink-{}", std::process::id()));
        let kafka_offset_reset =
            env_optional("SINK_KAFKA_OFFSET_RESET").unwrap_or_else(|| "latest".to_string());
        let poll_timeout_ms = env_parse::<u64>("SINK_POLL_TIMEOUT_MS", 1000)?;

        let redis_url = match env_optional("SINK_REDIS_URL").or_else(|| env_optional("REDIS_URL")) {
            Some(url) => url,
            None => {
                let host = env_optional("REDIS_HOST").unwrap_or_else(|| "redis".to_string());
                let port = env_parse::<u16>("REDIS_PORT", 6379)?;
                let db = env_parse::<u32>("SINK_REDIS_DB", 0)?;
                build_redis_url(&host, port, env_optional("REDIS_PASSWORD").as_deref(), db)
            }
        };

        let batch_size = env_parse::<usize>("SINK_BATCH_SIZE", 10)?;
        let flush_interval_ms = env_parse::<u64>("SINK_FLUSH_INTERVAL_MS", 5000)?;
        let reconnect_delay_ms = env_parse::<u64>("SINK_RECONNECT_DELAY_MS", 5000)?;
        let loop_error_delay_ms = env_parse::<u64>("SINK_LOOP_ERROR_DELAY_MS", 5000)?;
        let retention_seconds = env_parse::<u64>("SINK_RETENTION_SECONDS", 5 * 3600)?;
        let prune_unattributed = env_optional("SINK_PRUNE_UNATTRIBUTED")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        let startup_delay_secs = env_parse::<u64>("SINK_STARTUP_DELAY_SECS", 0)?;
        let status_log_interval_ms = env_parse::<u64>("SINK_STATUS_LOG_INTERVAL_MS", 30_000)?;
        let otlp_endpoint = env_optional("OTEL_EXPORTER_OTLP_ENDPOINT");

        let mut config = Self {
            kafka_brokers,
            kafka_topic,
            kafka_group_id,
            kafka_client_id,
            kafka_offset_reset,
            poll_timeout_ms,
            redis_url,
            batch_size,
            flush_interval_ms,
            reconnect_delay_ms,
            loop_error_delay_ms,
            retention_seconds,
            prune_unattributed,
            startup_delay_secs,
            status_log_interval_ms,
            otlp_endpoint,
        };

        if let Some(overrides) = setup_overrides.as_ref() {
            apply_setup_overrides(&mut config, overrides);
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            i64::try_from(self.retention_seconds).is_ok(),
            "SINK_RETENTION_SECONDS out of range: {}",
            self.retention_seconds
        );
        Ok(())
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn loop_error_delay(&self) -> Duration {
        Duration::from_millis(self.loop_error_delay_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_seconds)
    }

    pub fn startup_delay(&self) -> Duration {
        Duration::from_secs(self.startup_delay_secs)
    }

    pub fn status_log_interval(&self) -> Duration {
        Duration::from_millis(self.status_log_interval_ms.max(1))
    }
}

fn env_allows(keys: &[&str]) -> bool {
    keys.iter().all(|key| env_optional(key).is_none())
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env_optional(key) {
        Some(raw) => raw
            .parse::<T>()
            .with_context(|| format!("invalid {key}: {raw}")),
        None => Ok(default),
    }
}

fn build_redis_url(host: &str, port: u16, password: Option<&str>, db: u32) -> String {
    match password {
        Some(password) => format!("redis://:{password}@{host}:{port}/{db}"),
        None => format!("redis://{host}:{port}/{db}"),
    }
}
