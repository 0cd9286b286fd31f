use crate::error::BrokerError;
use crate::supervisor::Connector;
use crate::telemetry::{decode_message, Polled};
use chrono::Utc;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::Message;
use rdkafka::{Offset, TopicPartitionList};
use std::time::Duration;

const METADATA_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Ordered, partitioned message feed with manual offset commits.
pub trait MessageSource {
    /// Collects messages until `timeout` elapses or `max_records` arrive. An idle
    /// timeout yields an empty vector, not an error.
    async fn poll(
        &mut self,
        timeout: Duration,
        max_records: usize,
    ) -> Result<Vec<Polled>, BrokerError>;

    /// Commits `(partition, next_offset)` pairs synchronously.
    fn commit(&mut self, offsets: &[(i32, i64)]) -> Result<(), BrokerError>;
}

#[derive(Debug, Clone)]
pub struct KafkaSettings {
    pub brokers: String,
    pub topic: String,
    pub group_id: String,
    pub client_id: String,
    pub auto_offset_reset: String,
}

pub struct KafkaSource {
    consumer: StreamConsumer,
    topic: String,
}

impl MessageSource for KafkaSource {
    async fn poll(
        &mut self,
        timeout: Duration,
        max_records: usize,
    ) -> Result<Vec<Polled>, BrokerError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut polled = Vec::new();

        while polled.len() < max_records.max(1) {
            let message = match tokio::time::timeout_at(deadline, self.consumer.recv()).await {
                Err(_) => break,
                Ok(Ok(message)) => message,
                Ok(Err(KafkaError::PartitionEOF(_))) => continue,
                Ok(Err(err)) => {
                    let err = BrokerError::from_consume(err);
                    if polled.is_empty() {
                        return Err(err);
                    }
                    // Keep what was already read; the error resurfaces on the next poll.
                    tracing::warn!(error=%err, received = polled.len(), "consume error mid-poll");
                    break;
                }
            };
            polled.push(decode_message(
                message.partition(),
                message.offset(),
                message.payload(),
                Utc::now(),
            ));
        }

        Ok(polled)
    }

    fn commit(&mut self, offsets: &[(i32, i64)]) -> Result<(), BrokerError> {
        if offsets.is_empty() {
            return Ok(());
        }
        let mut tpl = TopicPartitionList::new();
        for &(partition, next) in offsets {
            tpl.add_partition_offset(&self.topic, partition, Offset::Offset(next))
                .map_err(BrokerError::from_commit)?;
        }
        let consumer = &self.consumer;
        tokio::task::block_in_place(|| consumer.commit(&tpl, CommitMode::Sync))
            .map_err(BrokerError::from_commit)
    }
}

#[derive(Debug, Clone)]
pub struct KafkaConnector {
    settings: KafkaSettings,
}

impl KafkaConnector {
    pub fn new(settings: KafkaSettings) -> Self {
        Self { settings }
    }

    fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.settings.brokers)
            .set("group.id", &self.settings.group_id)
            .set("client.id", &self.settings.client_id)
            .set("auto.offset.reset", &self.settings.auto_offset_reset)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false");
        config
    }
}

impl Connector for KafkaConnector {
    type Handle = KafkaSource;
    type Error = BrokerError;

    fn name(&self) -> &'static str {
        "kafka"
    }

    async fn connect(&self) -> Result<KafkaSource, BrokerError> {
        let consumer: StreamConsumer = self
            .client_config()
            .create()
            .map_err(|err| BrokerError::Config(err.to_string()))?;
        consumer
            .subscribe(&[self.settings.topic.as_str()])
            .map_err(|err| BrokerError::Connection(err.to_string()))?;
        tracing::info!(
            topic = %self.settings.topic,
            group_id = %self.settings.group_id,
            brokers = %self.settings.brokers,
            "subscribed to telemetry topic"
        );
        Ok(KafkaSource {
            consumer,
            topic: self.settings.topic.clone(),
        })
    }

    /// librdkafka connects lazily, so a metadata round trip is the liveness check.
    async fn probe(&self, handle: &mut KafkaSource) -> Result<(), BrokerError> {
        let topic = self.settings.topic.as_str();
        tokio::task::block_in_place(|| {
            handle
                .consumer
                .fetch_metadata(Some(topic), METADATA_PROBE_TIMEOUT)
        })
        .map(|_| ())
        .map_err(|err| BrokerError::Connection(err.to_string()))
    }
}
