use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use redis::RedisError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker connection failed: {0}")]
    Connection(String),
    #[error("failed to configure consumer: {0}")]
    Config(String),
    #[error("failed to consume message: {0}")]
    Consume(String),
    #[error("failed to commit offsets: {0}")]
    Commit(String),
}

impl BrokerError {
    pub fn is_connection(&self) -> bool {
        matches!(self, BrokerError::Connection(_))
    }

    pub fn from_consume(err: KafkaError) -> Self {
        if is_transport_failure(&err) {
            BrokerError::Connection(err.to_string())
        } else {
            BrokerError::Consume(err.to_string())
        }
    }

    pub fn from_commit(err: KafkaError) -> Self {
        if is_transport_failure(&err) {
            BrokerError::Connection(err.to_string())
        } else {
            BrokerError::Commit(err.to_string())
        }
    }
}

fn is_transport_failure(err: &KafkaError) -> bool {
    matches!(
        err.rdkafka_error_code(),
        Some(
            RDKafkaErrorCode::BrokerTransportFailure
                | RDKafkaErrorCode::AllBrokersDown
                | RDKafkaErrorCode::Resolve
                | RDKafkaErrorCode::BrokerNotAvailable
                | RDKafkaErrorCode::NetworkException
        )
    )
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store connection failed: {0}")]
    Connection(String),
    #[error("store command failed: {0}")]
    Command(String),
}

impl StoreError {
    pub fn is_connection(&self) -> bool {
        matches!(self, StoreError::Connection(_))
    }
}

impl From<RedisError> for StoreError {
    fn from(err: RedisError) -> Self {
        if err.is_io_error()
            || err.is_connection_dropped()
            || err.is_connection_refusal()
            || err.is_timeout()
        {
            StoreError::Connection(err.to_string())
        } else {
            StoreError::Command(err.to_string())
        }
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("empty payload")]
    Empty,
    #[error("payload is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] simd_json::Error),
    #[error("payload is not a JSON object")]
    NotAnObject,
}
