use crate::error::StoreError;
use crate::supervisor::Connector;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::collections::HashMap;

pub fn history_key(device_id: &str) -> String {
    format!("device:history:{device_id}")
}

pub fn last_state_key(device_id: &str) -> String {
    format!("device:last_state:{device_id}")
}

pub fn updates_channel(device_id: &str) -> String {
    format!("device-updates:{device_id}")
}

/// One queued command of a flush transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreCommand {
    /// `ZADD key score member`
    HistoryAdd {
        key: String,
        member: String,
        score: f64,
    },
    /// `HSET key field value ...`
    LastStateSet {
        key: String,
        fields: Vec<(String, String)>,
    },
    /// `PUBLISH channel message`
    Publish { channel: String, message: String },
    /// `ZREMRANGEBYSCORE key -inf cutoff`
    PruneBefore { key: String, cutoff: i64 },
}

/// Time-series cache the sink writes into. `execute_atomic` applies every command or none.
pub trait TelemetryStore {
    async fn ping(&mut self) -> Result<(), StoreError>;

    async fn execute_atomic(&mut self, commands: &[StoreCommand]) -> Result<(), StoreError>;

    /// History members for a device with `min <= score <= max`, oldest first.
    async fn history_range(
        &mut self,
        device_id: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<String>, StoreError>;

    async fn last_state(&mut self, device_id: &str) -> Result<HashMap<String, String>, StoreError>;
}

pub struct RedisStore {
    conn: MultiplexedConnection,
}

impl TelemetryStore for RedisStore {
    async fn ping(&mut self) -> Result<(), StoreError> {
        let _: String = redis::cmd("PING").query_async(&mut self.conn).await?;
        Ok(())
    }

    async fn execute_atomic(&mut self, commands: &[StoreCommand]) -> Result<(), StoreError> {
        if commands.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for command in commands {
            match command {
                StoreCommand::HistoryAdd { key, member, score } => {
                    pipe.zadd(key, member, *score).ignore();
                }
                StoreCommand::LastStateSet { key, fields } => {
                    pipe.hset_multiple(key, fields.as_slice()).ignore();
                }
                StoreCommand::Publish { channel, message } => {
                    pipe.publish(channel, message).ignore();
                }
                StoreCommand::PruneBefore { key, cutoff } => {
                    pipe.zrembyscore(key, "-inf", *cutoff).ignore();
                }
            }
        }

        let _: () = pipe.query_async(&mut self.conn).await?;
        Ok(())
    }

    async fn history_range(
        &mut self,
        device_id: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<String>, StoreError> {
        let members: Vec<String> = self
            .conn
            .zrangebyscore(history_key(device_id), min, max)
            .await?;
        Ok(members)
    }

    async fn last_state(&mut self, device_id: &str) -> Result<HashMap<String, String>, StoreError> {
        let fields: HashMap<String, String> = self.conn.hgetall(last_state_key(device_id)).await?;
        Ok(fields)
    }
}

#[derive(Debug, Clone)]
pub struct RedisConnector {
    url: String,
}

impl RedisConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl Connector for RedisConnector {
    type Handle = RedisStore;
    type Error = StoreError;

    fn name(&self) -> &'static str {
        "redis"
    }

    async fn connect(&self) -> Result<RedisStore, StoreError> {
        let client = redis::Client::open(self.url.as_str())?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(RedisStore { conn })
    }

    async fn probe(&self, handle: &mut RedisStore) -> Result<(), StoreError> {
        handle.ping().await
    }
}
