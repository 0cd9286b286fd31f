use crate::batch::BatchAccumulator;
use crate::store::{
    history_key, last_state_key, updates_channel, StoreCommand, TelemetryStore,
};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    /// The store connection is gone and must be re-acquired.
    Connection,
    Store,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    Written(usize),
    Retry(RetryReason),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FlushPlan {
    pub commands: Vec<StoreCommand>,
    pub records: usize,
    pub pruned_devices: BTreeSet<String>,
    pub cutoff: i64,
}

#[derive(Debug, Clone)]
pub struct SinkWriter {
    retention: Duration,
    prune_unattributed: bool,
}

impl SinkWriter {
    pub fn new(retention: Duration, prune_unattributed: bool) -> Self {
        Self {
            retention,
            prune_unattributed,
        }
    }

    /// Builds the single transaction for a batch. All prunes share the same cutoff.
    pub fn plan(&self, batch: &BatchAccumulator, now: DateTime<Utc>) -> FlushPlan {
        let horizon = i64::try_from(self.retention.as_secs()).unwrap_or(i64::MAX);
        let cutoff = now.timestamp().saturating_sub(horizon);
        let mut commands = Vec::with_capacity(batch.pending_count() * 3);
        let mut pruned_devices = BTreeSet::new();
        let mut records = 0usize;

        for record in batch.records() {
            let message = record.message_json();
            commands.push(StoreCommand::HistoryAdd {
                key: history_key(&record.device_id),
                member: message.clone(),
                score: record.timestamp,
            });
            commands.push(StoreCommand::LastStateSet {
                key: last_state_key(&record.device_id),
                fields: vec![
                    ("payload".to_string(), record.payload_json()),
                    ("timestamp".to_string(), record.timestamp_text.clone()),
                ],
            });
            commands.push(StoreCommand::Publish {
                channel: updates_channel(&record.device_id),
                message,
            });
            if record.is_attributed() || self.prune_unattributed {
                pruned_devices.insert(record.device_id.clone());
            }
            records += 1;
        }

        for device_id in &pruned_devices {
            commands.push(StoreCommand::PruneBefore {
                key: history_key(device_id),
                cutoff,
            });
        }

        FlushPlan {
            commands,
            records,
            pruned_devices,
            cutoff,
        }
    }

    /// Writes the whole batch in one transaction. The batch itself is never touched here;
    /// the caller clears it only after the offsets are committed.
    pub async fn flush<S: TelemetryStore>(
        &self,
        store: &mut S,
        batch: &BatchAccumulator,
        now: DateTime<Utc>,
    ) -> FlushOutcome {
        let plan = self.plan(batch, now);
        if plan.records == 0 {
            return FlushOutcome::Written(0);
        }

        match store.execute_atomic(&plan.commands).await {
            Ok(()) => {
                tracing::info!(
                    records = plan.records,
                    devices = plan.pruned_devices.len(),
                    cutoff = plan.cutoff,
                    "batch written"
                );
                FlushOutcome::Written(plan.records)
            }
            Err(err) if err.is_connection() => {
                tracing::error!(error=%err, records = plan.records, "store connection lost during flush; reconnecting");
                FlushOutcome::Retry(RetryReason::Connection)
            }
            Err(err) => {
                tracing::error!(error=%err, records = plan.records, "failed to write batch; it will be retried");
                FlushOutcome::Retry(RetryReason::Store)
            }
        }
    }
}
