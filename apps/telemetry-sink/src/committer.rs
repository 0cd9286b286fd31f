use crate::batch::BatchAccumulator;
use crate::broker::MessageSource;
use crate::error::BrokerError;
use std::collections::BTreeMap;

/// Next offset to consume for every partition present in the batch, covering both
/// written records and malformed offsets deferred behind them.
pub fn batch_offsets(batch: &BatchAccumulator) -> Vec<(i32, i64)> {
    let mut highest: BTreeMap<i32, i64> = BTreeMap::new();
    let consumed = batch
        .partitions()
        .filter_map(|(partition, records)| {
            records
                .iter()
                .map(|record| record.offset)
                .max()
                .map(|offset| (partition, offset))
        })
        .chain(batch.deferred_skips());
    for (partition, offset) in consumed {
        highest
            .entry(partition)
            .and_modify(|current| *current = (*current).max(offset))
            .or_insert(offset);
    }
    highest
        .into_iter()
        .map(|(partition, offset)| (partition, offset + 1))
        .collect()
}

/// Only called once the batch has been written to the store.
pub fn commit_batch<M: MessageSource>(
    source: &mut M,
    batch: &BatchAccumulator,
) -> Result<Vec<(i32, i64)>, BrokerError> {
    let offsets = batch_offsets(batch);
    source.commit(&offsets)?;
    Ok(offsets)
}

pub fn commit_skipped<M: MessageSource>(
    source: &mut M,
    partition: i32,
    offset: i64,
) -> Result<(), BrokerError> {
    source.commit(&[(partition, offset + 1)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::Record;
    use crate::test_support::ScriptedBroker;
    use serde_json::json;

    fn record(partition: i32, offset: i64) -> Record {
        Record {
            partition,
            offset,
            device_id: "A".to_string(),
            value: json!({ "device_id": "A" }),
            timestamp: 0.0,
            timestamp_text: "0".to_string(),
        }
    }

    #[test]
    fn highest_offset_per_partition_plus_one() {
        let mut batch = BatchAccumulator::new();
        batch.add(record(0, 7));
        batch.add(record(0, 9));
        batch.add(record(0, 8));
        batch.add(record(2, 100));
        batch.defer_skip(2, 103);
        assert_eq!(batch_offsets(&batch), vec![(0, 10), (2, 104)]);
    }

    #[test]
    fn commits_through_the_source() {
        let mut broker = ScriptedBroker::default();
        let mut batch = BatchAccumulator::new();
        batch.add(record(1, 4));

        let offsets = commit_batch(&mut broker, &batch).unwrap();
        assert_eq!(offsets, vec![(1, 5)]);
        commit_skipped(&mut broker, 3, 11).unwrap();

        let committed = broker.committed();
        assert_eq!(committed.get(&1), Some(&5));
        assert_eq!(committed.get(&3), Some(&12));
    }
}
