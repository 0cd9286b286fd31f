use crate::telemetry::Record;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Records waiting for the next flush, grouped by partition in delivery order.
#[derive(Debug)]
pub struct BatchAccumulator {
    partitions: BTreeMap<i32, Vec<Record>>,
    deferred_skips: BTreeMap<i32, i64>,
    pending: usize,
    last_flush: Instant,
}

impl BatchAccumulator {
    pub fn new() -> Self {
        Self {
            partitions: BTreeMap::new(),
            deferred_skips: BTreeMap::new(),
            pending: 0,
            last_flush: Instant::now(),
        }
    }

    pub fn add(&mut self, record: Record) {
        self.partitions
            .entry(record.partition)
            .or_default()
            .push(record);
        self.pending += 1;
    }

    pub fn pending_count(&self) -> usize {
        self.pending
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.pending == 0
    }

    pub fn has_pending(&self, partition: i32) -> bool {
        self.partitions
            .get(&partition)
            .is_some_and(|records| !records.is_empty())
    }

    pub fn elapsed_since_flush(&self) -> Duration {
        self.last_flush.elapsed()
    }

    /// Remembers a malformed offset that sits behind unwritten records of the same
    /// partition; it is committed together with the batch.
    pub fn defer_skip(&mut self, partition: i32, offset: i64) {
        self.deferred_skips
            .entry(partition)
            .and_modify(|current| *current = (*current).max(offset))
            .or_insert(offset);
    }

    /// Deferred skips whose partitions hold no unwritten records and can be committed alone.
    pub fn ready_skips(&self) -> Vec<(i32, i64)> {
        self.deferred_skips()
            .filter(|(partition, _)| !self.has_pending(*partition))
            .collect()
    }

    pub fn forget_skip(&mut self, partition: i32) {
        self.deferred_skips.remove(&partition);
    }

    pub fn partitions(&self) -> impl Iterator<Item = (i32, &[Record])> + '_ {
        self.partitions
            .iter()
            .map(|(partition, records)| (*partition, records.as_slice()))
    }

    pub fn records(&self) -> impl Iterator<Item = &Record> + '_ {
        self.partitions.values().flatten()
    }

    pub fn deferred_skips(&self) -> impl Iterator<Item = (i32, i64)> + '_ {
        self.deferred_skips
            .iter()
            .map(|(partition, offset)| (*partition, *offset))
    }

    /// Drops everything; only called once the batch is written and committed.
    pub fn clear(&mut self) {
        self.partitions.clear();
        self.deferred_skips.clear();
        self.pending = 0;
        self.last_flush = Instant::now();
    }
}

impl Default for BatchAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FlushTrigger {
    pub batch_size: usize,
    pub flush_interval: Duration,
}

impl FlushTrigger {
    pub fn new(batch_size: usize, flush_interval: Duration) -> Self {
        Self {
            batch_size: batch_size.max(1),
            flush_interval,
        }
    }

    pub fn should_flush(&self, pending: usize, elapsed: Duration) -> bool {
        if pending >= self.batch_size {
            return true;
        }
        pending > 0 && elapsed >= self.flush_interval
    }

    pub fn check(&self, batch: &BatchAccumulator) -> bool {
        self.should_flush(batch.pending_count(), batch.elapsed_since_flush())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(partition: i32, offset: i64) -> Record {
        Record {
            partition,
            offset,
            device_id: "dev".to_string(),
            value: json!({ "device_id": "dev", "offset": offset }),
            timestamp: offset as f64,
            timestamp_text: offset.to_string(),
        }
    }

    #[test]
    fn size_boundary() {
        let trigger = FlushTrigger::new(10, Duration::from_secs(5));
        assert!(!trigger.should_flush(9, Duration::from_secs(1)));
        assert!(trigger.should_flush(10, Duration::ZERO));
        assert!(trigger.should_flush(11, Duration::ZERO));
    }

    #[test]
    fn interval_needs_pending_records() {
        let trigger = FlushTrigger::new(10, Duration::from_secs(5));
        assert!(!trigger.should_flush(0, Duration::from_secs(60)));
        assert!(!trigger.should_flush(1, Duration::from_millis(4_999)));
        assert!(trigger.should_flush(1, Duration::from_secs(5)));
    }

    #[test]
    fn groups_by_partition_in_delivery_order() {
        let mut batch = BatchAccumulator::new();
        batch.add(record(1, 10));
        batch.add(record(0, 3));
        batch.add(record(1, 11));
        batch.add(record(1, 11));
        assert_eq!(batch.pending_count(), 4);
        assert!(batch.has_pending(1));
        assert!(!batch.has_pending(2));

        let offsets: Vec<(i32, Vec<i64>)> = batch
            .partitions()
            .map(|(p, records)| (p, records.iter().map(|r| r.offset).collect()))
            .collect();
        assert_eq!(offsets, vec![(0, vec![3]), (1, vec![10, 11, 11])]);
    }

    #[test]
    fn clear_resets_batch_and_skips() {
        let mut batch = BatchAccumulator::new();
        batch.add(record(0, 1));
        batch.defer_skip(0, 4);
        batch.defer_skip(0, 2);
        assert_eq!(batch.deferred_skips().collect::<Vec<_>>(), vec![(0, 4)]);
        batch.clear();
        assert!(batch.is_empty());
        assert_eq!(batch.deferred_skips().count(), 0);
        assert!(batch.elapsed_since_flush() < Duration::from_secs(1));
    }

    #[test]
    fn skips_behind_pending_records_are_not_ready() {
        let mut batch = BatchAccumulator::new();
        batch.add(record(0, 1));
        batch.defer_skip(0, 2);
        batch.defer_skip(1, 7);
        assert_eq!(batch.ready_skips(), vec![(1, 7)]);

        batch.forget_skip(1);
        assert!(batch.ready_skips().is_empty());
        assert_eq!(batch.deferred_skips().collect::<Vec<_>>(), vec![(0, 2)]);
    }
}
