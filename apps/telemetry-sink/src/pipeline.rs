use crate::batch::{BatchAccumulator, FlushTrigger};
use crate::broker::MessageSource;
use crate::committer;
use crate::sink::{FlushOutcome, RetryReason, SinkWriter};
use crate::store::TelemetryStore;
use crate::supervisor::{Connector, Supervised};
use crate::telemetry::Polled;
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex,
};
use std::time::{Duration, Instant};


#[derive(Debug)]
pub struct IngestStats {
    pub pending_records: AtomicU64,
    pub last_flush_unix_ms: AtomicU64,
    pub last_batch_len: AtomicU64,
    pub average_flush_micros: AtomicU64,
    pub flushes_total: AtomicU64,
    pub flush_failures: AtomicU64,
    pub commit_failures: AtomicU64,
    pub malformed_total: AtomicU64,
    pub broker_connected: AtomicBool,
    pub store_connected: AtomicBool,
    pub last_error: Mutex<Option<String>>,
}

impl IngestStats {
    pub fn new() -> Self {
        Self {
            pending_records: AtomicU64::new(0),
            last_flush_unix_ms: AtomicU64::new(0),
            last_batch_len: AtomicU64::new(0),
            average_flush_micros: AtomicU64::new(0),
            flushes_total: AtomicU64::new(0),
            flush_failures: AtomicU64::new(0),
            commit_failures: AtomicU64::new(0),
            malformed_total: AtomicU64::new(0),
            broker_connected: AtomicBool::new(false),
            store_connected: AtomicBool::new(false),
            last_error: Mutex::new(None),
        }
    }

    pub fn set_broker_connected(&self, connected: bool) {
        self.broker_connected.store(connected, Ordering::Relaxed);
    }

    pub fn set_store_connected(&self, connected: bool) {
        self.store_connected.store(connected, Ordering::Relaxed);
    }

    pub fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn clear_error(&self) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = None;
        }
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|guard| guard.clone())
    }

    fn record_flush(&self, len: usize, started: Instant) {
        self.flushes_total.fetch_add(1, Ordering::Relaxed);
        self.last_batch_len.store(len as u64, Ordering::Relaxed);
        let now = Utc::now().timestamp_millis() as u64;
        self.last_flush_unix_ms.store(now, Ordering::Relaxed);
        let micros = started.elapsed().as_micros() as u64;
        let prev = self.average_flush_micros.load(Ordering::Relaxed);
        let avg = if prev == 0 {
            micros
        } else {
            (prev + micros) / 2
        };
        self.average_flush_micros.store(avg, Ordering::Relaxed);
    }

    pub fn log_snapshot(&self) {
        tracing::info!(
            pending = self.pending_records.load(Ordering::Relaxed),
            flushes = self.flushes_total.load(Ordering::Relaxed),
            last_batch_len = self.last_batch_len.load(Ordering::Relaxed),
            last_flush_unix_ms = self.last_flush_unix_ms.load(Ordering::Relaxed),
            average_flush_micros = self.average_flush_micros.load(Ordering::Relaxed),
            flush_failures = self.flush_failures.load(Ordering::Relaxed),
            commit_failures = self.commit_failures.load(Ordering::Relaxed),
            malformed = self.malformed_total.load(Ordering::Relaxed),
            broker_connected = self.broker_connected.load(Ordering::Relaxed),
            store_connected = self.store_connected.load(Ordering::Relaxed),
            last_error = self.last_error().as_deref().unwrap_or(""),
            "sink status"
        );
    }
}

impl Default for IngestStats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Accumulating,
    Flushing,
    Committing,
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    pub trigger: FlushTrigger,
    pub poll_timeout: Duration,
    pub loop_error_delay: Duration,
}

/// The single poll → accumulate → flush → commit loop. Owns both connections and the batch.
pub struct Pipeline<B: Connector, S: Connector> {
    broker: Supervised<B>,
    store: Supervised<S>,
    batch: BatchAccumulator,
    writer: SinkWriter,
    settings: PipelineSettings,
    state: PipelineState,
    stats: Arc<IngestStats>,
    clock: fn() -> DateTime<Utc>,
}

impl<B, S> Pipeline<B, S>
where
    B: Connector,
    B::Handle: MessageSource,
    S: Connector,
    S::Handle: TelemetryStore,
{
    pub fn new(
        broker: Supervised<B>,
        store: Supervised<S>,
        writer: SinkWriter,
        settings: PipelineSettings,
        stats: Arc<IngestStats>,
    ) -> Self {
        Self {
            broker,
            store,
            batch: BatchAccumulator::new(),
            writer,
            settings,
            state: PipelineState::Accumulating,
            stats,
            clock: Utc::now,
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: fn() -> DateTime<Utc>) -> Self {
        self.clock = clock;
        self
    }

    #[cfg(test)]
    pub fn batch(&self) -> &BatchAccumulator {
        &self.batch
    }

    #[cfg(test)]
    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Blocks until both connections are live.
    pub async fn connect(&mut self) {
        self.store.acquire().await;
        self.stats.set_store_connected(true);
        self.broker.acquire().await;
        self.stats.set_broker_connected(true);
    }

    /// Runs until the process is stopped. Errors never end the loop.
    pub async fn run(&mut self) {
        loop {
            if let Err(err) = self.step().await {
                self.stats.record_error(err.to_string());
                tracing::error!(
                    error=%err,
                    retry_in_ms = self.settings.loop_error_delay.as_millis() as u64,
                    "unexpected error in sink loop; continuing"
                );
                tokio::time::sleep(self.settings.loop_error_delay).await;
            }
        }
    }

    /// One iteration: a bounded poll followed by a flush check.
    pub async fn step(&mut self) -> Result<()> {
        self.retry_deferred_skips().await;
        self.poll_once().await?;
        if self.settings.trigger.check(&self.batch) {
            self.flush_pending().await;
        }
        Ok(())
    }

    async fn poll_once(&mut self) -> Result<()> {
        let source = self.broker.acquire().await;
        self.stats.set_broker_connected(true);

        let result = source
            .poll(self.settings.poll_timeout, self.settings.trigger.batch_size)
            .await;
        let polled = match result {
            Ok(polled) => polled,
            Err(err) => {
                if err.is_connection() {
                    self.broker.invalidate();
                    self.stats.set_broker_connected(false);
                }
                return Err(err.into());
            }
        };

        for item in polled {
            match item {
                Polled::Record(record) => self.batch.add(record),
                Polled::Malformed { partition, offset } => {
                    self.skip_malformed(partition, offset).await
                }
            }
        }
        self.stats
            .pending_records
            .store(self.batch.pending_count() as u64, Ordering::Relaxed);
        Ok(())
    }

    async fn skip_malformed(&mut self, partition: i32, offset: i64) {
        self.stats.malformed_total.fetch_add(1, Ordering::Relaxed);

        // Committing past records that are still unwritten would lose them on restart.
        if self.batch.has_pending(partition) {
            tracing::debug!(partition, offset, "deferring malformed offset until next flush");
            self.batch.defer_skip(partition, offset);
            return;
        }

        let source = self.broker.acquire().await;
        if let Err(err) = committer::commit_skipped(source, partition, offset) {
            tracing::warn!(partition, offset, error=%err, "failed to commit malformed offset; deferring");
            if err.is_connection() {
                self.broker.invalidate();
                self.stats.set_broker_connected(false);
            }
            self.batch.defer_skip(partition, offset);
        }
    }

    /// Commits malformed offsets whose earlier commit failed and that no flush will carry.
    async fn retry_deferred_skips(&mut self) {
        let ready = self.batch.ready_skips();
        if ready.is_empty() {
            return;
        }

        let source = self.broker.acquire().await;
        for (partition, offset) in ready {
            match committer::commit_skipped(source, partition, offset) {
                Ok(()) => {
                    tracing::debug!(partition, offset, "committed deferred malformed offset");
                    self.batch.forget_skip(partition);
                }
                Err(err) => {
                    tracing::warn!(partition, offset, error=%err, "deferred malformed offset still uncommitted");
                    if err.is_connection() {
                        self.broker.invalidate();
                        self.stats.set_broker_connected(false);
                    }
                    break;
                }
            }
        }
    }

    async fn flush_pending(&mut self) {
        self.transition(PipelineState::Flushing);
        let started = Instant::now();
        let now = (self.clock)();

        let store = self.store.acquire().await;
        self.stats.set_store_connected(true);

        let outcome = self.writer.flush(store, &self.batch, now).await;
        match outcome {
            FlushOutcome::Written(len) => {
                self.transition(PipelineState::Committing);
                self.commit_written(len, started).await;
            }
            FlushOutcome::Retry(reason) => {
                self.stats.flush_failures.fetch_add(1, Ordering::Relaxed);
                self.stats.record_error(format!("flush failed: {reason:?}"));
                if reason == RetryReason::Connection {
                    self.store.invalidate();
                    self.stats.set_store_connected(false);
                    self.store.acquire().await;
                    self.stats.set_store_connected(true);
                }
            }
        }

        self.transition(PipelineState::Accumulating);
    }

    async fn commit_written(&mut self, len: usize, started: Instant) {
        let source = self.broker.acquire().await;
        match committer::commit_batch(source, &self.batch) {
            Ok(offsets) => {
                tracing::info!(records = len, partitions = offsets.len(), "offsets committed");
                self.batch.clear();
                self.stats.record_flush(len, started);
                self.stats.pending_records.store(0, Ordering::Relaxed);
                self.stats.clear_error();
            }
            Err(err) => {
                self.stats.commit_failures.fetch_add(1, Ordering::Relaxed);
                self.stats.record_error(err.to_string());
                tracing::error!(error=%err, records = len, "failed to commit offsets; batch will be rewritten");
                if err.is_connection() {
                    self.broker.invalidate();
                    self.stats.set_broker_connected(false);
                }
            }
        }
    }

    fn transition(&mut self, next: PipelineState) {
        tracing::trace!(from = ?self.state, to = ?next, "pipeline state");
        self.state = next;
    }
}
